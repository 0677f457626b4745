//! Job Registry
//!
//! Concurrent registry of streaming jobs with DashMap. Tracks each job from
//! spawn to its outcome and holds the cancel switch of the running ones.

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    /// Finished with exit status 0
    Completed,
    /// Finished with a non-zero exit status
    Failed,
    /// The session died under the job
    Lost,
    Cancelled,
}

/// How a streaming job ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum JobOutcome {
    Exited(i32),
    Lost,
    Cancelled,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Exited(0) => JobStatus::Completed,
            Self::Exited(_) => JobStatus::Failed,
            Self::Lost => JobStatus::Lost,
            Self::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// Serializable job snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    /// Callback token the job reports to
    pub token: String,
    pub command: String,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

impl JobInfo {
    fn new(token: &str, command: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            token: token.to_string(),
            command: command.to_string(),
            status: JobStatus::Running,
            exit_code: None,
            started_at: Utc::now().to_rfc3339(),
            finished_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == JobStatus::Running
    }
}

/// Registry of streaming jobs
pub struct JobRegistry {
    /// job_id -> JobInfo
    jobs: DashMap<String, JobInfo>,
    /// job_id -> cancel switch, present while the job runs
    cancels: DashMap<String, oneshot::Sender<()>>,
    max_history: usize,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::with_history(100)
    }

    /// Keep at most `max_history` finished jobs around
    pub fn with_history(max_history: usize) -> Self {
        Self {
            jobs: DashMap::new(),
            cancels: DashMap::new(),
            max_history,
        }
    }

    /// Register a running job and its cancel switch
    pub fn register(&self, token: &str, command: &str, cancel: oneshot::Sender<()>) -> JobInfo {
        let info = JobInfo::new(token, command);
        self.jobs.insert(info.id.clone(), info.clone());
        self.cancels.insert(info.id.clone(), cancel);
        debug!("Registered job {} for {}", info.id, token);
        info
    }

    /// Record a job's outcome
    pub fn finish(&self, job_id: &str, outcome: JobOutcome) {
        self.cancels.remove(job_id);
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            // A cancelled job keeps its status even if it raced to completion.
            if job.status == JobStatus::Running {
                job.status = outcome.status();
            }
            if let JobOutcome::Exited(code) = outcome {
                job.exit_code = Some(code);
            }
            job.finished_at = Some(Utc::now().to_rfc3339());
        }
        self.cleanup_history();
    }

    /// Cancel every running job reporting to `token`. Returns how many were
    /// signalled.
    pub fn cancel_token(&self, token: &str) -> usize {
        let ids: Vec<String> = self
            .jobs
            .iter()
            .filter(|j| j.is_active() && j.token == token)
            .map(|j| j.id.clone())
            .collect();

        ids.iter().filter(|id| self.cancel_job(id)).count()
    }

    /// Cancel one job by id
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let Some((_, cancel)) = self.cancels.remove(job_id) else {
            return false;
        };
        let _ = cancel.send(());

        if let Some(mut job) = self.jobs.get_mut(job_id) {
            job.status = JobStatus::Cancelled;
            job.finished_at = Some(Utc::now().to_rfc3339());
        }
        info!("Cancelled job {}", job_id);
        true
    }

    /// Cancel all running jobs
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.cancels.iter().map(|c| c.key().clone()).collect();
        ids.iter().filter(|id| self.cancel_job(id)).count()
    }

    pub fn get(&self, job_id: &str) -> Option<JobInfo> {
        self.jobs.get(job_id).map(|j| j.clone())
    }

    pub fn list(&self) -> Vec<JobInfo> {
        self.jobs.iter().map(|j| j.value().clone()).collect()
    }

    pub fn list_active(&self) -> Vec<JobInfo> {
        self.jobs
            .iter()
            .filter(|j| j.is_active())
            .map(|j| j.value().clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.jobs.iter().filter(|j| j.is_active()).count()
    }

    /// Drop the oldest finished jobs beyond the history limit
    pub fn cleanup_history(&self) {
        let mut finished: Vec<(String, String)> = self
            .jobs
            .iter()
            .filter(|j| !j.is_active())
            .map(|j| (j.id.clone(), j.finished_at.clone().unwrap_or_default()))
            .collect();

        finished.sort_by(|a, b| a.1.cmp(&b.1));

        let excess = finished.len().saturating_sub(self.max_history);
        for (job_id, _) in finished.into_iter().take(excess) {
            self.jobs.remove(&job_id);
        }
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
