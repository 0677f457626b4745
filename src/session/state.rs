//! Session State
//!
//! Bookkeeping for open privileged sessions, used for diagnostics and
//! shutdown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a privileged session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Open with no job running
    Idle,
    /// A job is running
    Busy,
    /// Parked in the pool for the next synchronous call
    Pooled,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
            Self::Pooled => write!(f, "pooled"),
        }
    }
}

/// What a session was opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPurpose {
    /// Synchronous exec, may be reused
    Sync,
    /// Dedicated to one streaming job
    Stream,
}

/// Serializable snapshot of a live session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub pid: u32,
    pub purpose: SessionPurpose,
    pub status: SessionStatus,
    pub opened_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub jobs_run: u64,
}

impl SessionInfo {
    pub fn new(id: impl Into<String>, pid: u32, purpose: SessionPurpose) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            pid,
            purpose,
            status: SessionStatus::Idle,
            opened_at: now,
            last_activity: now,
            jobs_run: 0,
        }
    }

    /// Update status, counting every transition into `Busy` as a job
    pub fn set_status(&mut self, status: SessionStatus) {
        if status == SessionStatus::Busy {
            self.jobs_run += 1;
        }
        self.status = status;
        self.last_activity = Utc::now();
    }

    /// Seconds since the session was opened
    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.opened_at).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_count_jobs() {
        let mut info = SessionInfo::new("s-1", 42, SessionPurpose::Sync);
        assert_eq!(info.status, SessionStatus::Idle);
        assert_eq!(info.jobs_run, 0);

        info.set_status(SessionStatus::Busy);
        info.set_status(SessionStatus::Pooled);
        info.set_status(SessionStatus::Busy);

        assert_eq!(info.jobs_run, 2);
        assert_eq!(info.status, SessionStatus::Busy);
        assert!(info.age_secs() >= 0);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&SessionStatus::Pooled).unwrap();
        assert_eq!(json, "\"pooled\"");
        assert_eq!(SessionPurpose::Stream, serde_json::from_str("\"stream\"").unwrap());
    }
}
