//! Session Manager
//!
//! Owns the session factory, the pool slot for synchronous calls and a
//! registry of every live session. Streaming jobs always get a dedicated
//! session; synchronous jobs reuse the pooled one when reuse is enabled.

use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::factory::SessionFactory;
use super::shell::{terminate_group_script, JobSinks, PrivilegedSession};
use super::state::{SessionInfo, SessionPurpose, SessionStatus};
use crate::error::BridgeResult;

/// How long an interrupted job may take to report its process group
const JOB_GROUP_WAIT: Duration = Duration::from_millis(500);

/// Privileged session manager
pub struct SessionManager {
    factory: Arc<dyn SessionFactory>,
    /// Live sessions (session_id -> SessionInfo)
    sessions: Arc<DashMap<String, SessionInfo>>,
    /// Idle session kept for the next synchronous call
    pooled: Mutex<Option<PrivilegedSession>>,
    reuse_sync_sessions: bool,
}

impl SessionManager {
    /// Create a manager that opens a fresh session for every call
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self::with_reuse(factory, false)
    }

    /// Create a manager, optionally pooling one session for synchronous calls
    pub fn with_reuse(factory: Arc<dyn SessionFactory>, reuse_sync_sessions: bool) -> Self {
        Self {
            factory,
            sessions: Arc::new(DashMap::new()),
            pooled: Mutex::new(None),
            reuse_sync_sessions,
        }
    }

    /// Open a session that is never shared
    pub async fn open_isolated(&self, purpose: SessionPurpose) -> BridgeResult<PrivilegedSession> {
        let session = self.factory.open().await?;
        self.sessions.insert(
            session.id().to_string(),
            SessionInfo::new(session.id(), session.pid(), purpose),
        );
        Ok(session)
    }

    /// Get a session for a synchronous job, reusing the pooled one if possible
    pub async fn acquire(&self) -> BridgeResult<PrivilegedSession> {
        if self.reuse_sync_sessions {
            let pooled = self.pooled.lock().take();
            match pooled {
                Some(session) if session.is_alive() => {
                    debug!("Reusing pooled session {}", session.id());
                    self.set_status(session.id(), SessionStatus::Idle);
                    return Ok(session);
                }
                Some(session) => {
                    debug!("Discarding dead pooled session {}", session.id());
                    self.close_quietly(session).await;
                }
                None => {}
            }
        }

        self.open_isolated(SessionPurpose::Sync).await
    }

    /// Hand a synchronous session back once its job has finished
    pub async fn release(&self, session: PrivilegedSession) {
        if self.reuse_sync_sessions && session.is_alive() {
            let displaced = {
                let mut slot = self.pooled.lock();
                if slot.is_none() {
                    self.set_status(session.id(), SessionStatus::Pooled);
                    *slot = Some(session);
                    None
                } else {
                    Some(session)
                }
            };

            if let Some(session) = displaced {
                self.close_quietly(session).await;
            }
            return;
        }

        self.close_quietly(session).await;
    }

    /// Close a session, logging instead of surfacing close failures
    pub async fn close_quietly(&self, session: PrivilegedSession) {
        let id = session.id().to_string();
        self.sessions.remove(&id);
        if let Err(e) = session.close().await {
            warn!("Ignoring close failure: {}", e);
        }
    }

    /// Kill a session, logging failures
    pub async fn kill_quietly(&self, session: PrivilegedSession) {
        let id = session.id().to_string();
        self.sessions.remove(&id);
        if let Err(e) = session.kill().await {
            warn!("Ignoring kill failure: {}", e);
        }
    }

    /// Stop the job running in `session`, then kill the session.
    ///
    /// Killing the shell alone orphans the job, so its process group is
    /// signalled first. The signals come from a fresh session because the
    /// busy shell takes no input until the job ends.
    pub async fn abort_job(&self, session: PrivilegedSession) {
        match session.job_group(JOB_GROUP_WAIT).await {
            Some(group) => self.terminate_group(group).await,
            None => debug!("Session {} has no job group to signal", session.id()),
        }
        self.kill_quietly(session).await;
    }

    async fn terminate_group(&self, group: u32) {
        let signaller = match self.factory.open().await {
            Ok(session) => session,
            Err(e) => {
                warn!("Cannot signal job group {}: {}", group, e);
                return;
            }
        };

        let (sinks, _output) = JobSinks::channel();
        match signaller.run_job(&terminate_group_script(group), sinks).await {
            Ok(_) => debug!("Terminated job group {}", group),
            Err(e) => warn!("Failed to signal job group {}: {}", group, e),
        }
        if let Err(e) = signaller.close().await {
            debug!("Ignoring close failure of signalling session: {}", e);
        }
    }

    /// Record a status change for a live session
    pub fn set_status(&self, session_id: &str, status: SessionStatus) {
        if let Some(mut info) = self.sessions.get_mut(session_id) {
            info.set_status(status);
        }
    }

    /// Snapshot of all live sessions
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    /// Count live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Description of the underlying factory
    pub fn describe_factory(&self) -> String {
        self.factory.describe()
    }

    /// Close the pooled session. Sessions owned by running jobs are closed
    /// by those jobs.
    pub async fn shutdown(&self) {
        let pooled = self.pooled.lock().take();
        if let Some(session) = pooled {
            self.close_quietly(session).await;
        }
        info!("Session manager shut down ({} sessions still owned by jobs)", self.sessions.len());
    }
}
