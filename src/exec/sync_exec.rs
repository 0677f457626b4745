//! Synchronous Executor
//!
//! Runs a command to completion and hands back everything it printed. A
//! non-zero exit status is part of the result, not an error.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{BridgeError, BridgeResult};
use crate::session::{collect_lines, JobSinks, PrivilegedSession, SessionManager, SessionStatus};

/// Outcome of a completed command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub exit_code: i32,
    /// Output lines joined by `\n`
    pub stdout: String,
    /// Error lines joined by `\n`
    pub stderr: String,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run one command line inside `session` and collect its output
pub async fn run_sync(
    session: &PrivilegedSession,
    command_line: &str,
) -> BridgeResult<ExecutionResult> {
    let (sinks, output) = JobSinks::channel();
    let (exit_code, stdout, stderr) = tokio::join!(
        session.run_job(command_line, sinks),
        collect_lines(output.stdout),
        collect_lines(output.stderr),
    );

    Ok(ExecutionResult {
        exit_code: exit_code?,
        stdout: stdout.join("\n"),
        stderr: stderr.join("\n"),
    })
}

/// Executes commands in sessions borrowed from the session manager
pub struct SyncExecutor {
    sessions: Arc<SessionManager>,
    timeout: Option<Duration>,
}

impl SyncExecutor {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            timeout: None,
        }
    }

    /// Kill the session and fail with `Timeout` when a command runs longer
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run a command line to completion
    pub async fn execute(&self, command_line: &str) -> BridgeResult<ExecutionResult> {
        let session = self.sessions.acquire().await?;
        let session_id = session.id().to_string();
        self.sessions.set_status(&session_id, SessionStatus::Busy);

        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run_sync(&session, command_line))
                .await
                .map_err(|_| limit),
            None => Ok(run_sync(&session, command_line).await),
        };

        match outcome {
            Ok(result) => {
                self.sessions.set_status(&session_id, SessionStatus::Idle);
                self.sessions.release(session).await;
                if let Ok(result) = &result {
                    debug!("Command exited with {}: {}", result.exit_code, command_line);
                }
                result
            }
            Err(limit) => {
                warn!("Command timed out after {:?}: {}", limit, command_line);
                self.sessions.abort_job(session).await;
                Err(BridgeError::Timeout(limit))
            }
        }
    }
}
