//! Session Factory
//!
//! Abstraction over how privileged shells come into existence. The root
//! escalation itself is opaque: a factory either hands back a working session
//! or fails with `SessionUnavailable`.

use async_trait::async_trait;
use log::{debug, warn};
use std::time::Duration;

use super::shell::{collect_lines, JobSinks, PrivilegedSession};
use crate::config::ShellConfig;
use crate::error::{BridgeError, BridgeResult};

/// Opens privileged sessions
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open a fresh session
    async fn open(&self) -> BridgeResult<PrivilegedSession>;

    /// Human readable description for logs
    fn describe(&self) -> String;
}

/// Factory launching the configured su binary
pub struct ShellSessionFactory {
    config: ShellConfig,
}

impl ShellSessionFactory {
    pub fn new(config: ShellConfig) -> Self {
        Self { config }
    }

    async fn verify_root(&self, session: &PrivilegedSession) -> BridgeResult<()> {
        let (sinks, output) = JobSinks::channel();
        let code = session.run_job("id -u", sinks).await.map_err(|e| {
            BridgeError::SessionUnavailable(format!("root probe failed: {}", e))
        })?;
        let stdout = collect_lines(output.stdout).await;

        let uid = stdout.first().map(|s| s.trim()).unwrap_or("");
        if code != 0 || uid != "0" {
            return Err(BridgeError::SessionUnavailable(format!(
                "{} did not grant root (uid {:?}, exit {})",
                self.config.program, uid, code
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionFactory for ShellSessionFactory {
    async fn open(&self) -> BridgeResult<PrivilegedSession> {
        let args = self.config.command_args();
        let session = PrivilegedSession::open(
            &self.config.program,
            &args,
            Duration::from_millis(self.config.close_timeout_ms),
        )
        .await?;

        if self.config.verify_root {
            if let Err(e) = self.verify_root(&session).await {
                warn!("Rejecting session {}: {}", session.id(), e);
                if let Err(close_err) = session.kill().await {
                    debug!("Ignoring close failure after rejected probe: {}", close_err);
                }
                return Err(e);
            }
        }

        Ok(session)
    }

    fn describe(&self) -> String {
        let args = self.config.command_args();
        if args.is_empty() {
            self.config.program.clone()
        } else {
            format!("{} {}", self.config.program, args.join(" "))
        }
    }
}
