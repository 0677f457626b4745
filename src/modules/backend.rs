//! Module Backend
//!
//! Where module and KPM data comes from. The default backend asks the
//! daemon binary through a privileged session.

use async_trait::async_trait;
use log::debug;
use std::sync::Arc;

use crate::error::{BridgeError, BridgeResult};
use crate::exec::SyncExecutor;

/// Source of module listings and KPM control
#[async_trait]
pub trait ModuleBackend: Send + Sync {
    /// Raw module listing, a JSON array of objects
    async fn list_modules(&self) -> BridgeResult<String>;

    /// Raw KPM listing, either a JSON array or one name per line
    async fn list_kpm(&self) -> BridgeResult<String>;

    /// Send `args` to the KPM called `name`; returns the control result code
    async fn control_kpm(&self, name: &str, args: &str) -> BridgeResult<i32>;
}

/// Backend that runs `ksud` as root
pub struct KsudBackend {
    ksud: String,
    executor: Arc<SyncExecutor>,
}

impl KsudBackend {
    /// `ksud` is the invocation prefix, usually the daemon's absolute path
    pub fn new(ksud: impl Into<String>, executor: Arc<SyncExecutor>) -> Self {
        Self {
            ksud: ksud.into(),
            executor,
        }
    }

    async fn query(&self, subcommand: &str) -> BridgeResult<String> {
        let line = format!("{} {}", self.ksud, subcommand);
        let result = self.executor.execute(&line).await?;
        if !result.success() {
            return Err(BridgeError::ModuleQuery(format!(
                "`{}` exited with {}: {}",
                subcommand, result.exit_code, result.stderr
            )));
        }
        Ok(result.stdout)
    }
}

#[async_trait]
impl ModuleBackend for KsudBackend {
    async fn list_modules(&self) -> BridgeResult<String> {
        self.query("module list").await
    }

    async fn list_kpm(&self) -> BridgeResult<String> {
        self.query("kpm list").await
    }

    async fn control_kpm(&self, name: &str, args: &str) -> BridgeResult<i32> {
        let line = format!("{} kpm control {} {}", self.ksud, name, args);
        let result = self.executor.execute(&line).await?;
        debug!("KPM {} control returned {}", name, result.exit_code);
        Ok(result.exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShellConfig;
    use crate::session::{SessionManager, ShellSessionFactory};

    const FAKE_KSUD: &str = r#"
case "$1 $2" in
  "module list") echo '[{"id":"alpha","name":"Alpha"}]' ;;
  "kpm list") printf 'kpm_a\nkpm_b\n' ;;
  "kpm control") echo "$3:$4" >&2; exit 4 ;;
  *) echo "unknown command" >&2; exit 1 ;;
esac
"#;

    fn backend(dir: &tempfile::TempDir) -> KsudBackend {
        let script = dir.path().join("ksud");
        std::fs::write(&script, FAKE_KSUD).unwrap();
        let sessions = Arc::new(SessionManager::new(Arc::new(ShellSessionFactory::new(
            ShellConfig::unprivileged(),
        ))));
        KsudBackend::new(
            format!("sh {}", script.display()),
            Arc::new(SyncExecutor::new(sessions)),
        )
    }

    #[tokio::test]
    async fn test_list_modules_returns_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let raw = backend(&dir).list_modules().await.unwrap();
        assert_eq!(raw, r#"[{"id":"alpha","name":"Alpha"}]"#);
    }

    #[tokio::test]
    async fn test_list_kpm_lines() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(backend(&dir).list_kpm().await.unwrap(), "kpm_a\nkpm_b");
    }

    #[tokio::test]
    async fn test_control_kpm_passes_exit_code_through() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(backend(&dir).control_kpm("kpm_a", "on").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_failed_query_is_module_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = backend(&dir).query("bogus").await.unwrap_err();
        assert!(matches!(err, BridgeError::ModuleQuery(msg) if msg.contains("unknown command")));
    }
}
