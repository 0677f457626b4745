//! Bridge Interface
//!
//! The object a module WebUI talks to. One bridge serves one module page and
//! reports asynchronous results through that page's dispatcher.

use log::{debug, info};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::BridgeConfig;
use crate::dispatch::ResultDispatcher;
use crate::display::{DisplayState, HostUi, LogHostUi};
use crate::error::BridgeResult;
use crate::exec::{
    build_command, CommandOptions, ExecutionResult, JobRegistry, SpawnedJob, StreamExecutor,
    SyncExecutor,
};
use crate::modules::{KsudBackend, ModuleBackend, ModuleControl};
use crate::session::{SessionManager, ShellSessionFactory};

/// Script-callable surface for one module WebUI
pub struct KsuBridge {
    sessions: Arc<SessionManager>,
    executor: Arc<SyncExecutor>,
    streams: StreamExecutor,
    dispatcher: ResultDispatcher,
    modules: ModuleControl,
    display: DisplayState,
    host: Arc<dyn HostUi>,
}

impl KsuBridge {
    /// Build a bridge for the module in `module_dir`, delivering events
    /// through `dispatcher`
    pub fn new(
        config: &BridgeConfig,
        module_dir: impl Into<PathBuf>,
        dispatcher: ResultDispatcher,
    ) -> Self {
        let factory = Arc::new(ShellSessionFactory::new(config.shell.clone()));
        let sessions = Arc::new(SessionManager::with_reuse(factory, config.exec.reuse_session));

        let mut executor = SyncExecutor::new(Arc::clone(&sessions));
        if config.exec.timeout_secs > 0 {
            executor = executor.with_timeout(Duration::from_secs(config.exec.timeout_secs));
        }
        let executor = Arc::new(executor);

        let backend = Arc::new(KsudBackend::new(
            config.modules.ksud.to_string_lossy(),
            Arc::clone(&executor),
        ));
        let module_dir = module_dir.into();
        info!(
            "Bridge for {} using {}",
            module_dir.display(),
            sessions.describe_factory()
        );

        Self {
            streams: StreamExecutor::new(Arc::clone(&sessions), dispatcher.clone()),
            modules: ModuleControl::new(backend, module_dir),
            sessions,
            executor,
            dispatcher,
            display: DisplayState::default(),
            host: Arc::new(LogHostUi),
        }
    }

    /// Share the host's display state instead of a private one
    pub fn with_display(mut self, display: DisplayState) -> Self {
        self.display = display;
        self
    }

    pub fn with_host_ui(mut self, host: Arc<dyn HostUi>) -> Self {
        self.host = host;
        self
    }

    /// Swap the module data source, keeping the module directory
    pub fn with_module_backend(mut self, backend: Arc<dyn ModuleBackend>) -> Self {
        let module_dir = self.modules.module_dir().to_path_buf();
        self.modules = ModuleControl::new(backend, module_dir);
        self
    }

    pub fn dispatcher(&self) -> &ResultDispatcher {
        &self.dispatcher
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        self.streams.jobs()
    }

    pub fn display(&self) -> &DisplayState {
        &self.display
    }

    /// Run `cmd` and return its stdout. Stderr and the exit status are
    /// dropped; use [`KsuBridge::exec_with_callback`] to see them.
    pub async fn exec(&self, cmd: &str) -> BridgeResult<String> {
        Ok(self.executor.execute(cmd).await?.stdout)
    }

    /// Run `cmd` with the options JSON applied and return the full result
    pub async fn exec_with_options(
        &self,
        cmd: &str,
        options_json: Option<&str>,
    ) -> BridgeResult<ExecutionResult> {
        let options = CommandOptions::from_json(options_json)?;
        let line = build_command(cmd, &[], &options);
        self.executor.execute(&line).await
    }

    /// Run `cmd` and call `callback(exitCode, stdout, stderr)` on the page
    pub async fn exec_with_callback(
        &self,
        cmd: &str,
        options_json: Option<&str>,
        callback: &str,
    ) -> BridgeResult<ExecutionResult> {
        let result = self.exec_with_options(cmd, options_json).await?;
        self.dispatcher.invoke_callback(
            callback,
            vec![
                Value::from(result.exit_code),
                Value::from(result.stdout.clone()),
                Value::from(result.stderr.clone()),
            ],
        );
        Ok(result)
    }

    /// Start a streaming job reporting to `token`
    pub async fn spawn(
        &self,
        command: &str,
        args_json: &str,
        options_json: Option<&str>,
        token: &str,
    ) -> BridgeResult<SpawnedJob> {
        self.streams.spawn_json(command, args_json, options_json, token).await
    }

    /// Cancel the jobs reporting to `token`; returns how many were running
    pub fn cancel(&self, token: &str) -> usize {
        self.streams.cancel(token)
    }

    pub fn toast(&self, message: &str) {
        self.host.toast(message);
    }

    pub fn full_screen(&self, enabled: bool) {
        self.host.set_full_screen(enabled);
    }

    pub fn is_secondary_page(&self) -> bool {
        self.display.is_secondary()
    }

    /// This module's info as a JSON object string
    pub async fn module_info(&self) -> String {
        Value::Object(self.modules.module_info().await).to_string()
    }

    /// All kernel patch modules as a JSON array string
    pub async fn list_all_kpm(&self) -> BridgeResult<String> {
        Ok(Value::Array(self.modules.list_all_kpm().await?).to_string())
    }

    pub async fn control_kpm(&self, name: &str, args: &str) -> BridgeResult<i32> {
        self.modules.control_kpm(name, args).await
    }

    /// Cancel running jobs and close the pooled session
    pub async fn shutdown(&self) {
        let cancelled = self.streams.shutdown();
        debug!("Cancelled {} jobs on shutdown", cancelled);
        self.sessions.shutdown().await;
        self.dispatcher.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShellConfig;
    use crate::dispatch::testing::RecordingSurface;
    use crate::dispatch::BridgeEvent;
    use crate::error::BridgeError;
    use crate::exec::JobOutcome;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    struct StaticBackend;

    #[async_trait]
    impl ModuleBackend for StaticBackend {
        async fn list_modules(&self) -> BridgeResult<String> {
            Ok(r#"[{"id":"demo","name":"Demo"}]"#.to_string())
        }

        async fn list_kpm(&self) -> BridgeResult<String> {
            Ok("kpm_one\n".to_string())
        }

        async fn control_kpm(&self, _name: &str, _args: &str) -> BridgeResult<i32> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        calls: Mutex<Vec<String>>,
    }

    impl HostUi for RecordingHost {
        fn toast(&self, message: &str) {
            self.calls.lock().push(format!("toast:{}", message));
        }

        fn set_full_screen(&self, enabled: bool) {
            self.calls.lock().push(format!("full_screen:{}", enabled));
        }
    }

    fn config() -> BridgeConfig {
        BridgeConfig {
            shell: ShellConfig::unprivileged(),
            ..Default::default()
        }
    }

    fn bridge() -> (KsuBridge, Arc<RecordingSurface>) {
        let surface = Arc::new(RecordingSurface::default());
        let (dispatcher, _consumer) = ResultDispatcher::start(surface.clone());
        let bridge = KsuBridge::new(&config(), "/data/adb/modules/demo", dispatcher)
            .with_module_backend(Arc::new(StaticBackend));
        (bridge, surface)
    }

    #[tokio::test]
    async fn test_exec_returns_stdout_only() {
        let (bridge, _) = bridge();
        assert_eq!(bridge.exec("echo hi; echo ignored >&2").await.unwrap(), "hi");
        assert_eq!(bridge.exec("printf 'a\\nb\\n'").await.unwrap(), "a\nb");
    }

    #[tokio::test]
    async fn test_exec_callback_receives_code_and_output() {
        let (bridge, surface) = bridge();
        bridge
            .exec_with_callback(
                "echo $X; echo bad >&2; exit 2",
                Some(r#"{"env":{"X":"x"}}"#),
                "done",
            )
            .await
            .unwrap();
        bridge.dispatcher().flush().await;

        assert_eq!(
            surface.events(),
            vec![BridgeEvent::Callback {
                function: "done".to_string(),
                args: vec![json!(2), json!("x"), json!("bad")],
            }]
        );
    }

    #[tokio::test]
    async fn test_exec_rejects_bad_options() {
        let (bridge, surface) = bridge();
        let err = bridge
            .exec_with_callback("true", Some("{"), "done")
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArguments(_)));
        bridge.dispatcher().flush().await;
        assert!(surface.events().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_through_bridge() {
        let (bridge, surface) = bridge();
        let job = bridge.spawn("echo", r#"["one"]"#, None, "tok").await.unwrap();
        assert_eq!(job.wait().await, JobOutcome::Exited(0));
        bridge.dispatcher().flush().await;

        let names: Vec<String> = surface
            .events_for("tok")
            .iter()
            .map(|e| e.event_name().to_string())
            .collect();
        assert_eq!(names, vec!["data", "exit"]);
        assert_eq!(bridge.jobs().active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_and_shutdown() {
        let (bridge, _) = bridge();
        let job = bridge.spawn("sleep", r#"[10]"#, None, "long").await.unwrap();
        bridge.shutdown().await;
        assert_eq!(job.wait().await, JobOutcome::Cancelled);
        assert_eq!(bridge.cancel("long"), 0);
        assert_eq!(bridge.sessions().session_count(), 0);
    }

    #[tokio::test]
    async fn test_module_queries() {
        let (bridge, _) = bridge();
        let info: Value = serde_json::from_str(&bridge.module_info().await).unwrap();
        assert_eq!(
            info,
            json!({"moduleDir": "/data/adb/modules/demo", "id": "demo", "name": "Demo"})
        );
        assert_eq!(bridge.list_all_kpm().await.unwrap(), r#"["kpm_one"]"#);
        assert_eq!(bridge.control_kpm("kpm_one", "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_host_ui_and_display() {
        let surface = Arc::new(RecordingSurface::default());
        let (dispatcher, _consumer) = ResultDispatcher::start(surface);

        let host = Arc::new(RecordingHost::default());
        let display = DisplayState::default();
        let bridge = KsuBridge::new(&config(), "/data/adb/modules/demo", dispatcher)
            .with_host_ui(host.clone())
            .with_display(display.clone());

        bridge.toast("saved");
        bridge.full_screen(true);
        assert_eq!(host.calls.lock().clone(), vec!["toast:saved", "full_screen:true"]);

        assert!(!bridge.is_secondary_page());
        display.set_secondary(true);
        assert!(bridge.is_secondary_page());
    }
}
