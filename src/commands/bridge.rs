//! Bridge Commands
//!
//! Tauri commands behind the `window.ksu` object of module WebUI windows.
//! Each module window gets its own bridge whose events are evaluated in that
//! window.

use dashmap::DashMap;
use log::{debug, info, warn};
use std::borrow::Cow;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tauri::http::{header::CONTENT_TYPE, Request, Response, StatusCode};
use tauri::{AppHandle, Emitter, Manager, State, WebviewUrl, WebviewWindow, WebviewWindowBuilder};

use crate::bridge::KsuBridge;
use crate::config::BridgeConfig;
use crate::dispatch::{BridgeEvent, ResultDispatcher, ScriptSurface};
use crate::display::{DisplayState, HostUi};
use crate::error::{BridgeError, BridgeResult};

/// URI scheme module webroots are served from
pub const MODULE_SCHEME: &str = "ksu";

const WINDOW_PREFIX: &str = "module-";

/// Injected into every module window before its scripts run
const INIT_SCRIPT: &str = r#"
(function () {
  const invoke = window.__TAURI_INTERNALS__.invoke;
  window.ksu = {
    exec: function (cmd, options, callback) {
      switch (arguments.length) {
        case 1:
          return invoke('ksu_exec', { cmd });
        case 2:
          return invoke('ksu_exec_callback', { cmd, options: null, callback: options });
        default:
          return invoke('ksu_exec_callback', { cmd, options, callback });
      }
    },
    spawn: (command, args, options, token) =>
      invoke('ksu_spawn', { command, args, options, token }),
    cancel: (token) => invoke('ksu_cancel', { token }),
    toast: (msg) => invoke('ksu_toast', { msg }),
    fullScreen: (enabled) => invoke('ksu_full_screen', { enabled }),
    isSecondaryPage: () => invoke('ksu_is_secondary_page'),
    moduleInfo: () => invoke('ksu_module_info'),
    listAllKpm: () => invoke('ksu_list_all_kpm'),
    controlKpm: (name, args) => invoke('ksu_control_kpm', { name, args }),
  };
})();
"#;

/// Evaluates bridge events in a webview window
pub struct WebviewSurface {
    window: WebviewWindow,
}

impl ScriptSurface for WebviewSurface {
    fn deliver(&self, event: &BridgeEvent) -> BridgeResult<()> {
        self.window
            .eval(&event.to_javascript())
            .map_err(|e| BridgeError::Delivery(e.to_string()))
    }
}

/// Toasts go to the main window, full screen applies to the module window
pub struct WindowHostUi {
    window: WebviewWindow,
}

impl HostUi for WindowHostUi {
    fn toast(&self, message: &str) {
        if let Err(e) = self.window.emit_to("main", "ksu:toast", message) {
            warn!("Failed to show toast: {}", e);
        }
    }

    fn set_full_screen(&self, enabled: bool) {
        if let Err(e) = self.window.set_fullscreen(enabled) {
            warn!("Failed to change full screen: {}", e);
        }
    }
}

/// Bridges of the open module windows, keyed by window label
pub struct BridgeRegistry {
    config: BridgeConfig,
    display: DisplayState,
    bridges: DashMap<String, Arc<KsuBridge>>,
}

impl BridgeRegistry {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            display: DisplayState::default(),
            bridges: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn get(&self, label: &str) -> Result<Arc<KsuBridge>, String> {
        self.bridges
            .get(label)
            .map(|b| Arc::clone(b.value()))
            .ok_or_else(|| format!("No bridge for window {}", label))
    }

    fn attach(&self, window: &WebviewWindow, module_dir: PathBuf) {
        let surface = Arc::new(WebviewSurface {
            window: window.clone(),
        });
        let (dispatcher, _consumer) = ResultDispatcher::start(surface);
        let bridge = KsuBridge::new(&self.config, module_dir, dispatcher)
            .with_display(self.display.clone())
            .with_host_ui(Arc::new(WindowHostUi {
                window: window.clone(),
            }));
        self.bridges.insert(window.label().to_string(), Arc::new(bridge));
    }

    /// Tear down the bridge of a closed window
    pub async fn detach(&self, label: &str) {
        if let Some((_, bridge)) = self.bridges.remove(label) {
            bridge.shutdown().await;
            debug!("Detached bridge of {}", label);
        }
    }
}

fn module_id_from_label(label: &str) -> Option<&str> {
    label.strip_prefix(WINDOW_PREFIX)
}

/// Open a module's WebUI in its own window
#[tauri::command]
pub async fn open_module_webui(
    app: AppHandle,
    registry: State<'_, BridgeRegistry>,
    module_id: String,
) -> Result<(), String> {
    let label = format!("{}{}", WINDOW_PREFIX, module_id);
    if let Some(window) = app.get_webview_window(&label) {
        return window.set_focus().map_err(|e| e.to_string());
    }

    let url = format!("{}://localhost/index.html", MODULE_SCHEME)
        .parse()
        .map_err(|e| format!("Invalid module URL: {}", e))?;
    let window = WebviewWindowBuilder::new(&app, &label, WebviewUrl::CustomProtocol(url))
        .title(&module_id)
        .initialization_script(INIT_SCRIPT)
        .devtools(registry.config.webui.enable_web_debugging)
        .build()
        .map_err(|e| e.to_string())?;

    registry.attach(&window, registry.config.modules.module_dir(&module_id));
    info!("Opened WebUI of {}", module_id);
    Ok(())
}

/// Mark WebUI windows as secondary pages (or not)
#[tauri::command]
pub async fn set_secondary_screen(
    registry: State<'_, BridgeRegistry>,
    secondary: bool,
) -> Result<(), String> {
    registry.display.set_secondary(secondary);
    Ok(())
}

#[tauri::command]
pub async fn ksu_exec(
    window: WebviewWindow,
    registry: State<'_, BridgeRegistry>,
    cmd: String,
) -> Result<String, String> {
    let bridge = registry.get(window.label())?;
    bridge.exec(&cmd).await.map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn ksu_exec_callback(
    window: WebviewWindow,
    registry: State<'_, BridgeRegistry>,
    cmd: String,
    options: Option<String>,
    callback: String,
) -> Result<(), String> {
    let bridge = registry.get(window.label())?;
    bridge
        .exec_with_callback(&cmd, options.as_deref(), &callback)
        .await
        .map(|_| ())
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn ksu_spawn(
    window: WebviewWindow,
    registry: State<'_, BridgeRegistry>,
    command: String,
    args: Option<String>,
    options: Option<String>,
    token: String,
) -> Result<String, String> {
    let bridge = registry.get(window.label())?;
    let job = bridge
        .spawn(
            &command,
            args.as_deref().unwrap_or_default(),
            options.as_deref(),
            &token,
        )
        .await
        .map_err(|e| e.to_string())?;
    Ok(job.job_id.clone())
}

#[tauri::command]
pub async fn ksu_cancel(
    window: WebviewWindow,
    registry: State<'_, BridgeRegistry>,
    token: String,
) -> Result<usize, String> {
    Ok(registry.get(window.label())?.cancel(&token))
}

#[tauri::command]
pub async fn ksu_toast(
    window: WebviewWindow,
    registry: State<'_, BridgeRegistry>,
    msg: String,
) -> Result<(), String> {
    registry.get(window.label())?.toast(&msg);
    Ok(())
}

#[tauri::command]
pub async fn ksu_full_screen(
    window: WebviewWindow,
    registry: State<'_, BridgeRegistry>,
    enabled: bool,
) -> Result<(), String> {
    registry.get(window.label())?.full_screen(enabled);
    Ok(())
}

#[tauri::command]
pub async fn ksu_is_secondary_page(
    window: WebviewWindow,
    registry: State<'_, BridgeRegistry>,
) -> Result<bool, String> {
    Ok(registry.get(window.label())?.is_secondary_page())
}

#[tauri::command]
pub async fn ksu_module_info(
    window: WebviewWindow,
    registry: State<'_, BridgeRegistry>,
) -> Result<String, String> {
    Ok(registry.get(window.label())?.module_info().await)
}

#[tauri::command]
pub async fn ksu_list_all_kpm(
    window: WebviewWindow,
    registry: State<'_, BridgeRegistry>,
) -> Result<String, String> {
    let bridge = registry.get(window.label())?;
    bridge.list_all_kpm().await.map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn ksu_control_kpm(
    window: WebviewWindow,
    registry: State<'_, BridgeRegistry>,
    name: String,
    args: String,
) -> Result<i32, String> {
    let bridge = registry.get(window.label())?;
    bridge.control_kpm(&name, &args).await.map_err(|e| e.to_string())
}

/// Resolve a request path inside a webroot, refusing to leave it
fn resolve_asset(webroot: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = request_path.trim_start_matches('/');
    let relative = if relative.is_empty() { "index.html" } else { relative };

    let mut resolved = webroot.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(resolved)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html",
        Some("js") | Some("mjs") => "text/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}

/// Serve `ksu://` requests from the requesting window's module webroot
pub fn serve_module_asset(
    modules_root: &Path,
    window_label: &str,
    request: &Request<Vec<u8>>,
) -> Response<Cow<'static, [u8]>> {
    let asset = module_id_from_label(window_label)
        .map(|id| modules_root.join(id).join("webroot"))
        .and_then(|webroot| resolve_asset(&webroot, request.uri().path()));

    let (status, mime, body) = match asset.map(|path| (std::fs::read(&path), path)) {
        Some((Ok(bytes), path)) => (StatusCode::OK, content_type(&path), bytes),
        Some((Err(e), path)) => {
            debug!("Module asset {} unavailable: {}", path.display(), e);
            (StatusCode::NOT_FOUND, "text/plain", b"not found".to_vec())
        }
        None => (StatusCode::FORBIDDEN, "text/plain", b"forbidden".to_vec()),
    };

    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, mime)
        .body(Cow::Owned(body))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_overloads_share_one_name() {
        let start = INIT_SCRIPT.find("exec:").unwrap();
        let end = INIT_SCRIPT.find("spawn:").unwrap();
        let exec = &INIT_SCRIPT[start..end];
        assert!(exec.contains("switch (arguments.length)"));

        let cases: Vec<&str> = exec.split("case ").skip(1).collect();
        assert!(cases[0].starts_with("1:") && cases[0].contains("'ksu_exec', { cmd }"));
        assert!(cases[1].starts_with("2:") && cases[1].contains("options: null, callback: options"));
        let default = exec.split("default:").nth(1).unwrap();
        assert!(default.contains("'ksu_exec_callback', { cmd, options, callback }"));
        assert!(!INIT_SCRIPT.contains("execWithCallback"));
    }

    #[test]
    fn test_asset_resolution_stays_in_webroot() {
        let root = Path::new("/data/adb/modules/demo/webroot");
        assert_eq!(resolve_asset(root, "/"), Some(root.join("index.html")));
        assert_eq!(resolve_asset(root, "/js/app.js"), Some(root.join("js/app.js")));
        assert_eq!(resolve_asset(root, "/../../secret"), None);
    }

    #[test]
    fn test_serves_files_of_window_module() {
        let modules = tempfile::tempdir().unwrap();
        let webroot = modules.path().join("demo").join("webroot");
        std::fs::create_dir_all(&webroot).unwrap();
        std::fs::write(webroot.join("index.html"), "<h1>demo</h1>").unwrap();

        let request = Request::builder()
            .uri("ksu://localhost/index.html")
            .body(Vec::new())
            .unwrap();
        let response = serve_module_asset(modules.path(), "module-demo", &request);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"<h1>demo</h1>");

        let missing = serve_module_asset(modules.path(), "module-other", &request);
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
