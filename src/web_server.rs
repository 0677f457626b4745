//! HTTP Bridge Server
//!
//! Serves a module's webroot and exposes the bridge to it over HTTP:
//! - JSON endpoints for exec, spawn, cancel and module queries
//! - `/api/events` streaming bridge events as JSON-RPC notifications (SSE)

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tower_http::{cors::CorsLayer, services::ServeDir};

use crate::bridge::KsuBridge;
use crate::config::BridgeConfig;
use crate::dispatch::{BroadcastSurface, ResultDispatcher};
use crate::error::{BridgeError, BridgeResult};
use crate::exec::{ExecutionResult, JobInfo};

const EVENT_BUFFER: usize = 1024;

/// Shared server state
#[derive(Clone)]
pub struct WebState {
    pub bridge: Arc<KsuBridge>,
    pub events: Arc<BroadcastSurface>,
    pub webroot: PathBuf,
}

impl WebState {
    /// Build a bridge for `module_dir` whose events feed the SSE stream
    pub fn new(config: &BridgeConfig, module_dir: impl Into<PathBuf>) -> Self {
        let module_dir = module_dir.into();
        let events = Arc::new(BroadcastSurface::new(EVENT_BUFFER));
        let (dispatcher, _consumer) = ResultDispatcher::start(events.clone());
        Self {
            bridge: Arc::new(KsuBridge::new(config, &module_dir, dispatcher)),
            events,
            webroot: module_dir.join("webroot"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub cmd: String,
    #[serde(default)]
    pub options: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct SpawnRequest {
    pub command: String,
    #[serde(default)]
    pub args: Option<Value>,
    #[serde(default)]
    pub options: Option<Value>,
    pub token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnResponse {
    pub job_id: String,
}

#[derive(Debug, Deserialize)]
pub struct KpmControlRequest {
    #[serde(default)]
    pub args: String,
}

/// Error body returned by every endpoint
pub struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self(BridgeError::from(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BridgeError::InvalidArguments(_) => StatusCode::BAD_REQUEST,
            BridgeError::SessionUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!("Request failed: {}", self.0);
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Create the HTTP router
pub fn create_router(state: WebState) -> Router {
    let webroot = ServeDir::new(&state.webroot);
    Router::new()
        .route("/api/exec", post(exec_handler))
        .route("/api/spawn", post(spawn_handler))
        .route("/api/cancel/{token}", post(cancel_handler))
        .route("/api/jobs", get(jobs_handler))
        .route("/api/module-info", get(module_info_handler))
        .route("/api/kpm", get(kpm_list_handler))
        .route("/api/kpm/{name}", post(kpm_control_handler))
        .route("/api/display", get(display_handler))
        .route("/api/events", get(events_handler))
        .fallback_service(webroot)
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// JSON bodies carry options and arguments as values; the bridge takes text
fn json_text(value: Option<Value>) -> Option<String> {
    value.filter(|v| !v.is_null()).map(|v| v.to_string())
}

async fn exec_handler(
    State(state): State<WebState>,
    Json(request): Json<ExecRequest>,
) -> ApiResult<ExecutionResult> {
    let options = json_text(request.options);
    let result = state
        .bridge
        .exec_with_options(&request.cmd, options.as_deref())
        .await?;
    Ok(Json(result))
}

async fn spawn_handler(
    State(state): State<WebState>,
    Json(request): Json<SpawnRequest>,
) -> ApiResult<SpawnResponse> {
    let args = json_text(request.args).unwrap_or_default();
    let options = json_text(request.options);
    let job = state
        .bridge
        .spawn(&request.command, &args, options.as_deref(), &request.token)
        .await?;
    Ok(Json(SpawnResponse {
        job_id: job.job_id.clone(),
    }))
}

async fn cancel_handler(
    State(state): State<WebState>,
    Path(token): Path<String>,
) -> Json<Value> {
    Json(json!({ "cancelled": state.bridge.cancel(&token) }))
}

async fn jobs_handler(State(state): State<WebState>) -> Json<Vec<JobInfo>> {
    Json(state.bridge.jobs().list())
}

async fn module_info_handler(State(state): State<WebState>) -> ApiResult<Value> {
    let info = state.bridge.module_info().await;
    Ok(Json(serde_json::from_str(&info)?))
}

async fn kpm_list_handler(State(state): State<WebState>) -> ApiResult<Value> {
    let list = state.bridge.list_all_kpm().await?;
    Ok(Json(serde_json::from_str(&list)?))
}

async fn kpm_control_handler(
    State(state): State<WebState>,
    Path(name): Path<String>,
    Json(request): Json<KpmControlRequest>,
) -> ApiResult<Value> {
    let code = state.bridge.control_kpm(&name, &request.args).await?;
    Ok(Json(json!({ "result": code })))
}

async fn display_handler(State(state): State<WebState>) -> Json<Value> {
    Json(json!({ "secondary": state.bridge.is_secondary_page() }))
}

async fn events_handler(
    State(state): State<WebState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(|message| {
        match message {
            Ok(json) => Some(Ok(Event::default().event("bridge").data(json))),
            Err(e) => {
                warn!("SSE subscriber fell behind: {}", e);
                None
            }
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

/// Run the server until Ctrl-C, then shut the bridge down
pub async fn serve(state: WebState, addr: SocketAddr) -> BridgeResult<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        "Serving {} on http://{}",
        state.webroot.display(),
        listener.local_addr()?
    );
    let bridge = Arc::clone(&state.bridge);
    let served = axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await;
    bridge.shutdown().await;
    served.map_err(BridgeError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShellConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn state(module_dir: &std::path::Path) -> WebState {
        let config = BridgeConfig {
            shell: ShellConfig::unprivileged(),
            ..Default::default()
        };
        WebState::new(&config, module_dir)
    }

    #[tokio::test]
    async fn test_exec_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let Json(result) = exec_handler(
            State(state),
            Json(ExecRequest {
                cmd: "echo $A".to_string(),
                options: Some(json!({"env": {"A": 1}})),
            }),
        )
        .await
        .ok()
        .unwrap();
        assert_eq!(result.stdout, "1");
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_bad_options_map_to_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let err = exec_handler(
            State(state(dir.path())),
            Json(ExecRequest {
                cmd: "true".to_string(),
                options: Some(json!("not an object")),
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_spawn_events_reach_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let mut rx = state.events.subscribe();

        spawn_handler(
            State(state.clone()),
            Json(SpawnRequest {
                command: "echo".to_string(),
                args: Some(json!(["streamed"])),
                options: None,
                token: "web".to_string(),
            }),
        )
        .await
        .ok()
        .unwrap();

        let first: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["method"], "bridge/event");
        assert_eq!(first["params"]["type"], "data");
        assert_eq!(first["params"]["line"], "streamed");

        let second: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(second["params"]["type"], "exit");
        assert_eq!(second["params"]["code"], 0);
    }

    #[tokio::test]
    async fn test_router_serves_webroot_and_api() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("webroot")).unwrap();
        std::fs::write(dir.path().join("webroot").join("index.html"), "<p>module</p>").unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = create_router(state(dir.path()));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let index = http_get(addr, "/index.html").await;
        assert!(index.starts_with("HTTP/1.1 200"));
        assert!(index.ends_with("<p>module</p>"));

        let display = http_get(addr, "/api/display").await;
        assert!(display.contains(r#"{"secondary":false}"#));
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, addr
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }
}
