//! Bridge Events
//!
//! Typed calls crossing into the script surface. Webview surfaces evaluate
//! the JavaScript rendering; other surfaces forward the event as JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::OutputStream;

/// Events delivered to script-side callback targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BridgeEvent {
    /// One output line of a spawned job
    Data {
        token: String,
        stream: OutputStream,
        line: String,
    },

    /// A spawned job finished
    Exit { token: String, code: i32 },

    /// A spawned job finished with a non-zero status
    Error {
        token: String,
        #[serde(rename = "exitCode")]
        exit_code: i32,
        message: String,
    },

    /// Any other named event on a callback target
    Emit {
        token: String,
        event: String,
        payload: Value,
    },

    /// Plain function call, used by callback-style `exec`
    Callback { function: String, args: Vec<Value> },

    /// Diagnostic for the surface's console
    Console { message: String },
}

impl BridgeEvent {
    /// Name of the script-side event
    pub fn event_name(&self) -> &str {
        match self {
            Self::Data { .. } => "data",
            Self::Exit { .. } => "exit",
            Self::Error { .. } => "error",
            Self::Emit { event, .. } => event,
            Self::Callback { .. } => "callback",
            Self::Console { .. } => "console",
        }
    }

    /// Script-side object or function the event is addressed to
    pub fn target(&self) -> String {
        match self {
            Self::Data { token, stream, .. } => format!("{}.{}", token, stream),
            Self::Exit { token, .. } | Self::Error { token, .. } | Self::Emit { token, .. } => {
                token.clone()
            }
            Self::Callback { function, .. } => function.clone(),
            Self::Console { .. } => "console".to_string(),
        }
    }

    /// Callback token of a spawn event
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Data { token, .. }
            | Self::Exit { token, .. }
            | Self::Error { token, .. }
            | Self::Emit { token, .. } => Some(token),
            Self::Callback { .. } | Self::Console { .. } => None,
        }
    }

    /// Render as a self-contained script. Exceptions thrown by the page's
    /// handlers are caught and sent to `console.error`.
    pub fn to_javascript(&self) -> String {
        match self {
            Self::Data { token, stream, line } => guarded(
                &format!("{}.{}.emit('data', {});", token, stream, literal_str(line)),
                "'emitData', e",
            ),
            Self::Exit { token, code } => guarded(
                &format!("{}.emit('exit', {});", token, code),
                "`emitExit error: ${e}`",
            ),
            Self::Error {
                token,
                exit_code,
                message,
            } => guarded(
                &format!(
                    "var err = new Error(); err.exitCode = {}; err.message = {};{}.emit('error', err);",
                    exit_code,
                    literal_str(message),
                    token
                ),
                "'emitErr', e",
            ),
            Self::Emit {
                token,
                event,
                payload,
            } => guarded(
                &format!("{}.emit({}, {});", token, literal_str(event), payload),
                "'emit', e",
            ),
            Self::Callback { function, args } => {
                let args: Vec<String> = args.iter().map(Value::to_string).collect();
                guarded(&format!("{}({});", function, args.join(", ")), "e")
            }
            Self::Console { message } => {
                format!("(function() {{ console.error({}); }})();", literal_str(message))
            }
        }
    }
}

fn guarded(body: &str, error_args: &str) -> String {
    format!(
        "(function() {{ try {{ {} }} catch(e) {{ console.error({}); }} }})();",
        body, error_args
    )
}

/// JSON string literal, which is also a valid JavaScript string literal
fn literal_str(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}
