//! Script Surfaces
//!
//! Adapters that take delivered events somewhere: a terminal for the CLI and
//! a broadcast channel feeding HTTP event streams. The webview adapter lives
//! with the desktop commands.

use serde::Serialize;
use std::io::Write;
use tokio::sync::broadcast;

use super::dispatcher::ScriptSurface;
use super::events::BridgeEvent;
use crate::error::{BridgeError, BridgeResult};
use crate::session::OutputStream;

/// How the console surface prints events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleFormat {
    /// One JSON object per line
    Json,
    /// The JavaScript a webview would evaluate
    Script,
    /// Raw output lines on stdout/stderr, other events as JSON on stderr
    Plain,
}

/// Prints events to the process's stdout/stderr
pub struct ConsoleSurface {
    format: ConsoleFormat,
}

impl ConsoleSurface {
    pub fn new(format: ConsoleFormat) -> Self {
        Self { format }
    }
}

impl ScriptSurface for ConsoleSurface {
    fn deliver(&self, event: &BridgeEvent) -> BridgeResult<()> {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();

        let written = match (self.format, event) {
            (ConsoleFormat::Plain, BridgeEvent::Data { stream, line, .. }) => match stream {
                OutputStream::Stdout => writeln!(stdout.lock(), "{}", line),
                OutputStream::Stderr => writeln!(stderr.lock(), "{}", line),
            },
            (ConsoleFormat::Plain, other) => writeln!(stderr.lock(), "{}", marshal(other)?),
            (ConsoleFormat::Json, event) => writeln!(stdout.lock(), "{}", marshal(event)?),
            (ConsoleFormat::Script, event) => writeln!(stdout.lock(), "{}", event.to_javascript()),
        };

        written.map_err(|e| BridgeError::Delivery(e.to_string()))
    }
}

fn marshal(event: &BridgeEvent) -> BridgeResult<String> {
    serde_json::to_string(event).map_err(|e| BridgeError::Marshal {
        target: event.target(),
        reason: e.to_string(),
    })
}

/// JSON-RPC 2.0 notification wrapping a bridge event
#[derive(Debug, Clone, Serialize)]
pub struct EventNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: &'a BridgeEvent,
}

impl<'a> EventNotification<'a> {
    pub const METHOD: &'static str = "bridge/event";

    pub fn new(event: &'a BridgeEvent) -> Self {
        Self {
            jsonrpc: "2.0",
            method: Self::METHOD,
            params: event,
        }
    }
}

/// Fans events out as serialized JSON-RPC notifications
pub struct BroadcastSurface {
    tx: broadcast::Sender<String>,
}

impl BroadcastSurface {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl ScriptSurface for BroadcastSurface {
    fn deliver(&self, event: &BridgeEvent) -> BridgeResult<()> {
        let json = serde_json::to_string(&EventNotification::new(event)).map_err(|e| {
            BridgeError::Marshal {
                target: event.target(),
                reason: e.to_string(),
            }
        })?;
        // No subscriber is not an error; the page may not be listening yet.
        let _ = self.tx.send(json);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_surface_wraps_events() {
        let surface = BroadcastSurface::new(8);
        let mut rx = surface.subscribe();

        surface
            .deliver(&BridgeEvent::Exit {
                token: "cb".to_string(),
                code: 0,
            })
            .unwrap();

        let json: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["method"], "bridge/event");
        assert_eq!(json["params"]["type"], "exit");
        assert_eq!(json["params"]["token"], "cb");
    }

    #[test]
    fn test_broadcast_without_subscribers_is_ok() {
        let surface = BroadcastSurface::new(1);
        assert!(surface
            .deliver(&BridgeEvent::Console {
                message: "nobody listens".to_string()
            })
            .is_ok());
    }

    #[test]
    fn test_console_surface_json() {
        let surface = ConsoleSurface::new(ConsoleFormat::Json);
        assert!(surface
            .deliver(&BridgeEvent::Exit {
                token: "cb".to_string(),
                code: 3
            })
            .is_ok());
    }
}
