//! Result Dispatcher
//!
//! Producers (reader tasks, executors) queue events from any thread; one
//! consumer task delivers them to the script surface in queue order. The
//! surface therefore only ever sees calls from a single logical thread.

use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::events::BridgeEvent;
use crate::error::{BridgeError, BridgeResult};
use crate::session::OutputStream;

/// Something that can run bridge events: a webview, an HTTP stream, a console
pub trait ScriptSurface: Send + Sync {
    /// Deliver one event. Called only from the dispatcher's consumer task.
    fn deliver(&self, event: &BridgeEvent) -> BridgeResult<()>;
}

enum Envelope {
    Event(BridgeEvent),
    Flush(oneshot::Sender<()>),
}

/// Handle for queueing events onto a surface
#[derive(Clone)]
pub struct ResultDispatcher {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ResultDispatcher {
    /// Start the consumer task for `surface`. It runs until every clone of
    /// the returned dispatcher is dropped.
    pub fn start(surface: Arc<dyn ScriptSurface>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

        let consumer = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                match envelope {
                    Envelope::Event(event) => {
                        if let Err(e) = surface.deliver(&event) {
                            warn!(
                                "Dropped {} event for {}: {}",
                                event.event_name(),
                                event.target(),
                                e
                            );
                        }
                    }
                    Envelope::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            debug!("Result dispatcher stopped");
        });

        (Self { tx }, consumer)
    }

    /// Queue an event
    pub fn send(&self, event: BridgeEvent) {
        if self.tx.send(Envelope::Event(event)).is_err() {
            debug!("Result dispatcher is gone, event dropped");
        }
    }

    /// Emit `event` with an arbitrary payload on a callback target. A payload
    /// that cannot be serialized becomes a console error instead.
    pub fn emit<T: Serialize + ?Sized>(&self, token: &str, event: &str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(payload) => self.send(BridgeEvent::Emit {
                token: token.to_string(),
                event: event.to_string(),
                payload,
            }),
            Err(e) => self.report_marshal_error(BridgeError::Marshal {
                target: format!("{}:{}", token, event),
                reason: e.to_string(),
            }),
        }
    }

    /// Emit an output line on `token.stdout` / `token.stderr`
    pub fn emit_data(&self, token: &str, stream: OutputStream, line: impl Into<String>) {
        self.send(BridgeEvent::Data {
            token: token.to_string(),
            stream,
            line: line.into(),
        });
    }

    /// Emit the terminal exit event of a job
    pub fn emit_exit(&self, token: &str, code: i32) {
        self.send(BridgeEvent::Exit {
            token: token.to_string(),
            code,
        });
    }

    /// Emit the error event of a failed job
    pub fn emit_error(&self, token: &str, exit_code: i32, message: impl Into<String>) {
        self.send(BridgeEvent::Error {
            token: token.to_string(),
            exit_code,
            message: message.into(),
        });
    }

    /// Call a script function with already serialized arguments
    pub fn invoke_callback(&self, function: &str, args: Vec<Value>) {
        self.send(BridgeEvent::Callback {
            function: function.to_string(),
            args,
        });
    }

    /// Write a message to the surface console
    pub fn console_error(&self, message: impl Into<String>) {
        self.send(BridgeEvent::Console {
            message: message.into(),
        });
    }

    /// Wait until everything queued before this call has been delivered
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Envelope::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// True once the consumer task has stopped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn report_marshal_error(&self, error: BridgeError) {
        warn!("{}", error);
        self.console_error(error.to_string());
    }
}
