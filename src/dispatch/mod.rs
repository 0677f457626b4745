//! Dispatch Module
//!
//! Marshals job results and events across the script boundary:
//! - Typed `BridgeEvent`s with a JavaScript rendering
//! - A single consumer task per surface, preserving queue order
//! - Console, broadcast and (desktop) webview surfaces

pub mod dispatcher;
pub mod events;
pub mod surface;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::{ResultDispatcher, ScriptSurface};
pub use events::BridgeEvent;
pub use surface::{BroadcastSurface, ConsoleFormat, ConsoleSurface, EventNotification};
