//! Test doubles for script surfaces.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::dispatcher::ScriptSurface;
use super::events::BridgeEvent;
use crate::error::{BridgeError, BridgeResult};

/// Records every delivered event
#[derive(Default)]
pub struct RecordingSurface {
    events: Mutex<Vec<BridgeEvent>>,
    fail_remaining: AtomicUsize,
}

impl RecordingSurface {
    /// Reject the first `n` deliveries
    pub fn failing_first(n: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail_remaining: AtomicUsize::new(n),
        }
    }

    pub fn events(&self) -> Vec<BridgeEvent> {
        self.events.lock().clone()
    }

    /// Events addressed to one callback token
    pub fn events_for(&self, token: &str) -> Vec<BridgeEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.token() == Some(token))
            .cloned()
            .collect()
    }
}

impl ScriptSurface for RecordingSurface {
    fn deliver(&self, event: &BridgeEvent) -> BridgeResult<()> {
        let should_fail = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(BridgeError::Delivery("surface unavailable".to_string()));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}
