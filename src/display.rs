//! Display State
//!
//! Process-wide display facts the host shares with every module WebUI, and
//! the host UI actions a page may request.

use log::info;
use std::sync::Arc;
use tokio::sync::watch;

/// Whether the WebUI is shown as a secondary page. Cloned handles share one
/// value; the host updates it, bridges read it.
#[derive(Clone)]
pub struct DisplayState {
    secondary: Arc<watch::Sender<bool>>,
}

impl DisplayState {
    pub fn new(secondary: bool) -> Self {
        let (tx, _) = watch::channel(secondary);
        Self {
            secondary: Arc::new(tx),
        }
    }

    pub fn set_secondary(&self, secondary: bool) {
        let changed = self.secondary.send_if_modified(|current| {
            let changed = *current != secondary;
            *current = secondary;
            changed
        });
        if changed {
            info!("Secondary screen state changed to {}", secondary);
        }
    }

    pub fn is_secondary(&self) -> bool {
        *self.secondary.borrow()
    }

    /// Receiver notified on every change
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.secondary.subscribe()
    }
}

impl Default for DisplayState {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Host-side UI actions requested by a page
pub trait HostUi: Send + Sync {
    /// Show a short transient message
    fn toast(&self, message: &str);

    /// Hide (`true`) or show the system bars
    fn set_full_screen(&self, enabled: bool);
}

/// Host UI for headless hosts: requests only end up in the log
#[derive(Debug, Default)]
pub struct LogHostUi;

impl HostUi for LogHostUi {
    fn toast(&self, message: &str) {
        info!("[toast] {}", message);
    }

    fn set_full_screen(&self, enabled: bool) {
        info!("[ui] full screen {}", if enabled { "on" } else { "off" });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let state = DisplayState::default();
        let other = state.clone();
        assert!(!other.is_secondary());

        state.set_secondary(true);
        assert!(other.is_secondary());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes_only() {
        let state = DisplayState::new(false);
        let mut rx = state.subscribe();

        state.set_secondary(false);
        assert!(!rx.has_changed().unwrap());

        state.set_secondary(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
    }
}
