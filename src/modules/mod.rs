//! Modules
//!
//! Module listing, self-lookup and kernel patch module control.

pub mod backend;
pub mod control;

pub use backend::{KsudBackend, ModuleBackend};
pub use control::ModuleControl;
