//! Privileged Session Module
//!
//! Persistent root shells and their lifecycle:
//! - Marker-delimited jobs over a long-lived shell process
//! - One process group per job, signalled on cancel and timeout
//! - Dedicated sessions for streaming jobs
//! - Optional pooling for synchronous jobs
//!
//! How root is obtained stays behind the `SessionFactory` trait.

pub mod factory;
pub mod manager;
pub mod shell;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use factory::{SessionFactory, ShellSessionFactory};
pub use manager::SessionManager;
pub use shell::{collect_lines, JobOutput, JobSinks, OutputStream, PrivilegedSession};
pub use state::{SessionInfo, SessionPurpose, SessionStatus};
