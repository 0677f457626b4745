//! Execution Module
//!
//! Runs module commands on privileged sessions:
//! - Command lines built from base command, arguments and options
//! - Synchronous execution with collected output
//! - Streaming execution with per-line events and cancellation

pub mod command;
pub mod jobs;
pub mod spawn;
pub mod sync_exec;

pub use command::{build_command, ArgumentList, CommandOptions};
pub use jobs::{JobInfo, JobOutcome, JobRegistry, JobStatus};
pub use spawn::{SpawnedJob, StreamExecutor};
pub use sync_exec::{run_sync, ExecutionResult, SyncExecutor};
