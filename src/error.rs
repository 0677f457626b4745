//! Bridge Error Types
//!
//! Error taxonomy for the privileged execution bridge. A command that exits
//! non-zero is never an error here; it is reported as data.

use thiserror::Error;

/// Bridge-level errors
#[derive(Error, Debug)]
pub enum BridgeError {
    // Session errors
    #[error("Privileged session unavailable: {0}")]
    SessionUnavailable(String),

    #[error("Privileged session {0} terminated while a job was running")]
    SessionLost(String),

    #[error("Failed to close privileged session {id}: {reason}")]
    SessionClose { id: String, reason: String },

    // Execution errors
    #[error("Command timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    // Boundary errors
    #[error("Failed to marshal payload for {target}: {reason}")]
    Marshal { target: String, reason: String },

    #[error("Script surface rejected delivery: {0}")]
    Delivery(String),

    // Module errors
    #[error("Module query failed: {0}")]
    ModuleQuery(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::InvalidArguments(err.to_string())
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(err: toml::de::Error) -> Self {
        BridgeError::Config(err.to_string())
    }
}

/// Result type alias for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
