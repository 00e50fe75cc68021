//! Server and configuration errors

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid port mapping format: {0}")]
    InvalidPortMapping(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that stop the server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is listening on {address}\n  • Try a different bind_addr in the config file")]
    BindError { address: String, reason: String },
}
