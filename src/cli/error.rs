//! CLI-specific error types

use thiserror::Error;

use crate::config::ConfigError;
use crate::orchestrator::SinkError;
use crate::protocol::ProtocolError;
use crate::store::StoreError;

/// CLI-specific error type
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Streams failed: {}", .0.join(", "))]
    StreamsFailed(Vec<String>),
}
