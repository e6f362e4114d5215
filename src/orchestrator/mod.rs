//! Stream orchestration
//!
//! - [`reconcile`]: applies schema drift to existing tables
//! - [`StreamOrchestrator`]: one compiled schema and one ingestion engine per
//!   logical stream, from table preparation to finalization
//! - [`Sink`]: routes protocol messages to the per-stream orchestrators

pub mod reconcile;
pub mod sink;
pub mod stream;

pub use reconcile::{DriftError, ReconcileReport, reconcile_table, reconcile_tree};
pub use sink::{Sink, SinkReport};
pub use stream::{STAGING_PREFIX, StreamOrchestrator, StreamSummary};

use crate::ingest::IngestError;
use crate::protocol::ProtocolError;
use crate::schema::CompileError;
use crate::store::StoreError;

/// Error type for stream processing
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Schema compilation failed: {0}")]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Drift(#[from] DriftError),

    #[error("Ingestion failed: {0}")]
    Ingest(#[from] IngestError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A key tuple occurs more than once after finalization
    #[error("Integrity check failed for '{table}': duplicate key {key}")]
    Integrity { table: String, key: String },

    /// Record or delete for a stream without a schema
    #[error("Received data for unknown stream '{0}'")]
    UnknownStream(String),

    /// The stream failed earlier and accepts no more messages
    #[error("Stream '{0}' has failed")]
    StreamFailed(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Result type for stream processing
pub type SinkResult<T> = Result<T, SinkError>;
