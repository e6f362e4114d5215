//! Data Modelling Sink - normalize nested JSON streams into ClickHouse tables
//!
//! Provides:
//! - Schema compilation from JSON Schema into a tree of table descriptors
//! - DDL generation and schema drift reconciliation
//! - Batched, streaming ingestion with idle flushes
//! - Logical deletes, orphan cleanup and integrity checks
//! - A message-driven sink over newline-delimited JSON

pub mod cli;
pub mod config;
pub mod ddl;
pub mod extract;
pub mod ingest;
pub mod logging;
pub mod models;
pub mod naming;
pub mod orchestrator;
pub mod protocol;
pub mod schema;
pub mod store;

// Re-export commonly used types
pub use config::{ClickHouseConfig, ConfigError, IngestConfig, SinkConfig};
pub use ingest::{IngestError, IngestionEngine};
pub use models::{KeyColumn, KeyRole, ScalarType, StorageType, TableDescriptor, ValueColumn};
pub use orchestrator::{Sink, SinkError, SinkReport, StreamOrchestrator};
pub use protocol::{Message, parse_line};
pub use schema::compile_schema;
pub use store::{ClickHouseStore, MemoryStore, StoreClient, StoreError};
