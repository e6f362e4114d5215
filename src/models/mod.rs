//! Models module
//!
//! Defines the table descriptor tree the schema compiler produces and every
//! later stage consumes.

pub mod column;
pub mod enums;
pub mod table;

pub use column::{KeyColumn, ValueColumn};
pub use enums::{KeyRole, ScalarType, StorageType};
pub use table::{DESCENDANT_VERSION_COLUMN, ROOT_VERSION_COLUMN, TableDescriptor};
