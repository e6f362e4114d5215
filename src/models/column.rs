//! Column model for table descriptors

use serde::{Deserialize, Serialize};

use super::enums::{KeyRole, ScalarType, StorageType};

/// Prefix of root key copies in descendant tables
pub const ROOT_REF_PREFIX: &str = "_root_";
/// Prefix of keyed-ancestor key copies in descendant tables
pub const PARENT_REF_PREFIX: &str = "_parent_";
/// Prefix of array position columns
pub const LEVEL_INDEX_PREFIX: &str = "_level_";

/// A key column of a table.
///
/// Key columns are never nullable. Where the value comes from depends on the
/// role:
///
/// - `Own`: the `source` property of the element the row is built from
/// - `RootRef`: the `source` own key of the root record
/// - `ParentRef`: the `source` own key of the ancestor at `depth`
/// - `LevelIndex`: the element position at array depth `depth`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyColumn {
    /// Column name in the table
    pub name: String,
    /// Role of the key
    pub role: KeyRole,
    /// Storage type
    pub storage_type: StorageType,
    /// Name of the originating own key (empty for level indexes)
    pub source: String,
    /// Nesting depth the value is taken from (0 is the root)
    pub depth: usize,
}

impl KeyColumn {
    /// Declared identity column of a table at `depth`
    pub fn own(name: &str, storage_type: StorageType, depth: usize) -> Self {
        Self {
            name: name.to_string(),
            role: KeyRole::Own,
            storage_type,
            source: name.to_string(),
            depth,
        }
    }

    /// Copy of a root key into a descendant
    pub fn root_ref(root_key: &KeyColumn) -> Self {
        Self {
            name: format!("{}{}", ROOT_REF_PREFIX, root_key.source),
            role: KeyRole::RootRef,
            storage_type: root_key.storage_type,
            source: root_key.source.clone(),
            depth: 0,
        }
    }

    /// Copy of a keyed intermediate ancestor's key into a descendant
    pub fn parent_ref(ancestor_key: &KeyColumn) -> Self {
        Self {
            name: format!("{}{}", PARENT_REF_PREFIX, ancestor_key.source),
            role: KeyRole::ParentRef,
            storage_type: ancestor_key.storage_type,
            source: ancestor_key.source.clone(),
            depth: ancestor_key.depth,
        }
    }

    /// Position column for array nesting depth `depth` (1-based)
    pub fn level_index(depth: usize) -> Self {
        Self {
            name: format!("{}{}", LEVEL_INDEX_PREFIX, depth),
            role: KeyRole::LevelIndex,
            storage_type: StorageType::UInt32,
            source: String::new(),
            depth,
        }
    }

    /// DDL type of the column
    pub fn sql_type(&self) -> String {
        self.storage_type.sql_type(false)
    }
}

/// A value column of a table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValueColumn {
    /// Property path relative to the element the row is built from.
    /// Empty when the element itself is the scalar value.
    pub source_path: Vec<String>,
    /// Column name in the table
    pub name: String,
    /// Scalar type the value is coerced to
    pub scalar_type: ScalarType,
    /// Storage type
    pub storage_type: StorageType,
    /// Format hint from the schema, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Whether the column accepts NULL
    pub nullable: bool,
}

impl ValueColumn {
    /// Create a column for `source_path`, named by joining the path with `.`
    pub fn new(
        source_path: Vec<String>,
        scalar_type: ScalarType,
        storage_type: StorageType,
        nullable: bool,
    ) -> Self {
        let name = if source_path.is_empty() {
            "value".to_string()
        } else {
            source_path.join(".")
        };
        Self {
            source_path,
            name,
            scalar_type,
            storage_type,
            format: None,
            nullable,
        }
    }

    /// Attach the schema format hint
    pub fn with_format(mut self, format: Option<String>) -> Self {
        self.format = format;
        self
    }

    /// DDL type of the column
    pub fn sql_type(&self) -> String {
        self.storage_type.sql_type(self.nullable)
    }
}
