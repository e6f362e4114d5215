//! Enums shared by the table descriptor model
//!
//! # Serde Casing Conventions
//!
//! - `SCREAMING_SNAKE_CASE`: key roles, matching how they are named in logs
//! - `lowercase`: JSON Schema scalar type keywords

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role a key column plays in its table.
///
/// The declaration order of the variants is the fixed column order used for
/// DDL, `ORDER BY` and row serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyRole {
    /// Root's own key copied into a descendant (`_root_<name>`)
    RootRef,
    /// Keyed intermediate ancestor's own key (`_parent_<name>`)
    ParentRef,
    /// Position within the parent array at one nesting depth (`_level_<depth>`)
    LevelIndex,
    /// Declared identity of this table
    Own,
}

impl fmt::Display for KeyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KeyRole::RootRef => "ROOT_REF",
            KeyRole::ParentRef => "PARENT_REF",
            KeyRole::LevelIndex => "LEVEL_INDEX",
            KeyRole::Own => "OWN",
        };
        write!(f, "{}", s)
    }
}

/// Scalar JSON type a value column is extracted as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    String,
    Integer,
    Number,
    Boolean,
    /// Object without declared properties, stored as JSON text
    Json,
}

impl FromStr for ScalarType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(ScalarType::String),
            "integer" => Ok(ScalarType::Integer),
            "number" => Ok(ScalarType::Number),
            "boolean" => Ok(ScalarType::Boolean),
            "json" => Ok(ScalarType::Json),
            _ => Err(format!("Unknown scalar type: {}", s)),
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScalarType::String => "string",
            ScalarType::Integer => "integer",
            ScalarType::Number => "number",
            ScalarType::Boolean => "boolean",
            ScalarType::Json => "json",
        };
        write!(f, "{}", s)
    }
}

/// Storage type of a column in the columnar store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    String,
    Date,
    DateTime,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt32,
    UInt64,
    Decimal { precision: u8, scale: u8 },
}

impl StorageType {
    /// Type name as used in DDL, wrapped in `Nullable(..)` when requested
    pub fn sql_type(&self, nullable: bool) -> String {
        if nullable {
            format!("Nullable({})", self)
        } else {
            self.to_string()
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageType::String => write!(f, "String"),
            StorageType::Date => write!(f, "Date"),
            StorageType::DateTime => write!(f, "DateTime"),
            StorageType::Int16 => write!(f, "Int16"),
            StorageType::Int32 => write!(f, "Int32"),
            StorageType::Int64 => write!(f, "Int64"),
            StorageType::UInt8 => write!(f, "UInt8"),
            StorageType::UInt32 => write!(f, "UInt32"),
            StorageType::UInt64 => write!(f, "UInt64"),
            StorageType::Decimal { precision, scale } => {
                write!(f, "Decimal({}, {})", precision, scale)
            }
        }
    }
}
