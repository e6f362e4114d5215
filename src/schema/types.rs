//! JSON Schema node classification and storage type resolution

use serde_json::{Map, Value};

use super::{CompileError, CompileOptions, CompileResult};
use crate::models::{ScalarType, StorageType};

/// String formats stored as plain text
const TEXTUAL_STRING_FORMATS: &[&str] = &["email", "uri", "uuid", "hostname", "ipv4", "ipv6", "time"];

/// Largest precision the store accepts for `Decimal`
const MAX_DECIMAL_PRECISION: u64 = 76;

/// Structural kind of a schema node
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeKind {
    Object,
    Array,
    Scalar(ScalarType),
}

/// Classified schema node
#[derive(Debug, Clone)]
pub struct NodeInfo<'a> {
    pub kind: NodeKind,
    /// Whether `null` is an accepted value
    pub nullable: bool,
    /// Effective schema object (the selected branch for `anyOf`/`oneOf`)
    pub schema: &'a Map<String, Value>,
}

impl NodeInfo<'_> {
    /// Declared properties of an object node, if any
    pub fn properties(&self) -> Option<&Map<String, Value>> {
        self.schema.get("properties").and_then(|v| v.as_object())
    }

    /// Format hint
    pub fn format(&self) -> Option<&str> {
        self.schema.get("format").and_then(|v| v.as_str())
    }
}

/// Classify a schema node.
///
/// `anyOf`/`oneOf` with exactly one non-null branch resolve to that branch
/// and are nullable. A missing `type` is inferred from `properties` or
/// `items`; a node with neither is stored as JSON text.
pub fn classify<'a>(path: &str, node: &'a Value) -> CompileResult<NodeInfo<'a>> {
    let schema = node.as_object().ok_or_else(|| CompileError::InvalidSchema {
        path: path.to_string(),
        reason: "schema node must be an object".to_string(),
    })?;

    for combinator in ["anyOf", "oneOf"] {
        if let Some(branches) = schema.get(combinator).and_then(|v| v.as_array()) {
            let non_null: Vec<&Value> = branches.iter().filter(|b| !is_null_branch(b)).collect();
            if non_null.len() != 1 {
                return Err(CompileError::UnsupportedType {
                    path: path.to_string(),
                    type_name: combinator.to_string(),
                    format: None,
                });
            }
            let mut info = classify(path, non_null[0])?;
            info.nullable = true;
            return Ok(info);
        }
    }

    let (type_name, nullable) = match schema.get("type") {
        Some(Value::String(t)) => (Some(t.as_str()), false),
        Some(Value::Array(members)) => {
            let names: Vec<&str> = members.iter().filter_map(|m| m.as_str()).collect();
            let nullable = names.contains(&"null");
            let non_null: Vec<&str> = names.into_iter().filter(|n| *n != "null").collect();
            match non_null.as_slice() {
                [single] => (Some(*single), nullable),
                _ => {
                    return Err(CompileError::UnsupportedType {
                        path: path.to_string(),
                        type_name: non_null.join("|"),
                        format: None,
                    });
                }
            }
        }
        Some(_) => {
            return Err(CompileError::InvalidSchema {
                path: path.to_string(),
                reason: "type must be a string or an array of strings".to_string(),
            });
        }
        None => (None, false),
    };

    let kind = match type_name {
        Some("object") => NodeKind::Object,
        Some("array") => NodeKind::Array,
        Some(other) => {
            let scalar = other
                .parse::<ScalarType>()
                .ok()
                .filter(|s| *s != ScalarType::Json)
                .ok_or_else(|| CompileError::UnsupportedType {
                    path: path.to_string(),
                    type_name: other.to_string(),
                    format: None,
                })?;
            NodeKind::Scalar(scalar)
        }
        None if schema.contains_key("properties") => NodeKind::Object,
        None if schema.contains_key("items") => NodeKind::Array,
        None => NodeKind::Scalar(ScalarType::Json),
    };

    // Untyped nodes accept anything, including null
    let nullable = nullable || (type_name.is_none() && kind == NodeKind::Scalar(ScalarType::Json));

    Ok(NodeInfo {
        kind,
        nullable,
        schema,
    })
}

fn is_null_branch(branch: &Value) -> bool {
    branch.get("type").and_then(|t| t.as_str()) == Some("null")
}

/// Resolve the storage type of a scalar node.
///
/// # Arguments
///
/// * `path` - Dotted property path, used in errors
/// * `scalar` - Scalar JSON type
/// * `info` - Classified node carrying `format`, `precision` and `scale`
/// * `options` - Compile options with the default decimal precision/scale
pub fn resolve_storage_type(
    path: &str,
    scalar: ScalarType,
    info: &NodeInfo<'_>,
    options: &CompileOptions,
) -> CompileResult<StorageType> {
    let format = info.format();
    let unsupported = || CompileError::UnsupportedType {
        path: path.to_string(),
        type_name: scalar.to_string(),
        format: format.map(|f| f.to_string()),
    };

    match (scalar, format) {
        (ScalarType::String, None) => Ok(StorageType::String),
        (ScalarType::String, Some("date" | "custom-date")) => Ok(StorageType::Date),
        (ScalarType::String, Some("date-time")) => Ok(StorageType::DateTime),
        (ScalarType::String, Some(f)) if TEXTUAL_STRING_FORMATS.contains(&f) => {
            Ok(StorageType::String)
        }
        (ScalarType::Integer, None | Some("int32")) => Ok(StorageType::Int32),
        (ScalarType::Integer, Some("int16")) => Ok(StorageType::Int16),
        (ScalarType::Integer, Some("int64")) => Ok(StorageType::Int64),
        (ScalarType::Number, None) => decimal_type(path, info, options),
        (ScalarType::Boolean, None) => Ok(StorageType::UInt8),
        (ScalarType::Json, _) => Ok(StorageType::String),
        _ => Err(unsupported()),
    }
}

fn decimal_type(
    path: &str,
    info: &NodeInfo<'_>,
    options: &CompileOptions,
) -> CompileResult<StorageType> {
    let precision = info
        .schema
        .get("precision")
        .and_then(|v| v.as_u64())
        .unwrap_or(u64::from(options.decimal_precision));
    let scale = info
        .schema
        .get("scale")
        .and_then(|v| v.as_u64())
        .unwrap_or(u64::from(options.decimal_scale));

    if precision == 0 || precision > MAX_DECIMAL_PRECISION || scale > precision {
        return Err(CompileError::InvalidSchema {
            path: path.to_string(),
            reason: format!("invalid decimal precision/scale {}/{}", precision, scale),
        });
    }

    // Both bounded by MAX_DECIMAL_PRECISION above
    Ok(StorageType::Decimal {
        precision: precision as u8,
        scale: scale as u8,
    })
}
