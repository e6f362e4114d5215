//! JSON Schema to table descriptor compiler.
//!
//! # Layout rules
//!
//! - Declared key properties become the root's OWN key columns
//! - Object properties are flattened into the same table as `parent.child`
//! - Array properties spawn a child table one level deeper carrying the
//!   root's keys (`_root_<name>`), keys of keyed intermediates
//!   (`_parent_<name>`) and one `_level_<depth>` position per array depth
//! - Scalars (and scalar array items) become a single `value` column
//!
//! Array item schemas may declare their own `key_properties`; those become
//! OWN keys of the child table and propagate to its descendants.

use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::info;

use super::types::{NodeKind, classify, resolve_storage_type};
use super::{CompileError, CompileOptions, CompileResult};
use crate::models::{KeyColumn, ScalarType, StorageType, TableDescriptor, ValueColumn};
use crate::naming::table_name_from_segments;

/// Table name segment used for items of a directly nested array
const NESTED_ITEM_SEGMENT: &str = "item";

/// Keyword declaring OWN keys on an array item schema
const ITEM_KEY_PROPERTIES: &str = "key_properties";

/// Position of a table in the tree under construction
#[derive(Debug, Clone)]
struct Scope {
    segments: Vec<String>,
    source_path: String,
    depth: usize,
    /// ROOT_REF and PARENT_REF columns inherited from ancestors
    inherited: Vec<KeyColumn>,
}

/// Compiler from JSON Schema to descriptor trees
#[derive(Debug, Clone, Default)]
pub struct SchemaCompiler {
    options: CompileOptions,
}

impl SchemaCompiler {
    /// Create a compiler with the given options
    pub fn new(options: CompileOptions) -> Self {
        Self { options }
    }

    /// Compile a stream schema.
    ///
    /// # Arguments
    ///
    /// * `stream` - Stream name, used as the root table name
    /// * `schema` - JSON Schema of one record
    /// * `key_properties` - Top-level properties forming the root's identity
    /// * `cleaning_column` - Optional root column driving purge-before-insert
    ///
    /// # Returns
    ///
    /// The root descriptor, or the first compilation error found.
    pub fn compile(
        &self,
        stream: &str,
        schema: &Value,
        key_properties: &[String],
        cleaning_column: Option<&str>,
    ) -> CompileResult<TableDescriptor> {
        if let Some(column) = cleaning_column
            && self.options.direct_insert
        {
            return Err(CompileError::ConflictingCleaning {
                column: column.to_string(),
            });
        }

        let scope = Scope {
            segments: vec![stream.to_string()],
            source_path: stream.to_string(),
            depth: 0,
            inherited: Vec::new(),
        };
        let mut root = self.build_table(&scope, schema, false, key_properties, Vec::new())?;

        if let Some(column) = cleaning_column {
            let known = root.key_columns.iter().any(|k| k.name == column)
                || root.column(column).is_some();
            if !known {
                return Err(CompileError::UnknownCleaningColumn(column.to_string()));
            }
            root.cleaning_column = Some(column.to_string());
        }

        let mut seen = HashSet::new();
        for table in root.walk() {
            if !seen.insert(table.table_name.as_str()) {
                return Err(CompileError::DuplicateTable(table.table_name.clone()));
            }
        }

        info!(
            "Compiled schema for stream '{}': {} tables, {} key columns at root",
            stream,
            seen.len(),
            root.key_columns.len()
        );
        Ok(root)
    }

    fn build_table(
        &self,
        scope: &Scope,
        element: &Value,
        element_nullable: bool,
        own_key_properties: &[String],
        array_path: Vec<String>,
    ) -> CompileResult<TableDescriptor> {
        let info = classify(&scope.source_path, element)?;
        let nullable = element_nullable || info.nullable;

        let mut key_columns = scope.inherited.clone();
        key_columns.extend((1..=scope.depth).map(KeyColumn::level_index));
        let mut columns = Vec::new();
        let mut children = Vec::new();

        match info.kind {
            NodeKind::Object => {
                let properties = info.properties();
                let own = self.own_keys(scope, properties, own_key_properties)?;

                let mut descendant_refs = scope.inherited.clone();
                if scope.depth == 0 {
                    descendant_refs.extend(own.iter().map(KeyColumn::root_ref));
                } else {
                    descendant_refs.extend(own.iter().map(KeyColumn::parent_ref));
                }
                key_columns.extend(own);

                match properties {
                    Some(properties) => self.flatten(
                        scope,
                        &descendant_refs,
                        properties,
                        &[],
                        nullable,
                        own_key_properties,
                        &mut columns,
                        &mut children,
                    )?,
                    None => columns.push(json_column(Vec::new(), nullable)),
                }
            }
            NodeKind::Array => {
                reject_keys(own_key_properties, "element is an array")?;
                let items = items_of(&scope.source_path, info.schema)?;
                children.push(self.child_table(scope, &scope.inherited, &[], items)?);
            }
            NodeKind::Scalar(scalar) => {
                reject_keys(own_key_properties, "element is a scalar")?;
                let storage = resolve_storage_type(&scope.source_path, scalar, &info, &self.options)?;
                columns.push(
                    ValueColumn::new(Vec::new(), scalar, storage, nullable)
                        .with_format(info.format().map(|f| f.to_string())),
                );
            }
        }

        let table = TableDescriptor {
            source_path: scope.source_path.clone(),
            table_name: table_name_from_segments(&scope.segments),
            array_path,
            depth: scope.depth,
            key_columns,
            columns,
            children,
            cleaning_column: None,
        };

        if table.key_columns.is_empty() && table.columns.is_empty() && table.children.is_empty() {
            return Err(CompileError::EmptyTable {
                path: scope.source_path.clone(),
            });
        }
        check_unique_columns(&table)?;
        Ok(table)
    }

    #[allow(clippy::too_many_arguments)]
    fn flatten(
        &self,
        scope: &Scope,
        descendant_refs: &[KeyColumn],
        properties: &Map<String, Value>,
        prefix: &[String],
        nullable: bool,
        skip: &[String],
        columns: &mut Vec<ValueColumn>,
        children: &mut Vec<TableDescriptor>,
    ) -> CompileResult<()> {
        for (name, node) in properties {
            if prefix.is_empty() && skip.contains(name) {
                continue;
            }
            let mut path = prefix.to_vec();
            path.push(name.clone());
            let dotted = format!("{}.{}", scope.source_path, path.join("."));

            let info = classify(&dotted, node)?;
            let nullable = nullable || info.nullable;

            match info.kind {
                NodeKind::Object => match info.properties() {
                    Some(nested) => self.flatten(
                        scope,
                        descendant_refs,
                        nested,
                        &path,
                        nullable,
                        &[],
                        columns,
                        children,
                    )?,
                    None => columns.push(json_column(path, nullable)),
                },
                NodeKind::Array => {
                    let items = items_of(&dotted, info.schema)?;
                    children.push(self.child_table(scope, descendant_refs, &path, items)?);
                }
                NodeKind::Scalar(scalar) => {
                    let storage = resolve_storage_type(&dotted, scalar, &info, &self.options)?;
                    columns.push(
                        ValueColumn::new(path, scalar, storage, nullable)
                            .with_format(info.format().map(|f| f.to_string())),
                    );
                }
            }
        }
        Ok(())
    }

    fn child_table(
        &self,
        scope: &Scope,
        inherited: &[KeyColumn],
        path: &[String],
        items: &Value,
    ) -> CompileResult<TableDescriptor> {
        let mut segments = scope.segments.clone();
        let source_path = if path.is_empty() {
            segments.push(NESTED_ITEM_SEGMENT.to_string());
            format!("{}[]", scope.source_path)
        } else {
            segments.extend(path.iter().cloned());
            format!("{}.{}", scope.source_path, path.join("."))
        };

        let own_key_properties: Vec<String> = items
            .get(ITEM_KEY_PROPERTIES)
            .and_then(|v| v.as_array())
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| k.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let child_scope = Scope {
            segments,
            source_path,
            depth: scope.depth + 1,
            inherited: inherited.to_vec(),
        };
        self.build_table(&child_scope, items, false, &own_key_properties, path.to_vec())
    }

    fn own_keys(
        &self,
        scope: &Scope,
        properties: Option<&Map<String, Value>>,
        key_properties: &[String],
    ) -> CompileResult<Vec<KeyColumn>> {
        let mut keys = Vec::with_capacity(key_properties.len());
        for property in key_properties {
            let node = properties
                .and_then(|p| p.get(property))
                .ok_or_else(|| CompileError::InvalidKey {
                    property: property.clone(),
                    reason: format!("not a top-level property of '{}'", scope.source_path),
                })?;
            let path = format!("{}.{}", scope.source_path, property);
            let info = classify(&path, node)?;
            let scalar = match info.kind {
                NodeKind::Scalar(s) if s != ScalarType::Json => s,
                _ => {
                    return Err(CompileError::InvalidKey {
                        property: property.clone(),
                        reason: "key properties must be scalar".to_string(),
                    });
                }
            };
            let storage = resolve_storage_type(&path, scalar, &info, &self.options)?;
            keys.push(KeyColumn::own(property, storage, scope.depth));
        }
        Ok(keys)
    }
}

/// Compile a stream schema with the given options.
///
/// Convenience wrapper around [`SchemaCompiler::compile`].
pub fn compile_schema(
    stream: &str,
    schema: &Value,
    key_properties: &[String],
    cleaning_column: Option<&str>,
    options: &CompileOptions,
) -> CompileResult<TableDescriptor> {
    SchemaCompiler::new(options.clone()).compile(stream, schema, key_properties, cleaning_column)
}

fn json_column(path: Vec<String>, nullable: bool) -> ValueColumn {
    ValueColumn::new(path, ScalarType::Json, StorageType::String, nullable)
}

fn items_of<'a>(path: &str, schema: &'a Map<String, Value>) -> CompileResult<&'a Value> {
    schema.get("items").ok_or_else(|| CompileError::InvalidSchema {
        path: path.to_string(),
        reason: "array without items".to_string(),
    })
}

fn reject_keys(key_properties: &[String], reason: &str) -> CompileResult<()> {
    match key_properties.first() {
        Some(property) => Err(CompileError::InvalidKey {
            property: property.clone(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

fn check_unique_columns(table: &TableDescriptor) -> CompileResult<()> {
    let mut seen = HashSet::new();
    for name in table.insert_columns() {
        if !seen.insert(name.clone()) {
            return Err(CompileError::DuplicateColumn {
                table: table.table_name.clone(),
                column: name,
            });
        }
    }
    Ok(())
}
