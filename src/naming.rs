//! Identifier and literal rendering for generated SQL.
//!
//! Every table and column name that reaches the store passes through this
//! module. Names derived from schema paths are sanitized segment by segment,
//! joined with a double underscore, and bounded to [`MAX_TABLE_NAME_LENGTH`]
//! characters. Overlong names keep a readable prefix and gain a short content
//! hash so two different paths never truncate to the same identifier.
//!
//! # Security
//!
//! Identifiers are always emitted backtick-quoted and literals single-quoted
//! with backslash escaping, so record content can never terminate a statement.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Maximum length for generated table names
pub const MAX_TABLE_NAME_LENGTH: usize = 64;

/// Separator placed between path segments of a derived table name
pub const TABLE_PATH_SEPARATOR: &str = "__";

/// Number of hex characters of the content hash appended to truncated names
const HASH_SUFFIX_LENGTH: usize = 8;

/// Quote an identifier for use in a statement.
///
/// # Examples
///
/// ```
/// use data_modelling_sink::naming::quote_identifier;
///
/// assert_eq!(quote_identifier("users"), "`users`");
/// assert_eq!(quote_identifier("address.city"), "`address.city`");
/// ```
pub fn quote_identifier(name: &str) -> String {
    let escaped = name.replace('\\', "\\\\").replace('`', "\\`");
    format!("`{}`", escaped)
}

/// Reverse [`quote_identifier`].
///
/// Returns `None` when `quoted` is not a complete backtick-quoted identifier.
pub fn unquote_identifier(quoted: &str) -> Option<String> {
    let inner = quoted.strip_prefix('`')?.strip_suffix('`')?;
    let mut name = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => name.push(chars.next()?),
            '`' => return None,
            other => name.push(other),
        }
    }
    Some(name)
}

/// Replace every character that is not alphanumeric or `_` with `_`.
///
/// An empty segment becomes a single underscore so joined names keep their
/// segment boundaries.
pub fn sanitize_segment(segment: &str) -> String {
    if segment.is_empty() {
        return "_".to_string();
    }
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Build a bounded table name from path segments.
///
/// # Examples
///
/// ```
/// use data_modelling_sink::naming::table_name_from_segments;
///
/// let name = table_name_from_segments(&["users", "tags"]);
/// assert_eq!(name, "users__tags");
/// ```
pub fn table_name_from_segments<S: AsRef<str>>(segments: &[S]) -> String {
    let joined = segments
        .iter()
        .map(|s| sanitize_segment(s.as_ref()))
        .collect::<Vec<_>>()
        .join(TABLE_PATH_SEPARATOR);
    bound_identifier(&joined, MAX_TABLE_NAME_LENGTH)
}

/// Bound an identifier to `max_len` characters.
///
/// Names that fit are returned unchanged. Longer names are cut and suffixed
/// with `_` plus the first eight hex characters of the SHA-256 of the full
/// name.
pub fn bound_identifier(name: &str, max_len: usize) -> String {
    if name.chars().count() <= max_len {
        return name.to_string();
    }

    let digest = format!("{:x}", Sha256::digest(name.as_bytes()));
    let keep = max_len.saturating_sub(HASH_SUFFIX_LENGTH + 1);
    let prefix: String = name.chars().take(keep).collect();
    format!("{}_{}", prefix, &digest[..HASH_SUFFIX_LENGTH])
}

/// Render a JSON value as a SQL literal.
///
/// Booleans become `1`/`0` to match the `UInt8` storage of boolean columns;
/// nested arrays and objects are rendered as quoted JSON text.
pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_string(s),
        other => quote_string(&other.to_string()),
    }
}

/// Render a tuple of values, e.g. `(1, 'a')`.
pub fn sql_tuple<'a, I>(values: I) -> String
where
    I: IntoIterator<Item = &'a Value>,
{
    let rendered: Vec<String> = values.into_iter().map(sql_literal).collect();
    format!("({})", rendered.join(", "))
}

/// Render a parenthesised, comma separated list of quoted identifiers.
pub fn identifier_tuple<S: AsRef<str>>(names: &[S]) -> String {
    let quoted: Vec<String> = names.iter().map(|n| quote_identifier(n.as_ref())).collect();
    format!("({})", quoted.join(", "))
}

fn quote_string(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}
