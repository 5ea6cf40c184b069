//! Identifier and cache-key codec.
//!
//! A row's identifier is its ordered key values joined by `/`: primary key
//! columns first, then any extra key columns present on the row. The same
//! string keys the in-memory result maps and suffixes the cache namespace,
//! so identical key values must always serialize identically — key parts go
//! through [`key_part`] and nothing else.

use serde_json::Value;

use crate::domain::query::Row;
use crate::domain::schema::TypeDescriptor;

pub const ID_SEPARATOR: char = '/';
const CACHE_SEPARATOR: char = ':';
const META_SUFFIX: &str = "@meta";

/// Canonical string form of one key value.
pub fn key_part(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Full identifier of a row: primary keys plus any extra key parts present.
/// `None` when a primary key column is absent.
pub fn id_from_row(desc: &TypeDescriptor, row: &Row) -> Option<String> {
    let mut parts = Vec::with_capacity(desc.key_columns.len() + desc.extra_key_columns.len());
    for column in &desc.key_columns {
        parts.push(key_part(row.get(column)?));
    }
    for column in &desc.extra_key_columns {
        if let Some(value) = row.get(column) {
            parts.push(key_part(value));
        }
    }
    Some(parts.join(&ID_SEPARATOR.to_string()))
}

/// Primary key tuple of a row, used for IN-style batch conditions. Extra
/// key columns never participate in equality filtering.
pub fn key_tuple(desc: &TypeDescriptor, row: &Row) -> Option<Vec<Value>> {
    desc.key_columns
        .iter()
        .map(|column| row.get(column).cloned())
        .collect()
}

/// Leading `n` key values of a row, joined; the outer key of grouped reads.
pub fn group_prefix(desc: &TypeDescriptor, row: &Row, n: usize) -> Option<String> {
    let mut parts = Vec::with_capacity(n);
    for column in desc.key_columns.iter().take(n) {
        parts.push(key_part(row.get(column)?));
    }
    Some(parts.join(&ID_SEPARATOR.to_string()))
}

/// Identifier of a row inside its group: everything after the first `n`
/// key values.
pub fn group_remainder(desc: &TypeDescriptor, row: &Row, n: usize) -> Option<String> {
    let mut parts = Vec::new();
    for column in desc.key_columns.iter().skip(n) {
        parts.push(key_part(row.get(column)?));
    }
    for column in &desc.extra_key_columns {
        if let Some(value) = row.get(column) {
            parts.push(key_part(value));
        }
    }
    Some(parts.join(&ID_SEPARATOR.to_string()))
}

/// Cache key of one row's entry.
pub fn item_cache_key(cache_name: &str, id: &str) -> String {
    format!("{cache_name}{CACHE_SEPARATOR}{id}")
}

/// Cache key of the type-wide get-all entry.
pub fn all_cache_key(cache_name: &str) -> String {
    cache_name.to_string()
}

/// Cache key of the aggregation metadata entry.
pub fn meta_cache_key(cache_name: &str) -> String {
    format!("{cache_name}{CACHE_SEPARATOR}{META_SUFFIX}")
}

/// Split an identifier back into its parts.
pub fn split_id(id: &str) -> Vec<&str> {
    id.split(ID_SEPARATOR).collect()
}
