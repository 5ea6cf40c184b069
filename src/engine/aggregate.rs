//! Aggregation compiler.
//!
//! Turns a type's `extra_to_get` requests into one UNIONed select — one
//! tagged sub-select per request, all sharing the call's base condition —
//! and reassembles the executor's rows into the structured metadata block
//! merged into read results under [`META_KEY`].

use serde_json::{Map, Value};

use crate::domain::query::{Condition, Row, SelectColumn, SelectOptions, SubSelect, TableExpr};
use crate::domain::schema::{ExtraToGet, TypeDescriptor};

/// Reserved result key carrying the aggregation metadata block.
pub const META_KEY: &str = "@meta";

const TAG_COLUMN: &str = "@tag";

/// Compile every aggregation request into one UNION expression.
pub fn compile(desc: &TypeDescriptor, base: &Condition) -> TableExpr {
    let subs = desc
        .extra_to_get
        .iter()
        .map(|(name, extra)| {
            let (columns, condition) = match extra {
                ExtraToGet::Count => (
                    vec![SelectColumn::Tag(name.clone()), SelectColumn::Count],
                    base.clone(),
                ),
                ExtraToGet::Min(column) => (
                    vec![
                        SelectColumn::Tag(name.clone()),
                        SelectColumn::Min(column.clone()),
                    ],
                    base.clone(),
                ),
                ExtraToGet::Max(column) => (
                    vec![
                        SelectColumn::Tag(name.clone()),
                        SelectColumn::Max(column.clone()),
                    ],
                    base.clone(),
                ),
                ExtraToGet::Sum(column) => (
                    vec![
                        SelectColumn::Tag(name.clone()),
                        SelectColumn::Sum(column.clone()),
                    ],
                    base.clone(),
                ),
                ExtraToGet::Distinct(column) => (
                    vec![
                        SelectColumn::Tag(name.clone()),
                        SelectColumn::Distinct(vec![column.clone()]),
                    ],
                    base.clone(),
                ),
                ExtraToGet::DistinctMultiple(columns) => (
                    vec![
                        SelectColumn::Tag(name.clone()),
                        SelectColumn::Distinct(columns.clone()),
                    ],
                    base.clone(),
                ),
                ExtraToGet::CountInterval { column, width } => (
                    vec![
                        SelectColumn::Tag(name.clone()),
                        SelectColumn::IntervalBucket {
                            column: column.clone(),
                            width: *width,
                        },
                    ],
                    base.clone(),
                ),
                ExtraToGet::Custom { columns, condition } => {
                    let mut cols = vec![SelectColumn::Tag(name.clone())];
                    cols.extend(columns.iter().cloned());
                    (
                        cols,
                        Condition::and(vec![base.clone(), condition.clone()]),
                    )
                }
            };
            SubSelect {
                table: desc.table.clone(),
                condition,
                columns,
                options: SelectOptions::default(),
            }
        })
        .collect();
    TableExpr::Union(subs)
}

/// Regroup UNION rows by their tag and shape each request's slice.
pub fn reassemble(desc: &TypeDescriptor, rows: Vec<Row>) -> Value {
    let mut meta = Map::new();
    for (name, extra) in &desc.extra_to_get {
        let slice: Vec<&Row> = rows
            .iter()
            .filter(|row| row.get(TAG_COLUMN).and_then(Value::as_str) == Some(name))
            .collect();
        meta.insert(name.clone(), shape(extra, &slice));
    }
    Value::Object(meta)
}

fn shape(extra: &ExtraToGet, rows: &[&Row]) -> Value {
    match extra {
        ExtraToGet::Count | ExtraToGet::Sum(_) => rows
            .first()
            .and_then(|row| row.get("value").cloned())
            .unwrap_or(Value::from(0)),
        ExtraToGet::Min(_) | ExtraToGet::Max(_) => rows
            .first()
            .and_then(|row| row.get("value").cloned())
            .unwrap_or(Value::Null),
        ExtraToGet::Distinct(column) => Value::Array(
            rows.iter()
                .filter_map(|row| row.get(column).cloned())
                .collect(),
        ),
        ExtraToGet::DistinctMultiple(_) | ExtraToGet::Custom { .. } => Value::Array(
            rows.iter()
                .map(|row| {
                    let mut object = (*row).clone();
                    object.remove(TAG_COLUMN);
                    Value::Object(object)
                })
                .collect(),
        ),
        ExtraToGet::CountInterval { .. } => {
            let mut buckets = Map::new();
            for row in rows {
                let Some(start) = row.get("bucket") else {
                    continue;
                };
                let count = row.get("value").cloned().unwrap_or(Value::from(0));
                buckets.insert(super::identifier::key_part(start), count);
            }
            Value::Object(buckets)
        }
    }
}
