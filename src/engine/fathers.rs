//! Father cascade invalidator.
//!
//! Mutating a child row touches every declared ancestor's
//! modification-timestamp and drops the ancestors' cache entries, so stale
//! parent aggregates can never outlive a child change. The touch is one
//! batched update joining all ancestor tables on their shared leading key
//! columns; cache invalidation covers every distinct ancestor identifier
//! implied by the mutated children's key prefixes.

use serde_json::Value;
use time::OffsetDateTime;

use crate::domain::query::{Assignment, Condition, JoinTable, Row, TableExpr, WriteOptions};
use crate::domain::schema::TypeDescriptor;
use crate::infra::executor::{ExecError, QueryExecutor};

use super::cache::CacheOrchestrator;
use super::identifier::{ID_SEPARATOR, key_part};

/// Touch all ancestors of the given child rows and invalidate their cache
/// entries. A type without ancestors is a no-op.
pub async fn cascade(
    executor: &dyn QueryExecutor,
    cache: &CacheOrchestrator,
    desc: &TypeDescriptor,
    rows: &[Row],
    dry_run: bool,
) -> Result<(), ExecError> {
    if desc.fathers.is_empty() || rows.is_empty() {
        return Ok(());
    }

    let mut tuples: Vec<Vec<Value>> = Vec::new();
    for row in rows {
        if let Some(tuple) = super::identifier::key_tuple(desc, row) {
            if !tuples.contains(&tuple) {
                tuples.push(tuple);
            }
        }
    }
    if tuples.is_empty() {
        return Ok(());
    }

    let join = TableExpr::Join(
        desc.fathers
            .iter()
            .map(|father| JoinTable {
                table: father.table.clone(),
                key_columns: desc.key_columns[..father.key_count].to_vec(),
            })
            .collect(),
    );
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let assignments: Vec<Assignment> = desc
        .fathers
        .iter()
        .map(|father| {
            Assignment::qualified(&father.table, &father.modified_column, Value::from(now))
        })
        .collect();
    let condition = Condition::InTuples {
        columns: desc.key_columns.clone(),
        tuples: tuples.clone(),
    };

    if dry_run {
        return Ok(());
    }

    executor
        .update(&join, &assignments, &condition, &WriteOptions::default())
        .await?;

    let mut entries: Vec<(String, String)> = Vec::new();
    for father in &desc.fathers {
        for tuple in &tuples {
            let prefix = tuple
                .iter()
                .take(father.key_count)
                .map(key_part)
                .collect::<Vec<_>>()
                .join(&ID_SEPARATOR.to_string());
            let entry = (father.cache_name.clone(), prefix);
            if !entries.contains(&entry) {
                entries.push(entry);
            }
        }
    }
    cache.invalidate_ancestors(entries).await;
    Ok(())
}
