//! Query condition translator.
//!
//! Builds the serializable condition AST from declared filters and call
//! parameters, and owns the one cacheability rule the cache orchestrator
//! relies on: a call that filters, orders or paginates never touches the
//! get-all entry.

use serde_json::Value;

use crate::domain::query::{CmpOp, Condition, Row, SelectOptions};
use crate::domain::schema::TypeDescriptor;

use super::identifier;
use super::params::ReadParams;

/// Condition derived from a type's filters and the call parameters, plus
/// whether the caller actively narrowed the result.
pub struct FilterSet {
    pub condition: Condition,
    /// True when a caller-activated filter or a common time filter is in
    /// play. Always-apply defaults alone do not count: they define the
    /// type's canonical result set.
    pub caller_filtered: bool,
}

/// Merge declared column filters with the common time filters.
pub fn build_filters(
    desc: &TypeDescriptor,
    activations: &std::collections::BTreeMap<String, Value>,
    newer_than: Option<i64>,
    older_than: Option<i64>,
) -> FilterSet {
    let mut parts: Vec<Condition> = Vec::new();
    let mut caller_filtered = false;

    for (name, filter) in &desc.column_filters {
        let activation = match activations.get(name) {
            Some(value) => {
                caller_filtered = true;
                Some(value.clone())
            }
            None if filter.always_apply => filter.default.clone(),
            None => None,
        };
        let Some(value) = activation else {
            continue;
        };
        let condition = match &filter.predicate {
            Some(predicate) => predicate(&value),
            None => Condition::Cmp {
                column: filter.column.clone(),
                op: filter.op,
                value,
            },
        };
        parts.push(condition);
    }

    if let Some(column) = &desc.modified_column {
        if let Some(floor) = newer_than {
            caller_filtered = true;
            parts.push(Condition::Cmp {
                column: column.clone(),
                op: CmpOp::Ge,
                value: Value::from(floor),
            });
        }
        if let Some(ceiling) = older_than {
            caller_filtered = true;
            parts.push(Condition::Cmp {
                column: column.clone(),
                op: CmpOp::Le,
                value: Value::from(ceiling),
            });
        }
    }

    FilterSet {
        condition: Condition::and(parts),
        caller_filtered,
    }
}

/// IN condition over the primary key tuples of the given stubs, deduped.
pub fn in_condition(desc: &TypeDescriptor, stubs: &[Row]) -> Condition {
    let mut tuples: Vec<Vec<Value>> = Vec::new();
    for stub in stubs {
        if let Some(tuple) = identifier::key_tuple(desc, stub) {
            if !tuples.contains(&tuple) {
                tuples.push(tuple);
            }
        }
    }
    Condition::InTuples {
        columns: desc.key_columns.clone(),
        tuples,
    }
}

/// Ordering and pagination of the call.
pub fn select_options(params: &ReadParams) -> SelectOptions {
    SelectOptions {
        order_by: params.order_by.clone(),
        limit: params.limit,
        offset: params.offset,
    }
}

/// The single cacheability precondition for get-all entries: no active
/// filter, no ordering, no pagination, no sub-item grouping.
pub fn is_full_result_cacheable(
    desc: &TypeDescriptor,
    params: &ReadParams,
    filters: &FilterSet,
) -> bool {
    !filters.caller_filtered && !params.has_pagination() && desc.group_by_first_n_keys == 0
}
