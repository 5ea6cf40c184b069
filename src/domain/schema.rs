//! Declarative per-type metadata.
//!
//! A [`TypeDescriptor`] is the whole contract between a logical object type
//! and the engine: table, key layout, settable columns, filters,
//! aggregations, locking, ancestor cascades and cache naming. Descriptors
//! are validated once when the registry is built and are read-only
//! afterwards; a call may merge a [`SchemaOverride`] into a private copy,
//! never into the registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::error::EngineError;
use super::query::{CmpOp, Condition, Row, SelectColumn};
use super::value::ColumnKind;

/// Computes a column value from the full input row, e.g. a slug derived
/// from a name. Returning `None` defers to the next resolution step.
pub type DeriveFn = Arc<dyn Fn(&Row) -> Option<Value> + Send + Sync>;

/// Builds a custom condition from the caller-supplied activation value,
/// replacing the filter's declared column/operator pair.
pub type FilterFn = Arc<dyn Fn(&Value) -> Condition + Send + Sync>;

/// A settable column of a type.
#[derive(Clone)]
pub struct SetColumn {
    pub kind: ColumnKind,
    /// Used on create when nothing else resolves the column.
    pub default: Option<Value>,
    /// Always wins over caller input.
    pub forced: Option<Value>,
    pub derive: Option<DeriveFn>,
    /// Column stores a JSON document; updates deep-merge instead of replace.
    pub is_json: bool,
    /// Caller input equal to this sentinel clears the column to NULL.
    pub null_sentinel: Option<Value>,
}

impl SetColumn {
    pub fn new(kind: ColumnKind) -> Self {
        Self {
            kind,
            default: None,
            forced: None,
            derive: None,
            is_json: false,
            null_sentinel: None,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn forced(mut self, value: Value) -> Self {
        self.forced = Some(value);
        self
    }

    pub fn json(mut self) -> Self {
        self.is_json = true;
        self
    }
}

impl fmt::Debug for SetColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetColumn")
            .field("kind", &self.kind)
            .field("default", &self.default)
            .field("forced", &self.forced)
            .field("derive", &self.derive.as_ref().map(|_| "<fn>"))
            .field("is_json", &self.is_json)
            .field("null_sentinel", &self.null_sentinel)
            .finish()
    }
}

/// A named, declaratively activated filter.
#[derive(Clone)]
pub struct ColumnFilter {
    pub column: String,
    pub op: CmpOp,
    /// Activation value used when the caller passes none and the filter is
    /// always applied.
    pub default: Option<Value>,
    /// Apply even when the caller did not name this filter.
    pub always_apply: bool,
    pub predicate: Option<FilterFn>,
}

impl ColumnFilter {
    pub fn new(column: impl Into<String>, op: CmpOp) -> Self {
        Self {
            column: column.into(),
            op,
            default: None,
            always_apply: false,
            predicate: None,
        }
    }

    pub fn always(mut self, default: Value) -> Self {
        self.always_apply = true;
        self.default = Some(default);
        self
    }
}

impl fmt::Debug for ColumnFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnFilter")
            .field("column", &self.column)
            .field("op", &self.op)
            .field("default", &self.default)
            .field("always_apply", &self.always_apply)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// A named server-side aggregation computed alongside a bulk read.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtraToGet {
    Count,
    Min(String),
    Max(String),
    Sum(String),
    Distinct(String),
    DistinctMultiple(Vec<String>),
    CountInterval { column: String, width: i64 },
    Custom { columns: Vec<SelectColumn>, condition: Condition },
}

/// Advisory lock configuration. Per-type tuning falls back to the
/// engine-wide defaults when unset.
#[derive(Debug, Clone, PartialEq)]
pub struct LockColumns {
    pub lock_column: String,
    pub time_column: String,
    pub attempts: Option<u32>,
    pub delay_ms: Option<u64>,
    pub stale_after_secs: Option<i64>,
}

impl LockColumns {
    pub fn new(lock_column: impl Into<String>, time_column: impl Into<String>) -> Self {
        Self {
            lock_column: lock_column.into(),
            time_column: time_column.into(),
            attempts: None,
            delay_ms: None,
            stale_after_secs: None,
        }
    }
}

/// One level of the ancestor chain.
#[derive(Debug, Clone, PartialEq)]
pub struct FatherDetail {
    pub table: String,
    /// Cache name of the ancestor type; its entries are invalidated when a
    /// child row changes.
    pub cache_name: String,
    /// Leading key columns (of the child's key tuple) identifying one row
    /// of this ancestor.
    pub key_count: usize,
    /// The ancestor's modification-timestamp column, touched by cascades.
    pub modified_column: String,
}

impl FatherDetail {
    pub fn new(
        table: impl Into<String>,
        cache_name: impl Into<String>,
        key_count: usize,
    ) -> Self {
        Self {
            table: table.into(),
            cache_name: cache_name.into(),
            key_count,
            modified_column: "Modified".to_string(),
        }
    }
}

/// Full static description of one object type.
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    pub name: String,
    pub table: String,
    pub key_columns: Vec<String>,
    /// Key parts participating in uniqueness but excluded from equality
    /// filtering (one-to-many discriminators).
    pub extra_key_columns: Vec<String>,
    /// Minimum number of leading keys a stub must carry.
    pub min_key_num: usize,
    pub auto_increment: bool,
    pub set_columns: BTreeMap<String, SetColumn>,
    pub column_filters: BTreeMap<String, ColumnFilter>,
    pub extra_to_get: BTreeMap<String, ExtraToGet>,
    /// Columns mutable through the move/rename operation.
    pub move_columns: Vec<String>,
    pub lock: Option<LockColumns>,
    /// Ancestor chain, nearest first, with strictly decreasing key counts.
    pub fathers: Vec<FatherDetail>,
    /// When > 0, read results partition rows by their leading N key values.
    pub group_by_first_n_keys: usize,
    /// Cache namespace of this type; `None` disables caching entirely.
    pub cache_name: Option<String>,
    pub cache_ttl_secs: Option<u64>,
    pub safe_str_columns: Vec<String>,
    /// Get-all cache names of dependent child types, invalidated alongside
    /// this type's own entries on delete/move.
    pub child_cache_names: Vec<String>,
    /// Modification-timestamp column (unix seconds), touched on move and by
    /// ancestor cascades, and targeted by the common time filters.
    pub modified_column: Option<String>,
    /// Named logger selection; `None` uses the shared default.
    pub logger: Option<String>,
}

impl TypeDescriptor {
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        key_columns: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            key_columns,
            extra_key_columns: Vec::new(),
            min_key_num: 1,
            auto_increment: false,
            set_columns: BTreeMap::new(),
            column_filters: BTreeMap::new(),
            extra_to_get: BTreeMap::new(),
            move_columns: Vec::new(),
            lock: None,
            fathers: Vec::new(),
            group_by_first_n_keys: 0,
            cache_name: None,
            cache_ttl_secs: None,
            safe_str_columns: Vec::new(),
            child_cache_names: Vec::new(),
            modified_column: None,
            logger: None,
        }
    }

    /// All key columns in identifier order: primary keys, then extras.
    pub fn all_key_columns(&self) -> impl Iterator<Item = &String> {
        self.key_columns.iter().chain(self.extra_key_columns.iter())
    }

    pub fn is_safe_str(&self, column: &str) -> bool {
        self.safe_str_columns.iter().any(|c| c == column)
    }

    pub fn is_key_column(&self, column: &str) -> bool {
        self.all_key_columns().any(|c| c == column)
    }

    /// Validate structural invariants. Called once at registry build.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.key_columns.is_empty() {
            return Err(EngineError::invalid_descriptor(
                &self.name,
                "key_columns must not be empty",
            ));
        }
        if self.min_key_num == 0 || self.min_key_num > self.key_columns.len() {
            return Err(EngineError::invalid_descriptor(
                &self.name,
                format!(
                    "min_key_num {} out of range 1..={}",
                    self.min_key_num,
                    self.key_columns.len()
                ),
            ));
        }
        if self.group_by_first_n_keys >= self.key_columns.len() && self.group_by_first_n_keys != 0 {
            return Err(EngineError::invalid_descriptor(
                &self.name,
                "group_by_first_n_keys must be smaller than key_columns",
            ));
        }
        if self.fathers.len() > self.key_columns.len() - self.min_key_num {
            return Err(EngineError::invalid_descriptor(
                &self.name,
                "more ancestors than spare key columns",
            ));
        }
        let mut prev_count = usize::MAX;
        for father in &self.fathers {
            if father.key_count == 0 || father.key_count >= self.key_columns.len() {
                return Err(EngineError::invalid_descriptor(
                    &self.name,
                    format!("ancestor `{}` key_count out of range", father.table),
                ));
            }
            if father.key_count >= prev_count {
                return Err(EngineError::invalid_descriptor(
                    &self.name,
                    "ancestor key counts must strictly decrease",
                ));
            }
            prev_count = father.key_count;
        }
        if self.auto_increment && self.key_columns.len() != 1 {
            return Err(EngineError::invalid_descriptor(
                &self.name,
                "auto-increment types must have a single key column",
            ));
        }
        for column in &self.move_columns {
            if !self.set_columns.contains_key(column) && !self.is_key_column(column) {
                return Err(EngineError::invalid_descriptor(
                    &self.name,
                    format!("move column `{column}` is not declared"),
                ));
            }
        }
        for column in &self.safe_str_columns {
            let declared = self.set_columns.contains_key(column) || self.is_key_column(column);
            if !declared {
                return Err(EngineError::invalid_descriptor(
                    &self.name,
                    format!("safe-string column `{column}` is not declared"),
                ));
            }
        }
        for (name, extra) in &self.extra_to_get {
            self.validate_extra(name, extra)?;
        }
        Ok(())
    }

    fn validate_extra(&self, name: &str, extra: &ExtraToGet) -> Result<(), EngineError> {
        match extra {
            ExtraToGet::CountInterval { width, .. } if *width <= 0 => Err(
                EngineError::invalid_aggregation(&self.name, name, "interval width must be > 0"),
            ),
            ExtraToGet::DistinctMultiple(columns) if columns.len() < 2 => {
                Err(EngineError::invalid_aggregation(
                    &self.name,
                    name,
                    "distinct-multiple needs at least two columns",
                ))
            }
            ExtraToGet::Custom { columns, .. } if columns.is_empty() => Err(
                EngineError::invalid_aggregation(&self.name, name, "custom select is empty"),
            ),
            _ => Ok(()),
        }
    }

    /// Clone this descriptor with a call-scoped override merged in.
    pub fn with_override(&self, ov: &SchemaOverride) -> TypeDescriptor {
        let mut merged = self.clone();
        if let Some(table) = &ov.table {
            merged.table = table.clone();
        }
        if let Some(cache_name) = &ov.cache_name {
            merged.cache_name = Some(cache_name.clone());
        }
        if let Some(ttl) = ov.cache_ttl_secs {
            merged.cache_ttl_secs = Some(ttl);
        }
        for (column, value) in &ov.forced_values {
            if let Some(set) = merged.set_columns.get_mut(column) {
                set.forced = Some(value.clone());
            }
        }
        for (name, filter) in &ov.extra_filters {
            merged.column_filters.insert(name.clone(), filter.clone());
        }
        merged
    }
}

/// Call-scoped, non-persistent descriptor override.
///
/// Every overridable knob is enumerated here; there is no open-ended field
/// injection.
#[derive(Debug, Clone, Default)]
pub struct SchemaOverride {
    pub table: Option<String>,
    pub cache_name: Option<String>,
    pub cache_ttl_secs: Option<u64>,
    pub forced_values: BTreeMap<String, Value>,
    pub extra_filters: Vec<(String, ColumnFilter)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn widget() -> TypeDescriptor {
        let mut desc = TypeDescriptor::new("widget", "widgets", vec!["ID".into()]);
        desc.set_columns
            .insert("Name".into(), SetColumn::new(ColumnKind::Str));
        desc.set_columns.insert(
            "Count".into(),
            SetColumn::new(ColumnKind::Int).with_default(json!(0)),
        );
        desc
    }

    #[test]
    fn valid_descriptor_passes() {
        assert!(widget().validate().is_ok());
    }

    #[test]
    fn empty_keys_rejected() {
        let desc = TypeDescriptor::new("broken", "t", vec![]);
        assert!(matches!(
            desc.validate(),
            Err(EngineError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn group_arity_must_stay_below_key_count() {
        let mut desc = TypeDescriptor::new("t", "t", vec!["A".into(), "B".into()]);
        desc.group_by_first_n_keys = 2;
        assert!(desc.validate().is_err());
        desc.group_by_first_n_keys = 1;
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn ancestor_chain_is_bounded_by_spare_keys() {
        let mut desc = TypeDescriptor::new("t", "t", vec!["A".into(), "B".into()]);
        desc.fathers.push(FatherDetail::new("parents", "parent", 1));
        assert!(desc.validate().is_ok());

        desc.fathers
            .push(FatherDetail::new("grandparents", "grandparent", 1));
        assert!(desc.validate().is_err());
    }

    #[test]
    fn ancestor_key_counts_decrease() {
        let mut desc =
            TypeDescriptor::new("t", "t", vec!["A".into(), "B".into(), "C".into()]);
        desc.fathers.push(FatherDetail::new("p1", "p1", 1));
        desc.fathers.push(FatherDetail::new("p2", "p2", 2));
        assert!(desc.validate().is_err());
    }

    #[test]
    fn undeclared_move_column_rejected() {
        let mut desc = widget();
        desc.move_columns.push("Missing".into());
        assert!(desc.validate().is_err());
    }

    #[test]
    fn interval_width_must_be_positive() {
        let mut desc = widget();
        desc.extra_to_get.insert(
            "histogram".into(),
            ExtraToGet::CountInterval {
                column: "Count".into(),
                width: 0,
            },
        );
        assert!(matches!(
            desc.validate(),
            Err(EngineError::InvalidAggregation { .. })
        ));
    }

    #[test]
    fn override_merges_without_touching_base() {
        let base = widget();
        let mut ov = SchemaOverride::default();
        ov.cache_ttl_secs = Some(7);
        ov.forced_values.insert("Name".into(), json!("forced"));

        let merged = base.with_override(&ov);
        assert_eq!(merged.cache_ttl_secs, Some(7));
        assert_eq!(
            merged.set_columns["Name"].forced.as_ref(),
            Some(&json!("forced"))
        );
        assert!(base.set_columns["Name"].forced.is_none());
        assert!(base.cache_ttl_secs.is_none());
    }
}
