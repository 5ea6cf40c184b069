//! Per-call parameter bags.
//!
//! Every knob is an explicit field; there is no open-ended key/value
//! injection. Defaults describe the common path: an unfiltered read with
//! aggregation metadata, a create-or-reject write, live (non-dry-run)
//! mutations.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::domain::query::OrderDir;
use crate::domain::schema::SchemaOverride;

/// How `set_items` treats existing and absent rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Create new rows; an existing row is rejected with the
    /// exists-and-override-false code.
    #[default]
    Insert,
    /// Update existing rows only; an absent row is rejected.
    Update,
    /// Create or update, whichever applies.
    Override,
}

/// Parameters of a read call.
#[derive(Debug, Clone, Default)]
pub struct ReadParams {
    /// Named filter activations: filter name → activation value.
    pub filters: BTreeMap<String, Value>,
    /// Rows modified at or after this unix timestamp.
    pub newer_than: Option<i64>,
    /// Rows modified at or before this unix timestamp.
    pub older_than: Option<i64>,
    pub order_by: Vec<(String, OrderDir)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Skip the aggregation metadata phase even when the type declares
    /// `extra_to_get`.
    pub skip_meta: bool,
    pub schema_override: Option<SchemaOverride>,
    /// Suppress warning/error logging for expected failures.
    pub quiet: bool,
}

impl ReadParams {
    pub fn has_pagination(&self) -> bool {
        self.limit.is_some() || self.offset.is_some() || !self.order_by.is_empty()
    }
}

/// Parameters of a write call.
#[derive(Debug, Clone, Default)]
pub struct WriteParams {
    pub mode: WriteMode,
    /// Pre-acquired lock token; when set, the engine neither locks nor
    /// unlocks around the write.
    pub lock_token: Option<String>,
    pub schema_override: Option<SchemaOverride>,
    pub quiet: bool,
    pub dry_run: bool,
}

/// Parameters of a delete call.
#[derive(Debug, Clone, Default)]
pub struct DeleteParams {
    /// Extra named filter activations merged into the delete condition.
    pub filters: BTreeMap<String, Value>,
    pub schema_override: Option<SchemaOverride>,
    pub quiet: bool,
    pub dry_run: bool,
}

/// Parameters of a move/rename call.
#[derive(Debug, Clone, Default)]
pub struct MoveParams {
    pub schema_override: Option<SchemaOverride>,
    pub quiet: bool,
    pub dry_run: bool,
}
