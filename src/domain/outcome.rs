//! Per-item result codes and outcome maps.
//!
//! Mutations report one numeric code per identifier; reads report either a
//! row (or grouped sub-map) or a code. The numeric values are part of the
//! public contract and must never be renumbered.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// Stable numeric outcome for a single item or batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "i8")]
pub enum ResultCode {
    /// The operation succeeded.
    Ok,
    /// The identifier matched no row.
    NotFound,
    /// The row exists and overriding was not allowed.
    AlreadyExists,
    /// A create could not resolve every declared settable column.
    MissingInputs,
    /// Update-only was requested and the row is absent.
    UpdateOnlyMissing,
    /// A referenced row is missing (foreign key violation).
    ForeignKeyMissing,
    /// The type declares no move columns; the move was a no-op.
    NoMoveColumns,
    /// The query executor was unreachable or failed; retryable upstream.
    Infrastructure,
}

impl ResultCode {
    pub fn as_i8(self) -> i8 {
        match self {
            Self::Ok => 0,
            Self::NotFound => 1,
            Self::AlreadyExists => 2,
            Self::MissingInputs => 3,
            Self::UpdateOnlyMissing => 4,
            Self::ForeignKeyMissing => 5,
            Self::NoMoveColumns => 6,
            Self::Infrastructure => -1,
        }
    }
}

impl From<ResultCode> for i8 {
    fn from(code: ResultCode) -> Self {
        code.as_i8()
    }
}

/// One entry of a read result: a row, a grouped sub-map, or a code.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ItemValue {
    Row(Value),
    Code(ResultCode),
}

impl ItemValue {
    pub fn as_row(&self) -> Option<&Value> {
        match self {
            Self::Row(value) => Some(value),
            Self::Code(_) => None,
        }
    }

    pub fn as_code(&self) -> Option<ResultCode> {
        match self {
            Self::Row(_) => None,
            Self::Code(code) => Some(*code),
        }
    }
}

/// Read result: identifier (or group prefix) → row or code.
pub type ReadOutcome = BTreeMap<String, ItemValue>;

/// Write result: identifier → code.
pub type WriteOutcomeMap = BTreeMap<String, ResultCode>;
