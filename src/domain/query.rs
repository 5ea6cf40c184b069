//! Serializable query model.
//!
//! The engine never formats query text. Every read and mutation is
//! expressed with these structures and handed to the
//! [`QueryExecutor`](crate::infra::executor::QueryExecutor) port, which owns
//! the dialect. The model is deliberately small: flat comparisons, AND/OR
//! groups, an IN form over composite key tuples, and fixed table
//! expressions (plain table, ancestor join, tagged union).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A fetched or stored row: column name → value.
pub type Row = serde_json::Map<String, Value>;

/// Comparison operator of a single condition node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    IsNull,
    IsNotNull,
}

/// Recursive condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Matches every row.
    All,
    /// `column <op> value`; the value is ignored for the null checks.
    Cmp {
        column: String,
        op: CmpOp,
        value: Value,
    },
    /// `(c1, .., cn) IN ((v11, .., v1n), ..)` over composite key tuples.
    InTuples {
        columns: Vec<String>,
        tuples: Vec<Vec<Value>>,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    /// Flatten an AND of conditions, dropping `All` members.
    pub fn and(parts: Vec<Condition>) -> Condition {
        let mut merged: Vec<Condition> = Vec::new();
        for part in parts {
            match part {
                Condition::All => {}
                Condition::And(inner) => merged.extend(inner),
                other => merged.push(other),
            }
        }
        match merged.len() {
            0 => Condition::All,
            1 => merged.pop().unwrap_or(Condition::All),
            _ => Condition::And(merged),
        }
    }
}

/// One table participating in an ancestor join, with the leading key
/// columns that identify its rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinTable {
    pub table: String,
    pub key_columns: Vec<String>,
}

/// One member of a UNIONed aggregate query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubSelect {
    pub table: String,
    pub condition: Condition,
    pub columns: Vec<SelectColumn>,
    pub options: SelectOptions,
}

/// Source expression of a select or update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableExpr {
    Table(String),
    /// Ancestor tables joined pairwise on their shared leading key columns;
    /// ordered from most keys to fewest.
    Join(Vec<JoinTable>),
    Union(Vec<SubSelect>),
}

/// A projected column or aggregate expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectColumn {
    All,
    Col(String),
    /// A literal marker column named `@tag`, used to route UNION rows back
    /// to the aggregation request that produced them.
    Tag(String),
    Count,
    CountDistinct(String),
    Min(String),
    Max(String),
    Sum(String),
    Distinct(Vec<String>),
    /// `floor(column / width) * width` bucket start plus a per-bucket count.
    IntervalBucket { column: String, width: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderDir {
    #[default]
    Asc,
    Desc,
}

/// Ordering, pagination and grouping knobs of a select.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SelectOptions {
    pub order_by: Vec<(String, OrderDir)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// One column assignment of an update. `table` qualifies the target inside
/// a join expression; `None` targets the sole table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub table: Option<String>,
    pub column: String,
    pub value: Value,
}

impl Assignment {
    pub fn new(column: impl Into<String>, value: Value) -> Self {
        Self {
            table: None,
            column: column.into(),
            value,
        }
    }

    pub fn qualified(table: impl Into<String>, column: impl Into<String>, value: Value) -> Self {
        Self {
            table: Some(table.into()),
            column: column.into(),
            value,
        }
    }
}

/// Options of a mutating call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WriteOptions {
    /// Insert becomes an on-duplicate-key update.
    pub upsert: bool,
    /// Single-row insert into an auto-increment table; the executor reports
    /// the assigned id.
    pub returning_id: bool,
}

/// Executor report for a mutating call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WriteResult {
    pub affected: u64,
    pub last_insert_id: Option<i64>,
}
