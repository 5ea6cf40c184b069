//! Query executor port.
//!
//! The engine's only window onto relational storage. Implementations own
//! connection pooling and dialect; the engine hands them the serializable
//! query model from [`crate::domain::query`] and interprets the typed
//! errors. A foreign-key violation must surface as
//! [`ExecError::ForeignKeyMissing`] so the engine can report it per item
//! instead of treating it as a retryable fault.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::query::{
    Assignment, Condition, Row, SelectColumn, SelectOptions, TableExpr, WriteOptions, WriteResult,
};

#[derive(Debug, Error)]
pub enum ExecError {
    /// Connection or server failure; retryable at a higher layer.
    #[error("query executor unreachable: {0}")]
    Unreachable(String),
    /// A referenced row is missing.
    #[error("foreign key violation: {0}")]
    ForeignKeyMissing(String),
    #[error("executor error: {0}")]
    Other(String),
}

impl ExecError {
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unreachable(message.into())
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn select(
        &self,
        table: &TableExpr,
        condition: &Condition,
        columns: &[SelectColumn],
        options: &SelectOptions,
    ) -> Result<Vec<Row>, ExecError>;

    async fn insert_or_upsert(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<serde_json::Value>>,
        options: &WriteOptions,
    ) -> Result<WriteResult, ExecError>;

    async fn update(
        &self,
        table: &TableExpr,
        assignments: &[Assignment],
        condition: &Condition,
        options: &WriteOptions,
    ) -> Result<u64, ExecError>;

    async fn delete(
        &self,
        table: &str,
        condition: &Condition,
        options: &WriteOptions,
    ) -> Result<u64, ExecError>;
}
