//! Relational driver traits and query descriptions
//!
//! Queries are plain data. Drivers render them into parameterized SQL (or
//! evaluate them directly) and never see caller-built SQL text.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DriverResult;
use crate::repository::{Document, FilterCondition, SortField};
use crate::transaction::TransactionSettings;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    pub table: String,
    /// Columns to return; `None` selects every column
    pub columns: Option<Vec<String>>,
    pub conditions: Vec<FilterCondition>,
    pub order_by: Vec<SortField>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// `SELECT DISTINCT`
    pub distinct: bool,
}

impl SelectQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertQuery {
    pub table: String,
    /// Column values; absent columns take their defaults
    pub values: Document,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateQuery {
    pub table: String,
    /// Columns to set
    pub values: Document,
    pub conditions: Vec<FilterCondition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteQuery {
    pub table: String,
    pub conditions: Vec<FilterCondition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CountQuery {
    pub table: String,
    pub conditions: Vec<FilterCondition>,
}

/// Anything that can run queries: the driver itself or an open transaction
#[async_trait]
pub trait RelationalExecutor: Send + Sync {
    async fn select(&self, query: &SelectQuery) -> DriverResult<Vec<Document>>;

    /// Insert one row and return it as stored
    async fn insert(&self, query: &InsertQuery) -> DriverResult<Document>;

    /// Update matching rows and return the affected count
    async fn update(&self, query: &UpdateQuery) -> DriverResult<u64>;

    /// Delete matching rows and return the affected count
    async fn delete(&self, query: &DeleteQuery) -> DriverResult<u64>;

    async fn count(&self, query: &CountQuery) -> DriverResult<u64>;
}

/// Root handle of a relational store
#[async_trait]
pub trait RelationalDriver: RelationalExecutor {
    /// Open a transaction with the given isolation level and timeout
    async fn begin(
        &self,
        settings: &TransactionSettings,
    ) -> DriverResult<Arc<dyn RelationalTransaction>>;

    async fn close(&self) -> DriverResult<()>;
}

/// Open transaction usable as a query root
///
/// Once committed or rolled back, further queries fail and a second
/// `rollback` is a no-op.
#[async_trait]
pub trait RelationalTransaction: RelationalExecutor {
    async fn commit(&self) -> DriverResult<()>;

    async fn rollback(&self) -> DriverResult<()>;
}
