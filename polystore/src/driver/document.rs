//! Document driver trait

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::DriverResult;
use crate::repository::{Document, OrderDirection};
use crate::transaction::TransactionSettings;

/// Parameters of a document find
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindSpec {
    /// MongoDB-style query document
    pub filter: Value,
    /// Sort keys in priority order
    pub sort: Vec<(String, OrderDirection)>,
    /// Documents to skip
    pub skip: u64,
    /// Maximum documents to return
    pub limit: Option<u64>,
    /// Fields to return; `None` returns whole documents
    pub projection: Option<Vec<String>>,
}

/// Primitive operations of a document store
///
/// Every operation accepts an optional session; when the session has an open
/// transaction the operation runs inside it.
#[async_trait]
pub trait DocumentDriver: Send + Sync {
    /// Insert a document and return its `_id`, generating one when absent
    async fn insert(
        &self,
        collection: &str,
        document: Document,
        session: Option<&dyn DocumentSession>,
    ) -> DriverResult<Value>;

    async fn find(
        &self,
        collection: &str,
        spec: &FindSpec,
        session: Option<&dyn DocumentSession>,
    ) -> DriverResult<Vec<Document>>;

    /// Apply an update document (`$set` / `$unset`) and return the matched count
    async fn update(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        multi: bool,
        session: Option<&dyn DocumentSession>,
    ) -> DriverResult<u64>;

    /// Delete matching documents and return the deleted count
    async fn delete(
        &self,
        collection: &str,
        filter: &Value,
        multi: bool,
        session: Option<&dyn DocumentSession>,
    ) -> DriverResult<u64>;

    async fn count(
        &self,
        collection: &str,
        filter: &Value,
        session: Option<&dyn DocumentSession>,
    ) -> DriverResult<u64>;

    /// Distinct values of `field` among matching documents
    async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: &Value,
        session: Option<&dyn DocumentSession>,
    ) -> DriverResult<Vec<Value>>;

    async fn start_session(&self) -> DriverResult<Arc<dyn DocumentSession>>;

    /// Release the driver's resources
    async fn close(&self) -> DriverResult<()>;
}

/// Client session able to host one transaction at a time
#[async_trait]
pub trait DocumentSession: Send + Sync {
    /// Downcast hook for drivers that need their concrete session type
    fn as_any(&self) -> &dyn Any;

    /// Session identifier, used in log events
    fn id(&self) -> &str;

    async fn start_transaction(&self, settings: &TransactionSettings) -> DriverResult<()>;

    async fn commit_transaction(&self) -> DriverResult<()>;

    async fn abort_transaction(&self) -> DriverResult<()>;

    /// End the session, aborting any transaction still open
    async fn end_session(&self) -> DriverResult<()>;
}
