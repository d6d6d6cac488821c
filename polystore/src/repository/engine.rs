//! Backend engines: the seam between repository semantics and driver primitives
//!
//! Both engines take backend-neutral filters, compile them for their driver
//! and bind every call to an optional transaction or session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use super::compile::{check_sort, compile_document, compile_relational};
use super::entity::{Backend, EntitySettings};
use super::error::{RepositoryError, RepositoryOperation};
use super::filter::{Filter, FilterCondition, Sort};
use super::pagination::Pagination;
use super::traits::RepositoryResult;
use super::Document;
use crate::error::DriverResult;
use crate::driver::{
    CountQuery, DeleteQuery, DocumentDriver, DocumentSession, FindSpec, InsertQuery,
    RelationalDriver, RelationalExecutor, RelationalTransaction, SelectQuery, UpdateQuery,
};

/// Liveness token shared by every repository built for one transaction attempt
#[derive(Debug, Clone)]
pub(crate) struct AttemptScope {
    open: Arc<AtomicBool>,
}

impl AttemptScope {
    pub(crate) fn open() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn ensure_open(&self, operation: RepositoryOperation) -> RepositoryResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(RepositoryError::transaction_closed(operation))
        }
    }
}

/// Read parameters understood by every engine
#[derive(Debug, Clone, Default)]
pub(crate) struct FindOptions {
    pub(crate) sort: Option<Sort>,
    pub(crate) pagination: Option<Pagination>,
    pub(crate) projection: Option<Vec<String>>,
}

/// How many records a write may touch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteScope {
    One,
    Many,
}

#[async_trait]
pub(crate) trait Engine: Send + Sync {
    fn backend(&self) -> Backend;

    async fn find(
        &self,
        entity: &EntitySettings,
        filter: &Filter,
        options: &FindOptions,
    ) -> RepositoryResult<Vec<Document>>;

    async fn count(&self, entity: &EntitySettings, filter: &Filter) -> RepositoryResult<u64>;

    async fn distinct(
        &self,
        entity: &EntitySettings,
        field: &str,
        filter: &Filter,
    ) -> RepositoryResult<Vec<Value>>;

    /// Insert and return the record as persisted
    async fn insert(&self, entity: &EntitySettings, record: Document) -> RepositoryResult<Document>;

    /// Apply `patch` to matching records and return the matched count
    async fn update(
        &self,
        entity: &EntitySettings,
        filter: &Filter,
        patch: Document,
        scope: WriteScope,
    ) -> RepositoryResult<u64>;

    /// Physically delete matching records and return the deleted count
    async fn delete(
        &self,
        entity: &EntitySettings,
        filter: &Filter,
        scope: WriteScope,
    ) -> RepositoryResult<u64>;
}

fn check_scope(scope: &Option<AttemptScope>, operation: RepositoryOperation) -> RepositoryResult<()> {
    match scope {
        Some(scope) => scope.ensure_open(operation),
        None => Ok(()),
    }
}

// ============================================================================
// Document engine
// ============================================================================

#[derive(Clone)]
pub(crate) struct DocumentEngine {
    driver: Arc<dyn DocumentDriver>,
    session: Option<Arc<dyn DocumentSession>>,
    scope: Option<AttemptScope>,
}

impl DocumentEngine {
    pub(crate) fn new(driver: Arc<dyn DocumentDriver>) -> Self {
        Self {
            driver,
            session: None,
            scope: None,
        }
    }

    pub(crate) fn with_session(
        driver: Arc<dyn DocumentDriver>,
        session: Arc<dyn DocumentSession>,
        scope: AttemptScope,
    ) -> Self {
        Self {
            driver,
            session: Some(session),
            scope: Some(scope),
        }
    }

    fn session(&self) -> Option<&dyn DocumentSession> {
        self.session.as_deref()
    }
}

#[async_trait]
impl Engine for DocumentEngine {
    fn backend(&self) -> Backend {
        Backend::Document
    }

    async fn find(
        &self,
        entity: &EntitySettings,
        filter: &Filter,
        options: &FindOptions,
    ) -> RepositoryResult<Vec<Document>> {
        check_scope(&self.scope, RepositoryOperation::FindAll)?;
        let spec = FindSpec {
            filter: compile_document(filter, entity.strict_operators)?,
            sort: options
                .sort
                .iter()
                .flat_map(|sort| sort.fields())
                .map(|field| (field.field.clone(), field.direction))
                .collect(),
            skip: options.pagination.map_or(0, |p| p.offset),
            limit: options.pagination.map(|p| p.limit),
            projection: options.projection.clone(),
        };
        tracing::debug!(collection = %entity.name, filter = %spec.filter, "document find");
        Ok(self.driver.find(&entity.name, &spec, self.session()).await?)
    }

    async fn count(&self, entity: &EntitySettings, filter: &Filter) -> RepositoryResult<u64> {
        check_scope(&self.scope, RepositoryOperation::Count)?;
        let query = compile_document(filter, entity.strict_operators)?;
        tracing::debug!(collection = %entity.name, filter = %query, "document count");
        Ok(self.driver.count(&entity.name, &query, self.session()).await?)
    }

    async fn distinct(
        &self,
        entity: &EntitySettings,
        field: &str,
        filter: &Filter,
    ) -> RepositoryResult<Vec<Value>> {
        check_scope(&self.scope, RepositoryOperation::Distinct)?;
        let query = compile_document(filter, entity.strict_operators)?;
        Ok(self
            .driver
            .distinct(&entity.name, field, &query, self.session())
            .await?)
    }

    async fn insert(&self, entity: &EntitySettings, mut record: Document) -> RepositoryResult<Document> {
        check_scope(&self.scope, RepositoryOperation::Create)?;
        if entity.primary_key != "_id" {
            record
                .entry(entity.primary_key.as_str())
                .or_insert_with(|| Value::String(Uuid::now_v7().to_string()));
        }
        tracing::debug!(collection = %entity.name, "document insert");
        let id = self
            .driver
            .insert(&entity.name, record.clone(), self.session())
            .await?;
        record.entry("_id").or_insert(id);
        Ok(record)
    }

    async fn update(
        &self,
        entity: &EntitySettings,
        filter: &Filter,
        patch: Document,
        scope: WriteScope,
    ) -> RepositoryResult<u64> {
        check_scope(&self.scope, RepositoryOperation::Update)?;
        let query = compile_document(filter, entity.strict_operators)?;
        let update = json!({ "$set": patch });
        tracing::debug!(collection = %entity.name, filter = %query, ?scope, "document update");
        Ok(self
            .driver
            .update(
                &entity.name,
                &query,
                &update,
                scope == WriteScope::Many,
                self.session(),
            )
            .await?)
    }

    async fn delete(
        &self,
        entity: &EntitySettings,
        filter: &Filter,
        scope: WriteScope,
    ) -> RepositoryResult<u64> {
        check_scope(&self.scope, RepositoryOperation::Delete)?;
        let query = compile_document(filter, entity.strict_operators)?;
        tracing::debug!(collection = %entity.name, filter = %query, ?scope, "document delete");
        Ok(self
            .driver
            .delete(&entity.name, &query, scope == WriteScope::Many, self.session())
            .await?)
    }
}

// ============================================================================
// Relational engine
// ============================================================================

/// Query root of a relational engine
#[derive(Clone)]
pub(crate) enum RelationalTarget {
    Root(Arc<dyn RelationalDriver>),
    Transaction(Arc<dyn RelationalTransaction>),
}

#[async_trait]
impl RelationalExecutor for RelationalTarget {
    async fn select(&self, query: &SelectQuery) -> DriverResult<Vec<Document>> {
        match self {
            Self::Root(driver) => driver.select(query).await,
            Self::Transaction(tx) => tx.select(query).await,
        }
    }

    async fn insert(&self, query: &InsertQuery) -> DriverResult<Document> {
        match self {
            Self::Root(driver) => driver.insert(query).await,
            Self::Transaction(tx) => tx.insert(query).await,
        }
    }

    async fn update(&self, query: &UpdateQuery) -> DriverResult<u64> {
        match self {
            Self::Root(driver) => driver.update(query).await,
            Self::Transaction(tx) => tx.update(query).await,
        }
    }

    async fn delete(&self, query: &DeleteQuery) -> DriverResult<u64> {
        match self {
            Self::Root(driver) => driver.delete(query).await,
            Self::Transaction(tx) => tx.delete(query).await,
        }
    }

    async fn count(&self, query: &CountQuery) -> DriverResult<u64> {
        match self {
            Self::Root(driver) => driver.count(query).await,
            Self::Transaction(tx) => tx.count(query).await,
        }
    }
}

#[derive(Clone)]
pub(crate) struct RelationalEngine {
    target: RelationalTarget,
    scope: Option<AttemptScope>,
}

impl RelationalEngine {
    pub(crate) fn new(driver: Arc<dyn RelationalDriver>) -> Self {
        Self {
            target: RelationalTarget::Root(driver),
            scope: None,
        }
    }

    pub(crate) fn with_transaction(tx: Arc<dyn RelationalTransaction>, scope: AttemptScope) -> Self {
        Self {
            target: RelationalTarget::Transaction(tx),
            scope: Some(scope),
        }
    }

    fn conditions(
        entity: &EntitySettings,
        filter: &Filter,
    ) -> RepositoryResult<Vec<FilterCondition>> {
        compile_relational(filter, &entity.whitelist, &entity.name, entity.strict_operators)
    }
}

#[async_trait]
impl Engine for RelationalEngine {
    fn backend(&self) -> Backend {
        Backend::Relational
    }

    async fn find(
        &self,
        entity: &EntitySettings,
        filter: &Filter,
        options: &FindOptions,
    ) -> RepositoryResult<Vec<Document>> {
        check_scope(&self.scope, RepositoryOperation::FindAll)?;
        let conditions = Self::conditions(entity, filter)?;
        if let Some(sort) = &options.sort {
            check_sort(sort, &entity.whitelist, &entity.name)?;
        }
        if let Some(columns) = &options.projection {
            for column in columns {
                entity.whitelist.check(column, "projection", &entity.name)?;
            }
        }
        let query = SelectQuery {
            table: entity.name.clone(),
            columns: options.projection.clone(),
            conditions,
            order_by: options
                .sort
                .as_ref()
                .map(|sort| sort.fields().to_vec())
                .unwrap_or_default(),
            limit: options.pagination.map(|p| p.limit),
            offset: options.pagination.map(|p| p.offset).filter(|offset| *offset > 0),
            distinct: false,
        };
        tracing::debug!(table = %entity.name, conditions = query.conditions.len(), "relational select");
        Ok(self.target.select(&query).await?)
    }

    async fn count(&self, entity: &EntitySettings, filter: &Filter) -> RepositoryResult<u64> {
        check_scope(&self.scope, RepositoryOperation::Count)?;
        let query = CountQuery {
            table: entity.name.clone(),
            conditions: Self::conditions(entity, filter)?,
        };
        tracing::debug!(table = %entity.name, "relational count");
        Ok(self.target.count(&query).await?)
    }

    async fn distinct(
        &self,
        entity: &EntitySettings,
        field: &str,
        filter: &Filter,
    ) -> RepositoryResult<Vec<Value>> {
        check_scope(&self.scope, RepositoryOperation::Distinct)?;
        entity.whitelist.check(field, "distinct", &entity.name)?;
        let query = SelectQuery {
            table: entity.name.clone(),
            columns: Some(vec![field.to_string()]),
            conditions: Self::conditions(entity, filter)?,
            distinct: true,
            ..SelectQuery::default()
        };
        let rows = self.target.select(&query).await?;
        Ok(rows
            .into_iter()
            .map(|mut row| row.remove(field).unwrap_or(Value::Null))
            .collect())
    }

    async fn insert(&self, entity: &EntitySettings, record: Document) -> RepositoryResult<Document> {
        check_scope(&self.scope, RepositoryOperation::Create)?;
        tracing::debug!(table = %entity.name, "relational insert");
        let query = InsertQuery {
            table: entity.name.clone(),
            values: record,
        };
        Ok(self.target.insert(&query).await?)
    }

    async fn update(
        &self,
        entity: &EntitySettings,
        filter: &Filter,
        patch: Document,
        _scope: WriteScope,
    ) -> RepositoryResult<u64> {
        check_scope(&self.scope, RepositoryOperation::Update)?;
        // single-record writes always carry the primary key, so the scope needs no LIMIT
        let query = UpdateQuery {
            table: entity.name.clone(),
            values: patch,
            conditions: Self::conditions(entity, filter)?,
        };
        tracing::debug!(table = %entity.name, "relational update");
        Ok(self.target.update(&query).await?)
    }

    async fn delete(
        &self,
        entity: &EntitySettings,
        filter: &Filter,
        _scope: WriteScope,
    ) -> RepositoryResult<u64> {
        check_scope(&self.scope, RepositoryOperation::Delete)?;
        let query = DeleteQuery {
            table: entity.name.clone(),
            conditions: Self::conditions(entity, filter)?,
        };
        tracing::debug!(table = %entity.name, "relational delete");
        Ok(self.target.delete(&query).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{EntityConfig, RepositoryErrorKind};

    #[test]
    fn test_attempt_scope_closes() {
        let scope = AttemptScope::open();
        let shared = scope.clone();
        assert!(shared.is_open());
        scope.close();
        assert!(!shared.is_open());
        let err = shared.ensure_open(RepositoryOperation::Create).unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::TransactionClosed);
    }

    #[tokio::test]
    async fn test_closed_scope_blocks_engine_calls() {
        let driver = Arc::new(crate::driver::MemoryDocumentDriver::new());
        let scope = AttemptScope::open();
        let engine = DocumentEngine {
            driver,
            session: None,
            scope: Some(scope.clone()),
        };
        let entity =
            EntitySettings::resolve(EntityConfig::collection("events"), Backend::Document).unwrap();

        assert_eq!(engine.count(&entity, &Filter::new()).await.unwrap(), 0);
        scope.close();
        let err = engine.count(&entity, &Filter::new()).await.unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::TransactionClosed);
    }

    #[tokio::test]
    async fn test_relational_engine_rejects_unlisted_sort() {
        let driver = Arc::new(crate::driver::MemoryRelationalDriver::new());
        let engine = RelationalEngine::new(driver);
        let entity = EntitySettings::resolve(
            EntityConfig::table("users").columns(["id", "name"]),
            Backend::Relational,
        )
        .unwrap();
        let options = FindOptions {
            sort: Some(Sort::parse("-password")),
            ..FindOptions::default()
        };
        let err = engine
            .find(&entity, &Filter::new(), &options)
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::Configuration);
    }
}
