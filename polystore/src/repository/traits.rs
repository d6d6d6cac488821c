//! Repository trait definitions
//!
//! This module provides the public CRUD/query contract using RPITIT
//! (Return Position Impl Trait In Traits), available since Rust 1.75.
//!
//! # Overview
//!
//! - [`Repository`]: operations every entity supports, on either backend
//! - [`SoftDeleteRepository`]: extra operations for entities with soft delete enabled
//!
//! Both traits are implemented by the repositories a
//! [`RepositoryFactory`](super::RepositoryFactory) hands out; generic code can
//! be written against the traits alone.
//!
//! # Example
//!
//! ```rust,ignore
//! use polystore::prelude::*;
//! use serde_json::json;
//!
//! async fn rename<R: Repository<User>>(repo: &R, id: i64) -> RepositoryResult<Option<User>> {
//!     repo.update_by_id(id, json!({"name": "Bo"})).await
//! }
//! ```

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::entity::Backend;
use super::error::{RepositoryError, RepositoryOperation};
use super::filter::Filter;
use super::overlay::Visibility;
use super::pagination::{PageOptions, PageResult, QueryOptions};
use super::Document;

/// Result type for repository operations
pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

/// Base repository contract
///
/// Payloads are anything that serializes to a JSON object (structs,
/// `serde_json::json!` values, [`Document`]s); records come back as `T`.
/// Read paths hide soft-deleted records when the entity has soft delete
/// enabled.
///
/// # Type Parameters
///
/// - `T`: record type returned by reads and writes
pub trait Repository<T>: Send + Sync
where
    T: DeserializeOwned + Send,
{
    /// Collection or table name
    fn name(&self) -> &str;

    /// Primary-key field name
    fn primary_key(&self) -> &str;

    /// Backend engine family
    fn backend(&self) -> Backend;

    /// Create a record and return it as persisted
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let user: User = repo.create(json!({"name": "Ann"})).await?;
    /// ```
    fn create<D>(&self, data: D) -> impl Future<Output = RepositoryResult<T>> + Send
    where
        D: Serialize + Send;

    /// Create several records, running per-record hooks with `is_bulk` set
    ///
    /// Records are inserted one by one; outside a transaction a failure leaves
    /// earlier records in place.
    fn create_many<D>(&self, items: Vec<D>) -> impl Future<Output = RepositoryResult<Vec<T>>> + Send
    where
        D: Serialize + Send;

    /// Find a record by primary key
    ///
    /// Returns `Ok(None)` if not found.
    fn find_by_id<I>(&self, id: I) -> impl Future<Output = RepositoryResult<Option<T>>> + Send
    where
        I: Into<Value> + Send;

    /// Find the first record matching `filter`
    fn find_one(&self, filter: Filter) -> impl Future<Output = RepositoryResult<Option<T>>> + Send;

    /// Find every record matching `filter`
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let adults = repo
    ///     .find_all(
    ///         Filter::new().op("age", FilterOperator::GreaterThanOrEqual, 18),
    ///         QueryOptions::new().sort("-created_at").paginate(Pagination::first_page(20)),
    ///     )
    ///     .await?;
    /// ```
    fn find_all(
        &self,
        filter: Filter,
        options: QueryOptions,
    ) -> impl Future<Output = RepositoryResult<Vec<T>>> + Send;

    /// Fetch one page plus the total count
    fn find_page(
        &self,
        options: PageOptions,
    ) -> impl Future<Output = RepositoryResult<PageResult<T>>> + Send;

    /// Count records matching `filter`
    fn count(&self, filter: Filter) -> impl Future<Output = RepositoryResult<u64>> + Send;

    /// Whether any record matches `filter`
    fn exists(&self, filter: Filter) -> impl Future<Output = RepositoryResult<bool>> + Send;

    /// Apply a partial update to one record and return it re-read
    ///
    /// Returns `Ok(None)` when no visible record has that id.
    fn update_by_id<I, D>(
        &self,
        id: I,
        data: D,
    ) -> impl Future<Output = RepositoryResult<Option<T>>> + Send
    where
        I: Into<Value> + Send,
        D: Serialize + Send;

    /// Apply a partial update to every matching record and return the matched count
    ///
    /// `before_update` runs once with `is_bulk` set; no after-hook runs.
    fn update_many<D>(
        &self,
        filter: Filter,
        data: D,
    ) -> impl Future<Output = RepositoryResult<u64>> + Send
    where
        D: Serialize + Send;

    /// Delete a record by primary key
    ///
    /// Soft-deletes when the entity has soft delete enabled. Returns `false`
    /// when no visible record has that id.
    fn delete_by_id<I>(&self, id: I) -> impl Future<Output = RepositoryResult<bool>> + Send
    where
        I: Into<Value> + Send;

    /// Delete every matching record and return the affected count; runs no hooks
    fn delete_many(&self, filter: Filter) -> impl Future<Output = RepositoryResult<u64>> + Send;

    /// Update the first record matching `filter`, or create one seeded from the
    /// filter's equality entries overlaid by `data`
    ///
    /// Not atomic: concurrent upserts with the same filter may both create.
    fn upsert<D>(
        &self,
        filter: Filter,
        data: D,
    ) -> impl Future<Output = RepositoryResult<T>> + Send
    where
        D: Serialize + Send;

    /// Project matching records onto `fields`
    fn select(
        &self,
        filter: Filter,
        fields: &[&str],
        options: QueryOptions,
    ) -> impl Future<Output = RepositoryResult<Vec<Document>>> + Send;

    /// Distinct values of `field` among matching records
    fn distinct(
        &self,
        field: &str,
        filter: Filter,
    ) -> impl Future<Output = RepositoryResult<Vec<Value>>> + Send;
}

/// Extra operations of entities with soft delete enabled
///
/// Soft delete marks a record with a deletion instant instead of removing it,
/// so it can be restored and remains available for audits.
pub trait SoftDeleteRepository<T>: Repository<T>
where
    T: DeserializeOwned + Send,
{
    /// Mark a record deleted; `false` if it is missing or already deleted
    fn soft_delete<I>(&self, id: I) -> impl Future<Output = RepositoryResult<bool>> + Send
    where
        I: Into<Value> + Send;

    /// Mark every matching record deleted and return the affected count
    fn soft_delete_many(&self, filter: Filter) -> impl Future<Output = RepositoryResult<u64>> + Send;

    /// Clear a record's deletion mark; `false` if it is not soft-deleted
    fn restore<I>(&self, id: I) -> impl Future<Output = RepositoryResult<bool>> + Send
    where
        I: Into<Value> + Send;

    /// Clear the deletion mark of every matching soft-deleted record
    fn restore_many(&self, filter: Filter) -> impl Future<Output = RepositoryResult<u64>> + Send;

    /// Find matching records, deleted or not
    fn find_all_with_deleted(
        &self,
        filter: Filter,
        options: QueryOptions,
    ) -> impl Future<Output = RepositoryResult<Vec<T>>> + Send;

    /// Find matching records that are soft-deleted
    fn find_deleted(
        &self,
        filter: Filter,
        options: QueryOptions,
    ) -> impl Future<Output = RepositoryResult<Vec<T>>> + Send;

    /// Permanently remove a record, deleted or not
    ///
    /// # Warning
    ///
    /// This operation cannot be undone.
    fn force_delete<I>(&self, id: I) -> impl Future<Output = RepositoryResult<bool>> + Send
    where
        I: Into<Value> + Send;
}

pub(crate) mod sealed {
    use crate::repository::core::RepositoryCore;

    /// Access to the untyped pipeline behind a typed repository
    pub trait CoreAccess<T>: Send + Sync {
        fn core(&self) -> &RepositoryCore;
    }

    /// Marker for repositories whose entity has soft delete enabled
    pub trait SoftDeleteEnabled {}
}

use super::core::{from_document, from_documents, to_document};
use sealed::{CoreAccess, SoftDeleteEnabled};

impl<T, R> Repository<T> for R
where
    R: CoreAccess<T>,
    T: DeserializeOwned + Send,
{
    fn name(&self) -> &str {
        self.core().name()
    }

    fn primary_key(&self) -> &str {
        self.core().primary_key()
    }

    fn backend(&self) -> Backend {
        self.core().backend()
    }

    async fn create<D>(&self, data: D) -> RepositoryResult<T>
    where
        D: Serialize + Send,
    {
        let payload = to_document(&data, RepositoryOperation::Create)?;
        let record = self.core().create(payload).await?;
        from_document(record, RepositoryOperation::Create)
    }

    async fn create_many<D>(&self, items: Vec<D>) -> RepositoryResult<Vec<T>>
    where
        D: Serialize + Send,
    {
        let payloads = items
            .iter()
            .map(|item| to_document(item, RepositoryOperation::CreateMany))
            .collect::<RepositoryResult<Vec<_>>>()?;
        let records = self.core().create_many(payloads).await?;
        from_documents(records, RepositoryOperation::CreateMany)
    }

    async fn find_by_id<I>(&self, id: I) -> RepositoryResult<Option<T>>
    where
        I: Into<Value> + Send,
    {
        let id = id.into();
        self.core()
            .find_by_id(&id)
            .await?
            .map(|record| from_document(record, RepositoryOperation::FindById))
            .transpose()
    }

    async fn find_one(&self, filter: Filter) -> RepositoryResult<Option<T>> {
        self.core()
            .find_one(&filter)
            .await?
            .map(|record| from_document(record, RepositoryOperation::FindOne))
            .transpose()
    }

    async fn find_all(&self, filter: Filter, options: QueryOptions) -> RepositoryResult<Vec<T>> {
        let records = self
            .core()
            .find_all(Visibility::Active, &filter, &options)
            .await?;
        from_documents(records, RepositoryOperation::FindAll)
    }

    async fn find_page(&self, options: PageOptions) -> RepositoryResult<PageResult<T>> {
        let page = self.core().find_page(&options).await?;
        let data = from_documents(page.data, RepositoryOperation::FindPage)?;
        Ok(PageResult {
            data,
            page: page.page,
            limit: page.limit,
            total: page.total,
            pages: page.pages,
        })
    }

    async fn count(&self, filter: Filter) -> RepositoryResult<u64> {
        self.core().count(&filter).await
    }

    async fn exists(&self, filter: Filter) -> RepositoryResult<bool> {
        self.core().exists(&filter).await
    }

    async fn update_by_id<I, D>(&self, id: I, data: D) -> RepositoryResult<Option<T>>
    where
        I: Into<Value> + Send,
        D: Serialize + Send,
    {
        let id = id.into();
        let patch = to_document(&data, RepositoryOperation::Update)?;
        self.core()
            .update_by_id(&id, patch)
            .await?
            .map(|record| from_document(record, RepositoryOperation::Update))
            .transpose()
    }

    async fn update_many<D>(&self, filter: Filter, data: D) -> RepositoryResult<u64>
    where
        D: Serialize + Send,
    {
        let patch = to_document(&data, RepositoryOperation::UpdateMany)?;
        self.core().update_many(&filter, patch).await
    }

    async fn delete_by_id<I>(&self, id: I) -> RepositoryResult<bool>
    where
        I: Into<Value> + Send,
    {
        let id = id.into();
        self.core().delete_by_id(&id).await
    }

    async fn delete_many(&self, filter: Filter) -> RepositoryResult<u64> {
        self.core().delete_many(&filter).await
    }

    async fn upsert<D>(&self, filter: Filter, data: D) -> RepositoryResult<T>
    where
        D: Serialize + Send,
    {
        let payload = to_document(&data, RepositoryOperation::Upsert)?;
        let record = self.core().upsert(&filter, payload).await?;
        from_document(record, RepositoryOperation::Upsert)
    }

    async fn select(
        &self,
        filter: Filter,
        fields: &[&str],
        options: QueryOptions,
    ) -> RepositoryResult<Vec<Document>> {
        let fields = fields.iter().map(|f| f.to_string()).collect();
        self.core().select(&filter, fields, &options).await
    }

    async fn distinct(&self, field: &str, filter: Filter) -> RepositoryResult<Vec<Value>> {
        self.core().distinct(field, &filter).await
    }
}

impl<T, R> SoftDeleteRepository<T> for R
where
    R: CoreAccess<T> + SoftDeleteEnabled,
    T: DeserializeOwned + Send,
{
    async fn soft_delete<I>(&self, id: I) -> RepositoryResult<bool>
    where
        I: Into<Value> + Send,
    {
        let id = id.into();
        self.core().delete_by_id(&id).await
    }

    async fn soft_delete_many(&self, filter: Filter) -> RepositoryResult<u64> {
        self.core().delete_many(&filter).await
    }

    async fn restore<I>(&self, id: I) -> RepositoryResult<bool>
    where
        I: Into<Value> + Send,
    {
        let id = id.into();
        self.core().restore(&id).await
    }

    async fn restore_many(&self, filter: Filter) -> RepositoryResult<u64> {
        self.core().restore_many(&filter).await
    }

    async fn find_all_with_deleted(
        &self,
        filter: Filter,
        options: QueryOptions,
    ) -> RepositoryResult<Vec<T>> {
        let records = self
            .core()
            .find_all(Visibility::All, &filter, &options)
            .await?;
        from_documents(records, RepositoryOperation::FindAll)
    }

    async fn find_deleted(&self, filter: Filter, options: QueryOptions) -> RepositoryResult<Vec<T>> {
        let records = self
            .core()
            .find_all(Visibility::DeletedOnly, &filter, &options)
            .await?;
        from_documents(records, RepositoryOperation::FindAll)
    }

    async fn force_delete<I>(&self, id: I) -> RepositoryResult<bool>
    where
        I: Into<Value> + Send,
    {
        let id = id.into();
        self.core().force_delete(&id).await
    }
}
