//! Untyped repository pipeline
//!
//! Every operation runs the same steps: merge filters (default, visibility,
//! caller), before-hook, timestamp overlay, engine call, after-hook. The typed
//! repositories in [`super::factory`] wrap this core and only convert records.

use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::engine::{Engine, FindOptions, WriteScope};
use super::entity::{Backend, EntitySettings};
use super::error::{RepositoryError, RepositoryOperation};
use super::filter::Filter;
use super::hooks::HookOperation;
use super::overlay::{SoftDeleteOverlay, Visibility};
use super::pagination::{shape, PageOptions, PageResult, Pagination, QueryOptions};
use super::traits::RepositoryResult;
use super::Document;

#[derive(Clone)]
pub(crate) struct RepositoryCore {
    entity: Arc<EntitySettings>,
    engine: Arc<dyn Engine>,
}

impl RepositoryCore {
    pub(crate) fn new(entity: EntitySettings, engine: Arc<dyn Engine>) -> Self {
        Self {
            entity: Arc::new(entity),
            engine,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.entity.name
    }

    pub(crate) fn primary_key(&self) -> &str {
        &self.entity.primary_key
    }

    pub(crate) fn backend(&self) -> Backend {
        self.engine.backend()
    }

    pub(crate) fn is_soft_deletable(&self) -> bool {
        self.entity.soft_delete.is_some()
    }

    fn soft_overlay(&self, operation: RepositoryOperation) -> RepositoryResult<&SoftDeleteOverlay> {
        self.entity.soft_delete.as_ref().ok_or_else(|| {
            RepositoryError::configuration(format!(
                "`{}` does not have soft delete enabled",
                self.entity.name
            ))
            .with_operation(operation)
        })
    }

    /// Merge default filter, visibility layer and caller filter, lowest precedence first
    fn read_filter(&self, visibility: Visibility, caller: &Filter) -> Filter {
        let visibility_layer = self
            .entity
            .soft_delete
            .as_ref()
            .map(|overlay| overlay.visibility_filter(visibility))
            .unwrap_or_default();
        Filter::layered([&self.entity.default_filter, &visibility_layer, caller])
    }

    fn id_filter(&self, id: &Value) -> Filter {
        Filter::new().eq(self.entity.primary_key.as_str(), id.clone())
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    pub(crate) async fn create(&self, data: Document) -> RepositoryResult<Document> {
        self.create_with(data, HookOperation::Create, false, RepositoryOperation::Create)
            .await
    }

    pub(crate) async fn create_many(&self, items: Vec<Document>) -> RepositoryResult<Vec<Document>> {
        let mut created = Vec::with_capacity(items.len());
        for item in items {
            created.push(
                self.create_with(item, HookOperation::Create, true, RepositoryOperation::CreateMany)
                    .await?,
            );
        }
        Ok(created)
    }

    async fn create_with(
        &self,
        data: Document,
        hook_operation: HookOperation,
        is_bulk: bool,
        operation: RepositoryOperation,
    ) -> RepositoryResult<Document> {
        let hooks = &self.entity.hooks;
        let data = hooks.before_create(data, hook_operation, is_bulk).await?;
        let data = self.entity.timestamps.decorate_create(data, Utc::now());
        let persisted = self
            .engine
            .insert(&self.entity, data)
            .await
            .map_err(|e| e.with_operation(operation))?;
        hooks.after_create(Some(&persisted)).await?;
        Ok(persisted)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub(crate) async fn find_all(
        &self,
        visibility: Visibility,
        filter: &Filter,
        options: &QueryOptions,
    ) -> RepositoryResult<Vec<Document>> {
        let merged = self.read_filter(visibility, filter);
        let options = FindOptions {
            sort: options.sort.clone(),
            pagination: options.pagination,
            projection: None,
        };
        self.engine
            .find(&self.entity, &merged, &options)
            .await
            .map_err(|e| e.with_operation(RepositoryOperation::FindAll))
    }

    async fn first(
        &self,
        merged: &Filter,
        projection: Option<Vec<String>>,
        operation: RepositoryOperation,
    ) -> RepositoryResult<Option<Document>> {
        let options = FindOptions {
            sort: None,
            pagination: Some(Pagination::first_page(1)),
            projection,
        };
        let mut found = self
            .engine
            .find(&self.entity, merged, &options)
            .await
            .map_err(|e| e.with_operation(operation))?;
        Ok((!found.is_empty()).then(|| found.swap_remove(0)))
    }

    pub(crate) async fn find_by_id(&self, id: &Value) -> RepositoryResult<Option<Document>> {
        let merged = self.read_filter(Visibility::Active, &self.id_filter(id));
        self.first(&merged, None, RepositoryOperation::FindById).await
    }

    pub(crate) async fn find_one(&self, filter: &Filter) -> RepositoryResult<Option<Document>> {
        let merged = self.read_filter(Visibility::Active, filter);
        self.first(&merged, None, RepositoryOperation::FindOne).await
    }

    pub(crate) async fn find_page(&self, options: &PageOptions) -> RepositoryResult<PageResult<Document>> {
        let merged = self.read_filter(Visibility::Active, &options.filter);
        let total = self
            .engine
            .count(&self.entity, &merged)
            .await
            .map_err(|e| e.with_operation(RepositoryOperation::FindPage))?;
        let find_options = FindOptions {
            sort: options.sort.clone(),
            pagination: Some(options.pagination()),
            projection: None,
        };
        let data = self
            .engine
            .find(&self.entity, &merged, &find_options)
            .await
            .map_err(|e| e.with_operation(RepositoryOperation::FindPage))?;
        Ok(shape(data, options.page, options.limit, total))
    }

    pub(crate) async fn count(&self, filter: &Filter) -> RepositoryResult<u64> {
        let merged = self.read_filter(Visibility::Active, filter);
        self.engine
            .count(&self.entity, &merged)
            .await
            .map_err(|e| e.with_operation(RepositoryOperation::Count))
    }

    pub(crate) async fn exists(&self, filter: &Filter) -> RepositoryResult<bool> {
        let merged = self.read_filter(Visibility::Active, filter);
        let projection = Some(vec![self.entity.primary_key.clone()]);
        Ok(self
            .first(&merged, projection, RepositoryOperation::Exists)
            .await?
            .is_some())
    }

    pub(crate) async fn select(
        &self,
        filter: &Filter,
        fields: Vec<String>,
        options: &QueryOptions,
    ) -> RepositoryResult<Vec<Document>> {
        if fields.is_empty() {
            return Err(RepositoryError::validation_failed("select requires at least one field")
                .with_operation(RepositoryOperation::Select));
        }
        let merged = self.read_filter(Visibility::Active, filter);
        let find_options = FindOptions {
            sort: options.sort.clone(),
            pagination: options.pagination,
            projection: Some(fields),
        };
        self.engine
            .find(&self.entity, &merged, &find_options)
            .await
            .map_err(|e| e.with_operation(RepositoryOperation::Select))
    }

    pub(crate) async fn distinct(&self, field: &str, filter: &Filter) -> RepositoryResult<Vec<Value>> {
        let merged = self.read_filter(Visibility::Active, filter);
        self.engine
            .distinct(&self.entity, field, &merged)
            .await
            .map_err(|e| e.with_operation(RepositoryOperation::Distinct))
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    pub(crate) async fn update_by_id(&self, id: &Value, patch: Document) -> RepositoryResult<Option<Document>> {
        let merged = self.read_filter(Visibility::Active, &self.id_filter(id));
        let patch = self
            .entity
            .hooks
            .before_update(patch, HookOperation::Update, false)
            .await?;
        self.apply_update(&merged, id, patch, RepositoryOperation::Update)
            .await
    }

    /// Write a single-record patch, re-read the record and run the after-hook
    async fn apply_update(
        &self,
        filter: &Filter,
        id: &Value,
        patch: Document,
        operation: RepositoryOperation,
    ) -> RepositoryResult<Option<Document>> {
        let patch = self.entity.timestamps.decorate_update(patch, Utc::now());
        let key = patch
            .get(&self.entity.primary_key)
            .cloned()
            .unwrap_or_else(|| id.clone());

        let written = if patch.is_empty() {
            self.engine.count(&self.entity, filter).await
        } else {
            self.engine
                .update(&self.entity, filter, patch, WriteScope::One)
                .await
        };
        let matched = written.map_err(|e| e.with_operation(operation))?;

        let entity = if matched == 0 {
            None
        } else {
            self.first(&self.id_filter(&key), None, operation).await?
        };
        self.entity.hooks.after_update(entity.as_ref()).await?;
        Ok(entity)
    }

    pub(crate) async fn update_many(&self, filter: &Filter, patch: Document) -> RepositoryResult<u64> {
        let merged = self.read_filter(Visibility::Active, filter);
        let patch = self
            .entity
            .hooks
            .before_update(patch, HookOperation::Update, true)
            .await?;
        let patch = self.entity.timestamps.decorate_update(patch, Utc::now());
        if patch.is_empty() {
            return self
                .engine
                .count(&self.entity, &merged)
                .await
                .map_err(|e| e.with_operation(RepositoryOperation::UpdateMany));
        }
        self.engine
            .update(&self.entity, &merged, patch, WriteScope::Many)
            .await
            .map_err(|e| e.with_operation(RepositoryOperation::UpdateMany))
    }

    /// Update the first record matching `filter`, or create one
    ///
    /// Two steps, not atomic: concurrent upserts with the same filter may both
    /// take the create path.
    pub(crate) async fn upsert(&self, filter: &Filter, data: Document) -> RepositoryResult<Document> {
        let merged = self.read_filter(Visibility::Active, filter);
        match self.first(&merged, None, RepositoryOperation::Upsert).await? {
            Some(existing) => {
                let id = existing
                    .get(&self.entity.primary_key)
                    .cloned()
                    .ok_or_else(|| {
                        RepositoryError::database_error(
                            RepositoryOperation::Upsert,
                            format!(
                                "matched record has no `{}` field",
                                self.entity.primary_key
                            ),
                        )
                    })?;
                let patch = self
                    .entity
                    .hooks
                    .before_update(data, HookOperation::Upsert, false)
                    .await?;
                tracing::debug!(entity = %self.entity.name, id = %id, "upsert taking update path");
                self.apply_update(&self.id_filter(&id), &id, patch, RepositoryOperation::Upsert)
                    .await?
                    .ok_or_else(|| {
                        RepositoryError::not_found(self.entity.name.as_str(), id.to_string())
                            .with_operation(RepositoryOperation::Upsert)
                    })
            }
            None => {
                let mut seed =
                    Filter::layered([&self.entity.default_filter, filter]).equality_entries();
                seed.extend(data);
                tracing::debug!(entity = %self.entity.name, "upsert taking create path");
                self.create_with(seed, HookOperation::Upsert, false, RepositoryOperation::Upsert)
                    .await
            }
        }
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    pub(crate) async fn delete_by_id(&self, id: &Value) -> RepositoryResult<bool> {
        let operation = if self.is_soft_deletable() {
            RepositoryOperation::SoftDelete
        } else {
            RepositoryOperation::Delete
        };
        let hooks = &self.entity.hooks;
        hooks.before_delete(id).await?;

        let merged = self.read_filter(Visibility::Active, &self.id_filter(id));
        let affected = self
            .remove(&merged, WriteScope::One)
            .await
            .map_err(|e| e.with_operation(operation))?;
        let success = affected > 0;

        hooks.after_delete(success).await?;
        Ok(success)
    }

    pub(crate) async fn delete_many(&self, filter: &Filter) -> RepositoryResult<u64> {
        let merged = self.read_filter(Visibility::Active, filter);
        self.remove(&merged, WriteScope::Many)
            .await
            .map_err(|e| e.with_operation(RepositoryOperation::DeleteMany))
    }

    /// Soft delete when enabled, physical delete otherwise
    async fn remove(&self, merged: &Filter, scope: WriteScope) -> RepositoryResult<u64> {
        match &self.entity.soft_delete {
            Some(overlay) => {
                let now = Utc::now();
                let patch = self
                    .entity
                    .timestamps
                    .decorate_update(overlay.mark_patch(now), now);
                self.engine.update(&self.entity, merged, patch, scope).await
            }
            None => self.engine.delete(&self.entity, merged, scope).await,
        }
    }

    pub(crate) async fn restore(&self, id: &Value) -> RepositoryResult<bool> {
        let merged = self.read_filter(Visibility::DeletedOnly, &self.id_filter(id));
        Ok(self
            .clear_deletion(&merged, WriteScope::One, RepositoryOperation::Restore)
            .await?
            > 0)
    }

    pub(crate) async fn restore_many(&self, filter: &Filter) -> RepositoryResult<u64> {
        let merged = self.read_filter(Visibility::DeletedOnly, filter);
        self.clear_deletion(&merged, WriteScope::Many, RepositoryOperation::Restore)
            .await
    }

    async fn clear_deletion(
        &self,
        merged: &Filter,
        scope: WriteScope,
        operation: RepositoryOperation,
    ) -> RepositoryResult<u64> {
        let overlay = self.soft_overlay(operation)?;
        let patch = self
            .entity
            .timestamps
            .decorate_update(overlay.clear_patch(), Utc::now());
        self.engine
            .update(&self.entity, merged, patch, scope)
            .await
            .map_err(|e| e.with_operation(operation))
    }

    /// Physically delete a record regardless of its deletion mark
    pub(crate) async fn force_delete(&self, id: &Value) -> RepositoryResult<bool> {
        let hooks = &self.entity.hooks;
        hooks.before_delete(id).await?;
        let merged = self.read_filter(Visibility::All, &self.id_filter(id));
        let deleted = self
            .engine
            .delete(&self.entity, &merged, WriteScope::One)
            .await
            .map_err(|e| e.with_operation(RepositoryOperation::ForceDelete))?;
        let success = deleted > 0;
        hooks.after_delete(success).await?;
        Ok(success)
    }
}

/// Serialize a payload into a record
pub(crate) fn to_document<D: Serialize>(
    data: &D,
    operation: RepositoryOperation,
) -> RepositoryResult<Document> {
    match serde_json::to_value(data) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(RepositoryError::validation_failed(format!(
            "payload must serialize to a JSON object, got {}",
            other
        ))
        .with_operation(operation)),
        Err(e) => Err(RepositoryError::serialization_error(operation, e.to_string())),
    }
}

/// Deserialize a stored record
pub(crate) fn from_document<T: DeserializeOwned>(
    record: Document,
    operation: RepositoryOperation,
) -> RepositoryResult<T> {
    serde_json::from_value(Value::Object(record))
        .map_err(|e| RepositoryError::serialization_error(operation, e.to_string()))
}

pub(crate) fn from_documents<T: DeserializeOwned>(
    records: Vec<Document>,
    operation: RepositoryOperation,
) -> RepositoryResult<Vec<T>> {
    records
        .into_iter()
        .map(|record| from_document(record, operation))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::RepositoryErrorKind;
    use serde_json::json;

    #[test]
    fn test_to_document_rejects_scalars() {
        let err = to_document(&json!(5), RepositoryOperation::Create).unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::ValidationFailed);
        assert_eq!(err.operation, RepositoryOperation::Create);

        let doc = to_document(&json!({"name": "Ann"}), RepositoryOperation::Create).unwrap();
        assert_eq!(doc["name"], json!("Ann"));
    }

    #[test]
    fn test_from_document_reports_serialization_error() {
        #[derive(serde::Deserialize, Debug)]
        #[allow(dead_code)]
        struct User {
            name: String,
        }

        let mut record = Document::new();
        record.insert("name".into(), json!(42));
        let err = from_document::<User>(record, RepositoryOperation::FindById).unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::SerializationError);
    }
}
