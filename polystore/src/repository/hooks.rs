//! Lifecycle hooks around create, update and delete
//!
//! Before-hooks may rewrite the payload by returning `Some(new_payload)`.
//! After-hooks are awaited observers without veto. An error from any hook
//! aborts the operation and propagates unchanged.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use polystore::repository::{Document, HookContext, RepositoryHooks, RepositoryResult};
//! use serde_json::json;
//!
//! struct LowercaseEmail;
//!
//! #[async_trait]
//! impl RepositoryHooks for LowercaseEmail {
//!     async fn before_create(&self, ctx: &HookContext) -> RepositoryResult<Option<Document>> {
//!         let mut data = ctx.data.clone();
//!         if let Some(email) = data.get("email").and_then(|v| v.as_str()) {
//!             let lowered = email.to_lowercase();
//!             data.insert("email".into(), json!(lowered));
//!         }
//!         Ok(Some(data))
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::traits::RepositoryResult;
use super::Document;

/// Operation a before-hook is running for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookOperation {
    Create,
    Update,
    Delete,
    /// Either path of an upsert
    Upsert,
}

impl fmt::Display for HookOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Upsert => write!(f, "upsert"),
        }
    }
}

/// Input to a before-hook
#[derive(Debug, Clone, PartialEq)]
pub struct HookContext {
    /// Payload about to be written
    pub data: Document,
    /// Operation being performed
    pub operation: HookOperation,
    /// Whether the call is part of a bulk operation
    pub is_bulk: bool,
}

impl HookContext {
    pub fn new(data: Document, operation: HookOperation, is_bulk: bool) -> Self {
        Self {
            data,
            operation,
            is_bulk,
        }
    }
}

/// User-supplied lifecycle callbacks
///
/// Every method defaults to a no-op, so implementations override only what
/// they need.
#[async_trait]
pub trait RepositoryHooks: Send + Sync {
    /// Runs before a record is created; `Some` replaces the payload
    async fn before_create(&self, _ctx: &HookContext) -> RepositoryResult<Option<Document>> {
        Ok(None)
    }

    /// Runs after a record is created with the persisted record
    async fn after_create(&self, _entity: Option<&Document>) -> RepositoryResult<()> {
        Ok(())
    }

    /// Runs before records are updated; `Some` replaces the patch
    async fn before_update(&self, _ctx: &HookContext) -> RepositoryResult<Option<Document>> {
        Ok(None)
    }

    /// Runs after a single-record update with the re-read record, if any
    async fn after_update(&self, _entity: Option<&Document>) -> RepositoryResult<()> {
        Ok(())
    }

    /// Runs before a record is deleted by id
    async fn before_delete(&self, _id: &Value) -> RepositoryResult<()> {
        Ok(())
    }

    /// Runs after a delete by id with whether anything was deleted
    async fn after_delete(&self, _success: bool) -> RepositoryResult<()> {
        Ok(())
    }
}

/// Optional hooks bundle with payload-replacement semantics applied
#[derive(Clone, Default)]
pub(crate) struct HookPipeline {
    hooks: Option<Arc<dyn RepositoryHooks>>,
}

impl HookPipeline {
    pub(crate) fn new(hooks: Option<Arc<dyn RepositoryHooks>>) -> Self {
        Self { hooks }
    }

    pub(crate) async fn before_create(
        &self,
        data: Document,
        operation: HookOperation,
        is_bulk: bool,
    ) -> RepositoryResult<Document> {
        let Some(hooks) = &self.hooks else {
            return Ok(data);
        };
        let ctx = HookContext::new(data, operation, is_bulk);
        let replaced = hooks.before_create(&ctx).await?;
        Ok(replaced.unwrap_or(ctx.data))
    }

    pub(crate) async fn before_update(
        &self,
        data: Document,
        operation: HookOperation,
        is_bulk: bool,
    ) -> RepositoryResult<Document> {
        let Some(hooks) = &self.hooks else {
            return Ok(data);
        };
        let ctx = HookContext::new(data, operation, is_bulk);
        let replaced = hooks.before_update(&ctx).await?;
        Ok(replaced.unwrap_or(ctx.data))
    }

    pub(crate) async fn after_create(&self, entity: Option<&Document>) -> RepositoryResult<()> {
        match &self.hooks {
            Some(hooks) => hooks.after_create(entity).await,
            None => Ok(()),
        }
    }

    pub(crate) async fn after_update(&self, entity: Option<&Document>) -> RepositoryResult<()> {
        match &self.hooks {
            Some(hooks) => hooks.after_update(entity).await,
            None => Ok(()),
        }
    }

    pub(crate) async fn before_delete(&self, id: &Value) -> RepositoryResult<()> {
        match &self.hooks {
            Some(hooks) => hooks.before_delete(id).await,
            None => Ok(()),
        }
    }

    pub(crate) async fn after_delete(&self, success: bool) -> RepositoryResult<()> {
        match &self.hooks {
            Some(hooks) => hooks.after_delete(success).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for HookPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookPipeline")
            .field("hooks", &self.hooks.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{RepositoryError, RepositoryErrorKind, RepositoryOperation};
    use serde_json::json;

    struct Stamp;

    #[async_trait]
    impl RepositoryHooks for Stamp {
        async fn before_create(&self, ctx: &HookContext) -> RepositoryResult<Option<Document>> {
            let mut data = ctx.data.clone();
            data.insert("bulk".into(), json!(ctx.is_bulk));
            data.insert("op".into(), json!(ctx.operation.to_string()));
            Ok(Some(data))
        }

        async fn before_delete(&self, id: &Value) -> RepositoryResult<()> {
            if id == &json!(0) {
                return Err(RepositoryError::hook(
                    RepositoryOperation::Delete,
                    "record 0 is protected",
                ));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pipeline_without_hooks_is_identity() {
        let pipeline = HookPipeline::default();
        let mut data = Document::new();
        data.insert("a".into(), json!(1));
        let out = pipeline
            .before_update(data.clone(), HookOperation::Update, false)
            .await
            .unwrap();
        assert_eq!(out, data);
        assert!(pipeline.after_delete(true).await.is_ok());
    }

    #[tokio::test]
    async fn test_before_create_replaces_payload() {
        let pipeline = HookPipeline::new(Some(Arc::new(Stamp)));
        let out = pipeline
            .before_create(Document::new(), HookOperation::Upsert, true)
            .await
            .unwrap();
        assert_eq!(out["bulk"], json!(true));
        assert_eq!(out["op"], json!("upsert"));
    }

    #[tokio::test]
    async fn test_default_before_update_keeps_payload() {
        let pipeline = HookPipeline::new(Some(Arc::new(Stamp)));
        let mut data = Document::new();
        data.insert("name".into(), json!("Bo"));
        let out = pipeline
            .before_update(data.clone(), HookOperation::Update, false)
            .await
            .unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_hook_error_propagates_unchanged() {
        let pipeline = HookPipeline::new(Some(Arc::new(Stamp)));
        let err = pipeline.before_delete(&json!(0)).await.unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::Hook);
        assert_eq!(err.message, "record 0 is protected");
    }
}
