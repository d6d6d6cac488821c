//! Repository layer: one CRUD/query contract over document and relational backends
//!
//! This module provides the [`Repository`] and [`SoftDeleteRepository`]
//! traits, the declarative [`Filter`] and its backend compilers, pagination,
//! the timestamp and soft-delete overlays, lifecycle hooks, and the
//! [`RepositoryFactory`] that composes them for one entity.
//!
//! # Features
//!
//! - **Generic CRUD**: [`Repository`] trait for create, read, update, delete, upsert and projection
//! - **Soft Delete**: [`SoftDeleteRepository`] for restorable deletes and audit trails
//! - **Filtering**: [`Filter`] compiled to a document query or relational [`FilterCondition`]s
//! - **Pagination**: [`PageOptions`] and the uniform [`PageResult`] envelope
//! - **Hooks**: [`RepositoryHooks`] around create, update and delete
//!
//! # Example
//!
//! ```rust,ignore
//! use polystore::repository::{EntityConfig, Filter, PageOptions, Repository, RepositoryFactory};
//! use serde_json::json;
//!
//! let factory = RepositoryFactory::relational(driver);
//! let users = factory.basic::<User>(
//!     EntityConfig::table("users").columns(["id", "name", "email"]),
//! )?;
//!
//! let ann = users.create(json!({"name": "Ann"})).await?;
//! let page = users
//!     .find_page(PageOptions::new(1, 20).filter(Filter::new().eq("name", "Ann")))
//!     .await?;
//! ```

pub mod compile;
mod core;
pub(crate) mod engine;
mod entity;
mod error;
mod factory;
mod filter;
mod hooks;
mod overlay;
mod pagination;
mod traits;

/// A stored record: a JSON object keyed by field name
pub type Document = serde_json::Map<String, serde_json::Value>;

// Re-export all public types
pub use compile::{compile_document, compile_relational, ColumnWhitelist};
pub use entity::{Backend, EntityConfig};
pub use error::{RepositoryError, RepositoryErrorKind, RepositoryOperation};
pub use factory::{BasicRepository, EntityRepository, RepositoryFactory, SoftDeletableRepository};
pub use filter::{
    FieldFilter, Filter, FilterCondition, FilterOperator, OrderDirection, Sort, SortField,
};
pub use hooks::{HookContext, HookOperation, RepositoryHooks};
pub use overlay::{timestamp, SoftDeleteOverlay, TimestampOverlay, Visibility};
pub use pagination::{offset, shape, PageOptions, PageResult, Pagination, QueryOptions};
pub use traits::{Repository, RepositoryResult, SoftDeleteRepository};
