//! # polystore
//!
//! One transactional repository contract over document and relational stores.
//!
//! ## Features
//!
//! - **Repositories**: typed CRUD, paging, projection and upsert per entity
//! - **Filters**: one declarative filter compiled to a document query or a
//!   parameterized relational condition list
//! - **Overlays**: automatic `created_at`/`updated_at` stamping and soft delete
//! - **Hooks**: before/after callbacks around create, update and delete
//! - **Transactions**: callback-scoped transactions with classified retries and
//!   exponential backoff
//! - **Drivers**: in-memory document and relational engines, PostgreSQL via
//!   `sqlx` (`postgres` feature)
//!
//! ## Example
//!
//! ```rust,no_run
//! use polystore::prelude::*;
//! use serde::Deserialize;
//! use serde_json::json;
//!
//! #[derive(Debug, Deserialize)]
//! struct User {
//!     id: i64,
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let db = Database::connect(&DatabaseConfig::Relational(RelationalConfig::new("memory://")))
//!         .await?;
//!     let users = db.repository::<User>(EntityConfig::table("users").columns(["id", "name"]))?;
//!
//!     let ann = users.create(json!({"name": "Ann"})).await?;
//!     let found = users.find_by_id(ann.id).await?;
//!     assert_eq!(found.map(|u| u.name).as_deref(), Some("Ann"));
//!
//!     let renamed = db
//!         .with_transaction(config.transaction_options(), |ctx| async move {
//!             let users = ctx.create_repository::<User>(EntityConfig::table("users"))?;
//!             users.update_by_id(1, json!({"name": "Anne"})).await
//!         })
//!         .await?;
//!     assert!(renamed.is_some());
//!
//!     db.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod database;
pub mod driver;
pub mod error;
pub mod observability;
pub mod repository;
pub mod transaction;

pub use config::Config;
pub use database::{Database, DatabaseConfig, DocumentDatabase, RelationalDatabase};
pub use error::{Error, Result};

/// Commonly used types and traits
pub mod prelude {
    pub use crate::config::{Config, ServiceConfig, TransactionConfig};
    pub use crate::database::{
        Database, DatabaseConfig, DocumentConfig, DocumentDatabase, RelationalConfig,
        RelationalDatabase,
    };
    pub use crate::error::{DatabaseError, DatabaseErrorKind, DatabaseOperation, Error, Result};
    pub use crate::observability::init_tracing;

    pub use crate::repository::{
        Backend, BasicRepository, EntityConfig, EntityRepository, Filter, FilterCondition,
        FilterOperator, HookContext, OrderDirection, PageOptions, PageResult, Pagination,
        QueryOptions, Repository, RepositoryError, RepositoryErrorKind, RepositoryFactory,
        RepositoryHooks, RepositoryOperation, RepositoryResult, SoftDeletableRepository,
        SoftDeleteRepository, Sort,
    };
    pub use crate::transaction::{
        IsolationLevel, TransactionContext, TransactionHandle, TransactionOptions,
    };

    pub use async_trait::async_trait;
    pub use serde::{Deserialize, Serialize};
}
