//! Transactions with automatic retry of transient failures
//!
//! [`DocumentDatabase::with_transaction`](crate::database::DocumentDatabase::with_transaction)
//! and [`RelationalDatabase::with_transaction`](crate::database::RelationalDatabase::with_transaction)
//! run a callback inside a native transaction. Errors the backend reports as
//! transient are retried with exponential backoff; everything else is rethrown
//! at once.
//!
//! # Example
//!
//! ```rust,ignore
//! use polystore::prelude::*;
//!
//! let total = db
//!     .with_transaction(TransactionOptions::default().retries(2), |ctx| async move {
//!         let accounts = ctx.create_repository::<Account>(EntityConfig::table("accounts"))?;
//!         accounts.update_by_id(1, json!({"balance": 90})).await?;
//!         accounts.update_by_id(2, json!({"balance": 110})).await?;
//!         accounts.count(Filter::new()).await
//!     })
//!     .await?;
//! ```

mod classify;
mod context;
pub(crate) mod coordinator;
mod options;

pub use classify::{
    backoff_delay, classify, ErrorClass, RETRYABLE_DOCUMENT_CODES, RETRYABLE_SQLSTATES,
    TRANSIENT_TRANSACTION_LABEL,
};
pub use context::{TransactionContext, TransactionHandle};
pub use options::{IsolationLevel, TransactionOptions, TransactionSettings, DEFAULT_RETRIES};
