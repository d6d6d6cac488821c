//! Backend driver interfaces and implementations
//!
//! The repository layer talks to storage only through these traits, so any
//! engine that can provide the primitive operations plugs in.
//!
//! # Available Backends
//!
//! - **Memory** (always compiled): snapshot-isolated document and relational
//!   drivers behind `memory://` URLs
//! - **PostgreSQL** (`postgres` feature): relational driver on a `sqlx` pool

mod document;
pub mod memory;
mod relational;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use document::{DocumentDriver, DocumentSession, FindSpec};
pub use memory::{MemoryDocumentDriver, MemoryRelationalDriver, MemoryStats, TableSchema};
pub use relational::{
    CountQuery, DeleteQuery, InsertQuery, RelationalDriver, RelationalExecutor,
    RelationalTransaction, SelectQuery, UpdateQuery,
};

#[cfg(feature = "postgres")]
pub use postgres::PgDriver;
