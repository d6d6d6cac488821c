//! Per-attempt transaction context handed to callbacks

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::driver::{DocumentSession, RelationalTransaction};
use crate::repository::{
    Backend, EntityConfig, EntityRepository, RepositoryFactory, RepositoryResult,
};

/// Native handle of the transaction backing one attempt
#[derive(Clone)]
pub enum TransactionHandle {
    /// Client session with an open transaction
    Document(Arc<dyn DocumentSession>),
    /// Open relational transaction
    Relational(Arc<dyn RelationalTransaction>),
}

impl TransactionHandle {
    pub fn backend(&self) -> Backend {
        match self {
            Self::Document(_) => Backend::Document,
            Self::Relational(_) => Backend::Relational,
        }
    }

    pub(crate) async fn commit(&self) -> RepositoryResult<()> {
        match self {
            Self::Document(session) => session.commit_transaction().await?,
            Self::Relational(tx) => tx.commit().await?,
        }
        Ok(())
    }

    pub(crate) async fn abort(&self) -> RepositoryResult<()> {
        match self {
            Self::Document(session) => session.abort_transaction().await?,
            Self::Relational(tx) => tx.rollback().await?,
        }
        Ok(())
    }

    /// Release the native resources; the relational transaction is already
    /// finished by commit or abort
    pub(crate) async fn release(&self) -> RepositoryResult<()> {
        if let Self::Document(session) = self {
            session.end_session().await?;
        }
        Ok(())
    }
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Document(session) => f.debug_tuple("Document").field(&session.id()).finish(),
            Self::Relational(_) => f.write_str("Relational"),
        }
    }
}

/// What a transaction callback receives on each attempt
///
/// Repositories created here run inside the attempt's transaction and stop
/// working once the attempt ends.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    handle: TransactionHandle,
    factory: RepositoryFactory,
    attempt: u32,
}

impl TransactionContext {
    pub(crate) fn new(handle: TransactionHandle, factory: RepositoryFactory, attempt: u32) -> Self {
        Self {
            handle,
            factory,
            attempt,
        }
    }

    /// The native transaction handle
    pub fn transaction(&self) -> &TransactionHandle {
        &self.handle
    }

    /// Zero-based attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Factory bound to this attempt
    pub fn factory(&self) -> &RepositoryFactory {
        &self.factory
    }

    /// Build a transaction-scoped repository
    pub fn create_repository<T>(&self, config: EntityConfig) -> RepositoryResult<EntityRepository<T>>
    where
        T: DeserializeOwned + Send,
    {
        self.factory.create(config)
    }
}
