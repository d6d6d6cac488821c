//! Repository factory
//!
//! A [`RepositoryFactory`] is bound to one backend engine (and, inside a
//! transaction, to one attempt's session or transaction). It turns an
//! [`EntityConfig`] into a typed repository.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use super::core::RepositoryCore;
use super::engine::{DocumentEngine, Engine, RelationalEngine};
use super::entity::{Backend, EntityConfig, EntitySettings};
use super::error::RepositoryError;
use super::traits::sealed::{CoreAccess, SoftDeleteEnabled};
use super::traits::RepositoryResult;
use crate::driver::{DocumentDriver, RelationalDriver};

/// Repository for an entity without soft delete
pub struct BasicRepository<T> {
    core: RepositoryCore,
    _marker: PhantomData<fn() -> T>,
}

/// Repository for an entity with soft delete enabled
///
/// Implements [`SoftDeleteRepository`](super::SoftDeleteRepository) on top of
/// [`Repository`](super::Repository).
pub struct SoftDeletableRepository<T> {
    core: RepositoryCore,
    _marker: PhantomData<fn() -> T>,
}

macro_rules! typed_repository {
    ($name:ident) => {
        impl<T> $name<T> {
            fn from_core(core: RepositoryCore) -> Self {
                Self {
                    core,
                    _marker: PhantomData,
                }
            }
        }

        impl<T> Clone for $name<T> {
            fn clone(&self) -> Self {
                Self::from_core(self.core.clone())
            }
        }

        impl<T> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("entity", &self.core.name())
                    .field("backend", &self.core.backend())
                    .finish()
            }
        }

        impl<T: DeserializeOwned + Send> CoreAccess<T> for $name<T> {
            fn core(&self) -> &RepositoryCore {
                &self.core
            }
        }
    };
}

typed_repository!(BasicRepository);
typed_repository!(SoftDeletableRepository);

impl<T> SoftDeleteEnabled for SoftDeletableRepository<T> {}

/// Repository whose capabilities were chosen from the entity configuration
pub enum EntityRepository<T> {
    Basic(BasicRepository<T>),
    SoftDeletable(SoftDeletableRepository<T>),
}

impl<T> EntityRepository<T> {
    pub fn is_soft_deletable(&self) -> bool {
        matches!(self, Self::SoftDeletable(_))
    }

    /// Borrow the soft-delete capable repository, if soft delete is enabled
    pub fn as_soft_deletable(&self) -> Option<&SoftDeletableRepository<T>> {
        match self {
            Self::SoftDeletable(repo) => Some(repo),
            Self::Basic(_) => None,
        }
    }
}

impl<T> Clone for EntityRepository<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Basic(repo) => Self::Basic(repo.clone()),
            Self::SoftDeletable(repo) => Self::SoftDeletable(repo.clone()),
        }
    }
}

impl<T> fmt::Debug for EntityRepository<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic(repo) => f.debug_tuple("Basic").field(repo).finish(),
            Self::SoftDeletable(repo) => f.debug_tuple("SoftDeletable").field(repo).finish(),
        }
    }
}

impl<T: DeserializeOwned + Send> CoreAccess<T> for EntityRepository<T> {
    fn core(&self) -> &RepositoryCore {
        match self {
            Self::Basic(repo) => &repo.core,
            Self::SoftDeletable(repo) => &repo.core,
        }
    }
}

/// Builds repositories bound to one backend engine
#[derive(Clone)]
pub struct RepositoryFactory {
    engine: Arc<dyn Engine>,
}

impl RepositoryFactory {
    pub(crate) fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    /// Factory over a document driver, outside any transaction
    pub fn document(driver: Arc<dyn DocumentDriver>) -> Self {
        Self::new(Arc::new(DocumentEngine::new(driver)))
    }

    /// Factory over a relational driver, outside any transaction
    pub fn relational(driver: Arc<dyn RelationalDriver>) -> Self {
        Self::new(Arc::new(RelationalEngine::new(driver)))
    }

    pub fn backend(&self) -> Backend {
        self.engine.backend()
    }

    fn core(&self, config: EntityConfig) -> RepositoryResult<RepositoryCore> {
        let settings = EntitySettings::resolve(config, self.backend())?;
        tracing::debug!(
            entity = %settings.name,
            backend = %self.backend(),
            soft_delete = settings.soft_delete.is_some(),
            "repository created"
        );
        Ok(RepositoryCore::new(settings, self.engine.clone()))
    }

    /// Build a repository whose capabilities follow `config.soft_delete`
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error if the config is invalid.
    pub fn create<T>(&self, config: EntityConfig) -> RepositoryResult<EntityRepository<T>> {
        let core = self.core(config)?;
        Ok(if core.is_soft_deletable() {
            EntityRepository::SoftDeletable(SoftDeletableRepository::from_core(core))
        } else {
            EntityRepository::Basic(BasicRepository::from_core(core))
        })
    }

    /// Build a repository for an entity without soft delete
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error if soft delete is enabled in `config`.
    pub fn basic<T>(&self, config: EntityConfig) -> RepositoryResult<BasicRepository<T>> {
        if config.soft_delete {
            return Err(RepositoryError::configuration(format!(
                "`{}` has soft delete enabled; use soft_deletable()",
                config.name
            )));
        }
        Ok(BasicRepository::from_core(self.core(config)?))
    }

    /// Build a repository for an entity with soft delete enabled
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error if soft delete is disabled in `config`.
    pub fn soft_deletable<T>(
        &self,
        config: EntityConfig,
    ) -> RepositoryResult<SoftDeletableRepository<T>> {
        if !config.soft_delete {
            return Err(RepositoryError::configuration(format!(
                "`{}` does not have soft delete enabled",
                config.name
            )));
        }
        Ok(SoftDeletableRepository::from_core(self.core(config)?))
    }
}

impl fmt::Debug for RepositoryFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryFactory")
            .field("backend", &self.backend())
            .finish()
    }
}
