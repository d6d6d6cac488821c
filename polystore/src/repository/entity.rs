//! Per-entity configuration

use std::fmt;
use std::sync::Arc;

use super::compile::ColumnWhitelist;
use super::error::RepositoryError;
use super::filter::Filter;
use super::hooks::{HookPipeline, RepositoryHooks};
use super::overlay::{SoftDeleteOverlay, TimestampOverlay};
use super::traits::RepositoryResult;

/// Storage engine family backing a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Schema-less document store
    Document,
    /// Schema-ful relational store
    Relational,
}

impl Backend {
    /// Default primary-key field name for this backend
    pub const fn default_primary_key(self) -> &'static str {
        match self {
            Self::Document => "_id",
            Self::Relational => "id",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Document => write!(f, "document"),
            Self::Relational => write!(f, "relational"),
        }
    }
}

/// Configuration of one collection or table
///
/// # Example
///
/// ```rust
/// use polystore::repository::EntityConfig;
///
/// let users = EntityConfig::table("users")
///     .columns(["id", "name", "email"])
///     .primary_key("id")
///     .soft_delete(true)
///     .timestamps(true);
/// assert_eq!(users.name, "users");
/// ```
#[derive(Clone)]
pub struct EntityConfig {
    /// Collection or table name
    pub name: String,
    /// Primary-key field; defaults per backend when unset
    pub primary_key: Option<String>,
    /// Relational column whitelist; empty means unrestricted
    pub columns: Vec<String>,
    /// Filter merged into every query at lowest precedence
    pub default_filter: Filter,
    /// Whether deletes become timestamp updates
    pub soft_delete: bool,
    /// Soft-delete field name
    pub soft_delete_field: String,
    /// Whether creation and update instants are stamped
    pub timestamps: bool,
    pub created_at_field: String,
    pub updated_at_field: String,
    /// Reject unknown filter operators instead of ignoring them
    pub strict_operators: bool,
    /// Lifecycle hooks
    pub hooks: Option<Arc<dyn RepositoryHooks>>,
}

impl EntityConfig {
    /// Configuration for an entity named `name` with every overlay disabled
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: None,
            columns: Vec::new(),
            default_filter: Filter::new(),
            soft_delete: false,
            soft_delete_field: "deleted_at".to_string(),
            timestamps: false,
            created_at_field: "created_at".to_string(),
            updated_at_field: "updated_at".to_string(),
            strict_operators: false,
            hooks: None,
        }
    }

    /// Configuration for a relational table
    pub fn table(name: impl Into<String>) -> Self {
        Self::new(name)
    }

    /// Configuration for a document collection
    pub fn collection(name: impl Into<String>) -> Self {
        Self::new(name)
    }

    #[must_use]
    pub fn primary_key(mut self, field: impl Into<String>) -> Self {
        self.primary_key = Some(field.into());
        self
    }

    #[must_use]
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn default_filter(mut self, filter: Filter) -> Self {
        self.default_filter = filter;
        self
    }

    #[must_use]
    pub fn soft_delete(mut self, enabled: bool) -> Self {
        self.soft_delete = enabled;
        self
    }

    #[must_use]
    pub fn soft_delete_field(mut self, field: impl Into<String>) -> Self {
        self.soft_delete_field = field.into();
        self
    }

    #[must_use]
    pub fn timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }

    #[must_use]
    pub fn timestamp_fields(
        mut self,
        created_at: impl Into<String>,
        updated_at: impl Into<String>,
    ) -> Self {
        self.created_at_field = created_at.into();
        self.updated_at_field = updated_at.into();
        self
    }

    #[must_use]
    pub fn strict_operators(mut self, strict: bool) -> Self {
        self.strict_operators = strict;
        self
    }

    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn RepositoryHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Primary-key field for `backend`
    pub fn primary_key_for(&self, backend: Backend) -> &str {
        self.primary_key
            .as_deref()
            .unwrap_or_else(|| backend.default_primary_key())
    }

    /// Reject configurations that cannot back a repository
    pub fn validate(&self) -> RepositoryResult<()> {
        if self.name.trim().is_empty() {
            return Err(RepositoryError::configuration(
                "entity configuration requires a collection or table name",
            ));
        }
        if matches!(self.primary_key.as_deref(), Some(pk) if pk.trim().is_empty()) {
            return Err(RepositoryError::configuration(format!(
                "primary key of `{}` must not be empty",
                self.name
            )));
        }
        if self.soft_delete && self.soft_delete_field.trim().is_empty() {
            return Err(RepositoryError::configuration(format!(
                "soft-delete field of `{}` must not be empty",
                self.name
            )));
        }
        if self.timestamps
            && (self.created_at_field.trim().is_empty() || self.updated_at_field.trim().is_empty())
        {
            return Err(RepositoryError::configuration(format!(
                "timestamp fields of `{}` must not be empty",
                self.name
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for EntityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityConfig")
            .field("name", &self.name)
            .field("primary_key", &self.primary_key)
            .field("columns", &self.columns)
            .field("default_filter", &self.default_filter)
            .field("soft_delete", &self.soft_delete)
            .field("soft_delete_field", &self.soft_delete_field)
            .field("timestamps", &self.timestamps)
            .field("strict_operators", &self.strict_operators)
            .field("hooks", &self.hooks.is_some())
            .finish()
    }
}

/// Validated, backend-resolved view of an [`EntityConfig`]
#[derive(Debug)]
pub(crate) struct EntitySettings {
    pub(crate) name: String,
    pub(crate) primary_key: String,
    pub(crate) whitelist: ColumnWhitelist,
    pub(crate) default_filter: Filter,
    pub(crate) soft_delete: Option<SoftDeleteOverlay>,
    pub(crate) timestamps: TimestampOverlay,
    pub(crate) strict_operators: bool,
    pub(crate) hooks: HookPipeline,
}

impl EntitySettings {
    pub(crate) fn resolve(config: EntityConfig, backend: Backend) -> RepositoryResult<Self> {
        config.validate()?;

        let primary_key = config.primary_key_for(backend).to_string();
        let soft_delete = config
            .soft_delete
            .then(|| SoftDeleteOverlay::new(config.soft_delete_field.as_str()));
        let timestamps = TimestampOverlay::new(
            config.timestamps,
            config.created_at_field.as_str(),
            config.updated_at_field.as_str(),
        );

        let whitelist = match backend {
            Backend::Document => ColumnWhitelist::default(),
            Backend::Relational => {
                let mut always = vec![primary_key.as_str()];
                if let Some(overlay) = &soft_delete {
                    always.push(overlay.field());
                }
                if timestamps.is_enabled() {
                    always.extend(timestamps.fields());
                }
                ColumnWhitelist::new(config.columns.iter().map(String::as_str), always)
            }
        };

        Ok(Self {
            name: config.name,
            primary_key,
            whitelist,
            default_filter: config.default_filter,
            soft_delete,
            timestamps,
            strict_operators: config.strict_operators,
            hooks: HookPipeline::new(config.hooks),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::RepositoryErrorKind;

    #[test]
    fn test_primary_key_defaults_per_backend() {
        let config = EntityConfig::new("users");
        assert_eq!(config.primary_key_for(Backend::Document), "_id");
        assert_eq!(config.primary_key_for(Backend::Relational), "id");
        let config = config.primary_key("uid");
        assert_eq!(config.primary_key_for(Backend::Document), "uid");
    }

    #[test]
    fn test_empty_name_rejected() {
        let err = EntityConfig::new("  ").validate().unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::Configuration);
    }

    #[test]
    fn test_empty_soft_delete_field_rejected() {
        let err = EntityConfig::new("users")
            .soft_delete(true)
            .soft_delete_field("")
            .validate()
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::Configuration);
    }

    #[test]
    fn test_relational_whitelist_admits_key_and_overlay_fields() {
        let settings = EntitySettings::resolve(
            EntityConfig::table("users")
                .columns(["name", "email"])
                .soft_delete(true)
                .timestamps(true),
            Backend::Relational,
        )
        .unwrap();
        for field in ["id", "name", "email", "deleted_at", "created_at", "updated_at"] {
            assert!(settings.whitelist.allows(field), "{} should be allowed", field);
        }
        assert!(!settings.whitelist.allows("password"));
    }

    #[test]
    fn test_document_backend_ignores_whitelist() {
        let settings = EntitySettings::resolve(
            EntityConfig::collection("events").columns(["kind"]),
            Backend::Document,
        )
        .unwrap();
        assert!(settings.whitelist.allows("anything"));
        assert_eq!(settings.primary_key, "_id");
        assert!(settings.soft_delete.is_none());
    }
}
