//! Repository error types
//!
//! This module provides structured error types for repository operations,
//! allowing fine-grained error handling and meaningful error messages.
//!
//! # Example
//!
//! ```rust
//! use polystore::repository::{RepositoryError, RepositoryErrorKind};
//!
//! let error = RepositoryError::not_found("User", "usr_123");
//! assert!(matches!(error.kind, RepositoryErrorKind::NotFound));
//! assert!(error.entity_id.is_some());
//! ```

use std::fmt;

/// Operation being performed when the repository error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryOperation {
    /// Finding a single entity by ID
    FindById,
    /// Finding the first entity matching a filter
    FindOne,
    /// Finding multiple entities with filters
    FindAll,
    /// Finding one page of entities
    FindPage,
    /// Counting entities matching filters
    Count,
    /// Checking if an entity exists
    Exists,
    /// Projecting a subset of fields
    Select,
    /// Listing distinct values of a field
    Distinct,
    /// Creating a new entity
    Create,
    /// Creating several entities at once
    CreateMany,
    /// Updating an existing entity
    Update,
    /// Updating every entity matching a filter
    UpdateMany,
    /// Deleting an entity
    Delete,
    /// Deleting every entity matching a filter
    DeleteMany,
    /// Updating or creating an entity
    Upsert,
    /// Soft deleting an entity
    SoftDelete,
    /// Restoring a soft-deleted entity
    Restore,
    /// Physically deleting an entity regardless of its deletion mark
    ForceDelete,
    /// Transaction bookkeeping (begin, commit, abort)
    Transaction,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FindById => write!(f, "find_by_id"),
            Self::FindOne => write!(f, "find_one"),
            Self::FindAll => write!(f, "find_all"),
            Self::FindPage => write!(f, "find_page"),
            Self::Count => write!(f, "count"),
            Self::Exists => write!(f, "exists"),
            Self::Select => write!(f, "select"),
            Self::Distinct => write!(f, "distinct"),
            Self::Create => write!(f, "create"),
            Self::CreateMany => write!(f, "create_many"),
            Self::Update => write!(f, "update"),
            Self::UpdateMany => write!(f, "update_many"),
            Self::Delete => write!(f, "delete"),
            Self::DeleteMany => write!(f, "delete_many"),
            Self::Upsert => write!(f, "upsert"),
            Self::SoftDelete => write!(f, "soft_delete"),
            Self::Restore => write!(f, "restore"),
            Self::ForceDelete => write!(f, "force_delete"),
            Self::Transaction => write!(f, "transaction"),
        }
    }
}

/// Category of repository error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryErrorKind {
    /// Entity was not found
    NotFound,
    /// Entity already exists (duplicate key)
    AlreadyExists,
    /// Database constraint violation
    ConstraintViolation,
    /// Malformed input to a public method
    ValidationFailed,
    /// Disallowed filter/sort field or missing required entity configuration
    Configuration,
    /// Failed to connect to database
    ConnectionFailed,
    /// Operation timed out
    Timeout,
    /// Underlying database error
    DatabaseError,
    /// Serialization or deserialization error
    SerializationError,
    /// Error raised by a lifecycle hook
    Hook,
    /// A transaction-scoped repository was used after its transaction ended
    TransactionClosed,
    /// Other unclassified error
    Other,
}

impl fmt::Display for RepositoryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::AlreadyExists => write!(f, "already_exists"),
            Self::ConstraintViolation => write!(f, "constraint_violation"),
            Self::ValidationFailed => write!(f, "validation_failed"),
            Self::Configuration => write!(f, "configuration"),
            Self::ConnectionFailed => write!(f, "connection_failed"),
            Self::Timeout => write!(f, "timeout"),
            Self::DatabaseError => write!(f, "database_error"),
            Self::SerializationError => write!(f, "serialization_error"),
            Self::Hook => write!(f, "hook"),
            Self::TransactionClosed => write!(f, "transaction_closed"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Structured repository error with operation context
///
/// Provides detailed information about what operation failed, why it failed,
/// and which entity was involved. Errors that originate in a backend driver keep
/// the engine's native `code` and `labels` so the transaction coordinator can
/// decide whether an attempt is worth retrying.
///
/// # Example
///
/// ```rust
/// use polystore::repository::{RepositoryError, RepositoryOperation};
///
/// let error = RepositoryError::database_error(RepositoryOperation::Update, "could not serialize access")
///     .with_code("40001");
/// assert_eq!(error.code.as_deref(), Some("40001"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryError {
    /// The operation being performed when the error occurred
    pub operation: RepositoryOperation,
    /// The category of error
    pub kind: RepositoryErrorKind,
    /// Human-readable error message
    pub message: String,
    /// The type of entity involved (e.g., "users", "orders")
    pub entity_type: Option<String>,
    /// The ID of the entity involved
    pub entity_id: Option<String>,
    /// Native backend error code (SQLSTATE or document server code)
    pub code: Option<String>,
    /// Backend error labels
    pub labels: Vec<String>,
}

impl RepositoryError {
    /// Create a new repository error
    pub fn new(
        operation: RepositoryOperation,
        kind: RepositoryErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
            entity_type: None,
            entity_id: None,
            code: None,
            labels: Vec::new(),
        }
    }

    /// Create a "not found" error with entity context
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(
            RepositoryOperation::FindById,
            RepositoryErrorKind::NotFound,
            "Entity not found",
        )
        .with_entity(entity_type, entity_id)
    }

    /// Create an "already exists" error with entity context
    pub fn already_exists(entity_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::new(
            RepositoryOperation::Create,
            RepositoryErrorKind::AlreadyExists,
            "Entity already exists",
        )
        .with_entity(entity_type, identifier)
    }

    /// Create a validation failed error
    ///
    /// # Example
    ///
    /// ```rust
    /// use polystore::repository::RepositoryError;
    ///
    /// let error = RepositoryError::validation_failed("`in` expects an array");
    /// ```
    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::new(
            RepositoryOperation::FindAll,
            RepositoryErrorKind::ValidationFailed,
            message,
        )
    }

    /// Create a configuration error
    ///
    /// Raised for filter or sort fields outside the entity's column whitelist and
    /// for missing required entity configuration. Never retried.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(
            RepositoryOperation::FindAll,
            RepositoryErrorKind::Configuration,
            message,
        )
    }

    /// Create a constraint violation error
    pub fn constraint_violation(
        operation: RepositoryOperation,
        message: impl Into<String>,
    ) -> Self {
        Self::new(operation, RepositoryErrorKind::ConstraintViolation, message)
    }

    /// Create a connection failed error
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(
            RepositoryOperation::FindById,
            RepositoryErrorKind::ConnectionFailed,
            message,
        )
    }

    /// Create a timeout error
    pub fn timeout(operation: RepositoryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, RepositoryErrorKind::Timeout, message)
    }

    /// Create a database error
    pub fn database_error(operation: RepositoryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, RepositoryErrorKind::DatabaseError, message)
    }

    /// Create a serialization error
    pub fn serialization_error(operation: RepositoryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, RepositoryErrorKind::SerializationError, message)
    }

    /// Create an error for a lifecycle hook to return
    pub fn hook(operation: RepositoryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, RepositoryErrorKind::Hook, message)
    }

    /// Create the error reported when a transaction-scoped repository outlives its attempt
    pub fn transaction_closed(operation: RepositoryOperation) -> Self {
        Self::new(
            operation,
            RepositoryErrorKind::TransactionClosed,
            "transaction-scoped repository used after its transaction ended",
        )
    }

    /// Add entity context to an existing error
    #[must_use]
    pub fn with_entity(
        mut self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Set the operation that caused the error
    #[must_use]
    pub fn with_operation(mut self, operation: RepositoryOperation) -> Self {
        self.operation = operation;
        self
    }

    /// Attach a native backend error code
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach a backend error label
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    /// Whether the backend attached the given label
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Whether the error originated in caller input, configuration or a hook
    ///
    /// Such errors never become retryable, whatever code they carry.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self.kind,
            RepositoryErrorKind::Configuration
                | RepositoryErrorKind::ValidationFailed
                | RepositoryErrorKind::Hook
                | RepositoryErrorKind::TransactionClosed
        )
    }
}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Repository {} error during {}: {}",
            self.kind, self.operation, self.message
        )?;
        if let (Some(ref entity_type), Some(ref entity_id)) = (&self.entity_type, &self.entity_id) {
            write!(f, " [{}: {}]", entity_type, entity_id)?;
        }
        if let Some(ref code) = self.code {
            write!(f, " (code {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for RepositoryError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_operation_display() {
        assert_eq!(format!("{}", RepositoryOperation::FindById), "find_by_id");
        assert_eq!(format!("{}", RepositoryOperation::FindPage), "find_page");
        assert_eq!(format!("{}", RepositoryOperation::CreateMany), "create_many");
        assert_eq!(format!("{}", RepositoryOperation::UpdateMany), "update_many");
        assert_eq!(format!("{}", RepositoryOperation::Upsert), "upsert");
        assert_eq!(format!("{}", RepositoryOperation::SoftDelete), "soft_delete");
        assert_eq!(format!("{}", RepositoryOperation::ForceDelete), "force_delete");
        assert_eq!(format!("{}", RepositoryOperation::Transaction), "transaction");
    }

    #[test]
    fn test_repository_error_kind_display() {
        assert_eq!(format!("{}", RepositoryErrorKind::NotFound), "not_found");
        assert_eq!(
            format!("{}", RepositoryErrorKind::Configuration),
            "configuration"
        );
        assert_eq!(
            format!("{}", RepositoryErrorKind::ValidationFailed),
            "validation_failed"
        );
        assert_eq!(format!("{}", RepositoryErrorKind::Hook), "hook");
        assert_eq!(
            format!("{}", RepositoryErrorKind::TransactionClosed),
            "transaction_closed"
        );
    }

    #[test]
    fn test_not_found_convenience() {
        let error = RepositoryError::not_found("users", "usr_123");
        assert_eq!(error.operation, RepositoryOperation::FindById);
        assert_eq!(error.kind, RepositoryErrorKind::NotFound);
        assert_eq!(error.entity_type, Some("users".to_string()));
        assert_eq!(error.entity_id, Some("usr_123".to_string()));
    }

    #[test]
    fn test_configuration_is_caller_error() {
        assert!(RepositoryError::configuration("password not allowed").is_caller_error());
        assert!(RepositoryError::validation_failed("bad").is_caller_error());
        assert!(
            RepositoryError::transaction_closed(RepositoryOperation::Create).is_caller_error()
        );
        assert!(RepositoryError::hook(RepositoryOperation::Create, "veto").is_caller_error());
        assert!(
            !RepositoryError::database_error(RepositoryOperation::Create, "boom").is_caller_error()
        );
    }

    #[test]
    fn test_code_and_labels() {
        let error = RepositoryError::database_error(RepositoryOperation::Update, "conflict")
            .with_code("112")
            .with_label("TransientTransactionError");
        assert_eq!(error.code.as_deref(), Some("112"));
        assert!(error.has_label("TransientTransactionError"));
    }

    #[test]
    fn test_with_operation() {
        let error = RepositoryError::connection_failed("Connection refused")
            .with_operation(RepositoryOperation::Create);
        assert_eq!(error.operation, RepositoryOperation::Create);
    }

    #[test]
    fn test_display_without_entity() {
        let error = RepositoryError::database_error(RepositoryOperation::Create, "Query failed");
        let display = format!("{}", error);
        assert!(display.contains("database_error"));
        assert!(display.contains("create"));
        assert!(display.contains("Query failed"));
        assert!(!display.contains("["));
    }

    #[test]
    fn test_display_with_entity_and_code() {
        let error = RepositoryError::not_found("users", "42").with_code("P0002");
        let display = format!("{}", error);
        assert!(display.contains("[users: 42]"));
        assert!(display.contains("(code P0002)"));
    }

    #[test]
    fn test_error_is_error_trait() {
        let error: Box<dyn std::error::Error> = Box::new(RepositoryError::not_found("users", "1"));
        assert!(error.to_string().contains("not_found"));
    }
}
