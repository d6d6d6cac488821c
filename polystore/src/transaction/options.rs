//! Transaction options

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::repository::RepositoryError;

/// SQL isolation level; ignored by document backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            Self::ReadCommitted => write!(f, "READ COMMITTED"),
            Self::RepeatableRead => write!(f, "REPEATABLE READ"),
            Self::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "read_uncommitted" => Ok(Self::ReadUncommitted),
            "read_committed" => Ok(Self::ReadCommitted),
            "repeatable_read" => Ok(Self::RepeatableRead),
            "serializable" => Ok(Self::Serializable),
            _ => Err(RepositoryError::validation_failed(format!(
                "unknown isolation level `{}`",
                s
            ))),
        }
    }
}

/// Default number of retries after the first attempt
pub const DEFAULT_RETRIES: u32 = 3;

/// Options for one transactional unit of work
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use polystore::transaction::{IsolationLevel, TransactionOptions};
///
/// let options = TransactionOptions::default()
///     .isolation_level(IsolationLevel::Serializable)
///     .timeout(Duration::from_secs(5))
///     .retries(2);
/// assert_eq!(options.retries, 2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Relational isolation level; driver default when unset
    pub isolation_level: Option<IsolationLevel>,
    /// Bound on a single attempt (statement timeout or max commit time)
    pub timeout: Option<Duration>,
    /// Retries after the first attempt for transient failures
    pub retries: u32,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            isolation_level: None,
            timeout: None,
            retries: DEFAULT_RETRIES,
        }
    }
}

impl TransactionOptions {
    #[must_use]
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// The part of the options a driver needs to open a transaction
    pub fn settings(&self) -> TransactionSettings {
        TransactionSettings {
            isolation_level: self.isolation_level,
            timeout: self.timeout,
        }
    }
}

/// Per-attempt settings handed to a driver when opening a transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionSettings {
    pub isolation_level: Option<IsolationLevel>,
    pub timeout: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retries() {
        let options = TransactionOptions::default();
        assert_eq!(options.retries, 3);
        assert!(options.isolation_level.is_none());
        assert!(options.timeout.is_none());
    }

    #[test]
    fn test_isolation_level_display() {
        assert_eq!(IsolationLevel::Serializable.to_string(), "SERIALIZABLE");
        assert_eq!(IsolationLevel::RepeatableRead.to_string(), "REPEATABLE READ");
    }

    #[test]
    fn test_isolation_level_parse() {
        assert_eq!(
            "read committed".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "REPEATABLE-READ".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn test_settings() {
        let settings = TransactionOptions::default()
            .isolation_level(IsolationLevel::Serializable)
            .timeout(Duration::from_millis(250))
            .settings();
        assert_eq!(settings.isolation_level, Some(IsolationLevel::Serializable));
        assert_eq!(settings.timeout, Some(Duration::from_millis(250)));
    }
}
