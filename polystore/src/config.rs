//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: POLYSTORE_, nested keys split on `__`)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/polystore/{service_name}/config.toml
//! 4. System directory: /etc/polystore/{service_name}/config.toml
//! 5. Default values
//!
//! ```toml
//! [service]
//! name = "billing"
//! log_level = "debug"
//!
//! [database]
//! type = "relational"
//! url = "postgres://billing@localhost/billing"
//!
//! [transaction]
//! retries = 5
//! timeout_ms = 2000
//! isolation_level = "serializable"
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::database::DatabaseConfig;
use crate::error::Result;
use crate::transaction::{IsolationLevel, TransactionOptions, DEFAULT_RETRIES};

const ENV_PREFIX: &str = "POLYSTORE_";
const APP_DIR: &str = "polystore";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,

    /// Database configuration (optional)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Defaults for transactional units of work
    #[serde(default)]
    pub transaction: TransactionConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,

    /// Log level or `EnvFilter` directive (e.g. `info,polystore=debug`)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Transaction defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionConfig {
    /// Retries after the first attempt
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Bound on one attempt in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Relational isolation level
    #[serde(default)]
    pub isolation_level: Option<IsolationLevel>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            timeout_ms: None,
            isolation_level: None,
        }
    }
}

impl TransactionConfig {
    pub fn options(&self) -> TransactionOptions {
        let mut options = TransactionOptions::default().retries(self.retries);
        if let Some(ms) = self.timeout_ms {
            options = options.timeout(Duration::from_millis(ms));
        }
        if let Some(level) = self.isolation_level {
            options = options.isolation_level(level);
        }
        options
    }
}

impl From<&TransactionConfig> for TransactionOptions {
    fn from(config: &TransactionConfig) -> Self {
        config.options()
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

impl Config {
    /// Load configuration from all sources
    ///
    /// The service name is inferred from the binary name.
    pub fn load() -> Result<Self> {
        let service_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| APP_DIR.to_string());

        Self::load_for_service(&service_name)
    }

    /// Load configuration for a specific service name
    pub fn load_for_service(service_name: &str) -> Result<Self> {
        let config_paths = Self::find_config_paths(service_name);

        tracing::debug!("Searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new().merge(Serialized::defaults(Config::named(service_name)));

        // lowest priority first
        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        let config = figment.merge(Self::env()).extract()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    ///
    /// Skips the XDG and system directories; environment variables still apply.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Self::env())
            .extract()?;

        Ok(config)
    }

    fn env() -> Env {
        Env::prefixed(ENV_PREFIX).split("__")
    }

    /// Candidate config files, highest priority first
    fn find_config_paths(service_name: &str) -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.toml")];

        let config_file_path = Path::new(service_name).join("config.toml");
        if let Some(path) = xdg::BaseDirectories::with_prefix(APP_DIR).find_config_file(&config_file_path) {
            paths.push(path);
        }

        paths.push(
            PathBuf::from("/etc")
                .join(APP_DIR)
                .join(service_name)
                .join("config.toml"),
        );

        paths
    }

    fn named(service_name: &str) -> Self {
        let mut config = Self::default();
        config.service.name = service_name.to_string();
        config
    }

    /// Default transaction options from the `[transaction]` table
    pub fn transaction_options(&self) -> TransactionOptions {
        self.transaction.options()
    }

    /// Get database URL
    pub fn database_url(&self) -> Option<&str> {
        self.database.as_ref().map(DatabaseConfig::url)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: APP_DIR.to_string(),
                log_level: default_log_level(),
            },
            database: None,
            transaction: TransactionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::RelationalConfig;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service.log_level, "info");
        assert!(config.database.is_none());
        assert_eq!(config.transaction.retries, 3);
        assert_eq!(config.transaction_options(), TransactionOptions::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[service]
name = "billing"
log_level = "debug"

[database]
type = "relational"
url = "memory://"
max_connections = 4

[transaction]
retries = 5
timeout_ms = 1500
isolation_level = "serializable"
"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.service.name, "billing");
        assert_eq!(config.service.log_level, "debug");
        assert_eq!(config.database_url(), Some("memory://"));
        assert_eq!(
            config.database,
            Some(DatabaseConfig::Relational(RelationalConfig {
                max_connections: 4,
                ..RelationalConfig::new("memory://")
            }))
        );

        let options = config.transaction_options();
        assert_eq!(options.retries, 5);
        assert_eq!(options.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(options.isolation_level, Some(IsolationLevel::Serializable));
    }

    #[test]
    fn test_missing_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.service.name, "polystore");
        assert_eq!(config.transaction, TransactionConfig::default());
    }

    #[test]
    fn test_invalid_database_type_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[database]\ntype = \"graph\"\nurl = \"x\"\n").unwrap();

        let err = Config::load_from(file.path()).unwrap_err();
        assert!(matches!(err, crate::error::Error::Config(_)));
    }

    #[test]
    fn test_config_paths_in_priority_order() {
        let paths = Config::find_config_paths("billing");
        assert_eq!(paths.first(), Some(&PathBuf::from("config.toml")));
        assert_eq!(
            paths.last(),
            Some(&PathBuf::from("/etc/polystore/billing/config.toml"))
        );
    }
}
