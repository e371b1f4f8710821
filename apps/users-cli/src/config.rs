//! Centralized configuration for users-cli.
//!
//! All environment variables are loaded and validated at startup to fail fast
//! on misconfiguration rather than halfway through a command.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use domain::CallContext;
use thiserror::Error;

/// Storage backend provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageProvider {
    /// In-memory storage (data lost on exit)
    Memory,
    /// SQLite file-based storage
    Sqlite,
    /// DynamoDB (requires the `dynamo` feature)
    Dynamo,
}

impl StorageProvider {
    fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("memory") {
            Some(Self::Memory)
        } else if s.eq_ignore_ascii_case("sqlite") {
            Some(Self::Sqlite)
        } else if s.eq_ignore_ascii_case("dynamo") {
            Some(Self::Dynamo)
        } else {
            None
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
#[error("Configuration error for {field}: {message}")]
pub struct ConfigError {
    pub field: &'static str,
    pub message: String,
}

/// CLI configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub storage_provider: StorageProvider,
    /// SQLite database path (default: ./data/users.db)
    pub db_path: PathBuf,
    /// Read-only SQLite follower serving non-forced reads
    pub db_replica_path: Option<PathBuf>,
    pub dynamo_table_users: String,
    pub dynamo_table_counters: String,
    /// Endpoint override, e.g. DynamoDB Local
    pub dynamo_endpoint_url: Option<String>,
    pub log_format: LogFormat,
    /// Deadline applied to every repository call
    pub call_timeout: Option<Duration>,
}

impl Config {
    /// Load and validate configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`. Empty values
    /// count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let provider = var("STORAGE_PROVIDER").unwrap_or_else(|| "sqlite".into());
        let storage_provider = StorageProvider::parse(&provider).ok_or_else(|| ConfigError {
            field: "STORAGE_PROVIDER",
            message: format!("Unknown provider '{provider}' (expected memory, sqlite or dynamo)"),
        })?;

        let db_path = var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/users.db"));
        let db_replica_path = var("DB_REPLICA_PATH").map(PathBuf::from);

        let dynamo_table_users = var("DYNAMO_TABLE_USERS").unwrap_or_else(|| "users".into());
        let dynamo_table_counters =
            var("DYNAMO_TABLE_COUNTERS").unwrap_or_else(|| "counters".into());
        let dynamo_endpoint_url = var("DYNAMO_ENDPOINT_URL");

        let log_format = LogFormat::parse(&var("LOG_FORMAT").unwrap_or_else(|| "pretty".into()));

        let call_timeout = match var("CALL_TIMEOUT_MS") {
            None => None,
            Some(raw) => match raw.parse::<u64>() {
                Ok(0) | Err(_) => {
                    return Err(ConfigError {
                        field: "CALL_TIMEOUT_MS",
                        message: format!("Expected a positive number of milliseconds, got '{raw}'"),
                    })
                }
                Ok(ms) => Some(Duration::from_millis(ms)),
            },
        };

        Ok(Self {
            storage_provider,
            db_path,
            db_replica_path,
            dynamo_table_users,
            dynamo_table_counters,
            dynamo_endpoint_url,
            log_format,
            call_timeout,
        })
    }

    /// Fresh per-command context carrying the configured deadline.
    pub fn call_context(&self) -> CallContext {
        match self.call_timeout {
            Some(timeout) => CallContext::new().with_timeout(timeout),
            None => CallContext::new(),
        }
    }

    /// Log warnings about settings the selected backend ignores.
    pub fn warn_if_ignored(&self) {
        if self.db_replica_path.is_some() && self.storage_provider != StorageProvider::Sqlite {
            tracing::warn!("DB_REPLICA_PATH is set but STORAGE_PROVIDER is not sqlite; ignoring it");
        }
        if self.storage_provider == StorageProvider::Memory {
            tracing::warn!("STORAGE_PROVIDER=memory: data is discarded when the command exits");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn storage_provider_parsing() {
        assert_eq!(StorageProvider::parse("memory"), Some(StorageProvider::Memory));
        assert_eq!(StorageProvider::parse("SQLITE"), Some(StorageProvider::Sqlite));
        assert_eq!(StorageProvider::parse("Dynamo"), Some(StorageProvider::Dynamo));
        assert_eq!(StorageProvider::parse("postgres"), None);
    }

    #[test]
    fn log_format_parsing() {
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("anything"), LogFormat::Pretty);
    }

    #[test]
    fn defaults() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.storage_provider, StorageProvider::Sqlite);
        assert_eq!(cfg.db_path, PathBuf::from("./data/users.db"));
        assert_eq!(cfg.db_replica_path, None);
        assert_eq!(cfg.dynamo_table_users, "users");
        assert_eq!(cfg.dynamo_table_counters, "counters");
        assert_eq!(cfg.log_format, LogFormat::Pretty);
        assert_eq!(cfg.call_timeout, None);
        assert_eq!(cfg.call_context().deadline(), None);
    }

    #[test]
    fn explicit_values() {
        let cfg = load(&[
            ("STORAGE_PROVIDER", "dynamo"),
            ("DYNAMO_TABLE_USERS", "people"),
            ("DYNAMO_ENDPOINT_URL", "http://localhost:8000"),
            ("CALL_TIMEOUT_MS", "250"),
            ("LOG_FORMAT", "json"),
        ])
        .unwrap();
        assert_eq!(cfg.storage_provider, StorageProvider::Dynamo);
        assert_eq!(cfg.dynamo_table_users, "people");
        assert_eq!(cfg.dynamo_endpoint_url.as_deref(), Some("http://localhost:8000"));
        assert_eq!(cfg.call_timeout, Some(Duration::from_millis(250)));
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert!(cfg.call_context().deadline().is_some());
    }

    #[test]
    fn empty_values_count_as_unset() {
        let cfg = load(&[("DB_REPLICA_PATH", ""), ("STORAGE_PROVIDER", "")]).unwrap();
        assert_eq!(cfg.db_replica_path, None);
        assert_eq!(cfg.storage_provider, StorageProvider::Sqlite);
    }

    #[test]
    fn rejects_unknown_provider() {
        let err = load(&[("STORAGE_PROVIDER", "postgres")]).unwrap_err();
        assert_eq!(err.field, "STORAGE_PROVIDER");
    }

    #[test]
    fn rejects_bad_timeout() {
        for raw in ["0", "soon", "-5"] {
            let err = load(&[("CALL_TIMEOUT_MS", raw)]).unwrap_err();
            assert_eq!(err.field, "CALL_TIMEOUT_MS");
        }
    }
}
