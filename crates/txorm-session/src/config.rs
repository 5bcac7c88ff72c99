//! Database and transaction settings.

use serde::Deserialize;
use txorm_core::{ConfigError, Error, Result};
use txorm_query::Dialect;

/// Settings shared by every transaction of a [`Database`](crate::Database).
///
/// Missing fields take their defaults, so `{}` is a valid document:
///
/// ```
/// use txorm_session::DatabaseConfig;
///
/// let config = DatabaseConfig::from_json(r#"{"dialect": "sqlite"}"#).unwrap();
/// assert_eq!(config.statement_cache_size, 1024);
/// assert!(config.optimistic);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Compiled statements kept per database
    pub statement_cache_size: usize,
    pub dialect: Dialect,
    /// Default for [`TransactionConfig::optimistic`]
    pub optimistic: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            statement_cache_size: 1024,
            dialect: Dialect::default(),
            optimistic: true,
        }
    }
}

impl DatabaseConfig {
    /// Parse a JSON object; other document shapes are rejected.
    pub fn from_json(json: &str) -> Result<Self> {
        let invalid = |err: serde_json::Error| {
            Error::Config(ConfigError {
                message: format!("invalid database configuration: {err}"),
                source: Some(Box::new(err)),
            })
        };
        let document: serde_json::Value = serde_json::from_str(json).map_err(invalid)?;
        if !document.is_object() {
            return Err(Error::Config(ConfigError {
                message: "invalid database configuration: expected a JSON object".to_string(),
                source: None,
            }));
        }
        serde_json::from_value(document).map_err(invalid)
    }
}

/// Per-transaction behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionConfig {
    /// Add optimistic checks to UPDATE and DELETE statements.
    pub optimistic: bool,
    /// Flush pending changes before `find`, `get_by` and `select` query storage.
    pub auto_flush: bool,
    /// Roll back automatically when a flush or commit fails.
    pub strict: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            optimistic: true,
            auto_flush: true,
            strict: false,
        }
    }
}

impl From<&DatabaseConfig> for TransactionConfig {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            optimistic: config.optimistic,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = DatabaseConfig::from_json("{}").unwrap();
        assert_eq!(config, DatabaseConfig::default());
        assert_eq!(config.dialect, Dialect::Postgres);
    }

    #[test]
    fn test_partial_document() {
        let config =
            DatabaseConfig::from_json(r#"{"statement_cache_size": 8, "optimistic": false}"#)
                .unwrap();
        assert_eq!(config.statement_cache_size, 8);
        assert!(!config.optimistic);
        assert!(!TransactionConfig::from(&config).optimistic);
    }

    #[test]
    fn test_invalid_document() {
        let err = DatabaseConfig::from_json(r#"{"dialect": "oracle"}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("invalid database configuration"));
    }

    #[test]
    fn test_non_object_document() {
        for json in ["[1]", "[]", "\"x\"", "3"] {
            let err = DatabaseConfig::from_json(json).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{json}");
        }
    }
}
