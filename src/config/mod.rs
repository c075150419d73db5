//! Configuration
//!
//! Two kinds of configuration live here:
//! - [`ConnectionConfig`]: the immutable, caller-supplied description of one database
//!   to connect to. It is a value object: created from caller input, never mutated
//!   by SQLHub, and never persisted (profile storage belongs to the caller).
//! - [`HubSettings`]: process-wide engine settings (fetch cap, timeouts, DDL cache TTL).
//!
//! # Settings Resolution
//! 1. Explicit path passed to [`HubSettings::load`] (highest priority)
//! 2. `SQLHUB_CONFIG` environment variable
//! 3. `<config_dir>/sqlhub/settings.json`
//! 4. Built-in defaults
//!
//! After the file is read, `SQLHUB_MAX_ROWS` and `SQLHUB_STATEMENT_TIMEOUT_MS`
//! override the corresponding fields.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HubError, Result};

/// Environment variable pointing at a settings file
pub const CONFIG_ENV: &str = "SQLHUB_CONFIG";
/// Environment override for [`HubSettings::max_rows`]
pub const MAX_ROWS_ENV: &str = "SQLHUB_MAX_ROWS";
/// Environment override for [`HubSettings::statement_timeout_ms`]
pub const STATEMENT_TIMEOUT_ENV: &str = "SQLHUB_STATEMENT_TIMEOUT_MS";

/// Connection parameters for one database
///
/// Fields are vendor-specific: file-based engines read the file path from
/// `database` and ignore `host`/`port`/credentials.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Hostname (server engines)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Port number (server engines)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Database name, or file path for file-based engines
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Login name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password or token
    /// WARNING: Sensitive data, never serialized, logged, or included in error messages
    #[serde(default, skip_serializing)]
    pub secret: Option<String>,

    /// Custom driver artifact supplied by the caller
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_path: Option<PathBuf>,

    /// Deadline for establishing the connection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,

    /// Free-form driver properties (e.g. `sslmode`, `application_name`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl ConnectionConfig {
    /// Config for a file-based database (`:memory:` is accepted by SQLite)
    #[must_use]
    pub fn file(path: impl Into<String>) -> Self {
        Self { database: Some(path.into()), ..Self::default() }
    }

    /// Config for a client-server database
    #[must_use]
    pub fn server(
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            database: Some(database.into()),
            username: Some(username.into()),
            secret: Some(secret.into()),
            ..Self::default()
        }
    }

    /// Return a copy with an extra driver property
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Return a copy with a connect deadline
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = Some(timeout_ms);
        self
    }

    /// Look up a driver property
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Connect deadline, falling back to the engine-wide default
    #[must_use]
    pub fn connect_timeout(&self, settings: &HubSettings) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(settings.default_connect_timeout_ms))
    }

    /// Require a field, naming the vendor in the error
    pub fn require<'a>(value: Option<&'a str>, vendor: &str, field: &str) -> Result<&'a str> {
        value
            .filter(|v| !v.is_empty())
            .ok_or_else(|| HubError::invalid_input(format!("{vendor} requires '{field}' parameter")))
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("driver_path", &self.driver_path)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("properties", &self.properties)
            .finish()
    }
}

/// Process-wide engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Fetch-size cap applied to every query result
    pub max_rows: usize,

    /// Per-statement deadline (None = no deadline)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement_timeout_ms: Option<u64>,

    /// Lifetime of cached DDL text (None = until invalidated)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddl_cache_ttl_secs: Option<u64>,

    /// Connect deadline used when a `ConnectionConfig` does not carry one
    pub default_connect_timeout_ms: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            max_rows: 10_000,
            statement_timeout_ms: None,
            ddl_cache_ttl_secs: None,
            default_connect_timeout_ms: 30_000,
        }
    }
}

impl HubSettings {
    /// Load settings following the resolution order in the module docs
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var_os(CONFIG_ENV).map(PathBuf::from).or_else(default_settings_path),
        };

        let settings = match path {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) if explicit.is_some() => {
                return Err(HubError::config_error(format!(
                    "Settings file not found: {}",
                    path.display()
                )));
            }
            _ => Self::default(),
        };

        settings.with_overrides(|key| std::env::var(key).ok())
    }

    /// Parse a settings file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| HubError::config_error(format!("Could not read settings file: {e}")))?;

        serde_json::from_str(&contents)
            .map_err(|e| HubError::config_error(format!("Invalid settings file format: {e}")))
    }

    /// Apply environment-style overrides using `lookup` as the variable source
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(raw) = lookup(MAX_ROWS_ENV) {
            self.max_rows = raw.parse().map_err(|_| {
                HubError::config_error(format!("{MAX_ROWS_ENV} must be a positive integer, got '{raw}'"))
            })?;
        }

        if let Some(raw) = lookup(STATEMENT_TIMEOUT_ENV) {
            let timeout: u64 = raw.parse().map_err(|_| {
                HubError::config_error(format!(
                    "{STATEMENT_TIMEOUT_ENV} must be milliseconds, got '{raw}'"
                ))
            })?;
            self.statement_timeout_ms = (timeout > 0).then_some(timeout);
        }

        if self.max_rows == 0 {
            return Err(HubError::config_error("max_rows must be greater than zero"));
        }

        Ok(self)
    }

    /// Per-statement deadline as a `Duration`
    #[must_use]
    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_ms.map(Duration::from_millis)
    }

    /// DDL cache lifetime as a `Duration`
    #[must_use]
    pub fn ddl_cache_ttl(&self) -> Option<Duration> {
        self.ddl_cache_ttl_secs.map(Duration::from_secs)
    }
}

/// Default settings location (`~/.config/sqlhub/settings.json` on Linux)
#[must_use]
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sqlhub").join("settings.json"))
}
