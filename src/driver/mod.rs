//! Driver Connector and Live Handle Contracts
//!
//! A [`DriverConnector`] turns a [`ConnectionConfig`] into a boxed
//! [`LiveConnection`]. Everything above this layer (executor, capability
//! providers, connection manager) talks to databases only through these two
//! traits, so no caller ever needs to know which wire driver sits underneath.
//!
//! # Handle Rules
//! - A live handle runs one statement at a time (`&mut self`); callers serialize access.
//! - Statement errors are returned as [`HubError::StatementExecution`] carrying the
//!   driver's own message.
//! - `execute` fetches at most `max_rows` rows and reports whether more were available.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ConnectionConfig;
use crate::error::{HubError, Result};

/// Column metadata for a query result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    /// Column label as returned by the database
    pub name: String,

    /// Declared type (vendor spelling)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,

    /// None when the driver cannot tell
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,

    /// Source table, when the driver exposes it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
}

impl ColumnMeta {
    /// Column with only a name
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: None,
            precision: None,
            scale: None,
            nullable: None,
            table: None,
        }
    }

    /// Attach a declared type; precision/scale are parsed from `NAME(p[,s])`
    #[must_use]
    pub fn with_type(mut self, type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        let (precision, scale) = parse_type_precision(&type_name);
        self.precision = precision;
        self.scale = scale;
        self.type_name = Some(type_name);
        self
    }
}

/// Rows materialized from a query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<serde_json::Value>>,
    /// More rows existed than the fetch cap allowed
    pub truncated: bool,
}

/// Severity of a driver diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warn,
}

/// Driver-level warning or notice raised while running a statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self { level: NoticeLevel::Info, message: message.into() }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self { level: NoticeLevel::Warn, message: message.into() }
    }
}

/// What one statement produced
#[derive(Debug, Clone, PartialEq)]
pub struct StatementOutput {
    /// Present when the statement exposed a column set
    pub row_set: Option<RowSet>,
    /// Present when the statement did not expose a column set
    pub affected_rows: Option<u64>,
    pub notices: Vec<Notice>,
    /// Time spent materializing rows, as opposed to running the statement
    pub fetch_time: Duration,
}

impl StatementOutput {
    #[must_use]
    pub const fn query(row_set: RowSet, fetch_time: Duration) -> Self {
        Self { row_set: Some(row_set), affected_rows: None, notices: Vec::new(), fetch_time }
    }

    #[must_use]
    pub const fn update(affected_rows: u64) -> Self {
        Self {
            row_set: None,
            affected_rows: Some(affected_rows),
            notices: Vec::new(),
            fetch_time: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_notices(mut self, notices: Vec<Notice>) -> Self {
        self.notices = notices;
        self
    }

    #[must_use]
    pub const fn is_query(&self) -> bool {
        self.row_set.is_some()
    }
}

/// Cancels whatever statement is running on the handle it was taken from
#[async_trait]
pub trait QueryCanceller: Send + Sync {
    async fn cancel(&self) -> Result<()>;
}

/// A live, exclusively owned database connection
#[async_trait]
pub trait LiveConnection: Send {
    /// Run one statement, fetching at most `max_rows` rows
    async fn execute(&mut self, sql: &str, max_rows: usize) -> Result<StatementOutput>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Point the handle at a catalog/schema before running statements
    async fn use_scope(&mut self, catalog: Option<&str>, schema: Option<&str>) -> Result<()>;

    /// The database's self-reported version string
    async fn server_version(&mut self) -> Result<String>;

    /// Out-of-band canceller, if the protocol supports one
    fn canceller(&self) -> Option<Box<dyn QueryCanceller>> {
        None
    }

    async fn is_alive(&mut self) -> bool;

    /// Release the handle
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens live connections for one wire driver
#[async_trait]
pub trait DriverConnector: Send + Sync {
    /// Wire driver name (e.g. `rusqlite`, `tokio-postgres`)
    fn driver_name(&self) -> &'static str;

    /// Wire driver version
    fn driver_version(&self) -> String;

    /// Open a live handle
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn LiveConnection>>;

    /// Ask an open handle for the database version
    async fn database_version(&self, conn: &mut dyn LiveConnection) -> Result<String> {
        conn.server_version().await
    }
}

/// Make a vendor driver available before connecting.
///
/// Drivers are compiled in; a caller-supplied `driver_path` must point at an
/// existing artifact, otherwise the load fails with `DriverLoad`.
pub fn load_driver(config: &ConnectionConfig, driver_name: &str) -> Result<()> {
    if let Some(path) = &config.driver_path {
        if !path.exists() {
            return Err(HubError::driver_load(format!(
                "Driver artifact for {driver_name} not found at {}",
                path.display()
            )));
        }
        tracing::debug!(driver = driver_name, path = %path.display(), "using custom driver artifact");
    }
    Ok(())
}

/// Parse `DECIMAL(10,2)` style declarations into (precision, scale)
#[must_use]
pub fn parse_type_precision(type_name: &str) -> (Option<u32>, Option<u32>) {
    let Some(open) = type_name.find('(') else {
        return (None, None);
    };
    let Some(close) = type_name[open..].find(')') else {
        return (None, None);
    };

    let mut parts = type_name[open + 1..open + close].split(',').map(|p| p.trim().parse::<u32>().ok());
    let precision = parts.next().flatten();
    let scale = parts.next().flatten();
    (precision, scale)
}

/// JSON number for a float; NaN/Infinity become null
#[must_use]
pub fn json_f64(value: f64) -> serde_json::Value {
    serde_json::Number::from_f64(value).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

/// Base64 text for binary values
#[must_use]
pub fn json_bytes(bytes: &[u8]) -> serde_json::Value {
    use base64::Engine;
    serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_type_precision() {
        assert_eq!(parse_type_precision("DECIMAL(10,2)"), (Some(10), Some(2)));
        assert_eq!(parse_type_precision("varchar(255)"), (Some(255), None));
        assert_eq!(parse_type_precision("NUMERIC( 8 , 3 )"), (Some(8), Some(3)));
        assert_eq!(parse_type_precision("INTEGER"), (None, None));
        assert_eq!(parse_type_precision("broken(12"), (None, None));
    }

    #[test]
    fn test_column_meta_with_type() {
        let column = ColumnMeta::named("price").with_type("DECIMAL(10,2)");
        assert_eq!(column.type_name.as_deref(), Some("DECIMAL(10,2)"));
        assert_eq!(column.precision, Some(10));
        assert_eq!(column.scale, Some(2));
        assert_eq!(column.nullable, None);
    }

    #[test]
    fn test_json_helpers() {
        assert_eq!(json_f64(f64::NAN), serde_json::Value::Null);
        assert_eq!(json_f64(1.5), serde_json::json!(1.5));
        assert_eq!(json_bytes(&[1, 2, 3]), serde_json::json!("AQID"));
    }

    #[test]
    fn test_load_driver_missing_artifact() {
        let mut config = ConnectionConfig::file(":memory:");
        assert!(load_driver(&config, "rusqlite").is_ok());

        config.driver_path = Some(std::env::temp_dir().join("sqlhub-no-such-driver.so"));
        let err = load_driver(&config, "rusqlite").unwrap_err();
        assert_eq!(err.error_code(), "DRIVER_LOAD_FAILED");
    }

    #[test]
    fn test_statement_output_kinds() {
        let update = StatementOutput::update(3);
        assert!(!update.is_query());
        assert_eq!(update.affected_rows, Some(3));

        let query = StatementOutput::query(RowSet::default(), Duration::ZERO);
        assert!(query.is_query());
        assert!(query.affected_rows.is_none());
    }
}
