//! MySQL Engine
//!
//! Plugins for MySQL and MariaDB (vendor `mysql`).
//!
//! # Implementation Notes
//! - Uses `mysql_async` over the text protocol; cells are typed from column metadata
//! - Handles MySQL implicit commits for DDL operations (nothing to roll back)
//! - Server warnings are read with `SHOW WARNINGS` and surfaced as notices
//! - ENUM and SET types converted to strings
//! - BLOB data that is not UTF-8 is Base64-encoded for JSON safety
//! - A catalog (or schema) selects the database with `USE`
//! - No out-of-band cancellation: a timed-out statement closes the connection

mod catalog;

use async_trait::async_trait;
use mysql_async::consts::{ColumnFlags, ColumnType};
use mysql_async::prelude::*;
use mysql_async::{Column, Conn, OptsBuilder, Row, Value};
use std::sync::Arc;
use std::time::Instant;

use crate::config::ConnectionConfig;
use crate::driver::{self, ColumnMeta, DriverConnector, LiveConnection, Notice, RowSet, StatementOutput};
use crate::error::{HubError, Result};
use crate::executor::SplitRules;
use crate::plugin::{Facet, Plugin, PluginRegistry};
use crate::provider::Dialect;
use crate::version::VersionRange;

pub use catalog::{MySqlColumns, MySqlIndexes, MySqlObjects, MySqlTables};

/// Vendor tag for MySQL and MariaDB plugins
pub const VENDOR: &str = "mysql";

const DEFAULT_PORT: u16 = 3306;

/// Register the MySQL plugins.
///
/// `mysql-8` reads functional index expressions from `STATISTICS.EXPRESSION`;
/// MariaDB reports 10.x and later and stays on `mysql`.
pub fn register(registry: &mut PluginRegistry) -> Result<()> {
    registry.register(plugin("mysql", VersionRange::any(), false))?;
    registry.register(plugin("mysql-8", VersionRange::between("8.0", "9.99.99"), true))
}

fn plugin(id: &str, range: VersionRange, expression_indexes: bool) -> Plugin {
    Plugin::new(id, VENDOR, range, Arc::new(MySqlConnector))
        .with_split_rules(SplitRules::MYSQL)
        .with_objects(Facet::Database, Arc::new(MySqlObjects::DATABASES))
        .with_tables(Arc::new(MySqlTables))
        .with_objects(Facet::View, Arc::new(MySqlObjects::VIEWS))
        .with_objects(Facet::Function, Arc::new(MySqlObjects::FUNCTIONS))
        .with_objects(Facet::Procedure, Arc::new(MySqlObjects::PROCEDURES))
        .with_objects(Facet::Trigger, Arc::new(MySqlObjects::TRIGGERS))
        .with_columns(Arc::new(MySqlColumns))
        .with_indexes(Arc::new(MySqlIndexes::new(expression_indexes)))
}

/// Opens `mysql_async` connections. `database` is optional.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlConnector;

#[async_trait]
impl DriverConnector for MySqlConnector {
    fn driver_name(&self) -> &'static str {
        "mysql_async"
    }

    fn driver_version(&self) -> String {
        "0.34".to_string()
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn LiveConnection>> {
        driver::load_driver(config, self.driver_name())?;
        let opts = build_mysql_opts(config)?;

        let conn = Conn::new(opts)
            .await
            .map_err(|e| HubError::connection_failed(format!("Failed to connect to MySQL: {e}")))?;
        Ok(Box::new(MySqlConnection { conn }))
    }
}

/// Build MySQL connection options from `ConnectionConfig`
fn build_mysql_opts(config: &ConnectionConfig) -> Result<OptsBuilder> {
    let host = ConnectionConfig::require(config.host.as_deref(), "MySQL", "host")?;
    let user = ConnectionConfig::require(config.username.as_deref(), "MySQL", "username")?;

    let opts = OptsBuilder::default()
        .ip_or_hostname(host)
        .tcp_port(config.port.unwrap_or(DEFAULT_PORT))
        .user(Some(user))
        .pass(config.secret.as_deref())
        .db_name(config.database.as_deref().filter(|db| !db.is_empty()));
    Ok(opts)
}

/// Split a self-reported version into (version, product description)
fn parse_mysql_version(version_string: &str) -> (String, String) {
    // Example MySQL: "8.0.35"
    // Example MariaDB: "10.11.2-MariaDB"
    if version_string.to_uppercase().contains("MARIADB") {
        let version = version_string.split('-').next().unwrap_or("unknown").to_string();
        let product = format!("MariaDB {version}");
        (version, product)
    } else {
        let version = version_string.split_whitespace().next().unwrap_or(version_string).to_string();
        let product = format!("MySQL {version}");
        (version, product)
    }
}

/// Live MySQL handle
pub struct MySqlConnection {
    conn: Conn,
}

impl MySqlConnection {
    async fn warnings(&mut self) -> Result<Vec<Notice>> {
        if self.conn.get_warnings() == 0 {
            return Ok(Vec::new());
        }
        let rows: Vec<(String, u32, String)> = self.conn.query("SHOW WARNINGS").await.map_err(statement_error)?;
        Ok(rows
            .into_iter()
            .map(|(level, code, message)| match level.as_str() {
                "Note" => Notice::info(format!("{code}: {message}")),
                _ => Notice::warn(format!("{code}: {message}")),
            })
            .collect())
    }
}

fn statement_error(e: mysql_async::Error) -> HubError {
    match e {
        mysql_async::Error::Server(server) => {
            HubError::statement(format!("ERROR {} ({}): {}", server.code, server.state, server.message))
        }
        other => HubError::statement(other.to_string()),
    }
}

#[async_trait]
impl LiveConnection for MySqlConnection {
    async fn execute(&mut self, sql: &str, max_rows: usize) -> Result<StatementOutput> {
        let mut result = self.conn.query_iter(sql).await.map_err(statement_error)?;

        let columns: Vec<Column> = result.columns().map(|c| c.to_vec()).unwrap_or_default();
        let output = if columns.is_empty() {
            let affected = result.affected_rows();
            result.drop_result().await.map_err(statement_error)?;
            StatementOutput::update(affected)
        } else {
            let fetch_started = Instant::now();
            let mut rows = Vec::new();
            let mut truncated = false;
            while let Some(row) = result.next().await.map_err(statement_error)? {
                if rows.len() >= max_rows {
                    truncated = true;
                    break;
                }
                rows.push(row_to_json(&row, &columns));
            }
            // the rest of the result must be read off the wire before the next statement
            result.drop_result().await.map_err(statement_error)?;
            let meta = columns.iter().map(column_meta).collect();
            StatementOutput::query(RowSet { columns: meta, rows, truncated }, fetch_started.elapsed())
        };

        Ok(output.with_notices(self.warnings().await?))
    }

    async fn begin(&mut self) -> Result<()> {
        self.conn.query_drop("START TRANSACTION").await.map_err(statement_error)
    }

    async fn commit(&mut self) -> Result<()> {
        self.conn.query_drop("COMMIT").await.map_err(statement_error)
    }

    async fn rollback(&mut self) -> Result<()> {
        self.conn.query_drop("ROLLBACK").await.map_err(statement_error)
    }

    async fn use_scope(&mut self, catalog: Option<&str>, schema: Option<&str>) -> Result<()> {
        match catalog.or(schema) {
            Some(db) => {
                self.conn.query_drop(format!("USE {}", Dialect::MYSQL.ident(db))).await.map_err(statement_error)
            }
            None => Ok(()),
        }
    }

    async fn server_version(&mut self) -> Result<String> {
        let version: Option<String> = self.conn.query_first("SELECT VERSION()").await.map_err(|e| {
            HubError::connection_failed(format!("Failed to query MySQL version: {e}"))
        })?;
        let raw = version.unwrap_or_default();
        let (version, product) = parse_mysql_version(&raw);
        tracing::debug!(%product, "detected server");
        Ok(version)
    }

    async fn is_alive(&mut self) -> bool {
        self.conn.ping().await.is_ok()
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn
            .disconnect()
            .await
            .map_err(|e| HubError::connection_failed(format!("Failed to close MySQL connection: {e}")))
    }
}

fn column_meta(column: &Column) -> ColumnMeta {
    let type_name = format!("{:?}", column.column_type());
    let mut meta = ColumnMeta::named(column.name_str()).with_type(type_name.trim_start_matches("MYSQL_TYPE_"));
    meta.nullable = Some(!column.flags().contains(ColumnFlags::NOT_NULL_FLAG));
    if matches!(column.column_type(), ColumnType::MYSQL_TYPE_NEWDECIMAL | ColumnType::MYSQL_TYPE_DECIMAL) {
        meta.scale = Some(u32::from(column.decimals()));
    }
    let table = column.table_str();
    if !table.is_empty() {
        meta.table = Some(table.into_owned());
    }
    meta
}

/// Convert a MySQL row to a JSON-safe `Vec`
fn row_to_json(row: &Row, columns: &[Column]) -> Vec<serde_json::Value> {
    columns
        .iter()
        .enumerate()
        .map(|(idx, column)| row.as_ref(idx).map_or(serde_json::Value::Null, |v| mysql_value_to_json(v, column)))
        .collect()
}

/// Convert MySQL value to JSON value
fn mysql_value_to_json(value: &Value, column: &Column) -> serde_json::Value {
    match value {
        Value::NULL => serde_json::Value::Null,

        // the text protocol sends every value as bytes; type them from the column
        Value::Bytes(bytes) => text_value_to_json(bytes, column),

        Value::Int(i) => serde_json::Value::Number((*i).into()),
        Value::UInt(u) => serde_json::Value::Number((*u).into()),

        // NaN/Infinity become null
        Value::Float(f) => driver::json_f64(f64::from(*f)),
        Value::Double(d) => driver::json_f64(*d),

        Value::Date(year, month, day, hour, minute, second, micro) => serde_json::Value::String(format!(
            "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{micro:06}"
        )),

        Value::Time(is_negative, days, hours, minutes, seconds, microseconds) => {
            let sign = if *is_negative { "-" } else { "" };
            let total_hours = days * 24 + u32::from(*hours);
            serde_json::Value::String(format!("{sign}{total_hours}:{minutes:02}:{seconds:02}.{microseconds:06}"))
        }
    }
}

fn text_value_to_json(bytes: &[u8], column: &Column) -> serde_json::Value {
    let Ok(text) = std::str::from_utf8(bytes) else {
        return driver::json_bytes(bytes);
    };

    let parsed = match column.column_type() {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => text
            .parse::<i64>()
            .map(serde_json::Value::from)
            .or_else(|_| text.parse::<u64>().map(serde_json::Value::from))
            .ok(),
        ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => {
            text.parse::<f64>().ok().map(driver::json_f64)
        }
        ColumnType::MYSQL_TYPE_JSON => serde_json::from_str(text).ok(),
        _ => None,
    };
    parsed.unwrap_or_else(|| serde_json::Value::String(text.to_string()))
}
