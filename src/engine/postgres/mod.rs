//! `PostgreSQL` Engine
//!
//! # Features
//! - Client-server connections via TCP (`tokio-postgres`, no TLS)
//! - Server notices forwarded as statement messages
//! - Out-of-band cancellation through the protocol cancel token
//! - Rich type support (JSON/JSONB, timestamps, UUID, NUMERIC, common arrays)
//!
//! # Implementation Notes
//! - The connection future is driven on its own task; notices reach the handle over a channel
//! - BYTEA data is Base64-encoded for JSON safety
//! - NUMERIC is returned as decimal text so no precision is lost
//! - Values of types without a JSON mapping are Base64 of their binary form
//! - A catalog names the connected database; the schema is applied through `search_path`

mod catalog;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_postgres::error::DbError;
use tokio_postgres::types::{FromSql, Kind, Type};
use tokio_postgres::{AsyncMessage, CancelToken, Client, Config, NoTls, Row};

use crate::config::ConnectionConfig;
use crate::driver::{
    self, ColumnMeta, DriverConnector, LiveConnection, Notice, QueryCanceller, RowSet, StatementOutput,
};
use crate::error::{HubError, Result};
use crate::executor::SplitRules;
use crate::plugin::{Facet, Plugin, PluginRegistry};
use crate::provider::Scope;
use crate::version::VersionRange;

pub use catalog::{PgColumns, PgIndexes, PgObjects, PgTables};

/// Vendor tag for `PostgreSQL` plugins
pub const VENDOR: &str = "postgresql";

const DEFAULT_PORT: u16 = 5432;

/// Register the `PostgreSQL` plugins.
///
/// `postgresql-11` lists routines through `pg_proc.prokind` and adds
/// procedures; `postgresql` covers older servers without them.
pub fn register(registry: &mut PluginRegistry) -> Result<()> {
    let legacy = base_plugin("postgresql", VersionRange::any())
        .with_objects(Facet::Function, Arc::new(PgObjects::LEGACY_FUNCTIONS));
    registry.register(legacy)?;

    let modern = base_plugin("postgresql-11", VersionRange::at_least("11"))
        .with_objects(Facet::Function, Arc::new(PgObjects::FUNCTIONS))
        .with_objects(Facet::Procedure, Arc::new(PgObjects::PROCEDURES));
    registry.register(modern)
}

fn base_plugin(id: &str, range: VersionRange) -> Plugin {
    Plugin::new(id, VENDOR, range, Arc::new(PostgresConnector))
        .with_split_rules(SplitRules::POSTGRES)
        .with_objects(Facet::Database, Arc::new(PgObjects::DATABASES))
        .with_objects(Facet::Schema, Arc::new(PgObjects::SCHEMAS))
        .with_tables(Arc::new(PgTables))
        .with_objects(Facet::View, Arc::new(PgObjects::VIEWS))
        .with_objects(Facet::Trigger, Arc::new(PgObjects::TRIGGERS))
        .with_columns(Arc::new(PgColumns))
        .with_indexes(Arc::new(PgIndexes))
}

/// Opens `tokio-postgres` connections.
///
/// `database` defaults to `postgres`; `"*"` also means the default database.
/// Properties: `application_name`, `options`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresConnector;

#[async_trait]
impl DriverConnector for PostgresConnector {
    fn driver_name(&self) -> &'static str {
        "tokio-postgres"
    }

    fn driver_version(&self) -> String {
        "0.7".to_string()
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn LiveConnection>> {
        driver::load_driver(config, self.driver_name())?;
        let pg_config = build_pg_config(config)?;

        let (client, mut connection) = pg_config
            .connect(NoTls)
            .await
            .map_err(|e| HubError::connection_failed(format!("Failed to connect to PostgreSQL: {e}")))?;

        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
        // Connection errors are not logged to prevent credential leakage
        tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notice(notice)) => {
                        let _ = notice_tx.send(notice);
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });

        let cancel = client.cancel_token();
        Ok(Box::new(PostgresConnection { client, notices: notice_rx, cancel }))
    }
}

/// Build `PostgreSQL` connection config from `ConnectionConfig`
fn build_pg_config(config: &ConnectionConfig) -> Result<Config> {
    let host = ConnectionConfig::require(config.host.as_deref(), "PostgreSQL", "host")?;
    let user = ConnectionConfig::require(config.username.as_deref(), "PostgreSQL", "username")?;

    let db_name = match config.database.as_deref() {
        None | Some("" | "*") => "postgres",
        Some(db) => db,
    };

    let mut pg_config = Config::new();
    pg_config.host(host).port(config.port.unwrap_or(DEFAULT_PORT)).user(user).dbname(db_name);
    if let Some(secret) = &config.secret {
        pg_config.password(secret);
    }
    if let Some(timeout) = config.connect_timeout_ms {
        pg_config.connect_timeout(std::time::Duration::from_millis(timeout));
    }
    if let Some(name) = config.property("application_name") {
        pg_config.application_name(name);
    }
    if let Some(options) = config.property("options") {
        pg_config.options(options);
    }
    Ok(pg_config)
}

/// Live `PostgreSQL` handle
pub struct PostgresConnection {
    client: Client,
    notices: mpsc::UnboundedReceiver<DbError>,
    cancel: CancelToken,
}

impl PostgresConnection {
    fn drain_notices(&mut self) -> Vec<Notice> {
        let mut notices = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            notices.push(match notice.severity() {
                "WARNING" => Notice::warn(notice.message()),
                _ => Notice::info(notice.message()),
            });
        }
        notices
    }

    async fn batch(&self, sql: &str) -> Result<()> {
        self.client.batch_execute(sql).await.map_err(statement_error)
    }
}

/// Server errors carry their own text; anything else is the client's description
fn statement_error(e: tokio_postgres::Error) -> HubError {
    match e.as_db_error() {
        Some(db) => HubError::statement(format!("ERROR: {}", db.message())),
        None => HubError::statement(e.to_string()),
    }
}

#[async_trait]
impl LiveConnection for PostgresConnection {
    async fn execute(&mut self, sql: &str, max_rows: usize) -> Result<StatementOutput> {
        // notices left over from an abandoned statement belong to nobody
        self.drain_notices();
        let stmt = self.client.prepare(sql).await.map_err(statement_error)?;

        let output = if stmt.columns().is_empty() {
            let affected = self.client.execute(&stmt, &[]).await.map_err(statement_error)?;
            StatementOutput::update(affected)
        } else {
            let columns: Vec<ColumnMeta> = stmt
                .columns()
                .iter()
                .map(|c| ColumnMeta::named(c.name()).with_type(c.type_().name()))
                .collect();

            let fetch_started = Instant::now();
            let stream = self
                .client
                .query_raw(&stmt, std::iter::empty::<&str>())
                .await
                .map_err(statement_error)?;
            futures::pin_mut!(stream);

            let mut rows = Vec::new();
            let mut truncated = false;
            while let Some(row) = stream.try_next().await.map_err(statement_error)? {
                if rows.len() >= max_rows {
                    truncated = true;
                    break;
                }
                rows.push(row_to_json(&row)?);
            }
            StatementOutput::query(RowSet { columns, rows, truncated }, fetch_started.elapsed())
        };

        Ok(output.with_notices(self.drain_notices()))
    }

    async fn begin(&mut self) -> Result<()> {
        self.batch("BEGIN").await
    }

    async fn commit(&mut self) -> Result<()> {
        self.batch("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.batch("ROLLBACK").await
    }

    async fn use_scope(&mut self, catalog: Option<&str>, schema: Option<&str>) -> Result<()> {
        if let Some(catalog) = catalog {
            let row = self.client.query_one("SELECT current_database()", &[]).await.map_err(statement_error)?;
            let current: String = row.get(0);
            if current != catalog {
                return Err(HubError::statement(format!(
                    "connected to database {current}; PostgreSQL cannot switch to {catalog} on an open connection"
                )));
            }
        }
        if let Some(schema) = schema {
            let scope = Scope::new(None, Some(schema));
            self.batch(&format!("SET search_path TO {}", catalog::schema_ident(&scope))).await?;
        }
        Ok(())
    }

    async fn server_version(&mut self) -> Result<String> {
        let row = self.client.query_one("SHOW server_version", &[]).await.map_err(|e| {
            HubError::connection_failed(format!("Failed to query PostgreSQL version: {e}"))
        })?;
        // e.g. "15.3 (Debian 15.3-1.pgdg120+1)" -> "15.3"
        let version: String = row.get(0);
        Ok(version.split_whitespace().next().unwrap_or("unknown").to_string())
    }

    fn canceller(&self) -> Option<Box<dyn QueryCanceller>> {
        Some(Box::new(PgCanceller(self.cancel.clone())))
    }

    async fn is_alive(&mut self) -> bool {
        !self.client.is_closed() && self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(self: Box<Self>) -> Result<()> {
        // dropping the client ends the connection task
        drop(self);
        Ok(())
    }
}

struct PgCanceller(CancelToken);

#[async_trait]
impl QueryCanceller for PgCanceller {
    async fn cancel(&self) -> Result<()> {
        self.0
            .cancel_query(NoTls)
            .await
            .map_err(|e| HubError::connection_failed(format!("Failed to cancel PostgreSQL query: {e}")))
    }
}

/// Convert a `PostgreSQL` row to a JSON-safe `Vec`
fn row_to_json(row: &Row) -> Result<Vec<serde_json::Value>> {
    (0..row.len()).map(|idx| postgres_value_to_json(row, idx)).collect()
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<Option<T>> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        HubError::statement(format!(
            "Failed to convert PostgreSQL type '{}' to JSON: {e}",
            row.columns()[idx].type_().name()
        ))
    })
}

fn json_array<T>(values: Option<Vec<Option<T>>>) -> serde_json::Value
where
    serde_json::Value: From<T>,
{
    values.map_or(serde_json::Value::Null, |items| {
        serde_json::Value::Array(items.into_iter().map(|v| v.map_or(serde_json::Value::Null, Into::into)).collect())
    })
}

/// Convert `PostgreSQL` value to JSON value
fn postgres_value_to_json(row: &Row, idx: usize) -> Result<serde_json::Value> {
    use serde_json::Value;

    let col_type = row.columns()[idx].type_().clone();
    let value = match col_type {
        Type::BOOL => get::<bool>(row, idx)?.map(Value::Bool),

        Type::INT2 => get::<i16>(row, idx)?.map(Value::from),
        Type::INT4 => get::<i32>(row, idx)?.map(Value::from),
        Type::INT8 => get::<i64>(row, idx)?.map(Value::from),
        Type::OID => get::<u32>(row, idx)?.map(Value::from),

        // NaN/Infinity become null
        Type::FLOAT4 => get::<f32>(row, idx)?.map(|v| driver::json_f64(f64::from(v))),
        Type::FLOAT8 => get::<f64>(row, idx)?.map(driver::json_f64),

        Type::NUMERIC => get::<PgNumeric>(row, idx)?.map(|n| Value::String(n.0)),

        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME => get::<String>(row, idx)?.map(Value::String),

        Type::JSON | Type::JSONB => get::<Value>(row, idx)?,

        Type::BYTEA => get::<Vec<u8>>(row, idx)?.map(|v| driver::json_bytes(&v)),

        // Timestamps as ISO 8601 strings
        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx)?
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        Type::TIMESTAMPTZ => {
            get::<chrono::DateTime<chrono::Utc>>(row, idx)?.map(|v| Value::String(v.to_rfc3339()))
        }
        Type::DATE => get::<chrono::NaiveDate>(row, idx)?.map(|v| Value::String(v.format("%Y-%m-%d").to_string())),
        Type::TIME => {
            get::<chrono::NaiveTime>(row, idx)?.map(|v| Value::String(v.format("%H:%M:%S%.f").to_string()))
        }

        Type::UUID => get::<uuid::Uuid>(row, idx)?.map(|v| Value::String(v.to_string())),

        Type::BOOL_ARRAY => Some(json_array(get::<Vec<Option<bool>>>(row, idx)?)),
        Type::INT2_ARRAY => Some(json_array(get::<Vec<Option<i16>>>(row, idx)?)),
        Type::INT4_ARRAY => Some(json_array(get::<Vec<Option<i32>>>(row, idx)?)),
        Type::INT8_ARRAY => Some(json_array(get::<Vec<Option<i64>>>(row, idx)?)),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY | Type::NAME_ARRAY => {
            Some(json_array(get::<Vec<Option<String>>>(row, idx)?))
        }

        // enum labels travel as text
        ref ty if matches!(ty.kind(), Kind::Enum(_)) => {
            get::<RawValue>(row, idx)?.map(|raw| Value::String(String::from_utf8_lossy(&raw.0).into_owned()))
        }

        _ => get::<RawValue>(row, idx)?.map(|raw| driver::json_bytes(&raw.0)),
    };

    Ok(value.unwrap_or(Value::Null))
}

/// Binary form of any value
struct RawValue(Vec<u8>);

impl<'a> FromSql<'a> for RawValue {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(Self(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// NUMERIC decoded to decimal text
struct PgNumeric(String);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        decode_numeric(raw).map(Self)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Binary NUMERIC: ndigits, weight, sign, dscale, then base-10000 digits
fn decode_numeric(raw: &[u8]) -> std::result::Result<String, Box<dyn std::error::Error + Sync + Send>> {
    use std::fmt::Write;

    let read = |at: usize| -> std::result::Result<u16, &'static str> {
        raw.get(at..at + 2).map(|b| u16::from_be_bytes([b[0], b[1]])).ok_or("truncated NUMERIC value")
    };

    let ndigits = usize::from(read(0)?);
    let weight = i32::from(read(2)? as i16);
    let sign = read(4)?;
    let dscale = usize::from(read(6)?);

    match sign {
        0xC000 => return Ok("NaN".to_string()),
        0xD000 => return Ok("Infinity".to_string()),
        0xF000 => return Ok("-Infinity".to_string()),
        _ => {}
    }

    let digits = (0..ndigits).map(|i| read(8 + i * 2)).collect::<std::result::Result<Vec<_>, _>>()?;
    let digit = |pos: i32| usize::try_from(pos).ok().and_then(|p| digits.get(p).copied()).unwrap_or(0);

    let mut text = String::new();
    if sign == 0x4000 {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        for pos in 0..=weight {
            if pos == 0 {
                write!(text, "{}", digit(pos))?;
            } else {
                write!(text, "{:04}", digit(pos))?;
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::new();
        let mut pos = weight + 1;
        while fraction.len() < dscale {
            write!(fraction, "{:04}", digit(pos))?;
            pos += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn numeric(weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&u16::try_from(digits.len()).unwrap().to_be_bytes());
        raw.extend_from_slice(&weight.to_be_bytes());
        raw.extend_from_slice(&sign.to_be_bytes());
        raw.extend_from_slice(&dscale.to_be_bytes());
        for d in digits {
            raw.extend_from_slice(&d.to_be_bytes());
        }
        raw
    }

    #[test]
    fn test_decode_numeric() {
        // 12345.678 = [1, 2345, 6780], weight 1
        assert_eq!(decode_numeric(&numeric(1, 0, 3, &[1, 2345, 6780])).unwrap(), "12345.678");
        // -0.05 = [500], weight -1
        assert_eq!(decode_numeric(&numeric(-1, 0x4000, 2, &[500])).unwrap(), "-0.05");
        // 10000 = [1], weight 1, trailing zero group omitted
        assert_eq!(decode_numeric(&numeric(1, 0, 0, &[1])).unwrap(), "10000");
        // 0.00001 = [1000], weight -2
        assert_eq!(decode_numeric(&numeric(-2, 0, 5, &[1000])).unwrap(), "0.00001");
        assert_eq!(decode_numeric(&numeric(0, 0xC000, 0, &[])).unwrap(), "NaN");
        assert!(decode_numeric(&[0, 1]).is_err());
    }

    #[test]
    fn test_wildcard_database_config() {
        let config = ConnectionConfig::server("localhost", 5432, "*", "postgres", "postgres");
        let pg_config = build_pg_config(&config).unwrap();
        assert_eq!(pg_config.get_dbname(), Some("postgres"));
    }

    #[test]
    fn test_missing_host_error() {
        let config = ConnectionConfig { username: Some("postgres".into()), ..ConnectionConfig::default() };
        let err = build_pg_config(&config).unwrap_err();
        assert!(err.message().contains("PostgreSQL requires 'host' parameter"));
    }

    #[test]
    fn test_default_port_and_properties() {
        let config = ConnectionConfig { host: Some("db".into()), username: Some("app".into()), ..Default::default() }
            .with_property("application_name", "sqlhub");
        let pg_config = build_pg_config(&config).unwrap();
        assert_eq!(pg_config.get_ports(), &[DEFAULT_PORT]);
        assert_eq!(pg_config.get_application_name(), Some("sqlhub"));
    }

    #[test]
    fn test_plugin_selection_by_version() {
        let mut registry = PluginRegistry::new();
        register(&mut registry).unwrap();

        let modern = registry.select_plugin(VENDOR, "16.2").unwrap();
        assert_eq!(modern.id(), "postgresql-11");
        assert!(modern.supports(Facet::Procedure));

        let legacy = registry.select_plugin(VENDOR, "10.23").unwrap();
        assert_eq!(legacy.id(), "postgresql");
        assert!(!legacy.supports(Facet::Procedure));
        assert!(legacy.supports(Facet::Function));
    }

    #[tokio::test]
    #[ignore = "Requires running PostgreSQL instance"]
    async fn test_live_connection() {
        let config = ConnectionConfig::server("localhost", 5432, "postgres", "postgres", "postgres");
        let mut conn = PostgresConnector.connect(&config).await.unwrap();

        assert!(!conn.server_version().await.unwrap().is_empty());

        let output = conn
            .execute("SELECT 1::int4 AS i, 2.50::numeric AS n, 'x'::text AS t, NULL::int4 AS z", 10)
            .await
            .unwrap();
        let rows = output.row_set.unwrap();
        assert_eq!(
            rows.rows[0],
            vec![serde_json::json!(1), serde_json::json!("2.50"), serde_json::json!("x"), serde_json::Value::Null]
        );

        let output = conn
            .execute("DO $$ BEGIN RAISE WARNING 'careful'; END $$", 0)
            .await
            .unwrap();
        assert_eq!(output.notices, vec![Notice::warn("careful")]);

        conn.close().await.unwrap();
    }
}
