//! `SQLite` Engine
//!
//! Reference vendor implementation: a [`DriverConnector`] over `rusqlite` and
//! catalog providers built on `sqlite_master` and the table PRAGMAs.
//!
//! # Implementation Notes
//! - `rusqlite` is synchronous; every call runs on the blocking pool
//! - BLOB data is Base64-encoded for JSON safety
//! - Statement timeouts interrupt the running statement via `sqlite3_interrupt`
//! - Catalogs are attached database names (`main`, `temp`, ...); there are no schemas

mod catalog;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle, OpenFlags, Row};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::ConnectionConfig;
use crate::driver::{
    self, ColumnMeta, DriverConnector, LiveConnection, QueryCanceller, RowSet, StatementOutput,
};
use crate::error::{HubError, Result};
use crate::plugin::{Facet, Plugin, PluginRegistry};
use crate::version::VersionRange;

pub use catalog::{SqliteColumns, SqliteDatabases, SqliteIndexes, SqliteObjects, SqliteTables};

/// Vendor tag for `SQLite` plugins
pub const VENDOR: &str = "sqlite";

/// Register the `SQLite` plugins.
///
/// `sqlite` serves every version; `sqlite-3.37` lists tables through
/// `pragma_table_list`, which also hides virtual-table shadow tables.
pub fn register(registry: &mut PluginRegistry) -> Result<()> {
    registry.register(plugin("sqlite", VersionRange::any(), false))?;
    registry.register(plugin("sqlite-3.37", VersionRange::at_least("3.37"), true))
}

fn plugin(id: &str, range: VersionRange, table_list: bool) -> Plugin {
    Plugin::new(id, VENDOR, range, Arc::new(SqliteConnector))
        .with_objects(Facet::Database, Arc::new(SqliteDatabases))
        .with_tables(Arc::new(SqliteTables::new(table_list)))
        .with_objects(Facet::View, Arc::new(SqliteObjects::VIEWS))
        .with_objects(Facet::Trigger, Arc::new(SqliteObjects::TRIGGERS))
        .with_columns(Arc::new(SqliteColumns))
        .with_indexes(Arc::new(SqliteIndexes))
}

/// Opens `rusqlite` connections.
///
/// `database` holds the file path (`:memory:` for an in-memory database).
/// Properties: `mode=ro` opens read-only, `busy_timeout_ms` sets the lock wait,
/// `foreign_keys=on|off` toggles enforcement.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteConnector;

#[async_trait]
impl DriverConnector for SqliteConnector {
    fn driver_name(&self) -> &'static str {
        "rusqlite"
    }

    fn driver_version(&self) -> String {
        rusqlite::version().to_string()
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn LiveConnection>> {
        driver::load_driver(config, self.driver_name())?;
        let path = ConnectionConfig::require(config.database.as_deref(), "SQLite", "database")?.to_string();

        let read_only = config.property("mode") == Some("ro");
        let busy_timeout = match config.property("busy_timeout_ms") {
            Some(raw) => Some(Duration::from_millis(raw.parse().map_err(|_| {
                HubError::invalid_input(format!("busy_timeout_ms must be milliseconds, got '{raw}'"))
            })?)),
            None => None,
        };
        let foreign_keys = config.property("foreign_keys").map(|v| v.eq_ignore_ascii_case("on"));

        let conn = tokio::task::spawn_blocking(move || open_connection(&path, read_only, busy_timeout, foreign_keys))
            .await
            .map_err(|e| HubError::connection_failed(format!("SQLite open task failed: {e}")))??;

        Ok(Box::new(SqliteConnection::new(conn)))
    }
}

fn open_connection(
    path: &str,
    read_only: bool,
    busy_timeout: Option<Duration>,
    foreign_keys: Option<bool>,
) -> Result<Connection> {
    let flags = if read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_URI
    };

    let conn = Connection::open_with_flags(path, flags)
        .map_err(|e| HubError::connection_failed(format!("Failed to open SQLite database: {e}")))?;

    if let Some(timeout) = busy_timeout {
        conn.busy_timeout(timeout)
            .map_err(|e| HubError::connection_failed(format!("Failed to set busy timeout: {e}")))?;
    }
    if let Some(enabled) = foreign_keys {
        conn.pragma_update(None, "foreign_keys", enabled)
            .map_err(|e| HubError::connection_failed(format!("Failed to set foreign_keys: {e}")))?;
    }
    Ok(conn)
}

/// Live `SQLite` handle
pub struct SqliteConnection {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

impl SqliteConnection {
    fn new(conn: Connection) -> Self {
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Self { conn: Arc::new(Mutex::new(conn)), interrupt }
    }

    /// Run `f` against the connection on the blocking pool
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| HubError::connection_failed("SQLite handle is poisoned"))?;
            f(&guard)
        })
        .await
        .map_err(|e| HubError::statement(format!("SQLite worker failed: {e}")))?
    }

    async fn batch(&self, sql: &'static str) -> Result<()> {
        self.blocking(move |conn| conn.execute_batch(sql).map_err(statement_error)).await
    }
}

#[async_trait]
impl LiveConnection for SqliteConnection {
    async fn execute(&mut self, sql: &str, max_rows: usize) -> Result<StatementOutput> {
        let sql = sql.to_string();
        self.blocking(move |conn| run_statement(conn, &sql, max_rows)).await
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

    async fn use_scope(&mut self, catalog: Option<&str>, _schema: Option<&str>) -> Result<()> {
        // statements name attached databases explicitly; only check the catalog exists
        let Some(catalog) = catalog.map(str::to_string) else {
            return Ok(());
        };
        self.blocking(move |conn| {
            let mut stmt = conn.prepare("SELECT name FROM pragma_database_list").map_err(statement_error)?;
            let attached = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(statement_error)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(statement_error)?;
            if attached.iter().any(|name| name.eq_ignore_ascii_case(&catalog)) {
                Ok(())
            } else {
                Err(HubError::statement(format!("unknown database {catalog}")))
            }
        })
        .await
    }

    async fn server_version(&mut self) -> Result<String> {
        self.blocking(|conn| {
            conn.query_row("SELECT sqlite_version()", [], |row| row.get::<_, String>(0)).map_err(|e| {
                HubError::connection_failed(format!("Failed to query SQLite version: {e}"))
            })
        })
        .await
    }

    fn canceller(&self) -> Option<Box<dyn QueryCanceller>> {
        Some(Box::new(SqliteCanceller(Arc::clone(&self.interrupt))))
    }

    async fn is_alive(&mut self) -> bool {
        self.blocking(|conn| conn.execute_batch("SELECT 1").map_err(statement_error)).await.is_ok()
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let Self { conn, .. } = *self;
        // a worker abandoned after a timeout may still hold a reference; dropping ours is enough then
        if let Ok(mutex) = Arc::try_unwrap(conn) {
            let conn = mutex.into_inner().map_err(|_| HubError::connection_failed("SQLite handle is poisoned"))?;
            conn.close().map_err(|(_, e)| HubError::connection_failed(format!("Failed to close SQLite database: {e}")))?;
        }
        Ok(())
    }
}

struct SqliteCanceller(Arc<InterruptHandle>);

#[async_trait]
impl QueryCanceller for SqliteCanceller {
    async fn cancel(&self) -> Result<()> {
        self.0.interrupt();
        Ok(())
    }
}

fn statement_error(e: rusqlite::Error) -> HubError {
    HubError::statement(e.to_string())
}

/// Prepare and run one statement
fn run_statement(conn: &Connection, sql: &str, max_rows: usize) -> Result<StatementOutput> {
    let mut stmt = conn.prepare(sql).map_err(statement_error)?;

    if stmt.column_count() == 0 {
        let changed = stmt.execute([]).map_err(statement_error)?;
        // sqlite3_changes keeps the last DML count across DDL statements
        let affected = if is_dml(sql) { changed as u64 } else { 0 };
        return Ok(StatementOutput::update(affected));
    }

    let columns: Vec<ColumnMeta> = stmt
        .columns()
        .iter()
        .map(|column| {
            let meta = ColumnMeta::named(column.name());
            match column.decl_type() {
                Some(decl) => meta.with_type(decl),
                None => meta,
            }
        })
        .collect();

    let fetch_started = Instant::now();
    let mut rows = stmt.query([]).map_err(statement_error)?;
    let mut data = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next().map_err(statement_error)? {
        if data.len() >= max_rows {
            truncated = true;
            break;
        }
        data.push(row_to_json(row, columns.len()).map_err(statement_error)?);
    }

    Ok(StatementOutput::query(RowSet { columns, rows: data, truncated }, fetch_started.elapsed()))
}

fn is_dml(sql: &str) -> bool {
    let keyword: String = sql.trim_start().chars().take_while(char::is_ascii_alphabetic).collect();
    matches!(keyword.to_ascii_uppercase().as_str(), "INSERT" | "UPDATE" | "DELETE" | "REPLACE")
}

/// Convert a `SQLite` row to JSON-safe values
fn row_to_json(row: &Row, width: usize) -> std::result::Result<Vec<serde_json::Value>, rusqlite::Error> {
    (0..width).map(|idx| sqlite_value_to_json(row, idx)).collect()
}

fn sqlite_value_to_json(row: &Row, idx: usize) -> std::result::Result<serde_json::Value, rusqlite::Error> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::Number(i.into()),
        ValueRef::Real(f) => driver::json_f64(f),
        ValueRef::Text(s) => {
            let text = std::str::from_utf8(s).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
            })?;
            serde_json::Value::String(text.to_string())
        }
        ValueRef::Blob(b) => driver::json_bytes(b),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn memory() -> Box<dyn LiveConnection> {
        SqliteConnector.connect(&ConnectionConfig::file(":memory:")).await.unwrap()
    }

    #[tokio::test]
    async fn test_server_version() {
        let mut conn = memory().await;
        let version = conn.server_version().await.unwrap();
        assert!(version.starts_with("3."));
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_database_parameter() {
        let result = SqliteConnector.connect(&ConnectionConfig::default()).await;
        let err = result.err().unwrap();
        assert!(err.message().contains("SQLite requires 'database' parameter"));
    }

    #[tokio::test]
    async fn test_value_conversion() {
        let mut conn = memory().await;
        let output = conn
            .execute("SELECT 42 AS i, 3.5 AS r, 'text' AS t, NULL AS n, X'010203' AS b", 10)
            .await
            .unwrap();
        let rows = output.row_set.unwrap();

        assert_eq!(
            rows.columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            vec!["i", "r", "t", "n", "b"]
        );
        assert_eq!(rows.rows, vec![vec![json!(42), json!(3.5), json!("text"), json!(null), json!("AQID")]]);
        assert!(!rows.truncated);
    }

    #[tokio::test]
    async fn test_declared_types() {
        let mut conn = memory().await;
        conn.execute("CREATE TABLE prices (id INTEGER PRIMARY KEY, amount DECIMAL(10,2))", 0).await.unwrap();
        let rows = conn.execute("SELECT id, amount FROM prices", 10).await.unwrap().row_set.unwrap();

        assert_eq!(rows.columns[0].type_name.as_deref(), Some("INTEGER"));
        assert_eq!(rows.columns[1].precision, Some(10));
        assert_eq!(rows.columns[1].scale, Some(2));
    }

    #[tokio::test]
    async fn test_affected_rows() {
        let mut conn = memory().await;
        let created = conn.execute("CREATE TABLE t (x INTEGER)", 0).await.unwrap();
        assert_eq!(created.affected_rows, Some(0));

        let inserted = conn.execute("INSERT INTO t VALUES (1), (2), (3)", 0).await.unwrap();
        assert_eq!(inserted.affected_rows, Some(3));

        // DDL after DML must not report the stale DML count
        let indexed = conn.execute("CREATE INDEX t_x ON t (x)", 0).await.unwrap();
        assert_eq!(indexed.affected_rows, Some(0));
    }

    #[tokio::test]
    async fn test_row_cap_sets_truncated() {
        let mut conn = memory().await;
        let sql = "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 50) SELECT i FROM n";
        let rows = conn.execute(sql, 10).await.unwrap().row_set.unwrap();
        assert_eq!(rows.rows.len(), 10);
        assert!(rows.truncated);

        let rows = conn.execute(sql, 50).await.unwrap().row_set.unwrap();
        assert_eq!(rows.rows.len(), 50);
        assert!(!rows.truncated);
    }

    #[tokio::test]
    async fn test_statement_error_is_raw() {
        let mut conn = memory().await;
        let err = conn.execute("SELECT * FROM missing", 10).await.unwrap_err();
        assert_eq!(err.error_code(), "STATEMENT_FAILED");
        assert!(err.statement_message().contains("no such table: missing"));
    }

    #[tokio::test]
    async fn test_transaction_rollback() {
        let mut conn = memory().await;
        conn.execute("CREATE TABLE t (x INTEGER)", 0).await.unwrap();
        conn.begin().await.unwrap();
        conn.execute("INSERT INTO t VALUES (1)", 0).await.unwrap();
        conn.rollback().await.unwrap();

        let rows = conn.execute("SELECT COUNT(*) FROM t", 10).await.unwrap().row_set.unwrap();
        assert_eq!(rows.rows[0][0], json!(0));
    }

    #[tokio::test]
    async fn test_use_scope_checks_catalog() {
        let mut conn = memory().await;
        assert!(conn.use_scope(Some("main"), None).await.is_ok());
        assert!(conn.use_scope(None, None).await.is_ok());
        let err = conn.use_scope(Some("nowhere"), None).await.unwrap_err();
        assert!(err.statement_message().contains("unknown database nowhere"));
    }

    #[test]
    fn test_is_dml() {
        assert!(is_dml("  insert into t values (1)"));
        assert!(is_dml("DELETE FROM t"));
        assert!(!is_dml("CREATE TABLE t (x)"));
        assert!(!is_dml("DROP TABLE t"));
    }
}
