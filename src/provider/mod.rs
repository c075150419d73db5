//! Capability Provider Contracts
//!
//! Each metadata facet a plugin can implement has a small vendor-agnostic
//! contract here. Providers never own a connection: every call borrows the
//! live handle the caller already holds, and issues vendor-specific catalog
//! queries through [`LiveConnection::execute`].
//!
//! Named objects (databases, schemas, views, functions, procedures, triggers)
//! share [`ObjectProvider`]. Tables extend it with row paging and CRUD.
//! Columns and indexes are listed per table.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::driver::{ColumnMeta, LiveConnection, RowSet};
use crate::error::{HubError, Result};

/// Catalog/schema a metadata call is scoped to
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

impl Scope {
    #[must_use]
    pub fn new(catalog: Option<&str>, schema: Option<&str>) -> Self {
        Self {
            catalog: catalog.filter(|c| !c.is_empty()).map(str::to_string),
            schema: schema.filter(|s| !s.is_empty()).map(str::to_string),
        }
    }

    #[must_use]
    pub fn catalog(&self) -> Option<&str> {
        self.catalog.as_deref()
    }

    #[must_use]
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }
}

/// Column as described by the catalog (as opposed to a result-set column)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDetail {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    pub primary_key: bool,
    /// 1-based position in the table
    pub ordinal: u32,
}

/// Index information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDetail {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// One page of table rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TablePage {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<Value>>,
    /// Row count of the whole table, not just this page
    pub total_count: u64,
}

/// Named catalog objects: list them, fetch their DDL, build a drop statement
#[async_trait]
pub trait ObjectProvider: Send + Sync {
    async fn list_names(&self, conn: &mut dyn LiveConnection, scope: &Scope) -> Result<Vec<String>>;

    async fn get_ddl(&self, conn: &mut dyn LiveConnection, scope: &Scope, name: &str) -> Result<String>;

    /// Single DDL statement that drops the object
    fn drop_statement(&self, scope: &Scope, name: &str) -> Result<String>;
}

/// Tables: named objects plus row access
#[async_trait]
pub trait TableProvider: ObjectProvider {
    async fn page_data(
        &self,
        conn: &mut dyn LiveConnection,
        scope: &Scope,
        name: &str,
        offset: u64,
        limit: u64,
    ) -> Result<TablePage>;

    async fn insert(
        &self,
        conn: &mut dyn LiveConnection,
        scope: &Scope,
        name: &str,
        row: &Map<String, Value>,
    ) -> Result<u64>;

    /// Update rows matching every `key` column
    async fn update(
        &self,
        conn: &mut dyn LiveConnection,
        scope: &Scope,
        name: &str,
        values: &Map<String, Value>,
        key: &Map<String, Value>,
    ) -> Result<u64>;

    /// Delete rows matching every `key` column
    async fn delete(
        &self,
        conn: &mut dyn LiveConnection,
        scope: &Scope,
        name: &str,
        key: &Map<String, Value>,
    ) -> Result<u64>;
}

#[async_trait]
pub trait ColumnProvider: Send + Sync {
    async fn list_columns(
        &self,
        conn: &mut dyn LiveConnection,
        scope: &Scope,
        table: &str,
    ) -> Result<Vec<ColumnDetail>>;
}

#[async_trait]
pub trait IndexProvider: Send + Sync {
    async fn list_indexes(
        &self,
        conn: &mut dyn LiveConnection,
        scope: &Scope,
        table: &str,
    ) -> Result<Vec<IndexDetail>>;
}

/// Identifier and literal quoting for one SQL dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    pub ident_quote: char,
}

impl Dialect {
    /// Double-quoted identifiers (SQLite, PostgreSQL)
    pub const ANSI: Self = Self { ident_quote: '"' };
    /// Backtick identifiers
    pub const MYSQL: Self = Self { ident_quote: '`' };

    /// Quote an identifier, doubling any embedded quote character
    #[must_use]
    pub fn ident(&self, name: &str) -> String {
        let q = self.ident_quote;
        let escaped = name.replace(q, &format!("{q}{q}"));
        format!("{q}{escaped}{q}")
    }

    /// Dotted, quoted name; `None` parts are skipped
    #[must_use]
    pub fn qualified(&self, parts: &[Option<&str>]) -> String {
        parts.iter().flatten().map(|part| self.ident(part)).collect::<Vec<_>>().join(".")
    }

    /// SQL literal for a JSON value
    #[must_use]
    pub fn literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(true) => "TRUE".to_string(),
            Value::Bool(false) => "FALSE".to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => quote_literal(s),
            other => quote_literal(&other.to_string()),
        }
    }
}

/// Single-quoted string literal with embedded quotes doubled
#[must_use]
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// `INSERT INTO target (cols) VALUES (...)`
pub fn build_insert(dialect: Dialect, target: &str, row: &Map<String, Value>) -> Result<String> {
    if row.is_empty() {
        return Err(HubError::invalid_input("insert requires at least one column value"));
    }
    let columns: Vec<String> = row.keys().map(|c| dialect.ident(c)).collect();
    let values: Vec<String> = row.values().map(|v| dialect.literal(v)).collect();
    Ok(format!("INSERT INTO {target} ({}) VALUES ({})", columns.join(", "), values.join(", ")))
}

/// `UPDATE target SET ... WHERE key`
pub fn build_update(
    dialect: Dialect,
    target: &str,
    values: &Map<String, Value>,
    key: &Map<String, Value>,
) -> Result<String> {
    if values.is_empty() {
        return Err(HubError::invalid_input("update requires at least one column value"));
    }
    let assignments: Vec<String> =
        values.iter().map(|(c, v)| format!("{} = {}", dialect.ident(c), dialect.literal(v))).collect();
    Ok(format!("UPDATE {target} SET {} WHERE {}", assignments.join(", "), where_clause(dialect, key)?))
}

/// `DELETE FROM target WHERE key`
pub fn build_delete(dialect: Dialect, target: &str, key: &Map<String, Value>) -> Result<String> {
    Ok(format!("DELETE FROM {target} WHERE {}", where_clause(dialect, key)?))
}

/// Equality predicate over every key column; an empty key is rejected
fn where_clause(dialect: Dialect, key: &Map<String, Value>) -> Result<String> {
    if key.is_empty() {
        return Err(HubError::invalid_input("row key must name at least one column"));
    }
    Ok(key
        .iter()
        .map(|(c, v)| match v {
            Value::Null => format!("{} IS NULL", dialect.ident(c)),
            _ => format!("{} = {}", dialect.ident(c), dialect.literal(v)),
        })
        .collect::<Vec<_>>()
        .join(" AND "))
}

/// Run a catalog query and return its rows
pub async fn query_rows(conn: &mut dyn LiveConnection, sql: &str) -> Result<RowSet> {
    let output = conn.execute(sql, usize::MAX).await?;
    output
        .row_set
        .ok_or_else(|| HubError::statement(format!("expected a result set from: {sql}")))
}

/// Run a statement and return its affected-row count
pub async fn affected_rows(conn: &mut dyn LiveConnection, sql: &str) -> Result<u64> {
    Ok(conn.execute(sql, 0).await?.affected_rows.unwrap_or(0))
}

/// First column of every row as text
pub async fn query_strings(conn: &mut dyn LiveConnection, sql: &str) -> Result<Vec<String>> {
    let rows = query_rows(conn, sql).await?;
    Ok(rows.rows.iter().filter_map(|row| row.first().and_then(value_text)).collect())
}

/// First column of the first row as text; missing rows are `NotFound`
pub async fn query_single_string(conn: &mut dyn LiveConnection, sql: &str, what: &str) -> Result<String> {
    query_strings(conn, sql)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| HubError::not_found(format!("{what} does not exist")))
}

/// Textual form of a scalar cell
#[must_use]
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Numeric form of a cell (drivers may return counts as text)
#[must_use]
pub fn value_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_i64().and_then(|i| u64::try_from(i).ok())),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Paging and CRUD shared by vendors whose SQL supports `LIMIT n OFFSET m`
pub async fn page_rows(
    conn: &mut dyn LiveConnection,
    target: &str,
    offset: u64,
    limit: u64,
) -> Result<TablePage> {
    let count = query_rows(conn, &format!("SELECT COUNT(*) FROM {target}")).await?;
    let total_count = count.rows.first().and_then(|row| row.first()).and_then(value_u64).unwrap_or(0);

    let page = query_rows(conn, &format!("SELECT * FROM {target} LIMIT {limit} OFFSET {offset}")).await?;
    Ok(TablePage { columns: page.columns, rows: page.rows, total_count })
}
