//! MySQL catalog providers
//!
//! Listing goes through `information_schema`; DDL comes from `SHOW CREATE`.
//! MySQL has no schema level: the scope's catalog, or else its schema, names
//! the database, and an empty scope means the current database.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::driver::LiveConnection;
use crate::error::{HubError, Result};
use crate::provider::{
    self, ColumnDetail, ColumnProvider, Dialect, IndexDetail, IndexProvider, ObjectProvider, Scope,
    TablePage, TableProvider,
};

const DIALECT: Dialect = Dialect::MYSQL;

fn database(scope: &Scope) -> Option<&str> {
    scope.catalog().or_else(|| scope.schema())
}

/// Database as a SQL expression
fn database_expr(scope: &Scope) -> String {
    database(scope).map_or_else(|| "DATABASE()".to_string(), provider::quote_literal)
}

fn target(scope: &Scope, name: &str) -> String {
    DIALECT.qualified(&[database(scope), Some(name)])
}

/// One `information_schema` listing plus its `SHOW CREATE` form
#[derive(Debug, Clone, Copy)]
pub struct MySqlObjects {
    label: &'static str,
    keyword: &'static str,
    /// `information_schema` table, name column, schema column, extra filter
    source: (&'static str, &'static str, &'static str, &'static str),
    /// Column of `SHOW CREATE ...` holding the statement
    ddl_column: usize,
}

impl MySqlObjects {
    pub const DATABASES: Self = Self {
        label: "database",
        keyword: "DATABASE",
        source: ("SCHEMATA", "SCHEMA_NAME", "", ""),
        ddl_column: 1,
    };
    pub const VIEWS: Self = Self {
        label: "view",
        keyword: "VIEW",
        source: ("VIEWS", "TABLE_NAME", "TABLE_SCHEMA", ""),
        ddl_column: 1,
    };
    pub const FUNCTIONS: Self = Self {
        label: "function",
        keyword: "FUNCTION",
        source: ("ROUTINES", "ROUTINE_NAME", "ROUTINE_SCHEMA", "ROUTINE_TYPE = 'FUNCTION'"),
        ddl_column: 2,
    };
    pub const PROCEDURES: Self = Self {
        label: "procedure",
        keyword: "PROCEDURE",
        source: ("ROUTINES", "ROUTINE_NAME", "ROUTINE_SCHEMA", "ROUTINE_TYPE = 'PROCEDURE'"),
        ddl_column: 2,
    };
    pub const TRIGGERS: Self = Self {
        label: "trigger",
        keyword: "TRIGGER",
        source: ("TRIGGERS", "TRIGGER_NAME", "TRIGGER_SCHEMA", ""),
        ddl_column: 2,
    };

    fn is_database(&self) -> bool {
        self.source.2.is_empty()
    }

    fn list_sql(&self, scope: &Scope, name: Option<&str>) -> String {
        let (table, name_column, schema_column, filter) = self.source;
        let mut conditions = Vec::new();
        if !schema_column.is_empty() {
            conditions.push(format!("{schema_column} = {}", database_expr(scope)));
        }
        if !filter.is_empty() {
            conditions.push(filter.to_string());
        }
        if let Some(name) = name {
            conditions.push(format!("{name_column} = {}", provider::quote_literal(name)));
        }
        let predicate =
            if conditions.is_empty() { String::new() } else { format!(" WHERE {}", conditions.join(" AND ")) };
        format!("SELECT {name_column} FROM information_schema.{table}{predicate} ORDER BY 1")
    }

    fn object_name(&self, scope: &Scope, name: &str) -> String {
        if self.is_database() {
            DIALECT.ident(name)
        } else {
            target(scope, name)
        }
    }
}

#[async_trait]
impl ObjectProvider for MySqlObjects {
    async fn list_names(&self, conn: &mut dyn LiveConnection, scope: &Scope) -> Result<Vec<String>> {
        provider::query_strings(conn, &self.list_sql(scope, None)).await
    }

    async fn get_ddl(&self, conn: &mut dyn LiveConnection, scope: &Scope, name: &str) -> Result<String> {
        let show = format!("SHOW CREATE {} {}", self.keyword, self.object_name(scope, name));
        show_create(conn, &self.list_sql(scope, Some(name)), &show, self.ddl_column, &format!("{} {name}", self.label))
            .await
    }

    fn drop_statement(&self, scope: &Scope, name: &str) -> Result<String> {
        Ok(format!("DROP {} {}", self.keyword, self.object_name(scope, name)))
    }
}

/// `SHOW CREATE` after an existence check, so a missing object is `NotFound`
/// rather than a server error
async fn show_create(
    conn: &mut dyn LiveConnection,
    exists_sql: &str,
    show_sql: &str,
    column: usize,
    what: &str,
) -> Result<String> {
    if provider::query_strings(conn, exists_sql).await?.is_empty() {
        return Err(HubError::not_found(format!("{what} does not exist")));
    }
    let rows = provider::query_rows(conn, show_sql).await?;
    rows.rows
        .first()
        .and_then(|row| row.get(column))
        .and_then(provider::value_text)
        .ok_or_else(|| HubError::not_found(format!("{what} does not exist")))
}

/// Base tables, with row paging and CRUD
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlTables;

impl MySqlTables {
    fn list_sql(scope: &Scope, name: Option<&str>) -> String {
        let by_name = name.map(|n| format!(" AND TABLE_NAME = {}", provider::quote_literal(n))).unwrap_or_default();
        format!(
            "SELECT TABLE_NAME FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = {} AND TABLE_TYPE = 'BASE TABLE'{by_name} ORDER BY 1",
            database_expr(scope)
        )
    }
}

#[async_trait]
impl ObjectProvider for MySqlTables {
    async fn list_names(&self, conn: &mut dyn LiveConnection, scope: &Scope) -> Result<Vec<String>> {
        provider::query_strings(conn, &Self::list_sql(scope, None)).await
    }

    async fn get_ddl(&self, conn: &mut dyn LiveConnection, scope: &Scope, name: &str) -> Result<String> {
        let show = format!("SHOW CREATE TABLE {}", target(scope, name));
        show_create(conn, &Self::list_sql(scope, Some(name)), &show, 1, &format!("table {name}")).await
    }

    fn drop_statement(&self, scope: &Scope, name: &str) -> Result<String> {
        Ok(format!("DROP TABLE {}", target(scope, name)))
    }
}

#[async_trait]
impl TableProvider for MySqlTables {
    async fn page_data(
        &self,
        conn: &mut dyn LiveConnection,
        scope: &Scope,
        name: &str,
        offset: u64,
        limit: u64,
    ) -> Result<TablePage> {
        provider::page_rows(conn, &target(scope, name), offset, limit).await
    }

    async fn insert(
        &self,
        conn: &mut dyn LiveConnection,
        scope: &Scope,
        name: &str,
        row: &Map<String, Value>,
    ) -> Result<u64> {
        provider::affected_rows(conn, &provider::build_insert(DIALECT, &target(scope, name), row)?).await
    }

    async fn update(
        &self,
        conn: &mut dyn LiveConnection,
        scope: &Scope,
        name: &str,
        values: &Map<String, Value>,
        key: &Map<String, Value>,
    ) -> Result<u64> {
        let sql = provider::build_update(DIALECT, &target(scope, name), values, key)?;
        provider::affected_rows(conn, &sql).await
    }

    async fn delete(
        &self,
        conn: &mut dyn LiveConnection,
        scope: &Scope,
        name: &str,
        key: &Map<String, Value>,
    ) -> Result<u64> {
        provider::affected_rows(conn, &provider::build_delete(DIALECT, &target(scope, name), key)?).await
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlColumns;

#[async_trait]
impl ColumnProvider for MySqlColumns {
    async fn list_columns(
        &self,
        conn: &mut dyn LiveConnection,
        scope: &Scope,
        table: &str,
    ) -> Result<Vec<ColumnDetail>> {
        let sql = format!(
            "SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE, COLUMN_DEFAULT, ORDINAL_POSITION, COLUMN_KEY \
             FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = {} AND TABLE_NAME = {} ORDER BY ORDINAL_POSITION",
            database_expr(scope),
            provider::quote_literal(table)
        );
        let rows = provider::query_rows(conn, &sql).await?;
        if rows.rows.is_empty() {
            return Err(HubError::not_found(format!("table {table} does not exist")));
        }

        Ok(rows
            .rows
            .iter()
            .map(|row| {
                let text = |idx: usize| row.get(idx).and_then(provider::value_text);
                ColumnDetail {
                    name: text(0).unwrap_or_default(),
                    data_type: text(1).unwrap_or_default(),
                    nullable: text(2).as_deref() == Some("YES"),
                    default: text(3),
                    ordinal: row
                        .get(4)
                        .and_then(provider::value_u64)
                        .and_then(|n| u32::try_from(n).ok())
                        .unwrap_or(0),
                    primary_key: text(5).as_deref() == Some("PRI"),
                }
            })
            .collect())
    }
}

/// Secondary indexes, read from `information_schema.STATISTICS`
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlIndexes {
    /// Functional index parts (8.0+) have no column name, only an expression
    expression_parts: bool,
}

impl MySqlIndexes {
    #[must_use]
    pub const fn new(expression_parts: bool) -> Self {
        Self { expression_parts }
    }
}

#[async_trait]
impl IndexProvider for MySqlIndexes {
    async fn list_indexes(
        &self,
        conn: &mut dyn LiveConnection,
        scope: &Scope,
        table: &str,
    ) -> Result<Vec<IndexDetail>> {
        let part = if self.expression_parts { "COALESCE(COLUMN_NAME, EXPRESSION)" } else { "COLUMN_NAME" };
        let sql = format!(
            "SELECT INDEX_NAME, NON_UNIQUE, {part} FROM information_schema.STATISTICS \
             WHERE TABLE_SCHEMA = {} AND TABLE_NAME = {} AND INDEX_NAME <> 'PRIMARY' \
             ORDER BY INDEX_NAME, SEQ_IN_INDEX",
            database_expr(scope),
            provider::quote_literal(table)
        );
        let rows = provider::query_rows(conn, &sql).await?;

        let mut indexes: Vec<IndexDetail> = Vec::new();
        for row in &rows.rows {
            let Some(name) = row.first().and_then(provider::value_text) else {
                continue;
            };
            let column = row.get(2).and_then(provider::value_text);
            match indexes.last_mut() {
                Some(index) if index.name == name => index.columns.extend(column),
                _ => indexes.push(IndexDetail {
                    name,
                    columns: column.into_iter().collect(),
                    unique: row.get(1).and_then(provider::value_u64) == Some(0),
                }),
            }
        }
        Ok(indexes)
    }
}
