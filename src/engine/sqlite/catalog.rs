//! `SQLite` catalog providers
//!
//! Catalogs are attached database names; everything is read from
//! `<db>.sqlite_master` and the `pragma_*` table-valued functions.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::driver::LiveConnection;
use crate::error::{HubError, Result};
use crate::provider::{
    self, ColumnDetail, ColumnProvider, Dialect, IndexDetail, IndexProvider, ObjectProvider, Scope,
    TablePage, TableProvider,
};

const DIALECT: Dialect = Dialect::ANSI;

/// Attached database a call is scoped to; SQLite has no schemas, so a
/// schema-only scope names the database too
fn database(scope: &Scope) -> &str {
    scope.catalog().or_else(|| scope.schema()).unwrap_or("main")
}

fn master(scope: &Scope) -> String {
    format!("{}.sqlite_master", DIALECT.ident(database(scope)))
}

fn target(scope: &Scope, name: &str) -> String {
    DIALECT.qualified(&[Some(database(scope)), Some(name)])
}

/// Attached databases (`main`, `temp`, and anything `ATTACH`ed)
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDatabases;

#[async_trait]
impl ObjectProvider for SqliteDatabases {
    async fn list_names(&self, conn: &mut dyn LiveConnection, _scope: &Scope) -> Result<Vec<String>> {
        provider::query_strings(conn, "SELECT name FROM pragma_database_list ORDER BY seq").await
    }

    /// Every schema statement in the database, in creation order
    async fn get_ddl(&self, conn: &mut dyn LiveConnection, _scope: &Scope, name: &str) -> Result<String> {
        let attached = self.list_names(conn, &Scope::default()).await?;
        if !attached.iter().any(|db| db == name) {
            return Err(HubError::not_found(format!("database {name} does not exist")));
        }

        let sql = format!(
            "SELECT sql FROM {}.sqlite_master WHERE sql IS NOT NULL ORDER BY rowid",
            DIALECT.ident(name)
        );
        let statements = provider::query_strings(conn, &sql).await?;
        Ok(statements.iter().map(|s| format!("{s};")).collect::<Vec<_>>().join("\n"))
    }

    fn drop_statement(&self, _scope: &Scope, name: &str) -> Result<String> {
        if name.eq_ignore_ascii_case("main") || name.eq_ignore_ascii_case("temp") {
            return Err(HubError::invalid_input(format!("database {name} cannot be detached")));
        }
        Ok(format!("DETACH DATABASE {}", DIALECT.ident(name)))
    }
}

/// Schema objects stored in `sqlite_master` under one `type`
#[derive(Debug, Clone, Copy)]
pub struct SqliteObjects {
    kind: &'static str,
    keyword: &'static str,
}

impl SqliteObjects {
    pub const VIEWS: Self = Self { kind: "view", keyword: "VIEW" };
    pub const TRIGGERS: Self = Self { kind: "trigger", keyword: "TRIGGER" };
}

#[async_trait]
impl ObjectProvider for SqliteObjects {
    async fn list_names(&self, conn: &mut dyn LiveConnection, scope: &Scope) -> Result<Vec<String>> {
        let sql = format!("SELECT name FROM {} WHERE type = '{}' ORDER BY name", master(scope), self.kind);
        provider::query_strings(conn, &sql).await
    }

    async fn get_ddl(&self, conn: &mut dyn LiveConnection, scope: &Scope, name: &str) -> Result<String> {
        master_sql(conn, scope, self.kind, name).await
    }

    fn drop_statement(&self, scope: &Scope, name: &str) -> Result<String> {
        Ok(format!("DROP {} {}", self.keyword, target(scope, name)))
    }
}

async fn master_sql(conn: &mut dyn LiveConnection, scope: &Scope, kind: &str, name: &str) -> Result<String> {
    let sql = format!(
        "SELECT sql FROM {} WHERE type = '{kind}' AND name = {}",
        master(scope),
        provider::quote_literal(name)
    );
    provider::query_single_string(conn, &sql, &format!("{kind} {name}")).await
}

/// Tables, with row paging and CRUD
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteTables {
    /// List through `pragma_table_list` (3.37+), which hides shadow tables
    table_list: bool,
}

impl SqliteTables {
    #[must_use]
    pub const fn new(table_list: bool) -> Self {
        Self { table_list }
    }
}

#[async_trait]
impl ObjectProvider for SqliteTables {
    async fn list_names(&self, conn: &mut dyn LiveConnection, scope: &Scope) -> Result<Vec<String>> {
        let sql = if self.table_list {
            format!(
                "SELECT name FROM pragma_table_list WHERE schema = {} AND type IN ('table', 'virtual') \
                 AND name NOT LIKE 'sqlite_%' ORDER BY name",
                provider::quote_literal(database(scope))
            )
        } else {
            format!(
                "SELECT name FROM {} WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                master(scope)
            )
        };
        provider::query_strings(conn, &sql).await
    }

    async fn get_ddl(&self, conn: &mut dyn LiveConnection, scope: &Scope, name: &str) -> Result<String> {
        master_sql(conn, scope, "table", name).await
    }

    fn drop_statement(&self, scope: &Scope, name: &str) -> Result<String> {
        Ok(format!("DROP TABLE {}", target(scope, name)))
    }
}

#[async_trait]
impl TableProvider for SqliteTables {
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
        let sql = provider::build_insert(DIALECT, &target(scope, name), row)?;
        provider::affected_rows(conn, &sql).await
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
        let sql = provider::build_delete(DIALECT, &target(scope, name), key)?;
        provider::affected_rows(conn, &sql).await
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteColumns;

#[async_trait]
impl ColumnProvider for SqliteColumns {
    async fn list_columns(
        &self,
        conn: &mut dyn LiveConnection,
        scope: &Scope,
        table: &str,
    ) -> Result<Vec<ColumnDetail>> {
        let sql = format!(
            "SELECT cid, name, type, \"notnull\", dflt_value, pk FROM pragma_table_info({}, {}) ORDER BY cid",
            provider::quote_literal(table),
            provider::quote_literal(database(scope))
        );
        let rows = provider::query_rows(conn, &sql).await?;
        if rows.rows.is_empty() {
            return Err(HubError::not_found(format!("table {table} does not exist")));
        }

        Ok(rows
            .rows
            .iter()
            .map(|row| {
                let int = |idx: usize| row.get(idx).and_then(provider::value_u64).unwrap_or(0);
                let text = |idx: usize| row.get(idx).and_then(provider::value_text);
                ColumnDetail {
                    name: text(1).unwrap_or_default(),
                    data_type: text(2).unwrap_or_default(),
                    nullable: int(3) == 0,
                    default: text(4),
                    primary_key: int(5) > 0,
                    ordinal: u32::try_from(int(0) + 1).unwrap_or(u32::MAX),
                }
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteIndexes;

#[async_trait]
impl IndexProvider for SqliteIndexes {
    async fn list_indexes(
        &self,
        conn: &mut dyn LiveConnection,
        scope: &Scope,
        table: &str,
    ) -> Result<Vec<IndexDetail>> {
        let db = provider::quote_literal(database(scope));
        // auto-created indexes back PRIMARY KEY/UNIQUE constraints and carry no DDL
        let sql = format!(
            "SELECT name, \"unique\" FROM pragma_index_list({}, {db}) \
             WHERE name NOT LIKE 'sqlite_autoindex_%' ORDER BY name",
            provider::quote_literal(table)
        );
        let rows = provider::query_rows(conn, &sql).await?;

        let mut indexes = Vec::with_capacity(rows.rows.len());
        for row in &rows.rows {
            let Some(name) = row.first().and_then(provider::value_text) else {
                continue;
            };
            let unique = row.get(1).and_then(provider::value_u64).unwrap_or(0) != 0;
            let columns_sql = format!(
                "SELECT name FROM pragma_index_info({}, {db}) ORDER BY seqno",
                provider::quote_literal(&name)
            );
            let columns = provider::query_strings(conn, &columns_sql).await?;
            indexes.push(IndexDetail { name, columns, unique });
        }
        Ok(indexes)
    }
}
