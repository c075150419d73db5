//! `PostgreSQL` catalog providers
//!
//! Queries `pg_catalog` and `information_schema`. A scope without a schema
//! resolves against `current_schema()`; the catalog must be the connected
//! database and is not used in object names.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::driver::LiveConnection;
use crate::error::{HubError, Result};
use crate::provider::{
    self, ColumnDetail, ColumnProvider, Dialect, IndexDetail, IndexProvider, ObjectProvider, Scope,
    TablePage, TableProvider,
};

const DIALECT: Dialect = Dialect::ANSI;

/// Schema as a SQL expression
fn schema_expr(scope: &Scope) -> String {
    scope.schema().map_or_else(|| "current_schema()".to_string(), provider::quote_literal)
}

/// Quoted schema identifier, `public` when unscoped
pub(super) fn schema_ident(scope: &Scope) -> String {
    DIALECT.ident(scope.schema().unwrap_or("public"))
}

fn target(scope: &Scope, name: &str) -> String {
    DIALECT.qualified(&[scope.schema(), Some(name)])
}

/// Which kind of named object a [`PgObjects`] serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectKind {
    Database,
    Schema,
    View,
    Function { legacy: bool },
    Procedure,
    Trigger,
}

/// Named objects other than tables
#[derive(Debug, Clone, Copy)]
pub struct PgObjects {
    kind: ObjectKind,
}

impl PgObjects {
    pub const DATABASES: Self = Self { kind: ObjectKind::Database };
    pub const SCHEMAS: Self = Self { kind: ObjectKind::Schema };
    pub const VIEWS: Self = Self { kind: ObjectKind::View };
    pub const FUNCTIONS: Self = Self { kind: ObjectKind::Function { legacy: false } };
    /// Servers before 11 have no `prokind`; aggregates and window functions are flagged instead
    pub const LEGACY_FUNCTIONS: Self = Self { kind: ObjectKind::Function { legacy: true } };
    pub const PROCEDURES: Self = Self { kind: ObjectKind::Procedure };
    pub const TRIGGERS: Self = Self { kind: ObjectKind::Trigger };

    const fn label(&self) -> &'static str {
        match self.kind {
            ObjectKind::Database => "database",
            ObjectKind::Schema => "schema",
            ObjectKind::View => "view",
            ObjectKind::Function { .. } => "function",
            ObjectKind::Procedure => "procedure",
            ObjectKind::Trigger => "trigger",
        }
    }

    fn routine_filter(&self) -> &'static str {
        match self.kind {
            ObjectKind::Function { legacy: true } => "NOT p.proisagg AND NOT p.proiswindow",
            ObjectKind::Procedure => "p.prokind = 'p'",
            _ => "p.prokind = 'f'",
        }
    }

    fn list_sql(&self, scope: &Scope) -> String {
        let schema = schema_expr(scope);
        match self.kind {
            ObjectKind::Database => {
                "SELECT datname FROM pg_catalog.pg_database WHERE datistemplate = false ORDER BY datname".to_string()
            }
            ObjectKind::Schema => "SELECT nspname FROM pg_catalog.pg_namespace \
                 WHERE nspname NOT LIKE 'pg\\_%' AND nspname <> 'information_schema' ORDER BY nspname"
                .to_string(),
            ObjectKind::View => format!(
                "SELECT table_name::text FROM information_schema.views WHERE table_schema = {schema} ORDER BY 1"
            ),
            ObjectKind::Function { .. } | ObjectKind::Procedure => format!(
                "SELECT DISTINCT p.proname FROM pg_catalog.pg_proc p \
                 JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace \
                 WHERE n.nspname = {schema} AND {} ORDER BY 1",
                self.routine_filter()
            ),
            ObjectKind::Trigger => format!(
                "SELECT DISTINCT t.tgname FROM pg_catalog.pg_trigger t \
                 JOIN pg_catalog.pg_class c ON c.oid = t.tgrelid \
                 JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                 WHERE NOT t.tgisinternal AND n.nspname = {schema} ORDER BY 1"
            ),
        }
    }

    fn ddl_sql(&self, scope: &Scope, name: &str) -> String {
        let schema = schema_expr(scope);
        let name = provider::quote_literal(name);
        match self.kind {
            ObjectKind::Database => format!(
                "SELECT 'CREATE DATABASE ' || quote_ident(datname) \
                 || ' WITH OWNER = ' || quote_ident(pg_catalog.pg_get_userbyid(datdba)) \
                 || ' ENCODING = ' || quote_literal(pg_catalog.pg_encoding_to_char(encoding)) \
                 FROM pg_catalog.pg_database WHERE datname = {name}"
            ),
            ObjectKind::Schema => format!(
                "SELECT 'CREATE SCHEMA ' || quote_ident(nspname) \
                 || ' AUTHORIZATION ' || quote_ident(pg_catalog.pg_get_userbyid(nspowner)) \
                 FROM pg_catalog.pg_namespace WHERE nspname = {name}"
            ),
            ObjectKind::View => format!(
                "SELECT 'CREATE OR REPLACE VIEW ' || quote_ident(schemaname) || '.' || quote_ident(viewname) \
                 || E' AS\\n' || definition \
                 FROM pg_catalog.pg_views WHERE schemaname = {schema} AND viewname = {name}"
            ),
            // overloads share a name; the oldest definition wins
            ObjectKind::Function { .. } | ObjectKind::Procedure => format!(
                "SELECT pg_catalog.pg_get_functiondef(p.oid) FROM pg_catalog.pg_proc p \
                 JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace \
                 WHERE n.nspname = {schema} AND p.proname = {name} AND {} ORDER BY p.oid LIMIT 1",
                self.routine_filter()
            ),
            ObjectKind::Trigger => format!(
                "SELECT pg_catalog.pg_get_triggerdef(t.oid, true) FROM pg_catalog.pg_trigger t \
                 JOIN pg_catalog.pg_class c ON c.oid = t.tgrelid \
                 JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                 WHERE NOT t.tgisinternal AND n.nspname = {schema} AND t.tgname = {name} \
                 ORDER BY t.oid LIMIT 1"
            ),
        }
    }
}

#[async_trait]
impl ObjectProvider for PgObjects {
    async fn list_names(&self, conn: &mut dyn LiveConnection, scope: &Scope) -> Result<Vec<String>> {
        provider::query_strings(conn, &self.list_sql(scope)).await
    }

    async fn get_ddl(&self, conn: &mut dyn LiveConnection, scope: &Scope, name: &str) -> Result<String> {
        let what = format!("{} {name}", self.label());
        provider::query_single_string(conn, &self.ddl_sql(scope, name), &what).await
    }

    fn drop_statement(&self, scope: &Scope, name: &str) -> Result<String> {
        Ok(match self.kind {
            ObjectKind::Database => format!("DROP DATABASE {}", DIALECT.ident(name)),
            ObjectKind::Schema => format!("DROP SCHEMA {}", DIALECT.ident(name)),
            ObjectKind::View => format!("DROP VIEW {}", target(scope, name)),
            ObjectKind::Function { .. } => format!("DROP FUNCTION {}", target(scope, name)),
            ObjectKind::Procedure => format!("DROP PROCEDURE {}", target(scope, name)),
            // DROP TRIGGER needs the table, which only the catalog knows
            ObjectKind::Trigger => format!(
                "DO $drop$ DECLARE r record; BEGIN \
                 FOR r IN SELECT c.relname FROM pg_catalog.pg_trigger t \
                 JOIN pg_catalog.pg_class c ON c.oid = t.tgrelid \
                 JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                 WHERE NOT t.tgisinternal AND n.nspname = {schema} AND t.tgname = {literal} LOOP \
                 EXECUTE format('DROP TRIGGER %I ON %I.%I', {literal}, {schema}, r.relname); \
                 END LOOP; END $drop$",
                schema = schema_expr(scope),
                literal = provider::quote_literal(name),
            ),
        })
    }
}

/// Tables, with row paging and CRUD
#[derive(Debug, Clone, Copy, Default)]
pub struct PgTables;

#[async_trait]
impl ObjectProvider for PgTables {
    async fn list_names(&self, conn: &mut dyn LiveConnection, scope: &Scope) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = {} AND table_type = 'BASE TABLE' ORDER BY 1",
            schema_expr(scope)
        );
        provider::query_strings(conn, &sql).await
    }

    /// Reconstructed from the catalog: columns with defaults, then constraints
    async fn get_ddl(&self, conn: &mut dyn LiveConnection, scope: &Scope, name: &str) -> Result<String> {
        let sql = format!(
            "SELECT 'CREATE TABLE ' || quote_ident(n.nspname) || '.' || quote_ident(c.relname) || E' (\\n  ' \
             || string_agg(quote_ident(a.attname) || ' ' || pg_catalog.format_type(a.atttypid, a.atttypmod) \
                || CASE WHEN a.attnotnull THEN ' NOT NULL' ELSE '' END \
                || COALESCE(' DEFAULT ' || pg_catalog.pg_get_expr(d.adbin, d.adrelid), ''), \
                E',\\n  ' ORDER BY a.attnum) \
             || COALESCE((SELECT E',\\n  ' || string_agg('CONSTRAINT ' || quote_ident(con.conname) || ' ' \
                || pg_catalog.pg_get_constraintdef(con.oid), E',\\n  ' ORDER BY con.conname) \
                FROM pg_catalog.pg_constraint con WHERE con.conrelid = c.oid), '') \
             || E'\\n)' \
             FROM pg_catalog.pg_class c \
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
             JOIN pg_catalog.pg_attribute a ON a.attrelid = c.oid AND a.attnum > 0 AND NOT a.attisdropped \
             LEFT JOIN pg_catalog.pg_attrdef d ON d.adrelid = c.oid AND d.adnum = a.attnum \
             WHERE c.relkind IN ('r', 'p') AND n.nspname = {} AND c.relname = {} \
             GROUP BY n.nspname, c.relname, c.oid",
            schema_expr(scope),
            provider::quote_literal(name)
        );
        provider::query_single_string(conn, &sql, &format!("table {name}")).await
    }

    fn drop_statement(&self, scope: &Scope, name: &str) -> Result<String> {
        Ok(format!("DROP TABLE {}", target(scope, name)))
    }
}

#[async_trait]
impl TableProvider for PgTables {
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
pub struct PgColumns;

#[async_trait]
impl ColumnProvider for PgColumns {
    async fn list_columns(
        &self,
        conn: &mut dyn LiveConnection,
        scope: &Scope,
        table: &str,
    ) -> Result<Vec<ColumnDetail>> {
        let sql = format!(
            "SELECT c.column_name::text, c.data_type::text, c.is_nullable::text, c.column_default::text, \
                    c.ordinal_position::int4, \
                    EXISTS (SELECT 1 FROM information_schema.table_constraints tc \
                            JOIN information_schema.key_column_usage k \
                              ON k.constraint_name = tc.constraint_name AND k.table_schema = tc.table_schema \
                            WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = c.table_schema \
                              AND tc.table_name = c.table_name AND k.column_name = c.column_name) \
             FROM information_schema.columns c \
             WHERE c.table_schema = {} AND c.table_name = {} \
             ORDER BY c.ordinal_position",
            schema_expr(scope),
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
                    primary_key: row.get(5) == Some(&Value::Bool(true)),
                }
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PgIndexes;

#[async_trait]
impl IndexProvider for PgIndexes {
    /// Primary-key indexes are reported by the column listing and skipped here
    async fn list_indexes(
        &self,
        conn: &mut dyn LiveConnection,
        scope: &Scope,
        table: &str,
    ) -> Result<Vec<IndexDetail>> {
        let sql = format!(
            "SELECT i.relname::text, ix.indisunique, \
                    array_agg(a.attname::text ORDER BY k.ord) \
             FROM pg_catalog.pg_index ix \
             JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid \
             JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid \
             JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace \
             CROSS JOIN LATERAL unnest(ix.indkey) WITH ORDINALITY AS k(attnum, ord) \
             JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum \
             WHERE NOT ix.indisprimary AND n.nspname = {} AND t.relname = {} \
             GROUP BY i.relname, ix.indisunique ORDER BY 1",
            schema_expr(scope),
            provider::quote_literal(table)
        );
        let rows = provider::query_rows(conn, &sql).await?;

        Ok(rows
            .rows
            .iter()
            .filter_map(|row| {
                let name = row.first().and_then(provider::value_text)?;
                let unique = row.get(1) == Some(&Value::Bool(true));
                let columns = row
                    .get(2)
                    .and_then(Value::as_array)
                    .map(|cols| cols.iter().filter_map(provider::value_text).collect())
                    .unwrap_or_default();
                Some(IndexDetail { name, columns, unique })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{split_statements_with, SplitRules};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_unscoped_names_use_search_path() {
        let scope = Scope::default();
        assert_eq!(PgTables.drop_statement(&scope, "users").unwrap(), r#"DROP TABLE "users""#);
        assert!(PgObjects::VIEWS.list_sql(&scope).contains("table_schema = current_schema()"));
    }

    #[test]
    fn test_scoped_names() {
        let scope = Scope::new(Some("app"), Some("sales"));
        assert_eq!(PgObjects::VIEWS.drop_statement(&scope, "v").unwrap(), r#"DROP VIEW "sales"."v""#);
        assert_eq!(PgObjects::SCHEMAS.drop_statement(&scope, "sales").unwrap(), r#"DROP SCHEMA "sales""#);
        assert!(PgObjects::FUNCTIONS.ddl_sql(&scope, "f").contains("n.nspname = 'sales'"));
    }

    #[test]
    fn test_routine_filters() {
        let scope = Scope::default();
        assert!(PgObjects::FUNCTIONS.list_sql(&scope).contains("p.prokind = 'f'"));
        assert!(PgObjects::PROCEDURES.list_sql(&scope).contains("p.prokind = 'p'"));
        assert!(PgObjects::LEGACY_FUNCTIONS.list_sql(&scope).contains("NOT p.proisagg"));
    }

    #[test]
    fn test_trigger_drop_is_one_statement() {
        let sql = PgObjects::TRIGGERS.drop_statement(&Scope::default(), "audit").unwrap();
        assert_eq!(split_statements_with(&sql, SplitRules::POSTGRES), vec![sql.clone()]);
        assert!(sql.contains("t.tgname = 'audit'"));
    }
}
