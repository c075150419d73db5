//! End-to-end tests of the caller surface over the `SQLite` engine
//!
//! Covers the full path a caller takes: plugin selection on open, ownership
//! checks, script execution in both transaction modes, metadata listings and
//! table data access. `SQLite` runs in-process, so these tests need no server.

#![cfg(feature = "sqlite")]

use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::time::Duration;

use sqlhub::{ConnectionConfig, ConnectionState, DatabaseHub, ExecuteOptions, Facet, HubSettings, MessageLevel};

// ============================================================================
// Test Helpers
// ============================================================================

/// Fresh database file seeded with a `users` table holding two rows
fn create_test_db() -> PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = std::env::temp_dir().join(format!("sqlhub_hub_{}_{id}.db", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let conn = rusqlite::Connection::open(&path).expect("Failed to create temp database");
    conn.execute_batch(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, email TEXT UNIQUE);
         INSERT INTO users (name, email) VALUES ('Alice', 'alice@example.com');
         INSERT INTO users (name, email) VALUES ('Bob', 'bob@example.com');
         CREATE VIEW user_names AS SELECT name FROM users;",
    )
    .expect("Failed to seed database");
    path
}

fn hub() -> DatabaseHub {
    DatabaseHub::with_builtin_plugins(HubSettings::default()).expect("builtin plugins register")
}

async fn open(hub: &DatabaseHub, path: &PathBuf, owner: &str) -> String {
    let config = ConnectionConfig::file(path.to_string_lossy());
    hub.open_connection(&config, "sqlite", owner).await.expect("open sqlite connection")
}

async fn exec(hub: &DatabaseHub, id: &str, sql: &str, need_transaction: bool) -> sqlhub::SqlCommandResult {
    let options = ExecuteOptions { need_transaction, timeout: None };
    hub.execute_sql(id, None, None, sql, "alice", options).await.expect("owned connection")
}

async fn user_count(hub: &DatabaseHub, id: &str) -> i64 {
    let result = exec(hub, id, "SELECT COUNT(*) FROM users", false).await;
    result.result_set.expect("count query returns rows").rows[0][0].as_i64().expect("integer count")
}

fn row(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("object literal")
}

// ============================================================================
// Connection lifecycle
// ============================================================================

#[tokio::test]
async fn test_open_selects_newest_plugin() {
    let hub = hub();
    let path = create_test_db();
    let id = open(&hub, &path, "alice").await;

    let connections = hub.list_connections("alice");
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].connection_id, id);
    assert_eq!(connections[0].vendor, "sqlite");
    // The bundled library is well past 3.37
    assert_eq!(connections[0].plugin_id, "sqlite-3.37");
    assert!(connections[0].database_version.starts_with("3."));

    let facets = hub.facets(&id, "alice").unwrap();
    assert!(facets.contains(&Facet::Trigger));
    assert!(!facets.contains(&Facet::Procedure));

    hub.close_connection(&id, "alice").await.unwrap();
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_connections_are_owner_scoped() {
    let hub = hub();
    let path = create_test_db();
    let id = open(&hub, &path, "alice").await;

    assert!(hub.list_connections("bob").is_empty());

    let err = hub.list_tables(&id, None, None, "bob").await.unwrap_err();
    assert_eq!(err.error_code(), "FORBIDDEN");

    let err = hub.close_connection(&id, "bob").await.unwrap_err();
    assert_eq!(err.error_code(), "FORBIDDEN");
    assert_eq!(hub.list_connections("alice").len(), 1);

    hub.close_connection(&id, "alice").await.unwrap();
    let err = hub
        .execute_sql(&id, None, None, "SELECT 1", "alice", ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_open_failures() {
    let hub = hub();

    let err = hub.open_connection(&ConnectionConfig::default(), "sqlite", "alice").await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_INPUT");
    assert!(err.message().contains("'database'"));

    let err = hub.open_connection(&ConnectionConfig::file(":memory:"), "oracle", "alice").await.unwrap_err();
    assert_eq!(err.error_code(), "UNSUPPORTED_VERSION");

    let missing = std::env::temp_dir().join("sqlhub_missing_dir").join("nested").join("db.sqlite");
    let err = hub
        .open_connection(&ConnectionConfig::file(missing.to_string_lossy()), "sqlite", "alice")
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "CONNECTION_FAILED");

    assert!(hub.list_connections("alice").is_empty());
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let hub = hub();
    let path = create_test_db();
    open(&hub, &path, "alice").await;
    open(&hub, &path, "bob").await;
    assert_eq!(hub.manager().len(), 2);

    hub.shutdown().await;
    assert!(hub.manager().is_empty());
    let _ = std::fs::remove_file(&path);
}

// ============================================================================
// Script execution
// ============================================================================

#[tokio::test]
async fn test_transaction_rolls_back_on_failure() {
    let hub = hub();
    let path = create_test_db();
    let id = open(&hub, &path, "alice").await;

    let result = exec(
        &hub,
        &id,
        "INSERT INTO users (name) VALUES ('Carol'); INSERT INTO missing VALUES (1); INSERT INTO users (name) VALUES ('Dan')",
        true,
    )
    .await;

    assert!(!result.success);
    assert_eq!(result.sub_results.len(), 2);
    assert!(result.sub_results[0].success);
    assert!(!result.sub_results[1].success);
    assert_eq!(result.error_message.as_deref(), Some("no such table: missing"));
    assert!(result.messages.iter().any(|m| m.message == "Transaction rolled back"));
    assert_eq!(user_count(&hub, &id).await, 2);

    hub.close_connection(&id, "alice").await.unwrap();
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_transaction_commits_on_success() {
    let hub = hub();
    let path = create_test_db();
    let id = open(&hub, &path, "alice").await;

    let result = exec(
        &hub,
        &id,
        "INSERT INTO users (name) VALUES ('Carol'); UPDATE users SET name = 'Bobby' WHERE name = 'Bob'",
        true,
    )
    .await;

    assert!(result.success);
    assert_eq!(result.affected_rows, Some(1));
    assert_eq!(result.sub_results[1].affected_rows, Some(1));
    assert!(result.messages.iter().any(|m| m.message == "Transaction committed"));
    assert_eq!(user_count(&hub, &id).await, 3);

    hub.close_connection(&id, "alice").await.unwrap();
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_autocommit_continues_past_failures() {
    let hub = hub();
    let path = create_test_db();
    let id = open(&hub, &path, "alice").await;

    let result = exec(
        &hub,
        &id,
        "INSERT INTO users (name) VALUES ('Carol');\nSELECT * FROM missing;\nINSERT INTO users (name) VALUES ('Dan');",
        false,
    )
    .await;

    assert_eq!(result.sub_results.len(), 3);
    // Overall outcome follows the first statement
    assert!(result.success);
    assert!(result.error_message.is_none());
    assert!(!result.sub_results[1].success);
    assert_eq!(result.sub_results[1].error_message.as_deref(), Some("no such table: missing"));
    assert!(result.messages.iter().any(|m| m.level == MessageLevel::Error));
    assert_eq!(user_count(&hub, &id).await, 4);

    hub.close_connection(&id, "alice").await.unwrap();
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_first_statement_failure_fails_script() {
    let hub = hub();
    let path = create_test_db();
    let id = open(&hub, &path, "alice").await;

    let result = exec(&hub, &id, "SELEC 1; SELECT 2", false).await;
    assert!(!result.success);
    assert_eq!(result.sub_results.len(), 2);
    assert!(result.sub_results[1].success);
    assert!(result.error_message.unwrap().contains("syntax error"));

    hub.close_connection(&id, "alice").await.unwrap();
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_quoted_semicolons_stay_in_one_statement() {
    let hub = hub();
    let path = create_test_db();
    let id = open(&hub, &path, "alice").await;

    let result = exec(&hub, &id, "SELECT 'a;b' AS text", false).await;
    assert!(result.success);
    assert!(result.is_query);
    assert_eq!(result.sub_results.len(), 1);
    let rows = result.result_set.unwrap();
    assert_eq!(rows.columns[0].name, "text");
    assert_eq!(rows.rows, vec![vec![json!("a;b")]]);

    hub.close_connection(&id, "alice").await.unwrap();
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_empty_script_is_rejected() {
    let hub = hub();
    let path = create_test_db();
    let id = open(&hub, &path, "alice").await;

    let result = exec(&hub, &id, " ;  -- nothing here\n ; ", false).await;
    assert!(!result.success);
    assert!(result.sub_results.is_empty());
    assert_eq!(result.error_message.as_deref(), Some("No executable SQL statements"));

    hub.close_connection(&id, "alice").await.unwrap();
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_fetch_cap_truncates_results() {
    let settings = HubSettings { max_rows: 1, ..HubSettings::default() };
    let hub = DatabaseHub::with_builtin_plugins(settings).unwrap();
    let path = create_test_db();
    let id = open(&hub, &path, "alice").await;

    let result = exec(&hub, &id, "SELECT name FROM users ORDER BY id", false).await;
    let rows = result.result_set.unwrap();
    assert_eq!(rows.rows, vec![vec![json!("Alice")]]);
    assert!(rows.truncated);
    assert!(result.messages.iter().any(|m| m.level == MessageLevel::Warn));

    hub.close_connection(&id, "alice").await.unwrap();
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_timeout_interrupts_statement_and_keeps_connection() {
    let hub = hub();
    let path = create_test_db();
    let id = open(&hub, &path, "alice").await;

    let runaway = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 1000000000) \
                   SELECT count(*) FROM c";
    let options = ExecuteOptions { need_transaction: false, timeout: Some(Duration::from_millis(50)) };
    let result = hub.execute_sql(&id, None, None, runaway, "alice", options).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.sub_results.len(), 1);
    assert_eq!(
        result.error_message.as_deref(),
        Some("Timed out: statement exceeded 50 ms and was cancelled")
    );
    assert!(result.messages.iter().any(|m| m.level == MessageLevel::Error));

    let listed = hub.list_connections("alice");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].state, ConnectionState::Open);

    let next = exec(&hub, &id, "SELECT name FROM users ORDER BY id", false).await;
    assert!(next.success, "{:?}", next.error_message);
    assert_eq!(next.result_set.unwrap().rows[0], vec![json!("Alice")]);

    hub.close_connection(&id, "alice").await.unwrap();
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_unknown_catalog_rejects_script() {
    let hub = hub();
    let path = create_test_db();
    let id = open(&hub, &path, "alice").await;

    let result = hub
        .execute_sql(&id, Some("nope"), None, "SELECT 1", "alice", ExecuteOptions::default())
        .await
        .unwrap();
    assert!(!result.success);
    assert!(result.sub_results.is_empty());
    assert!(result.error_message.unwrap().contains("nope"));

    let result = hub
        .execute_sql(&id, Some("main"), None, "SELECT 1", "alice", ExecuteOptions::default())
        .await
        .unwrap();
    assert!(result.success);

    hub.close_connection(&id, "alice").await.unwrap();
    let _ = std::fs::remove_file(&path);
}

// ============================================================================
// Metadata and table data
// ============================================================================

#[tokio::test]
async fn test_metadata_listings() {
    let hub = hub();
    let path = create_test_db();
    let id = open(&hub, &path, "alice").await;

    let databases = hub.list_databases(&id, "alice").await.unwrap();
    assert_eq!(databases.first().map(String::as_str), Some("main"));
    assert_eq!(hub.list_tables(&id, None, None, "alice").await.unwrap(), vec!["users".to_string()]);
    assert_eq!(hub.list_views(&id, None, None, "alice").await.unwrap(), vec!["user_names".to_string()]);
    assert!(hub.list_triggers(&id, None, None, "alice").await.unwrap().is_empty());

    let columns = hub.list_columns(&id, None, None, "users", "alice").await.unwrap();
    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["id", "name", "email"]);

    let indexes = hub.list_indexes(&id, None, None, "users", "alice").await.unwrap();
    assert!(indexes.is_empty(), "autoindexes are hidden: {indexes:?}");

    let err = hub.list_schemas(&id, None, "alice").await.unwrap_err();
    assert_eq!(err.error_code(), "CAPABILITY_NOT_SUPPORTED");

    hub.close_connection(&id, "alice").await.unwrap();
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_table_data_round_trip() {
    let hub = hub();
    let path = create_test_db();
    let id = open(&hub, &path, "alice").await;

    let inserted =
        hub.insert_row(&id, None, None, "users", &row(json!({"name": "Carol"})), "alice").await.unwrap();
    assert_eq!(inserted, 1);

    let updated = hub
        .update_rows(&id, None, None, "users", &row(json!({"email": "c@example.com"})), &row(json!({"name": "Carol"})), "alice")
        .await
        .unwrap();
    assert_eq!(updated, 1);

    let page = hub.page_table_data(&id, None, None, "users", 1, 5, "alice").await.unwrap();
    assert_eq!(page.total_count, 3);
    assert_eq!(page.rows.len(), 2);
    assert_eq!(page.rows[1][1], json!("Carol"));
    assert_eq!(page.rows[1][2], json!("c@example.com"));

    let deleted = hub.delete_rows(&id, None, None, "users", &row(json!({"name": "Carol"})), "alice").await.unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(user_count(&hub, &id).await, 2);

    hub.close_connection(&id, "alice").await.unwrap();
    let _ = std::fs::remove_file(&path);
}
