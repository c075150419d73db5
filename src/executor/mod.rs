//! SQL Execution Engine
//!
//! Runs a script against one live connection and normalizes the outcome into
//! a [`SqlCommandResult`]. Statement failures are never returned as `Err`;
//! they are recorded in the result so partial success stays representable.
//!
//! # Transaction Policy
//! - `need_transaction = true`: one transaction around the whole script. The
//!   first failure rolls back and stops; the failing statement is the last
//!   sub-result.
//! - `need_transaction = false`: every statement autocommits and execution
//!   continues past failures. Overall `success` follows the first statement.
//!
//! # Deadlines
//! On expiry a driver-level cancel is issued when the handle supports one.
//! Otherwise the in-flight call is abandoned and the connection is closed.

mod splitter;

pub use splitter::{split_statements, split_statements_with, SplitRules};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;

use crate::config::HubSettings;
use crate::driver::{LiveConnection, NoticeLevel, RowSet, StatementOutput};
use crate::error::{HubError, Result};
use crate::manager::ActiveConnection;
use crate::provider::Scope;

/// One execution call
#[derive(Debug, Clone)]
pub struct SqlCommandRequest {
    pub connection: Arc<ActiveConnection>,
    pub sql: String,
    pub scope: Scope,
    pub need_transaction: bool,
    /// Per-statement deadline; falls back to the engine setting
    pub timeout: Option<Duration>,
}

impl SqlCommandRequest {
    pub fn new(connection: Arc<ActiveConnection>, sql: impl Into<String>) -> Self {
        Self { connection, sql: sql.into(), scope: Scope::default(), need_transaction: false, timeout: None }
    }

    #[must_use]
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    #[must_use]
    pub const fn with_transaction(mut self, need_transaction: bool) -> Self {
        self.need_transaction = need_transaction;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageLevel {
    Info,
    Warn,
    Error,
}

/// Diagnostic attached to a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub level: MessageLevel,
    pub message: String,
}

impl ResultMessage {
    fn new(level: MessageLevel, message: impl Into<String>) -> Self {
        Self { level, message: message.into() }
    }
}

/// Outcome of one statement within a script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlCommandSubResult {
    pub sql: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub is_query: bool,
    pub execution_ms: u64,
    pub fetch_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_set: Option<RowSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ResultMessage>,
}

impl SqlCommandSubResult {
    fn succeeded(sql: &str, output: StatementOutput, elapsed: Duration, max_rows: usize) -> Self {
        let execution_ms = millis(elapsed);
        let mut messages: Vec<ResultMessage> = output
            .notices
            .into_iter()
            .map(|notice| {
                let level = match notice.level {
                    NoticeLevel::Info => MessageLevel::Info,
                    NoticeLevel::Warn => MessageLevel::Warn,
                };
                ResultMessage::new(level, notice.message)
            })
            .collect();

        let is_query = output.row_set.is_some();
        let affected_rows = if is_query { None } else { Some(output.affected_rows.unwrap_or(0)) };

        if let Some(rows) = &output.row_set {
            if rows.truncated {
                messages.push(ResultMessage::new(
                    MessageLevel::Warn,
                    format!("Result truncated to the first {max_rows} rows"),
                ));
            }
            messages.push(ResultMessage::new(
                MessageLevel::Info,
                format!("Query OK, fetched {} rows in {execution_ms} ms", rows.rows.len()),
            ));
        } else {
            messages.push(ResultMessage::new(
                MessageLevel::Info,
                format!("Update OK, affected {} rows in {execution_ms} ms", affected_rows.unwrap_or(0)),
            ));
        }

        Self {
            sql: sql.to_string(),
            success: true,
            error_message: None,
            is_query,
            execution_ms,
            fetch_ms: millis(output.fetch_time),
            result_set: output.row_set,
            affected_rows,
            messages,
        }
    }

    fn failed(sql: &str, error: &HubError, elapsed: Duration) -> Self {
        let message = error.statement_message();
        Self {
            sql: sql.to_string(),
            success: false,
            error_message: Some(message.clone()),
            is_query: false,
            execution_ms: millis(elapsed),
            fetch_ms: 0,
            result_set: None,
            affected_rows: None,
            messages: vec![ResultMessage::new(MessageLevel::Error, message)],
        }
    }
}

/// Normalized outcome of a script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlCommandResult {
    pub sql: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Mirrors the first statement
    pub is_query: bool,
    /// Wall-clock time for the whole call
    pub execution_ms: u64,
    /// Sum of per-statement fetch time
    pub fetch_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_set: Option<RowSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,
    pub sub_results: Vec<SqlCommandSubResult>,
    pub messages: Vec<ResultMessage>,
}

impl SqlCommandResult {
    /// Result for a call that failed before any statement ran
    #[must_use]
    pub fn rejected(sql: &str, error_message: impl Into<String>, elapsed: Duration) -> Self {
        let error_message = error_message.into();
        Self {
            sql: sql.to_string(),
            success: false,
            error_message: Some(error_message.clone()),
            is_query: false,
            execution_ms: millis(elapsed),
            fetch_ms: 0,
            result_set: None,
            affected_rows: None,
            sub_results: Vec::new(),
            messages: vec![ResultMessage::new(MessageLevel::Error, error_message)],
        }
    }

    fn from_parts(sql: &str, run: ScriptRun, elapsed: Duration) -> Self {
        let ScriptRun { sub_results, mut extra_messages, failure } = run;

        let primary = sub_results.first();
        let success = failure.is_none() && primary.is_some_and(|sub| sub.success);
        let error_message = match (&failure, primary) {
            (Some(message), _) => Some(message.clone()),
            (None, Some(sub)) if !sub.success => sub.error_message.clone(),
            _ => None,
        };

        let mut messages: Vec<ResultMessage> =
            sub_results.iter().flat_map(|sub| sub.messages.iter().cloned()).collect();
        messages.append(&mut extra_messages);

        Self {
            sql: sql.to_string(),
            success,
            error_message,
            is_query: primary.is_some_and(|sub| sub.is_query),
            execution_ms: millis(elapsed),
            fetch_ms: sub_results.iter().map(|sub| sub.fetch_ms).sum(),
            result_set: primary.and_then(|sub| sub.result_set.clone()),
            affected_rows: primary.and_then(|sub| sub.affected_rows),
            sub_results,
            messages,
        }
    }
}

#[derive(Default)]
struct ScriptRun {
    sub_results: Vec<SqlCommandSubResult>,
    extra_messages: Vec<ResultMessage>,
    /// Script-level failure that overrides the first statement's outcome
    failure: Option<String>,
}

/// Executes scripts with the engine's fetch cap and default deadline
#[derive(Debug, Clone)]
pub struct SqlExecutor {
    max_rows: usize,
    statement_timeout: Option<Duration>,
}

impl SqlExecutor {
    #[must_use]
    pub fn new(settings: &HubSettings) -> Self {
        Self { max_rows: settings.max_rows, statement_timeout: settings.statement_timeout() }
    }

    #[must_use]
    pub const fn max_rows(&self) -> usize {
        self.max_rows
    }

    /// Run a script. Never fails; every outcome is described by the result.
    #[instrument(skip(self, request), fields(connection_id = %request.connection.id(), tx = request.need_transaction))]
    pub async fn execute(&self, request: SqlCommandRequest) -> SqlCommandResult {
        let started = Instant::now();
        let statements = split_statements_with(&request.sql, request.connection.plugin().split_rules());
        if statements.is_empty() {
            return SqlCommandResult::rejected(&request.sql, "No executable SQL statements", started.elapsed());
        }

        let connection = Arc::clone(&request.connection);
        let mut guard = match connection.lock().await {
            Ok(guard) => guard,
            Err(e) => return SqlCommandResult::rejected(&request.sql, e.message(), started.elapsed()),
        };

        if request.scope != Scope::default() {
            if let Err(e) = guard.use_scope(request.scope.catalog(), request.scope.schema()).await {
                return SqlCommandResult::rejected(&request.sql, e.statement_message(), started.elapsed());
            }
        }

        let deadline = request.timeout.or(self.statement_timeout);
        let (run, abandoned) = if request.need_transaction {
            self.run_transaction(&mut **guard, &statements, deadline).await
        } else {
            self.run_autocommit(&mut **guard, &statements, deadline).await
        };

        if abandoned {
            connection.mark_closed();
            drop(guard);
            connection.release().await;
            tracing::warn!("handle abandoned after statement timeout; connection closed");
        }

        let result = SqlCommandResult::from_parts(&request.sql, run, started.elapsed());
        tracing::debug!(
            success = result.success,
            statements = result.sub_results.len(),
            elapsed_ms = result.execution_ms,
            "script finished"
        );
        result
    }

    async fn run_autocommit(
        &self,
        conn: &mut dyn LiveConnection,
        statements: &[String],
        deadline: Option<Duration>,
    ) -> (ScriptRun, bool) {
        let mut run = ScriptRun::default();
        for sql in statements {
            let (sub, abandoned) = self.run_statement(conn, sql, deadline).await;
            run.sub_results.push(sub);
            if abandoned {
                run.extra_messages.push(abandon_message(statements.len() - run.sub_results.len()));
                return (run, true);
            }
        }
        (run, false)
    }

    async fn run_transaction(
        &self,
        conn: &mut dyn LiveConnection,
        statements: &[String],
        deadline: Option<Duration>,
    ) -> (ScriptRun, bool) {
        let mut run = ScriptRun::default();
        if let Err(e) = conn.begin().await {
            let message = format!("Could not begin transaction: {}", e.statement_message());
            run.extra_messages.push(ResultMessage::new(MessageLevel::Error, message.clone()));
            run.failure = Some(message);
            return (run, false);
        }

        for sql in statements {
            let (sub, abandoned) = self.run_statement(conn, sql, deadline).await;
            let failed = !sub.success;
            let error = sub.error_message.clone();
            run.sub_results.push(sub);

            if abandoned {
                run.failure = error;
                run.extra_messages.push(abandon_message(statements.len() - run.sub_results.len()));
                return (run, true);
            }
            if failed {
                run.failure = error;
                match conn.rollback().await {
                    Ok(()) => run
                        .extra_messages
                        .push(ResultMessage::new(MessageLevel::Warn, "Transaction rolled back")),
                    Err(e) => run.extra_messages.push(ResultMessage::new(
                        MessageLevel::Error,
                        format!("Rollback failed: {}", e.statement_message()),
                    )),
                }
                return (run, false);
            }
        }

        match conn.commit().await {
            Ok(()) => run.extra_messages.push(ResultMessage::new(MessageLevel::Info, "Transaction committed")),
            Err(e) => {
                let message = format!("Commit failed: {}", e.statement_message());
                run.extra_messages.push(ResultMessage::new(MessageLevel::Error, message.clone()));
                run.failure = Some(message);
                if conn.rollback().await.is_err() {
                    tracing::debug!("rollback after failed commit also failed");
                }
            }
        }
        (run, false)
    }

    /// Run one statement; the flag reports that the handle had to be abandoned
    async fn run_statement(
        &self,
        conn: &mut dyn LiveConnection,
        sql: &str,
        deadline: Option<Duration>,
    ) -> (SqlCommandSubResult, bool) {
        let started = Instant::now();
        let (result, abandoned) = run_with_deadline(conn, sql, self.max_rows, deadline).await;
        let elapsed = started.elapsed();

        let sub = match result {
            Ok(output) => SqlCommandSubResult::succeeded(sql, output, elapsed, self.max_rows),
            Err(e) => {
                tracing::debug!(error = %e, "statement failed");
                SqlCommandSubResult::failed(sql, &e, elapsed)
            }
        };
        (sub, abandoned)
    }
}

async fn run_with_deadline(
    conn: &mut dyn LiveConnection,
    sql: &str,
    max_rows: usize,
    deadline: Option<Duration>,
) -> (Result<StatementOutput>, bool) {
    let Some(limit) = deadline else {
        return (conn.execute(sql, max_rows).await, false);
    };

    let canceller = conn.canceller();
    let statement = conn.execute(sql, max_rows);
    tokio::pin!(statement);

    tokio::select! {
        result = &mut statement => return (result, false),
        () = tokio::time::sleep(limit) => {}
    }

    let limit_ms = limit.as_millis();
    match canceller {
        Some(canceller) => {
            if let Err(e) = canceller.cancel().await {
                tracing::warn!(error = %e, "driver cancel request failed");
            }
            match statement.await {
                // finished while the cancel was in flight
                Ok(output) => (Ok(output), false),
                Err(_) => (Err(HubError::timeout(format!("statement exceeded {limit_ms} ms and was cancelled"))), false),
            }
        }
        None => (
            Err(HubError::timeout(format!("statement exceeded {limit_ms} ms; connection closed"))),
            true,
        ),
    }
}

fn abandon_message(skipped: usize) -> ResultMessage {
    ResultMessage::new(
        MessageLevel::Error,
        format!("Connection closed after timeout; {skipped} remaining statements not executed"),
    )
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::driver::mock::{MockConnector, MockStats};
    use crate::driver::{ColumnMeta, Notice};
    use crate::manager::ConnectionManager;
    use crate::plugin::{Plugin, PluginRegistry};
    use crate::version::VersionRange;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn rows(n: usize) -> StatementOutput {
        StatementOutput::query(
            RowSet {
                columns: vec![ColumnMeta::named("n")],
                rows: (0..n).map(|i| vec![json!(i)]).collect(),
                truncated: false,
            },
            Duration::ZERO,
        )
    }

    async fn open(connector: MockConnector) -> (ConnectionManager, Arc<ActiveConnection>, Arc<MockStats>) {
        open_with_rules(connector, SplitRules::STANDARD).await
    }

    async fn open_with_rules(
        connector: MockConnector,
        rules: SplitRules,
    ) -> (ConnectionManager, Arc<ActiveConnection>, Arc<MockStats>) {
        let stats = Arc::clone(&connector.stats);
        let mut registry = PluginRegistry::new();
        let plugin = Plugin::new("mock", "mock", VersionRange::any(), Arc::new(connector)).with_split_rules(rules);
        registry.register(plugin).unwrap();
        let manager = ConnectionManager::new(Arc::new(registry), HubSettings::default());
        let id = manager.open(&ConnectionConfig::default(), "mock", "alice").await.unwrap();
        let connection = manager.get_owned_any(&id, "alice").unwrap();
        (manager, connection, stats)
    }

    fn scripted() -> MockConnector {
        MockConnector::new("db", "1.0")
            .respond("SELECT n", Ok(rows(2)))
            .respond("UPDATE ok", Ok(StatementOutput::update(3)))
            .respond("BROKEN", Err("syntax error near BROKEN"))
    }

    #[tokio::test]
    async fn test_query_result_shape() {
        let (_m, connection, _) = open(scripted()).await;
        let executor = SqlExecutor::new(&HubSettings::default());
        let result = executor.execute(SqlCommandRequest::new(connection, "SELECT n")).await;

        assert!(result.success);
        assert!(result.is_query);
        assert!(result.affected_rows.is_none());
        assert_eq!(result.result_set.as_ref().map(|r| r.rows.len()), Some(2));
        assert_eq!(result.sub_results.len(), 1);
        assert!(result.messages.iter().any(|m| m.message.starts_with("Query OK, fetched 2 rows in ")));
    }

    #[tokio::test]
    async fn test_update_result_shape() {
        let (_m, connection, _) = open(scripted()).await;
        let executor = SqlExecutor::new(&HubSettings::default());
        let result = executor.execute(SqlCommandRequest::new(connection, "UPDATE ok")).await;

        assert!(result.success);
        assert!(!result.is_query);
        assert_eq!(result.affected_rows, Some(3));
        assert!(result.result_set.is_none());
        assert!(result.messages.iter().any(|m| m.message.starts_with("Update OK, affected 3 rows in ")));
    }

    #[tokio::test]
    async fn test_autocommit_continues_past_failure() {
        let (_m, connection, stats) = open(scripted()).await;
        let executor = SqlExecutor::new(&HubSettings::default());
        let result =
            executor.execute(SqlCommandRequest::new(connection, "UPDATE ok; BROKEN; SELECT n")).await;

        assert!(result.success, "first statement succeeded");
        assert_eq!(result.sub_results.len(), 3);
        assert_eq!(
            result.sub_results.iter().map(|s| s.success).collect::<Vec<_>>(),
            vec![true, false, true]
        );
        assert_eq!(result.sub_results[1].error_message.as_deref(), Some("syntax error near BROKEN"));
        assert!(!stats.statements().contains(&"BEGIN".to_string()));
    }

    #[tokio::test]
    async fn test_autocommit_success_follows_first_statement() {
        let (_m, connection, _) = open(scripted()).await;
        let executor = SqlExecutor::new(&HubSettings::default());
        let result = executor.execute(SqlCommandRequest::new(connection, "BROKEN; UPDATE ok")).await;

        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("syntax error near BROKEN"));
        assert_eq!(result.sub_results.len(), 2);
        assert!(result.sub_results[1].success);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_and_stops() {
        let (_m, connection, stats) = open(scripted()).await;
        let executor = SqlExecutor::new(&HubSettings::default());
        let request =
            SqlCommandRequest::new(connection, "UPDATE ok; BROKEN; SELECT n").with_transaction(true);
        let result = executor.execute(request).await;

        assert!(!result.success);
        assert_eq!(result.sub_results.len(), 2);
        assert_eq!(result.error_message.as_deref(), Some("syntax error near BROKEN"));
        assert!(result.messages.iter().any(|m| m.message == "Transaction rolled back"));
        assert_eq!(
            stats.statements(),
            vec!["BEGIN", "db:UPDATE ok", "db:BROKEN", "ROLLBACK"]
        );
    }

    #[tokio::test]
    async fn test_transaction_commits() {
        let (_m, connection, stats) = open(scripted()).await;
        let executor = SqlExecutor::new(&HubSettings::default());
        let request = SqlCommandRequest::new(connection, "UPDATE ok; SELECT n").with_transaction(true);
        let result = executor.execute(request).await;

        assert!(result.success);
        assert_eq!(result.sub_results.len(), 2);
        assert_eq!(stats.statements().last().map(String::as_str), Some("COMMIT"));
    }

    #[tokio::test]
    async fn test_empty_script() {
        let (_m, connection, _) = open(scripted()).await;
        let executor = SqlExecutor::new(&HubSettings::default());
        let result = executor.execute(SqlCommandRequest::new(connection, "  -- nothing\n;")).await;

        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("No executable SQL statements"));
        assert!(result.sub_results.is_empty());
    }

    #[tokio::test]
    async fn test_scope_applied_before_statements() {
        let (_m, connection, stats) = open(scripted()).await;
        let executor = SqlExecutor::new(&HubSettings::default());
        let request =
            SqlCommandRequest::new(connection, "SELECT n").with_scope(Scope::new(Some("app"), Some("public")));
        executor.execute(request).await;

        assert_eq!(stats.statements(), vec!["SCOPE:app:public", "db:SELECT n"]);
    }

    #[tokio::test]
    async fn test_plugin_quoting_rules_drive_splitting() {
        let script = r"SELECT 'C:\'; SELECT 2";

        let (_m, connection, stats) = open(MockConnector::new("db", "1.0")).await;
        let executor = SqlExecutor::new(&HubSettings::default());
        let result = executor.execute(SqlCommandRequest::new(connection, script)).await;
        assert_eq!(result.sub_results.len(), 2);
        assert_eq!(stats.statements(), vec![r"db:SELECT 'C:\'", "db:SELECT 2"]);

        let (_m, connection, stats) = open_with_rules(MockConnector::new("db", "1.0"), SplitRules::MYSQL).await;
        let result = executor.execute(SqlCommandRequest::new(connection, script)).await;
        assert_eq!(result.sub_results.len(), 1);
        assert_eq!(stats.statements(), vec![format!("db:{script}")]);
    }

    #[tokio::test]
    async fn test_notices_and_truncation_become_messages() {
        let mut truncated = rows(1);
        if let Some(set) = truncated.row_set.as_mut() {
            set.truncated = true;
        }
        let connector = MockConnector::new("db", "1.0")
            .respond("SELECT big", Ok(truncated.with_notices(vec![Notice::warn("implicit cast")])));
        let (_m, connection, _) = open(connector).await;
        let executor = SqlExecutor::new(&HubSettings::default());
        let result = executor.execute(SqlCommandRequest::new(connection, "SELECT big")).await;

        let levels: Vec<MessageLevel> = result.messages.iter().map(|m| m.level).collect();
        assert_eq!(levels, vec![MessageLevel::Warn, MessageLevel::Warn, MessageLevel::Info]);
        assert_eq!(result.messages[0].message, "implicit cast");
        assert!(result.result_set.unwrap().truncated);
    }

    #[tokio::test]
    async fn test_timeout_without_canceller_closes_connection() {
        let mut connector = MockConnector::new("db", "1.0");
        connector.delay = Some(Duration::from_millis(200));
        let (manager, connection, stats) = open(connector).await;
        let id = connection.id().to_string();
        let executor = SqlExecutor::new(&HubSettings::default());

        let request = SqlCommandRequest::new(Arc::clone(&connection), "SELECT slow; SELECT next")
            .with_timeout(Duration::from_millis(20));
        let result = executor.execute(request).await;

        assert!(!result.success);
        assert_eq!(result.sub_results.len(), 1);
        assert!(result.error_message.unwrap().contains("exceeded 20 ms"));
        assert!(!connection.is_open());
        assert_eq!(stats.open_handles(), 0);
        assert_eq!(manager.get_owned_any(&id, "alice").unwrap_err().error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_closed_connection_is_reported_not_thrown() {
        let (manager, connection, _) = open(scripted()).await;
        manager.close(connection.id()).await;
        let executor = SqlExecutor::new(&HubSettings::default());
        let result = executor.execute(SqlCommandRequest::new(connection, "SELECT n")).await;

        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("closed"));
    }
}
