//! SQLHub CLI Entry Point
//!
//! A thin smoke-test binary over [`DatabaseHub`]. Every subcommand opens one
//! connection, performs one operation, prints a JSON envelope, and closes.
//! - `plugins` - List installed plugins
//! - `exec` - Run a SQL script
//! - `tables` - List tables in scope
//! - `ddl` - Show the DDL of one object
//!
//! All output to stdout is JSON-only. Logs go to stderr (`SQLHUB_LOG` sets the filter).

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use sqlhub::{
    ConnectionConfig, DatabaseHub, ErrorEnvelope, ExecuteOptions, Facet, HubError, HubSettings, Metadata,
    SqlCommandResult, SuccessEnvelope,
};

/// Owner recorded for connections opened by the CLI
const CLI_OWNER: &str = "cli";

/// SQLHub - Multi-database plugin and connection engine
#[derive(Parser)]
#[command(name = "sqlhub")]
#[command(about = "Multi-database plugin and connection engine with version-aware driver selection")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to $SQLHUB_CONFIG, then the user config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List installed plugins and the version ranges they serve
    Plugins,

    /// Run a SQL script and print the normalized result
    Exec {
        #[command(flatten)]
        target: Target,

        /// SQL text; multiple statements are separated by ';'
        #[arg(long)]
        sql: String,

        /// Run the whole script in one transaction
        #[arg(long)]
        transaction: bool,

        /// Statement deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// List tables in the selected catalog/schema
    Tables {
        #[command(flatten)]
        target: Target,
    },

    /// Print the DDL of one object
    Ddl {
        #[command(flatten)]
        target: Target,

        #[arg(long, value_enum, default_value = "table")]
        kind: ObjectKind,

        #[arg(long)]
        name: String,
    },
}

/// Where to connect and which scope to use
#[derive(Args)]
struct Target {
    /// Vendor to connect to (sqlite, postgresql, mysql)
    #[arg(long)]
    vendor: String,

    /// Database name, or file path for SQLite
    #[arg(long)]
    database: Option<String>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    username: Option<String>,

    /// Password; read from the environment so it stays out of shell history
    #[arg(long, env = "SQLHUB_SECRET", hide_env_values = true)]
    secret: Option<String>,

    #[arg(long)]
    connect_timeout_ms: Option<u64>,

    /// Catalog to scope the operation to
    #[arg(long)]
    catalog: Option<String>,

    /// Schema to scope the operation to
    #[arg(long)]
    schema: Option<String>,
}

impl Target {
    fn config(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            username: self.username.clone(),
            secret: self.secret.clone(),
            connect_timeout_ms: self.connect_timeout_ms,
            ..ConnectionConfig::default()
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ObjectKind {
    Database,
    Schema,
    Table,
    View,
    Function,
    Procedure,
    Trigger,
}

impl From<ObjectKind> for Facet {
    fn from(kind: ObjectKind) -> Self {
        match kind {
            ObjectKind::Database => Self::Database,
            ObjectKind::Schema => Self::Schema,
            ObjectKind::Table => Self::Table,
            ObjectKind::View => Self::View,
            ObjectKind::Function => Self::Function,
            ObjectKind::Procedure => Self::Procedure,
            ObjectKind::Trigger => Self::Trigger,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("SQLHUB_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = HubSettings::load(cli.settings.as_deref())?;
    let hub = DatabaseHub::with_builtin_plugins(settings)?;

    let ok = match cli.command {
        Commands::Plugins => {
            let started = Instant::now();
            let plugins = hub.plugins();
            let meta = Metadata::with_rows(elapsed_ms(started), plugins.len());
            print_json(&SuccessEnvelope::new("", "plugins", plugins, meta))?
        }
        Commands::Exec { target, sql, transaction, timeout_ms } => {
            let options = ExecuteOptions {
                need_transaction: transaction,
                timeout: timeout_ms.map(std::time::Duration::from_millis),
            };
            match run_exec(&hub, &target, &sql, options).await {
                Ok(result) => print_json(&SuccessEnvelope::for_command(&target.vendor, result))?,
                Err(e) => print_json(&ErrorEnvelope::from_error(&target.vendor, "exec", &e))?,
            }
        }
        Commands::Tables { target } => {
            let started = Instant::now();
            match run_tables(&hub, &target).await {
                Ok(tables) => {
                    let meta = Metadata::with_rows(elapsed_ms(started), tables.len());
                    print_json(&SuccessEnvelope::new(&target.vendor, "tables", tables, meta))?
                }
                Err(e) => print_json(&ErrorEnvelope::from_error(&target.vendor, "tables", &e))?,
            }
        }
        Commands::Ddl { target, kind, name } => {
            let started = Instant::now();
            match run_ddl(&hub, &target, kind.into(), &name).await {
                Ok(ddl) => {
                    let meta = Metadata::new(elapsed_ms(started));
                    print_json(&SuccessEnvelope::new(&target.vendor, "ddl", ddl, meta))?
                }
                Err(e) => print_json(&ErrorEnvelope::from_error(&target.vendor, "ddl", &e))?,
            }
        }
    };

    hub.shutdown().await;
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_exec(
    hub: &DatabaseHub,
    target: &Target,
    sql: &str,
    options: ExecuteOptions,
) -> Result<SqlCommandResult, HubError> {
    let id = open(hub, target).await?;
    let result = hub
        .execute_sql(&id, target.catalog.as_deref(), target.schema.as_deref(), sql, CLI_OWNER, options)
        .await;
    close(hub, &id).await;
    result
}

async fn run_tables(hub: &DatabaseHub, target: &Target) -> Result<Vec<String>, HubError> {
    let id = open(hub, target).await?;
    let result = hub.list_tables(&id, target.catalog.as_deref(), target.schema.as_deref(), CLI_OWNER).await;
    close(hub, &id).await;
    result
}

async fn run_ddl(hub: &DatabaseHub, target: &Target, facet: Facet, name: &str) -> Result<String, HubError> {
    let id = open(hub, target).await?;
    let result = hub
        .get_ddl(&id, target.catalog.as_deref(), target.schema.as_deref(), facet, name, CLI_OWNER)
        .await;
    close(hub, &id).await;
    result
}

async fn open(hub: &DatabaseHub, target: &Target) -> Result<String, HubError> {
    hub.open_connection(&target.config(), &target.vendor, CLI_OWNER).await
}

async fn close(hub: &DatabaseHub, id: &str) {
    if let Err(e) = hub.close_connection(id, CLI_OWNER).await {
        tracing::warn!(error = %e, "failed to close connection");
    }
}

/// Print an envelope; the return value mirrors its `ok` field
fn print_json<T: Serialize>(envelope: &T) -> anyhow::Result<bool> {
    let value = serde_json::to_value(envelope)?;
    let ok = value.get("ok").and_then(serde_json::Value::as_bool).unwrap_or(false);
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(ok)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
