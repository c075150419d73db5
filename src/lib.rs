//! SQLHub - Multi-Database Plugin and Connection Engine
//!
//! SQLHub lets one caller work against several database vendors through a
//! single surface. Each vendor contributes plugins (a driver connector plus
//! metadata providers) tagged with the version range they serve; opening a
//! connection asks the server for its version and binds the best matching plugin.
//!
//! # Core Principles
//! - One caller surface ([`DatabaseHub`]) for REST controllers and agent tools alike
//! - Vendor-specific SQL, no query language abstraction
//! - Connections belong to the owner that opened them
//! - Statement failures are results, not errors
//!
//! # Module Organization
//! - [`error`] - Error types and stable error codes
//! - [`version`] - Version parsing and range matching
//! - [`config`] - Connection parameters and engine settings
//! - [`driver`] - Driver connector and live handle contracts
//! - [`provider`] - Capability provider contracts
//! - [`plugin`] - Plugins, facets, and the plugin registry
//! - [`manager`] - Connection manager
//! - [`executor`] - SQL execution engine
//! - [`ddl_cache`] - DDL cache
//! - [`hub`] - Caller surface
//! - [`output`] - JSON output envelopes
//! - [`engine`] - Built-in vendor engines (`sqlite`, `postgres`, `mysql` features)

pub mod config;
pub mod ddl_cache;
pub mod driver;
pub mod engine;
pub mod error;
pub mod executor;
pub mod hub;
pub mod manager;
pub mod output;
pub mod plugin;
pub mod provider;
pub mod version;

// Re-export commonly used types for convenience
pub use config::{ConnectionConfig, HubSettings};
pub use ddl_cache::{DdlCache, DdlKey};
pub use driver::{ColumnMeta, DriverConnector, LiveConnection, RowSet, StatementOutput};
pub use error::{HubError, Result};
pub use executor::{
    split_statements, split_statements_with, MessageLevel, ResultMessage, SplitRules, SqlCommandRequest, SqlCommandResult,
    SqlCommandSubResult, SqlExecutor,
};
pub use hub::{DatabaseHub, ExecuteOptions};
pub use manager::{ActiveConnection, ConnectionInfo, ConnectionManager, ConnectionState};
pub use output::{ErrorEnvelope, ErrorInfo, Metadata, SuccessEnvelope};
pub use plugin::{Facet, Plugin, PluginDescriptor, PluginRegistry};
pub use provider::{ColumnDetail, IndexDetail, Scope, TablePage};
pub use version::{Version, VersionRange};
