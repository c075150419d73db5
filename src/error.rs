//! Error Handling Infrastructure
//!
//! This module defines all error types used throughout SQLHub.
//! All errors are structured and map to stable error codes so API layers and
//! agent tools can branch on them without parsing messages.
//!
//! # Error Categories
//! - `DriverLoad`: the vendor driver could not be made available
//! - `ConnectionFailed`: opening or probing a live connection failed
//! - `UnsupportedVersion`: no plugin is registered for a vendor
//! - `CapabilityNotSupported`: a plugin does not implement a facet
//! - `NotFound` / `Forbidden`: unknown connection id, or ownership mismatch
//! - `StatementExecution`: a statement failed (captured into results, never thrown by the executor)
//! - `DuplicatePlugin`: a plugin id was registered twice
//! - `InvalidInput`, `Timeout`, `Config`: ambient failures

use thiserror::Error;

/// Main error type for SQLHub operations
#[derive(Error, Debug)]
pub enum HubError {
    /// Vendor driver could not be loaded
    #[error("Driver load failed: {0}")]
    DriverLoad(String),

    /// Database connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No plugin can serve this vendor
    #[error("Unsupported database version: no plugin registered for vendor '{vendor}' (version {version})")]
    UnsupportedVersion { vendor: String, version: String },

    /// The plugin does not implement the requested facet
    #[error("Capability not supported: plugin '{plugin_id}' does not provide {facet}")]
    CapabilityNotSupported { plugin_id: String, facet: String },

    /// Unknown connection id (or a connection that is already closed)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Connection is owned by a different user
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// A single statement failed inside the database
    #[error("Statement execution failed: {0}")]
    StatementExecution(String),

    /// Plugin id registered twice
    #[error("Duplicate plugin: '{0}' is already registered")]
    DuplicatePlugin(String),

    /// Invalid input or missing required parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Deadline expired before the database answered
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Settings file or environment error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl HubError {
    /// Convert error to error code string
    ///
    /// Error codes are stable and suitable for programmatic handling by agents.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::DriverLoad(_) => "DRIVER_LOAD_FAILED",
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::UnsupportedVersion { .. } => "UNSUPPORTED_VERSION",
            Self::CapabilityNotSupported { .. } => "CAPABILITY_NOT_SUPPORTED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::StatementExecution(_) => "STATEMENT_FAILED",
            Self::DuplicatePlugin(_) => "DUPLICATE_PLUGIN",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Timeout(_) => "TIMEOUT",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Get human-readable error message
    ///
    /// Never contains connection secrets.
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Create a driver load error
    pub fn driver_load(message: impl Into<String>) -> Self {
        Self::DriverLoad(message.into())
    }

    /// Create a connection failed error
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create an unsupported version error
    pub fn unsupported_version(vendor: impl Into<String>, version: impl Into<String>) -> Self {
        Self::UnsupportedVersion { vendor: vendor.into(), version: version.into() }
    }

    /// Create a capability-not-supported error
    pub fn capability_not_supported(plugin_id: impl Into<String>, facet: impl Into<String>) -> Self {
        Self::CapabilityNotSupported { plugin_id: plugin_id.into(), facet: facet.into() }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a forbidden error
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    /// Create a statement execution error
    pub fn statement(message: impl Into<String>) -> Self {
        Self::StatementExecution(message.into())
    }

    /// Create a duplicate plugin error
    pub fn duplicate_plugin(plugin_id: impl Into<String>) -> Self {
        Self::DuplicatePlugin(plugin_id.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Text reported to callers for a failed statement.
    ///
    /// Statement failures carry the raw driver message so rendered results read
    /// like the database's own error output.
    #[must_use]
    pub fn statement_message(&self) -> String {
        match self {
            Self::StatementExecution(detail) => detail.clone(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for SQLHub operations
pub type Result<T> = std::result::Result<T, HubError>;
