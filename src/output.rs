//! JSON Output Envelope Types
//!
//! Every hub call rendered for a machine reader is either a [`SuccessEnvelope`]
//! or an [`ErrorEnvelope`].
//!
//! # Output Contract
//! - Success: `{"ok": true, "vendor": "...", "command": "...", "data": {...}, "meta": {...}}`
//! - Error: `{"ok": false, "vendor": "...", "command": "...", "error": {"code": "...", "message": "..."}}`
//!
//! `ok` reports whether the call itself completed. A script whose statements
//! failed still completes: it is a success envelope whose `data.success` is false.

use serde::{Deserialize, Serialize};

use crate::error::HubError;
use crate::executor::SqlCommandResult;

/// Success envelope for operation results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessEnvelope<T> {
    /// Always true for success envelopes
    pub ok: bool,

    /// Vendor the call ran against (empty when not vendor-specific)
    pub vendor: String,

    /// Operation that was performed (`exec`, `tables`, `ddl`, ...)
    pub command: String,

    pub data: T,

    pub meta: Metadata,
}

impl<T> SuccessEnvelope<T> {
    pub fn new(vendor: impl Into<String>, command: impl Into<String>, data: T, meta: Metadata) -> Self {
        Self { ok: true, vendor: vendor.into(), command: command.into(), data, meta }
    }
}

impl SuccessEnvelope<SqlCommandResult> {
    /// Envelope for a script result; `rows_returned` counts the primary result set
    #[must_use]
    pub fn for_command(vendor: impl Into<String>, result: SqlCommandResult) -> Self {
        let meta = match &result.result_set {
            Some(rows) => Metadata::with_rows(result.execution_ms, rows.rows.len()),
            None => Metadata::new(result.execution_ms),
        };
        Self::new(vendor, "exec", result, meta)
    }
}

/// Error envelope for operation failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Always false for error envelopes
    pub ok: bool,

    pub vendor: String,

    pub command: String,

    pub error: ErrorInfo,
}

impl ErrorEnvelope {
    pub fn new(vendor: impl Into<String>, command: impl Into<String>, error: ErrorInfo) -> Self {
        Self { ok: false, vendor: vendor.into(), command: command.into(), error }
    }

    /// Create error envelope from `HubError`
    pub fn from_error(vendor: impl Into<String>, command: impl Into<String>, err: &HubError) -> Self {
        Self::new(vendor, command, ErrorInfo::new(err.error_code(), err.message()))
    }
}

/// Error information structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code (e.g., `NOT_FOUND`, `CONNECTION_FAILED`)
    pub code: String,

    /// Human-readable error message (no connection secrets)
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }
}

/// Execution metadata included in all success responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub execution_ms: u64,

    /// Number of rows returned (result sets only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_returned: Option<usize>,
}

impl Metadata {
    #[must_use]
    pub const fn new(execution_ms: u64) -> Self {
        Self { execution_ms, rows_returned: None }
    }

    #[must_use]
    pub const fn with_rows(execution_ms: u64, rows_returned: usize) -> Self {
        Self { execution_ms, rows_returned: Some(rows_returned) }
    }
}
