//! Connection Manager
//!
//! Opens live connections through the plugin registry and tracks them by an
//! opaque connection id plus owning user. Every access checks ownership.
//!
//! # Lifecycle
//! `open` → [`ActiveConnection`] in state `OPEN` → `close` (or `close_all` on
//! shutdown) → handle released, entry removed. A connection whose handle had
//! to be abandoned after a timeout is marked `CLOSED` in place and behaves like
//! an unknown id until it is closed.
//!
//! # Locking
//! The registry is a sharded [`DashMap`]; unrelated connections never contend.
//! Each connection's handle sits behind its own async mutex, which the SQL
//! executor and providers hold for the duration of one call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::instrument;

use crate::config::{ConnectionConfig, HubSettings};
use crate::driver::{LiveConnection, StatementOutput};
use crate::error::{HubError, Result};
use crate::plugin::{Plugin, PluginRegistry};
use crate::provider::Scope;

/// Exclusive access to a connection's live handle
pub type HandleGuard<'a> = MutexGuard<'a, Box<dyn LiveConnection>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionState {
    Open,
    Closed,
}

/// A live, owned, registry-tracked connection
pub struct ActiveConnection {
    id: String,
    owner: String,
    plugin: Arc<Plugin>,
    database_version: String,
    created_at: DateTime<Utc>,
    closed: AtomicBool,
    handle: Mutex<Box<dyn LiveConnection>>,
}

impl ActiveConnection {
    fn new(
        id: String,
        owner: &str,
        plugin: Arc<Plugin>,
        database_version: String,
        handle: Box<dyn LiveConnection>,
    ) -> Self {
        Self {
            id,
            owner: owner.to_string(),
            plugin,
            database_version,
            created_at: Utc::now(),
            closed: AtomicBool::new(false),
            handle: Mutex::new(handle),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    #[must_use]
    pub fn plugin(&self) -> &Arc<Plugin> {
        &self.plugin
    }

    #[must_use]
    pub fn plugin_id(&self) -> &str {
        self.plugin.id()
    }

    #[must_use]
    pub fn vendor(&self) -> &str {
        self.plugin.vendor()
    }

    /// Version string the server reported at open time
    #[must_use]
    pub fn database_version(&self) -> &str {
        &self.database_version
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::Acquire) {
            ConnectionState::Closed
        } else {
            ConnectionState::Open
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Wait for exclusive use of the live handle.
    ///
    /// Statements on one connection run strictly in lock order.
    pub async fn lock(&self) -> Result<HandleGuard<'_>> {
        let guard = self.handle.lock().await;
        if !self.is_open() {
            return Err(self.closed_error());
        }
        Ok(guard)
    }

    /// Flag the handle as unusable; later `lock` calls fail
    pub fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(connection_id = %self.id, "connection marked closed");
        }
    }

    /// Mark closed and release the live handle, waiting for any in-flight call
    pub async fn release(&self) {
        self.mark_closed();
        let handle = {
            let mut slot = self.handle.lock().await;
            std::mem::replace(&mut *slot, Box::new(Released))
        };
        if let Err(e) = handle.close().await {
            tracing::warn!(connection_id = %self.id, error = %e, "error while closing handle");
        }
    }

    /// Lightweight summary
    #[must_use]
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: self.id.clone(),
            plugin_id: self.plugin.id().to_string(),
            vendor: self.plugin.vendor().to_string(),
            database_version: self.database_version.clone(),
            created_at: self.created_at,
            state: self.state(),
        }
    }

    fn closed_error(&self) -> HubError {
        HubError::not_found(format!("Connection '{}' is closed", self.id))
    }
}

impl std::fmt::Debug for ActiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveConnection")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("plugin", &self.plugin.id())
            .field("database_version", &self.database_version)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Stand-in left behind once the real handle has been closed
struct Released;

impl Released {
    fn gone<T>() -> Result<T> {
        Err(HubError::not_found("Connection handle has been released"))
    }
}

#[async_trait]
impl LiveConnection for Released {
    async fn execute(&mut self, _sql: &str, _max_rows: usize) -> Result<StatementOutput> {
        Self::gone()
    }

    async fn begin(&mut self) -> Result<()> {
        Self::gone()
    }

    async fn commit(&mut self) -> Result<()> {
        Self::gone()
    }

    async fn rollback(&mut self) -> Result<()> {
        Self::gone()
    }

    async fn use_scope(&mut self, _catalog: Option<&str>, _schema: Option<&str>) -> Result<()> {
        Self::gone()
    }

    async fn server_version(&mut self) -> Result<String> {
        Self::gone()
    }

    async fn is_alive(&mut self) -> bool {
        false
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Connection summary returned by listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub plugin_id: String,
    pub vendor: String,
    pub database_version: String,
    pub created_at: DateTime<Utc>,
    pub state: ConnectionState,
}

/// An owned connection together with the catalog/schema the caller asked for
#[derive(Debug, Clone)]
pub struct ScopedConnection {
    pub connection: Arc<ActiveConnection>,
    pub scope: Scope,
}

/// Registry of live connections
pub struct ConnectionManager {
    registry: Arc<PluginRegistry>,
    settings: HubSettings,
    connections: DashMap<String, Arc<ActiveConnection>>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(registry: Arc<PluginRegistry>, settings: HubSettings) -> Self {
        Self { registry, settings, connections: DashMap::new() }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Open a connection for `owner` and return its id.
    ///
    /// Connects with the vendor's widest plugin, asks the server for its
    /// version, then reconnects through the best-matching plugin when that is
    /// a different one. Handles opened along a failing path are closed before
    /// the error is returned.
    #[instrument(skip(self, config), fields(vendor = %vendor, owner = %owner))]
    pub async fn open(&self, config: &ConnectionConfig, vendor: &str, owner: &str) -> Result<String> {
        let deadline = config.connect_timeout(&self.settings);

        // Dropping the timed-out future drops whatever handle it held
        let (plugin, version, handle) = tokio::time::timeout(deadline, self.establish(config, vendor))
            .await
            .map_err(|_| {
                HubError::timeout(format!("connecting to {vendor} exceeded {} ms", deadline.as_millis()))
            })??;

        let id = uuid::Uuid::new_v4().to_string();
        let connection = Arc::new(ActiveConnection::new(id.clone(), owner, plugin, version, handle));

        tracing::info!(
            connection_id = %id,
            plugin = connection.plugin_id(),
            database_version = connection.database_version(),
            "connection opened"
        );
        self.connections.insert(id.clone(), connection);
        Ok(id)
    }

    async fn establish(
        &self,
        config: &ConnectionConfig,
        vendor: &str,
    ) -> Result<(Arc<Plugin>, String, Box<dyn LiveConnection>)> {
        let initial = self.registry.widest_plugin(vendor)?;
        let mut handle = initial.connector().connect(config).await?;

        let version = match initial.connector().database_version(handle.as_mut()).await {
            Ok(version) => version,
            Err(e) => {
                close_quietly(handle).await;
                return Err(e);
            }
        };

        let selected = match self.registry.select_plugin(vendor, &version) {
            Ok(plugin) => plugin,
            Err(e) => {
                close_quietly(handle).await;
                return Err(e);
            }
        };

        if selected.id() != initial.id() {
            tracing::debug!(from = initial.id(), to = selected.id(), "reconnecting through selected plugin");
            close_quietly(handle).await;
            handle = selected.connector().connect(config).await?;
        }

        Ok((selected, version, handle))
    }

    /// Ownership-checked lookup carrying the caller's catalog/schema.
    ///
    /// The scope is advisory; it never gates access.
    pub fn get_owned(
        &self,
        connection_id: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        owner: &str,
    ) -> Result<ScopedConnection> {
        let connection = self.get_owned_any(connection_id, owner)?;
        Ok(ScopedConnection { connection, scope: Scope::new(catalog, schema) })
    }

    /// Ownership-checked lookup for scope-agnostic operations
    pub fn get_owned_any(&self, connection_id: &str, owner: &str) -> Result<Arc<ActiveConnection>> {
        let connection = self
            .connections
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|connection| connection.is_open())
            .ok_or_else(|| HubError::not_found(format!("Connection '{connection_id}' not found")))?;

        if connection.owner() != owner {
            tracing::warn!(connection_id, "ownership check failed");
            return Err(HubError::forbidden(format!(
                "Connection '{connection_id}' belongs to another user"
            )));
        }
        Ok(connection)
    }

    /// Close and forget a connection. Unknown ids are a no-op.
    #[instrument(skip(self))]
    pub async fn close(&self, connection_id: &str) {
        let Some((_, connection)) = self.connections.remove(connection_id) else {
            tracing::debug!("close on unknown connection ignored");
            return;
        };
        connection.release().await;
        tracing::info!("connection closed");
    }

    /// Close every tracked connection
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.connections.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.close(&id).await;
        }
    }

    /// Connections owned by `owner`, oldest first
    #[must_use]
    pub fn list_owned(&self, owner: &str) -> Vec<ConnectionInfo> {
        let mut owned: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .filter(|entry| entry.value().owner() == owner)
            .map(|entry| entry.value().info())
            .collect();
        owned.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.connection_id.cmp(&b.connection_id)));
        owned
    }

    #[must_use]
    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

async fn close_quietly(handle: Box<dyn LiveConnection>) {
    if let Err(e) = handle.close().await {
        tracing::debug!(error = %e, "error while closing discarded handle");
    }
}
