//! Caller Surface
//!
//! [`DatabaseHub`] is the single entry point used by every caller, whether a
//! REST controller or an agent tool. It ties the connection manager, the SQL
//! executor, and the DDL cache together and resolves capability providers
//! through the plugin that owns each connection.
//!
//! Ownership is checked on every call before any cached data is served.
//! Pre-execution failures (unknown id, wrong owner, unsupported facet) are
//! returned as errors; statement failures are reported inside
//! [`SqlCommandResult`].

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::config::{ConnectionConfig, HubSettings};
use crate::ddl_cache::{DdlCache, DdlKey};
use crate::driver::LiveConnection;
use crate::error::{HubError, Result};
use crate::executor::{SqlCommandRequest, SqlCommandResult, SqlExecutor};
use crate::manager::{ConnectionInfo, ConnectionManager, ScopedConnection};
use crate::plugin::{Facet, PluginDescriptor, PluginRegistry};
use crate::provider::{ColumnDetail, IndexDetail, ObjectProvider, Scope, TablePage, TableProvider};

/// Options for [`DatabaseHub::execute_sql`]
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub need_transaction: bool,
    /// Overrides the engine-wide statement timeout
    pub timeout: Option<Duration>,
}

/// Multi-database facade
pub struct DatabaseHub {
    manager: ConnectionManager,
    executor: SqlExecutor,
    ddl_cache: DdlCache,
}

impl DatabaseHub {
    #[must_use]
    pub fn new(registry: Arc<PluginRegistry>, settings: HubSettings) -> Self {
        Self {
            executor: SqlExecutor::new(&settings),
            ddl_cache: DdlCache::new(settings.ddl_cache_ttl()),
            manager: ConnectionManager::new(registry, settings),
        }
    }

    /// Hub over every plugin compiled into this build
    pub fn with_builtin_plugins(settings: HubSettings) -> Result<Self> {
        Ok(Self::new(Arc::new(PluginRegistry::with_builtin_plugins()?), settings))
    }

    #[must_use]
    pub const fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        self.manager.registry()
    }

    #[must_use]
    pub const fn ddl_cache(&self) -> &DdlCache {
        &self.ddl_cache
    }

    /// Installed plugins
    #[must_use]
    pub fn plugins(&self) -> Vec<PluginDescriptor> {
        self.registry().descriptors()
    }

    // ---- connections ----

    pub async fn open_connection(&self, config: &ConnectionConfig, vendor: &str, owner: &str) -> Result<String> {
        self.manager.open(config, vendor, owner).await
    }

    /// Close a connection and drop its cached DDL. Unknown ids are a no-op.
    pub async fn close_connection(&self, connection_id: &str, owner: &str) -> Result<()> {
        if let Err(HubError::Forbidden(message)) = self.manager.get_owned_any(connection_id, owner) {
            return Err(HubError::Forbidden(message));
        }
        self.manager.close(connection_id).await;
        self.ddl_cache.invalidate(connection_id);
        Ok(())
    }

    #[must_use]
    pub fn list_connections(&self, owner: &str) -> Vec<ConnectionInfo> {
        self.manager.list_owned(owner)
    }

    /// Facets the connection's plugin implements
    pub fn facets(&self, connection_id: &str, owner: &str) -> Result<Vec<Facet>> {
        Ok(self.manager.get_owned_any(connection_id, owner)?.plugin().facets())
    }

    /// Close everything; used on process shutdown
    pub async fn shutdown(&self) {
        self.manager.close_all().await;
        self.ddl_cache.invalidate_all();
    }

    // ---- metadata listings ----

    pub async fn list_databases(&self, connection_id: &str, owner: &str) -> Result<Vec<String>> {
        self.list_names(connection_id, None, None, Facet::Database, owner).await
    }

    pub async fn list_schemas(&self, connection_id: &str, catalog: Option<&str>, owner: &str) -> Result<Vec<String>> {
        self.list_names(connection_id, catalog, None, Facet::Schema, owner).await
    }

    pub async fn list_tables(
        &self,
        connection_id: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        owner: &str,
    ) -> Result<Vec<String>> {
        self.list_names(connection_id, catalog, schema, Facet::Table, owner).await
    }

    pub async fn list_views(
        &self,
        connection_id: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        owner: &str,
    ) -> Result<Vec<String>> {
        self.list_names(connection_id, catalog, schema, Facet::View, owner).await
    }

    pub async fn list_functions(
        &self,
        connection_id: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        owner: &str,
    ) -> Result<Vec<String>> {
        self.list_names(connection_id, catalog, schema, Facet::Function, owner).await
    }

    pub async fn list_procedures(
        &self,
        connection_id: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        owner: &str,
    ) -> Result<Vec<String>> {
        self.list_names(connection_id, catalog, schema, Facet::Procedure, owner).await
    }

    pub async fn list_triggers(
        &self,
        connection_id: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        owner: &str,
    ) -> Result<Vec<String>> {
        self.list_names(connection_id, catalog, schema, Facet::Trigger, owner).await
    }

    /// Names of every object of kind `facet` in scope
    #[instrument(skip(self, owner), fields(facet = %facet))]
    pub async fn list_names(
        &self,
        connection_id: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        facet: Facet,
        owner: &str,
    ) -> Result<Vec<String>> {
        let scoped = self.manager.get_owned(connection_id, catalog, schema, owner)?;
        let provider = NamedProvider::resolve(self.registry(), scoped.connection.plugin_id(), facet)?;
        let mut conn = scoped.connection.lock().await?;
        provider.list_names(&mut **conn, &scoped.scope).await
    }

    pub async fn list_columns(
        &self,
        connection_id: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        table: &str,
        owner: &str,
    ) -> Result<Vec<ColumnDetail>> {
        let scoped = self.manager.get_owned(connection_id, catalog, schema, owner)?;
        let provider = self.registry().column_provider(scoped.connection.plugin_id())?;
        let mut conn = scoped.connection.lock().await?;
        provider.list_columns(&mut **conn, &scoped.scope, table).await
    }

    pub async fn list_indexes(
        &self,
        connection_id: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        table: &str,
        owner: &str,
    ) -> Result<Vec<IndexDetail>> {
        let scoped = self.manager.get_owned(connection_id, catalog, schema, owner)?;
        let provider = self.registry().index_provider(scoped.connection.plugin_id())?;
        let mut conn = scoped.connection.lock().await?;
        provider.list_indexes(&mut **conn, &scoped.scope, table).await
    }

    // ---- DDL ----

    pub async fn get_table_ddl(
        &self,
        connection_id: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        name: &str,
        owner: &str,
    ) -> Result<String> {
        self.get_ddl(connection_id, catalog, schema, Facet::Table, name, owner).await
    }

    pub async fn get_view_ddl(
        &self,
        connection_id: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        name: &str,
        owner: &str,
    ) -> Result<String> {
        self.get_ddl(connection_id, catalog, schema, Facet::View, name, owner).await
    }

    pub async fn get_function_ddl(
        &self,
        connection_id: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        name: &str,
        owner: &str,
    ) -> Result<String> {
        self.get_ddl(connection_id, catalog, schema, Facet::Function, name, owner).await
    }

    pub async fn get_procedure_ddl(
        &self,
        connection_id: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        name: &str,
        owner: &str,
    ) -> Result<String> {
        self.get_ddl(connection_id, catalog, schema, Facet::Procedure, name, owner).await
    }

    pub async fn get_trigger_ddl(
        &self,
        connection_id: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        name: &str,
        owner: &str,
    ) -> Result<String> {
        self.get_ddl(connection_id, catalog, schema, Facet::Trigger, name, owner).await
    }

    /// DDL for one object, served from the cache when possible
    #[instrument(skip(self, owner), fields(facet = %facet))]
    pub async fn get_ddl(
        &self,
        connection_id: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        facet: Facet,
        name: &str,
        owner: &str,
    ) -> Result<String> {
        let scoped = self.manager.get_owned(connection_id, catalog, schema, owner)?;
        let provider = NamedProvider::resolve(self.registry(), scoped.connection.plugin_id(), facet)?;
        let key = DdlKey::new(connection_id, &scoped.scope, facet, name);

        let scoped = &scoped;
        let provider = &provider;
        self.ddl_cache
            .fetch(&key, move || async move {
                let mut conn = scoped.connection.lock().await?;
                provider.get_ddl(&mut **conn, &scoped.scope, name).await
            })
            .await
    }

    // ---- drops ----

    /// Drop an object with one generated statement run in autocommit mode.
    ///
    /// Statement failures come back inside the result, unchanged.
    #[instrument(skip(self, owner), fields(facet = %facet))]
    pub async fn drop_object(
        &self,
        connection_id: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        facet: Facet,
        name: &str,
        owner: &str,
    ) -> Result<SqlCommandResult> {
        let scoped = self.manager.get_owned(connection_id, catalog, schema, owner)?;
        let provider = NamedProvider::resolve(self.registry(), scoped.connection.plugin_id(), facet)?;
        let statement = provider.drop_statement(&scoped.scope, name)?;

        let key = DdlKey::new(connection_id, &scoped.scope, facet, name);
        let result = self.run(scoped, statement, false, None).await;
        if result.success {
            self.ddl_cache.invalidate_key(&key);
        }
        Ok(result)
    }

    // ---- table data ----

    #[allow(clippy::too_many_arguments)]
    pub async fn page_table_data(
        &self,
        connection_id: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        table: &str,
        offset: u64,
        limit: u64,
        owner: &str,
    ) -> Result<TablePage> {
        let scoped = self.manager.get_owned(connection_id, catalog, schema, owner)?;
        let provider = self.registry().table_provider(scoped.connection.plugin_id())?;
        let mut conn = scoped.connection.lock().await?;
        provider.page_data(&mut **conn, &scoped.scope, table, offset, limit).await
    }

    pub async fn insert_row(
        &self,
        connection_id: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        table: &str,
        row: &Map<String, Value>,
        owner: &str,
    ) -> Result<u64> {
        let scoped = self.manager.get_owned(connection_id, catalog, schema, owner)?;
        let provider = self.registry().table_provider(scoped.connection.plugin_id())?;
        let mut conn = scoped.connection.lock().await?;
        provider.insert(&mut **conn, &scoped.scope, table, row).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_rows(
        &self,
        connection_id: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        table: &str,
        values: &Map<String, Value>,
        key: &Map<String, Value>,
        owner: &str,
    ) -> Result<u64> {
        let scoped = self.manager.get_owned(connection_id, catalog, schema, owner)?;
        let provider = self.registry().table_provider(scoped.connection.plugin_id())?;
        let mut conn = scoped.connection.lock().await?;
        provider.update(&mut **conn, &scoped.scope, table, values, key).await
    }

    pub async fn delete_rows(
        &self,
        connection_id: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        table: &str,
        key: &Map<String, Value>,
        owner: &str,
    ) -> Result<u64> {
        let scoped = self.manager.get_owned(connection_id, catalog, schema, owner)?;
        let provider = self.registry().table_provider(scoped.connection.plugin_id())?;
        let mut conn = scoped.connection.lock().await?;
        provider.delete(&mut **conn, &scoped.scope, table, key).await
    }

    // ---- SQL ----

    /// Run a script; only ownership and lookup failures are returned as `Err`
    pub async fn execute_sql(
        &self,
        connection_id: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        sql: &str,
        owner: &str,
        options: ExecuteOptions,
    ) -> Result<SqlCommandResult> {
        let scoped = self.manager.get_owned(connection_id, catalog, schema, owner)?;
        Ok(self.run(scoped, sql.to_string(), options.need_transaction, options.timeout).await)
    }

    async fn run(
        &self,
        scoped: ScopedConnection,
        sql: String,
        need_transaction: bool,
        timeout: Option<Duration>,
    ) -> SqlCommandResult {
        let connection = Arc::clone(&scoped.connection);
        let mut request = SqlCommandRequest::new(scoped.connection, sql)
            .with_scope(scoped.scope)
            .with_transaction(need_transaction);
        request.timeout = timeout;
        let result = self.executor.execute(request).await;

        // a handle abandoned on timeout leaves a closed entry nobody can reach
        if !connection.is_open() {
            self.manager.close(connection.id()).await;
            self.ddl_cache.invalidate(connection.id());
        }
        result
    }
}

/// Provider for a facet whose objects have names and DDL
enum NamedProvider {
    Objects(Arc<dyn ObjectProvider>),
    Tables(Arc<dyn TableProvider>),
}

impl NamedProvider {
    fn resolve(registry: &PluginRegistry, plugin_id: &str, facet: Facet) -> Result<Self> {
        match facet {
            Facet::Table => Ok(Self::Tables(registry.table_provider(plugin_id)?)),
            Facet::Column | Facet::Index => Err(HubError::invalid_input(format!(
                "{facet} objects are listed per table and have no standalone DDL"
            ))),
            _ => Ok(Self::Objects(registry.object_provider(plugin_id, facet)?)),
        }
    }

    async fn list_names(&self, conn: &mut dyn LiveConnection, scope: &Scope) -> Result<Vec<String>> {
        match self {
            Self::Objects(p) => p.list_names(conn, scope).await,
            Self::Tables(p) => p.list_names(conn, scope).await,
        }
    }

    async fn get_ddl(&self, conn: &mut dyn LiveConnection, scope: &Scope, name: &str) -> Result<String> {
        match self {
            Self::Objects(p) => p.get_ddl(conn, scope, name).await,
            Self::Tables(p) => p.get_ddl(conn, scope, name).await,
        }
    }

    fn drop_statement(&self, scope: &Scope, name: &str) -> Result<String> {
        match self {
            Self::Objects(p) => p.drop_statement(scope, name),
            Self::Tables(p) => p.drop_statement(scope, name),
        }
    }
}
