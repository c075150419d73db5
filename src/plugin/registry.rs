//! Plugin Registry
//!
//! Built once at startup (`register` takes `&mut self`) and then shared
//! behind an `Arc`, so lookups need no locking.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use super::{Facet, Plugin, PluginDescriptor, Provider};
use crate::error::{HubError, Result};
use crate::provider::{ColumnProvider, IndexProvider, ObjectProvider, TableProvider};
use crate::version::Version;

/// Vendor-indexed table of installed plugins
#[derive(Debug, Default)]
pub struct PluginRegistry {
    by_id: HashMap<String, Arc<Plugin>>,
    by_vendor: HashMap<String, Vec<Arc<Plugin>>>,
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every plugin compiled into this build
    pub fn with_builtin_plugins() -> Result<Self> {
        let mut registry = Self::new();
        crate::engine::register_builtin(&mut registry)?;
        Ok(registry)
    }

    /// Add a plugin; ids are unique across vendors
    pub fn register(&mut self, plugin: Plugin) -> Result<()> {
        if self.by_id.contains_key(plugin.id()) {
            return Err(HubError::duplicate_plugin(plugin.id()));
        }

        tracing::debug!(
            plugin = plugin.id(),
            vendor = plugin.vendor(),
            range = %plugin.range(),
            facets = ?plugin.facets(),
            "registered plugin"
        );

        let plugin = Arc::new(plugin);
        self.by_vendor.entry(plugin.vendor().to_string()).or_default().push(Arc::clone(&plugin));
        self.by_id.insert(plugin.id().to_string(), plugin);
        Ok(())
    }

    /// Look up a plugin by id
    pub fn get(&self, plugin_id: &str) -> Result<Arc<Plugin>> {
        self.by_id
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| HubError::not_found(format!("No plugin registered with id '{plugin_id}'")))
    }

    /// The plugin with the most permissive range for `vendor`.
    ///
    /// Used for the first connection attempt, before the server version is known.
    pub fn widest_plugin(&self, vendor: &str) -> Result<Arc<Plugin>> {
        self.candidates(vendor)
            .ok_or_else(|| HubError::unsupported_version(vendor, "any"))?
            .iter()
            .reduce(|best, p| if p.range().width_cmp(best.range()) == Ordering::Greater { p } else { best })
            .cloned()
            .ok_or_else(|| HubError::unsupported_version(vendor, "any"))
    }

    /// Pick the best plugin for a detected server version.
    ///
    /// Among plugins whose range contains `version`, the highest minimum wins
    /// (first registered on a tie). With no containing range, the widest range
    /// for the vendor is used.
    pub fn select_plugin(&self, vendor: &str, version: &str) -> Result<Arc<Plugin>> {
        let candidates =
            self.candidates(vendor).ok_or_else(|| HubError::unsupported_version(vendor, version))?;
        let detected = Version::parse(version);

        let mut best: Option<&Arc<Plugin>> = None;
        let mut degraded = false;
        for plugin in candidates {
            let hit = plugin.range().matches(&detected);
            degraded |= hit.degraded;
            if !hit.contains {
                continue;
            }
            best = match best {
                Some(current) if plugin.range().min.compare(&current.range().min).0 != Ordering::Greater => {
                    Some(current)
                }
                _ => Some(plugin),
            };
        }

        if degraded {
            tracing::warn!(vendor, version, "version not numeric; plugin selection fell back to string comparison");
        }

        match best {
            Some(plugin) => {
                tracing::debug!(vendor, version, plugin = plugin.id(), "selected plugin");
                Ok(Arc::clone(plugin))
            }
            None => {
                let fallback = self.widest_plugin(vendor)?;
                tracing::info!(
                    vendor,
                    version,
                    plugin = fallback.id(),
                    "no plugin range contains version; using widest plugin"
                );
                Ok(fallback)
            }
        }
    }

    /// Resolve a facet on a plugin
    pub fn get_capability(&self, plugin_id: &str, facet: Facet) -> Result<Provider> {
        self.get(plugin_id)?
            .provider(facet)
            .cloned()
            .ok_or_else(|| HubError::capability_not_supported(plugin_id, facet.as_str()))
    }

    /// Provider for a named-object facet (database, schema, view, function, procedure, trigger)
    pub fn object_provider(&self, plugin_id: &str, facet: Facet) -> Result<Arc<dyn ObjectProvider>> {
        match self.get_capability(plugin_id, facet)? {
            Provider::Objects(provider) => Ok(provider),
            other => Err(mismatch(plugin_id, facet, &other)),
        }
    }

    pub fn table_provider(&self, plugin_id: &str) -> Result<Arc<dyn TableProvider>> {
        match self.get_capability(plugin_id, Facet::Table)? {
            Provider::Tables(provider) => Ok(provider),
            other => Err(mismatch(plugin_id, Facet::Table, &other)),
        }
    }

    pub fn column_provider(&self, plugin_id: &str) -> Result<Arc<dyn ColumnProvider>> {
        match self.get_capability(plugin_id, Facet::Column)? {
            Provider::Columns(provider) => Ok(provider),
            other => Err(mismatch(plugin_id, Facet::Column, &other)),
        }
    }

    pub fn index_provider(&self, plugin_id: &str) -> Result<Arc<dyn IndexProvider>> {
        match self.get_capability(plugin_id, Facet::Index)? {
            Provider::Indexes(provider) => Ok(provider),
            other => Err(mismatch(plugin_id, Facet::Index, &other)),
        }
    }

    /// Plugins for a vendor in registration order
    #[must_use]
    pub fn plugins_for(&self, vendor: &str) -> Vec<Arc<Plugin>> {
        self.by_vendor.get(&vendor.to_lowercase()).cloned().unwrap_or_default()
    }

    /// Vendor tags with at least one plugin, sorted
    #[must_use]
    pub fn vendors(&self) -> Vec<String> {
        let mut vendors: Vec<String> = self.by_vendor.keys().cloned().collect();
        vendors.sort();
        vendors
    }

    /// Summaries of every plugin, sorted by vendor then id
    #[must_use]
    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        let mut all: Vec<PluginDescriptor> = self.by_id.values().map(|p| p.descriptor()).collect();
        all.sort_by(|a, b| a.vendor.cmp(&b.vendor).then_with(|| a.id.cmp(&b.id)));
        all
    }

    fn candidates(&self, vendor: &str) -> Option<&[Arc<Plugin>]> {
        self.by_vendor.get(&vendor.to_lowercase()).map(Vec::as_slice).filter(|plugins| !plugins.is_empty())
    }
}

fn mismatch(plugin_id: &str, facet: Facet, provider: &Provider) -> HubError {
    tracing::warn!(plugin = plugin_id, %facet, shape = ?provider, "provider registered under the wrong facet");
    HubError::capability_not_supported(plugin_id, facet.as_str())
}
