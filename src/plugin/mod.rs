//! Plugins
//!
//! A [`Plugin`] bundles one [`DriverConnector`] with the capability providers
//! a vendor supports for a version range. Support for a facet is expressed by
//! the provider being present; callers ask the registry instead of inspecting
//! types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::driver::DriverConnector;
use crate::executor::SplitRules;
use crate::provider::{ColumnProvider, IndexProvider, ObjectProvider, TableProvider};
use crate::version::VersionRange;

mod registry;

pub use registry::PluginRegistry;

/// Metadata facets a plugin may implement
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facet {
    Database,
    Schema,
    Table,
    View,
    Column,
    Index,
    Function,
    Procedure,
    Trigger,
}

impl Facet {
    pub const ALL: [Self; 9] = [
        Self::Database,
        Self::Schema,
        Self::Table,
        Self::View,
        Self::Column,
        Self::Index,
        Self::Function,
        Self::Procedure,
        Self::Trigger,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Schema => "schema",
            Self::Table => "table",
            Self::View => "view",
            Self::Column => "column",
            Self::Index => "index",
            Self::Function => "function",
            Self::Procedure => "procedure",
            Self::Trigger => "trigger",
        }
    }

    /// Facets served by [`ObjectProvider`] alone
    #[must_use]
    pub const fn is_named_object(&self) -> bool {
        matches!(
            self,
            Self::Database | Self::Schema | Self::View | Self::Function | Self::Procedure | Self::Trigger
        )
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A capability provider, tagged by shape
#[derive(Clone)]
pub enum Provider {
    Objects(Arc<dyn ObjectProvider>),
    Tables(Arc<dyn TableProvider>),
    Columns(Arc<dyn ColumnProvider>),
    Indexes(Arc<dyn IndexProvider>),
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = match self {
            Self::Objects(_) => "Objects",
            Self::Tables(_) => "Tables",
            Self::Columns(_) => "Columns",
            Self::Indexes(_) => "Indexes",
        };
        f.write_str(shape)
    }
}

/// Vendor- and version-specific bundle of a connector plus providers
pub struct Plugin {
    id: String,
    vendor: String,
    range: VersionRange,
    connector: Arc<dyn DriverConnector>,
    split_rules: SplitRules,
    providers: BTreeMap<Facet, Provider>,
}

impl Plugin {
    pub fn new(
        id: impl Into<String>,
        vendor: impl Into<String>,
        range: VersionRange,
        connector: Arc<dyn DriverConnector>,
    ) -> Self {
        Self {
            id: id.into(),
            vendor: vendor.into().to_lowercase(),
            range,
            connector,
            split_rules: SplitRules::STANDARD,
            providers: BTreeMap::new(),
        }
    }

    /// Quoting rules used to split scripts sent through this plugin
    #[must_use]
    pub fn with_split_rules(mut self, rules: SplitRules) -> Self {
        self.split_rules = rules;
        self
    }

    /// Register a named-object provider for `facet`.
    ///
    /// Table, column and index facets have their own builders; passing one of
    /// them here is ignored with a warning.
    #[must_use]
    pub fn with_objects(mut self, facet: Facet, provider: Arc<dyn ObjectProvider>) -> Self {
        if facet.is_named_object() {
            self.providers.insert(facet, Provider::Objects(provider));
        } else {
            tracing::warn!(plugin = %self.id, %facet, "named-object provider cannot serve this facet");
        }
        self
    }

    #[must_use]
    pub fn with_tables(mut self, provider: Arc<dyn TableProvider>) -> Self {
        self.providers.insert(Facet::Table, Provider::Tables(provider));
        self
    }

    #[must_use]
    pub fn with_columns(mut self, provider: Arc<dyn ColumnProvider>) -> Self {
        self.providers.insert(Facet::Column, Provider::Columns(provider));
        self
    }

    #[must_use]
    pub fn with_indexes(mut self, provider: Arc<dyn IndexProvider>) -> Self {
        self.providers.insert(Facet::Index, Provider::Indexes(provider));
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lowercase vendor tag
    #[must_use]
    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    #[must_use]
    pub const fn range(&self) -> &VersionRange {
        &self.range
    }

    #[must_use]
    pub fn connector(&self) -> &Arc<dyn DriverConnector> {
        &self.connector
    }

    #[must_use]
    pub const fn split_rules(&self) -> SplitRules {
        self.split_rules
    }

    /// Implemented facets in declaration order
    #[must_use]
    pub fn facets(&self) -> Vec<Facet> {
        self.providers.keys().copied().collect()
    }

    #[must_use]
    pub fn supports(&self, facet: Facet) -> bool {
        self.providers.contains_key(&facet)
    }

    #[must_use]
    pub fn provider(&self, facet: Facet) -> Option<&Provider> {
        self.providers.get(&facet)
    }

    /// Serializable summary
    #[must_use]
    pub fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: self.id.clone(),
            vendor: self.vendor.clone(),
            version_range: self.range.to_string(),
            driver: self.connector.driver_name().to_string(),
            driver_version: self.connector.driver_version(),
            facets: self.facets(),
        }
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("id", &self.id)
            .field("vendor", &self.vendor)
            .field("range", &self.range.to_string())
            .field("facets", &self.facets())
            .finish_non_exhaustive()
    }
}

/// Plugin summary for discovery output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub vendor: String,
    pub version_range: String,
    pub driver: String,
    pub driver_version: String,
    pub facets: Vec<Facet>,
}
