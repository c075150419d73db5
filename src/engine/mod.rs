//! Built-in Vendor Engines
//!
//! Each engine contributes one or more [`Plugin`](crate::plugin::Plugin)s for
//! its vendor: a driver connector plus the capability providers that vendor
//! supports. Engines are cargo features and are completely independent of
//! each other.

use crate::error::Result;
use crate::plugin::PluginRegistry;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

/// Register every compiled-in engine's plugins
pub fn register_builtin(registry: &mut PluginRegistry) -> Result<()> {
    #[cfg(feature = "sqlite")]
    sqlite::register(registry)?;

    #[cfg(feature = "postgres")]
    postgres::register(registry)?;

    #[cfg(feature = "mysql")]
    mysql::register(registry)?;

    tracing::debug!(vendors = ?registry.vendors(), "registered built-in plugins");
    Ok(())
}

/// Vendors compiled into this build
#[must_use]
pub fn builtin_vendors() -> Vec<&'static str> {
    let mut vendors = Vec::new();
    #[cfg(feature = "mysql")]
    vendors.push(mysql::VENDOR);
    #[cfg(feature = "postgres")]
    vendors.push(postgres::VENDOR);
    #[cfg(feature = "sqlite")]
    vendors.push(sqlite::VENDOR);
    vendors
}
