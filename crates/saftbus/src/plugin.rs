//! The plugin boundary.
//!
//! Drivers and demo objects live outside this crate; they reach the bus
//! through this capability contract. Plugins are registered in an explicit
//! ordered registry and run in registration order, so the container's
//! creation order (and with it the reverse destruction order later objects
//! rely on) follows plugin order. There is no dynamic symbol lookup — a
//! plugin is a trait object handed to the registry before the daemon
//! starts serving.

use crate::container::Container;
use crate::error::Result;

pub trait Plugin {
    fn name(&self) -> &str;

    /// Create and register this plugin's service objects. The container is
    /// the daemon's; object paths are the plugin's to choose.
    fn create_services(&self, container: &mut Container, args: &[String]) -> Result<()>;
}

/// Explicit, ordered plugin registry.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Box<dyn Plugin>) {
        tracing::debug!(plugin = plugin.name(), "Plugin registered");
        self.plugins.push(plugin);
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run every plugin's `create_services` in registration order. The
    /// first failure aborts the load; objects created so far stay owned by
    /// the container and are torn down with it in reverse order.
    pub fn load_all(&self, container: &mut Container, args: &[String]) -> Result<()> {
        for plugin in &self.plugins {
            plugin.create_services(container, args)?;
            tracing::info!(plugin = plugin.name(), "Plugin services created");
        }
        Ok(())
    }
}
