use std::any::{Any, TypeId};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use hemera_core::HemeraError;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::hemera::Hemera;

// ---------------------------------------------------------------------------
// Plugin trait
// ---------------------------------------------------------------------------

/// A unit of registrations, hooks and decorations.
///
/// Each plugin registers into its own child scope: hooks it adds apply to
/// its own registrations and those of plugins nested below it, never to its
/// parent's. The `Any` bound enables type-based lookup via
/// `PluginRegistry::get::<T>()`.
#[async_trait]
pub trait Plugin: Send + Sync + Any {
    /// Unique name of this plugin; also the name of its scope.
    fn name(&self) -> &'static str;

    /// Registers the plugin's patterns, hooks and decorations on `hemera`,
    /// a handle bound to the plugin's scope. Must finish within
    /// `pluginTimeout`.
    async fn register(&self, hemera: &Hemera) -> anyhow::Result<()>;

    /// Releases plugin resources while the instance closes.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PluginRegistry
// ---------------------------------------------------------------------------

/// Registry of plugins.
///
/// Plugins boot in registration order and close in reverse order.
pub struct PluginRegistry {
    by_name: DashMap<&'static str, Arc<dyn Plugin>>,
    by_type: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    order: RwLock<Vec<&'static str>>,
    /// Number of plugins in `order` that already booted.
    booted: RwLock<usize>,
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            by_type: DashMap::new(),
            order: RwLock::new(Vec::new()),
            booted: RwLock::new(0),
        }
    }

    /// Adds a plugin. It boots on the next [`PluginRegistry::boot_pending`].
    ///
    /// # Errors
    ///
    /// Fails when a plugin of the same name is already registered.
    pub fn register<T: Plugin>(&self, plugin: T) -> Result<Arc<T>, HemeraError> {
        let name = plugin.name();
        if self.by_name.contains_key(name) {
            return Err(HemeraError::hemera(format!("plugin `{name}` is already registered")));
        }
        let arc = Arc::new(plugin);
        self.by_name.insert(name, arc.clone());
        self.by_type.insert(TypeId::of::<T>(), arc.clone());
        self.order.write().push(name);
        Ok(arc)
    }

    /// Retrieve a plugin by its concrete type.
    pub fn get<T: Plugin>(&self) -> Option<Arc<T>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.by_name.get(name).map(|entry| entry.value().clone())
    }

    /// Plugin names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.order.read().clone()
    }

    /// Boots every plugin registered since the last call, in registration
    /// order, each in a child scope of `hemera`.
    ///
    /// # Errors
    ///
    /// - `FatalError` when a plugin does not finish registering within
    ///   `timeout`
    /// - a root-kind error when a plugin's `register` fails
    ///
    /// Booting stops at the first failing plugin.
    pub async fn boot_pending(&self, hemera: &Hemera, timeout: Duration) -> Result<(), HemeraError> {
        loop {
            let next = {
                let order = self.order.read();
                order.get(*self.booted.read()).copied()
            };
            let Some(name) = next else {
                return Ok(());
            };
            let Some(plugin) = self.get_by_name(name) else {
                return Ok(());
            };

            let scoped = hemera.scoped(name);
            debug!(plugin = name, "registering plugin");
            match tokio::time::timeout(timeout, plugin.register(&scoped)).await {
                Ok(Ok(())) => {
                    *self.booted.write() += 1;
                    info!(plugin = name, "plugin registered");
                }
                Ok(Err(err)) => {
                    return Err(HemeraError::hemera(format!("plugin `{name}` failed to register: {err:#}"))
                        .with_property("plugin", name));
                }
                Err(_) => {
                    let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                    return Err(HemeraError::fatal(format!(
                        "plugin `{name}` did not register within {millis} ms"
                    ))
                    .with_property("plugin", name)
                    .with_property("pluginTimeout", millis));
                }
            }
        }
    }

    /// Closes every booted plugin in reverse registration order. Failures
    /// are logged and returned; they never stop the remaining plugins.
    pub async fn close_all(&self) -> Vec<anyhow::Error> {
        let booted = *self.booted.read();
        let order: Vec<&'static str> = self.order.read().iter().take(booted).copied().collect();
        let mut failures = Vec::new();
        for name in order.iter().rev() {
            if let Some(plugin) = self.get_by_name(name) {
                if let Err(err) = plugin.close().await {
                    warn!(plugin = name, error = %err, "plugin close failed");
                    failures.push(err.context(format!("closing plugin `{name}`")));
                }
            }
        }
        failures
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &*self.order.read())
            .field("booted", &*self.booted.read())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
