use crate::{PluginError, RegisteredPlugin, SharedPlugin};
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

pub type PluginFactory = Arc<dyn Fn() -> SharedPlugin + Send + Sync>;

/// Lookup table of plugins compiled into the host, keyed by plugin id.
#[derive(Clone, Default)]
pub struct BuiltinPlugins {
    factories: BTreeMap<String, PluginFactory>,
}

impl BuiltinPlugins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, id: impl Into<String>, factory: F) -> Option<PluginFactory>
    where
        F: Fn() -> SharedPlugin + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Arc::new(factory))
    }

    pub fn with<F>(mut self, id: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> SharedPlugin + Send + Sync + 'static,
    {
        self.register(id, factory);
        self
    }

    pub fn create(&self, id: &str) -> Option<SharedPlugin> {
        self.factories.get(id).map(|factory| factory())
    }
}

/// Loads plugins that are not part of the built-in table.
#[async_trait]
pub trait PluginLoader: Send + Sync {
    async fn load(&self, id: &str) -> Result<SharedPlugin, PluginError>;
}

type PendingLoad = Shared<BoxFuture<'static, Result<RegisteredPlugin, PluginError>>>;

#[derive(Default)]
struct RegistryState {
    loaded: BTreeMap<String, RegisteredPlugin>,
    in_flight: BTreeMap<String, PendingLoad>,
}

/// Per-run plugin registry.
///
/// Each plugin id is loaded at most once per registry: concurrent requests
/// for an id that is still loading await the same in-flight load, and later
/// requests are served from the cache. Failed loads are not cached.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    builtins: BuiltinPlugins,
    loader: Option<Arc<dyn PluginLoader>>,
    state: Arc<Mutex<RegistryState>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins(mut self, builtins: BuiltinPlugins) -> Self {
        self.builtins = builtins;
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn PluginLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Validates and caches an already constructed plugin under its own id.
    pub fn register(&self, plugin: SharedPlugin) -> Result<RegisteredPlugin, PluginError> {
        let registered = RegisteredPlugin::new(plugin)?;
        self.lock_state()?
            .loaded
            .insert(registered.id().to_string(), registered.clone());
        Ok(registered)
    }

    pub fn get(&self, id: &str) -> Option<RegisteredPlugin> {
        self.lock_state()
            .ok()
            .and_then(|state| state.loaded.get(id).cloned())
    }

    pub fn loaded_ids(&self) -> Vec<String> {
        self.lock_state()
            .map(|state| state.loaded.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn get_or_load(&self, id: &str) -> Result<RegisteredPlugin, PluginError> {
        let pending = {
            let mut state = self.lock_state()?;
            if let Some(plugin) = state.loaded.get(id) {
                return Ok(plugin.clone());
            }
            match state.in_flight.get(id) {
                Some(pending) => pending.clone(),
                None => {
                    let pending =
                        load_plugin(self.builtins.clone(), self.loader.clone(), id.to_string())
                            .boxed()
                            .shared();
                    state.in_flight.insert(id.to_string(), pending.clone());
                    pending
                }
            }
        };

        let outcome = pending.clone().await;

        let mut state = self.lock_state()?;
        // A waiter woken late may find a retry already in flight under the
        // same id; only the load it awaited is removed.
        if state
            .in_flight
            .get(id)
            .is_some_and(|current| current.ptr_eq(&pending))
        {
            state.in_flight.remove(id);
        }
        if let Ok(plugin) = &outcome {
            state
                .loaded
                .entry(id.to_string())
                .or_insert_with(|| plugin.clone());
        }
        outcome
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, RegistryState>, PluginError> {
        self.state
            .lock()
            .map_err(|_| PluginError::Registry("registry lock poisoned".to_string()))
    }
}

async fn load_plugin(
    builtins: BuiltinPlugins,
    loader: Option<Arc<dyn PluginLoader>>,
    id: String,
) -> Result<RegisteredPlugin, PluginError> {
    let plugin = match (builtins.create(&id), loader) {
        (Some(plugin), _) => {
            debug!(plugin = %id, "loading built-in plugin");
            plugin
        }
        (None, Some(loader)) => {
            debug!(plugin = %id, "loading external plugin");
            loader.load(&id).await?
        }
        (None, None) => return Err(PluginError::NotFound { id }),
    };

    let registered = RegisteredPlugin::new(plugin)?;
    if registered.id() != id {
        return Err(PluginError::Invalid {
            reason: format!("loaded plugin reports id '{}'", registered.id()),
            id,
        });
    }
    Ok(registered)
}
