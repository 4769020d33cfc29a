//! Plugin registry
//!
//! Plugins are compiled into the worker and looked up by kind and identifier
//! when the `load` message arrives.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use child_bridge::config::PluginType;
use child_bridge::ipc::LoadPayload;

use crate::WorkerError;

/// A loaded plugin instance
#[async_trait]
pub trait BridgePlugin: Send + 'static {
    /// Serve the bridge. Returning `Ok` ends serving but keeps the worker
    /// alive until the channel closes; an error ends the worker.
    async fn serve(&mut self) -> Result<(), WorkerError>;
}

/// Creates plugin instances from a `load` payload
pub trait PluginFactory: Send + Sync + 'static {
    fn create(&self, payload: &LoadPayload) -> Result<Box<dyn BridgePlugin>, WorkerError>;
}

impl<F> PluginFactory for F
where
    F: Fn(&LoadPayload) -> Result<Box<dyn BridgePlugin>, WorkerError> + Send + Sync + 'static,
{
    fn create(&self, payload: &LoadPayload) -> Result<Box<dyn BridgePlugin>, WorkerError> {
        self(payload)
    }
}

/// Lookup table of the plugins this worker can host
#[derive(Default, Clone)]
pub struct PluginRegistry {
    factories: HashMap<(PluginType, String), Arc<dyn PluginFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the plugins shipped with the worker
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        crate::heartbeat::register(&mut registry);
        registry
    }

    pub fn register(&mut self, kind: PluginType, identifier: impl Into<String>, factory: impl PluginFactory) {
        self.factories.insert((kind, identifier.into()), Arc::new(factory));
    }

    pub fn get(&self, kind: PluginType, identifier: &str) -> Option<Arc<dyn PluginFactory>> {
        self.factories.get(&(kind, identifier.to_string())).cloned()
    }

    /// Create the instance described by a `load` payload
    pub fn create(&self, payload: &LoadPayload) -> Result<Box<dyn BridgePlugin>, WorkerError> {
        let factory = self
            .get(payload.kind, &payload.identifier)
            .ok_or_else(|| WorkerError::UnknownPlugin {
                kind: payload.kind,
                identifier: payload.identifier.clone(),
            })?;
        factory.create(payload)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
