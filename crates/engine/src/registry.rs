//! Ordered plugin chain.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use metrics::histogram;
use tenant_core::{Event, EventKind, Plugin, PluginData};
use tracing::{debug, info};

/// Plugins in registration order; that order is the fan-out order of every event.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self { Self::default() }

    /// Append a plugin. Registering the same plugin twice runs it twice.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        debug!(plugin = %plugin.name(), position = self.plugins.len(), "plugin registered");
        self.plugins.push(plugin);
    }

    pub fn names(&self) -> Vec<String> { self.plugins.iter().map(|p| p.name().to_string()).collect() }
    pub fn len(&self) -> usize { self.plugins.len() }
    pub fn is_empty(&self) -> bool { self.plugins.is_empty() }

    /// Initialize every plugin in order; the first failure aborts.
    pub async fn initialize(&self) -> Result<()> {
        for p in &self.plugins {
            let t0 = Instant::now();
            p.initialize().await.with_context(|| format!("initializing plugin {}", p.name()))?;
            info!(plugin = %p.name(), took_ms = %t0.elapsed().as_millis(), "plugin initialized");
        }
        Ok(())
    }

    /// Run the event through every plugin with one fresh [`PluginData`].
    /// Stops at the first failing plugin and returns its error unchanged;
    /// earlier plugins' effects stay in place.
    pub async fn dispatch(&self, event: &Event) -> Result<()> {
        let mut data = PluginData::new();
        for p in &self.plugins {
            let t0 = Instant::now();
            let res = match event.kind {
                EventKind::Create => p.create_event(event, &mut data).await,
                EventKind::Delete => p.delete_event(event, &mut data).await,
            };
            histogram!("plugin_dispatch_ms", t0.elapsed().as_secs_f64() * 1000.0, "plugin" => p.name().to_string());
            res?;
            debug!(plugin = %p.name(), kind = %event.kind, project = %event.project_uuid, "plugin done");
        }
        Ok(())
    }
}
