use std::sync::Arc;

use crate::{
    config::Settings, loader::ModelLoader, metrics::BackendMetrics, registry::BackendRegistry,
};

/// Process-wide backend state, built once at startup and handed to
/// whatever consumes chat models.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<BackendRegistry>,
    pub loader: ModelLoader,
    pub metrics: Arc<BackendMetrics>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let registry = BackendRegistry::from_settings(&settings);
        Self::with_registry(settings, registry)
    }

    /// Wraps an existing registry, e.g. one built from mock backends.
    pub fn with_registry(settings: Settings, registry: BackendRegistry) -> Self {
        let metrics = registry.metrics();
        let registry = Arc::new(registry);
        let loader = ModelLoader::new(registry.clone(), settings.catalog());
        Self {
            settings: Arc::new(settings),
            registry,
            loader,
            metrics,
        }
    }
}
