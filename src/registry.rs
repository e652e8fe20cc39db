use std::{collections::BTreeMap, path::Path, sync::Arc};

use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    backend::{BackendKind, ModelBackend, OllamaBackend, OpenAiCompatibleBackend},
    config::{BackendSettings, Settings, DEFAULT_BACKEND},
    errors::AppError,
    metrics::BackendMetrics,
};

/// Owns the constructed adapters and the single active selection.
///
/// Switching is not atomic with respect to the availability probe it runs;
/// callers that switch from several tasks must serialize those calls.
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn ModelBackend>>,
    active: RwLock<Option<String>>,
    metrics: Arc<BackendMetrics>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendStatus {
    pub available: bool,
    pub active: bool,
    #[serde(rename = "type")]
    pub variant: String,
}

impl BackendRegistry {
    /// Registers every known backend whose configuration file loads. A
    /// missing or broken file only skips that backend.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut backends: Vec<(String, Arc<dyn ModelBackend>)> = Vec::new();

        for spec in &settings.backends {
            let path = settings.backend_path(&spec.name);
            if !path.exists() {
                warn!(backend = %spec.name, path = %path.display(), "backend configuration not found");
                continue;
            }

            match create_backend(spec.kind, &path) {
                Ok(backend) => {
                    info!(backend = %spec.name, kind = %spec.kind, "backend registered");
                    backends.push((spec.name.clone(), backend));
                }
                Err(error) => {
                    error!(backend = %spec.name, error = %error, "failed to create backend");
                }
            }
        }

        let preferred = match settings.catalog().load() {
            Ok(catalog) => catalog.active_backend,
            Err(error) => {
                debug!(error = %error, "no preferred backend in model catalog");
                None
            }
        };

        Self::with_backends(backends, preferred.as_deref())
    }

    /// Builds a registry around already-constructed adapters. `preferred`
    /// becomes active when registered, otherwise the default backend name
    /// is tried, otherwise nothing is active.
    pub fn with_backends<I>(backends: I, preferred: Option<&str>) -> Self
    where
        I: IntoIterator<Item = (String, Arc<dyn ModelBackend>)>,
    {
        let backends = backends.into_iter().collect::<BTreeMap<_, _>>();
        let active = preferred
            .filter(|name| backends.contains_key(*name))
            .or_else(|| backends.contains_key(DEFAULT_BACKEND).then_some(DEFAULT_BACKEND))
            .map(ToOwned::to_owned);

        match &active {
            Some(name) => info!(backend = %name, "active backend selected"),
            None => warn!(registered = backends.len(), "no active backend"),
        }

        Self {
            backends,
            active: RwLock::new(active),
            metrics: Arc::new(BackendMetrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<BackendMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<BackendMetrics> {
        self.metrics.clone()
    }

    /// Name and adapter of the active backend, read under one guard so a
    /// concurrent switch cannot pair one backend's name with another's
    /// adapter.
    pub fn active(&self) -> Result<(String, Arc<dyn ModelBackend>), AppError> {
        let active = self.active.read();
        active
            .as_deref()
            .and_then(|name| {
                self.backends
                    .get(name)
                    .map(|backend| (name.to_owned(), backend.clone()))
            })
            .ok_or(AppError::NoActiveBackend)
    }

    pub fn active_backend(&self) -> Result<Arc<dyn ModelBackend>, AppError> {
        self.active().map(|(_, backend)| backend)
    }

    pub fn active_backend_name(&self) -> Option<String> {
        self.active.read().clone()
    }

    /// Makes `name` the active backend. Unknown names are refused; a known
    /// but unreachable backend is selected anyway after a warning.
    pub async fn switch_backend(&self, name: &str) -> bool {
        let Some(backend) = self.backends.get(name) else {
            error!(
                backend = name,
                available = ?self.names(),
                "cannot switch to unknown backend"
            );
            self.metrics.observe_switch(false);
            return false;
        };

        let available = backend.is_available().await;
        self.metrics.observe_probe(name, available);
        if !available {
            warn!(backend = name, "backend appears unavailable, switching anyway");
        }

        *self.active.write() = Some(name.to_owned());
        self.metrics.observe_switch(true);
        info!(backend = name, "switched active backend");
        true
    }

    /// Probes every backend now; nothing is cached.
    pub async fn list_backends(&self) -> BTreeMap<String, BackendStatus> {
        let active = self.active_backend_name();
        let probes = self.backends.iter().map(|(name, backend)| async move {
            let available = backend.is_available().await;
            (name, backend, available)
        });

        join_all(probes)
            .await
            .into_iter()
            .map(|(name, backend, available)| {
                self.metrics.observe_probe(name, available);
                let status = BackendStatus {
                    available,
                    active: active.as_deref() == Some(name.as_str()),
                    variant: backend.variant().to_owned(),
                };
                (name.clone(), status)
            })
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ModelBackend>> {
        self.backends.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

fn create_backend(kind: BackendKind, path: &Path) -> Result<Arc<dyn ModelBackend>, AppError> {
    let settings = BackendSettings::load(path)?;
    let backend: Arc<dyn ModelBackend> = match kind {
        BackendKind::Ollama => Arc::new(OllamaBackend::new(&settings)?),
        BackendKind::OpenAiCompatible => Arc::new(OpenAiCompatibleBackend::new(&settings)?),
    };
    Ok(backend)
}
