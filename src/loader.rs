use std::sync::Arc;

use tracing::{error, info};

use crate::{
    backend::BackendKind,
    chat::{ChatModel, ChatOllama, ChatOpenAi},
    config::{ModelCatalog, ModelEntry, DEFAULT_MODEL_ID},
    errors::AppError,
    registry::BackendRegistry,
};

/// Turns a logical model id into a chat client bound to the active backend.
///
/// The catalog is re-read on every call and no client is cached, so catalog
/// edits and backend switches show up on the next `load_llm`.
#[derive(Clone)]
pub struct ModelLoader {
    registry: Arc<BackendRegistry>,
    catalog: ModelCatalog,
}

impl ModelLoader {
    pub fn new(registry: Arc<BackendRegistry>, catalog: ModelCatalog) -> Self {
        Self { registry, catalog }
    }

    pub fn active_model_id(&self) -> Result<String, AppError> {
        let catalog = self.catalog.load()?;
        Ok(catalog
            .active_model
            .unwrap_or_else(|| DEFAULT_MODEL_ID.to_owned()))
    }

    pub fn get_model_config(&self, model_id: &str) -> Result<ModelEntry, AppError> {
        let mut catalog = self.catalog.load()?;
        catalog
            .models
            .remove(model_id)
            .ok_or_else(|| AppError::ModelNotFound(model_id.to_owned()))
    }

    pub async fn load_llm(&self, model_id: Option<&str>) -> Result<Box<dyn ChatModel>, AppError> {
        let model_id = match model_id {
            Some(model_id) => model_id.to_owned(),
            None => self.active_model_id()?,
        };

        let (backend_name, backend) = self.registry.active()?;

        let entry = self.get_model_config(&model_id)?;
        if !entry.supports(&backend_name) {
            return Err(AppError::UnsupportedBackend {
                model: model_id,
                backend: backend_name,
            });
        }

        let repo = entry
            .repo_for(&backend_name)
            .ok_or_else(|| AppError::MissingRepository {
                model: model_id.clone(),
                backend: backend_name.clone(),
            })?
            .to_owned();
        let parameters = entry.parameters;

        let metrics = self.registry.metrics();
        let loaded = backend.load_model(&repo, &parameters).await;
        metrics.observe_model_load(&backend_name, loaded);
        if !loaded {
            error!(model = %model_id, backend = %backend_name, repo = %repo, "model provisioning failed");
            return Err(AppError::Provisioning {
                model: model_id,
                backend: backend_name,
                repo,
            });
        }

        let client: Box<dyn ChatModel> = match backend.kind() {
            BackendKind::Ollama => Box::new(
                ChatOllama::new(backend.base_url(), &repo, parameters, backend.request_timeout())?
                    .with_metrics(&backend_name, metrics),
            ),
            BackendKind::OpenAiCompatible => Box::new(
                ChatOpenAi::new(
                    format!("{}/v1", backend.base_url()),
                    &repo,
                    parameters,
                    backend.request_timeout(),
                )?
                .with_metrics(&backend_name, metrics),
            ),
        };

        info!(model = %model_id, backend = %backend_name, repo = %repo, "chat model ready");
        Ok(client)
    }
}
