pub mod backend;
pub mod chat;
pub mod config;
pub mod errors;
pub mod loader;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod state;

use tracing::info;

pub use backend::{BackendError, BackendKind, ModelBackend, ResponseStream};
pub use chat::ChatModel;
pub use errors::AppError;
pub use loader::ModelLoader;
pub use models::{ChatMessage, GenerateOptions, ModelResponse};
pub use registry::BackendRegistry;

/// Builds the backend state from `AGENT_CONFIG_DIR` (default `configs`).
pub fn build_state() -> state::AppState {
    let settings = config::Settings::from_env();
    info!(config_dir = %settings.config_dir.display(), "loading backend configuration");
    let state = state::AppState::new(settings);
    info!(
        backends = %state.registry.names().join(","),
        active = %state.registry.active_backend_name().unwrap_or_default(),
        "backend registry configured"
    );
    state
}
