use thiserror::Error;

use crate::{backend::BackendError, config::ConfigError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("no active backend: none of the configured backends could be registered")]
    NoActiveBackend,
    #[error("model '{0}' not found in configuration")]
    ModelNotFound(String),
    #[error("model '{model}' does not support backend '{backend}'")]
    UnsupportedBackend { model: String, backend: String },
    #[error("model '{model}' declares backend '{backend}' but has no repository for it")]
    MissingRepository { model: String, backend: String },
    #[error("failed to load model '{model}' (repository '{repo}') on backend '{backend}'")]
    Provisioning {
        model: String,
        backend: String,
        repo: String,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Coarse failure classes; none of them is retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Misconfiguration: fix the files, then call again.
    Configuration,
    /// The backend could not make the model ready.
    Provisioning,
    /// Transport or decoding failure during generation.
    Generation,
}

impl AppError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AppError::NoActiveBackend
            | AppError::ModelNotFound(_)
            | AppError::UnsupportedBackend { .. }
            | AppError::MissingRepository { .. }
            | AppError::Config(_) => ErrorCategory::Configuration,
            AppError::Provisioning { .. } => ErrorCategory::Provisioning,
            AppError::Backend(_) => ErrorCategory::Generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_backend_names_model_and_backend() {
        let error = AppError::UnsupportedBackend {
            model: "modelA".to_owned(),
            backend: "http".to_owned(),
        };

        let message = error.to_string();
        assert!(message.contains("modelA"));
        assert!(message.contains("http"));
        assert_eq!(error.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn backend_failures_are_generation_errors() {
        let error = AppError::from(BackendError::Timeout("slow".to_owned()));
        assert_eq!(error.category(), ErrorCategory::Generation);
    }
}
