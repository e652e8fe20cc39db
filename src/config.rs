use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::{backend::BackendKind, models::Parameters};

pub const DEFAULT_CONFIG_DIR: &str = "configs";
pub const DEFAULT_BACKEND: &str = "ollama";
pub const DEFAULT_MODEL_ID: &str = "qwen2.5:3b";
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration in {}: {message}", path.display())]
    Invalid { path: PathBuf, message: String },
}

/// A backend the registry knows how to construct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    pub name: String,
    pub kind: BackendKind,
}

impl BackendSpec {
    pub fn new(name: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

pub fn known_backends() -> Vec<BackendSpec> {
    vec![
        BackendSpec::new("ollama", BackendKind::Ollama),
        BackendSpec::new("vllm", BackendKind::OpenAiCompatible),
    ]
}

/// Where configuration lives and which backends to look for.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config_dir: PathBuf,
    pub backends: Vec<BackendSpec>,
}

impl Settings {
    pub fn from_env() -> Self {
        let config_dir = env::var("AGENT_CONFIG_DIR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONFIG_DIR.to_owned());
        Self::with_config_dir(config_dir)
    }

    pub fn with_config_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            backends: known_backends(),
        }
    }

    pub fn models_path(&self) -> PathBuf {
        self.config_dir.join("models.yaml")
    }

    pub fn backend_path(&self, name: &str) -> PathBuf {
        self.config_dir.join("backends").join(format!("{name}.yaml"))
    }

    pub fn catalog(&self) -> ModelCatalog {
        ModelCatalog::new(self.models_path())
    }
}

/// Contents of `backends/<name>.yaml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BackendSettings {
    #[serde(default)]
    pub connection: ConnectionSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionSettings {
    #[serde(default)]
    pub host: Option<String>,
    /// Bounds generation requests. Absent means no client-side limit.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_probe_timeout_secs() -> u64 {
    DEFAULT_PROBE_TIMEOUT_SECS
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: None,
            timeout_secs: None,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
        }
    }
}

impl BackendSettings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let settings: Self = read_yaml(path)?;
        if let Some(host) = &settings.connection.host {
            if !(host.starts_with("http://") || host.starts_with("https://")) {
                return Err(ConfigError::Invalid {
                    path: path.to_path_buf(),
                    message: format!("connection.host must be an http(s) URL, got '{host}'"),
                });
            }
        }
        Ok(settings)
    }

    pub fn host_or(&self, fallback: &str) -> String {
        self.connection
            .host
            .as_deref()
            .unwrap_or(fallback)
            .trim_end_matches('/')
            .to_owned()
    }
}

/// Handle on `models.yaml`. Every `load` goes back to disk.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    path: PathBuf,
}

impl ModelCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<CatalogFile, ConfigError> {
        read_yaml(&self.path)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub active_model: Option<String>,
    #[serde(default)]
    pub active_backend: Option<String>,
    #[serde(default)]
    pub models: BTreeMap<String, ModelEntry>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ModelEntry {
    #[serde(default)]
    pub supported_backends: Vec<String>,
    #[serde(default)]
    pub backend_repos: BTreeMap<String, String>,
    #[serde(default)]
    pub parameters: Parameters,
}

impl ModelEntry {
    pub fn supports(&self, backend: &str) -> bool {
        self.supported_backends.iter().any(|name| name == backend)
    }

    pub fn repo_for(&self, backend: &str) -> Option<&str> {
        self.backend_repos.get(backend).map(String::as_str)
    }
}

fn read_yaml<T>(path: &Path) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default,
{
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
