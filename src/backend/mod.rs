pub mod mock;
pub mod ollama;
pub mod openai;

use std::{fmt, time::Duration};

use async_trait::async_trait;
use futures_util::{stream::BoxStream, Stream, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{GenerateOptions, ModelInfo, ModelResponse, Parameters};

pub use mock::MockBackend;
pub use ollama::OllamaBackend;
pub use openai::OpenAiCompatibleBackend;

/// Incremental chunks in the order the backend emitted them. Dropping the
/// stream drops the underlying HTTP response.
pub type ResponseStream = BoxStream<'static, Result<ModelResponse, BackendError>>;

/// Wire family of a backend; decides which chat client the loader builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Ollama,
    OpenAiCompatible,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Ollama => write!(f, "ollama"),
            BackendKind::OpenAiCompatible => write!(f, "openai_compatible"),
        }
    }
}

/// Capability set every inference backend provides.
///
/// `generate` and `generate_stream` propagate transport and decoding
/// failures. The liveness and metadata queries never fail: they degrade to
/// `false` or empty results.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Adapter type name, as reported by the registry listing.
    fn variant(&self) -> &'static str;

    fn base_url(&self) -> &str;

    /// Client-side bound on generation requests; `None` means unbounded.
    /// Chat clients built for this backend inherit it.
    fn request_timeout(&self) -> Option<Duration>;

    /// Makes `repo` ready on the backend. `false` means the model cannot be
    /// used; it is never an error.
    async fn load_model(&self, repo: &str, parameters: &Parameters) -> bool;

    async fn generate(
        &self,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<ModelResponse, BackendError>;

    async fn generate_stream(
        &self,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<ResponseStream, BackendError>;

    async fn is_available(&self) -> bool;

    async fn get_model_info(&self, model: &str) -> ModelInfo;

    async fn list_loaded_models(&self) -> Vec<String>;
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend timeout: {0}")]
    Timeout(String),
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("backend invalid response: {0}")]
    InvalidResponse(String),
    #[error("backend reported error: {0}")]
    Upstream(String),
}

pub(crate) fn build_client(timeout: Option<Duration>) -> Result<reqwest::Client, BackendError> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|error| BackendError::Unavailable(format!("failed to build HTTP client: {error}")))
}

pub(crate) fn transport_error(error: reqwest::Error) -> BackendError {
    if error.is_timeout() {
        BackendError::Timeout(error.to_string())
    } else {
        BackendError::Unavailable(error.to_string())
    }
}

/// Passes 2xx responses through and turns anything else into an error
/// carrying the (truncated) body.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown backend error".to_owned());
    Err(map_http_error(status, body))
}

fn map_http_error(status: StatusCode, body: String) -> BackendError {
    let trimmed = body.chars().take(400).collect::<String>();
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            BackendError::Timeout(format!("upstream timeout: {trimmed}"))
        }
        _ => BackendError::Status {
            status: status.as_u16(),
            body: trimmed,
        },
    }
}

/// Re-frames a chunked byte stream into trimmed, non-empty text lines.
/// Lines may span transport chunks.
pub(crate) fn split_lines<S, B, E>(upstream: S) -> BoxStream<'static, Result<String, BackendError>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut upstream = Box::pin(upstream);
        let mut buffer: Vec<u8> = Vec::new();
        let mut failed = false;

        'read: while let Some(next) = upstream.next().await {
            let bytes = match next {
                Ok(bytes) => bytes,
                Err(error) => {
                    yield Err(BackendError::Unavailable(error.to_string()));
                    failed = true;
                    break 'read;
                }
            };
            buffer.extend_from_slice(bytes.as_ref());

            while let Some(index) = buffer.iter().position(|byte| *byte == b'\n') {
                let raw = buffer.drain(..=index).collect::<Vec<u8>>();
                match String::from_utf8(raw) {
                    Ok(text) => {
                        let line = text.trim();
                        if !line.is_empty() {
                            yield Ok(line.to_owned());
                        }
                    }
                    Err(error) => {
                        yield Err(BackendError::InvalidResponse(error.to_string()));
                        failed = true;
                        break 'read;
                    }
                }
            }
        }

        if !failed && !buffer.is_empty() {
            match String::from_utf8(std::mem::take(&mut buffer)) {
                Ok(text) => {
                    let line = text.trim();
                    if !line.is_empty() {
                        yield Ok(line.to_owned());
                    }
                }
                Err(error) => yield Err(BackendError::InvalidResponse(error.to_string())),
            }
        }
    };

    stream.boxed()
}
