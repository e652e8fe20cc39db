use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::{
    backend::{
        build_client, ensure_success, split_lines, transport_error, BackendError, BackendKind,
        ModelBackend, ResponseStream,
    },
    config::BackendSettings,
    models::{
        usage_from_counts, ChatMessage, GenerateOptions, ModelInfo, ModelResponse, Parameters,
        ToolCall,
    },
};

pub const DEFAULT_HOST: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "qwen2.5:3b";

/// Adapter for a same-host Ollama daemon, speaking its native `/api` routes.
#[derive(Clone)]
pub struct OllamaBackend {
    client: Client,
    base_url: String,
    request_timeout: Option<Duration>,
    probe_timeout: Duration,
}

impl OllamaBackend {
    pub fn new(settings: &BackendSettings) -> Result<Self, BackendError> {
        let base_url = settings.host_or(DEFAULT_HOST);
        let request_timeout = settings.connection.timeout_secs.map(Duration::from_secs);
        let client = build_client(request_timeout)?;
        info!(backend = "ollama", base_url = %base_url, "ollama backend initialized");

        Ok(Self {
            client,
            base_url,
            request_timeout,
            probe_timeout: Duration::from_secs(settings.connection.probe_timeout_secs),
        })
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, BackendError> {
        let mut settings = BackendSettings::default();
        settings.connection.host = Some(base_url.into());
        Self::new(&settings)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn pull(&self, repo: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .post(self.url("/api/pull"))
            .json(&json!({"model": repo, "stream": false}))
            .send()
            .await
            .map_err(transport_error)?;
        let body: Value = ensure_success(response)
            .await?
            .json()
            .await
            .map_err(|error| BackendError::InvalidResponse(error.to_string()))?;
        match body.get("error").and_then(Value::as_str) {
            Some(message) => Err(BackendError::Upstream(message.to_owned())),
            None => Ok(()),
        }
    }

    async fn tags(&self) -> Result<TagsResponse, BackendError> {
        let response = self
            .client
            .get(self.url("/api/tags"))
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(transport_error)?;
        ensure_success(response)
            .await?
            .json()
            .await
            .map_err(|error| BackendError::InvalidResponse(error.to_string()))
    }
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ollama
    }

    fn variant(&self) -> &'static str {
        "OllamaBackend"
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    async fn load_model(&self, repo: &str, _parameters: &Parameters) -> bool {
        info!(backend = "ollama", repo, "pulling model");
        let result = self.pull(repo).await;

        match result {
            Ok(()) => {
                info!(backend = "ollama", repo, "model ready");
                true
            }
            Err(error) => {
                error!(backend = "ollama", repo, error = %error, "model pull failed");
                false
            }
        }
    }

    async fn generate(
        &self,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<ModelResponse, BackendError> {
        let model = options.model_or(DEFAULT_MODEL);
        let messages = [ChatMessage::user(prompt)];
        chat(&self.client, &self.base_url, model, &messages, &options.parameters)
            .await
            .inspect_err(|error| error!(backend = "ollama", model, error = %error, "generation failed"))
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<ResponseStream, BackendError> {
        let model = options.model_or(DEFAULT_MODEL);
        let messages = [ChatMessage::user(prompt)];
        chat_stream(&self.client, &self.base_url, model, &messages, &options.parameters)
            .await
            .inspect_err(|error| error!(backend = "ollama", model, error = %error, "streaming failed"))
    }

    async fn is_available(&self) -> bool {
        match self.tags().await {
            Ok(_) => true,
            Err(error) => {
                debug!(backend = "ollama", error = %error, "liveness probe failed");
                false
            }
        }
    }

    async fn get_model_info(&self, model: &str) -> ModelInfo {
        let mut info = ModelInfo::basic("ollama", model);
        let response = self
            .client
            .post(self.url("/api/show"))
            .timeout(self.probe_timeout)
            .json(&json!({"model": model}))
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                info.details = response.json::<Value>().await.ok();
            }
            Ok(response) => {
                debug!(backend = "ollama", model, status = %response.status(), "model info unavailable");
            }
            Err(error) => {
                debug!(backend = "ollama", model, error = %error, "model info unavailable");
            }
        }
        info
    }

    async fn list_loaded_models(&self) -> Vec<String> {
        match self.tags().await {
            Ok(tags) => tags.models.into_iter().map(|model| model.name).collect(),
            Err(error) => {
                warn!(backend = "ollama", error = %error, "failed to list models");
                Vec::new()
            }
        }
    }
}

/// Blocking-style chat call against `/api/chat`; latency covers the whole
/// round trip including body decoding.
pub(crate) async fn chat(
    client: &Client,
    base_url: &str,
    model: &str,
    messages: &[ChatMessage],
    parameters: &Parameters,
) -> Result<ModelResponse, BackendError> {
    let started = Instant::now();
    let response = client
        .post(format!("{base_url}/api/chat"))
        .json(&ChatRequest {
            model,
            messages,
            stream: false,
            options: parameters,
        })
        .send()
        .await
        .map_err(transport_error)?;
    let parsed: ChatResponse = ensure_success(response)
        .await?
        .json()
        .await
        .map_err(|error| BackendError::InvalidResponse(error.to_string()))?;

    if let Some(message) = parsed.error {
        return Err(BackendError::Upstream(message));
    }

    let message = parsed.message.unwrap_or_default();
    let tool_calls = message
        .tool_calls
        .into_iter()
        .map(|call| ToolCall {
            id: None,
            name: call.function.name,
            arguments: call.function.arguments,
        })
        .collect();

    Ok(ModelResponse::new(message.content)
        .with_tool_calls(tool_calls)
        .with_usage(usage_from_counts(
            parsed.prompt_eval_count.unwrap_or(0),
            parsed.eval_count.unwrap_or(0),
        ))
        .with_latency(started.elapsed()))
}

pub(crate) async fn chat_stream(
    client: &Client,
    base_url: &str,
    model: &str,
    messages: &[ChatMessage],
    parameters: &Parameters,
) -> Result<ResponseStream, BackendError> {
    let response = client
        .post(format!("{base_url}/api/chat"))
        .json(&ChatRequest {
            model,
            messages,
            stream: true,
            options: parameters,
        })
        .send()
        .await
        .map_err(transport_error)?;
    let response = ensure_success(response).await?;

    debug!(backend = "ollama", model, "stream prepared");
    Ok(decode_chat_stream(response.bytes_stream()))
}

/// Decodes the daemon's newline-delimited JSON stream. Each non-empty
/// `message.content` becomes one chunk; `done: true` ends the stream.
pub(crate) fn decode_chat_stream<S, B, E>(upstream: S) -> ResponseStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let mut lines = split_lines(upstream);

    let stream = async_stream::stream! {
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(error) => {
                    yield Err(error);
                    break;
                }
            };

            let chunk: ChatResponse = match serde_json::from_str(&line) {
                Ok(chunk) => chunk,
                Err(error) => {
                    yield Err(BackendError::InvalidResponse(error.to_string()));
                    break;
                }
            };

            if let Some(message) = chunk.error {
                yield Err(BackendError::Upstream(message));
                break;
            }

            if let Some(message) = chunk.message {
                if !message.content.is_empty() {
                    yield Ok(ModelResponse::new(message.content));
                }
            }

            if chunk.done {
                break;
            }
        }
    };

    stream.boxed()
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    options: &'a Parameters,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}
