use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::{
    backend::{
        build_client, ensure_success, split_lines, transport_error, BackendError, BackendKind,
        ModelBackend, ResponseStream,
    },
    config::BackendSettings,
    models::{
        usage_from_json, ChatMessage, GenerateOptions, ModelInfo, ModelResponse, Parameters,
        ToolCall,
    },
};

pub const DEFAULT_HOST: &str = "http://localhost:8000";
pub const DEFAULT_MODEL: &str = "default";

/// Adapter for a server exposing OpenAI-style `/v1/chat/completions`
/// (vLLM and friends).
#[derive(Clone)]
pub struct OpenAiCompatibleBackend {
    client: Client,
    base_url: String,
    request_timeout: Option<Duration>,
    probe_timeout: Duration,
}

impl OpenAiCompatibleBackend {
    pub fn new(settings: &BackendSettings) -> Result<Self, BackendError> {
        let base_url = settings.host_or(DEFAULT_HOST);
        let request_timeout = settings.connection.timeout_secs.map(Duration::from_secs);
        let client = build_client(request_timeout)?;
        info!(backend = "openai_compatible", base_url = %base_url, "openai-compatible backend initialized");

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

    fn api_base(&self) -> String {
        self.url("/v1")
    }

    async fn models(&self) -> Result<ModelsResponse, BackendError> {
        let response = self
            .client
            .get(self.url("/v1/models"))
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
impl ModelBackend for OpenAiCompatibleBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenAiCompatible
    }

    fn variant(&self) -> &'static str {
        "OpenAiCompatibleBackend"
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    async fn load_model(&self, repo: &str, _parameters: &Parameters) -> bool {
        warn!(
            backend = "openai_compatible",
            repo,
            "models are provisioned on the server side; start it manually with `vllm serve {repo}`"
        );
        true
    }

    async fn generate(
        &self,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<ModelResponse, BackendError> {
        let model = options.model_or(DEFAULT_MODEL);
        let messages = [ChatMessage::user(prompt)];
        chat_completion(&self.client, &self.api_base(), model, &messages, &options.parameters)
            .await
            .inspect_err(|error| {
                error!(backend = "openai_compatible", model, error = %error, "generation failed")
            })
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<ResponseStream, BackendError> {
        let model = options.model_or(DEFAULT_MODEL);
        let messages = [ChatMessage::user(prompt)];
        chat_completion_stream(&self.client, &self.api_base(), model, &messages, &options.parameters)
            .await
            .inspect_err(|error| {
                error!(backend = "openai_compatible", model, error = %error, "streaming failed")
            })
    }

    async fn is_available(&self) -> bool {
        let result = self
            .client
            .get(self.url("/health"))
            .timeout(self.probe_timeout)
            .send()
            .await;

        match result {
            Ok(_) => true,
            Err(error) => {
                debug!(backend = "openai_compatible", error = %error, "liveness probe failed");
                false
            }
        }
    }

    async fn get_model_info(&self, model: &str) -> ModelInfo {
        let mut info = ModelInfo::basic("openai_compatible", model);
        match self.models().await {
            Ok(models) => {
                info.details = models
                    .data
                    .into_iter()
                    .find(|entry| entry.get("id").and_then(Value::as_str) == Some(model));
            }
            Err(error) => {
                debug!(backend = "openai_compatible", model, error = %error, "model info unavailable");
            }
        }
        info
    }

    async fn list_loaded_models(&self) -> Vec<String> {
        match self.models().await {
            Ok(models) => models
                .data
                .iter()
                .filter_map(|entry| entry.get("id").and_then(Value::as_str))
                .map(ToOwned::to_owned)
                .collect(),
            Err(error) => {
                warn!(backend = "openai_compatible", error = %error, "failed to list models");
                Vec::new()
            }
        }
    }
}

/// Generation parameters are flattened into the body; `model`,
/// `messages` and `stream` always win over a parameter of the same name.
fn request_body(model: &str, messages: &[ChatMessage], parameters: &Parameters, stream: bool) -> Value {
    let mut body: Map<String, Value> = parameters.clone();
    body.insert("model".to_owned(), Value::String(model.to_owned()));
    body.insert(
        "messages".to_owned(),
        serde_json::to_value(messages).unwrap_or(Value::Array(Vec::new())),
    );
    body.insert("stream".to_owned(), Value::Bool(stream));
    Value::Object(body)
}

pub(crate) async fn chat_completion(
    client: &Client,
    api_base: &str,
    model: &str,
    messages: &[ChatMessage],
    parameters: &Parameters,
) -> Result<ModelResponse, BackendError> {
    let started = Instant::now();
    let response = client
        .post(format!("{api_base}/chat/completions"))
        .json(&request_body(model, messages, parameters, false))
        .send()
        .await
        .map_err(transport_error)?;
    let parsed: ChatResponse = ensure_success(response)
        .await?
        .json()
        .await
        .map_err(|error| BackendError::InvalidResponse(error.to_string()))?;

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::InvalidResponse("missing choices in response".to_owned()))?;
    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|call| ToolCall {
            id: call.id,
            name: call.function.name,
            arguments: parse_arguments(call.function.arguments),
        })
        .collect();

    Ok(ModelResponse::new(choice.message.content.unwrap_or_default())
        .with_tool_calls(tool_calls)
        .with_usage(parsed.usage.as_ref().map(usage_from_json).unwrap_or_default())
        .with_latency(started.elapsed()))
}

pub(crate) async fn chat_completion_stream(
    client: &Client,
    api_base: &str,
    model: &str,
    messages: &[ChatMessage],
    parameters: &Parameters,
) -> Result<ResponseStream, BackendError> {
    let response = client
        .post(format!("{api_base}/chat/completions"))
        .json(&request_body(model, messages, parameters, true))
        .send()
        .await
        .map_err(transport_error)?;
    let response = ensure_success(response).await?;

    debug!(backend = "openai_compatible", model, "stream prepared");
    Ok(decode_sse_stream(response.bytes_stream()))
}

/// Decodes a server-sent-events completion body. Every `data:` line except
/// `[DONE]` is a JSON chunk; its non-empty `choices[0].delta.content` is
/// yielded. Lines that are not valid JSON are skipped.
pub(crate) fn decode_sse_stream<S, B, E>(upstream: S) -> ResponseStream
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

            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if payload == "[DONE]" {
                break;
            }

            let parsed: StreamChunk = match serde_json::from_str(payload) {
                Ok(parsed) => parsed,
                Err(error) => {
                    debug!(error = %error, "skipping malformed stream line");
                    continue;
                }
            };

            if let Some(content) = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta.content)
                .filter(|content| !content.is_empty())
            {
                yield Ok(ModelResponse::new(content));
            }
        }
    };

    stream.boxed()
}

/// Tool arguments arrive as a JSON-encoded string; keep the raw string when
/// it does not parse.
fn parse_arguments(raw: Value) -> Value {
    match raw {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChatToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChatToolCall {
    #[serde(default)]
    id: Option<String>,
    function: ChatFunction,
}

#[derive(Debug, Deserialize)]
struct ChatFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<Value>,
}
