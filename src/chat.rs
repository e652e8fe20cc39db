use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;

use crate::{
    backend::{build_client, ollama, openai, BackendError, BackendKind, ResponseStream},
    metrics::{BackendMetrics, GenerationMode},
    models::{ChatMessage, ModelResponse, Parameters},
};

/// A client bound to one backend endpoint, one repository and one set of
/// generation parameters. Generation does not go back through the loader
/// or the registry.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn family(&self) -> BackendKind;

    /// Repository identifier sent to the backend.
    fn model(&self) -> &str;

    fn base_url(&self) -> &str;

    fn parameters(&self) -> &Parameters;

    fn request_timeout(&self) -> Option<Duration>;

    async fn invoke(&self, messages: &[ChatMessage]) -> Result<ModelResponse, BackendError>;

    async fn stream(&self, messages: &[ChatMessage]) -> Result<ResponseStream, BackendError>;

    async fn ask(&self, prompt: &str) -> Result<ModelResponse, BackendError> {
        self.invoke(&[ChatMessage::user(prompt)]).await
    }
}

#[derive(Clone, Default)]
struct Telemetry {
    backend: String,
    metrics: Option<Arc<BackendMetrics>>,
}

impl Telemetry {
    fn record(
        &self,
        result: Result<ModelResponse, BackendError>,
    ) -> Result<ModelResponse, BackendError> {
        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(response) => {
                    metrics.observe_generation(&self.backend, GenerationMode::Sync, true, response.latency);
                    metrics.observe_usage(&self.backend, &response.usage);
                }
                Err(_) => metrics.observe_generation(
                    &self.backend,
                    GenerationMode::Sync,
                    false,
                    Default::default(),
                ),
            }
        }
        result
    }

    fn record_stream(
        &self,
        started: Instant,
        result: Result<ResponseStream, BackendError>,
    ) -> Result<ResponseStream, BackendError> {
        let Some(metrics) = &self.metrics else {
            return result;
        };
        metrics.observe_generation(
            &self.backend,
            GenerationMode::Stream,
            result.is_ok(),
            started.elapsed(),
        );

        let upstream = result?;
        let guard = metrics.open_stream_guard();
        let stream = async_stream::stream! {
            let _guard = guard;
            let mut upstream = upstream;
            while let Some(item) = upstream.next().await {
                yield item;
            }
        };
        Ok(stream.boxed())
    }
}

/// Client for the daemon's native `/api/chat`.
#[derive(Clone)]
pub struct ChatOllama {
    client: Client,
    base_url: String,
    model: String,
    parameters: Parameters,
    request_timeout: Option<Duration>,
    telemetry: Telemetry,
}

impl ChatOllama {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        parameters: Parameters,
        request_timeout: Option<Duration>,
    ) -> Result<Self, BackendError> {
        Ok(Self {
            client: build_client(request_timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            model: model.into(),
            parameters,
            request_timeout,
            telemetry: Telemetry::default(),
        })
    }

    pub fn with_metrics(mut self, backend: impl Into<String>, metrics: Arc<BackendMetrics>) -> Self {
        self.telemetry = Telemetry {
            backend: backend.into(),
            metrics: Some(metrics),
        };
        self
    }
}

#[async_trait]
impl ChatModel for ChatOllama {
    fn family(&self) -> BackendKind {
        BackendKind::Ollama
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    async fn invoke(&self, messages: &[ChatMessage]) -> Result<ModelResponse, BackendError> {
        let result =
            ollama::chat(&self.client, &self.base_url, &self.model, messages, &self.parameters).await;
        self.telemetry.record(result)
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<ResponseStream, BackendError> {
        let started = Instant::now();
        let result =
            ollama::chat_stream(&self.client, &self.base_url, &self.model, messages, &self.parameters)
                .await;
        self.telemetry.record_stream(started, result)
    }
}

/// Client for an OpenAI-style API. `base_url` is the API root including the
/// `/v1` segment. No API key is sent.
#[derive(Clone)]
pub struct ChatOpenAi {
    client: Client,
    base_url: String,
    model: String,
    parameters: Parameters,
    request_timeout: Option<Duration>,
    telemetry: Telemetry,
}

impl ChatOpenAi {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        parameters: Parameters,
        request_timeout: Option<Duration>,
    ) -> Result<Self, BackendError> {
        Ok(Self {
            client: build_client(request_timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            model: model.into(),
            parameters,
            request_timeout,
            telemetry: Telemetry::default(),
        })
    }

    pub fn with_metrics(mut self, backend: impl Into<String>, metrics: Arc<BackendMetrics>) -> Self {
        self.telemetry = Telemetry {
            backend: backend.into(),
            metrics: Some(metrics),
        };
        self
    }
}

#[async_trait]
impl ChatModel for ChatOpenAi {
    fn family(&self) -> BackendKind {
        BackendKind::OpenAiCompatible
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    async fn invoke(&self, messages: &[ChatMessage]) -> Result<ModelResponse, BackendError> {
        let result = openai::chat_completion(
            &self.client,
            &self.base_url,
            &self.model,
            messages,
            &self.parameters,
        )
        .await;
        self.telemetry.record(result)
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<ResponseStream, BackendError> {
        let started = Instant::now();
        let result = openai::chat_completion_stream(
            &self.client,
            &self.base_url,
            &self.model,
            messages,
            &self.parameters,
        )
        .await;
        self.telemetry.record_stream(started, result)
    }
}
