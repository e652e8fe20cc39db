use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::debug;

use crate::{
    backend::{BackendError, BackendKind, ModelBackend, ResponseStream},
    models::{usage_from_counts, GenerateOptions, ModelInfo, ModelResponse, Parameters},
};

/// In-process backend with scripted behaviour. It never touches the network,
/// which makes it the building block for registry and loader tests.
#[derive(Debug, Clone)]
pub struct MockBackend {
    name: String,
    kind: BackendKind,
    base_url: String,
    request_timeout: Option<Duration>,
    token_delay: Duration,
    available: Arc<AtomicBool>,
    load_succeeds: Arc<AtomicBool>,
    probes: Arc<AtomicUsize>,
    loaded: Arc<Mutex<Vec<String>>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            name: "mock-backend".to_owned(),
            kind: BackendKind::Ollama,
            base_url: "http://mock.invalid".to_owned(),
            request_timeout: None,
            token_delay: Duration::ZERO,
            available: Arc::new(AtomicBool::new(true)),
            load_succeeds: Arc::new(AtomicBool::new(true)),
            probes: Arc::new(AtomicUsize::new(0)),
            loaded: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl MockBackend {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Wire family the mock impersonates when the loader builds a chat client.
    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_load_succeeds(&self, succeeds: bool) {
        self.load_succeeds.store(succeeds, Ordering::SeqCst);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of liveness probes served so far.
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Repositories successfully loaded, in call order.
    pub fn loaded_models(&self) -> Vec<String> {
        self.loaded.lock().clone()
    }

    fn render_response(&self, prompt: &str, options: &GenerateOptions) -> String {
        let model = options.model_or("mock-model");
        format!("Mock response from {} for model {model}: {prompt}", self.name)
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn variant(&self) -> &'static str {
        "MockBackend"
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    async fn load_model(&self, repo: &str, _parameters: &Parameters) -> bool {
        let succeeds = self.load_succeeds.load(Ordering::SeqCst);
        if succeeds {
            self.loaded.lock().push(repo.to_owned());
        }
        debug!(backend = %self.name, repo, succeeds, "mock load_model");
        succeeds
    }

    async fn generate(
        &self,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<ModelResponse, BackendError> {
        let started = Instant::now();
        if !self.available.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(format!("{} is offline", self.name)));
        }

        let content = self.render_response(prompt, &options);
        let usage = usage_from_counts(rough_token_estimate(prompt), rough_token_estimate(&content));
        Ok(ModelResponse::new(content)
            .with_usage(usage)
            .with_latency(started.elapsed()))
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<ResponseStream, BackendError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(format!("{} is offline", self.name)));
        }

        let tokens = split_for_stream(&self.render_response(prompt, &options));
        let delay = self.token_delay;
        let stream = async_stream::stream! {
            for token in tokens {
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                yield Ok(ModelResponse::new(token));
            }
        };

        debug!(backend = %self.name, "stream prepared");
        Ok(stream.boxed())
    }

    async fn is_available(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.available.load(Ordering::SeqCst)
    }

    async fn get_model_info(&self, model: &str) -> ModelInfo {
        ModelInfo::basic(&self.name, model)
    }

    async fn list_loaded_models(&self) -> Vec<String> {
        self.loaded_models()
    }
}

fn rough_token_estimate(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

fn split_for_stream(text: &str) -> Vec<String> {
    let tokens: Vec<String> = text.split_whitespace().map(ToString::to_string).collect();
    let len = tokens.len();

    tokens
        .into_iter()
        .enumerate()
        .map(|(index, token)| {
            if index + 1 == len {
                token
            } else {
                format!("{token} ")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_reassembles_to_the_full_reply() {
        let backend = MockBackend::named("mock-a");
        let full = backend
            .generate("hello there", GenerateOptions::default())
            .await
            .expect("generate should succeed");

        let streamed = backend
            .generate_stream("hello there", GenerateOptions::default())
            .await
            .expect("stream should start")
            .map(|chunk| chunk.expect("chunk").content)
            .collect::<String>()
            .await;

        assert_eq!(streamed, full.content);
        assert_eq!(full.usage["prompt_tokens"], 2);
    }

    #[tokio::test]
    async fn offline_mock_fails_generation_but_not_probes() {
        let backend = MockBackend::named("mock-b");
        backend.set_available(false);

        assert!(!backend.is_available().await);
        assert_eq!(backend.probe_count(), 1);
        assert!(matches!(
            backend.generate("hi", GenerateOptions::default()).await,
            Err(BackendError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn load_model_records_successful_loads() {
        let backend = MockBackend::default();
        assert!(backend.load_model("repo-a", &Parameters::new()).await);
        backend.set_load_succeeds(false);
        assert!(!backend.load_model("repo-b", &Parameters::new()).await);

        assert_eq!(backend.list_loaded_models().await, vec!["repo-a".to_owned()]);
    }
}
