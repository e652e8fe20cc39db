use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Generation parameters passed through to a backend verbatim.
pub type Parameters = Map<String, Value>;

/// Token accounting keyed by metric name (`prompt_tokens`, `completion_tokens`, ...).
pub type Usage = BTreeMap<String, u64>;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }
}

/// A structured call descriptor reported by the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub arguments: Value,
}

/// Normalized generation result shared by every backend.
///
/// One value is produced per `generate` call, or one per chunk when
/// streaming. Streamed chunks carry an incremental fragment in `content`
/// and leave `usage` empty and `latency` at zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub latency: Duration,
}

impl ModelResponse {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn latency_secs(&self) -> f64 {
        self.latency.as_secs_f64()
    }

    /// Total tokens as reported, or prompt plus completion when the backend
    /// does not report a total.
    pub fn total_tokens(&self) -> u64 {
        if let Some(total) = self.usage.get("total_tokens") {
            return *total;
        }
        let prompt = self.usage.get("prompt_tokens").copied().unwrap_or(0);
        let completion = self.usage.get("completion_tokens").copied().unwrap_or(0);
        prompt.saturating_add(completion)
    }
}

pub fn usage_from_counts(prompt_tokens: u64, completion_tokens: u64) -> Usage {
    let mut usage = Usage::new();
    usage.insert("prompt_tokens".to_owned(), prompt_tokens);
    usage.insert("completion_tokens".to_owned(), completion_tokens);
    usage
}

/// Keeps the non-negative integer members of a JSON usage object.
pub fn usage_from_json(value: &Value) -> Usage {
    value
        .as_object()
        .map(|object| {
            object
                .iter()
                .filter_map(|(key, value)| value.as_u64().map(|count| (key.clone(), count)))
                .collect()
        })
        .unwrap_or_default()
}

/// Options accepted by `generate` and `generate_stream`.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub model: Option<String>,
    pub parameters: Parameters,
}

impl GenerateOptions {
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            parameters: Parameters::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn model_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.model.as_deref().unwrap_or(fallback)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub backend: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ModelInfo {
    pub fn basic(backend: &str, model: &str) -> Self {
        Self {
            backend: backend.to_owned(),
            model: model.to_owned(),
            details: None,
        }
    }
}
