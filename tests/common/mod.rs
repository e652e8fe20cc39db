#![allow(dead_code)]

use std::{convert::Infallible, fs, path::Path, sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;

/// Deltas the fake OpenAI server streams, in order.
pub const SSE_DELTAS: [&str; 3] = ["Hello", ", ", "world"];

/// Deltas the fake daemon streams, in order.
pub const NDJSON_DELTAS: [&str; 2] = ["Hel", "lo"];

#[derive(Clone, Default)]
pub struct Recorder {
    requests: Arc<Mutex<Vec<(String, Value)>>>,
}

impl Recorder {
    fn push(&self, path: &str, body: Value) {
        self.requests.lock().push((path.to_owned(), body));
    }

    pub fn bodies(&self, path: &str) -> Vec<Value> {
        self.requests
            .lock()
            .iter()
            .filter(|(seen, _)| seen == path)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake server");
    let addr = listener.local_addr().expect("fake server address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("fake server");
    });
    format!("http://{addr}")
}

/// A URL nothing listens on.
pub async fn closed_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind probe port");
    let addr = listener.local_addr().expect("probe address");
    drop(listener);
    format!("http://{addr}")
}

pub async fn spawn_openai_server() -> (String, Recorder) {
    let recorder = Recorder::default();
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/v1/models", get(openai_models))
        .route("/v1/chat/completions", post(openai_chat))
        .with_state(recorder.clone());
    (serve(app).await, recorder)
}

async fn openai_models() -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": [
            {"id": "Qwen/Qwen2.5-3B-Instruct", "object": "model", "max_model_len": 32768},
            {"id": "meta-llama/Llama-3.2-3B-Instruct", "object": "model"}
        ]
    }))
}

async fn openai_chat(State(recorder): State<Recorder>, Json(body): Json<Value>) -> Response {
    recorder.push("/v1/chat/completions", body.clone());

    if body["model"] == json!("broken") {
        return (StatusCode::INTERNAL_SERVER_ERROR, "engine crashed").into_response();
    }

    if body["stream"] == json!(true) {
        let delta = |content: &str| {
            format!(
                "data: {}\n\n",
                json!({"object": "chat.completion.chunk", "choices": [{"index": 0, "delta": {"content": content}}]})
            )
        };
        let mut sse = String::from(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        );
        sse.push_str(&delta(SSE_DELTAS[0]));
        sse.push_str("data: {\"choices\": [{\"delta\": \n\n");
        sse.push_str(&delta(SSE_DELTAS[1]));
        sse.push_str(&delta(SSE_DELTAS[2]));
        sse.push_str("data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":3}}\n\n");
        sse.push_str("data: [DONE]\n\n");
        sse.push_str(&delta("after done"));
        return ([(CONTENT_TYPE, "text/event-stream")], sse).into_response();
    }

    let prompt = body["messages"]
        .as_array()
        .and_then(|messages| messages.last())
        .and_then(|message| message["content"].as_str())
        .unwrap_or_default()
        .to_owned();

    Json(json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": body["model"],
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": format!("echo: {prompt}"),
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "lookup", "arguments": "{\"q\":\"rust\"}"}
                }]
            },
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 4, "completion_tokens": 3, "total_tokens": 7}
    }))
    .into_response()
}

pub async fn spawn_ollama_server() -> (String, Recorder) {
    let recorder = Recorder::default();
    let app = Router::new()
        .route("/api/tags", get(ollama_tags))
        .route("/api/pull", post(ollama_pull))
        .route("/api/show", post(ollama_show))
        .route("/api/chat", post(ollama_chat))
        .with_state(recorder.clone());
    (serve(app).await, recorder)
}

async fn ollama_tags() -> Json<Value> {
    Json(json!({"models": [{"name": "qwen2.5:3b"}, {"name": "llama3.2:3b"}]}))
}

async fn ollama_pull(State(recorder): State<Recorder>, Json(body): Json<Value>) -> Response {
    recorder.push("/api/pull", body.clone());
    if body["model"] == json!("missing:latest") {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "pull model manifest: file does not exist"})),
        )
            .into_response();
    }
    Json(json!({"status": "success"})).into_response()
}

async fn ollama_show(Json(body): Json<Value>) -> Response {
    if body["model"] == json!("qwen2.5:3b") {
        return Json(json!({"details": {"family": "qwen2", "parameter_size": "3.1B"}}))
            .into_response();
    }
    (StatusCode::NOT_FOUND, Json(json!({"error": "model not found"}))).into_response()
}

async fn ollama_chat(State(recorder): State<Recorder>, Json(body): Json<Value>) -> Response {
    recorder.push("/api/chat", body.clone());

    if body["stream"] == json!(true) {
        let mut ndjson = String::new();
        for delta in NDJSON_DELTAS {
            ndjson.push_str(&json!({"message": {"role": "assistant", "content": delta}, "done": false}).to_string());
            ndjson.push('\n');
        }
        ndjson.push_str(
            &json!({"message": {"role": "assistant", "content": ""}, "done": true, "eval_count": 2})
                .to_string(),
        );
        ndjson.push('\n');
        return ([(CONTENT_TYPE, "application/x-ndjson")], ndjson).into_response();
    }

    let turns = body["messages"].as_array().map(Vec::len).unwrap_or(0);
    Json(json!({
        "model": body["model"],
        "message": {"role": "assistant", "content": format!("ollama saw {turns} message(s)")},
        "done": true,
        "prompt_eval_count": 12,
        "eval_count": 4
    }))
    .into_response()
}

/// A daemon whose `/api/chat` answers only after `delay`.
pub async fn spawn_slow_ollama_server(delay: Duration) -> String {
    let app = Router::new()
        .route("/api/tags", get(ollama_tags))
        .route("/api/pull", post(|| async { Json(json!({"status": "success"})) }))
        .route(
            "/api/chat",
            post(move || async move {
                tokio::time::sleep(delay).await;
                Json(json!({"message": {"role": "assistant", "content": "late"}, "done": true}))
            }),
        );
    serve(app).await
}

struct NotifyOnDrop(Arc<Notify>);

impl Drop for NotifyOnDrop {
    fn drop(&mut self) {
        self.0.notify_one();
    }
}

/// An OpenAI-style server whose completion stream never finishes. The
/// returned `Notify` fires once the server drops the response body, which
/// happens when the client goes away.
pub async fn spawn_endless_sse_server() -> (String, Arc<Notify>) {
    let released = Arc::new(Notify::new());
    let app = Router::new()
        .route("/v1/chat/completions", post(endless_sse))
        .with_state(released.clone());
    (serve(app).await, released)
}

async fn endless_sse(State(released): State<Arc<Notify>>) -> Response {
    let guard = NotifyOnDrop(released);
    let body = async_stream::stream! {
        let _guard = guard;
        yield Ok::<_, Infallible>(format!(
            "data: {}\n\n",
            json!({"choices": [{"index": 0, "delta": {"content": SSE_DELTAS[0]}}]})
        ));
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;
            yield Ok(": keep-alive\n\n".to_owned());
        }
    };
    ([(CONTENT_TYPE, "text/event-stream")], Body::from_stream(body)).into_response()
}

pub fn write_config(dir: &Path, relative: &str, body: &str) {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create config directory");
    }
    fs::write(path, body).expect("write config file");
}
