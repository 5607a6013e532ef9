//! In-process stand-in for an Ollama server, used by the module tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value as JsonValue};
use tokio::time::{sleep, Duration};

use crate::config::{EmbedderConfig, LlmConfig};

/// Scripted behavior for the mock endpoints. A status of 0 means 200.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
	pub models: Vec<String>,
	pub embeddings: HashMap<String, Vec<f64>>,
	pub default_embedding: Option<Vec<f64>>,
	pub embed_status: u16,
	pub embed_delay_ms: u64,
	pub chat_replies: Vec<String>,
	pub chat_status: u16,
	pub chat_delay_ms: u64,
	pub show_body: JsonValue,
}

#[derive(Default)]
pub struct MockState {
	behavior: MockBehavior,
	pub embed_calls: AtomicUsize,
	pub chat_calls: AtomicUsize,
	pub tags_calls: AtomicUsize,
	pub show_calls: AtomicUsize,
	pub chat_requests: Mutex<Vec<JsonValue>>,
	embeds_in_flight: AtomicUsize,
	peak_embeds_in_flight: AtomicUsize,
}

impl MockState {
	pub fn chat_count(&self) -> usize {
		self.chat_calls.load(Ordering::SeqCst)
	}

	pub fn embed_count(&self) -> usize {
		self.embed_calls.load(Ordering::SeqCst)
	}

	pub fn tags_count(&self) -> usize {
		self.tags_calls.load(Ordering::SeqCst)
	}

	pub fn show_count(&self) -> usize {
		self.show_calls.load(Ordering::SeqCst)
	}

	/// Most `/api/embed` requests seen in flight at once.
	pub fn peak_embeds_in_flight(&self) -> usize {
		self.peak_embeds_in_flight.load(Ordering::SeqCst)
	}

	pub fn last_chat_request(&self) -> Option<JsonValue> {
		self.chat_requests.lock().ok().and_then(|r| r.last().cloned())
	}
}

pub struct MockOllama {
	pub base_url: String,
	pub state: Arc<MockState>,
}

fn status_or_ok(code: u16) -> StatusCode {
	if code == 0 {
		StatusCode::OK
	} else {
		StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
	}
}

async fn embed(State(state): State<Arc<MockState>>, Json(body): Json<JsonValue>) -> Response {
	state.embed_calls.fetch_add(1, Ordering::SeqCst);
	let in_flight = state.embeds_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
	state.peak_embeds_in_flight.fetch_max(in_flight, Ordering::SeqCst);
	let b = &state.behavior;
	if b.embed_delay_ms > 0 {
		sleep(Duration::from_millis(b.embed_delay_ms)).await;
	}
	state.embeds_in_flight.fetch_sub(1, Ordering::SeqCst);
	let status = status_or_ok(b.embed_status);
	if status != StatusCode::OK {
		return (status, "embedding backend failure").into_response();
	}
	let input = body.get("input").and_then(|v| v.as_str()).unwrap_or("");
	let vector = b.embeddings.get(input).cloned().or_else(|| b.default_embedding.clone());
	let embeddings = match vector {
		Some(v) => json!([v]),
		None => json!([]),
	};
	Json(json!({ "model": body["model"], "embeddings": embeddings })).into_response()
}

async fn tags(State(state): State<Arc<MockState>>) -> Response {
	state.tags_calls.fetch_add(1, Ordering::SeqCst);
	let models: Vec<JsonValue> = state.behavior.models.iter().map(|m| json!({ "name": m, "size": 1 })).collect();
	Json(json!({ "models": models })).into_response()
}

async fn show(State(state): State<Arc<MockState>>, Json(body): Json<JsonValue>) -> Response {
	state.show_calls.fetch_add(1, Ordering::SeqCst);
	let name = body.get("name").and_then(|v| v.as_str()).unwrap_or("");
	if !state.behavior.models.iter().any(|m| m == name) {
		return (StatusCode::NOT_FOUND, format!("model '{name}' not found")).into_response();
	}
	Json(state.behavior.show_body.clone()).into_response()
}

async fn chat(State(state): State<Arc<MockState>>, Json(body): Json<JsonValue>) -> Response {
	let idx = state.chat_calls.fetch_add(1, Ordering::SeqCst);
	if let Ok(mut reqs) = state.chat_requests.lock() {
		reqs.push(body.clone());
	}
	let b = &state.behavior;
	if b.chat_delay_ms > 0 {
		sleep(Duration::from_millis(b.chat_delay_ms)).await;
	}
	let status = status_or_ok(b.chat_status);
	if status != StatusCode::OK {
		return (status, "chat backend failure").into_response();
	}
	let reply = b.chat_replies.get(idx).or_else(|| b.chat_replies.last()).cloned().unwrap_or_default();
	Json(json!({
		"model": body["model"],
		"message": { "role": "assistant", "content": reply },
		"done": true
	}))
	.into_response()
}

pub async fn spawn(behavior: MockBehavior) -> MockOllama {
	let state = Arc::new(MockState { behavior, ..Default::default() });
	let app = Router::new()
		.route("/api/embed", post(embed))
		.route("/api/tags", get(tags))
		.route("/api/show", post(show))
		.route("/api/chat", post(chat))
		.with_state(state.clone());
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
	let addr = listener.local_addr().expect("mock addr");
	tokio::spawn(async move {
		let _ = axum::serve(listener, app).await;
	});
	MockOllama { base_url: format!("http://{addr}"), state }
}

/// A local URL with nothing listening on it.
pub async fn unreachable_url() -> String {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind free port");
	let addr = listener.local_addr().expect("free port addr");
	drop(listener);
	format!("http://{addr}")
}

pub fn embedder_config(base_url: &str, dimensions: usize) -> EmbedderConfig {
	EmbedderConfig {
		model: "nomic-embed-text:v1.5".to_string(),
		base_url: base_url.to_string(),
		dimensions,
		batch_size: 2,
		timeout_secs: 5,
	}
}

pub fn llm_config(base_url: &str) -> LlmConfig {
	LlmConfig {
		model: "qwen2.5:7b".to_string(),
		base_url: base_url.to_string(),
		timeout_secs: 5,
		backoff_unit_ms: 1,
		..LlmConfig::default()
	}
}

pub fn unit(dim: usize, hot: usize) -> Vec<f64> {
	let mut v = vec![0.0; dim];
	v[hot] = 1.0;
	v
}
