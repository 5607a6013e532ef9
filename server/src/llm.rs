use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::coerce::coerce_text;
use crate::config::LlmConfig;
use crate::error::{Outcome, ServiceError};
use crate::schema::{CoercedPayload, ExtractionSchema, ENTITY_CATEGORIES};

/// Completion budget sent as `num_predict` when none is configured.
const DEFAULT_NUM_PREDICT: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub role: String,
	pub content: String,
}

impl Message {
	pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
		Self { role: role.into(), content: content.into() }
	}

	pub fn system(content: impl Into<String>) -> Self {
		Self::new("system", content)
	}

	pub fn user(content: impl Into<String>) -> Self {
		Self::new("user", content)
	}
}

/// One chat-completion round trip. Implementations return the assistant's
/// message content; `json_mode` asks the backend to constrain output to JSON.
#[async_trait]
pub trait ChatBackend: Send + Sync {
	async fn chat(&self, messages: &[Message], json_mode: bool) -> Result<String, ServiceError>;

	fn model(&self) -> &str;
}

/// [`ChatBackend`] over Ollama's `/api/chat`.
#[derive(Debug, Clone)]
pub struct OllamaChat {
	client: reqwest::Client,
	base_url: String,
	model: String,
	temperature: f32,
	num_predict: u32,
}

impl OllamaChat {
	pub fn new(cfg: &LlmConfig) -> Result<Self, ServiceError> {
		Self::with_timeout(cfg, Duration::from_secs(cfg.timeout_secs))
	}

	pub fn with_timeout(cfg: &LlmConfig, timeout: Duration) -> Result<Self, ServiceError> {
		let client = reqwest::Client::builder().timeout(timeout).build()?;
		Ok(Self {
			client,
			base_url: cfg.base_url.trim_end_matches('/').to_string(),
			model: cfg.model.clone(),
			temperature: cfg.temperature,
			num_predict: cfg.max_tokens.unwrap_or(DEFAULT_NUM_PREDICT),
		})
	}

	fn request_body(&self, messages: &[Message], json_mode: bool) -> JsonValue {
		let mut body = json!({
			"model": self.model,
			"messages": messages,
			"stream": false,
			"temperature": self.temperature,
			"options": { "temperature": self.temperature, "num_predict": self.num_predict },
		});
		if json_mode {
			body["format"] = json!("json");
		}
		body
	}
}

#[async_trait]
impl ChatBackend for OllamaChat {
	async fn chat(&self, messages: &[Message], json_mode: bool) -> Result<String, ServiceError> {
		let endpoint = "/api/chat";
		let resp = self
			.client
			.post(format!("{}{}", self.base_url, endpoint))
			.json(&self.request_body(messages, json_mode))
			.send()
			.await?;
		let status = resp.status();
		if !status.is_success() {
			let body = resp.text().await.unwrap_or_default();
			return Err(ServiceError::Status { endpoint: endpoint.to_string(), status: status.as_u16(), body });
		}
		let json: JsonValue = resp.json().await?;
		json["message"]["content"]
			.as_str()
			.map(str::to_string)
			.ok_or_else(|| ServiceError::Payload("chat response has no message content".to_string()))
	}

	fn model(&self) -> &str {
		&self.model
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum LlmResponse {
	Text(String),
	Structured(CoercedPayload),
}

impl LlmResponse {
	pub fn as_text(&self) -> Option<&str> {
		match self {
			LlmResponse::Text(t) => Some(t),
			LlmResponse::Structured(_) => None,
		}
	}

	pub fn as_structured(&self) -> Option<&CoercedPayload> {
		match self {
			LlmResponse::Structured(p) => Some(p),
			LlmResponse::Text(_) => None,
		}
	}

	pub fn into_value(self) -> JsonValue {
		match self {
			LlmResponse::Text(t) => JsonValue::String(t),
			LlmResponse::Structured(p) => p.into_value(),
		}
	}
}

fn extraction_prompt(schema: &ExtractionSchema) -> String {
	let categories = ENTITY_CATEGORIES
		.iter()
		.take(schema.category_count())
		.enumerate()
		.map(|(i, c)| format!("{i}={c}"))
		.collect::<Vec<_>>()
		.join(", ");
	format!(
		"You are an entity extraction assistant. Extract ALL entities and relationships from the text.\n\n\
		 IMPORTANT:\n\
		 1. Extract every entity mentioned (people, organizations, technologies, concepts, places)\n\
		 2. Each entity must have a unique name\n\
		 3. Entity types: {categories}\n\
		 4. Include observations about each entity\n\
		 5. Respond with valid JSON only\n\n\
		 Return a JSON object with these fields: {}",
		schema.type_hint()
	)
}

/// Extraction client: prompt building, JSON-mode requests, coercion and retry.
pub struct LlmClient<B: ChatBackend = OllamaChat> {
	backend: B,
	max_attempts: u32,
	backoff_unit: Duration,
}

impl LlmClient<OllamaChat> {
	pub fn from_config(cfg: &LlmConfig) -> Result<Self, ServiceError> {
		Ok(Self::new(OllamaChat::new(cfg)?, cfg.max_attempts, Duration::from_millis(cfg.backoff_unit_ms)))
	}
}

impl<B: ChatBackend> LlmClient<B> {
	pub fn new(backend: B, max_attempts: u32, backoff_unit: Duration) -> Self {
		Self { backend, max_attempts: max_attempts.max(1), backoff_unit }
	}

	pub fn backend(&self) -> &B {
		&self.backend
	}

	pub fn max_attempts(&self) -> u32 {
		self.max_attempts
	}

	/// Chat model name reported by the backend.
	pub fn model(&self) -> &str {
		self.backend.model()
	}

	/// Caller messages, plus the extraction instruction when a schema is given.
	pub fn build_messages(messages: &[Message], schema: Option<&ExtractionSchema>) -> Vec<Message> {
		let mut out = messages.to_vec();
		if let Some(schema) = schema {
			out.push(Message::system(extraction_prompt(schema)));
		}
		out
	}

	/// One request. Errors on transport failure or an empty completion.
	async fn attempt(&self, messages: &[Message], schema: Option<&ExtractionSchema>) -> Result<Outcome<LlmResponse>, ServiceError> {
		let request = Self::build_messages(messages, schema);
		let started = Instant::now();
		let content = self.backend.chat(&request, schema.is_some()).await?;
		debug!(model = self.backend.model(), elapsed_ms = started.elapsed().as_millis() as u64, chars = content.len(), "chat completed");
		if content.trim().is_empty() {
			return Err(ServiceError::Payload("model returned empty content".to_string()));
		}
		Ok(match schema {
			Some(schema) => coerce_text(&content, schema).map(LlmResponse::Structured),
			None => Outcome::Ok(LlmResponse::Text(content)),
		})
	}

	/// Single attempt. Never fails: a transport error yields empty text, or the
	/// schema's empty instance when a schema is given.
	pub async fn generate(&self, messages: &[Message], schema: Option<&ExtractionSchema>) -> LlmResponse {
		match self.attempt(messages, schema).await {
			Ok(out) => {
				if let Some(reason) = out.reason() {
					warn!(%reason, "structured response degraded");
				}
				out.into_value()
			}
			Err(err) => {
				warn!(error = %err, code = err.code(), "chat request failed");
				empty_response(schema)
			}
		}
	}

	/// Up to `max_attempts` attempts with `2^attempt` backoff units after each
	/// failure. `None` only when every attempt failed and no schema was given.
	pub async fn generate_with_retry(&self, messages: &[Message], schema: Option<&ExtractionSchema>) -> Option<LlmResponse> {
		for attempt in 0..self.max_attempts {
			match self.attempt(messages, schema).await {
				Ok(out) => {
					if let Some(reason) = out.reason() {
						warn!(%reason, attempt, "structured response degraded");
					}
					if attempt > 0 {
						info!(attempt, "chat succeeded after retry");
					}
					return Some(out.into_value());
				}
				Err(err) => {
					let backoff = self.backoff_unit * 2u32.saturating_pow(attempt);
					warn!(attempt = attempt + 1, max_attempts = self.max_attempts, error = %err, backoff_ms = backoff.as_millis() as u64, "chat attempt failed");
					tokio::time::sleep(backoff).await;
				}
			}
		}
		warn!(max_attempts = self.max_attempts, "all chat attempts failed");
		schema.map(|s| LlmResponse::Structured(s.empty_instance()))
	}

	/// Minimal round trip used by connection checks.
	pub async fn ping(&self) -> Result<String, ServiceError> {
		self.backend.chat(&[Message::user("Reply with the single word: pong")], false).await
	}
}

fn empty_response(schema: Option<&ExtractionSchema>) -> LlmResponse {
	match schema {
		Some(s) => LlmResponse::Structured(s.empty_instance()),
		None => LlmResponse::Text(String::new()),
	}
}
