use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::embeddings::OllamaEmbedder;
use crate::error::ServiceError;
use crate::llm::{LlmClient, LlmResponse, Message};
use crate::sanitize::sanitize_outcome;
use crate::schema::ExtractionSchema;
use crate::vector::inspect;

/// Long-lived handles shared by every transport. Built once at startup.
pub struct AppContext {
	config: Config,
	embedder: OllamaEmbedder,
	llm: LlmClient,
	started: Instant,
}

impl AppContext {
	pub fn new(config: Config) -> Result<Self, ServiceError> {
		let embedder = OllamaEmbedder::new(&config.embedder)?;
		let llm = LlmClient::from_config(&config.llm)?;
		Ok(Self { config, embedder, llm, started: Instant::now() })
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn embedder(&self) -> &OllamaEmbedder {
		&self.embedder
	}

	pub fn llm(&self) -> &LlmClient {
		&self.llm
	}

	pub fn uptime_secs(&self) -> u64 {
		self.started.elapsed().as_secs()
	}

	pub fn shutdown(&self) {
		info!(uptime_secs = self.uptime_secs(), "shutting down, releasing clients");
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
	pub name: &'static str,
	pub description: &'static str,
	#[serde(rename = "inputSchema")]
	pub input_schema: JsonValue,
}

pub fn list_tools() -> Vec<ToolDescriptor> {
	vec![
		ToolDescriptor {
			name: "test_connection",
			description: "Check the embedding and chat endpoints",
			input_schema: json!({ "type": "object", "properties": {} }),
		},
		ToolDescriptor {
			name: "embed_text",
			description: "Embed one text or a batch of texts into unit vectors",
			input_schema: json!({
				"type": "object",
				"properties": {
					"text": { "type": "string" },
					"texts": { "type": "array", "items": { "type": "string" } },
					"batch_size": { "type": "integer", "minimum": 1 }
				}
			}),
		},
		ToolDescriptor {
			name: "extract_entities",
			description: "Extract entities from an episode body",
			input_schema: json!({
				"type": "object",
				"properties": { "episode_body": { "type": "string" }, "name": { "type": "string" } },
				"required": ["episode_body"]
			}),
		},
		ToolDescriptor {
			name: "extract_relations",
			description: "Extract relations between known entities in an episode body",
			input_schema: json!({
				"type": "object",
				"properties": {
					"episode_body": { "type": "string" },
					"entities": { "type": "array", "items": { "type": "string" } }
				},
				"required": ["episode_body", "entities"]
			}),
		},
		ToolDescriptor {
			name: "check_vector",
			description: "Inspect a vector for NaN, zero norm and dimension problems",
			input_schema: json!({
				"type": "object",
				"properties": {
					"vector": { "type": "array", "items": { "type": "number" } },
					"dimensions": { "type": "integer", "minimum": 1 }
				},
				"required": ["vector"]
			}),
		},
		ToolDescriptor {
			name: "model_info",
			description: "Details of the configured embedding model",
			input_schema: json!({ "type": "object", "properties": {} }),
		},
	]
}

#[derive(Debug, Deserialize)]
struct EmbedArgs {
	text: Option<String>,
	texts: Option<Vec<String>>,
	batch_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EntityArgs {
	episode_body: String,
	name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RelationArgs {
	episode_body: String,
	entities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct VectorArgs {
	vector: Vec<JsonValue>,
	dimensions: Option<usize>,
}

fn parse_args<T: serde::de::DeserializeOwned>(args: &JsonValue) -> Result<T, ServiceError> {
	let args = if args.is_null() { json!({}) } else { args.clone() };
	serde_json::from_value(args).map_err(|e| ServiceError::InvalidArguments(e.to_string()))
}

fn non_blank(field: &str, value: &str) -> Result<(), ServiceError> {
	if value.trim().is_empty() {
		return Err(ServiceError::InvalidArguments(format!("{field} must not be empty")));
	}
	Ok(())
}

/// Dispatches a tool call. Every call is logged with its elapsed time.
pub async fn call_tool(ctx: &AppContext, name: &str, args: &JsonValue) -> Result<JsonValue, ServiceError> {
	let call_id = Uuid::new_v4();
	let started = Instant::now();
	debug!(%call_id, tool = name, "tool call started");
	let result = match name {
		"test_connection" => Ok(test_connection(ctx).await),
		"embed_text" => embed_text(ctx, args).await,
		"extract_entities" => extract_entities(ctx, args).await,
		"extract_relations" => extract_relations(ctx, args).await,
		"check_vector" => check_vector(ctx, args),
		"model_info" => ctx.embedder().model_info().await,
		other => Err(ServiceError::UnknownTool(other.to_string())),
	};
	let elapsed_ms = started.elapsed().as_millis() as u64;
	match &result {
		Ok(_) => info!(%call_id, tool = name, elapsed_ms, "tool call completed"),
		Err(err @ (ServiceError::UnknownTool(_) | ServiceError::InvalidArguments(_))) => {
			warn!(%call_id, tool = name, elapsed_ms, error = %err, "tool call rejected")
		}
		Err(err) => error!(%call_id, tool = name, elapsed_ms, error = %err, code = err.code(), "tool call failed"),
	}
	result
}

async fn test_connection(ctx: &AppContext) -> JsonValue {
	let embedder = ctx.embedder();
	let healthy = embedder.connection_healthy().await;
	let sample = embedder.embed_outcome("connection test").await;
	let llm = match ctx.llm().ping().await {
		Ok(reply) => json!({ "model": ctx.llm().model(), "ok": !reply.trim().is_empty() }),
		Err(err) => json!({ "model": ctx.llm().model(), "ok": false, "error": err.to_string() }),
	};
	json!({
		"embedder": { "model": embedder.model(), "healthy": healthy },
		"llm": llm,
		"sample_embedding": {
			"dimensions": sample.value().len(),
			"norm": sample.value().norm(),
			"degraded": sample.reason(),
		},
		"config": ctx.config().summary(),
	})
}

async fn embed_text(ctx: &AppContext, args: &JsonValue) -> Result<JsonValue, ServiceError> {
	let args: EmbedArgs = parse_args(args)?;
	let embedder = ctx.embedder();
	match (args.text, args.texts) {
		(Some(text), None) => {
			let vector = embedder.embed(&text).await;
			Ok(json!({ "dimensions": vector.len(), "embedding": vector }))
		}
		(None, Some(texts)) => {
			let batch_size = args.batch_size.unwrap_or(embedder.batch_size());
			if batch_size == 0 {
				return Err(ServiceError::InvalidArguments("batch_size must be at least 1".into()));
			}
			let vectors = embedder.embed_batch(&texts, batch_size).await;
			Ok(json!({ "dimensions": embedder.dimensions(), "count": vectors.len(), "embeddings": vectors }))
		}
		(Some(_), Some(_)) => Err(ServiceError::InvalidArguments("pass either text or texts, not both".into())),
		(None, None) => Err(ServiceError::InvalidArguments("missing text or texts".into())),
	}
}

fn structured(out: Option<LlmResponse>, schema: &ExtractionSchema) -> JsonValue {
	out.unwrap_or_else(|| LlmResponse::Structured(schema.empty_instance())).into_value()
}

async fn extract_entities(ctx: &AppContext, args: &JsonValue) -> Result<JsonValue, ServiceError> {
	let args: EntityArgs = parse_args(args)?;
	non_blank("episode_body", &args.episode_body)?;
	let prompt = match args.name.as_deref().filter(|n| !n.trim().is_empty()) {
		Some(name) => format!("Episode: {name}\n\nText:\n{}", args.episode_body),
		None => format!("Text:\n{}", args.episode_body),
	};
	let schema = ExtractionSchema::extracted_entities();
	let out = ctx.llm().generate_with_retry(&[Message::user(prompt)], Some(&schema)).await;
	Ok(structured(out, &schema))
}

fn relation_prompt(body: &str, entities: &[String]) -> String {
	let listed = entities.iter().enumerate().map(|(i, e)| format!("ENTITY_{i}: {e}")).collect::<Vec<_>>().join("\n");
	format!(
		"Entities:\n{listed}\n\nText:\n{body}\n\n\
		 Describe each relationship with source_entity_id and target_entity_id taken from the entity indices above."
	)
}

async fn extract_relations(ctx: &AppContext, args: &JsonValue) -> Result<JsonValue, ServiceError> {
	let args: RelationArgs = parse_args(args)?;
	non_blank("episode_body", &args.episode_body)?;
	if args.entities.is_empty() {
		return Err(ServiceError::InvalidArguments("entities must not be empty".into()));
	}
	let schema = ExtractionSchema::extracted_edges();
	let message = Message::user(relation_prompt(&args.episode_body, &args.entities));
	let out = ctx.llm().generate_with_retry(&[message], Some(&schema)).await;
	Ok(structured(out, &schema))
}

fn check_vector(ctx: &AppContext, args: &JsonValue) -> Result<JsonValue, ServiceError> {
	let args: VectorArgs = parse_args(args)?;
	let dims = args.dimensions.unwrap_or(ctx.embedder().dimensions());
	if dims == 0 {
		return Err(ServiceError::InvalidArguments("dimensions must be at least 1".into()));
	}
	let raw: Vec<f64> = args.vector.iter().map(|x| x.as_f64().unwrap_or(f64::NAN)).collect();
	let as_f32: Vec<f32> = raw.iter().map(|&x| x as f32).collect();
	let report = inspect(&as_f32, dims);
	let healthy = report.is_healthy();
	let repaired = sanitize_outcome(Some(&raw), dims);
	Ok(json!({
		"report": report,
		"healthy": healthy,
		"sanitized": {
			"dimensions": repaired.value().len(),
			"norm": repaired.value().norm(),
			"repairs": repaired.reason(),
		},
	}))
}
