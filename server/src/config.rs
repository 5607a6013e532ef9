use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::error::ServiceError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
	pub model: String,
	pub base_url: String,
	pub temperature: f32,
	pub max_tokens: Option<u32>,
	pub timeout_secs: u64,
	pub max_attempts: u32,
	/// Base unit of the retry backoff (`2^attempt` units between attempts).
	pub backoff_unit_ms: u64,
}

impl Default for LlmConfig {
	fn default() -> Self {
		Self {
			model: "qwen2.5:7b".to_string(),
			base_url: "http://localhost:11434".to_string(),
			temperature: 0.1,
			max_tokens: None,
			timeout_secs: 120,
			max_attempts: 3,
			backoff_unit_ms: 1000,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbedderConfig {
	pub model: String,
	pub base_url: String,
	pub dimensions: usize,
	pub batch_size: usize,
	pub timeout_secs: u64,
}

impl Default for EmbedderConfig {
	fn default() -> Self {
		Self {
			model: "nomic-embed-text:v1.5".to_string(),
			base_url: "http://localhost:11434".to_string(),
			dimensions: 768,
			batch_size: 10,
			timeout_secs: 60,
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
	#[default]
	Text,
	Json,
}

impl FromStr for LogFormat {
	type Err = ServiceError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"text" => Ok(LogFormat::Text),
			"json" => Ok(LogFormat::Json),
			other => Err(ServiceError::config("logging.format", format!("unknown log format '{other}'"))),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
	pub level: String,
	pub format: LogFormat,
	/// When set, logs are also written to a daily-rolled file at this path.
	pub file_path: Option<String>,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self { level: "info".to_string(), format: LogFormat::Text, file_path: None }
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
	#[default]
	Stdio,
	Http,
}

impl FromStr for Transport {
	type Err = ServiceError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"stdio" => Ok(Transport::Stdio),
			"http" => Ok(Transport::Http),
			other => Err(ServiceError::config("server.transport", format!("unknown transport '{other}'"))),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
	pub transport: Transport,
	pub bind: String,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self { transport: Transport::Stdio, bind: "127.0.0.1:8080".to_string() }
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
	pub llm: LlmConfig,
	pub embedder: EmbedderConfig,
	pub logging: LoggingConfig,
	pub server: ServerConfig,
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
	if let Some(raw) = lookup(key) {
		match raw.trim().parse::<T>() {
			Ok(v) => *slot = v,
			Err(_) => warn!(key, value = %raw, "ignoring unparseable environment value"),
		}
	}
}

fn string_into(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut String) {
	if let Some(raw) = lookup(key) {
		if !raw.trim().is_empty() {
			*slot = raw.trim().to_string();
		}
	}
}

impl Config {
	/// Loads `.env` (if present) and reads the process environment.
	pub fn from_env() -> Self {
		let _ = dotenvy::dotenv();
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
		let mut cfg = Self::default();

		string_into(&lookup, "OLLAMA_MODEL", &mut cfg.llm.model);
		string_into(&lookup, "OLLAMA_BASE_URL", &mut cfg.llm.base_url);
		parse_into(&lookup, "OLLAMA_TEMPERATURE", &mut cfg.llm.temperature);
		parse_into(&lookup, "OLLAMA_TIMEOUT", &mut cfg.llm.timeout_secs);
		parse_into(&lookup, "OLLAMA_MAX_ATTEMPTS", &mut cfg.llm.max_attempts);
		if let Some(raw) = lookup("OLLAMA_MAX_TOKENS") {
			cfg.llm.max_tokens = raw.trim().parse().ok();
		}

		string_into(&lookup, "OLLAMA_EMBEDDING_MODEL", &mut cfg.embedder.model);
		string_into(&lookup, "OLLAMA_EMBEDDING_BASE_URL", &mut cfg.embedder.base_url);
		parse_into(&lookup, "OLLAMA_EMBEDDING_DIMENSIONS", &mut cfg.embedder.dimensions);
		parse_into(&lookup, "EMBEDDING_BATCH_SIZE", &mut cfg.embedder.batch_size);

		string_into(&lookup, "LOG_LEVEL", &mut cfg.logging.level);
		parse_into(&lookup, "LOG_FORMAT", &mut cfg.logging.format);
		if let Some(path) = lookup("LOG_FILE").filter(|p| !p.trim().is_empty()) {
			cfg.logging.file_path = Some(path);
		}

		parse_into(&lookup, "SERVER_TRANSPORT", &mut cfg.server.transport);
		string_into(&lookup, "HTTP_BIND", &mut cfg.server.bind);
		cfg
	}

	pub fn from_file(path: &Path) -> Result<Self, ServiceError> {
		let raw = std::fs::read_to_string(path)
			.map_err(|e| ServiceError::config("config_file", format!("{}: {e}", path.display())))?;
		serde_json::from_str(&raw).map_err(|e| ServiceError::config("config_file", format!("{}: {e}", path.display())))
	}

	/// Reads the file when one is given and exists, the environment otherwise.
	pub fn load(path: Option<&Path>) -> Result<Self, ServiceError> {
		match path {
			Some(p) if p.exists() => Self::from_file(p),
			Some(p) => {
				warn!(path = %p.display(), "config file not found, falling back to environment");
				Ok(Self::from_env())
			}
			None => Ok(Self::from_env()),
		}
	}

	pub fn validate(&self) -> Result<(), ServiceError> {
		if self.llm.model.trim().is_empty() {
			return Err(ServiceError::config("llm.model", "must not be empty"));
		}
		if self.llm.base_url.trim().is_empty() {
			return Err(ServiceError::config("llm.base_url", "must not be empty"));
		}
		if !(0.0..=2.0).contains(&self.llm.temperature) {
			return Err(ServiceError::config("llm.temperature", "must be within [0, 2]"));
		}
		if self.llm.max_attempts == 0 {
			return Err(ServiceError::config("llm.max_attempts", "must be greater than zero"));
		}
		if self.embedder.model.trim().is_empty() {
			return Err(ServiceError::config("embedder.model", "must not be empty"));
		}
		if self.embedder.base_url.trim().is_empty() {
			return Err(ServiceError::config("embedder.base_url", "must not be empty"));
		}
		if self.embedder.dimensions == 0 {
			return Err(ServiceError::config("embedder.dimensions", "must be greater than zero"));
		}
		if self.embedder.batch_size == 0 {
			return Err(ServiceError::config("embedder.batch_size", "must be greater than zero"));
		}
		if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
			return Err(ServiceError::config("logging.level", format!("expected one of {}", LOG_LEVELS.join(", "))));
		}
		if self.server.bind.parse::<SocketAddr>().is_err() {
			return Err(ServiceError::config("server.bind", format!("'{}' is not a socket address", self.server.bind)));
		}
		Ok(())
	}

	pub fn summary(&self) -> serde_json::Value {
		json!({
			"llm_model": self.llm.model,
			"llm_base_url": self.llm.base_url,
			"embedder_model": self.embedder.model,
			"embedder_dimensions": self.embedder.dimensions,
			"embedder_batch_size": self.embedder.batch_size,
			"transport": self.server.transport,
			"log_level": self.logging.level,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;
	use std::io::Write;

	fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
		move |k| map.get(k).cloned()
	}

	#[test]
	fn defaults_are_valid() {
		let cfg = Config::default();
		assert!(cfg.validate().is_ok());
		assert_eq!(cfg.embedder.dimensions, 768);
		assert_eq!(cfg.llm.timeout_secs, 120);
		assert_eq!(cfg.server.transport, Transport::Stdio);
	}

	#[test]
	fn env_overrides_and_bad_numbers_are_ignored() {
		let cfg = Config::from_lookup(lookup_from(&[
			("OLLAMA_MODEL", "llama3.2:3b"),
			("OLLAMA_TEMPERATURE", "0.4"),
			("OLLAMA_EMBEDDING_DIMENSIONS", "not-a-number"),
			("EMBEDDING_BATCH_SIZE", "4"),
			("LOG_FORMAT", "json"),
			("SERVER_TRANSPORT", "http"),
			("HTTP_BIND", "0.0.0.0:9000"),
		]));
		assert_eq!(cfg.llm.model, "llama3.2:3b");
		assert!((cfg.llm.temperature - 0.4).abs() < f32::EPSILON);
		assert_eq!(cfg.embedder.dimensions, 768);
		assert_eq!(cfg.embedder.batch_size, 4);
		assert_eq!(cfg.logging.format, LogFormat::Json);
		assert_eq!(cfg.server.transport, Transport::Http);
		assert_eq!(cfg.server.bind, "0.0.0.0:9000");
	}

	#[test]
	fn validation_reports_offending_field() {
		let mut cfg = Config::default();
		cfg.embedder.dimensions = 0;
		match cfg.validate() {
			Err(ServiceError::Config { field, .. }) => assert_eq!(field.as_deref(), Some("embedder.dimensions")),
			other => panic!("unexpected: {other:?}"),
		}

		let mut cfg = Config::default();
		cfg.llm.temperature = 3.5;
		assert!(cfg.validate().is_err());

		let mut cfg = Config::default();
		cfg.logging.level = "verbose".into();
		assert!(cfg.validate().is_err());
	}

	#[test]
	fn partial_file_keeps_defaults() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(file, r#"{{"embedder": {{"dimensions": 1024}}, "llm": {{"model": "qwen2.5:14b"}}}}"#).unwrap();
		let cfg = Config::load(Some(file.path())).unwrap();
		assert_eq!(cfg.embedder.dimensions, 1024);
		assert_eq!(cfg.embedder.model, "nomic-embed-text:v1.5");
		assert_eq!(cfg.llm.model, "qwen2.5:14b");
		assert_eq!(cfg.llm.max_attempts, 3);
	}

	#[test]
	fn malformed_file_is_a_config_error() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(file, "{{ not json").unwrap();
		let err = Config::from_file(file.path()).unwrap_err();
		assert_eq!(err.code(), "CONFIG_ERROR");
	}

	#[test]
	fn summary_reports_models_and_transport() {
		let summary = Config::default().summary();
		assert_eq!(summary["embedder_dimensions"], 768);
		assert_eq!(summary["transport"], "stdio");
	}
}
