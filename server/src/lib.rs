//! Embedding and structured-extraction core for a graph memory MCP server.
//!
//! Talks to an Ollama-compatible endpoint for embeddings and chat
//! completions and guarantees well-formed results: unit-norm vectors of the
//! configured dimension and schema-shaped extraction payloads, whatever the
//! endpoint returns.

pub mod coerce;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod llm;
pub mod sanitize;
pub mod schema;
pub mod tools;
pub mod vector;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use embeddings::OllamaEmbedder;
pub use error::{Outcome, ServiceError};
pub use llm::{ChatBackend, LlmClient, LlmResponse, Message, OllamaChat};
pub use sanitize::{sanitize, EmbeddingVector};
pub use schema::{CoercedPayload, ExtractionSchema, FieldKind};
pub use tools::{call_tool, list_tools, AppContext};
