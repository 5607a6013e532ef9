use serde_json::{json, Value as JsonValue};
use thiserror::Error;

/// Errors raised inside the service. The embedding and extraction clients
/// never let these escape their public contracts; they surface only at the
/// configuration and tool boundaries.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid configuration{}: {}", field_suffix(.field), .message)]
    Config { field: Option<String>, message: String },

    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status { endpoint: String, status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed payload: {0}")]
    Payload(String),

    #[error("model '{}' is not installed (available: {})", .model, .available.join(", "))]
    ModelNotFound { model: String, available: Vec<String> },

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
}

fn field_suffix(field: &Option<String>) -> String {
    field.as_deref().map(|f| format!(" ({f})")).unwrap_or_default()
}

impl ServiceError {
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        ServiceError::Config { field: Some(field.into()), message: message.into() }
    }

    /// Stable machine-readable code, used in JSON-RPC and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Config { .. } => "CONFIG_ERROR",
            ServiceError::Status { .. } => "OLLAMA_HTTP_ERROR",
            ServiceError::Transport(_) => "CONNECTION_ERROR",
            ServiceError::Payload(_) => "PAYLOAD_ERROR",
            ServiceError::ModelNotFound { .. } => "MODEL_NOT_FOUND",
            ServiceError::UnknownTool(_) => "UNKNOWN_TOOL",
            ServiceError::InvalidArguments(_) => "INVALID_INPUT",
        }
    }

    fn details(&self) -> JsonValue {
        match self {
            ServiceError::Config { field, .. } => json!({ "field": field }),
            ServiceError::Status { endpoint, status, .. } => json!({ "endpoint": endpoint, "status": status }),
            ServiceError::Transport(err) => json!({ "timeout": err.is_timeout(), "connect": err.is_connect() }),
            ServiceError::ModelNotFound { model, available } => json!({
                "model": model,
                "available": available,
                "suggestion": format!("ollama pull {model}"),
            }),
            _ => JsonValue::Null,
        }
    }

    /// Error envelope shared by the stdio and HTTP transports.
    pub fn to_json(&self) -> JsonValue {
        json!({ "error": { "code": self.code(), "message": self.to_string(), "details": self.details() } })
    }
}

/// Result of a total operation: the value is always usable, but a degraded
/// value carries the reason it had to be patched or substituted.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Ok(T),
    Degraded(T, String),
}

impl<T> Outcome<T> {
    pub fn degraded(value: T, reason: impl Into<String>) -> Self {
        Outcome::Degraded(value, reason.into())
    }

    pub fn value(&self) -> &T {
        match self {
            Outcome::Ok(v) | Outcome::Degraded(v, _) => v,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Outcome::Ok(v) | Outcome::Degraded(v, _) => v,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Outcome::Degraded(..))
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Ok(_) => None,
            Outcome::Degraded(_, reason) => Some(reason),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Ok(v) => Outcome::Ok(f(v)),
            Outcome::Degraded(v, reason) => Outcome::Degraded(f(v), reason),
        }
    }

    /// Degrade with `reason`, keeping an earlier reason in front if present.
    pub fn degrade(self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        match self {
            Outcome::Ok(v) => Outcome::Degraded(v, reason),
            Outcome::Degraded(v, prev) => Outcome::Degraded(v, format!("{prev}; {reason}")),
        }
    }
}
