use std::time::Duration;

use futures::future::join_all;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::config::EmbedderConfig;
use crate::error::{Outcome, ServiceError};
use crate::sanitize::{sanitize_outcome, EmbeddingVector};

/// Embedding client for an Ollama-compatible `/api/embed` endpoint.
///
/// Every public embedding call is total: transport failures, bad statuses and
/// malformed vectors all come back as a sanitized unit vector of
/// `dimensions` components, with the cause logged.
#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimensions: usize,
    batch_size: usize,
}

impl OllamaEmbedder {
    pub fn new(cfg: &EmbedderConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(cfg.timeout_secs)).build()?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            dimensions: cfg.dimensions,
            batch_size: cfg.batch_size.max(1),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn request_embedding(&self, text: &str) -> Result<Option<Vec<f64>>, ServiceError> {
        let endpoint = "/api/embed";
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, endpoint))
            .json(&json!({ "model": self.model, "input": text }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ServiceError::Status { endpoint: endpoint.to_string(), status: status.as_u16(), body });
        }
        let body: JsonValue = resp.json().await?;
        Ok(first_embedding(&body))
    }

    /// Embeds one text, reporting whether the vector had to be repaired or replaced.
    pub async fn embed_outcome(&self, text: &str) -> Outcome<EmbeddingVector> {
        match self.request_embedding(text).await {
            Ok(Some(raw)) => sanitize_outcome(Some(&raw), self.dimensions),
            Ok(None) => sanitize_outcome(None, self.dimensions).degrade("response carried no embedding"),
            Err(err) => {
                debug!(error = %err, code = err.code(), model = %self.model, "embedding request failed, using fallback vector");
                sanitize_outcome(None, self.dimensions).degrade(err.to_string())
            }
        }
    }

    pub async fn embed(&self, text: &str) -> EmbeddingVector {
        let out = self.embed_outcome(text).await;
        if let Some(reason) = out.reason() {
            warn!(%reason, chars = text.chars().count(), "embedding degraded");
        }
        out.into_value()
    }

    /// Embeds `texts` in consecutive chunks of `batch_size`, running each chunk
    /// concurrently. Position `i` of the result always belongs to `texts[i]`.
    pub async fn embed_batch<S: AsRef<str>>(&self, texts: &[S], batch_size: usize) -> Vec<EmbeddingVector> {
        let batch_size = batch_size.max(1);
        let mut out = Vec::with_capacity(texts.len());
        for (i, chunk) in texts.chunks(batch_size).enumerate() {
            debug!(chunk = i, size = chunk.len(), "embedding chunk");
            let vectors = join_all(chunk.iter().map(|t| self.embed(t.as_ref()))).await;
            out.extend(vectors);
        }
        out
    }

    pub async fn list_models(&self) -> Result<Vec<String>, ServiceError> {
        let endpoint = "/api/tags";
        let resp = self.client.get(format!("{}{}", self.base_url, endpoint)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ServiceError::Status { endpoint: endpoint.to_string(), status: status.as_u16(), body });
        }
        let body: JsonValue = resp.json().await?;
        let models = body
            .get("models")
            .and_then(|m| m.as_array())
            .ok_or_else(|| ServiceError::Payload("tags response has no models list".to_string()))?;
        Ok(models.iter().filter_map(|m| m.get("name").and_then(|n| n.as_str())).map(str::to_string).collect())
    }

    /// True when the endpoint answers and lists the configured model.
    pub async fn connection_healthy(&self) -> bool {
        match self.list_models().await {
            Ok(models) if models.iter().any(|m| m == &self.model) => true,
            Ok(models) => {
                warn!(model = %self.model, available = ?models, "embedding model not installed");
                false
            }
            Err(err) => {
                warn!(error = %err, "embedding endpoint unreachable");
                false
            }
        }
    }

    /// Model details from `/api/show`.
    pub async fn model_info(&self) -> Result<JsonValue, ServiceError> {
        let endpoint = "/api/show";
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, endpoint))
            .json(&json!({ "name": self.model }))
            .send()
            .await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            let available = self.list_models().await.unwrap_or_default();
            return Err(ServiceError::ModelNotFound { model: self.model.clone(), available });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ServiceError::Status { endpoint: endpoint.to_string(), status: status.as_u16(), body });
        }
        let info: JsonValue = resp.json().await?;
        info!(model = %self.model, "fetched embedding model info");
        Ok(info)
    }
}

// Non-numeric components become NaN so the sanitizer discards the vector.
fn first_embedding(body: &JsonValue) -> Option<Vec<f64>> {
    let first = body.get("embeddings")?.as_array()?.first()?.as_array()?;
    Some(first.iter().map(|x| x.as_f64().unwrap_or(f64::NAN)).collect())
}
