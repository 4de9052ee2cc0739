//! Embedding model collaborator
//!
//! The model itself lives outside this system; the registry consumes it as a
//! pure `text -> vector` function that may fail or time out. Production
//! deployments point [`HttpEmbeddingModel`] at an embedding service;
//! [`crate::testing::HashEmbedder`] covers tests and offline runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Embedding model call failed
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ModelError(pub String);

/// External embedding model: `text -> vector`.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    async fn embed(&self, text: &str, model_id: &str) -> Result<Vec<f32>, ModelError>;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    text: &'a str,
    model_id: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    vector: Vec<f32>,
}

/// Embedding model behind an HTTP service.
///
/// POSTs `{"text", "model_id"}` to the endpoint and expects
/// `{"vector": [...]}`. Call timeouts are applied by the version manager,
/// not here.
pub struct HttpEmbeddingModel {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpEmbeddingModel {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EmbeddingModel for HttpEmbeddingModel {
    async fn embed(&self, text: &str, model_id: &str) -> Result<Vec<f32>, ModelError> {
        debug!(endpoint = %self.endpoint, model_id, chars = text.len(), "requesting embedding");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&EmbedRequest { text, model_id })
            .send()
            .await
            .map_err(|e| ModelError(format!("request to {} failed: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ModelError(format!(
                "embedding service returned {status} for model '{model_id}'"
            )));
        }

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| ModelError(format!("invalid embedding response: {e}")))?;

        if body.vector.is_empty() {
            return Err(ModelError("embedding service returned an empty vector".into()));
        }

        Ok(body.vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_model_refused_connection_errors() {
        // Port 1 on loopback refuses immediately; no network needed.
        let model = HttpEmbeddingModel::new("http://127.0.0.1:1/embed");
        let err = model.embed("some text", "test-model").await;
        assert!(err.is_err());
    }
}
