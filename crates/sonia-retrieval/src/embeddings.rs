//! HTTP embeddings client.
//!
//! Talks to an Ollama-compatible `/api/embeddings` endpoint. The client
//! tracks a degraded flag after connectivity failures so diagnostics can
//! report why vector search is absent.

use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{RetrievalError, RetrievalResult};

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

/// Client for a remote embeddings service.
#[derive(Debug)]
pub struct EmbeddingsClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    degraded: AtomicBool,
}

impl EmbeddingsClient {
    /// Create a client for `base_url` using `model`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            model: model.into(),
            degraded: AtomicBool::new(false),
        }
    }

    /// Provider identifier for diagnostics.
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.base_url
    }

    /// Whether the last call failed.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Verify connectivity by embedding a probe string.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Embeddings`] when the service is
    /// unreachable.
    pub async fn initialize(&self) -> RetrievalResult<()> {
        self.embed("connectivity probe").await?;
        info!(provider = %self.base_url, model = %self.model, "embeddings client ready");
        Ok(())
    }

    /// Embed one text.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError`] on transport failure or a malformed
    /// response.
    pub async fn embed(&self, text: &str) -> RetrievalResult<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({"model": self.model, "prompt": text}))
            .send()
            .await
            .map_err(|e| {
                self.degraded.store(true, Ordering::Relaxed);
                RetrievalError::Embeddings(e.to_string())
            })?;

        if !response.status().is_success() {
            self.degraded.store(true, Ordering::Relaxed);
            return Err(RetrievalError::Embeddings(format!(
                "HTTP {} from {url}",
                response.status()
            )));
        }

        let parsed: EmbeddingsResponse = response.json().await.map_err(|e| {
            self.degraded.store(true, Ordering::Relaxed);
            RetrievalError::EmbeddingsShape(e.to_string())
        })?;
        if parsed.embedding.is_empty() {
            return Err(RetrievalError::EmbeddingsShape(
                "empty embedding".to_string(),
            ));
        }
        self.degraded.store(false, Ordering::Relaxed);
        Ok(parsed.embedding)
    }

    /// Embed a batch of texts sequentially. All-or-nothing: the first
    /// failure aborts the batch and drops the partial work.
    ///
    /// # Errors
    ///
    /// Returns the first embedding failure.
    pub async fn embed_batch(&self, texts: &[String]) -> RetrievalResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            match self.embed(text).await {
                Ok(v) => out.push(v),
                Err(e) => {
                    warn!(error = %e, "batch embedding aborted");
                    return Err(e);
                }
            }
        }
        Ok(out)
    }
}
