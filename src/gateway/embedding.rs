//! Embedding gateway: batches of text in, fixed-dimension vectors out.
//!
//! Speaks the OpenAI-compatible `POST /embeddings` wire format. Oversized
//! batches are sub-batched internally; transient failures (HTTP 429, 5xx,
//! transport errors) are retried with exponential backoff before surfacing
//! a single `EmbeddingUnavailable`.

use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

use crate::config::EmbeddingGatewayConfig;
use crate::error::{RagError, Result};

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed a batch of texts, returning one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// The embedding dimension every returned vector has.
    fn dims(&self) -> usize;
}

pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    config: EmbeddingGatewayConfig,
}

impl HttpEmbeddingClient {
    pub fn new(config: EmbeddingGatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::Config(e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model,
            "input": texts,
        });

        let mut last_err: Option<String> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(super::backoff_delay(attempt)).await;
            }

            let mut request = self.client.post(&url).json(&body);
            if let Some(key) = &self.config.api_key {
                request = request.bearer_auth(key);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| RagError::EmbeddingUnavailable(e.to_string()))?;
                        return self.parse_response(&json, texts.len());
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let detail = response.text().await.unwrap_or_default();
                        warn!(status = %status, attempt, "embedding request retryable failure");
                        last_err = Some(format!("HTTP {}: {}", status, detail));
                        continue;
                    }
                    // Client error: retrying will not help.
                    let detail = response.text().await.unwrap_or_default();
                    return Err(RagError::EmbeddingUnavailable(format!(
                        "HTTP {}: {}",
                        status, detail
                    )));
                }
                Err(e) => {
                    warn!(error = %e, attempt, "embedding request transport failure");
                    last_err = Some(e.to_string());
                    continue;
                }
            }
        }

        Err(RagError::EmbeddingUnavailable(
            last_err.unwrap_or_else(|| "retries exhausted".to_string()),
        ))
    }

    fn parse_response(&self, json: &serde_json::Value, expected: usize) -> Result<Vec<Vec<f32>>> {
        let data = json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| {
                RagError::EmbeddingUnavailable("response missing data array".to_string())
            })?;

        let mut vectors: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
        for (position, item) in data.iter().enumerate() {
            let index = item
                .get("index")
                .and_then(|i| i.as_u64())
                .map(|i| i as usize)
                .unwrap_or(position);
            let values = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| {
                    RagError::EmbeddingUnavailable("response item missing embedding".to_string())
                })?;
            let vector: Vec<f32> = values
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            if vector.len() != self.config.dims {
                return Err(RagError::EmbeddingUnavailable(format!(
                    "model returned {} dimensions, expected {}",
                    vector.len(),
                    self.config.dims
                )));
            }
            vectors.push((index, vector));
        }

        if vectors.len() != expected {
            return Err(RagError::EmbeddingUnavailable(format!(
                "model returned {} vectors for {} inputs",
                vectors.len(),
                expected
            )));
        }

        vectors.sort_by_key(|(index, _)| *index);
        Ok(vectors.into_iter().map(|(_, v)| v).collect())
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size) {
            out.extend(self.embed_batch(batch).await?);
        }
        Ok(out)
    }

    fn dims(&self) -> usize {
        self.config.dims
    }
}
