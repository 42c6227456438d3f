//! Cross-encoder reranker gateway.
//!
//! Sends `(query, passages)` to a text-embeddings-inference style `/rerank`
//! endpoint and returns raw relevance scores in passage order. Raw scores
//! are real-valued and unbounded in sign; min-max normalization is the
//! retriever's responsibility. Retrieval is never blocked by this gateway:
//! the retriever falls back to vector scores on `RerankerUnavailable`.

use async_trait::async_trait;
use std::time::Duration;

use crate::config::RerankerGatewayConfig;
use crate::error::{RagError, Result};

#[async_trait]
pub trait RerankClient: Send + Sync {
    /// Score each passage against the query. Same length, same order as
    /// the input.
    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<f64>>;
}

pub struct HttpRerankClient {
    client: reqwest::Client,
    url: String,
}

impl HttpRerankClient {
    /// Returns `None` when no reranker endpoint is configured.
    pub fn from_config(config: &RerankerGatewayConfig) -> Result<Option<Self>> {
        let Some(url) = config.url.clone() else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::Config(e.to_string()))?;
        Ok(Some(Self { client, url }))
    }

    fn parse_response(json: &serde_json::Value, expected: usize) -> Result<Vec<f64>> {
        let results = json
            .as_array()
            .or_else(|| json.get("results").and_then(|r| r.as_array()))
            .ok_or_else(|| {
                RagError::RerankerUnavailable("response is not a result array".to_string())
            })?;

        if results.len() != expected {
            return Err(RagError::RerankerUnavailable(format!(
                "model returned {} scores for {} passages",
                results.len(),
                expected
            )));
        }

        let mut scores = vec![0.0f64; expected];
        for (position, item) in results.iter().enumerate() {
            let index = item
                .get("index")
                .and_then(|i| i.as_u64())
                .map(|i| i as usize)
                .unwrap_or(position);
            let score = item
                .get("score")
                .or_else(|| item.get("relevance_score"))
                .and_then(|s| s.as_f64())
                .ok_or_else(|| {
                    RagError::RerankerUnavailable("result item missing score".to_string())
                })?;
            if index >= expected {
                return Err(RagError::RerankerUnavailable(format!(
                    "result index {} out of range",
                    index
                )));
            }
            scores[index] = score;
        }
        Ok(scores)
    }
}

#[async_trait]
impl RerankClient for HttpRerankClient {
    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<f64>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "query": query,
            "texts": passages,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::RerankerUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RagError::RerankerUnavailable(format!(
                "HTTP {}: {}",
                status, detail
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RagError::RerankerUnavailable(e.to_string()))?;
        Self::parse_response(&json, passages.len())
    }
}
