//! LLM gateway: short synchronous completions and streamed generation.
//!
//! Speaks the OpenAI-compatible `/chat/completions` wire format. Streaming
//! reads the SSE body incrementally (a line buffer over `bytes_stream`) and
//! forwards token deltas through a bounded channel; dropping the receiver
//! cancels the forwarding task, which closes the upstream connection at the
//! next suspension.
//!
//! Failure split: an error before any token is produced surfaces as
//! `LlmUnavailable` from `stream()` itself; once streaming has begun, a
//! mid-stream error terminates the channel with [`LlmStreamItem::Truncated`]
//! and the caller finalizes the response cleanly.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::LlmGatewayConfig;
use crate::error::{RagError, Result};
use crate::models::{ChatMessage, Role};

/// Token accounting reported by the model, when available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One element of the model's output stream.
#[derive(Debug, Clone)]
pub enum LlmStreamItem {
    Token(String),
    Usage(TokenUsage),
    /// The stream ended prematurely; no further items follow.
    Truncated(String),
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One-shot completion for short prompts (query expansion).
    async fn complete_short(
        &self,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String>;

    /// Start a streamed completion. Returns once headers are in; the body
    /// is forwarded through the channel as it arrives.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<mpsc::Receiver<LlmStreamItem>>;
}

pub struct HttpLlmClient {
    short_client: reqwest::Client,
    stream_client: reqwest::Client,
    config: LlmGatewayConfig,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn messages_to_json(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": role_str(m.role),
                "content": m.content,
            })
        })
        .collect()
}

/// Parse a single SSE data line. Returns the payload JSON, or `None` for
/// blanks, comments, and the `[DONE]` terminator.
fn parse_sse_line(line: &str) -> Option<serde_json::Value> {
    let data = line.strip_prefix("data: ")?;
    if data == "[DONE]" {
        return None;
    }
    serde_json::from_str(data).ok()
}

fn delta_content(data: &serde_json::Value) -> Option<&str> {
    data.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
}

fn usage_from(data: &serde_json::Value) -> Option<TokenUsage> {
    let usage = data.get("usage")?;
    if usage.is_null() {
        return None;
    }
    Some(TokenUsage {
        input_tokens: usage.get("prompt_tokens").and_then(|t| t.as_u64())?,
        output_tokens: usage
            .get("completion_tokens")
            .and_then(|t| t.as_u64())
            .unwrap_or(0),
    })
}

impl HttpLlmClient {
    pub fn new(config: LlmGatewayConfig) -> Result<Self> {
        let short_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.short_timeout_secs))
            .build()
            .map_err(|e| RagError::Config(e.to_string()))?;
        // The stream timeout bounds the whole response body, which is what
        // the total-stream budget requires.
        let stream_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.stream_timeout_secs))
            .build()
            .map_err(|e| RagError::Config(e.to_string()))?;
        Ok(Self {
            short_client,
            stream_client,
            config,
        })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn parse_short_response(json: &serde_json::Value) -> Result<String> {
        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| RagError::LlmUnavailable("no content in completion".to_string()))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete_short(
        &self,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": temperature,
            "max_tokens": max_tokens,
            "stream": false,
        });

        debug!(model = %self.config.model, "short completion request");

        let response = self
            .authorize(self.short_client.post(self.completions_url()))
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::LlmUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RagError::LlmUnavailable(format!(
                "HTTP {}: {}",
                status, detail
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RagError::LlmUnavailable(e.to_string()))?;
        Self::parse_short_response(&json)
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<mpsc::Receiver<LlmStreamItem>> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": messages_to_json(messages),
            "temperature": temperature,
            "max_tokens": max_tokens,
            "stream": true,
            "stream_options": {"include_usage": true},
        });

        debug!(model = %self.config.model, "streaming completion request");

        let response = self
            .authorize(self.stream_client.post(self.completions_url()))
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::LlmUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RagError::LlmUnavailable(format!(
                "HTTP {}: {}",
                status, detail
            )));
        }

        let (tx, rx) = mpsc::channel::<LlmStreamItem>(64);

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut line_buffer = String::new();

            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = match chunk_result {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(error = %e, "LLM stream read failure");
                        let _ = tx.send(LlmStreamItem::Truncated(e.to_string())).await;
                        return;
                    }
                };

                line_buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = line_buffer.find('\n') {
                    let line: String = line_buffer.drain(..=newline).collect();
                    let line = line.trim();
                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }
                    if let Some(data) = parse_sse_line(line) {
                        if let Some(usage) = usage_from(&data) {
                            if tx.send(LlmStreamItem::Usage(usage)).await.is_err() {
                                // Receiver gone: the request was cancelled.
                                return;
                            }
                        }
                        if let Some(content) = delta_content(&data) {
                            if !content.is_empty()
                                && tx
                                    .send(LlmStreamItem::Token(content.to_string()))
                                    .await
                                    .is_err()
                            {
                                return;
                            }
                        }
                    }
                }
            }

            // Trailing data without a final newline.
            let rest = line_buffer.trim().to_string();
            if let Some(data) = parse_sse_line(&rest) {
                if let Some(usage) = usage_from(&data) {
                    let _ = tx.send(LlmStreamItem::Usage(usage)).await;
                }
                if let Some(content) = delta_content(&data) {
                    if !content.is_empty() {
                        let _ = tx.send(LlmStreamItem::Token(content.to_string())).await;
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_delta_line() {
        let line = r#"data: {"id":"c1","choices":[{"delta":{"content":"Hello"}}]}"#;
        let data = parse_sse_line(line).unwrap();
        assert_eq!(delta_content(&data), Some("Hello"));
    }

    #[test]
    fn done_marker_is_not_data() {
        assert!(parse_sse_line("data: [DONE]").is_none());
    }

    #[test]
    fn non_data_lines_are_skipped() {
        assert!(parse_sse_line("event: ping").is_none());
        assert!(parse_sse_line("").is_none());
    }

    #[test]
    fn parses_usage_chunk() {
        let line = r#"data: {"choices":[],"usage":{"prompt_tokens":120,"completion_tokens":45}}"#;
        let data = parse_sse_line(line).unwrap();
        let usage = usage_from(&data).unwrap();
        assert_eq!(usage.input_tokens, 120);
        assert_eq!(usage.output_tokens, 45);
    }

    #[test]
    fn null_usage_is_ignored() {
        let line = r#"data: {"choices":[{"delta":{"content":"x"}}],"usage":null}"#;
        let data = parse_sse_line(line).unwrap();
        assert!(usage_from(&data).is_none());
    }

    #[test]
    fn parses_short_completion() {
        let json = serde_json::json!({
            "choices": [{"message": {"content": "A hypothetical passage."}}]
        });
        assert_eq!(
            HttpLlmClient::parse_short_response(&json).unwrap(),
            "A hypothetical passage."
        );
    }

    #[test]
    fn short_completion_without_content_fails() {
        let json = serde_json::json!({"choices": []});
        assert!(matches!(
            HttpLlmClient::parse_short_response(&json),
            Err(RagError::LlmUnavailable(_))
        ));
    }

    #[test]
    fn messages_serialize_with_roles() {
        let messages = vec![
            ChatMessage {
                role: Role::System,
                content: "policy".to_string(),
            },
            ChatMessage {
                role: Role::User,
                content: "question".to_string(),
            },
        ];
        let json = messages_to_json(&messages);
        assert_eq!(json[0]["role"], "system");
        assert_eq!(json[1]["role"], "user");
    }
}
