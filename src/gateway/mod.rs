//! Gateways to the external model services.
//!
//! Each gateway owns its retry policy and timeout; exhaustion surfaces one
//! categorical failure (`EmbeddingUnavailable`, `RerankerUnavailable`,
//! `LlmUnavailable`) to the caller. The traits exist so the pipeline can be
//! exercised against in-process stubs in tests.

mod embedding;
mod llm;
mod reranker;

pub use embedding::{EmbeddingClient, HttpEmbeddingClient};
pub use llm::{HttpLlmClient, LlmClient, LlmStreamItem, TokenUsage};
pub use reranker::{HttpRerankClient, RerankClient};

use std::time::Duration;

/// Exponential backoff delay for the given retry attempt (1-based):
/// 1s, 2s, 4s, capped at 32s.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1).min(5))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(10), Duration::from_secs(32));
    }
}
