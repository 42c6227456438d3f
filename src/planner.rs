//! Query planning: hypothetical-document expansion plus query embedding.
//!
//! Embedding a bare question underperforms against formal, terminology-dense
//! corpora, so the planner first asks the LLM for a short hypothetical
//! passage written in the corpus register and embeds that instead. The
//! original question is kept by the caller for reranking and for the final
//! prompt. Expansion failure is not fatal: the raw question is embedded and
//! the plan is flagged degraded.

use std::sync::Arc;
use tracing::warn;

use crate::config::GenerationConfig;
use crate::error::Result;
use crate::gateway::{EmbeddingClient, LlmClient};
use crate::models::QueryPlan;
use crate::prompts;

/// Token budget for the hypothetical passage.
const EXPANSION_MAX_TOKENS: u32 = 250;

pub struct QueryPlanner {
    llm: Arc<dyn LlmClient>,
    embedder: Arc<dyn EmbeddingClient>,
    temperature_expand: f32,
}

impl QueryPlanner {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn EmbeddingClient>,
        generation: &GenerationConfig,
    ) -> Self {
        Self {
            llm,
            embedder,
            temperature_expand: generation.temperature_expand,
        }
    }

    pub async fn plan(&self, question: &str) -> Result<QueryPlan> {
        let (expanded_text, degraded) = match self
            .llm
            .complete_short(
                &prompts::expansion_prompt(question),
                self.temperature_expand,
                EXPANSION_MAX_TOKENS,
            )
            .await
        {
            Ok(text) if !text.trim().is_empty() => (text.trim().to_string(), false),
            Ok(_) => {
                warn!("query expansion returned empty text, embedding raw question");
                (question.to_string(), true)
            }
            Err(e) => {
                warn!(error = %e, "query expansion failed, embedding raw question");
                (question.to_string(), true)
            }
        };

        let vectors = self.embedder.embed(&[expanded_text.clone()]).await?;
        let query_vector = vectors.into_iter().next().unwrap_or_default();

        Ok(QueryPlan {
            expanded_text,
            query_vector,
            degraded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::error::RagError;
    use crate::gateway::LlmStreamItem;
    use crate::models::ChatMessage;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct StubLlm {
        expansion: Option<String>,
    }

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn complete_short(&self, _: &str, _: f32, _: u32) -> Result<String> {
            self.expansion
                .clone()
                .ok_or_else(|| RagError::LlmUnavailable("stub outage".to_string()))
        }

        async fn stream(
            &self,
            _: &[ChatMessage],
            _: f32,
            _: u32,
        ) -> Result<mpsc::Receiver<LlmStreamItem>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    struct StubEmbedder;

    #[async_trait]
    impl EmbeddingClient for StubEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }

        fn dims(&self) -> usize {
            2
        }
    }

    fn planner(expansion: Option<&str>) -> QueryPlanner {
        QueryPlanner::new(
            Arc::new(StubLlm {
                expansion: expansion.map(|s| s.to_string()),
            }),
            Arc::new(StubEmbedder),
            &test_config().generation,
        )
    }

    #[tokio::test]
    async fn expansion_becomes_the_query_surface() {
        let plan = planner(Some("Institutions shall hold CET1 capital of 4.5%."))
            .plan("What is the minimum CET1 ratio?")
            .await
            .unwrap();
        assert_eq!(
            plan.expanded_text,
            "Institutions shall hold CET1 capital of 4.5%."
        );
        assert!(!plan.degraded);
        assert_eq!(plan.query_vector.len(), 2);
    }

    #[tokio::test]
    async fn expansion_failure_falls_back_to_raw_question() {
        let plan = planner(None)
            .plan("What is the minimum CET1 ratio?")
            .await
            .unwrap();
        assert_eq!(plan.expanded_text, "What is the minimum CET1 ratio?");
        assert!(plan.degraded);
    }

    #[tokio::test]
    async fn empty_expansion_counts_as_failure() {
        let plan = planner(Some("   ")).plan("question").await.unwrap();
        assert_eq!(plan.expanded_text, "question");
        assert!(plan.degraded);
    }
}
