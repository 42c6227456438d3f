//! Retrieval: ANN recall, cross-encoder reranking, thresholding, and
//! per-document diversity selection.
//!
//! The two score scales are kept strictly apart: `RERANK_THRESHOLD` applies
//! only to min-max normalized cross-encoder scores, and the separate
//! `SIMILARITY_THRESHOLD` applies only to raw cosine similarity when the
//! reranker is unavailable. Reranker failure never blocks retrieval; the
//! result is flagged degraded and vector scores carry the ranking.
//!
//! Final ordering is deterministic: normalized score descending, then ANN
//! similarity descending, then `(document_id, chunk_index)`.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::config::RetrievalConfig;
use crate::error::{RagError, Result};
use crate::gateway::RerankClient;
use crate::models::{Chunk, RetrievalResult, ScoredChunk, StageTimings};
use crate::store::ChunkStore;

/// Budget for the ANN query.
const ANN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Retriever {
    store: Arc<ChunkStore>,
    reranker: Option<Arc<dyn RerankClient>>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        store: Arc<ChunkStore>,
        reranker: Option<Arc<dyn RerankClient>>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            reranker,
            config,
        }
    }

    pub async fn retrieve(&self, question: &str, query_vector: &[f32]) -> Result<RetrievalResult> {
        let mut timings = StageTimings::default();
        let mut degraded = false;

        // Stage 1: candidate recall.
        let recall_started = Instant::now();
        let candidates: Vec<(Chunk, f64)> = tokio::time::timeout(
            ANN_TIMEOUT,
            self.store.knn(query_vector, self.config.initial_top_k),
        )
        .await
        .map_err(|_| RagError::StorageUnavailable("ANN query timed out".to_string()))??;
        timings.recall_ms = recall_started.elapsed().as_millis() as u64;

        if candidates.is_empty() {
            return Ok(RetrievalResult {
                chunks: Vec::new(),
                degraded: false,
                timings,
            });
        }

        // Stage 2: reranking, with cosine fallback.
        let rerank_started = Instant::now();
        let mut scored = match &self.reranker {
            Some(reranker) => {
                let passages: Vec<String> =
                    candidates.iter().map(|(c, _)| c.content.clone()).collect();
                match reranker.rerank(question, &passages).await {
                    Ok(raw_scores) => {
                        let normalized = normalize_scores(&raw_scores);
                        candidates
                            .into_iter()
                            .zip(normalized)
                            .map(|((chunk, similarity), score)| ScoredChunk {
                                chunk,
                                score,
                                similarity,
                            })
                            .collect()
                    }
                    Err(e) => {
                        warn!(error = %e, "reranker unavailable, falling back to vector scores");
                        degraded = true;
                        similarity_scored(candidates)
                    }
                }
            }
            None => {
                degraded = true;
                similarity_scored(candidates)
            }
        };
        timings.rerank_ms = rerank_started.elapsed().as_millis() as u64;

        // Stage 3: thresholding. The two thresholds live on different
        // scales and are never interchanged.
        let select_started = Instant::now();
        sort_by_rank(&mut scored);
        let threshold_kind = if degraded {
            self.config.similarity_threshold
        } else {
            self.config.rerank_threshold
        };
        let kept: Vec<ScoredChunk> = if degraded {
            scored
                .iter()
                .filter(|c| c.similarity >= threshold_kind)
                .cloned()
                .collect()
        } else {
            scored
                .iter()
                .filter(|c| c.score >= threshold_kind)
                .cloned()
                .collect()
        };
        let mut ranked = if kept.is_empty() {
            // Never return nothing when recall produced candidates.
            degraded = true;
            vec![scored[0].clone()]
        } else {
            kept
        };

        // Stage 4: selection, optionally diversity-aware.
        let selected = if self.config.enforce_diversity {
            select_diverse(&ranked, self.config.top_k_results, self.config.max_per_doc)
        } else {
            ranked.truncate(self.config.top_k_results);
            ranked
        };
        timings.select_ms = select_started.elapsed().as_millis() as u64;

        Ok(RetrievalResult {
            chunks: selected,
            degraded,
            timings,
        })
    }
}

/// Min-max normalize raw reranker scores to [0, 1]. A constant batch maps
/// to all ones.
pub fn normalize_scores(raw: &[f64]) -> Vec<f64> {
    let min = raw.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = raw.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !min.is_finite() || !max.is_finite() || (max - min).abs() < f64::EPSILON {
        return vec![1.0; raw.len()];
    }
    raw.iter().map(|s| (s - min) / (max - min)).collect()
}

fn similarity_scored(candidates: Vec<(Chunk, f64)>) -> Vec<ScoredChunk> {
    candidates
        .into_iter()
        .map(|(chunk, similarity)| ScoredChunk {
            chunk,
            score: similarity,
            similarity,
        })
        .collect()
}

/// Deterministic rank order: score desc, similarity desc, then
/// `(document_id, chunk_index)`.
pub fn sort_by_rank(chunks: &mut [ScoredChunk]) {
    chunks.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.chunk.document_id.cmp(&b.chunk.document_id))
            .then(a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
    });
}

/// Two-pass greedy diversity selection over rank-ordered candidates.
///
/// Pass A takes one chunk from each distinct document in rank order; pass B
/// fills the remainder, capping each document at `max_per_doc`. The
/// selection is returned in rank order.
pub fn select_diverse(
    ranked: &[ScoredChunk],
    top_k: usize,
    max_per_doc: usize,
) -> Vec<ScoredChunk> {
    use std::collections::{HashMap, HashSet};

    let mut picked: Vec<usize> = Vec::new();
    let mut picked_set: HashSet<usize> = HashSet::new();
    let mut per_doc: HashMap<uuid::Uuid, usize> = HashMap::new();

    // Pass A: breadth across documents.
    for (i, candidate) in ranked.iter().enumerate() {
        if picked.len() >= top_k {
            break;
        }
        let doc = candidate.chunk.document_id;
        if !per_doc.contains_key(&doc) {
            per_doc.insert(doc, 1);
            picked.push(i);
            picked_set.insert(i);
        }
    }

    // Pass B: depth within the per-document cap.
    for (i, candidate) in ranked.iter().enumerate() {
        if picked.len() >= top_k {
            break;
        }
        if picked_set.contains(&i) {
            continue;
        }
        let doc = candidate.chunk.document_id;
        let count = per_doc.entry(doc).or_insert(0);
        if *count < max_per_doc {
            *count += 1;
            picked.push(i);
            picked_set.insert(i);
        }
    }

    picked.sort_unstable();
    picked.into_iter().map(|i| ranked[i].clone()).collect()
}
