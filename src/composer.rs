//! Answer composition: prompt assembly, streamed generation, citation
//! validation, and the ordered event stream.
//!
//! A response walks a fixed state machine: planning → retrieving →
//! streaming → validating → emitting citations → emitting metrics → done.
//! An error before any text was produced aborts with a single `Error` event
//! followed by `Done`; once streaming has begun, failures degrade the
//! response but always finalize it cleanly — `citations` covers whatever
//! text arrived, `metrics.degraded` carries the signal, and the event order
//! `text* citations metrics done` holds for every normal termination.
//!
//! Cancellation is observed as the receiver side of the event channel going
//! away: every send is checked, and the first failed send stops the
//! response without emitting anything further. Dropping the LLM token
//! receiver in turn closes the upstream connection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::citations::{self, CitationMatch};
use crate::config::GenerationConfig;
use crate::error::RagError;
use crate::gateway::{LlmClient, LlmStreamItem, TokenUsage};
use crate::models::{
    ChatMessage, ChunkMetadata, CitationDto, RagEvent, ResponseMetrics, RetrievalResult,
};
use crate::planner::QueryPlanner;
use crate::prompts;
use crate::retriever::Retriever;
use crate::tokenizer;

pub struct AnswerComposer {
    planner: Arc<QueryPlanner>,
    retriever: Arc<Retriever>,
    llm: Arc<dyn LlmClient>,
    generation: GenerationConfig,
}

impl AnswerComposer {
    pub fn new(
        planner: Arc<QueryPlanner>,
        retriever: Arc<Retriever>,
        llm: Arc<dyn LlmClient>,
        generation: GenerationConfig,
    ) -> Self {
        Self {
            planner,
            retriever,
            llm,
            generation,
        }
    }

    /// Start a response. Events arrive on the returned channel in the order
    /// guaranteed by the module docs; dropping the receiver cancels the
    /// response at its next suspension point.
    pub fn answer(&self, question: String, history: Vec<ChatMessage>) -> mpsc::Receiver<RagEvent> {
        let (tx, rx) = mpsc::channel(64);
        let planner = Arc::clone(&self.planner);
        let retriever = Arc::clone(&self.retriever);
        let llm = Arc::clone(&self.llm);
        let generation = self.generation.clone();

        tokio::spawn(async move {
            run_response(planner, retriever, llm, generation, question, history, tx).await;
        });

        rx
    }
}

async fn run_response(
    planner: Arc<QueryPlanner>,
    retriever: Arc<Retriever>,
    llm: Arc<dyn LlmClient>,
    generation: GenerationConfig,
    question: String,
    history: Vec<ChatMessage>,
    tx: mpsc::Sender<RagEvent>,
) {
    let started = Instant::now();

    // PLANNING
    let plan = match planner.plan(&question).await {
        Ok(plan) => plan,
        Err(e) => {
            abort(&tx, e).await;
            return;
        }
    };

    // RETRIEVING
    let retrieval = match retriever.retrieve(&question, &plan.query_vector).await {
        Ok(retrieval) => retrieval,
        Err(e) => {
            abort(&tx, e).await;
            return;
        }
    };
    let mut degraded = plan.degraded || retrieval.degraded;

    if retrieval.chunks.is_empty() {
        no_context_response(&tx, started, degraded).await;
        return;
    }

    let messages = prompts::build_messages(
        &question,
        &history,
        &retrieval.chunks,
        generation.history_turns,
    );
    let estimated_input = tokenizer::count_message_tokens(&messages);

    // STREAMING
    let mut llm_rx = match llm
        .stream(
            &messages,
            generation.temperature_answer,
            generation.max_tokens,
        )
        .await
    {
        Ok(rx) => rx,
        Err(e) => {
            abort(&tx, e).await;
            return;
        }
    };

    let mut full_text = String::new();
    let mut pending = String::new();
    let mut usage: Option<TokenUsage> = None;

    while let Some(item) = llm_rx.recv().await {
        match item {
            LlmStreamItem::Token(token) => {
                full_text.push_str(&token);
                pending.push_str(&token);
                // Withhold a tail that could still become a citation marker
                // so sentinels are never split across events.
                let hold = citations::hold_back_len(&pending);
                let emit_len = pending.len() - hold;
                if emit_len > 0 {
                    let emit: String = pending.drain(..emit_len).collect();
                    if tx.send(RagEvent::Text(emit)).await.is_err() {
                        info!("response cancelled mid-stream");
                        return;
                    }
                }
            }
            LlmStreamItem::Usage(reported) => usage = Some(reported),
            LlmStreamItem::Truncated(reason) => {
                warn!(reason = %reason, "generation stream truncated");
                degraded = true;
                break;
            }
        }
    }
    drop(llm_rx);

    if !pending.is_empty() {
        let rest = std::mem::take(&mut pending);
        if tx.send(RagEvent::Text(rest)).await.is_err() {
            info!("response cancelled mid-stream");
            return;
        }
    }

    // VALIDATING
    let (valid, invalid_citations, fuzzy_count) =
        validate_citations(&full_text, &retrieval, generation.fuzzy_accept);
    if !invalid_citations.is_empty() {
        warn!(
            invalid = invalid_citations.len(),
            "citations failed grounding validation"
        );
        if generation.strict_citations {
            degraded = true;
        }
    }
    if fuzzy_count > 0 {
        debug!(fuzzy = fuzzy_count, "citations accepted by fuzzy match");
    }

    // EMITTING_CITATIONS
    let citations_count = valid.len();
    if tx
        .send(RagEvent::Citations {
            citations: valid,
            invalid_citations,
        })
        .await
        .is_err()
    {
        return;
    }

    // EMITTING_METRICS
    let (input_tokens, output_tokens) = match usage {
        Some(u) => (u.input_tokens, u.output_tokens),
        None => (
            estimated_input as u64,
            tokenizer::count_tokens(&full_text) as u64,
        ),
    };
    let average_normalized_score = if retrieval.chunks.is_empty() {
        0.0
    } else {
        retrieval.chunks.iter().map(|c| c.score).sum::<f64>() / retrieval.chunks.len() as f64
    };
    let metrics = ResponseMetrics {
        tokens_used: input_tokens + output_tokens,
        input_tokens,
        output_tokens,
        estimated_cost: estimate_cost(&generation, input_tokens, output_tokens),
        citations_count,
        average_normalized_score,
        latency_ms: started.elapsed().as_millis() as u64,
        degraded,
    };
    if tx.send(RagEvent::Metrics(metrics)).await.is_err() {
        return;
    }

    let _ = tx.send(RagEvent::Done).await;
}

/// Abort before any text: one error event, then done.
async fn abort(tx: &mpsc::Sender<RagEvent>, error: RagError) {
    warn!(error = %error, "response failed before streaming");
    if tx.send(RagEvent::Error(error.to_string())).await.is_err() {
        return;
    }
    let _ = tx.send(RagEvent::Done).await;
}

async fn no_context_response(tx: &mpsc::Sender<RagEvent>, started: Instant, degraded: bool) {
    if tx
        .send(RagEvent::Text(prompts::NO_CONTEXT_ANSWER.to_string()))
        .await
        .is_err()
    {
        return;
    }
    if tx
        .send(RagEvent::Citations {
            citations: Vec::new(),
            invalid_citations: Vec::new(),
        })
        .await
        .is_err()
    {
        return;
    }
    let metrics = ResponseMetrics {
        tokens_used: 0,
        input_tokens: 0,
        output_tokens: 0,
        estimated_cost: 0.0,
        citations_count: 0,
        average_normalized_score: 0.0,
        latency_ms: started.elapsed().as_millis() as u64,
        degraded,
    };
    if tx.send(RagEvent::Metrics(metrics)).await.is_err() {
        return;
    }
    let _ = tx.send(RagEvent::Done).await;
}

/// Check every citation in the generated text against its referenced
/// passage. Returns the valid citation DTOs (one per referenced passage,
/// ordered by identifier), the invalid spans, and the fuzzy-accept count.
fn validate_citations(
    text: &str,
    retrieval: &RetrievalResult,
    fuzzy_accept: f64,
) -> (Vec<CitationDto>, Vec<String>, usize) {
    let mut valid: BTreeMap<usize, CitationDto> = BTreeMap::new();
    let mut invalid: Vec<String> = Vec::new();
    let mut fuzzy_count = 0;

    for citation in citations::extract_citations(text) {
        let Some(scored) = retrieval.chunks.get(citation.id - 1) else {
            invalid.push(citation.span);
            continue;
        };
        match citations::validate_span(&citation.span, &scored.chunk.content, fuzzy_accept) {
            CitationMatch::Invalid => invalid.push(citation.span),
            matched => {
                if matches!(matched, CitationMatch::Fuzzy(_)) {
                    fuzzy_count += 1;
                }
                valid.entry(citation.id).or_insert_with(|| CitationDto {
                    id: format!("C{}", citation.id),
                    text: citation.span.clone(),
                    source: source_label(&scored.chunk.metadata),
                    url: Some(format!("/documents/{}", scored.chunk.document_id)),
                });
            }
        }
    }

    (valid.into_values().collect(), invalid, fuzzy_count)
}

fn source_label(meta: &ChunkMetadata) -> String {
    match &meta.section {
        Some(section) => format!("{}, p.{}, §{}", meta.document_name, meta.page, section),
        None => format!("{}, p.{}", meta.document_name, meta.page),
    }
}

fn estimate_cost(generation: &GenerationConfig, input_tokens: u64, output_tokens: u64) -> f64 {
    input_tokens as f64 / 1_000_000.0 * generation.input_price_per_1m
        + output_tokens as f64 / 1_000_000.0 * generation.output_price_per_1m
}
