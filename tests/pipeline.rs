//! End-to-end pipeline tests: ingestion through streamed, cited answers,
//! with the external model services replaced by deterministic stubs.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use regstack::composer::AnswerComposer;
use regstack::config::{
    ChunkingConfig, Config, EmbeddingGatewayConfig, GenerationConfig, LlmGatewayConfig,
    RerankerGatewayConfig, RetrievalConfig, UploadConfig,
};
use regstack::error::Result;
use regstack::gateway::{EmbeddingClient, LlmClient, LlmStreamItem, RerankClient, TokenUsage};
use regstack::ingest::IngestionCoordinator;
use regstack::models::{ChatMessage, DocumentClass, RagEvent};
use regstack::planner::QueryPlanner;
use regstack::retriever::Retriever;
use regstack::store::ChunkStore;

const DIMS: usize = 8;

fn config(storage: PathBuf) -> Config {
    Config {
        db_path: PathBuf::from(":memory:"),
        storage_path: storage,
        bind_addr: "127.0.0.1:8000".to_string(),
        chunking: ChunkingConfig {
            chunk_size_tokens: 256,
            chunk_overlap_tokens: 32,
            chunk_min_tokens: 1,
        },
        retrieval: RetrievalConfig {
            initial_top_k: 20,
            top_k_results: 5,
            max_per_doc: 3,
            enforce_diversity: true,
            rerank_threshold: 0.05,
            similarity_threshold: 0.0,
        },
        generation: GenerationConfig {
            temperature_answer: 0.3,
            temperature_expand: 0.7,
            max_tokens: 1500,
            input_price_per_1m: 0.15,
            output_price_per_1m: 0.60,
            fuzzy_accept: 0.90,
            strict_citations: true,
            history_turns: 4,
        },
        upload: UploadConfig {
            max_upload_mb: 50,
            allowed_extensions: vec!["pdf".into(), "docx".into(), "txt".into()],
        },
        embedding: EmbeddingGatewayConfig {
            base_url: String::new(),
            api_key: None,
            model: "stub".to_string(),
            dims: DIMS,
            batch_size: 32,
            max_retries: 0,
            timeout_secs: 1,
        },
        reranker: RerankerGatewayConfig {
            url: None,
            timeout_secs: 1,
        },
        llm: LlmGatewayConfig {
            base_url: String::new(),
            api_key: None,
            model: "stub".to_string(),
            short_timeout_secs: 1,
            stream_timeout_secs: 1,
        },
    }
}

/// Deterministic bag-of-bytes embedder: similar texts land close together,
/// and repeated runs produce identical vectors.
struct HashEmbedder;

#[async_trait]
impl EmbeddingClient for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; DIMS];
                for (i, b) in text.to_lowercase().bytes().enumerate() {
                    v[(b as usize + i) % DIMS] += (b % 17) as f32;
                }
                v
            })
            .collect())
    }

    fn dims(&self) -> usize {
        DIMS
    }
}

struct IdentityReranker;

#[async_trait]
impl RerankClient for IdentityReranker {
    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<f64>> {
        // Score by shared word count with the query.
        let query_words: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(|w| w.to_string())
            .collect();
        Ok(passages
            .iter()
            .map(|p| {
                let lower = p.to_lowercase();
                query_words.iter().filter(|w| lower.contains(*w)).count() as f64
            })
            .collect())
    }
}

struct ScriptedLlm {
    tokens: Vec<String>,
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete_short(&self, _: &str, _: f32, _: u32) -> Result<String> {
        Ok("Institutions shall maintain a common equity tier one capital ratio of at \
            least the prescribed minimum at all times."
            .to_string())
    }

    async fn stream(
        &self,
        _: &[ChatMessage],
        _: f32,
        _: u32,
    ) -> Result<mpsc::Receiver<LlmStreamItem>> {
        let (tx, rx) = mpsc::channel(64);
        let tokens = self.tokens.clone();
        tokio::spawn(async move {
            for token in tokens {
                if tx.send(LlmStreamItem::Token(token)).await.is_err() {
                    return;
                }
            }
            let _ = tx
                .send(LlmStreamItem::Usage(TokenUsage {
                    input_tokens: 300,
                    output_tokens: 80,
                }))
                .await;
        });
        Ok(rx)
    }
}

const CORPUS: &str = "ARTICLE 92\nInstitutions shall at all times satisfy the following \
own funds requirements. The minimum CET1 ratio is 4.5%. The minimum tier one capital \
ratio is 6%. The minimum total capital ratio is 8%.\n\nARTICLE 93\nThe initial capital \
of an institution shall be no less than the amount required at authorisation.";

struct Pipeline {
    store: Arc<ChunkStore>,
    ingestion: IngestionCoordinator,
    composer: AnswerComposer,
    _tmp: tempfile::TempDir,
}

async fn build_pipeline(answer_tokens: Vec<String>) -> Pipeline {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = Arc::new(config(tmp.path().to_path_buf()));
    let store = Arc::new(ChunkStore::open_in_memory(DIMS).await.unwrap());
    let embedder: Arc<dyn EmbeddingClient> = Arc::new(HashEmbedder);
    let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm {
        tokens: answer_tokens,
    });

    let ingestion = IngestionCoordinator::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&embedder),
    );
    let planner = Arc::new(QueryPlanner::new(
        Arc::clone(&llm),
        Arc::clone(&embedder),
        &config.generation,
    ));
    let retriever = Arc::new(Retriever::new(
        Arc::clone(&store),
        Some(Arc::new(IdentityReranker)),
        config.retrieval.clone(),
    ));
    let composer = AnswerComposer::new(planner, retriever, llm, config.generation.clone());

    Pipeline {
        store,
        ingestion,
        composer,
        _tmp: tmp,
    }
}

async fn collect(mut rx: mpsc::Receiver<RagEvent>) -> Vec<RagEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn ingest_then_answer_with_grounded_citation() {
    let pipeline = build_pipeline(vec![
        "Under the own funds framework, ".to_string(),
        "[CITE:C1]The minimum CET1 ratio is 4.5%.[/CITE]".to_string(),
        " Higher tiers build on this floor.".to_string(),
    ])
    .await;

    let document = pipeline
        .ingestion
        .ingest(CORPUS.as_bytes().to_vec(), "crr.txt", DocumentClass::Regulation)
        .await
        .unwrap();
    assert!(pipeline.store.count_chunks().await.unwrap() >= 1);

    let events = collect(
        pipeline
            .composer
            .answer("What is the minimum CET1 ratio?".to_string(), vec![]),
    )
    .await;

    // Ordered shape: text events, then citations, metrics, done.
    let mut saw_text = false;
    let mut tail = Vec::new();
    for event in &events {
        match event {
            RagEvent::Text(_) => {
                assert!(tail.is_empty(), "text after terminal events");
                saw_text = true;
            }
            RagEvent::Citations { .. } => tail.push("citations"),
            RagEvent::Metrics(_) => tail.push("metrics"),
            RagEvent::Done => tail.push("done"),
            RagEvent::Error(e) => panic!("unexpected error event: {}", e),
        }
    }
    assert!(saw_text);
    assert_eq!(tail, vec!["citations", "metrics", "done"]);

    let Some(RagEvent::Citations { citations, invalid_citations }) = events
        .iter()
        .find(|e| matches!(e, RagEvent::Citations { .. }))
    else {
        panic!("no citations event");
    };
    assert!(invalid_citations.is_empty());
    assert_eq!(citations.len(), 1);
    assert_eq!(citations[0].text, "The minimum CET1 ratio is 4.5%.");
    assert!(citations[0].source.starts_with("crr.txt, p."));
    assert_eq!(
        citations[0].url.as_deref(),
        Some(format!("/documents/{}", document.id).as_str())
    );

    let Some(RagEvent::Metrics(metrics)) =
        events.iter().find(|e| matches!(e, RagEvent::Metrics(_)))
    else {
        panic!("no metrics event");
    };
    assert!(!metrics.degraded);
    assert_eq!(metrics.citations_count, 1);
    assert_eq!(metrics.tokens_used, 380);
}

#[tokio::test]
async fn retrieval_is_deterministic_on_a_frozen_store() {
    let pipeline = build_pipeline(vec!["unused".to_string()]).await;
    pipeline
        .ingestion
        .ingest(CORPUS.as_bytes().to_vec(), "crr.txt", DocumentClass::Regulation)
        .await
        .unwrap();

    let embedder = HashEmbedder;
    let query = embedder
        .embed(&["own funds requirements".to_string()])
        .await
        .unwrap()
        .remove(0);

    let retriever = Retriever::new(
        Arc::clone(&pipeline.store),
        Some(Arc::new(IdentityReranker)),
        RetrievalConfig {
            initial_top_k: 20,
            top_k_results: 5,
            max_per_doc: 3,
            enforce_diversity: true,
            rerank_threshold: 0.05,
            similarity_threshold: 0.0,
        },
    );

    let first = retriever.retrieve("own funds", &query).await.unwrap();
    let second = retriever.retrieve("own funds", &query).await.unwrap();

    let ids = |r: &regstack::models::RetrievalResult| -> Vec<uuid::Uuid> {
        r.chunks.iter().map(|c| c.chunk.id).collect()
    };
    assert_eq!(ids(&first), ids(&second));
    assert!(!first.degraded);
}

#[tokio::test]
async fn delete_restores_pre_ingestion_counts() {
    let pipeline = build_pipeline(vec!["unused".to_string()]).await;

    let before_docs = pipeline.store.count_documents().await.unwrap();
    let before_chunks = pipeline.store.count_chunks().await.unwrap();

    let document = pipeline
        .ingestion
        .ingest(CORPUS.as_bytes().to_vec(), "crr.txt", DocumentClass::Document)
        .await
        .unwrap();
    assert!(pipeline.store.count_documents().await.unwrap() > before_docs);

    pipeline.ingestion.delete(document.id).await.unwrap();
    assert_eq!(pipeline.store.count_documents().await.unwrap(), before_docs);
    assert_eq!(pipeline.store.count_chunks().await.unwrap(), before_chunks);
}

#[tokio::test]
async fn two_ingestions_of_same_file_are_independent() {
    let pipeline = build_pipeline(vec!["unused".to_string()]).await;

    let a = pipeline
        .ingestion
        .ingest(CORPUS.as_bytes().to_vec(), "crr.txt", DocumentClass::Document)
        .await
        .unwrap();
    let b = pipeline
        .ingestion
        .ingest(CORPUS.as_bytes().to_vec(), "crr.txt", DocumentClass::Document)
        .await
        .unwrap();
    assert_ne!(a.id, b.id);

    let embedder = HashEmbedder;
    let query = embedder
        .embed(&["minimum CET1 ratio".to_string()])
        .await
        .unwrap()
        .remove(0);
    let hits = pipeline.store.knn(&query, 20).await.unwrap();
    let docs: std::collections::HashSet<uuid::Uuid> =
        hits.iter().map(|(c, _)| c.document_id).collect();
    assert!(docs.contains(&a.id));
    assert!(docs.contains(&b.id));
}

#[tokio::test]
async fn listing_returns_newest_first() {
    let pipeline = build_pipeline(vec!["unused".to_string()]).await;

    pipeline
        .ingestion
        .ingest(CORPUS.as_bytes().to_vec(), "first.txt", DocumentClass::Document)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    pipeline
        .ingestion
        .ingest(CORPUS.as_bytes().to_vec(), "second.txt", DocumentClass::Policy)
        .await
        .unwrap();

    let documents = pipeline.store.list_documents().await.unwrap();
    assert_eq!(documents.len(), 2);
    assert_eq!(documents[0].name, "second.txt");
    assert_eq!(documents[1].name, "first.txt");
}
