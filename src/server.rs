//! HTTP server for document management and streaming chat.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/api/health` | Service health plus corpus counts |
//! | `POST` | `/api/documents/upload` | Multipart upload and synchronous ingestion |
//! | `GET` | `/api/documents/` | List all documents, newest first |
//! | `DELETE` | `/api/documents/{id}` | Delete a document and its chunks |
//! | `POST` | `/api/chat/stream` | Grounded answer as a Server-Sent-Events stream |
//!
//! # Event stream framing
//!
//! The chat stream carries four payload kinds on `data:` lines. Text
//! payloads are raw strings; because the SSE transport frames on newlines,
//! literal newlines inside text are encoded as `<<<LINE_BREAK>>>` and blank
//! lines as `<<<BLANK_LINE>>>` (the client decodes symmetrically). The
//! `citations`, `metrics`, and `error` payloads are compact JSON objects
//! tagged with a `type` field. A terminal `data: [DONE]` closes the stream.
//!
//! # Error contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "file has no extension" } }
//! ```

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::composer::AnswerComposer;
use crate::config::Config;
use crate::error::RagError;
use crate::gateway::{
    EmbeddingClient, HttpEmbeddingClient, HttpLlmClient, HttpRerankClient, LlmClient, RerankClient,
};
use crate::ingest::IngestionCoordinator;
use crate::models::{ChatMessage, DocumentClass, DocumentDto, RagEvent};
use crate::planner::QueryPlanner;
use crate::retriever::Retriever;
use crate::store::ChunkStore;
use crate::tokenizer;

/// Newline encoding sentinels for SSE text payloads.
const BLANK_LINE: &str = "<<<BLANK_LINE>>>";
const LINE_BREAK: &str = "<<<LINE_BREAK>>>";

/// Everything a request handler needs, cheaply cloneable.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<ChunkStore>,
    pub ingestion: Arc<IngestionCoordinator>,
    pub composer: Arc<AnswerComposer>,
}

impl AppState {
    /// Wire up the whole pipeline: store, gateways, planner, retriever,
    /// composer. Loads the tokenizer eagerly so the first request does not
    /// pay for it.
    pub async fn initialize(config: Config) -> anyhow::Result<AppState> {
        tokenizer::init();

        let config = Arc::new(config);
        let store = Arc::new(ChunkStore::open(&config.db_path, config.embedding.dims).await?);

        let embedder: Arc<dyn EmbeddingClient> =
            Arc::new(HttpEmbeddingClient::new(config.embedding.clone())?);
        let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(config.llm.clone())?);
        let reranker: Option<Arc<dyn RerankClient>> = HttpRerankClient::from_config(&config.reranker)?
            .map(|c| Arc::new(c) as Arc<dyn RerankClient>);

        let ingestion = Arc::new(IngestionCoordinator::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&embedder),
        ));
        let planner = Arc::new(QueryPlanner::new(
            Arc::clone(&llm),
            Arc::clone(&embedder),
            &config.generation,
        ));
        let retriever = Arc::new(Retriever::new(
            Arc::clone(&store),
            reranker,
            config.retrieval.clone(),
        ));
        let composer = Arc::new(AnswerComposer::new(
            planner,
            retriever,
            llm,
            config.generation.clone(),
        ));

        Ok(AppState {
            config,
            store,
            ingestion,
            composer,
        })
    }
}

/// Start serving on the configured bind address. Runs until the process
/// terminates.
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let bind_addr = state.config.bind_addr.clone();
    // Multipart framing overhead on top of the file itself.
    let body_limit = state.config.upload.max_upload_bytes() as usize + 1024 * 1024;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/health", get(handle_health))
        .route("/api/documents/upload", post(handle_upload))
        .route("/api/documents/", get(handle_list_documents))
        .route("/api/documents/:id", delete(handle_delete_document))
        .route("/api/chat/stream", post(handle_chat_stream))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state);

    info!(addr = %bind_addr, "server listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": { "code": self.code, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn payload_too_large(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::PAYLOAD_TOO_LARGE,
        code: "payload_too_large",
        message: message.into(),
    }
}

/// Map a pipeline error onto the HTTP error contract.
fn app_error(error: RagError) -> AppError {
    let message = error.to_string();
    let (status, code) = match &error {
        RagError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        RagError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        RagError::ExtractionFailed(_) => (StatusCode::UNPROCESSABLE_ENTITY, "extraction_failed"),
        RagError::IngestionYieldedNothing => {
            (StatusCode::UNPROCESSABLE_ENTITY, "empty_document")
        }
        RagError::EmbeddingUnavailable(_)
        | RagError::RerankerUnavailable(_)
        | RagError::LlmUnavailable(_)
        | RagError::LlmStreamTruncated(_)
        | RagError::StorageUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "upstream_unavailable")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    AppError {
        status,
        code,
        message,
    }
}

// ============ GET /api/health ============

async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    match (
        state.store.count_documents().await,
        state.store.count_chunks().await,
    ) {
        (Ok(documents), Ok(chunks)) => Json(serde_json::json!({
            "status": "healthy",
            "documents_count": documents,
            "chunks_count": chunks,
        })),
        _ => Json(serde_json::json!({
            "status": "degraded",
            "documents_count": 0,
            "chunks_count": 0,
        })),
    }
}

// ============ POST /api/documents/upload ============

async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<DocumentDto>), AppError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut class = DocumentClass::Document;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("file") => {
                let filename = field
                    .file_name()
                    .ok_or_else(|| bad_request("file field has no filename"))?
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("failed to read upload: {}", e)))?;
                file = Some((filename, bytes.to_vec()));
            }
            Some("document_type") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| bad_request(format!("failed to read field: {}", e)))?;
                class = DocumentClass::parse(raw.trim()).ok_or_else(|| {
                    bad_request(format!(
                        "unknown document type '{}': use regulation, policy, or document",
                        raw.trim()
                    ))
                })?;
            }
            _ => {}
        }
    }

    let (filename, bytes) = file.ok_or_else(|| bad_request("missing 'file' field"))?;

    let max_bytes = state.config.upload.max_upload_bytes();
    if bytes.len() as u64 > max_bytes {
        return Err(payload_too_large(format!(
            "upload of {} bytes exceeds the {} MB limit",
            bytes.len(),
            state.config.upload.max_upload_mb
        )));
    }

    let document = state
        .ingestion
        .ingest(bytes, &filename, class)
        .await
        .map_err(app_error)?;

    Ok((StatusCode::CREATED, Json(DocumentDto::from_document(&document))))
}

// ============ GET /api/documents/ ============

async fn handle_list_documents(
    State(state): State<AppState>,
) -> Result<Json<Vec<DocumentDto>>, AppError> {
    let documents = state.store.list_documents().await.map_err(app_error)?;
    Ok(Json(
        documents.iter().map(DocumentDto::from_document).collect(),
    ))
}

// ============ DELETE /api/documents/{id} ============

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = Uuid::parse_str(&id).map_err(|_| bad_request("invalid document id"))?;
    state.ingestion.delete(id).await.map_err(app_error)?;
    Ok(Json(serde_json::json!({ "message": "document deleted" })))
}

// ============ POST /api/chat/stream ============

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    #[allow(dead_code)]
    session_id: Option<String>,
    #[serde(default)]
    history: Option<Vec<ChatMessage>>,
}

async fn handle_chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    if request.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }

    let rx = state
        .composer
        .answer(request.message, request.history.unwrap_or_default());

    let stream = ReceiverStream::new(rx).map(|event| Ok(Event::default().data(event_payload(&event))));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Render one pipeline event as its SSE data payload.
fn event_payload(event: &RagEvent) -> String {
    match event {
        RagEvent::Text(text) => encode_text_payload(text),
        RagEvent::Citations {
            citations,
            invalid_citations,
        } => serde_json::json!({
            "type": "citations",
            "data": {
                "citations": citations,
                "invalid_citations": invalid_citations,
            }
        })
        .to_string(),
        RagEvent::Metrics(metrics) => serde_json::json!({
            "type": "metrics",
            "data": metrics,
        })
        .to_string(),
        RagEvent::Error(message) => serde_json::json!({
            "type": "error",
            "data": message,
        })
        .to_string(),
        RagEvent::Done => "[DONE]".to_string(),
    }
}

/// Encode literal newlines so the payload survives newline-delimited SSE
/// framing. The UI decodes symmetrically.
fn encode_text_payload(text: &str) -> String {
    text.replace("\n\n", BLANK_LINE).replace('\n', LINE_BREAK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CitationDto, ResponseMetrics};

    #[test]
    fn text_payload_encodes_newlines() {
        let encoded = encode_text_payload("first line\nsecond\n\nthird");
        assert_eq!(
            encoded,
            "first line<<<LINE_BREAK>>>second<<<BLANK_LINE>>>third"
        );
        assert!(!encoded.contains('\n'));
    }

    #[test]
    fn done_payload_is_terminal_marker() {
        assert_eq!(event_payload(&RagEvent::Done), "[DONE]");
    }

    #[test]
    fn citations_payload_is_tagged_json() {
        let event = RagEvent::Citations {
            citations: vec![CitationDto {
                id: "C1".to_string(),
                text: "quoted".to_string(),
                source: "crr.pdf, p.4".to_string(),
                url: Some("/documents/abc".to_string()),
            }],
            invalid_citations: vec!["bad span".to_string()],
        };
        let payload: serde_json::Value =
            serde_json::from_str(&event_payload(&event)).unwrap();
        assert_eq!(payload["type"], "citations");
        assert_eq!(payload["data"]["citations"][0]["id"], "C1");
        assert_eq!(payload["data"]["citations"][0]["source"], "crr.pdf, p.4");
        assert_eq!(payload["data"]["invalid_citations"][0], "bad span");
    }

    #[test]
    fn metrics_payload_round_trips() {
        let event = RagEvent::Metrics(ResponseMetrics {
            tokens_used: 250,
            input_tokens: 200,
            output_tokens: 50,
            estimated_cost: 0.00006,
            citations_count: 2,
            average_normalized_score: 0.82,
            latency_ms: 1500,
            degraded: false,
        });
        let payload: serde_json::Value =
            serde_json::from_str(&event_payload(&event)).unwrap();
        assert_eq!(payload["type"], "metrics");
        assert_eq!(payload["data"]["tokens_used"], 250);
        assert_eq!(payload["data"]["degraded"], false);
    }

    #[test]
    fn pipeline_errors_map_to_status_codes() {
        assert_eq!(
            app_error(RagError::InvalidInput("x".into())).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            app_error(RagError::NotFound("x".into())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            app_error(RagError::ExtractionFailed("x".into())).status,
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            app_error(RagError::IngestionYieldedNothing).status,
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            app_error(RagError::EmbeddingUnavailable("x".into())).status,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            app_error(RagError::StorageUnavailable("x".into())).status,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
