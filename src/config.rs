use anyhow::{bail, Context, Result};
use std::path::PathBuf;

/// Application configuration, read from environment variables.
///
/// Every knob has a default suitable for local development except the
/// gateway endpoints, which must point at real services before ingestion
/// or querying can succeed.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub storage_path: PathBuf,
    pub bind_addr: String,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub generation: GenerationConfig,
    pub upload: UploadConfig,
    pub embedding: EmbeddingGatewayConfig,
    pub reranker: RerankerGatewayConfig,
    pub llm: LlmGatewayConfig,
}

#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// Target chunk size in tokens.
    pub chunk_size_tokens: usize,
    /// Trailing token window replicated into the next chunk.
    pub chunk_overlap_tokens: usize,
    /// Chunks smaller than this after cleanup are dropped.
    pub chunk_min_tokens: usize,
}

impl ChunkingConfig {
    /// Upper bound a stored chunk's token count may never exceed.
    pub fn hard_cap(&self) -> usize {
        self.chunk_size_tokens + self.chunk_overlap_tokens
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub initial_top_k: usize,
    pub top_k_results: usize,
    pub max_per_doc: usize,
    pub enforce_diversity: bool,
    /// Applied to min-max normalized rerank scores only.
    pub rerank_threshold: f64,
    /// Applied to raw cosine similarity only, in reranker-fallback mode.
    pub similarity_threshold: f64,
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub temperature_answer: f32,
    pub temperature_expand: f32,
    pub max_tokens: u32,
    pub input_price_per_1m: f64,
    pub output_price_per_1m: f64,
    /// Minimum best-window similarity for a fuzzy citation match.
    pub fuzzy_accept: f64,
    /// In strict mode an invalid citation also degrades the response.
    pub strict_citations: bool,
    /// Prior conversational turns forwarded to the model.
    pub history_turns: usize,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub max_upload_mb: u64,
    pub allowed_extensions: Vec<String>,
}

impl UploadConfig {
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb * 1024 * 1024
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingGatewayConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Embedding dimension; must match the model output exactly.
    pub dims: usize,
    pub batch_size: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RerankerGatewayConfig {
    /// Cross-encoder scoring endpoint. Unset disables reranking entirely.
    pub url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct LlmGatewayConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub short_timeout_secs: u64,
    pub stream_timeout_secs: u64,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {}: {}", name, e)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Build the configuration from the process environment.
    ///
    /// Applies defaults, then validates cross-field constraints at startup
    /// so a bad value fails fast with a descriptive error instead of
    /// surfacing mid-request.
    pub fn from_env() -> Result<Config> {
        let config = Config {
            db_path: PathBuf::from(env_or("DATABASE_PATH", "./data/regstack.sqlite")),
            storage_path: PathBuf::from(env_or("STORAGE_PATH", "./storage/documents")),
            bind_addr: env_or("BIND_ADDR", "127.0.0.1:8000"),
            chunking: ChunkingConfig {
                chunk_size_tokens: env_parse("CHUNK_SIZE_TOKENS", 1200)?,
                chunk_overlap_tokens: env_parse("CHUNK_OVERLAP_TOKENS", 300)?,
                chunk_min_tokens: env_parse("CHUNK_MIN_TOKENS", 50)?,
            },
            retrieval: RetrievalConfig {
                initial_top_k: env_parse("INITIAL_TOP_K", 48)?,
                top_k_results: env_parse("TOP_K_RESULTS", 10)?,
                max_per_doc: env_parse("MAX_PER_DOC", 3)?,
                enforce_diversity: env_parse("ENFORCE_DIVERSITY", true)?,
                rerank_threshold: env_parse("RERANK_THRESHOLD", 0.05)?,
                similarity_threshold: env_parse("SIMILARITY_THRESHOLD", 0.3)?,
            },
            generation: GenerationConfig {
                temperature_answer: env_parse("LLM_TEMPERATURE_ANSWER", 0.3)?,
                temperature_expand: env_parse("LLM_TEMPERATURE_EXPAND", 0.7)?,
                max_tokens: env_parse("LLM_MAX_TOKENS", 1500)?,
                input_price_per_1m: env_parse("LLM_INPUT_PRICE_PER_1M", 0.15)?,
                output_price_per_1m: env_parse("LLM_OUTPUT_PRICE_PER_1M", 0.60)?,
                fuzzy_accept: env_parse("FUZZY_ACCEPT", 0.90)?,
                strict_citations: env_parse("STRICT_CITATIONS", true)?,
                history_turns: env_parse("HISTORY_TURNS", 4)?,
            },
            upload: UploadConfig {
                max_upload_mb: env_parse("MAX_UPLOAD_MB", 50)?,
                allowed_extensions: env_or("ALLOWED_EXTENSIONS", "pdf,docx,txt")
                    .split(',')
                    .map(|s| s.trim().trim_start_matches('.').to_ascii_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            embedding: EmbeddingGatewayConfig {
                base_url: env_or("EMBEDDING_BASE_URL", "https://api.openai.com/v1"),
                api_key: std::env::var("OPENAI_API_KEY").ok(),
                model: env_or("EMBEDDING_MODEL", "text-embedding-3-small"),
                dims: env_parse("VECTOR_DIM", 1536)?,
                batch_size: env_parse("EMBEDDING_BATCH_SIZE", 32)?,
                max_retries: env_parse("EMBEDDING_MAX_RETRIES", 3)?,
                timeout_secs: env_parse("EMBEDDING_TIMEOUT_SECS", 10)?,
            },
            reranker: RerankerGatewayConfig {
                url: std::env::var("RERANKER_URL").ok().filter(|s| !s.is_empty()),
                timeout_secs: env_parse("RERANKER_TIMEOUT_SECS", 15)?,
            },
            llm: LlmGatewayConfig {
                base_url: env_or("LLM_BASE_URL", "https://api.openai.com/v1"),
                api_key: std::env::var("OPENAI_API_KEY").ok(),
                model: env_or("LLM_MODEL", "gpt-4o-mini"),
                short_timeout_secs: env_parse("LLM_SHORT_TIMEOUT_SECS", 30)?,
                stream_timeout_secs: env_parse("LLM_STREAM_TIMEOUT_SECS", 120)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size_tokens == 0 {
            bail!("CHUNK_SIZE_TOKENS must be > 0");
        }
        if self.chunking.chunk_overlap_tokens >= self.chunking.chunk_size_tokens {
            bail!("CHUNK_OVERLAP_TOKENS must be smaller than CHUNK_SIZE_TOKENS");
        }
        if self.chunking.chunk_min_tokens > self.chunking.chunk_size_tokens {
            bail!("CHUNK_MIN_TOKENS must not exceed CHUNK_SIZE_TOKENS");
        }
        if self.embedding.dims == 0 {
            bail!("VECTOR_DIM must be > 0");
        }
        if self.embedding.batch_size == 0 {
            bail!("EMBEDDING_BATCH_SIZE must be > 0");
        }
        if self.retrieval.top_k_results == 0 {
            bail!("TOP_K_RESULTS must be >= 1");
        }
        if self.retrieval.initial_top_k < self.retrieval.top_k_results {
            bail!("INITIAL_TOP_K must be >= TOP_K_RESULTS");
        }
        if self.retrieval.max_per_doc == 0 {
            bail!("MAX_PER_DOC must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.retrieval.rerank_threshold) {
            bail!("RERANK_THRESHOLD must be in [0.0, 1.0]");
        }
        if !(0.0..=1.0).contains(&self.generation.fuzzy_accept) {
            bail!("FUZZY_ACCEPT must be in [0.0, 1.0]");
        }
        if self.upload.max_upload_mb == 0 {
            bail!("MAX_UPLOAD_MB must be >= 1");
        }
        if self.upload.allowed_extensions.is_empty() {
            bail!("ALLOWED_EXTENSIONS must name at least one extension");
        }
        self.bind_addr
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("invalid BIND_ADDR: {}", self.bind_addr))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Fixed configuration used across module tests, independent of the
    /// process environment.
    pub(crate) fn test_config() -> Config {
        Config {
            db_path: PathBuf::from(":memory:"),
            storage_path: PathBuf::from("/tmp/regstack-test"),
            bind_addr: "127.0.0.1:8000".to_string(),
            chunking: ChunkingConfig {
                chunk_size_tokens: 1200,
                chunk_overlap_tokens: 300,
                chunk_min_tokens: 50,
            },
            retrieval: RetrievalConfig {
                initial_top_k: 48,
                top_k_results: 10,
                max_per_doc: 3,
                enforce_diversity: true,
                rerank_threshold: 0.05,
                similarity_threshold: 0.3,
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
                base_url: "http://localhost:9001/v1".to_string(),
                api_key: None,
                model: "test-embed".to_string(),
                dims: 8,
                batch_size: 32,
                max_retries: 3,
                timeout_secs: 10,
            },
            reranker: RerankerGatewayConfig {
                url: None,
                timeout_secs: 15,
            },
            llm: LlmGatewayConfig {
                base_url: "http://localhost:9002/v1".to_string(),
                api_key: None,
                model: "test-llm".to_string(),
                short_timeout_secs: 30,
                stream_timeout_secs: 120,
            },
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let mut cfg = test_config();
        cfg.chunking.chunk_overlap_tokens = 1200;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn initial_top_k_covers_final_top_k() {
        let mut cfg = test_config();
        cfg.retrieval.initial_top_k = 5;
        cfg.retrieval.top_k_results = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn hard_cap_is_size_plus_overlap() {
        let cfg = test_config();
        assert_eq!(cfg.chunking.hard_cap(), 1500);
    }

    #[test]
    fn bad_bind_addr_rejected() {
        let mut cfg = test_config();
        cfg.bind_addr = "not-an-addr".to_string();
        assert!(cfg.validate().is_err());
    }
}
