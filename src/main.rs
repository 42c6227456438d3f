//! regstack CLI.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `regstack init` | Create the SQLite database and run schema migrations |
//! | `regstack serve` | Start the HTTP server (documents + streaming chat) |
//! | `regstack ingest <files…>` | Ingest documents from disk without the server |
//!
//! All configuration is read from environment variables; see `config` for
//! the full list and defaults.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use regstack::config::Config;
use regstack::models::DocumentClass;
use regstack::server::{run_server, AppState};

/// Budget for reading one input file from disk.
const FILE_READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(
    name = "regstack",
    about = "Retrieval-augmented question answering over regulatory document corpora",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Start the HTTP server.
    ///
    /// Binds to `BIND_ADDR` and serves document management plus the
    /// streaming chat endpoint. Models and the tokenizer are initialized
    /// before the listener accepts requests.
    Serve,

    /// Ingest documents from disk.
    ///
    /// Runs the same pipeline as the upload endpoint: extract, chunk,
    /// embed, persist. Files that fail are reported and skipped.
    Ingest {
        /// Input files (PDF, DOCX, or plain text).
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Document class applied to every file.
        #[arg(long, default_value = "document")]
        class: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Init => {
            let pool = regstack::db::connect(&config.db_path).await?;
            regstack::migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            let state = AppState::initialize(config).await?;
            run_server(state).await?;
        }
        Commands::Ingest { files, class } => {
            let class = DocumentClass::parse(&class).ok_or_else(|| {
                anyhow::anyhow!("unknown class '{}': use regulation, policy, or document", class)
            })?;
            let state = AppState::initialize(config).await?;

            let mut ingested = 0usize;
            let mut failed = 0usize;

            for path in &files {
                let filename = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("upload.bin")
                    .to_string();

                let bytes =
                    match tokio::time::timeout(FILE_READ_TIMEOUT, tokio::fs::read(path)).await {
                        Ok(Ok(bytes)) => bytes,
                        Ok(Err(e)) => {
                            eprintln!("  {} — read failed: {}", path.display(), e);
                            failed += 1;
                            continue;
                        }
                        Err(_) => {
                            eprintln!("  {} — read timed out", path.display());
                            failed += 1;
                            continue;
                        }
                    };

                match state.ingestion.ingest(bytes, &filename, class).await {
                    Ok(document) => {
                        println!("  {} — {} ({} bytes)", filename, document.id, document.file_size);
                        ingested += 1;
                    }
                    Err(e) => {
                        eprintln!("  {} — ingestion failed: {}", filename, e);
                        failed += 1;
                    }
                }
            }

            println!("ingest");
            println!("  files: {}", files.len());
            println!("  ingested: {}", ingested);
            println!("  failed: {}", failed);
        }
    }

    Ok(())
}
