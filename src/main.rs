//! # Local RAG CLI (`rag`)
//!
//! ## Usage
//!
//! ```bash
//! rag --config ./config/rag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rag init` | Create (or verify) the persisted index |
//! | `rag ingest <file>` | Load, chunk, embed, and index one document |
//! | `rag ask "<question>"` | One-shot question against the index |
//! | `rag delete <id>` | Remove a document and rebuild the index |
//! | `rag documents` | List indexed documents |
//! | `rag stats` | Index size and dimension |
//! | `rag serve` | Start the HTTP server |
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use local_rag::commands::{self, CLI_SESSION};
use local_rag::{config, server};

/// Local RAG: question answering over your own documents with a local
/// language model.
#[derive(Parser)]
#[command(
    name = "rag",
    about = "Local retrieval-augmented generation over uploaded documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/rag.toml`. See `config/rag.example.toml`.
    #[arg(long, global = true, default_value = "./config/rag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the index store, or report what an existing one holds.
    Init,

    /// Ingest one document (PDF or plain text).
    ///
    /// The document is chunked, embedded, and indexed as one unit: on any
    /// error nothing from it is stored.
    Ingest {
        /// Path to the document.
        file: PathBuf,

        /// Session that owns the upload.
        #[arg(long, default_value = CLI_SESSION)]
        session: String,
    },

    /// Ask a question and print the answer with its source passages.
    Ask {
        question: String,

        #[arg(long, default_value = CLI_SESSION)]
        session: String,
    },

    /// Remove a document and all of its chunks.
    Delete {
        /// Document id as printed by `ingest` or `documents`.
        id: String,
    },

    /// List indexed documents.
    Documents,

    /// Show index statistics.
    Stats,

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => commands::run_init(&cfg).await?,
        Commands::Ingest { file, session } => commands::run_ingest(&cfg, &file, &session).await?,
        Commands::Ask { question, session } => {
            commands::run_ask(&cfg, &question, &session).await?
        }
        Commands::Delete { id } => commands::run_delete(&cfg, &id).await?,
        Commands::Documents => commands::run_documents(&cfg).await?,
        Commands::Stats => commands::run_stats(&cfg).await?,
        Commands::Serve => server::run_server(&cfg).await?,
    }

    Ok(())
}
