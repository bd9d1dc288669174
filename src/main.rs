//! # Course RAG CLI (`crag`)
//!
//! The `crag` binary ingests a course knowledge base, answers questions
//! over it and serves the HTTP API used by the chat widget.
//!
//! ## Usage
//!
//! ```bash
//! crag --config ./config/crag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `crag init` | Create the SQLite database and schema |
//! | `crag ingest` | Rebuild the index from the knowledge directory |
//! | `crag parse <file>` | Run the format parser on one file |
//! | `crag search "<query>"` | Show ranked knowledge chunks |
//! | `crag ask "<question>"` | Stream an answer grounded in the knowledge base |
//! | `crag serve` | Start the HTTP server |
//!
//! Logs go to stderr and are filtered with `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use course_rag::{config, ingest, migrate, parse_cmd, search, server};

/// Course RAG: retrieval-augmented answers over course material.
///
/// All commands except `parse` read the TOML file given by `--config`.
/// See `config/crag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "crag",
    about = "Course RAG: retrieval-augmented answers over course material",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/crag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it again is safe.
    Init,

    /// Re-ingest the knowledge directory.
    ///
    /// Clears the index, then parses, chunks and embeds every matching
    /// file. Files that fail are reported and skipped.
    Ingest {
        /// Knowledge directory (overrides `[ingest].root`).
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Parse a single document and print what was extracted.
    Parse {
        /// File to parse (PDF, DOCX, IMSCC, markdown or text).
        file: PathBuf,

        /// Declared media type; detected from the extension when omitted.
        #[arg(long)]
        media_type: Option<String>,

        /// Print the full parse result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Search the knowledge base.
    Search {
        /// The search query string.
        query: String,

        /// Retrieval profile: `knowledge_base` (alias `kb`) or `support`.
        #[arg(long, default_value = "knowledge_base")]
        profile: String,

        /// Minimum cosine similarity, overriding the profile.
        #[arg(long)]
        threshold: Option<f32>,

        /// Maximum number of results, overriding the profile.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Ask a question and stream the answer.
    Ask {
        /// The question.
        question: String,

        /// Retrieval profile: `knowledge_base` (alias `kb`) or `support`.
        #[arg(long, default_value = "knowledge_base")]
        profile: String,
    },

    /// Start the HTTP server.
    ///
    /// Binds to `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Parsing a local file needs no config.
    if let Commands::Parse {
        file,
        media_type,
        json,
    } = &cli.command
    {
        return parse_cmd::run_parse(file, media_type.as_deref(), *json);
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { root } => {
            ingest::run_ingest(&cfg, root).await?;
        }
        Commands::Search {
            query,
            profile,
            threshold,
            top_k,
        } => {
            search::run_search(&cfg, &query, &profile, threshold, top_k).await?;
        }
        Commands::Ask { question, profile } => {
            search::run_ask(&cfg, &question, &profile).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Parse { .. } => {}
    }

    Ok(())
}
