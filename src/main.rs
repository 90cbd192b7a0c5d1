//! # Meme Search CLI (`memes`)
//!
//! The `memes` binary is the primary interface for meme-search. It provides
//! commands for catalog initialization, vector ingestion, text and image
//! search, and starting the HTTP retrieval server.
//!
//! ## Usage
//!
//! ```bash
//! memes --config ./config/memes.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `memes init` | Create the SQLite label catalog schema |
//! | `memes sources` | List configured ingestion jobs and whether their paths exist |
//! | `memes ingest <collection\|all>` | Load vectors into Weaviate, skipping what is already there |
//! | `memes import-labels <csv>` | Fill the label catalog and caption index from a labels CSV |
//! | `memes search "<query>"` | Multi-channel text search |
//! | `memes search-image <path>` | Image similarity search |
//! | `memes label <image_name>` | Show the label catalog row for one meme |
//! | `memes stats` | Object count per collection |
//! | `memes serve` | Start the HTTP retrieval server |
//!
//! ## Examples
//!
//! ```bash
//! # Create the label catalog
//! memes init
//!
//! # Ingest every configured collection
//! memes ingest all
//!
//! # Load labels and captions
//! memes import-labels ./data/labels.csv
//!
//! # See how each channel contributed
//! memes search "jon snow saying winter is coming" --explain
//! ```
//!
//! Logs go to stderr and are controlled with `RUST_LOG` (default `info`).

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use meme_search::{
    config, ingest, label_import, labels, migrate, search, server, sources, stats,
};

/// Meme Search CLI: multi-channel meme retrieval with weighted rank fusion.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/memes.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "memes",
    about = "Meme Search: multi-channel meme retrieval with weighted rank fusion",
    version,
    long_about = "Meme Search decomposes a query into faces, caption text and a scene \
    description, searches each channel (Weaviate vectors, Elasticsearch captions), and fuses \
    the rankings with weighted reciprocal rank fusion. It also loads precomputed embeddings \
    into Weaviate idempotently."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/memes.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the label catalog schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// List configured ingestion jobs.
    Sources,

    /// Load precomputed vectors into Weaviate.
    ///
    /// A collection that already holds objects is left untouched; otherwise
    /// every record is inserted under a deterministic id so reruns skip
    /// what earlier runs stored.
    Ingest {
        /// Collection name of a configured `[[ingest]]` job, or `all`.
        target: String,

        /// Read the sources and report counts without writing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Load a labels CSV into the label catalog and the caption index.
    ///
    /// Rows are upserted by label number, so reruns replace earlier rows.
    /// Captions are indexed only when the Elasticsearch index is empty.
    ImportLabels {
        /// Path to the labels CSV.
        csv: PathBuf,

        /// Only fill the label catalog; leave Elasticsearch alone.
        #[arg(long)]
        skip_captions: bool,
    },

    /// Search memes with a free-text query.
    Search {
        /// The search query.
        query: String,

        /// Maximum number of results (default: `retrieval.final_limit`).
        #[arg(long)]
        limit: Option<usize>,

        /// Print the query decomposition and per-channel hit counts.
        #[arg(long)]
        explain: bool,
    },

    /// Search memes similar to an image.
    SearchImage {
        /// Path to the query image.
        path: PathBuf,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        explain: bool,
    },

    /// Show the label catalog row for an image.
    Label {
        /// Image file name, e.g. `image_42.jpg`.
        image_name: String,
    },

    /// Show object counts per collection and catalog size.
    Stats,

    /// Start the HTTP retrieval server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg.db).await?;
            println!("Label catalog initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Ingest { target, dry_run } => {
            ingest::run_ingest(&cfg, &target, dry_run).await?;
        }
        Commands::ImportLabels { csv, skip_captions } => {
            label_import::run_import_labels(&cfg, &csv, skip_captions).await?;
        }
        Commands::Search {
            query,
            limit,
            explain,
        } => {
            search::run_search(&cfg, &query, limit, explain).await?;
        }
        Commands::SearchImage {
            path,
            limit,
            explain,
        } => {
            search::run_search_image(&cfg, &path, limit, explain).await?;
        }
        Commands::Label { image_name } => {
            labels::run_label(&cfg.db, &image_name).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
