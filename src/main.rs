//! # KB Harness CLI (`kbh`)
//!
//! ## Usage
//!
//! ```bash
//! kbh --config ./config/kbh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbh init` | Create the SQLite database and run schema migrations |
//! | `kbh kb create <name>` | Create a knowledge base |
//! | `kbh kb list` | List knowledge bases |
//! | `kbh kb show <kb>` | Show a knowledge base and its settings |
//! | `kbh kb clear <kb>` | Remove all documents and chunks of a knowledge base |
//! | `kbh kb delete <kb>` | Delete a knowledge base |
//! | `kbh ingest <kb> <file>` | Ingest a file |
//! | `kbh delete-source <kb> <type> <path>` | Remove a source (or a path prefix) |
//! | `kbh search <kb> "<query>"` | Hybrid search |
//! | `kbh reconcile <kb>` | Sweep stale chunks and list incomplete versions |
//! | `kbh stats <kb>` | Document, chunk and embedding counts |
//!
//! `<kb>` is a knowledge base id or name. Logging is controlled with
//! `RUST_LOG` (default `info`) and written to stderr.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use kb_harness::{commands, config, Engine};

/// KB Harness: versioned knowledge bases with hybrid retrieval.
#[derive(Parser)]
#[command(
    name = "kbh",
    about = "Versioned knowledge-base ingestion with hybrid dense and keyword retrieval",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kbh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Manage knowledge bases.
    Kb {
        #[command(subcommand)]
        action: KbAction,
    },

    /// Ingest a file into a knowledge base.
    ///
    /// Unchanged files are skipped; changed files get a new document version
    /// and their chunks are replaced.
    Ingest {
        /// Knowledge base id or name.
        kb: String,
        /// File to ingest.
        file: PathBuf,
        /// Source type (`markdown`, `text`, `code`, `web`, ...). Guessed from
        /// the extension when omitted.
        #[arg(long)]
        source_type: Option<String>,
        /// Source path recorded for the document. Defaults to the file path.
        #[arg(long)]
        source_path: Option<String>,
        /// Chunk mode override: `full`, `fixed` or `section`.
        #[arg(long)]
        mode: Option<String>,
        /// Chunk size override, in characters.
        #[arg(long)]
        max_chars: Option<usize>,
        /// Chunk overlap override, in characters.
        #[arg(long)]
        overlap: Option<usize>,
        /// Give up after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Remove a source and its chunks.
    DeleteSource {
        kb: String,
        source_type: String,
        source_path: String,
        /// Treat `source_path` as a literal prefix.
        #[arg(long)]
        prefix: bool,
    },

    /// Search a knowledge base.
    Search {
        kb: String,
        query: String,
        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,
        /// Give up on the embedder and reranker after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Remove chunks of superseded versions and report incomplete versions.
    Reconcile { kb: String },

    /// Show counts for a knowledge base.
    Stats { kb: String },
}

#[derive(Subcommand)]
enum KbAction {
    /// Create a knowledge base.
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// Partial settings as JSON, e.g. `{"chunking":{"web":{"mode":"full"}}}`.
        #[arg(long)]
        settings: Option<String>,
    },
    /// List knowledge bases.
    List,
    /// Show one knowledge base.
    Show { kb: String },
    /// Remove all documents and chunks, keeping the knowledge base.
    Clear { kb: String },
    /// Delete a knowledge base and everything in it.
    Delete { kb: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        return commands::run_init(&cfg).await;
    }

    let engine = Engine::open(cfg).await?;
    match cli.command {
        Commands::Init => {}
        Commands::Kb { action } => match action {
            KbAction::Create {
                name,
                description,
                settings,
            } => {
                commands::run_kb_create(&engine, &name, description.as_deref(), settings.as_deref())
                    .await?;
            }
            KbAction::List => commands::run_kb_list(&engine).await?,
            KbAction::Show { kb } => commands::run_kb_show(&engine, &kb).await?,
            KbAction::Clear { kb } => commands::run_kb_clear(&engine, &kb).await?,
            KbAction::Delete { kb } => commands::run_kb_delete(&engine, &kb).await?,
        },
        Commands::Ingest {
            kb,
            file,
            source_type,
            source_path,
            mode,
            max_chars,
            overlap,
            timeout,
        } => {
            commands::run_ingest(
                &engine,
                &kb,
                &file,
                source_type.as_deref(),
                source_path.as_deref(),
                mode.as_deref(),
                max_chars,
                overlap,
                timeout,
            )
            .await?;
        }
        Commands::DeleteSource {
            kb,
            source_type,
            source_path,
            prefix,
        } => {
            commands::run_delete_source(&engine, &kb, &source_type, &source_path, prefix).await?;
        }
        Commands::Search {
            kb,
            query,
            limit,
            timeout,
        } => {
            commands::run_search(&engine, &kb, &query, limit, timeout).await?;
        }
        Commands::Reconcile { kb } => commands::run_reconcile(&engine, &kb).await?,
        Commands::Stats { kb } => commands::run_stats(&engine, &kb).await?,
    }

    Ok(())
}
