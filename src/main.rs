//! # maint CLI
//!
//! The `maint` binary runs every process of the assistant: the HTTP
//! gateway, query workers, and the maintenance commands around the
//! knowledge store.
//!
//! ## Usage
//!
//! ```bash
//! maint --config ./config/maint.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `maint init` | Create the knowledge store schema |
//! | `maint serve [--workers N]` | Start the HTTP gateway, optionally with in-process workers |
//! | `maint worker` | Consume query jobs until interrupted |
//! | `maint index <file>` | Bulk-embed an intervention or document export |
//! | `maint stats` | Knowledge store counts |
//! | `maint ask "<query>"` | One-shot query through the gateway path |
//!
//! ## Examples
//!
//! ```bash
//! # Gateway and two workers on one host, against Redis
//! maint serve --config ./config/maint.toml &
//! maint worker --config ./config/maint.toml &
//! maint worker --config ./config/maint.toml &
//!
//! # Everything in one process (required for the memory broker)
//! maint serve --workers 2
//!
//! # Embed existing interventions, skipping those already stored
//! maint index ./exports/interventions.json
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use maint_assist::config::{self, Config};
use maint_assist::context::PipelineContext;
use maint_assist::gateway::{Gateway, SubmitStatus};
use maint_assist::worker::{spawn_workers, Worker};
use maint_assist::{indexer, logging, migrate, server, stats};

/// Maintenance assistant: retrieval-augmented answers over intervention
/// history, served through a work queue.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/maint.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "maint",
    about = "Maintenance assistant: asynchronous retrieval-augmented query pipeline",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/maint.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the knowledge store schema.
    ///
    /// Creates the SQLite file and the `knowledge_documents` table.
    /// Running it more than once is safe.
    Init,

    /// Start the HTTP gateway.
    Serve {
        /// Consumer loops to run inside this process. Required when the
        /// broker backend is `memory`.
        #[arg(long, default_value_t = 0)]
        workers: usize,
    },

    /// Consume query jobs until interrupted.
    ///
    /// Runs `[worker].concurrency` consumer loops. Exits with an error if
    /// the broker cannot be reached at startup.
    Worker,

    /// Bulk-embed records from a JSON export.
    Index {
        /// JSON array of records.
        file: PathBuf,

        /// `interventions` (intervention records) or `documents`
        /// (`{id, text, metadata}` objects).
        #[arg(long, default_value = "interventions")]
        format: String,

        /// Re-embed records that are already stored.
        #[arg(long)]
        force: bool,

        /// Records per progress step.
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Show knowledge store statistics.
    Stats,

    /// Ask one question and print the reply.
    Ask {
        query: String,

        #[arg(long)]
        user: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg.knowledge).await?;
            println!("Knowledge store initialized successfully.");
        }
        Commands::Serve { workers } => {
            if cfg.broker.backend == "memory" && workers == 0 {
                anyhow::bail!("the memory broker needs in-process workers: use --workers N");
            }
            let ctx = PipelineContext::from_config(cfg).await?;
            server::run_server(ctx, workers).await?;
        }
        Commands::Worker => run_worker(cfg).await?,
        Commands::Index {
            file,
            format,
            force,
            batch_size,
        } => {
            indexer::run_index(cfg, &file, &format, force, batch_size).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Ask { query, user } => {
            let ctx = PipelineContext::from_config(cfg).await?;
            let outcome = Gateway::new(ctx).submit(&query, user.as_deref()).await?;
            if outcome.status != SubmitStatus::Ok {
                eprintln!("status: {:?}", outcome.status);
            }
            println!("{}", outcome.reply.response);
            for item in &outcome.reply.context {
                println!("  - {} (distance {:.3})", item.source, item.similarity);
            }
        }
    }

    Ok(())
}

async fn run_worker(cfg: Config) -> anyhow::Result<()> {
    if cfg.broker.backend == "memory" {
        anyhow::bail!("a standalone worker cannot share the memory broker; use `maint serve --workers N`");
    }
    let concurrency = cfg.worker.concurrency;
    let worker_id = cfg.broker.worker_id();
    let ctx = PipelineContext::from_config(cfg).await?;
    let mut loops = spawn_workers(&Worker::new(ctx), &worker_id, concurrency);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down worker");
        }
        Some(finished) = loops.join_next() => {
            finished??;
        }
    }
    Ok(())
}
