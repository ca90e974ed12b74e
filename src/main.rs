//! # opsync CLI
//!
//! ## Usage
//!
//! ```bash
//! opsync --config ./config/opsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `opsync init` | Create the SQLite database and run schema migrations |
//! | `opsync sources` | List connectors, their health and tables |
//! | `opsync sync run [--fast] [table]` | Reconcile remote and local |
//! | `opsync sync diff [table]` | Show ids present on only one side |
//! | `opsync sync watch [--interval N]` | Sync drifted tables until Ctrl-C |
//! | `opsync relations add <from> <to> <type>` | Add a relation (and its inverse) |
//! | `opsync relations get <id>` | Outgoing and incoming relations |
//! | `opsync relations find <type> <id>` | Relations of a type pointing at an entity |
//! | `opsync relations graph <id> [--depth N]` | Breadth-first relationship tree |
//! | `opsync relations audit` | Orphans and broken links |
//!
//! Logs go to stderr and are filtered with `RUST_LOG` (default
//! `opsync=info`); command output goes to stdout.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use opsync::{config, migrate, relations_cmd, sources, sync_cmd};

/// Two-way sync between a hosted workspace and a local mirror.
#[derive(Parser)]
#[command(name = "opsync", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/opsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// List connectors and whether they are usable.
    Sources,

    /// Reconcile records between the remote and local sides.
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },

    /// Inspect and edit the entity relationship graph.
    Relations {
        #[command(subcommand)]
        action: RelationsAction,
    },
}

#[derive(Subcommand)]
enum SyncAction {
    /// Run one reconciliation pass.
    ///
    /// Exits non-zero if any table failed or was only partially written.
    Run {
        /// Only pull records modified since the table's last successful sync.
        #[arg(long)]
        fast: bool,

        /// Restrict the pass to one table.
        table: Option<String>,
    },

    /// Show record ids present on only one side.
    Diff { table: Option<String> },

    /// Poll both sides and sync tables whose content drifted.
    Watch {
        /// Poll interval in seconds (defaults to `[poller].interval_secs`).
        #[arg(long)]
        interval: Option<u64>,
    },
}

#[derive(Subcommand)]
enum RelationsAction {
    /// Add `from -[relation_type]-> to`. Both entities must exist.
    Add {
        from: String,
        to: String,
        relation_type: String,
    },

    /// Show outgoing and incoming relations of an entity.
    Get { id: String },

    /// Show relations of one type pointing at an entity.
    Find { relation_type: String, id: String },

    /// Walk outgoing relations breadth-first.
    Graph {
        id: String,

        /// Maximum hops from the root (defaults to `[graph].default_depth`).
        #[arg(long)]
        depth: Option<usize>,
    },

    /// Report orphaned entities and edges pointing at missing entities.
    Audit,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("opsync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg).await?;
        }
        Commands::Sync { action } => match action {
            SyncAction::Run { fast, table } => {
                sync_cmd::run_sync(&cfg, fast, table).await?;
            }
            SyncAction::Diff { table } => {
                sync_cmd::run_diff(&cfg, table).await?;
            }
            SyncAction::Watch { interval } => {
                sync_cmd::run_watch(&cfg, interval).await?;
            }
        },
        Commands::Relations { action } => match action {
            RelationsAction::Add {
                from,
                to,
                relation_type,
            } => {
                relations_cmd::run_add(&cfg, &from, &to, &relation_type).await?;
            }
            RelationsAction::Get { id } => {
                relations_cmd::run_get(&cfg, &id).await?;
            }
            RelationsAction::Find { relation_type, id } => {
                relations_cmd::run_find(&cfg, &relation_type, &id).await?;
            }
            RelationsAction::Graph { id, depth } => {
                relations_cmd::run_graph(&cfg, &id, depth).await?;
            }
            RelationsAction::Audit => {
                relations_cmd::run_audit(&cfg).await?;
            }
        },
    }

    Ok(())
}
