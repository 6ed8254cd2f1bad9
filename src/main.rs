//! # chatvault CLI
//!
//! The `chatvault` binary is the primary interface to the local chat-export
//! store. It provides commands for database initialization, archive import,
//! listing, full-text search, chunk building, dataset exports, AI-pattern
//! jobs, and the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! chatvault --config ./chatvault.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chatvault init` | Create the SQLite database and run schema migrations |
//! | `chatvault import <archive>` | Ingest an export ZIP (or conversations.json) |
//! | `chatvault list` | List conversations |
//! | `chatvault search "<query>"` | Ranked full-text search over messages |
//! | `chatvault chunk` | Build overlapping chunks for every conversation |
//! | `chatvault export <shape>` | Markdown / JSONL / pairs / vault exports |
//! | `chatvault stats` | Corpus totals |
//! | `chatvault projects` | Projects with conversation counts |
//! | `chatvault jobs <action>` | Submit, list, inspect, delete AI-pattern jobs |
//! | `chatvault serve` | Start the HTTP API server |
//!
//! ## Exit codes
//!
//! 0 success, 1 argument error, 2 parse failure, 3 I/O failure,
//! 4 subprocess failure.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use chatvault::archive::ArchiveError;
use chatvault::chunk::ChunkParams;
use chatvault::config;
use chatvault::jobs::{Coordinator, SubmitRequest, WorkerSpawner};
use chatvault::models::JobType;
use chatvault::redact::Redactor;
use chatvault::worker::SubprocessError;
use chatvault::{chunk, db, export, ingest, migrate, search, server, stats, store, worker};

const DEFAULT_CONFIG: &str = "chatvault.toml";

/// chatvault — offline explorer and transformer for chat-history exports.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file; the database and cache paths can also be overridden directly.
#[derive(Parser)]
#[command(
    name = "chatvault",
    about = "Offline chat-export explorer: import, search, chunk, export, and run AI-pattern jobs",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Override the database file path.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Override the job artifact cache directory.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite file, all tables, the FTS index, and its triggers.
    /// Idempotent — running it multiple times is safe.
    Init,

    /// Import an official export archive.
    ///
    /// Accepts the export ZIP or a bare conversations.json. Records already
    /// present (same content hash) are skipped unless --force is given.
    Import {
        /// Path to the export ZIP or conversations.json.
        archive: PathBuf,

        /// Re-ingest conversations whose content hash is already present.
        #[arg(long)]
        force: bool,
    },

    /// List conversations, newest first.
    List {
        #[arg(long, default_value_t = 50)]
        limit: i64,

        #[arg(long, default_value_t = 0)]
        offset: i64,

        /// Case-insensitive title substring filter.
        #[arg(long)]
        search: Option<String>,

        /// Only conversations belonging to this gizmo/project.
        #[arg(long)]
        gizmo: Option<String>,
    },

    /// Ranked full-text search over message content.
    ///
    /// Uses the FTS index with bm25 ranking; input the FTS parser rejects
    /// silently degrades to a substring scan.
    Search {
        query: String,

        #[arg(long)]
        limit: Option<i64>,
    },

    /// Build overlapping chunks for every conversation.
    ///
    /// Re-running with identical parameters reproduces identical chunk rows;
    /// new parameters replace each conversation's chunk set.
    Chunk {
        /// Target chunk size in characters.
        #[arg(long)]
        target_size: Option<usize>,

        /// Overlap between consecutive chunks in characters.
        #[arg(long)]
        overlap: Option<usize>,
    },

    /// Export the corpus in one of four deterministic shapes.
    Export {
        #[command(subcommand)]
        shape: ExportShape,
    },

    /// Show corpus totals.
    Stats,

    /// List projects with conversation counts.
    Projects,

    /// Manage AI-pattern jobs.
    Jobs {
        #[command(subcommand)]
        action: JobAction,
    },

    /// Start the HTTP API server.
    Serve,

    /// Execute one job (spawned by the coordinator).
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        job_id: String,
    },
}

#[derive(Subcommand)]
enum ExportShape {
    /// One markdown document for a single conversation.
    Md {
        /// Conversation id.
        id: String,

        /// Output file path.
        #[arg(long)]
        out: PathBuf,

        /// Redact obvious PII in the output.
        #[arg(long)]
        redact: bool,
    },

    /// All messages as JSON Lines, ordered by (conversation, turn).
    Jsonl {
        #[arg(long)]
        out: PathBuf,

        #[arg(long)]
        redact: bool,
    },

    /// Adjacent user→assistant training pairs as JSON Lines.
    Pairs {
        #[arg(long)]
        out: PathBuf,

        #[arg(long)]
        redact: bool,
    },

    /// One markdown document per conversation plus an INDEX.md.
    Obsidian {
        #[arg(long)]
        out_dir: PathBuf,

        #[arg(long)]
        redact: bool,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Submit a job; returns the existing one on a cache or dedup hit.
    Submit {
        /// Job type: conversation or project.
        #[arg(long = "type", value_name = "TYPE")]
        job_type: String,

        #[arg(long)]
        target_id: String,

        #[arg(long)]
        target_name: Option<String>,

        #[arg(long)]
        pattern: String,
    },

    /// List all jobs, newest first.
    List,

    /// Show one job as JSON.
    Get { id: String },

    /// Delete a job row and its cached artifact.
    Delete { id: String },

    /// Probe the cache/dedup state for a target and pattern.
    Check {
        #[arg(long)]
        target_id: String,

        #[arg(long)]
        pattern: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version are not argument errors.
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let default_level = match &cli.command {
        Commands::Serve | Commands::Worker { .. } => "info",
        _ => "warn",
    };
    init_tracing(default_level);

    match run(cli).await {
        Ok(()) => {}
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(exit_code_for(&e));
        }
    }
}

fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Map an error chain onto the documented exit codes.
fn exit_code_for(e: &anyhow::Error) -> i32 {
    for cause in e.chain() {
        if let Some(archive_err) = cause.downcast_ref::<ArchiveError>() {
            return match archive_err {
                ArchiveError::Io(_) => 3,
                _ => 2,
            };
        }
        if cause.downcast_ref::<SubprocessError>().is_some() {
            return 4;
        }
        if cause.downcast_ref::<sqlx::Error>().is_some()
            || cause.downcast_ref::<std::io::Error>().is_some()
        {
            return 3;
        }
    }
    1
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let explicit_config = cli.config != PathBuf::from(DEFAULT_CONFIG);
    let mut config = config::load_or_default(&cli.config, explicit_config)?;
    if let Some(db_path) = &cli.db {
        config.db.path = db_path.clone();
    }
    if let Some(cache_dir) = &cli.cache_dir {
        config.cache.dir = cache_dir.clone();
    }
    let config_path = cli.config.exists().then(|| cli.config.clone());

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config.db.path).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized at {}", config.db.path.display());
        }

        Commands::Import { archive, force } => {
            let pool = db::connect(&config.db.path).await?;
            migrate::run_migrations(&pool).await?;
            let report = ingest::run_import(&pool, &archive, force).await?;
            println!("import {}", archive.display());
            println!("  conversations added: {}", report.conversations_added);
            println!("  messages added: {}", report.messages_added);
            println!("  skipped: {}", report.skipped);
            println!("  failed records: {}", report.failed_records);
            println!("ok");
        }

        Commands::List {
            limit,
            offset,
            search,
            gizmo,
        } => {
            let pool = db::connect(&config.db.path).await?;
            migrate::run_migrations(&pool).await?;
            let filter = store::ConversationFilter {
                limit,
                offset,
                search,
                gizmo_id: gizmo,
            };
            let conversations = store::list_conversations(&pool, &filter).await?;
            for conv in &conversations {
                let id8: String = conv.id.chars().take(8).collect();
                println!("{}  {:>5}  {}", id8, conv.message_count, conv.title);
            }
        }

        Commands::Search { query, limit } => {
            let pool = db::connect(&config.db.path).await?;
            migrate::run_migrations(&pool).await?;
            let limit = limit.unwrap_or(config.retrieval.limit);
            let hits = search::search_messages(&pool, &query, limit).await?;
            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                println!(
                    "{}. [{:.3}] {}  {}",
                    i + 1,
                    hit.rank,
                    hit.role,
                    hit.snippet.replace('\n', " ")
                );
                println!("    conversation: {}", hit.conversation_id);
                println!("    message: {}", hit.message_id);
            }
        }

        Commands::Chunk {
            target_size,
            overlap,
        } => {
            let pool = db::connect(&config.db.path).await?;
            migrate::run_migrations(&pool).await?;
            let params = ChunkParams {
                target_size: target_size.unwrap_or(config.chunking.target_size),
                overlap: overlap.unwrap_or(config.chunking.overlap),
            };
            let report = chunk::run_chunk(&pool, params).await?;
            println!(
                "chunked {} chunks across {} conversations",
                report.chunks, report.conversations
            );
        }

        Commands::Export { shape } => {
            let pool = db::connect(&config.db.path).await?;
            migrate::run_migrations(&pool).await?;
            match shape {
                ExportShape::Md { id, out, redact } => {
                    let mut redactor = redact.then(Redactor::new);
                    let doc = export::conversation_markdown(&pool, &id, redactor.as_mut()).await?;
                    if let Some(parent) = out.parent() {
                        if !parent.as_os_str().is_empty() {
                            std::fs::create_dir_all(parent)?;
                        }
                    }
                    std::fs::write(&out, doc)?;
                    println!("Wrote {}", out.display());
                }
                ExportShape::Jsonl { out, redact } => {
                    let written = export::export_messages_jsonl(&pool, &out, redact).await?;
                    println!("Wrote {} rows -> {}", written, out.display());
                }
                ExportShape::Pairs { out, redact } => {
                    let written = export::export_training_pairs(&pool, &out, redact).await?;
                    println!("Wrote {} pairs -> {}", written, out.display());
                }
                ExportShape::Obsidian { out_dir, redact } => {
                    let report = export::export_vault(&pool, &out_dir, redact).await?;
                    println!("Wrote {} files -> {}", report.files_written, out_dir.display());
                }
            }
        }

        Commands::Stats => {
            let pool = db::connect(&config.db.path).await?;
            migrate::run_migrations(&pool).await?;
            stats::run_stats(&config, &pool).await?;
        }

        Commands::Projects => {
            let pool = db::connect(&config.db.path).await?;
            migrate::run_migrations(&pool).await?;
            let projects = store::list_projects(&pool).await?;
            for project in &projects {
                println!(
                    "{}  {:>5}  {}",
                    project.gizmo_id, project.conversation_count, project.display_name
                );
            }
        }

        Commands::Jobs { action } => {
            let pool = db::connect(&config.db.path).await?;
            migrate::run_migrations(&pool).await?;
            let spawner = WorkerSpawner::from_config(&config, config_path.as_deref())?;
            let coordinator = Coordinator::new(pool.clone(), config.cache.dir.clone(), spawner);

            match action {
                JobAction::Submit {
                    job_type,
                    target_id,
                    target_name,
                    pattern,
                } => {
                    let job_type = JobType::parse(&job_type).ok_or_else(|| {
                        anyhow::anyhow!("unknown job type: {} (conversation|project)", job_type)
                    })?;
                    let job = coordinator
                        .submit(&SubmitRequest {
                            job_type,
                            target_id,
                            target_name,
                            pattern,
                        })
                        .await?;
                    println!("{}", serde_json::to_string_pretty(&job)?);
                }
                JobAction::List => {
                    for job in store::list_jobs(&pool).await? {
                        println!(
                            "{}  {:<8}  {:<12}  {:<22}  {}",
                            job.id,
                            job.status.as_str(),
                            job.job_type.as_str(),
                            job.pattern,
                            job.target_name
                        );
                    }
                }
                JobAction::Get { id } => match store::get_job(&pool, &id).await? {
                    Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
                    None => anyhow::bail!("job not found: {}", id),
                },
                JobAction::Delete { id } => {
                    if coordinator.delete(&id).await? {
                        println!("Deleted {}", id);
                    } else {
                        anyhow::bail!("job not found: {}", id);
                    }
                }
                JobAction::Check { target_id, pattern } => {
                    match coordinator.check(&target_id, &pattern).await? {
                        Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
                        None => println!("null"),
                    }
                }
            }
        }

        Commands::Serve => {
            server::run_server(&config, config_path).await?;
        }

        Commands::Worker { job_id } => {
            worker::run_worker(&config, &job_id).await?;
        }
    }

    Ok(())
}
