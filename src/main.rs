//! # Stepwise CLI (`stepwise`)
//!
//! Drives the autopilot from a terminal: build and query the workspace
//! index, start jobs, review and approve staged steps, and run the HTTP
//! server.
//!
//! ## Usage
//!
//! ```bash
//! stepwise --config ./config/stepwise.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `stepwise index build <root>` | Chunk, embed and save the workspace index |
//! | `stepwise index status <root>` | Show index size, model and age |
//! | `stepwise search <root> "<query>"` | Ranked matches from the index |
//! | `stepwise job start <root> "<goal>"` | Plan a job and stage its first step |
//! | `stepwise job status <root> <id>` | Show a job with its steps and log |
//! | `stepwise job approve <root> <id>` | Apply the waiting step, test, advance |
//! | `stepwise job abort <root> <id>` | Abort a job |
//! | `stepwise job list <root>` | List persisted jobs |
//! | `stepwise job discard <root> <file>` | Drop a staged file |
//! | `stepwise serve` | Start the HTTP server |
//!
//! Logs go to stderr and are filtered with `RUST_LOG` (default
//! `stepwise=info`).

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use stepwise::config::{self, Config};
use stepwise::engine::{ApproveRequest, Engine, StartRequest};
use stepwise::indexer::{index_status, pack_context, rebuild_index, search_index};
use stepwise::models::Job;
use stepwise::server;
use stepwise::stager;

/// Stepwise CLI: plan, stage, review, apply and test AI-proposed code edits.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/stepwise.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "stepwise",
    about = "Stepwise: an autopilot for reviewable, tested code edits",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Defaults are used when the file
    /// does not exist.
    #[arg(long, global = true, default_value = "./config/stepwise.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the workspace index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Search the workspace index.
    Search {
        /// Workspace root.
        root: PathBuf,
        /// The search query string.
        query: String,
        /// Maximum number of matches.
        #[arg(long, default_value_t = 8)]
        k: usize,
        /// Print the packed context block instead of a match list.
        #[arg(long)]
        packed: bool,
    },

    /// Start, inspect and drive autopilot jobs.
    Job {
        #[command(subcommand)]
        action: JobAction,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Rebuild the index for a workspace.
    Build { root: PathBuf },
    /// Show index status for a workspace.
    Status { root: PathBuf },
}

#[derive(Subcommand)]
enum JobAction {
    /// Plan a new job and run it until the first approval pause.
    Start {
        root: PathBuf,
        goal: String,
        /// Chat provider id (`auto`, `anthropic`, `openai`, `mock`).
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Show a job.
    Status { root: PathBuf, id: String },
    /// Approve the waiting step. With `--file`, only the named files are
    /// applied; the rest stay staged.
    Approve {
        root: PathBuf,
        id: String,
        #[arg(long = "file")]
        files: Vec<String>,
    },
    /// Abort a job.
    Abort { root: PathBuf, id: String },
    /// List persisted jobs.
    List { root: PathBuf },
    /// Remove a staged file and its review artifacts.
    Discard { root: PathBuf, file: String },
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stepwise=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config_or_default(&cli.config)?;

    match cli.command {
        Commands::Index { action } => match action {
            IndexAction::Build { root } => run_index_build(cfg, &root).await?,
            IndexAction::Status { root } => {
                let status = index_status(&cfg, &root);
                if status.ready {
                    println!(
                        "Index ready: {} items, model {}, updated {}",
                        status.items,
                        status.model.unwrap_or_default(),
                        status
                            .updated_at
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_default()
                    );
                } else {
                    println!("No index for {}. Run `stepwise index build`.", root.display());
                }
            }
        },
        Commands::Search {
            root,
            query,
            k,
            packed,
        } => run_search(cfg, &root, &query, k, packed).await?,
        Commands::Job { action } => run_job(cfg, action).await?,
        Commands::Serve => {
            let engine = Arc::new(Engine::from_config(cfg)?);
            server::run_server(engine).await?;
        }
    }

    Ok(())
}

async fn run_index_build(cfg: Config, root: &Path) -> Result<()> {
    if !cfg.embedding.is_enabled() {
        bail!("Embedding provider is disabled; nothing to index.");
    }
    let engine = Engine::from_config(cfg)?;
    let status = rebuild_index(engine.config(), root, engine.embedder()).await?;
    println!(
        "Indexed {} items with {}.",
        status.items,
        status.model.unwrap_or_default()
    );
    Ok(())
}

async fn run_search(cfg: Config, root: &Path, query: &str, k: usize, packed: bool) -> Result<()> {
    if !cfg.embedding.is_enabled() {
        bail!("Embedding provider is disabled; search needs an index.");
    }
    let engine = Engine::from_config(cfg)?;
    let config = engine.config();
    let matches = search_index(config, root, engine.embedder(), query, k).await?;

    if packed {
        println!("{}", pack_context(&matches, config.retrieval.search_budget_chars));
        return Ok(());
    }
    if matches.is_empty() {
        println!("No matches.");
        return Ok(());
    }
    for (i, m) in matches.iter().enumerate() {
        println!(
            "{}. [{:.3}] {}:{}-{}",
            i + 1,
            m.score,
            m.item.file_path,
            m.item.line_start,
            m.item.line_end
        );
    }
    Ok(())
}

async fn run_job(cfg: Config, action: JobAction) -> Result<()> {
    match action {
        JobAction::List { root } => {
            let store = stepwise::store::FileJobStore::new(cfg.workspace.state_dir.clone());
            let jobs = store.list(&root);
            if jobs.is_empty() {
                println!("No jobs.");
            }
            for job in jobs {
                let s = job.summary();
                println!(
                    "{}  {:<18} {} step(s)  {}",
                    s.id,
                    s.state.as_str(),
                    s.step_count,
                    s.goal_preview
                );
            }
            return Ok(());
        }
        JobAction::Discard { root, file } => {
            let rel = stager::normalize_target(&cfg, &file).map_err(anyhow::Error::msg)?;
            if stager::discard(&cfg, &root, &rel)? {
                println!("Discarded staged {}", rel);
            } else {
                println!("Nothing staged for {}", rel);
            }
            return Ok(());
        }
        _ => {}
    }

    let engine = Engine::from_config(cfg)?;
    match action {
        JobAction::Start {
            root,
            goal,
            provider,
            model,
        } => {
            let job = engine
                .start(StartRequest {
                    workspace_root: root.to_string_lossy().into_owned(),
                    goal_prompt: goal,
                    provider,
                    model,
                })
                .await?;
            print_job(&job);
        }
        JobAction::Status { root, id } => {
            let job = engine.recover(&root, &id).await?;
            print_job(&job);
        }
        JobAction::Approve { root, id, files } => {
            engine.recover(&root, &id).await?;
            let outcome = engine
                .approve(
                    &id,
                    ApproveRequest {
                        approve_all: files.is_empty(),
                        selected_files: Some(files),
                    },
                )
                .await?;
            println!(
                "Step {}/{}: applied {}, skipped {}.",
                outcome.current_step, outcome.total_steps, outcome.applied, outcome.skipped
            );
            print_job(&engine.status(&id).await?);
        }
        JobAction::Abort { root, id } => {
            engine.recover(&root, &id).await?;
            let job = engine.abort(&id).await?;
            print_job(&job);
        }
        JobAction::List { .. } | JobAction::Discard { .. } => {}
    }
    Ok(())
}

fn print_job(job: &Job) {
    println!("Job {} [{}]", job.id, job.state);
    println!("Goal: {}", job.goal_prompt);
    for (i, step) in job.steps.iter().enumerate() {
        let marker = if job.waiting_step_id.as_deref() == Some(step.id.as_str()) {
            "▶"
        } else {
            " "
        };
        println!("{} {}. {} ({:?})", marker, i + 1, step.title, step.status);
        for file in step.patch_files() {
            println!("      {}", file);
        }
        if let Some(result) = &step.test_result {
            println!(
                "      tests: {}",
                if result.passed { "passed" } else { "failed" }
            );
        }
    }
    if let Some(last) = job.log.last() {
        println!("Last: {}", last.message);
    }
}
