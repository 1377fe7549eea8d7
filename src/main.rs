//! # Manual Copilot CLI (`copilot`)
//!
//! Upload equipment manuals, index them per unit, and ask questions
//! answered from the indexed pages with unit and page citations.
//!
//! ## Usage
//!
//! ```bash
//! copilot --config ./config/copilot.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `copilot init` | Create the SQLite database and schema |
//! | `copilot upload <unit> <file>` | Store and index a manual for a unit |
//! | `copilot reindex <unit>` | Re-index a unit from its stored file |
//! | `copilot delete <unit>` | Delete a unit's manual and index |
//! | `copilot manuals` | List registered manuals |
//! | `copilot ask "<message>"` | Answer a question from the manuals |
//! | `copilot stats` | Index statistics |
//! | `copilot serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! copilot upload 102 ./manuals/press-102.pdf --description "Hydraulic press"
//! copilot ask "What are the hydraulic specs for unit 102?"
//! copilot ask "Which hoses fit unit 102?" --plan
//! ```
//!
//! Log verbosity is read from `COPILOT_LOG` (default `info`); logs go to
//! stderr.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

use manual_copilot::app::App;
use manual_copilot::chat::ChatRequest;
use manual_copilot::ingest::{IndexOutcome, Upload};
use manual_copilot::{config, migrate, server, stats};

/// Manual Copilot: answers about equipment, grounded in each unit's manual.
#[derive(Parser)]
#[command(name = "copilot", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/copilot.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Store a manual for a unit and index it.
    Upload {
        /// Unit number the manual belongs to.
        unit: String,
        /// PDF or plain-text manual.
        file: PathBuf,
        /// Free-text description of the unit.
        #[arg(long)]
        description: Option<String>,
        /// Overwrite an existing manual for the unit.
        #[arg(long)]
        replace: bool,
    },

    /// Re-index a unit from its stored manual.
    Reindex { unit: String },

    /// Delete a unit's manual, stored file and index.
    Delete { unit: String },

    /// List registered manuals.
    Manuals,

    /// Answer a question from the indexed manuals.
    Ask {
        message: String,
        /// Show which lookups the question triggers instead of answering.
        #[arg(long)]
        plan: bool,
    },

    /// Show index statistics.
    Stats,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("COPILOT_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "copilot", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Upload {
            unit,
            file,
            description,
            replace,
        } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let filename = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let app = App::open(&cfg).await?;
            let outcome = app
                .manuals
                .upload(Upload {
                    unit,
                    filename,
                    description,
                    bytes,
                    replace,
                })
                .await?;
            report_outcome(&outcome)?;
        }
        Commands::Reindex { unit } => {
            let app = App::open(&cfg).await?;
            let outcome = app.manuals.reindex(&unit).await?;
            report_outcome(&outcome)?;
        }
        Commands::Delete { unit } => {
            let app = App::open(&cfg).await?;
            app.manuals.delete(&unit).await?;
            println!("Deleted manual for unit {}.", unit.trim());
        }
        Commands::Manuals => {
            let app = App::open(&cfg).await?;
            let manuals = app.manuals.list().await?;
            if manuals.is_empty() {
                println!("No manuals registered.");
            }
            for m in &manuals {
                println!(
                    "{:<16} {:<8} {:>5} pages {:>6} chunks  {}",
                    m.unit, m.status.as_str(), m.page_count, m.chunk_count, m.filename
                );
                if let Some(detail) = &m.status_detail {
                    println!("{:<16} {}", "", detail);
                }
            }
        }
        Commands::Ask { message, plan } => {
            let app = App::open(&cfg).await?;
            if plan {
                let plan = app.chat.plan(&message).await?;
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                let answer = app
                    .chat
                    .ask(&ChatRequest {
                        message,
                        history: Vec::new(),
                    })
                    .await?;
                println!("{}", answer.text);
                if !answer.sources.is_empty() {
                    println!();
                    println!("Sources:");
                    for s in &answer.sources {
                        println!("  [Unit {} | {} | Page {}] ({})", s.unit, s.filename, s.page, s.mode.as_str());
                    }
                }
                if !answer.verified {
                    println!();
                    println!("Warning: the answer cites pages that were not retrieved.");
                }
            }
        }
        Commands::Stats => {
            let app = App::open(&cfg).await?;
            stats::run_stats(&app).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn report_outcome(outcome: &IndexOutcome) -> Result<()> {
    let m = &outcome.manual;
    match &outcome.report {
        Some(report) => {
            println!(
                "Indexed unit {}: {} pages, {} chunks ({} embedded, {} reused).",
                m.unit, report.pages, report.chunks, report.embedded, report.reused
            );
            Ok(())
        }
        None => bail!(
            "Manual for unit {} stored but indexing failed: {}",
            m.unit,
            m.status_detail.as_deref().unwrap_or("unknown error")
        ),
    }
}
