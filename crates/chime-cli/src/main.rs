use std::path::Path;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::info;

use chime_core::config::ChimeConfig;
use chime_scheduler::{SqliteStore, Task, TaskStore};

/// Fallback when RUST_LOG is unset. The binary target's own logs land
/// under `chime`; the engine crate logs under its crate name.
const DEFAULT_LOG_FILTER: &str = "chime=info,chime_scheduler=info";

/// Manage the chime task catalogue.
#[derive(Debug, Parser)]
#[command(name = "chime", version, about)]
struct Cli {
    /// Config file path (default: ~/.chime/chime.toml).
    #[arg(long, env = "CHIME_CONFIG", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a one-shot delay task.
    Delay {
        /// Task type — must have a callback registered in the consuming app.
        #[arg(long)]
        task_type: String,
        /// Subject identifier handed to the callback.
        #[arg(long)]
        subject: String,
        /// Seconds from now until the task fires.
        #[arg(long)]
        delay: u64,
    },
    /// Create a recurring loop task.
    Loop {
        #[arg(long)]
        task_type: String,
        #[arg(long)]
        subject: String,
        /// Seconds between recurrences.
        #[arg(long)]
        interval: u64,
        /// RFC 3339 start of the validity window (default: now).
        #[arg(long)]
        start: Option<DateTime<Utc>>,
        /// RFC 3339 end of the validity window.
        #[arg(long)]
        end: Option<DateTime<Utc>>,
        /// Fire the first occurrence at start + interval instead of at start.
        #[arg(long)]
        no_first: bool,
    },
    /// Print the task catalogue.
    List,
    /// Mark a task finished so it never fires again.
    Cancel { id: String },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .init();

    let cli = Cli::parse();

    let config = ChimeConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        ChimeConfig::default()
    });

    let store = SqliteStore::open(Path::new(&config.database.path))?;

    match cli.command {
        Command::Delay {
            task_type,
            subject,
            delay,
        } => {
            let task = Task::delay(&task_type, &subject, delay)?;
            store.insert(&task)?;
            info!(path = %config.database.path, "task stored");
            println!("{}", task.id);
        }
        Command::Loop {
            task_type,
            subject,
            interval,
            start,
            end,
            no_first,
        } => {
            let task = Task::looping(&task_type, &subject, interval, start, end, !no_first)?;
            store.insert(&task)?;
            info!(path = %config.database.path, "task stored");
            println!("{}", task.id);
        }
        Command::List => {
            for task in store.list()? {
                let kind = match task.interval {
                    Some(secs) => format!("loop/{secs}s"),
                    None => "delay".to_string(),
                };
                let flags = match (task.finished, task.claimed) {
                    (true, _) => "finished",
                    (false, true) => "claimed",
                    (false, false) => "pending",
                };
                println!(
                    "{}  {:<10} {:<20} {:<24} next={} [{}]",
                    task.id,
                    kind,
                    task.task_type,
                    task.subject,
                    task.next_time.to_rfc3339(),
                    flags
                );
            }
        }
        Command::Cancel { id } => {
            store.cancel(&id)?;
            println!("cancelled {id}");
        }
    }

    Ok(())
}
