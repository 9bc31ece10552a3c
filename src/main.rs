use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::Level;

use scribe_core::ids::SessionId;
use scribe_store::{CreateSession, ExportFormat, SearchEngine, SessionStatus, SessionStore};
use scribe_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "scribe", about = "Persistent conversation store for coding sessions")]
struct Cli {
    /// Base data directory (defaults to ~/.scribe).
    #[arg(long, global = true)]
    base: Option<PathBuf>,

    /// Show info-level logs instead of warnings only.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new session.
    New {
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// List sessions, most recent first.
    List {
        #[arg(long, default_value = "active")]
        status: String,
        #[arg(long)]
        project: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Print a session's messages.
    Show {
        session: String,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Full-text search across all sessions.
    Search {
        query: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Export a session transcript.
    Export {
        session: String,
        #[arg(long, default_value = "markdown")]
        format: String,
        /// Write to a file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Fork a session into a new one.
    Branch {
        session: String,
        /// Copy only the first N messages.
        #[arg(long)]
        at: Option<u64>,
    },
    /// Delete a session (soft by default).
    Delete {
        session: String,
        /// Remove the data permanently instead of hiding the session.
        #[arg(long)]
        hard: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        log_level: if cli.verbose { Level::INFO } else { Level::WARN },
        json: false,
        ..Default::default()
    });

    let base = match &cli.base {
        Some(base) => base.clone(),
        None => default_base()?,
    };
    let store = SessionStore::open(&base).context("open session store")?;

    match cli.command {
        Command::New {
            title,
            project,
            model,
        } => {
            let session = store.create(CreateSession {
                title,
                project_path: project,
                model,
                ..Default::default()
            })?;
            println!("{}", session.id);
        }
        Command::List {
            status,
            project,
            limit,
        } => {
            let status: SessionStatus = status.parse().map_err(anyhow::Error::msg)?;
            let sessions = store.list_by_status(status, project.as_deref(), limit)?;
            if sessions.is_empty() {
                println!("no sessions");
            }
            for session in sessions {
                println!(
                    "{}  {:>4} msgs  {}  {}",
                    session.id,
                    session.message_count,
                    &session.updated_at[..session.updated_at.len().min(19)],
                    session.title.as_deref().unwrap_or("(untitled)"),
                );
            }
        }
        Command::Show {
            session,
            offset,
            limit,
        } => {
            let id = SessionId::from_raw(session);
            if store.load(&id)?.is_none() {
                bail!("unknown session: {id}");
            }
            let (messages, skipped) = store.messages(&id, offset, limit)?;
            for message in messages {
                println!(
                    "[{}] {}: {}",
                    message.sequence_index, message.record.role, message.record.content
                );
            }
            if skipped > 0 {
                eprintln!("warning: {skipped} unreadable log lines skipped");
            }
        }
        Command::Search { query, limit } => {
            let engine = SearchEngine::new(store.index());
            let hits = engine.search(&query.join(" "), limit)?;
            if hits.is_empty() {
                println!("no matches");
            }
            for hit in hits {
                println!(
                    "{}  {}  {}",
                    hit.session_id,
                    hit.session_title.as_deref().unwrap_or("(untitled)"),
                    hit.snippet,
                );
            }
        }
        Command::Export {
            session,
            format,
            out,
        } => {
            let format: ExportFormat = format.parse().map_err(anyhow::Error::msg)?;
            let rendered = store.export(&SessionId::from_raw(session), format)?;
            match out {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("write {}", path.display()))?;
                    println!("wrote {}", path.display());
                }
                None => print!("{rendered}"),
            }
        }
        Command::Branch { session, at } => {
            let branch = store.branch(&SessionId::from_raw(session), at)?;
            println!("{}", branch.id);
        }
        Command::Delete { session, hard } => {
            let id = SessionId::from_raw(session);
            store.delete(&id, hard)?;
            println!("deleted {id}{}", if hard { " (hard)" } else { "" });
        }
    }

    Ok(())
}

fn default_base() -> anyhow::Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME is not set; pass --base")?;
    Ok(PathBuf::from(home).join(".scribe"))
}
