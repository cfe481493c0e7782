//! Administrative commands over a local sync store
//!
//! The store is opened offline with no handlers registered, so no command
//! ever contacts the backend: resolutions and cancellations only change the
//! local queue, which the app drains on its next sync.
//!
//! The store can only be opened while no app engine holds it; commands
//! against a live store fail instead of diverging from the app's state.
//!
//! # Example Usage
//!
//! ```bash
//! medsync --db medicamenta_sync.db summary
//! medsync list --status pending-retry
//! medsync conflicts --json
//! medsync resolve 5f0c...e1 server-wins
//! medsync clear-completed
//! ```

use std::fmt::{self, Write as _};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use medicamenta_sync::{
    Connectivity, OperationStatus, QueuedOperation, ResolutionKind, ResolutionStrategy,
    SqliteStoreConfig, SyncConfig, SyncConflict, SyncEngine,
};
use serde::Serialize;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "medsync")]
#[command(about = "Inspect and maintain the Medicamenta offline sync store")]
pub struct Cli {
    /// Path to the local sync database
    #[arg(long, env = "MEDICAMENTA_SYNC_DB", default_value = "medicamenta_sync.db")]
    pub db: PathBuf,

    /// Engine configuration file (environment overrides still apply)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Queue counts, sync totals and effective configuration
    Summary,
    /// List queued operations in dispatch order
    List {
        /// Only operations in this status (pending, pending-retry, processing, completed, discarded, conflicted)
        #[arg(long)]
        status: Option<String>,
    },
    /// List unresolved conflicts
    Conflicts,
    /// Resolve a conflict
    Resolve {
        id: Uuid,
        /// local-wins, server-wins or merge
        strategy: String,
        /// Merged document (JSON), required for merge
        #[arg(long)]
        payload: Option<String>,
    },
    /// Cancel a still-pending operation
    Cancel { id: Uuid },
    /// Delete completed operations
    ClearCompleted,
    /// Delete discarded and conflicted operations
    ClearDiscarded,
    /// Delete resolved conflicts
    ClearResolved,
    /// Show the effective engine configuration
    Config,
}

#[derive(Serialize)]
struct Cleared {
    removed: usize,
}

/// Run `cli.command` and return the text to print
pub async fn run(cli: &Cli) -> Result<String> {
    let config = SyncConfig::load(cli.config.as_deref()).context("Failed to load sync configuration")?;

    // No need to create a store just to print configuration
    if cli.command == Command::Config {
        return render(cli.json, &config, || Ok(format!("{config:#?}\n")));
    }

    let engine = SyncEngine::builder()
        .config(config)
        .connectivity(Connectivity::new(false))
        .open_sqlite(&SqliteStoreConfig::at(&cli.db))
        .await
        .with_context(|| format!("Failed to open sync store {}", cli.db.display()))?;

    let output = execute(&engine, cli).await;
    engine.shutdown().await;
    output
}

async fn execute(engine: &SyncEngine, cli: &Cli) -> Result<String> {
    match &cli.command {
        Command::Summary => {
            let summary = engine.orchestrator().queue_summary().await;
            render(cli.json, &summary, || {
                let queue = &summary.queue;
                let mut out = String::new();
                writeln!(out, "Operations:   {}", queue.total)?;
                writeln!(out, "  pending:        {}", queue.pending)?;
                writeln!(out, "  pending-retry:  {}", queue.pending_retry)?;
                writeln!(out, "  processing:     {}", queue.processing)?;
                writeln!(out, "  completed:      {}", queue.completed)?;
                writeln!(out, "  discarded:      {}", queue.discarded)?;
                writeln!(out, "  conflicted:     {}", queue.conflicted)?;
                writeln!(
                    out,
                    "Waiting by priority: critical={} high={} normal={} low={}",
                    queue.critical_pending, queue.high_pending, queue.normal_pending, queue.low_pending
                )?;
                writeln!(out, "Held documents: {}", queue.held_documents)?;
                writeln!(out, "Unresolved conflicts: {}", summary.unresolved_conflicts)?;
                if let Some(oldest) = queue.oldest_pending_at {
                    writeln!(out, "Oldest waiting: {}", oldest.to_rfc3339())?;
                }
                Ok(out)
            })
        }
        Command::List { status } => {
            let operations = match status {
                Some(status) => {
                    let status: OperationStatus = status.parse()?;
                    engine.queue().list_by_status(status).await
                }
                None => engine.queue().snapshot().await,
            };
            render(cli.json, &operations, || format_operations(&operations))
        }
        Command::Conflicts => {
            let conflicts = engine.conflicts().unresolved_conflicts().await;
            render(cli.json, &conflicts, || format_conflicts(&conflicts))
        }
        Command::Resolve {
            id,
            strategy,
            payload,
        } => {
            let strategy = match strategy.parse::<ResolutionKind>()? {
                ResolutionKind::LocalWins => ResolutionStrategy::LocalWins,
                ResolutionKind::ServerWins => ResolutionStrategy::ServerWins,
                ResolutionKind::Merge => {
                    let Some(payload) = payload else {
                        bail!("merge requires --payload");
                    };
                    let merged = serde_json::from_str(payload).context("Invalid --payload JSON")?;
                    ResolutionStrategy::Merge(merged)
                }
            };
            let outcome = engine.orchestrator().resolve_conflict(*id, strategy).await?;
            tracing::info!(conflict_id = %id, "Conflict resolved from the command line");

            render(cli.json, &outcome.conflict, || {
                let mut out = format!(
                    "Resolved {} ({}/{})\n",
                    id, outcome.conflict.collection, outcome.conflict.document_id
                );
                if let Some(enqueued) = outcome.enqueued {
                    writeln!(out, "Queued update {enqueued}")?;
                }
                if !outcome.cancelled.is_empty() {
                    writeln!(out, "Cancelled {} pending operation(s)", outcome.cancelled.len())?;
                }
                Ok(out)
            })
        }
        Command::Cancel { id } => {
            if !engine.queue().dequeue(*id).await? {
                bail!("Operation {id} is not pending (or does not exist)");
            }
            Ok(format!("Cancelled {id}\n"))
        }
        Command::ClearCompleted => {
            let removed = engine.queue().clear_completed().await?;
            render(cli.json, &Cleared { removed }, || Ok(format!("Removed {removed} completed operation(s)\n")))
        }
        Command::ClearDiscarded => {
            let removed = engine.queue().clear_discarded().await?;
            render(cli.json, &Cleared { removed }, || Ok(format!("Removed {removed} discarded operation(s)\n")))
        }
        Command::ClearResolved => {
            let removed = engine.conflicts().clear_resolved().await?;
            render(cli.json, &Cleared { removed }, || Ok(format!("Removed {removed} resolved conflict(s)\n")))
        }
        Command::Config => {
            let config = engine.orchestrator().config().snapshot();
            render(cli.json, &config, || Ok(format!("{config:#?}\n")))
        }
    }
}

fn render<T: Serialize>(
    json: bool,
    value: &T,
    text: impl FnOnce() -> Result<String, fmt::Error>,
) -> Result<String> {
    if json {
        let mut out = serde_json::to_string_pretty(value)?;
        out.push('\n');
        Ok(out)
    } else {
        Ok(text()?)
    }
}

fn format_operations(operations: &[QueuedOperation]) -> Result<String, fmt::Error> {
    if operations.is_empty() {
        return Ok("No operations\n".to_string());
    }

    let mut out = String::new();
    for operation in operations {
        write!(
            out,
            "{}  {:<13} {:<8} {:<6} {}",
            operation.id,
            operation.status,
            operation.priority,
            operation.operation_type,
            operation.collection,
        )?;
        if let Some(document_id) = &operation.document_id {
            write!(out, "/{document_id}")?;
        }
        if operation.retry_count > 0 {
            write!(out, "  retries={}/{}", operation.retry_count, operation.max_retries)?;
        }
        if let Some(error) = &operation.last_error {
            write!(out, "  error=\"{}\"", medicamenta_logging::redact(error))?;
        }
        out.push('\n');
    }
    Ok(out)
}

fn format_conflicts(conflicts: &[SyncConflict]) -> Result<String, fmt::Error> {
    if conflicts.is_empty() {
        return Ok("No unresolved conflicts\n".to_string());
    }

    let mut out = String::new();
    for conflict in conflicts {
        let suggested = conflict.suggested_strategy().kind();
        writeln!(
            out,
            "{}  {}/{}  detected {}  suggested {}",
            conflict.id,
            conflict.collection,
            conflict.document_id,
            conflict.detected_at.to_rfc3339(),
            suggested,
        )?;
        for diff in conflict.diff_fields() {
            writeln!(
                out,
                "    {}: local={} server={}",
                if diff.field.is_empty() { "(document)" } else { diff.field.as_str() },
                diff.local_value,
                diff.server_value,
            )?;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use medicamenta_sync::{EnqueueOptions, OperationType, Priority};
    use serde_json::json;
    use tempfile::TempDir;

    fn cli(dir: &TempDir, args: &[&str]) -> Cli {
        let db = dir.path().join("sync.db");
        let mut argv = vec!["medsync", "--db", db.to_str().unwrap()];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    async fn seed(dir: &TempDir) -> Uuid {
        let engine = SyncEngine::builder()
            .connectivity(Connectivity::new(false))
            .open_sqlite(&SqliteStoreConfig::at(dir.path().join("sync.db")))
            .await
            .unwrap();
        let id = engine
            .queue()
            .enqueue(
                OperationType::Update,
                "medications",
                json!({"dose_mg": 500}),
                EnqueueOptions::for_document("med-1").with_priority(Priority::Critical),
            )
            .await
            .unwrap();
        engine.shutdown().await;
        id
    }

    #[test]
    fn test_parse_commands() {
        let parsed = Cli::try_parse_from(["medsync", "list", "--status", "pending-retry", "--json"]).unwrap();
        assert!(parsed.json);
        assert_eq!(
            parsed.command,
            Command::List {
                status: Some("pending-retry".to_string())
            }
        );

        let id = Uuid::new_v4().to_string();
        let parsed = Cli::try_parse_from(["medsync", "resolve", id.as_str(), "server-wins"]).unwrap();
        assert!(matches!(parsed.command, Command::Resolve { .. }));
        assert!(Cli::try_parse_from(["medsync", "resolve", "not-a-uuid", "server-wins"]).is_err());
    }

    #[tokio::test]
    async fn test_summary_and_list() {
        let dir = TempDir::new().unwrap();
        let id = seed(&dir).await;

        let summary = run(&cli(&dir, &["summary"])).await.unwrap();
        assert!(summary.contains("critical=1"));

        let listed = run(&cli(&dir, &["list", "--status", "pending", "--json"])).await.unwrap();
        let operations: serde_json::Value = serde_json::from_str(&listed).unwrap();
        assert_eq!(operations[0]["id"], id.to_string());

        let none = run(&cli(&dir, &["list", "--status", "completed"])).await.unwrap();
        assert_eq!(none, "No operations\n");
    }

    #[tokio::test]
    async fn test_cancel_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let id = seed(&dir).await;

        let cancelled = run(&cli(&dir, &["cancel", &id.to_string()])).await.unwrap();
        assert!(cancelled.contains("Cancelled"));
        assert!(run(&cli(&dir, &["cancel", &id.to_string()])).await.is_err());

        let cleared = run(&cli(&dir, &["clear-completed", "--json"])).await.unwrap();
        assert_eq!(serde_json::from_str::<serde_json::Value>(&cleared).unwrap()["removed"], 0);
        assert_eq!(
            run(&cli(&dir, &["conflicts"])).await.unwrap(),
            "No unresolved conflicts\n"
        );
    }

    #[tokio::test]
    async fn test_resolve_unknown_conflict_fails() {
        let dir = TempDir::new().unwrap();
        seed(&dir).await;
        let id = Uuid::new_v4().to_string();
        assert!(run(&cli(&dir, &["resolve", &id, "local-wins"])).await.is_err());
        assert!(run(&cli(&dir, &["resolve", &id, "merge"])).await.is_err());
    }

    #[tokio::test]
    async fn test_refuses_store_held_by_running_engine() {
        let dir = TempDir::new().unwrap();
        let id = seed(&dir).await;
        let app = SyncEngine::builder()
            .connectivity(Connectivity::new(false))
            .open_sqlite(&SqliteStoreConfig::at(dir.path().join("sync.db")))
            .await
            .unwrap();

        let err = run(&cli(&dir, &["cancel", &id.to_string()])).await.unwrap_err();
        assert!(format!("{err:#}").contains("already open"));
        assert!(app.queue().get(id).await.is_some());

        app.shutdown().await;
        assert!(run(&cli(&dir, &["cancel", &id.to_string()])).await.is_ok());
    }
}
