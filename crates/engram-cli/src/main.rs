use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use engram_core::cache::RecordCache;
use engram_core::config::EngramConfig;
use engram_core::index::usearch::UsearchIndex;
use engram_core::model::approval::Decision;
use engram_core::model::memory::MemoryType;
use engram_core::query::gate::ReviewInput;
use engram_core::query::EngramEngine;
use engram_core::storage::duckdb::DuckDbStorage;
use engram_core::storage::MemoryFilter;

#[derive(Parser)]
#[command(name = "engram", about = "Inspect and administer an Engram database")]
struct Cli {
    /// Path to the database file
    #[arg(long, default_value = "engram.db", env = "ENGRAM_DB_PATH")]
    db_path: PathBuf,

    /// Embedding dimensions (must match the stored vectors)
    #[arg(long, default_value = "1536", env = "ENGRAM_DIMENSIONS")]
    dimensions: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List pending approval requests
    Pending {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Approve or reject a pending approval request
    Review {
        request_id: Uuid,
        /// approve or reject
        decision: Decision,
        #[arg(long, default_value = "operator", env = "ENGRAM_REVIEWER")]
        reviewer: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Expire all pending approval requests past their deadline
    Sweep,
    /// Show checkpoint history for a thread, root first
    History {
        thread_id: String,
        #[arg(long, default_value = "")]
        namespace: String,
    },
    /// Tail the activity log of a run
    Activity {
        run_id: String,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// List approval requests created by a run, oldest first
    Approvals {
        run_id: String,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// List stored memories, optionally filtered by owner or type
    Memories {
        #[arg(long)]
        agent_id: Option<String>,
        #[arg(long)]
        memory_type: Option<MemoryType>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Rebuild the vector index from stored embeddings
    RebuildIndex,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("engram=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = EngramConfig {
        db_path: cli.db_path,
        embedding_dimensions: cli.dimensions,
        ..EngramConfig::default()
    };

    let storage = Arc::new(DuckDbStorage::open(&config.db_path)?);
    tracing::info!("Database opened at {:?}", config.db_path);
    let index = Arc::new(UsearchIndex::new(config.embedding_dimensions)?);
    let engine = EngramEngine::new(storage, index).with_cache(Arc::new(RecordCache::new(
        config.cache_ttl_seconds,
        config.cache_max_entries,
    )));

    match cli.command {
        Command::Pending { limit } => {
            let requests = engine.pending_approvals(limit).await?;
            if requests.is_empty() {
                println!("no pending approval requests");
            }
            for request in requests {
                println!(
                    "{}  run={}  expires={}  {}",
                    request.id, request.run_id, request.expires_at, request.reason
                );
            }
        }
        Command::Review {
            request_id,
            decision,
            reviewer,
            notes,
        } => {
            let settled = engine
                .review(ReviewInput {
                    request_id,
                    reviewer_id: reviewer,
                    decision,
                    notes,
                })
                .await?;
            println!("{} -> {}", settled.id, settled.status);
        }
        Command::Sweep => {
            let count = engine.sweep_expired(chrono::Utc::now()).await?;
            println!("expired {count} requests");
        }
        Command::History {
            thread_id,
            namespace,
        } => {
            let latest = engine.latest_checkpoint(&thread_id, &namespace).await?;
            for cp in engine.ancestors(latest.id).await? {
                println!(
                    "step {:>4}  {}  source={}  sends={}  {}",
                    cp.step,
                    cp.id,
                    cp.source,
                    cp.pending_sends.len(),
                    cp.created_at
                );
            }
        }
        Command::Activity { run_id, limit } => {
            for entry in engine.run_activity(&run_id, limit).await? {
                println!("{}  [{}]  {}", entry.timestamp, entry.step_type, entry.content);
            }
        }
        Command::Approvals { run_id, limit } => {
            for request in engine.storage.list_approvals_by_run(&run_id, limit).await? {
                println!(
                    "{}  [{}]  expires={}  {}",
                    request.id, request.status, request.expires_at, request.reason
                );
            }
        }
        Command::Memories {
            agent_id,
            memory_type,
            limit,
        } => {
            let filter = MemoryFilter {
                agent_id,
                memory_type,
                min_importance: None,
            };
            for record in engine.storage.list_memories(&filter, limit, 0).await? {
                println!(
                    "{}  [{}]  importance={:.2}  accessed={}  {}",
                    record.id,
                    record.memory_type,
                    record.importance,
                    record.access_count,
                    record.content
                );
            }
        }
        Command::RebuildIndex => {
            let count = engine.rebuild_index().await?;
            println!("indexed {count} vectors");
        }
    }

    Ok(())
}
