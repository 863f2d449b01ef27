//! # Stockpile — Market Data Collection Scheduler
//!
//! Usage:
//!   stockpile run                                      # Start the scheduler
//!   stockpile add stock_price -p '{"symbol":"005930"}' # Enqueue a task
//!   stockpile add market_index --every 60              # Recurring, hourly
//!   stockpile list                                     # Show recent tasks
//!   stockpile cancel <task-id>                         # Cancel a pending task

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use stockpile_collectors::builtin_registry;
use stockpile_core::StockpileConfig;
use stockpile_scheduler::{
    scheduler, CollectionType, ExecutionEngine, SqliteTaskRepository, TaskRepository, TaskSpec,
};

#[derive(Parser)]
#[command(name = "stockpile", version, about = "📈 Stockpile — Market Data Collection Scheduler")]
struct Cli {
    /// Config file path (default: ~/.stockpile/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the scheduler loop
    Run,
    /// Enqueue a collection task
    Add {
        /// Collection type (stock_price, stock_info, disclosure, ...)
        collection_type: String,
        /// Task parameters as JSON
        #[arg(short, long, default_value = "{}")]
        params: String,
        /// When the task becomes due (RFC 3339); omitted means now
        #[arg(long)]
        at: Option<String>,
        /// Recur every N minutes after each completion
        #[arg(long, value_name = "MINUTES")]
        every: Option<i64>,
        /// Retry budget for failed attempts
        #[arg(long, default_value = "3")]
        max_retries: u32,
    },
    /// List recent tasks
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Cancel a pending task
    Cancel {
        task_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "stockpile=debug,stockpile_scheduler=debug,stockpile_collectors=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => StockpileConfig::load_from(std::path::Path::new(path))?,
        None => StockpileConfig::load()?,
    };

    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let repository: Arc<dyn TaskRepository> = Arc::new(SqliteTaskRepository::open(&db_path)?);

    match cli.command {
        Command::Run => run(config, repository).await,
        Command::Add { collection_type, params, at, every, max_retries } => {
            add(repository, &collection_type, &params, at, every, max_retries).await
        }
        Command::List { limit } => list(repository, limit).await,
        Command::Cancel { task_id } => cancel(repository, &task_id).await,
    }
}

async fn run(config: StockpileConfig, repository: Arc<dyn TaskRepository>) -> Result<()> {
    // Orphaned RUNNING rows from a previous crash go back to the pool.
    let grace = Duration::seconds(config.scheduler.stale_running_grace_secs as i64);
    let swept = repository.reset_stale_running(Utc::now() - grace).await?;
    if swept > 0 {
        tracing::warn!("🧹 Reset {swept} stale running task(s) to pending");
    }

    let registry = builtin_registry(&config.collectors);
    let types: Vec<_> = registry
        .registered_types()
        .iter()
        .map(|t| t.as_str())
        .collect();

    println!("📈 Stockpile v{}", env!("CARGO_PKG_VERSION"));
    println!("   🗄️  Database:   {}", config.database_path().display());
    println!("   📂 Data Dir:   {}", config.data_dir().display());
    println!("   🔌 Collectors: {}", types.join(", "));
    println!("   ⚙️  Concurrency: {} | tick: {}s", config.scheduler.max_concurrent, config.scheduler.tick_secs);
    println!();

    let engine = Arc::new(ExecutionEngine::new(
        repository,
        Arc::new(registry),
        &config.scheduler,
    ));
    let (scheduler_loop, handle) = scheduler(engine, &config.scheduler);
    let join = tokio::spawn(scheduler_loop.run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    handle.stop();
    join.await?;
    Ok(())
}

async fn add(
    repository: Arc<dyn TaskRepository>,
    collection_type: &str,
    params: &str,
    at: Option<String>,
    every: Option<i64>,
    max_retries: u32,
) -> Result<()> {
    let collection_type =
        CollectionType::from_str(collection_type).map_err(|e| anyhow::anyhow!(e))?;
    let parameters: serde_json::Value = serde_json::from_str(params)?;
    let scheduled_at = at
        .map(|s| DateTime::parse_from_rfc3339(&s).map(|t| t.with_timezone(&Utc)))
        .transpose()?;

    let spec = TaskSpec {
        collection_type,
        parameters,
        scheduled_at,
        max_retries,
        is_recurring: every.is_some(),
        interval_minutes: every,
    };
    let id = repository.create(&spec).await?;
    println!("✅ Task created: {id}");
    Ok(())
}

async fn list(repository: Arc<dyn TaskRepository>, limit: usize) -> Result<()> {
    let tasks = repository.list(limit).await?;
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    for task in tasks {
        let recur = match task.interval_minutes {
            Some(m) if task.is_recurring => format!(" ⏰ every {m}m"),
            _ => String::new(),
        };
        println!(
            "{}  {:<18} {:<9} due {}  retries {}/{}{}",
            task.id,
            task.collection_type,
            task.status,
            task.scheduled_at.format("%Y-%m-%d %H:%M:%S"),
            task.retry_count,
            task.max_retries,
            recur,
        );
        if let Some(err) = &task.error_message {
            println!("    └─ {err}");
        }
    }
    Ok(())
}

async fn cancel(repository: Arc<dyn TaskRepository>, task_id: &str) -> Result<()> {
    let id = Uuid::parse_str(task_id)?;
    repository.cancel(id).await?;
    println!("🚫 Task cancelled: {id}");
    Ok(())
}
