//! Scheduler loop and the front-door handle.
//!
//! The loop is a fixed-interval scan: fetch a batch of due task ids, offer
//! each to the engine, let the gate and the claim sort out contention. A
//! scan error logs and backs off instead of killing the loop. Immediate
//! dispatch (`schedule_now`) rides the exact same engine path as the loop,
//! so there is one claim protocol, not two.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use stockpile_core::{Result, SchedulerConfig, StockpileError};

use crate::engine::{ExecutionEngine, StartOutcome};
use crate::task::{CollectionTask, TaskSpec};

/// The periodic due-task scanner.
pub struct SchedulerLoop {
    engine: Arc<ExecutionEngine>,
    tick: Duration,
    error_backoff: Duration,
    batch_size: usize,
    shutdown: watch::Receiver<bool>,
}

/// Caller-facing surface: create, dispatch, cancel, inspect, stop.
#[derive(Clone)]
pub struct SchedulerHandle {
    engine: Arc<ExecutionEngine>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

/// Build the loop and its handle around an engine.
pub fn scheduler(engine: Arc<ExecutionEngine>, config: &SchedulerConfig) -> (SchedulerLoop, SchedulerHandle) {
    let (shutdown_tx, shutdown) = watch::channel(false);
    let scheduler_loop = SchedulerLoop {
        engine: Arc::clone(&engine),
        tick: Duration::from_secs(config.tick_secs.max(1)),
        error_backoff: Duration::from_secs(config.error_backoff_secs.max(1)),
        batch_size: config.batch_size.max(1),
        shutdown,
    };
    let handle = SchedulerHandle {
        engine,
        shutdown_tx: Arc::new(shutdown_tx),
    };
    (scheduler_loop, handle)
}

impl SchedulerLoop {
    /// Run until shutdown is signalled. Intended to be spawned.
    pub async fn run(mut self) {
        info!(
            tick_secs = self.tick.as_secs(),
            batch_size = self.batch_size,
            "📅 Scheduler loop started"
        );
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.scan_once().await {
                        error!("Scheduler scan failed: {e}");
                        tokio::time::sleep(self.error_backoff).await;
                    }
                }
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        info!("Scheduler loop stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One scan: offer every due task to the engine. Losing a claim or
    /// hitting the gate is normal contention, not an error.
    async fn scan_once(&self) -> Result<()> {
        if !self.engine.gate().has_capacity() {
            debug!("Gate full, skipping scan");
            return Ok(());
        }
        let due = self.engine.repository().find_due(self.batch_size).await?;
        for task_id in due {
            match self.engine.try_start(task_id).await {
                StartOutcome::Started => {}
                StartOutcome::AtCapacity => {
                    debug!(task_id = %task_id, "Gate full, task stays due");
                    break;
                }
                StartOutcome::NotClaimed => {
                    debug!(task_id = %task_id, "Claim lost, skipping");
                }
            }
        }
        Ok(())
    }
}

impl SchedulerHandle {
    /// Create a task without running it. It becomes due per its spec.
    pub async fn schedule(&self, spec: &TaskSpec) -> Result<Uuid> {
        self.engine.repository().create(spec).await
    }

    /// Create a task and dispatch it immediately, outside the tick cadence.
    /// Goes through the same gate and claim as the loop; if the loop's next
    /// scan already picked it up, the loser of the claim backs off here.
    pub async fn schedule_now(&self, spec: &TaskSpec) -> Result<Uuid> {
        let task_id = self.engine.repository().create(spec).await?;
        match self.engine.try_start(task_id).await {
            StartOutcome::Started => Ok(task_id),
            // Gate full: the task stays PENDING and the loop picks it up.
            StartOutcome::AtCapacity => Ok(task_id),
            StartOutcome::NotClaimed => Err(StockpileError::AlreadyInProgress(task_id.to_string())),
        }
    }

    /// Cancel a PENDING task. Rejected while RUNNING.
    pub async fn cancel(&self, task_id: Uuid) -> Result<()> {
        self.engine.repository().cancel(task_id).await
    }

    pub async fn get(&self, task_id: Uuid) -> Result<Option<CollectionTask>> {
        self.engine.repository().get(task_id).await
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<CollectionTask>> {
        self.engine.repository().list(limit).await
    }

    /// Signal the loop to stop. In-flight executions run to completion.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CollectError, Collector, Payload, StoredOutput};
    use crate::registry::CollectorRegistry;
    use crate::repository::{SqliteTaskRepository, TaskRepository};
    use crate::task::{CollectionType, TaskStatus};
    use async_trait::async_trait;

    struct OneItem;

    #[async_trait]
    impl Collector for OneItem {
        fn collection_type(&self) -> CollectionType {
            CollectionType::MarketIndex
        }

        async fn collect(&self) -> std::result::Result<Payload, CollectError> {
            Ok(vec![serde_json::json!({"index": "KOSPI"})])
        }

        async fn store(
            &self,
            payload: Payload,
        ) -> std::result::Result<StoredOutput, CollectError> {
            Ok(StoredOutput {
                storage_location: Some("data/market_index/latest.json".into()),
                metadata: serde_json::json!({"count": payload.len()}),
            })
        }
    }

    fn setup() -> (SchedulerLoop, SchedulerHandle, Arc<SqliteTaskRepository>) {
        let repo = Arc::new(SqliteTaskRepository::in_memory().unwrap());
        let mut registry = CollectorRegistry::new();
        registry.register(CollectionType::MarketIndex, |_| Box::new(OneItem));
        let config = SchedulerConfig {
            tick_secs: 1,
            ..SchedulerConfig::default()
        };
        let engine = Arc::new(ExecutionEngine::new(
            repo.clone() as Arc<dyn TaskRepository>,
            Arc::new(registry),
            &config,
        ));
        let (scheduler_loop, handle) = scheduler(engine, &config);
        (scheduler_loop, handle, repo)
    }

    #[tokio::test]
    async fn test_loop_picks_up_due_task() {
        let (scheduler_loop, handle, repo) = setup();
        let id = handle
            .schedule(&TaskSpec::immediate(
                CollectionType::MarketIndex,
                serde_json::Value::Null,
            ))
            .await
            .unwrap();

        let join = tokio::spawn(scheduler_loop.run());
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let task = repo.get(id).await.unwrap().unwrap();
                if task.status == TaskStatus::Completed {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();

        handle.stop();
        join.await.unwrap();

        let results = repo.results_for(id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].data_count, 1);
    }

    #[tokio::test]
    async fn test_schedule_now_runs_immediately() {
        let (_loop_unused, handle, repo) = setup();
        let id = handle
            .schedule_now(&TaskSpec::immediate(
                CollectionType::MarketIndex,
                serde_json::Value::Null,
            ))
            .await
            .unwrap();

        // try_start detaches; wait for the spawned execution to land.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let task = repo.get(id).await.unwrap().unwrap();
                if task.status == TaskStatus::Completed {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_pending_then_loop_ignores_it() {
        let (scheduler_loop, handle, repo) = setup();
        let mut spec = TaskSpec::immediate(CollectionType::MarketIndex, serde_json::Value::Null);
        spec.scheduled_at = Some(chrono::Utc::now() + chrono::Duration::hours(1));
        let id = handle.schedule(&spec).await.unwrap();
        handle.cancel(id).await.unwrap();

        let join = tokio::spawn(scheduler_loop.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop();
        join.await.unwrap();

        let task = repo.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(repo.results_for(id).await.unwrap().is_empty());
    }
}
