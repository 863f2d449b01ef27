//! Execution engine — drives one task through its lifecycle.
//!
//! Per attempt: claim (atomic PENDING→RUNNING), resolve the collector,
//! collect + store under a wall-clock timeout, then either append a result
//! and complete (re-arming recurrence), or consume retry budget and either
//! reschedule or fail terminally. The gate permit is RAII, so the slot is
//! freed on every exit path.
//!
//! No collector failure escapes this module; every one becomes a state
//! transition on the owning task.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use stockpile_core::SchedulerConfig;

use crate::collector::{CollectError, Collector, StoredOutput};
use crate::gate::{ConcurrencyGate, GatePermit};
use crate::registry::CollectorRegistry;
use crate::repository::TaskRepository;
use crate::task::{retry_backoff, CollectionResult, CollectionTask};

/// How a full inline execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// Result appended, task COMPLETED (recurrence re-armed if any).
    Completed,
    /// Attempt failed with retry budget left; task back in the due pool.
    Retrying,
    /// Terminal FAILED.
    Failed,
    /// Another worker won the claim, or the task is not claimable.
    NotClaimed,
    /// Gate full, or this task id is already in flight.
    AtCapacity,
}

/// How a detached start ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Claim won; execution continues in a spawned task.
    Started,
    NotClaimed,
    AtCapacity,
}

/// The engine. Both the scheduler loop and the immediate-dispatch path go
/// through [`ExecutionEngine::try_start`]: one entry point, one claim.
pub struct ExecutionEngine {
    repository: Arc<dyn TaskRepository>,
    registry: Arc<CollectorRegistry>,
    gate: Arc<ConcurrencyGate>,
    attempt_timeout: Duration,
    backoff_base_secs: u64,
    backoff_cap_secs: u64,
}

impl ExecutionEngine {
    pub fn new(
        repository: Arc<dyn TaskRepository>,
        registry: Arc<CollectorRegistry>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            repository,
            registry,
            gate: Arc::new(ConcurrencyGate::new(config.max_concurrent)),
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs),
            backoff_base_secs: config.retry_backoff_base_secs,
            backoff_cap_secs: config.retry_backoff_cap_secs,
        }
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    pub fn repository(&self) -> &Arc<dyn TaskRepository> {
        &self.repository
    }

    /// Gate + claim, then run the rest in a spawned task.
    pub async fn try_start(self: &Arc<Self>, task_id: Uuid) -> StartOutcome {
        match self.begin(task_id).await {
            Err(ExecuteOutcome::AtCapacity) => StartOutcome::AtCapacity,
            Err(_) => StartOutcome::NotClaimed,
            Ok((task, permit)) => {
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    engine.run_claimed(task, permit).await;
                });
                StartOutcome::Started
            }
        }
    }

    /// Gate + claim + run, fully inline. Used by tests and anywhere the
    /// caller wants the terminal outcome.
    pub async fn execute(self: &Arc<Self>, task_id: Uuid) -> ExecuteOutcome {
        match self.begin(task_id).await {
            Err(outcome) => outcome,
            Ok((task, permit)) => self.run_claimed(task, permit).await,
        }
    }

    /// Acquire a gate slot and claim the task. The permit drops (slot
    /// freed) on any failure past acquisition.
    async fn begin(
        &self,
        task_id: Uuid,
    ) -> std::result::Result<(CollectionTask, GatePermit), ExecuteOutcome> {
        let Some(permit) = self.gate.try_acquire(task_id) else {
            return Err(ExecuteOutcome::AtCapacity);
        };
        match self.repository.claim(task_id).await {
            Ok(Some(task)) => Ok((task, permit)),
            Ok(None) => Err(ExecuteOutcome::NotClaimed),
            Err(e) => {
                warn!(task_id = %task_id, "Claim query failed: {e}");
                Err(ExecuteOutcome::NotClaimed)
            }
        }
    }

    async fn run_claimed(&self, task: CollectionTask, _permit: GatePermit) -> ExecuteOutcome {
        let task_id = task.id;
        info!(
            task_id = %task_id,
            collection_type = %task.collection_type,
            "▶ Task execution started"
        );

        // Unknown collection type is a configuration error: terminal,
        // retry accounting untouched, since it will never succeed on retry.
        let Some(collector) = self
            .registry
            .resolve(task.collection_type, task.parameters.clone())
        else {
            let msg = format!(
                "no collector registered for collection type '{}'",
                task.collection_type
            );
            error!(task_id = %task_id, "{msg}");
            if let Err(e) = self.repository.mark_failed(task_id, &msg, task.retry_count).await {
                error!(task_id = %task_id, "Failed to record configuration error: {e}");
            }
            return ExecuteOutcome::Failed;
        };

        match self.run_attempt(collector.as_ref()).await {
            Ok((data_count, stored)) => self.finish_success(&task, data_count, stored).await,
            Err(e) => self.finish_failure(&task, e.to_string()).await,
        }
    }

    /// collect + store under the per-attempt timeout. A store failure is a
    /// collection failure: fetched-but-not-stored is not success.
    async fn run_attempt(
        &self,
        collector: &dyn Collector,
    ) -> std::result::Result<(u64, StoredOutput), CollectError> {
        let attempt = async {
            let payload = collector.collect().await?;
            let data_count = payload.len() as u64;
            let stored = collector.store(payload).await?;
            Ok((data_count, stored))
        };
        match tokio::time::timeout(self.attempt_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(CollectError::Transient(format!(
                "attempt timed out after {}s",
                self.attempt_timeout.as_secs()
            ))),
        }
    }

    async fn finish_success(
        &self,
        task: &CollectionTask,
        data_count: u64,
        stored: StoredOutput,
    ) -> ExecuteOutcome {
        let task_id = task.id;
        let completed_at = Utc::now();
        let result = CollectionResult::new(
            task_id,
            data_count,
            stored.storage_location,
            stored.metadata,
        );
        if let Err(e) = self.repository.append_result(&result).await {
            // The execution succeeded but its record didn't land; without
            // the result row this attempt is not a terminal success.
            return self.finish_failure(task, format!("result append failed: {e}")).await;
        }
        if let Err(e) = self.repository.mark_completed(task_id, completed_at).await {
            error!(task_id = %task_id, "Failed to mark completed: {e}");
        }
        info!(
            task_id = %task_id,
            collection_type = %task.collection_type,
            data_count,
            "✅ Task completed"
        );

        // Recurrence: only from COMPLETED. The successor is a new task
        // identity; the finished record stays for history.
        if let Some(next) = task.next_occurrence(completed_at) {
            match self.repository.create(&next).await {
                Ok(next_id) => info!(
                    task_id = %task_id,
                    next_id = %next_id,
                    interval_minutes = task.interval_minutes,
                    "🔁 Recurrence re-armed"
                ),
                Err(e) => error!(task_id = %task_id, "Failed to re-arm recurrence: {e}"),
            }
        }
        ExecuteOutcome::Completed
    }

    async fn finish_failure(&self, task: &CollectionTask, error_msg: String) -> ExecuteOutcome {
        let task_id = task.id;
        let retries = task.retry_count + 1;
        if retries < task.max_retries {
            let delay = retry_backoff(self.backoff_base_secs, self.backoff_cap_secs, retries);
            let next_at = Utc::now() + delay;
            warn!(
                task_id = %task_id,
                retry_count = retries,
                max_retries = task.max_retries,
                delay_secs = delay.num_seconds(),
                "⚠️ Attempt failed, rescheduling: {error_msg}"
            );
            if let Err(e) = self
                .repository
                .reschedule_retry(task_id, &error_msg, retries, next_at)
                .await
            {
                error!(task_id = %task_id, "Failed to reschedule retry: {e}");
            }
            ExecuteOutcome::Retrying
        } else {
            warn!(
                task_id = %task_id,
                retry_count = retries,
                "✖ Task failed terminally: {error_msg}"
            );
            if let Err(e) = self.repository.mark_failed(task_id, &error_msg, retries).await {
                error!(task_id = %task_id, "Failed to mark failed: {e}");
            }
            ExecuteOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Payload;
    use crate::registry::CollectorRegistry;
    use crate::repository::SqliteTaskRepository;
    use crate::task::{CollectionType, TaskSpec, TaskStatus};
    use async_trait::async_trait;
    use stockpile_core::SchedulerConfig;

    struct FixedCollector {
        items: usize,
    }

    #[async_trait]
    impl Collector for FixedCollector {
        fn collection_type(&self) -> CollectionType {
            CollectionType::StockPrice
        }

        async fn collect(&self) -> Result<Payload, CollectError> {
            Ok((0..self.items).map(|i| serde_json::json!({"i": i})).collect())
        }

        async fn store(&self, payload: Payload) -> Result<StoredOutput, CollectError> {
            if payload.is_empty() {
                return Ok(StoredOutput::empty());
            }
            Ok(StoredOutput {
                storage_location: Some("data/test/fixed.json".into()),
                metadata: serde_json::json!({"count": payload.len()}),
            })
        }
    }

    struct AlwaysFailing;

    #[async_trait]
    impl Collector for AlwaysFailing {
        fn collection_type(&self) -> CollectionType {
            CollectionType::StockPrice
        }

        async fn collect(&self) -> Result<Payload, CollectError> {
            Err(CollectError::Transient("connection refused".into()))
        }

        async fn store(&self, _payload: Payload) -> Result<StoredOutput, CollectError> {
            unreachable!("collect never succeeds")
        }
    }

    struct BlockingCollector {
        sem: Arc<tokio::sync::Semaphore>,
    }

    #[async_trait]
    impl Collector for BlockingCollector {
        fn collection_type(&self) -> CollectionType {
            CollectionType::StockPrice
        }

        async fn collect(&self) -> Result<Payload, CollectError> {
            let _permit = self.sem.acquire().await;
            Ok(Vec::new())
        }

        async fn store(&self, _payload: Payload) -> Result<StoredOutput, CollectError> {
            Ok(StoredOutput::empty())
        }
    }

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent: 5,
            attempt_timeout_secs: 60,
            // No backoff delay so retried tasks are immediately due again.
            retry_backoff_base_secs: 0,
            ..SchedulerConfig::default()
        }
    }

    fn engine_with<F>(config: SchedulerConfig, build: F) -> (Arc<ExecutionEngine>, Arc<SqliteTaskRepository>)
    where
        F: Fn(serde_json::Value) -> Box<dyn Collector> + Send + Sync + 'static,
    {
        let repo = Arc::new(SqliteTaskRepository::in_memory().unwrap());
        let mut registry = CollectorRegistry::new();
        registry.register(CollectionType::StockPrice, build);
        let engine = Arc::new(ExecutionEngine::new(
            repo.clone() as Arc<dyn TaskRepository>,
            Arc::new(registry),
            &config,
        ));
        (engine, repo)
    }

    #[tokio::test]
    async fn test_success_appends_result_and_completes() {
        let (engine, repo) = engine_with(test_config(), |_| Box::new(FixedCollector { items: 5 }));
        let id = repo
            .create(&TaskSpec::immediate(
                CollectionType::StockPrice,
                serde_json::json!({"symbol": "005930"}),
            ))
            .await
            .unwrap();

        assert_eq!(engine.execute(id).await, ExecuteOutcome::Completed);

        let task = repo.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert!(task.error_message.is_none());

        let results = repo.results_for(id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].data_count, 5);
        assert_eq!(
            results[0].storage_location.as_deref(),
            Some("data/test/fixed.json")
        );
        assert_eq!(engine.gate().active_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_payload_is_success_with_zero_count() {
        let (engine, repo) = engine_with(test_config(), |_| Box::new(FixedCollector { items: 0 }));
        let id = repo
            .create(&TaskSpec::immediate(
                CollectionType::StockPrice,
                serde_json::Value::Null,
            ))
            .await
            .unwrap();

        assert_eq!(engine.execute(id).await, ExecuteOutcome::Completed);
        let results = repo.results_for(id).await.unwrap();
        assert_eq!(results[0].data_count, 0);
        assert!(results[0].storage_location.is_none());
        assert_eq!(results[0].metadata["count"], 0);
    }

    #[tokio::test]
    async fn test_retry_bound_reaches_failed_at_max_retries() {
        let (engine, repo) = engine_with(test_config(), |_| Box::new(AlwaysFailing));
        let mut spec = TaskSpec::immediate(CollectionType::StockPrice, serde_json::Value::Null);
        spec.max_retries = 2;
        let id = repo.create(&spec).await.unwrap();

        // Attempt 1: budget left → back to pending.
        assert_eq!(engine.execute(id).await, ExecuteOutcome::Retrying);
        let task = repo.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);

        // Attempt 2: budget exhausted → terminal.
        assert_eq!(engine.execute(id).await, ExecuteOutcome::Failed);
        let task = repo.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.error_message.as_deref(), Some("transient: connection refused"));

        // Terminal: nothing further to claim, no results appended.
        assert_eq!(engine.execute(id).await, ExecuteOutcome::NotClaimed);
        assert!(repo.results_for(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type_fails_without_retry_accounting() {
        let (engine, repo) = engine_with(test_config(), |_| Box::new(FixedCollector { items: 1 }));
        // News has no registered collector.
        let id = repo
            .create(&TaskSpec::immediate(CollectionType::News, serde_json::Value::Null))
            .await
            .unwrap();

        assert_eq!(engine.execute(id).await, ExecuteOutcome::Failed);
        let task = repo.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
        assert!(task
            .error_message
            .unwrap()
            .contains("no collector registered"));
    }

    #[tokio::test]
    async fn test_recurrence_rearms_exactly_once() {
        let (engine, repo) = engine_with(test_config(), |_| Box::new(FixedCollector { items: 5 }));
        let id = repo
            .create(&TaskSpec::recurring(
                CollectionType::StockPrice,
                serde_json::json!({"symbol": "005930"}),
                60,
            ))
            .await
            .unwrap();

        assert_eq!(engine.execute(id).await, ExecuteOutcome::Completed);
        // Double dispatch loses the claim, so no second successor.
        assert_eq!(engine.execute(id).await, ExecuteOutcome::NotClaimed);

        let completed = repo.get(id).await.unwrap().unwrap();
        let done_at = completed.completed_at.unwrap();

        let all = repo.list(10).await.unwrap();
        let successors: Vec<_> = all.iter().filter(|t| t.id != id).collect();
        assert_eq!(successors.len(), 1);
        let next = successors[0];
        assert_eq!(next.status, TaskStatus::Pending);
        assert_eq!(next.scheduled_at, done_at + chrono::Duration::minutes(60));
        assert_eq!(next.collection_type, CollectionType::StockPrice);
        assert_eq!(next.parameters["symbol"], "005930");
        assert!(next.is_recurring);
    }

    #[tokio::test]
    async fn test_failure_does_not_rearm_recurrence() {
        let (engine, repo) = engine_with(test_config(), |_| Box::new(AlwaysFailing));
        let mut spec = TaskSpec::recurring(CollectionType::StockPrice, serde_json::Value::Null, 60);
        spec.max_retries = 1;
        let id = repo.create(&spec).await.unwrap();

        assert_eq!(engine.execute(id).await, ExecuteOutcome::Failed);
        assert_eq!(repo.list(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_gate_released_after_failure() {
        let (engine, repo) = engine_with(test_config(), |_| Box::new(AlwaysFailing));
        let mut spec = TaskSpec::immediate(CollectionType::StockPrice, serde_json::Value::Null);
        spec.max_retries = 1;
        let id = repo.create(&spec).await.unwrap();

        assert_eq!(engine.execute(id).await, ExecuteOutcome::Failed);
        assert_eq!(engine.gate().active_count(), 0);
        assert!(engine.gate().has_capacity());
    }

    #[tokio::test]
    async fn test_bounded_concurrency() {
        let sem = Arc::new(tokio::sync::Semaphore::new(0));
        let build_sem = sem.clone();
        let config = SchedulerConfig {
            max_concurrent: 2,
            ..test_config()
        };
        let (engine, repo) = engine_with(config, move |_| {
            Box::new(BlockingCollector { sem: build_sem.clone() })
        });

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(
                repo.create(&TaskSpec::immediate(
                    CollectionType::StockPrice,
                    serde_json::Value::Null,
                ))
                .await
                .unwrap(),
            );
        }

        assert_eq!(engine.try_start(ids[0]).await, StartOutcome::Started);
        assert_eq!(engine.try_start(ids[1]).await, StartOutcome::Started);
        // Gate limit 2: further starts refused while both are in flight.
        assert_eq!(engine.try_start(ids[2]).await, StartOutcome::AtCapacity);
        assert_eq!(engine.gate().active_count(), 2);

        // Unblock both executions; slots free up.
        sem.add_permits(4);
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.gate().active_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(engine.try_start(ids[2]).await, StartOutcome::Started);
    }

    #[tokio::test]
    async fn test_timeout_is_transient_failure() {
        let sem = Arc::new(tokio::sync::Semaphore::new(0));
        let build_sem = sem.clone();
        let config = SchedulerConfig {
            attempt_timeout_secs: 0,
            ..test_config()
        };
        let (engine, repo) = engine_with(config, move |_| {
            Box::new(BlockingCollector { sem: build_sem.clone() })
        });
        let mut spec = TaskSpec::immediate(CollectionType::StockPrice, serde_json::Value::Null);
        spec.max_retries = 1;
        let id = repo.create(&spec).await.unwrap();

        assert_eq!(engine.execute(id).await, ExecuteOutcome::Failed);
        let task = repo.get(id).await.unwrap().unwrap();
        assert!(task.error_message.unwrap().contains("timed out"));
        assert_eq!(engine.gate().active_count(), 0);
    }
}
