//! # Stockpile Scheduler
//!
//! Periodic market-data collection scheduling and execution.
//! SQLite-backed task pool, single-writer claim protocol, bounded
//! concurrent execution.
//!
//! ## Architecture
//! ```text
//! SchedulerLoop (tokio interval)
//!   ├── find_due(batch) → due task ids
//!   └── per id: ConcurrencyGate → atomic claim → spawn execution
//!
//! ExecutionEngine (one task, one attempt)
//!   ├── CollectorRegistry: collection_type → fresh Collector
//!   ├── timeout(collect → store)
//!   ├── ok   → append result, COMPLETED, re-arm recurrence
//!   └── err  → retry budget left ? back to PENDING : FAILED
//!
//! SchedulerHandle
//!   └── schedule / schedule_now / cancel / get / list / stop
//! ```

pub mod collector;
pub mod engine;
pub mod gate;
pub mod registry;
pub mod repository;
pub mod runner;
pub mod task;

pub use collector::{CollectError, Collector, Payload, StoredOutput};
pub use engine::{ExecuteOutcome, ExecutionEngine, StartOutcome};
pub use gate::{ConcurrencyGate, GatePermit};
pub use registry::CollectorRegistry;
pub use repository::{SqliteTaskRepository, TaskRepository};
pub use runner::{scheduler, SchedulerHandle, SchedulerLoop};
pub use task::{
    CollectionResult, CollectionTask, CollectionType, TaskSpec, TaskStatus,
};
