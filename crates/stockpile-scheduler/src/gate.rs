//! Concurrency gate — bounds simultaneous executions.
//!
//! An id-set plus a limit behind a short mutex: acquisition for a task id
//! already held is refused instead of double-counted, so the scheduler loop
//! and the immediate-dispatch path can race on the same task without
//! deadlock or slot leakage. The permit releases on drop, on every exit
//! path including panics inside an execution.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

struct GateInner {
    active: HashSet<Uuid>,
}

/// Bounded set of in-flight task ids.
pub struct ConcurrencyGate {
    inner: Mutex<GateInner>,
    limit: usize,
}

impl ConcurrencyGate {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(GateInner { active: HashSet::new() }),
            limit: limit.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Try to take a slot for `task_id`. Returns `None` when the gate is
    /// full or the id is already held (duplicate acquisition attempt).
    pub fn try_acquire(self: &Arc<Self>, task_id: Uuid) -> Option<GatePermit> {
        let mut inner = self.lock();
        if inner.active.len() >= self.limit || !inner.active.insert(task_id) {
            return None;
        }
        Some(GatePermit {
            gate: Arc::clone(self),
            task_id,
        })
    }

    /// Whether the gate has any free slots.
    pub fn has_capacity(&self) -> bool {
        self.lock().active.len() < self.limit
    }

    /// Number of slots currently held.
    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn release(&self, task_id: Uuid) {
        self.lock().active.remove(&task_id);
    }
}

/// RAII slot. Dropping it frees the slot for this task id.
pub struct GatePermit {
    gate: Arc<ConcurrencyGate>,
    task_id: Uuid,
}

impl GatePermit {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release(self.task_id);
    }
}
