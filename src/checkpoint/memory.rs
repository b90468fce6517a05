//! In-memory checkpoint backend.
//!
//! Used by tests and local development. Reproduces the two behaviors the
//! worker depends on: server-side shallow merge of JSON patches and lease
//! rejection after the lease has been reassigned.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::checkpoint::store::{CheckpointBackend, Lease};
use crate::error::{WorkerError, WorkerResult};

#[derive(Debug, Clone)]
pub struct LoggedEvent {
    pub run_id: String,
    pub level: String,
    pub message: String,
    pub details: Value,
}

#[derive(Default)]
struct Inner {
    step_states: HashMap<(String, String), Value>,
    metrics: HashMap<String, Value>,
    current_steps: HashMap<String, String>,
    events: Vec<LoggedEvent>,
    /// Lease currently holding each run; `None` means any lease is accepted.
    run_leases: HashMap<String, Lease>,
}

#[derive(Default)]
pub struct MemoryCheckpointBackend {
    inner: Mutex<Inner>,
}

impl MemoryCheckpointBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand the run to a different lease; subsequent writes under the old
    /// lease fail with `lock_lost`.
    pub fn reassign_lease(&self, run_id: &str, lease: Lease) {
        self.inner
            .lock()
            .run_leases
            .insert(run_id.to_string(), lease);
    }

    pub fn step_state(&self, run_id: &str, step: &str) -> Option<Value> {
        self.inner
            .lock()
            .step_states
            .get(&(run_id.to_string(), step.to_string()))
            .cloned()
    }

    pub fn metrics(&self, run_id: &str) -> Option<Value> {
        self.inner.lock().metrics.get(run_id).cloned()
    }

    pub fn current_step(&self, run_id: &str) -> Option<String> {
        self.inner.lock().current_steps.get(run_id).cloned()
    }

    pub fn events(&self) -> Vec<LoggedEvent> {
        self.inner.lock().events.clone()
    }
}

fn shallow_merge(target: &mut Value, patch: Value) {
    let incoming = match patch {
        Value::Object(map) => map,
        other => {
            *target = other;
            return;
        }
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let existing = target.as_object_mut().expect("target coerced to object");
    for (key, value) in incoming {
        existing.insert(key, value);
    }
}

#[async_trait]
impl CheckpointBackend for MemoryCheckpointBackend {
    async fn fetch_step_state(&self, run_id: &str, step: &str) -> WorkerResult<Option<Value>> {
        Ok(self.step_state(run_id, step))
    }

    async fn merge_step_patch(
        &self,
        run_id: &str,
        step: &str,
        patch: Value,
        lease: &Lease,
    ) -> WorkerResult<()> {
        let mut inner = self.inner.lock();
        if let Some(holder) = inner.run_leases.get(run_id) {
            if holder != lease {
                return Err(WorkerError::LockLost);
            }
        }
        let entry = inner
            .step_states
            .entry((run_id.to_string(), step.to_string()))
            .or_insert_with(|| Value::Object(Map::new()));
        shallow_merge(entry, patch);
        Ok(())
    }

    async fn merge_metrics_patch(&self, run_id: &str, patch: Value) -> WorkerResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .metrics
            .entry(run_id.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        shallow_merge(entry, patch);
        Ok(())
    }

    async fn set_step_in_progress(
        &self,
        run_id: &str,
        step: &str,
        _extra: Value,
    ) -> WorkerResult<()> {
        self.inner
            .lock()
            .current_steps
            .insert(run_id.to_string(), step.to_string());
        Ok(())
    }

    async fn log_event(
        &self,
        run_id: &str,
        level: &str,
        message: &str,
        details: Value,
    ) -> WorkerResult<()> {
        self.inner.lock().events.push(LoggedEvent {
            run_id: run_id.to_string(),
            level: level.to_string(),
            message: message.to_string(),
            details,
        });
        Ok(())
    }
}
