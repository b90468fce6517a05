//! Checkpoint store client.
//!
//! The store is a remote service exposing four idempotent RPCs
//! (merge-step-patch, merge-metrics-patch, set-step-in-progress, log-event).
//! Every step-state write is a server-side shallow merge guarded by the
//! invocation lease; a write after the lease moved on is rejected with
//! `lock_lost` and the worker surrenders the invocation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::checkpoint::model::{CheckpointPatch, ParseMergeCheckpoint, SubPhase};
use crate::error::{WorkerError, WorkerResult};

/// Opaque invocation lease. A value type: equality and ordering are total,
/// and the identifier is never interpreted by the worker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lease(String);

impl Lease {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport behind [`CheckpointStore`]. All calls are idempotent under
/// equal arguments.
#[async_trait]
pub trait CheckpointBackend: Send + Sync {
    /// Raw step state, or `None` when the run has never written one.
    async fn fetch_step_state(&self, run_id: &str, step: &str) -> WorkerResult<Option<Value>>;

    /// Server-side shallow merge of `patch` into the step state, creating it
    /// if absent. Rejected with [`WorkerError::LockLost`] when `lease` no
    /// longer holds the run.
    async fn merge_step_patch(
        &self,
        run_id: &str,
        step: &str,
        patch: Value,
        lease: &Lease,
    ) -> WorkerResult<()>;

    /// Shallow merge into the run's metrics document (not lease-guarded;
    /// metrics are additive diagnostics).
    async fn merge_metrics_patch(&self, run_id: &str, patch: Value) -> WorkerResult<()>;

    /// Record the currently executing step, separate from step state so
    /// concurrent writers cannot stomp each other's progress.
    async fn set_step_in_progress(&self, run_id: &str, step: &str, extra: Value)
        -> WorkerResult<()>;

    /// Append a diagnostic event to the run's log.
    async fn log_event(
        &self,
        run_id: &str,
        level: &str,
        message: &str,
        details: Value,
    ) -> WorkerResult<()>;
}

/// Typed facade over the checkpoint backend.
#[derive(Clone)]
pub struct CheckpointStore {
    backend: Arc<dyn CheckpointBackend>,
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn CheckpointBackend>) -> Self {
        Self { backend }
    }

    pub async fn load_parse_merge(
        &self,
        run_id: &str,
        step: &str,
    ) -> WorkerResult<Option<ParseMergeCheckpoint>> {
        match self.backend.fetch_step_state(run_id, step).await? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| WorkerError::CheckpointRpc {
                    rpc: "fetch_step_state",
                    detail: format!("checkpoint for run {run_id} is not readable: {e}"),
                }),
        }
    }

    pub async fn merge_parse_merge(
        &self,
        run_id: &str,
        step: &str,
        patch: &CheckpointPatch,
        lease: &Lease,
    ) -> WorkerResult<()> {
        let value = serde_json::to_value(patch).map_err(|e| WorkerError::CheckpointRpc {
            rpc: "merge_step_patch",
            detail: format!("patch serialization failed: {e}"),
        })?;
        self.backend
            .merge_step_patch(run_id, step, value, lease)
            .await
    }

    pub async fn merge_metrics(&self, run_id: &str, patch: Value) -> WorkerResult<()> {
        self.backend.merge_metrics_patch(run_id, patch).await
    }

    pub async fn set_step_in_progress(&self, run_id: &str, step: &str) -> WorkerResult<()> {
        self.backend
            .set_step_in_progress(run_id, step, Value::Null)
            .await
    }

    pub async fn log_event(
        &self,
        run_id: &str,
        level: &str,
        message: &str,
        details: Value,
    ) -> WorkerResult<()> {
        self.backend.log_event(run_id, level, message, details).await
    }

    /// Mark a step failed: ship the diagnostic event first, then merge the
    /// `failed` phase with the categorical error. A lost lease during the
    /// merge is propagated; any other secondary failure is logged and
    /// swallowed so the original error stays visible.
    pub async fn fail_step(
        &self,
        run_id: &str,
        step: &str,
        error: &WorkerError,
        evidence: Value,
        lease: &Lease,
    ) -> WorkerResult<()> {
        if let Err(log_err) = self
            .backend
            .log_event(run_id, "error", &error.to_string(), evidence)
            .await
        {
            warn!(run_id, step, error = %log_err, "diagnostic event could not be shipped");
        }
        let patch = CheckpointPatch {
            phase: Some(SubPhase::Failed),
            last_error: Some(error.code().to_string()),
            ..CheckpointPatch::default()
        };
        match self.merge_parse_merge(run_id, step, &patch, lease).await {
            Err(WorkerError::LockLost) => Err(WorkerError::LockLost),
            Err(other) => {
                warn!(run_id, step, error = %other, "failed-state merge did not land");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }
}
