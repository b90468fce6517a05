//! Per-invocation execution context.

use std::sync::Arc;

use crate::checkpoint::{CheckpointStore, Lease};
use crate::config::FeeConfig;
use crate::models::InvocationBudget;
use crate::storage::ObjectStore;

/// Everything one step invocation needs: the run it works for, the lease it
/// must assert on checkpoint writes, the storage and checkpoint clients, and
/// the wall-clock budget after which it surrenders.
#[derive(Clone)]
pub struct StepContext {
    pub run_id: String,
    pub lease: Lease,
    pub store: Arc<dyn ObjectStore>,
    pub checkpoints: CheckpointStore,
    pub budget: InvocationBudget,
    pub fees: FeeConfig,
}

impl StepContext {
    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }
}
