//! HTTP surface of the worker.

pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use crate::checkpoint::CheckpointStore;
use crate::storage::ObjectStore;

/// Shared server state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ObjectStore>,
    pub checkpoints: CheckpointStore,
    pub soft_budget: Duration,
}

pub use routes::{invoke_worker, Step, WorkerRequest, WorkerResponse};
