//! Durable checkpoint state for resumable steps.

pub mod http;
pub mod memory;
pub mod model;
pub mod store;

pub use http::HttpCheckpointBackend;
pub use memory::MemoryCheckpointBackend;
pub use model::{CheckpointPatch, ParseMergeCheckpoint, SkipCounters, SubPhase};
pub use store::{CheckpointBackend, CheckpointStore, Lease};
