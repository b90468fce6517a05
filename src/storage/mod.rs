//! Object storage: trait, providers, and the bucket/path layout.

pub mod http;
pub mod layout;
pub mod memory;
pub mod object_store;

pub use http::HttpObjectStore;
pub use memory::MemoryObjectStore;
pub use object_store::{newest_under, ObjectStore, RangeFetch, StoredObject};
