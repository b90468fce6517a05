//! Object store abstraction.
//!
//! Every network touchpoint of the worker goes through this trait so the
//! pipeline logic stays independent of the storage provider, and tests can
//! run the whole flow against the in-memory implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::WorkerResult;

/// Directory entry returned by [`ObjectStore::list`]. `name` is relative to
/// the listed prefix.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Raw result of a ranged fetch. The chunker owns all protocol validation
/// (status, Content-Range agreement), so nothing is judged here.
#[derive(Debug, Clone)]
pub struct RangeFetch {
    pub status: u16,
    pub content_range: Option<String>,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List one folder, newest first.
    async fn list(&self, bucket: &str, prefix: &str) -> WorkerResult<Vec<StoredObject>>;

    /// Download a whole object. Missing object is an error.
    async fn download(&self, bucket: &str, path: &str) -> WorkerResult<Vec<u8>>;

    /// Download a whole object, mapping a missing object to `None` so the
    /// caller can apply artifact-missing recovery.
    async fn try_download(&self, bucket: &str, path: &str) -> WorkerResult<Option<Vec<u8>>>;

    /// Ranged fetch of `start..=end`. Implementations report the raw HTTP
    /// status and `Content-Range` header; the body is whatever the origin
    /// returned (a full object on 200, empty on 416).
    async fn download_range(
        &self,
        bucket: &str,
        path: &str,
        start: u64,
        end: u64,
    ) -> WorkerResult<RangeFetch>;

    /// Object size from a HEAD request, or `None` when the object is absent.
    async fn head_len(&self, bucket: &str, path: &str) -> WorkerResult<Option<u64>>;

    /// Upload with overwrite.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> WorkerResult<()>;

    /// Remove one object. Removing an absent object is not an error.
    async fn remove(&self, bucket: &str, path: &str) -> WorkerResult<()>;
}

/// Newest object under a prefix, resolved to a full bucket path.
pub async fn newest_under(
    store: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
) -> WorkerResult<Option<String>> {
    let entries = store.list(bucket, prefix).await?;
    Ok(entries
        .into_iter()
        .next()
        .map(|obj| format!("{prefix}/{}", obj.name)))
}
