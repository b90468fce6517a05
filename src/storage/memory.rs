//! In-memory object store.
//!
//! Used by tests and local development. Ranged fetches emulate an HTTP
//! origin closely enough to exercise the chunker's protocol validation:
//! 206 with `Content-Range` by default, 416 past the end, and two test
//! controls for degraded origins (range-less 200 responses and a forged
//! `Content-Range` header).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{WorkerError, WorkerResult};
use crate::storage::object_store::{ObjectStore, RangeFetch, StoredObject};

#[derive(Clone)]
struct Entry {
    bytes: Vec<u8>,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<(String, String), Entry>>,
    /// Serve ranged requests as a plain 200 with the full body.
    ignore_range_requests: RwLock<bool>,
    /// Forge the `Content-Range` header of the next ranged response.
    forced_content_range: RwLock<Option<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, path: &str, bytes: impl Into<Vec<u8>>) {
        self.put_created_at(bucket, path, bytes, Utc::now());
    }

    /// Insert with an explicit creation time, for newest-first listings.
    pub fn put_created_at(
        &self,
        bucket: &str,
        path: &str,
        bytes: impl Into<Vec<u8>>,
        created_at: DateTime<Utc>,
    ) {
        self.objects.write().insert(
            (bucket.to_string(), path.to_string()),
            Entry {
                bytes: bytes.into(),
                created_at,
            },
        );
    }

    pub fn get(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        self.objects
            .read()
            .get(&(bucket.to_string(), path.to_string()))
            .map(|e| e.bytes.clone())
    }

    pub fn exists(&self, bucket: &str, path: &str) -> bool {
        self.objects
            .read()
            .contains_key(&(bucket.to_string(), path.to_string()))
    }

    pub fn delete(&self, bucket: &str, path: &str) {
        self.objects
            .write()
            .remove(&(bucket.to_string(), path.to_string()));
    }

    /// Emulate an origin that ignores `Range` headers.
    pub fn set_ignore_range_requests(&self, ignore: bool) {
        *self.ignore_range_requests.write() = ignore;
    }

    /// Emulate an origin that answers with a bogus `Content-Range`.
    pub fn set_forced_content_range(&self, header: Option<String>) {
        *self.forced_content_range.write() = header;
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> WorkerResult<Vec<StoredObject>> {
        let want = format!("{prefix}/");
        let mut entries: Vec<StoredObject> = self
            .objects
            .read()
            .iter()
            .filter(|((b, p), _)| b == bucket && p.starts_with(&want))
            .map(|((_, p), entry)| StoredObject {
                name: p[want.len()..].to_string(),
                created_at: Some(entry.created_at),
            })
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    async fn download(&self, bucket: &str, path: &str) -> WorkerResult<Vec<u8>> {
        self.get(bucket, path)
            .ok_or_else(|| WorkerError::ArtifactMissing {
                path: format!("{bucket}/{path}"),
            })
    }

    async fn try_download(&self, bucket: &str, path: &str) -> WorkerResult<Option<Vec<u8>>> {
        Ok(self.get(bucket, path))
    }

    async fn download_range(
        &self,
        bucket: &str,
        path: &str,
        start: u64,
        end: u64,
    ) -> WorkerResult<RangeFetch> {
        let bytes = self.download(bucket, path).await?;
        let total = bytes.len() as u64;

        if *self.ignore_range_requests.read() {
            return Ok(RangeFetch {
                status: 200,
                content_range: None,
                body: bytes,
            });
        }
        if start >= total {
            return Ok(RangeFetch {
                status: 416,
                content_range: Some(format!("bytes */{total}")),
                body: Vec::new(),
            });
        }

        let effective_end = end.min(total - 1);
        let body = bytes[start as usize..=effective_end as usize].to_vec();
        let content_range = self
            .forced_content_range
            .read()
            .clone()
            .unwrap_or_else(|| format!("bytes {start}-{effective_end}/{total}"));
        Ok(RangeFetch {
            status: 206,
            content_range: Some(content_range),
            body,
        })
    }

    async fn head_len(&self, bucket: &str, path: &str) -> WorkerResult<Option<u64>> {
        Ok(self.get(bucket, path).map(|b| b.len() as u64))
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> WorkerResult<()> {
        self.put(bucket, path, bytes);
        Ok(())
    }

    async fn remove(&self, bucket: &str, path: &str) -> WorkerResult<()> {
        self.delete(bucket, path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::object_store::newest_under;

    #[tokio::test]
    async fn list_returns_newest_first() {
        let store = MemoryObjectStore::new();
        let older = Utc::now() - chrono::Duration::hours(2);
        store.put_created_at("ftp-import", "stock/old.csv", b"a".to_vec(), older);
        store.put("ftp-import", "stock/new.csv", b"b".to_vec());

        let newest = newest_under(&store, "ftp-import", "stock").await.unwrap();
        assert_eq!(newest.as_deref(), Some("stock/new.csv"));
    }

    #[tokio::test]
    async fn ranged_fetch_reports_content_range() {
        let store = MemoryObjectStore::new();
        store.put("b", "f", b"0123456789".to_vec());

        let fetch = store.download_range("b", "f", 2, 5).await.unwrap();
        assert_eq!(fetch.status, 206);
        assert_eq!(fetch.body, b"2345");
        assert_eq!(fetch.content_range.as_deref(), Some("bytes 2-5/10"));

        let past_end = store.download_range("b", "f", 10, 12).await.unwrap();
        assert_eq!(past_end.status, 416);
        assert!(past_end.body.is_empty());
    }

    #[tokio::test]
    async fn range_less_origin_returns_full_body() {
        let store = MemoryObjectStore::new();
        store.put("b", "f", b"0123456789".to_vec());
        store.set_ignore_range_requests(true);

        let fetch = store.download_range("b", "f", 0, 3).await.unwrap();
        assert_eq!(fetch.status, 200);
        assert_eq!(fetch.body.len(), 10);
        assert!(fetch.content_range.is_none());
    }
}
