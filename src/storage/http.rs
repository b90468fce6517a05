//! HTTP object store.
//!
//! Speaks the storage service's REST surface: `object/{bucket}/{path}` for
//! plain transfers, `object/list/{bucket}` for folder listings, and
//! `object/sign/{bucket}/{path}` to mint the signed URLs used for ranged
//! fetches against the material feed.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::error::{WorkerError, WorkerResult};
use crate::storage::object_store::{ObjectStore, RangeFetch, StoredObject};

/// Signed URLs must outlive the invocation that requested them with margin.
const SIGNED_URL_TTL_SECS: u32 = 900;

#[derive(Clone)]
pub struct HttpObjectStore {
    client: Client,
    base_url: String,
    service_key: String,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    name: String,
    created_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> WorkerResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| WorkerError::Storage {
                op: "client_init",
                bucket: String::new(),
                path: String::new(),
                detail: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
        })
    }

    fn object_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/object/{}/{}", self.base_url, bucket, path)
    }

    fn err(
        op: &'static str,
        bucket: &str,
        path: &str,
        detail: impl Into<String>,
    ) -> WorkerError {
        WorkerError::Storage {
            op,
            bucket: bucket.to_string(),
            path: path.to_string(),
            detail: detail.into(),
        }
    }

    /// Mint a short-lived signed URL for `path`.
    async fn create_signed_url(&self, bucket: &str, path: &str) -> WorkerResult<String> {
        let url = format!("{}/object/sign/{}/{}", self.base_url, bucket, path);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.service_key)
            .json(&json!({ "expiresIn": SIGNED_URL_TTL_SECS }))
            .send()
            .await
            .map_err(|e| Self::err("sign", bucket, path, e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::err("sign", bucket, path, format!("status {status}: {body}")));
        }
        let signed: SignedUrlResponse = resp
            .json()
            .await
            .map_err(|e| Self::err("sign", bucket, path, e.to_string()))?;
        Ok(format!("{}{}", self.base_url, signed.signed_url))
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> WorkerResult<Vec<StoredObject>> {
        let url = format!("{}/object/list/{}", self.base_url, bucket);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.service_key)
            .json(&json!({
                "prefix": prefix,
                "limit": 100,
                "sortBy": { "column": "created_at", "order": "desc" },
            }))
            .send()
            .await
            .map_err(|e| Self::err("list", bucket, prefix, e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(Self::err("list", bucket, prefix, format!("status {status}")));
        }
        let entries: Vec<ListEntry> = resp
            .json()
            .await
            .map_err(|e| Self::err("list", bucket, prefix, e.to_string()))?;
        Ok(entries
            .into_iter()
            .map(|e| StoredObject {
                name: e.name,
                created_at: e.created_at,
            })
            .collect())
    }

    async fn download(&self, bucket: &str, path: &str) -> WorkerResult<Vec<u8>> {
        match self.try_download(bucket, path).await? {
            Some(bytes) => Ok(bytes),
            None => Err(WorkerError::ArtifactMissing {
                path: format!("{bucket}/{path}"),
            }),
        }
    }

    async fn try_download(&self, bucket: &str, path: &str) -> WorkerResult<Option<Vec<u8>>> {
        let resp = self
            .client
            .get(self.object_url(bucket, path))
            .bearer_auth(&self.service_key)
            .send()
            .await
            .map_err(|e| Self::err("download", bucket, path, e.to_string()))?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(Self::err("download", bucket, path, format!("status {status}")));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Self::err("download", bucket, path, e.to_string()))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn download_range(
        &self,
        bucket: &str,
        path: &str,
        start: u64,
        end: u64,
    ) -> WorkerResult<RangeFetch> {
        let signed_url = self.create_signed_url(bucket, path).await?;
        let resp = self
            .client
            .get(&signed_url)
            .header(RANGE, format!("bytes={start}-{end}"))
            .send()
            .await
            .map_err(|e| Self::err("range", bucket, path, e.to_string()))?;
        let status = resp.status().as_u16();
        let content_range = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let body = resp
            .bytes()
            .await
            .map_err(|e| Self::err("range", bucket, path, e.to_string()))?;
        Ok(RangeFetch {
            status,
            content_range,
            body: body.to_vec(),
        })
    }

    async fn head_len(&self, bucket: &str, path: &str) -> WorkerResult<Option<u64>> {
        let resp = self
            .client
            .head(self.object_url(bucket, path))
            .bearer_auth(&self.service_key)
            .send()
            .await
            .map_err(|e| Self::err("head", bucket, path, e.to_string()))?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(Self::err("head", bucket, path, format!("status {status}")));
        }
        Ok(resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok()))
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> WorkerResult<()> {
        let resp = self
            .client
            .post(self.object_url(bucket, path))
            .bearer_auth(&self.service_key)
            .header("x-upsert", "true")
            .header(CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| Self::err("upload", bucket, path, e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::err("upload", bucket, path, format!("status {status}: {body}")));
        }
        Ok(())
    }

    async fn remove(&self, bucket: &str, path: &str) -> WorkerResult<()> {
        let resp = self
            .client
            .delete(self.object_url(bucket, path))
            .bearer_auth(&self.service_key)
            .send()
            .await
            .map_err(|e| Self::err("remove", bucket, path, e.to_string()))?;
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            let status = resp.status();
            return Err(Self::err("remove", bucket, path, format!("status {status}")));
        }
        Ok(())
    }
}
