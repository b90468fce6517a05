//! HTTP checkpoint backend.
//!
//! Talks to the pipeline database through a PostgREST-style RPC surface:
//! `POST {base}/rpc/{function}` with a JSON argument object. The service
//! key travels in both `apikey` and `Authorization` headers. A 409 from
//! `merge_step_patch` means the invocation lease was reassigned.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::checkpoint::store::{CheckpointBackend, Lease};
use crate::error::{WorkerError, WorkerResult};

#[derive(Clone)]
pub struct HttpCheckpointBackend {
    client: Client,
    base_url: String,
    service_key: String,
}

impl HttpCheckpointBackend {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> WorkerResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| WorkerError::CheckpointRpc {
                rpc: "client_init",
                detail: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
        })
    }

    async fn call(&self, rpc: &'static str, args: Value) -> WorkerResult<Value> {
        let url = format!("{}/rpc/{}", self.base_url, rpc);
        let resp = self
            .client
            .post(&url)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .json(&args)
            .send()
            .await
            .map_err(|e| WorkerError::CheckpointRpc {
                rpc,
                detail: e.to_string(),
            })?;

        let status = resp.status();
        if status.as_u16() == 409 {
            return Err(WorkerError::LockLost);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(WorkerError::CheckpointRpc {
                rpc,
                detail: format!("status {status}: {body}"),
            });
        }
        if status.as_u16() == 204 {
            return Ok(Value::Null);
        }
        resp.json::<Value>()
            .await
            .map_err(|e| WorkerError::CheckpointRpc {
                rpc,
                detail: format!("response parse failed: {e}"),
            })
    }
}

#[async_trait]
impl CheckpointBackend for HttpCheckpointBackend {
    async fn fetch_step_state(&self, run_id: &str, step: &str) -> WorkerResult<Option<Value>> {
        let value = self
            .call(
                "fetch_step_state",
                json!({ "p_run_id": run_id, "p_step": step }),
            )
            .await?;
        Ok(match value {
            Value::Null => None,
            other => Some(other),
        })
    }

    async fn merge_step_patch(
        &self,
        run_id: &str,
        step: &str,
        patch: Value,
        lease: &Lease,
    ) -> WorkerResult<()> {
        self.call(
            "merge_step_patch",
            json!({
                "p_run_id": run_id,
                "p_step": step,
                "p_patch": patch,
                "p_lock_invocation_id": lease.as_str(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn merge_metrics_patch(&self, run_id: &str, patch: Value) -> WorkerResult<()> {
        self.call(
            "merge_metrics_patch",
            json!({ "p_run_id": run_id, "p_patch": patch }),
        )
        .await?;
        Ok(())
    }

    async fn set_step_in_progress(
        &self,
        run_id: &str,
        step: &str,
        extra: Value,
    ) -> WorkerResult<()> {
        self.call(
            "set_step_in_progress",
            json!({ "p_run_id": run_id, "p_step": step, "p_extra": extra }),
        )
        .await?;
        Ok(())
    }

    async fn log_event(
        &self,
        run_id: &str,
        level: &str,
        message: &str,
        details: Value,
    ) -> WorkerResult<()> {
        self.call(
            "log_event",
            json!({
                "p_run_id": run_id,
                "p_level": level,
                "p_message": message,
                "p_details": details,
            }),
        )
        .await?;
        Ok(())
    }
}
