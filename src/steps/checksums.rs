//! Template checksum step.
//!
//! Computes the SHA-256 of every registered template as currently stored,
//! for operators refreshing the pinned digests after a template revision.
//! The digests land in the run metrics and one diagnostic event each.

use serde_json::json;
use tracing::info;

use crate::context::StepContext;
use crate::error::WorkerResult;
use crate::exports::template::{sha256_hex, TEMPLATES};
use crate::models::StepStatus;
use crate::storage::layout;

pub async fn run(ctx: &StepContext) -> WorkerResult<StepStatus> {
    let mut digests = serde_json::Map::new();
    for spec in TEMPLATES {
        let digest = match ctx
            .store()
            .try_download(layout::EXPORTS_BUCKET, spec.path)
            .await?
        {
            Some(bytes) if !bytes.is_empty() => sha256_hex(&bytes),
            _ => "missing".to_string(),
        };
        let pinned = digest == spec.sha256;
        ctx.checkpoints
            .log_event(
                &ctx.run_id,
                "info",
                "template checksum computed",
                json!({ "template": spec.name, "sha256": digest, "matchesPinned": pinned }),
            )
            .await?;
        info!(run_id = %ctx.run_id, template = spec.name, %digest, pinned, "template checksum");
        digests.insert(spec.name.to_string(), json!(digest));
    }

    let mut patch = serde_json::Map::new();
    patch.insert("templateChecksums".to_string(), digests.into());
    ctx.checkpoints
        .merge_metrics(&ctx.run_id, patch.into())
        .await?;
    Ok(StepStatus::Completed)
}
