//! Parse-merge subsystem.
//!
//! A checkpoint-driven pipeline that turns the material feed plus the stock
//! and price indices into the canonical product table, across as many
//! bounded invocations as the feed size requires.

pub mod chunker;
pub mod finalize;
pub mod header;
pub mod indices;

use serde_json::json;
use tracing::info;

use crate::checkpoint::{CheckpointPatch, ParseMergeCheckpoint, SubPhase};
use crate::context::StepContext;
use crate::error::WorkerResult;
use crate::models::StepStatus;

/// Step name in the checkpoint store.
pub const STEP_NAME: &str = "parse_merge";

/// Upper bound for one ranged fetch of the material feed.
pub const RANGE_FETCH_BYTES: usize = 2 * 1024 * 1024;
/// Upper bound for partial-line carry between invocations.
pub const MAX_CARRY_BYTES: usize = 256 * 1024;
/// Slack allowed on bounded 200 responses before declaring the origin
/// range-incapable.
pub const RANGE_TOLERANCE_BYTES: usize = 64 * 1024;
/// Size of the header probe slice.
pub const HEADER_PROBE_BYTES: usize = 8 * 1024;
/// Hard ceiling on output chunks per run.
pub const CHUNK_LIMIT: u32 = 50;
/// Hard ceiling on the finished product table.
pub const TABLE_MAX_BYTES: u64 = 40 * 1024 * 1024;

/// One parse-merge invocation: load the checkpoint, execute the current
/// sub-phase, persist the advanced checkpoint, report the step status.
pub async fn run(ctx: &StepContext) -> WorkerResult<StepStatus> {
    let cp = match ctx
        .checkpoints
        .load_parse_merge(&ctx.run_id, STEP_NAME)
        .await?
    {
        Some(cp) => cp,
        None => {
            let patch = CheckpointPatch {
                phase: Some(SubPhase::Pending),
                started_at: Some(chrono::Utc::now()),
                ..CheckpointPatch::default()
            };
            ctx.checkpoints
                .merge_parse_merge(&ctx.run_id, STEP_NAME, &patch, &ctx.lease)
                .await?;
            ParseMergeCheckpoint {
                phase: SubPhase::Pending,
                ..ParseMergeCheckpoint::default()
            }
        }
    };

    match cp.phase {
        SubPhase::Pending | SubPhase::BuildingStockIndex => {
            build_stock_phase(ctx).await
        }
        SubPhase::BuildingPriceIndex => build_price_phase(ctx).await,
        SubPhase::PreparingMaterial => prepare_material_phase(ctx).await,
        SubPhase::InProgress => chunker::run_chunk_invocation(ctx, &cp).await,
        SubPhase::Finalizing => finalize::run_finalize_invocation(ctx, &cp).await,
        // Repeating a completed run is a no-op; a failed run stays failed
        // until the orchestrator starts a new one.
        SubPhase::Completed => Ok(StepStatus::Completed),
        SubPhase::Failed => Ok(StepStatus::Failed),
    }
}

async fn build_stock_phase(ctx: &StepContext) -> WorkerResult<StepStatus> {
    let patch = CheckpointPatch::phase(SubPhase::BuildingStockIndex);
    ctx.checkpoints
        .merge_parse_merge(&ctx.run_id, STEP_NAME, &patch, &ctx.lease)
        .await?;

    let summary = indices::build_stock_index(ctx.store(), &ctx.run_id).await?;
    ctx.checkpoints
        .merge_metrics(
            &ctx.run_id,
            json!({
                "stockIndexEntries": summary.entries,
                "invalidStockValues": summary.invalid_values,
            }),
        )
        .await?;

    ctx.checkpoints
        .merge_parse_merge(
            &ctx.run_id,
            STEP_NAME,
            &CheckpointPatch::phase(SubPhase::BuildingPriceIndex),
            &ctx.lease,
        )
        .await?;
    Ok(StepStatus::InProgress)
}

async fn build_price_phase(ctx: &StepContext) -> WorkerResult<StepStatus> {
    let summary = indices::build_price_index(ctx.store(), &ctx.run_id).await?;
    ctx.checkpoints
        .merge_metrics(&ctx.run_id, json!({ "priceIndexEntries": summary.entries }))
        .await?;

    ctx.checkpoints
        .merge_parse_merge(
            &ctx.run_id,
            STEP_NAME,
            &CheckpointPatch::phase(SubPhase::PreparingMaterial),
            &ctx.lease,
        )
        .await?;
    Ok(StepStatus::InProgress)
}

async fn prepare_material_phase(ctx: &StepContext) -> WorkerResult<StepStatus> {
    let meta = indices::probe_material(ctx.store(), &ctx.run_id).await?;
    info!(
        run_id = %ctx.run_id,
        total_bytes = meta.total_bytes,
        range_supported = meta.range_supported,
        "material prepared, chunking starts"
    );

    let patch = CheckpointPatch {
        phase: Some(SubPhase::InProgress),
        cursor: Some(meta.header_end),
        total_bytes: Some(meta.total_bytes),
        ..CheckpointPatch::default()
    };
    ctx.checkpoints
        .merge_parse_merge(&ctx.run_id, STEP_NAME, &patch, &ctx.lease)
        .await?;
    Ok(StepStatus::InProgress)
}
