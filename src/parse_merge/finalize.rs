//! Finalizer.
//!
//! Concatenates the numbered output chunks into the canonical product
//! table, bounded by the invocation's wall-clock budget and the table size
//! ceiling. A partial accumulator is persisted between invocations so the
//! concatenation can resume mid-way.

use tracing::{info, warn};

use crate::checkpoint::{CheckpointPatch, ParseMergeCheckpoint, SubPhase};
use crate::context::StepContext;
use crate::error::{WorkerError, WorkerResult};
use crate::models::{StepStatus, PRODUCT_TABLE_HEADER};
use crate::parse_merge::{CHUNK_LIMIT, STEP_NAME, TABLE_MAX_BYTES};
use crate::storage::layout;

pub async fn run_finalize_invocation(
    ctx: &StepContext,
    cp: &ParseMergeCheckpoint,
) -> WorkerResult<StepStatus> {
    if cp.chunk_count > CHUNK_LIMIT {
        return Err(WorkerError::ChunkLimitExceeded {
            count: cp.chunk_count,
            limit: CHUNK_LIMIT,
        });
    }

    // Resume from the saved partial result when one exists; otherwise start
    // a fresh table with the header row.
    let mut table: Vec<u8> = if cp.finalize_chunk > 0 {
        match ctx
            .store()
            .try_download(layout::EXPORTS_BUCKET, &layout::finalize_partial_path(&ctx.run_id))
            .await?
        {
            Some(partial) => partial,
            None => {
                // The accumulator vanished; restart the concatenation from
                // chunk zero rather than emit a truncated table.
                warn!(run_id = %ctx.run_id, "finalize partial missing, restarting concatenation");
                return restart_finalize(ctx).await;
            }
        }
    } else {
        let mut fresh = Vec::with_capacity(1024);
        fresh.extend_from_slice(PRODUCT_TABLE_HEADER.as_bytes());
        fresh.push(b'\n');
        fresh
    };

    let mut next_chunk = cp.finalize_chunk;
    while next_chunk < cp.chunk_count {
        let chunk = ctx
            .store()
            .download(
                layout::EXPORTS_BUCKET,
                &layout::chunk_path(&ctx.run_id, next_chunk),
            )
            .await?;
        table.extend_from_slice(&chunk);
        next_chunk += 1;

        if table.len() as u64 > TABLE_MAX_BYTES {
            return Err(WorkerError::TableSizeExceeded {
                bytes: table.len() as u64,
                limit: TABLE_MAX_BYTES,
            });
        }

        if ctx.budget.exhausted() && next_chunk < cp.chunk_count {
            ctx.store()
                .upload(
                    layout::EXPORTS_BUCKET,
                    &layout::finalize_partial_path(&ctx.run_id),
                    table,
                    "text/tab-separated-values",
                )
                .await?;
            let patch = CheckpointPatch {
                finalize_chunk: Some(next_chunk),
                ..CheckpointPatch::default()
            };
            ctx.checkpoints
                .merge_parse_merge(&ctx.run_id, STEP_NAME, &patch, &ctx.lease)
                .await?;
            info!(
                run_id = %ctx.run_id,
                appended = next_chunk,
                of = cp.chunk_count,
                "finalizer yielded on time budget"
            );
            return Ok(StepStatus::Finalizing);
        }
    }

    ctx.store()
        .upload(
            layout::EXPORTS_BUCKET,
            &layout::products_path(&ctx.run_id),
            table,
            "text/tab-separated-values",
        )
        .await?;
    cleanup_transients(ctx, cp).await;

    ctx.checkpoints
        .merge_parse_merge(
            &ctx.run_id,
            STEP_NAME,
            &CheckpointPatch {
                phase: Some(SubPhase::Completed),
                finalize_chunk: Some(cp.chunk_count),
                ..CheckpointPatch::default()
            },
            &ctx.lease,
        )
        .await?;
    info!(
        run_id = %ctx.run_id,
        chunks = cp.chunk_count,
        products = cp.product_count,
        "product table finalized"
    );
    Ok(StepStatus::Completed)
}

async fn restart_finalize(ctx: &StepContext) -> WorkerResult<StepStatus> {
    let patch = CheckpointPatch {
        finalize_chunk: Some(0),
        ..CheckpointPatch::default()
    };
    ctx.checkpoints
        .merge_parse_merge(&ctx.run_id, STEP_NAME, &patch, &ctx.lease)
        .await?;
    Ok(StepStatus::Finalizing)
}

/// Best-effort removal of the run's intermediate artifacts. The product
/// table is already durable, so a failed delete only leaves garbage behind.
async fn cleanup_transients(ctx: &StepContext, cp: &ParseMergeCheckpoint) {
    let store = ctx.store();
    let mut targets = vec![
        layout::stock_index_path(&ctx.run_id),
        layout::price_index_path(&ctx.run_id),
        layout::material_meta_path(&ctx.run_id),
        layout::finalize_partial_path(&ctx.run_id),
    ];
    for index in 0..cp.chunk_count {
        targets.push(layout::chunk_path(&ctx.run_id, index));
    }
    for index in 0..cp.material_chunk {
        targets.push(layout::material_part_path(&ctx.run_id, index));
    }
    for path in targets {
        if let Err(err) = store.remove(layout::EXPORTS_BUCKET, &path).await {
            warn!(run_id = %ctx.run_id, path = %path, error = %err, "transient cleanup failed");
        }
    }
}
