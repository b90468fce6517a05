//! Range reader and chunker.
//!
//! Advances the material cursor by one bounded unit of work per invocation:
//! at most one 2 MiB fetch, joined line by line against the loaded indices,
//! emitted as one numbered output chunk. All continuation state (cursor,
//! carry, counters) lives in the checkpoint; nothing survives in memory.

use serde_json::json;
use tracing::{info, warn};

use crate::checkpoint::{CheckpointPatch, ParseMergeCheckpoint, SkipCounters, SubPhase};
use crate::context::StepContext;
use crate::error::{WorkerError, WorkerResult};
use crate::models::{ProductRow, StepStatus};
use crate::parse_merge::header::{decode_utf8_with_fallback, normalize_line_endings};
use crate::parse_merge::indices::{
    load_chunking_artifacts, MaterialMeta, PriceIndex, StockIndex,
};
use crate::parse_merge::{MAX_CARRY_BYTES, RANGE_FETCH_BYTES, RANGE_TOLERANCE_BYTES, STEP_NAME};
use crate::storage::layout;

/// Outcome of one validated material fetch.
enum FetchOutcome {
    /// Origin reports no bytes at the cursor (HTTP 416).
    Eof,
    Data {
        body: Vec<u8>,
        next_cursor: u64,
    },
}

pub async fn run_chunk_invocation(
    ctx: &StepContext,
    cp: &ParseMergeCheckpoint,
) -> WorkerResult<StepStatus> {
    // EOF with nothing carried: hand over to the finalizer.
    if cp.cursor >= cp.total_bytes && cp.carry.is_empty() {
        ctx.checkpoints
            .merge_parse_merge(
                &ctx.run_id,
                STEP_NAME,
                &CheckpointPatch::phase(SubPhase::Finalizing),
                &ctx.lease,
            )
            .await?;
        return Ok(StepStatus::Finalizing);
    }

    // The artifact-rebuild guard: a clearly-missing artifact is recoverable
    // exactly once; anything else is fatal.
    let artifacts = match load_chunking_artifacts(ctx.store(), &ctx.run_id).await {
        Ok(Some(artifacts)) => artifacts,
        Ok(None) => return rebuild_or_fail(ctx, cp).await,
        Err(err) => return Err(err),
    };
    let (stock, price, meta) = artifacts;
    let join = LineJoin {
        meta: &meta,
        stock: &stock,
        price: &price,
    };

    // EOF with a carried tail: the feed ended without a trailing newline,
    // so the carry is the last line.
    if cp.cursor >= cp.total_bytes {
        return flush_final_carry(ctx, cp, &join).await;
    }

    let outcome = if meta.range_supported {
        fetch_ranged(ctx, cp, &meta).await?
    } else {
        fetch_material_part(ctx, cp, &meta).await?
    };

    let (body, next_cursor) = match outcome {
        FetchOutcome::Eof => {
            // The origin's view of the end wins over the recorded total.
            if cp.carry.is_empty() {
                ctx.checkpoints
                    .merge_parse_merge(
                        &ctx.run_id,
                        STEP_NAME,
                        &CheckpointPatch {
                            phase: Some(SubPhase::Finalizing),
                            cursor: Some(cp.total_bytes),
                            ..CheckpointPatch::default()
                        },
                        &ctx.lease,
                    )
                    .await?;
                return Ok(StepStatus::Finalizing);
            }
            return flush_final_carry(ctx, cp, &join).await;
        }
        FetchOutcome::Data { body, next_cursor } => (body, next_cursor),
    };

    if next_cursor < cp.cursor {
        return Err(WorkerError::CursorRegression {
            cursor: cp.cursor,
            next: next_cursor,
        });
    }

    // Prepend the carry, then split at the last newline: everything up to it
    // is complete, the tail becomes the next carry.
    let mut combined = Vec::with_capacity(cp.carry.len() + body.len());
    combined.extend_from_slice(&cp.carry);
    combined.extend_from_slice(&body);

    let (complete, new_carry): (&[u8], &[u8]) = match combined.iter().rposition(|&b| b == b'\n') {
        Some(pos) => (&combined[..=pos], &combined[pos + 1..]),
        None => (&[][..], &combined[..]),
    };
    if new_carry.len() > MAX_CARRY_BYTES {
        return Err(WorkerError::CarryOverflow {
            size: new_carry.len(),
            limit: MAX_CARRY_BYTES,
        });
    }

    let mut skip_delta = SkipCounters::default();
    let mut out_lines: Vec<String> = Vec::new();
    if !complete.is_empty() {
        let (text, lossy) = decode_utf8_with_fallback(complete);
        if lossy {
            warn!(run_id = %ctx.run_id, cursor = cp.cursor, "material slice decoded lossily");
        }
        let text = normalize_line_endings(&text);
        join.process_lines(&text, &mut skip_delta, &mut out_lines);
    }

    let emitted = out_lines.len() as u64;
    let mut chunk_count = cp.chunk_count;
    if !out_lines.is_empty() {
        let mut chunk = out_lines.join("\n");
        chunk.push('\n');
        ctx.store()
            .upload(
                layout::EXPORTS_BUCKET,
                &layout::chunk_path(&ctx.run_id, chunk_count),
                chunk.into_bytes(),
                "text/tab-separated-values",
            )
            .await?;
        chunk_count += 1;
    }

    let mut skips = cp.skips;
    skips.add(&skip_delta);
    let eof_reached = next_cursor >= cp.total_bytes && new_carry.is_empty();

    let patch = CheckpointPatch {
        phase: eof_reached.then_some(SubPhase::Finalizing),
        cursor: Some(next_cursor),
        chunk_count: Some(chunk_count),
        material_chunk: (!meta.range_supported).then_some(cp.material_chunk + 1),
        carry: Some(new_carry.to_vec()),
        skips: Some(skips),
        product_count: Some(cp.product_count + emitted),
        ..CheckpointPatch::default()
    };
    ctx.checkpoints
        .merge_parse_merge(&ctx.run_id, STEP_NAME, &patch, &ctx.lease)
        .await?;

    info!(
        run_id = %ctx.run_id,
        cursor = next_cursor,
        total = cp.total_bytes,
        emitted,
        carry = new_carry.len(),
        "chunk invocation advanced"
    );
    Ok(if eof_reached {
        StepStatus::Finalizing
    } else {
        StepStatus::InProgress
    })
}

/// Ranged fetch with full protocol validation.
async fn fetch_ranged(
    ctx: &StepContext,
    cp: &ParseMergeCheckpoint,
    meta: &MaterialMeta,
) -> WorkerResult<FetchOutcome> {
    let start = cp.cursor;
    let end = start + RANGE_FETCH_BYTES as u64 - 1;
    let fetch = ctx
        .store()
        .download_range(&meta.bucket, &meta.path, start, end)
        .await?;

    match fetch.status {
        416 => Ok(FetchOutcome::Eof),
        206 => {
            let header = fetch.content_range.as_deref().ok_or_else(|| {
                WorkerError::ContentRangeMismatch {
                    detail: format!("206 without Content-Range at cursor {start}"),
                }
            })?;
            let (recv_start, recv_end) = parse_content_range_bounds(header).ok_or_else(|| {
                WorkerError::ContentRangeMismatch {
                    detail: format!("unparseable Content-Range {header:?} at cursor {start}"),
                }
            })?;
            if recv_start != start || recv_end < recv_start {
                return Err(WorkerError::ContentRangeMismatch {
                    detail: format!(
                        "requested bytes={start}-{end}, origin answered {header:?}"
                    ),
                });
            }
            let declared = recv_end - recv_start + 1;
            let received = fetch.body.len() as u64;
            if declared.abs_diff(received) > 1 {
                return Err(WorkerError::ContentRangeMismatch {
                    detail: format!(
                        "Content-Range {header:?} declares {declared} bytes, body has {received}"
                    ),
                });
            }
            Ok(FetchOutcome::Data {
                body: fetch.body,
                next_cursor: recv_end + 1,
            })
        }
        200 => {
            // A bounded 200 means the origin returned the whole object from
            // byte zero; acceptable only while one slice covers it.
            let len = fetch.body.len();
            if len > RANGE_FETCH_BYTES + RANGE_TOLERANCE_BYTES {
                return Err(WorkerError::RangeRequestFailed {
                    status: 200,
                    detail: format!(
                        "origin ignored Range at cursor {start} and returned {len} bytes"
                    ),
                });
            }
            if (start as usize) > len {
                return Err(WorkerError::RangeRequestFailed {
                    status: 200,
                    detail: format!("full body of {len} bytes does not reach cursor {start}"),
                });
            }
            Ok(FetchOutcome::Data {
                body: fetch.body[start as usize..].to_vec(),
                next_cursor: len as u64,
            })
        }
        status => Err(WorkerError::RangeRequestFailed {
            status,
            detail: format!("material fetch at cursor {start}"),
        }),
    }
}

/// Chunk-file fallback: consume the numbered material part the cursor
/// points into. Parts are aligned to absolute file offsets, so cursor
/// arithmetic is identical to range mode.
async fn fetch_material_part(
    ctx: &StepContext,
    cp: &ParseMergeCheckpoint,
    meta: &MaterialMeta,
) -> WorkerResult<FetchOutcome> {
    let part_index = cp.material_chunk;
    if part_index >= meta.material_parts {
        return Ok(FetchOutcome::Eof);
    }
    let part_start = part_index as u64 * RANGE_FETCH_BYTES as u64;
    let part = ctx
        .store()
        .download(
            layout::EXPORTS_BUCKET,
            &layout::material_part_path(&ctx.run_id, part_index),
        )
        .await?;
    let offset = cp.cursor.checked_sub(part_start).ok_or_else(|| {
        WorkerError::CursorRegression {
            cursor: cp.cursor,
            next: part_start,
        }
    })? as usize;
    if offset > part.len() {
        return Err(WorkerError::RangeRequestFailed {
            status: 200,
            detail: format!(
                "material part {part_index} has {} bytes, cursor offset is {offset}",
                part.len()
            ),
        });
    }
    Ok(FetchOutcome::Data {
        body: part[offset..].to_vec(),
        next_cursor: part_start + part.len() as u64,
    })
}

/// The feed ended without a trailing newline: the carry is the last line.
async fn flush_final_carry(
    ctx: &StepContext,
    cp: &ParseMergeCheckpoint,
    join: &LineJoin<'_>,
) -> WorkerResult<StepStatus> {
    let (text, lossy) = decode_utf8_with_fallback(&cp.carry);
    if lossy {
        warn!(run_id = %ctx.run_id, "final carry decoded lossily");
    }
    let text = normalize_line_endings(&text);

    let mut skip_delta = SkipCounters::default();
    let mut out_lines = Vec::new();
    join.process_lines(&text, &mut skip_delta, &mut out_lines);

    let emitted = out_lines.len() as u64;
    let mut chunk_count = cp.chunk_count;
    if !out_lines.is_empty() {
        let mut chunk = out_lines.join("\n");
        chunk.push('\n');
        ctx.store()
            .upload(
                layout::EXPORTS_BUCKET,
                &layout::chunk_path(&ctx.run_id, chunk_count),
                chunk.into_bytes(),
                "text/tab-separated-values",
            )
            .await?;
        chunk_count += 1;
    }

    let mut skips = cp.skips;
    skips.add(&skip_delta);
    let patch = CheckpointPatch {
        phase: Some(SubPhase::Finalizing),
        chunk_count: Some(chunk_count),
        carry: Some(Vec::new()),
        skips: Some(skips),
        product_count: Some(cp.product_count + emitted),
        ..CheckpointPatch::default()
    };
    ctx.checkpoints
        .merge_parse_merge(&ctx.run_id, STEP_NAME, &patch, &ctx.lease)
        .await?;
    Ok(StepStatus::Finalizing)
}

/// One-shot reset to `pending` for a clearly-missing artifact; fatal on the
/// second encounter within the same run.
async fn rebuild_or_fail(
    ctx: &StepContext,
    cp: &ParseMergeCheckpoint,
) -> WorkerResult<StepStatus> {
    if cp.artifact_rebuild_attempted {
        return Err(WorkerError::ArtifactMissing {
            path: format!("{}/{}", layout::EXPORTS_BUCKET, layout::pipeline_root(&ctx.run_id)),
        });
    }
    warn!(
        run_id = %ctx.run_id,
        cursor = cp.cursor,
        "pipeline artifact missing mid-chunking, resetting run for rebuild"
    );
    ctx.checkpoints
        .log_event(
            &ctx.run_id,
            "warn",
            "artifact missing, one-shot rebuild triggered",
            json!({ "cursor": cp.cursor, "chunk": cp.chunk_count }),
        )
        .await?;
    ctx.checkpoints
        .merge_parse_merge(
            &ctx.run_id,
            STEP_NAME,
            &CheckpointPatch::rebuild_reset(),
            &ctx.lease,
        )
        .await?;
    Ok(StepStatus::InProgress)
}

/// `bytes a-b/total` → `(a, b)`.
fn parse_content_range_bounds(header: &str) -> Option<(u64, u64)> {
    let rest = header.trim().strip_prefix("bytes")?.trim();
    let (range, _total) = rest.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}

/// Joins complete material lines against the indices and applies the
/// survival filter.
struct LineJoin<'a> {
    meta: &'a MaterialMeta,
    stock: &'a StockIndex,
    price: &'a PriceIndex,
}

impl LineJoin<'_> {
    fn process_lines(&self, text: &str, skips: &mut SkipCounters, out: &mut Vec<String>) {
        for line in text.split('\n') {
            if line.is_empty() {
                continue;
            }
            self.process_line(line, skips, out);
        }
    }

    fn process_line(&self, line: &str, skips: &mut SkipCounters, out: &mut Vec<String>) {
        let cells: Vec<&str> = line.split(self.meta.delimiter).collect();
        let cell = |idx: usize| cells.get(idx).map_or("", |c| c.trim());
        let matnr = cell(self.meta.col_matnr);

        let Some(&stock) = self.stock.get(matnr) else {
            skips.no_stock += 1;
            return;
        };
        let Some(price) = self.price.get(matnr) else {
            skips.no_price += 1;
            return;
        };
        if stock < 2 {
            skips.low_stock += 1;
            return;
        }
        if price.list_price <= 0.0 && price.best_price <= 0.0 {
            skips.no_valid += 1;
            return;
        }

        let row = ProductRow {
            matnr: matnr.to_string(),
            mpn: cell(self.meta.col_mpn).to_string(),
            ean: cell(self.meta.col_ean).to_string(),
            description: cell(self.meta.col_desc).to_string(),
            stock,
            list_price: price.list_price,
            best_price: price.best_price,
            surcharge: price.surcharge,
        };
        out.push(row.to_tsv_line());
    }
}
