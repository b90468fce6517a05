//! Index builder.
//!
//! Three sequential sub-phases, one per invocation: build the stock index,
//! build the price index, probe the material header. The indices are built
//! in one pass over their feed and persisted as single JSON objects; the
//! material probe never downloads the body in range mode.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::parse_merge::header::{
    decode_utf8_with_fallback, normalize_line_endings, resolve_header, strip_bom,
    MATERIAL_COLUMNS, PRICE_COLUMNS, STOCK_COLUMNS,
};
use crate::parse_merge::{HEADER_PROBE_BYTES, RANGE_FETCH_BYTES, RANGE_TOLERANCE_BYTES};
use crate::storage::{layout, newest_under, ObjectStore};

/// Material-number → available quantity.
pub type StockIndex = HashMap<String, i64>;

/// Price triple per material. Serialized keys mirror the product table
/// columns (`lp`, `cbp`, `sur`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceEntry {
    #[serde(rename = "lp")]
    pub list_price: f64,
    #[serde(rename = "cbp")]
    pub best_price: f64,
    #[serde(rename = "sur")]
    pub surcharge: f64,
}

/// Material-number → price triple.
pub type PriceIndex = HashMap<String, PriceEntry>;

/// Per-run material feed metadata recorded by the header probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialMeta {
    pub delimiter: char,
    pub col_matnr: usize,
    pub col_mpn: usize,
    pub col_ean: usize,
    pub col_desc: usize,
    /// Byte offset immediately past the first LF; the chunker starts here.
    pub header_end: u64,
    pub total_bytes: u64,
    pub bucket: String,
    pub path: String,
    /// False when the origin ignored the probe's Range header; the chunker
    /// then consumes pre-split material parts instead of ranged fetches.
    pub range_supported: bool,
    /// Number of material parts written in fallback mode, 0 otherwise.
    pub material_parts: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IndexBuildSummary {
    pub entries: usize,
    pub invalid_values: u64,
    pub decode_fallback: bool,
}

/// Locate the newest feed file under `prefix`, or fail the run.
async fn newest_feed(
    store: &dyn ObjectStore,
    prefix: &str,
    feed: &'static str,
) -> WorkerResult<String> {
    newest_under(store, layout::IMPORT_BUCKET, prefix)
        .await?
        .ok_or(WorkerError::FeedMissing { feed })
}

/// Decode a full feed download into header line plus body lines.
fn feed_lines(bytes: &[u8], feed: &'static str) -> WorkerResult<(String, Vec<String>, bool)> {
    let (text, lossy) = decode_utf8_with_fallback(strip_bom(bytes));
    if lossy {
        warn!(feed, "feed is not clean UTF-8, decoded lossily");
    }
    let text = normalize_line_endings(&text);
    let mut lines = text.split('\n').map(|l| l.to_string());
    let header = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or(WorkerError::HeaderAbsent {
            feed,
            detail: "feed is empty".to_string(),
        })?;
    Ok((header, lines.collect(), lossy))
}

/// Integer quantity with tolerance for decimal exports; anything else is
/// zero plus a counter bump.
fn parse_quantity(raw: &str, invalid: &mut u64) -> i64 {
    let trimmed = raw.trim();
    if let Ok(v) = trimmed.parse::<i64>() {
        return v.max(0);
    }
    if let Ok(v) = fast_float::parse::<f64, _>(trimmed) {
        if v.is_finite() {
            return (v as i64).max(0);
        }
    }
    if !trimmed.is_empty() {
        *invalid += 1;
    }
    0
}

/// Price cell with `,` accepted as decimal separator; unparseable or
/// negative values collapse to zero.
fn parse_price(raw: &str) -> f64 {
    let trimmed = raw.trim().replace(',', ".");
    match fast_float::parse::<f64, _>(trimmed.as_str()) {
        Ok(v) if v.is_finite() && v > 0.0 => v,
        _ => 0.0,
    }
}

/// One pass over the stock feed; persists the index and returns its summary.
pub async fn build_stock_index(
    store: &dyn ObjectStore,
    run_id: &str,
) -> WorkerResult<IndexBuildSummary> {
    let path = newest_feed(store, layout::STOCK_PREFIX, "stock").await?;
    let bytes = store.download(layout::IMPORT_BUCKET, &path).await?;
    let (header, lines, lossy) = feed_lines(&bytes, "stock")?;
    let resolved = resolve_header(&header, STOCK_COLUMNS, "stock")?;
    let col_matnr = resolved.required_column("matnr");
    let col_stock = resolved.required_column("stock");

    let mut index = StockIndex::new();
    let mut invalid = 0u64;
    for line in &lines {
        if line.is_empty() {
            continue;
        }
        let cells: Vec<&str> = line.split(resolved.delimiter).collect();
        let matnr = cells.get(col_matnr).map_or("", |c| c.trim());
        if matnr.is_empty() {
            continue;
        }
        let qty = parse_quantity(cells.get(col_stock).unwrap_or(&""), &mut invalid);
        *index.entry(matnr.to_string()).or_insert(0) += qty;
    }

    let body = serde_json::to_vec(&index).map_err(|e| WorkerError::Storage {
        op: "serialize",
        bucket: layout::EXPORTS_BUCKET.to_string(),
        path: layout::stock_index_path(run_id),
        detail: e.to_string(),
    })?;
    store
        .upload(
            layout::EXPORTS_BUCKET,
            &layout::stock_index_path(run_id),
            body,
            "application/json",
        )
        .await?;
    info!(run_id, entries = index.len(), invalid, source = %path, "stock index built");
    Ok(IndexBuildSummary {
        entries: index.len(),
        invalid_values: invalid,
        decode_fallback: lossy,
    })
}

/// One pass over the price feed; persists the index and returns its summary.
pub async fn build_price_index(
    store: &dyn ObjectStore,
    run_id: &str,
) -> WorkerResult<IndexBuildSummary> {
    let path = newest_feed(store, layout::PRICE_PREFIX, "price").await?;
    let bytes = store.download(layout::IMPORT_BUCKET, &path).await?;
    let (header, lines, lossy) = feed_lines(&bytes, "price")?;
    let resolved = resolve_header(&header, PRICE_COLUMNS, "price")?;
    let col_matnr = resolved.required_column("matnr");
    let col_list = resolved.required_column("list_price");
    let col_best = resolved.column("best_price");
    let col_sur = resolved.column("surcharge");

    let mut index = PriceIndex::new();
    for line in &lines {
        if line.is_empty() {
            continue;
        }
        let cells: Vec<&str> = line.split(resolved.delimiter).collect();
        let matnr = cells.get(col_matnr).map_or("", |c| c.trim());
        if matnr.is_empty() {
            continue;
        }
        let entry = PriceEntry {
            list_price: parse_price(cells.get(col_list).unwrap_or(&"")),
            best_price: col_best
                .and_then(|i| cells.get(i))
                .map_or(0.0, |c| parse_price(c)),
            surcharge: col_sur
                .and_then(|i| cells.get(i))
                .map_or(0.0, |c| parse_price(c)),
        };
        index.insert(matnr.to_string(), entry);
    }

    let body = serde_json::to_vec(&index).map_err(|e| WorkerError::Storage {
        op: "serialize",
        bucket: layout::EXPORTS_BUCKET.to_string(),
        path: layout::price_index_path(run_id),
        detail: e.to_string(),
    })?;
    store
        .upload(
            layout::EXPORTS_BUCKET,
            &layout::price_index_path(run_id),
            body,
            "application/json",
        )
        .await?;
    info!(run_id, entries = index.len(), source = %path, "price index built");
    Ok(IndexBuildSummary {
        entries: index.len(),
        invalid_values: 0,
        decode_fallback: lossy,
    })
}

/// Header probe: one ranged fetch of the first 8 KiB, never the body.
///
/// Detects delimiter and column layout, records where the body starts and
/// how large the feed is, and decides between range mode and chunk-file
/// fallback. In fallback mode the 200 response already carried the whole
/// body, which is immediately split into numbered material parts.
pub async fn probe_material(store: &dyn ObjectStore, run_id: &str) -> WorkerResult<MaterialMeta> {
    let path = newest_feed(store, layout::MATERIAL_PREFIX, "material").await?;
    let fetch = store
        .download_range(
            layout::IMPORT_BUCKET,
            &path,
            0,
            HEADER_PROBE_BYTES as u64 - 1,
        )
        .await?;

    let (total_bytes, range_supported, full_body): (u64, bool, Option<Vec<u8>>) = match fetch.status
    {
        206 => {
            let total = content_range_total(fetch.content_range.as_deref());
            let total = match total {
                Some(t) => t,
                None => store
                    .head_len(layout::IMPORT_BUCKET, &path)
                    .await?
                    .ok_or_else(|| WorkerError::ContentRangeMismatch {
                        detail: format!(
                            "206 without usable total (content-range {:?}) and no HEAD length",
                            fetch.content_range
                        ),
                    })?,
            };
            (total, true, None)
        }
        200 => {
            let len = fetch.body.len() as u64;
            if fetch.body.len() > HEADER_PROBE_BYTES + RANGE_TOLERANCE_BYTES {
                // Origin ignored the Range header; the whole feed is here.
                (len, false, Some(fetch.body.clone()))
            } else {
                (len, true, None)
            }
        }
        416 => {
            return Err(WorkerError::HeaderAbsent {
                feed: "material",
                detail: "feed is empty".to_string(),
            });
        }
        status => {
            return Err(WorkerError::RangeRequestFailed {
                status,
                detail: format!("header probe of {path}"),
            });
        }
    };

    let slice_len = fetch.body.len().min(HEADER_PROBE_BYTES);
    let header_slice = &fetch.body[..slice_len];
    let lf = header_slice.iter().position(|&b| b == b'\n');
    let (header_raw, header_end) = match lf {
        Some(pos) => (&header_slice[..pos], pos as u64 + 1),
        // A complete small download may legitimately end without a newline:
        // the feed is header-only.
        None if fetch.status == 200 && fetch.body.len() == total_bytes as usize => {
            (&fetch.body[..], total_bytes)
        }
        None => {
            return Err(WorkerError::HeaderAbsent {
                feed: "material",
                detail: format!("no newline in first {HEADER_PROBE_BYTES} bytes"),
            });
        }
    };

    let (header_text, lossy) = decode_utf8_with_fallback(strip_bom(header_raw));
    if lossy {
        warn!(run_id, "material header is not clean UTF-8, decoded lossily");
    }
    let header_line = header_text.trim_end_matches('\r');
    let resolved = resolve_header(header_line, MATERIAL_COLUMNS, "material")?;

    let mut meta = MaterialMeta {
        delimiter: resolved.delimiter,
        col_matnr: resolved.required_column("matnr"),
        col_mpn: resolved.required_column("mpn"),
        col_ean: resolved.required_column("ean"),
        col_desc: resolved.required_column("desc"),
        header_end,
        total_bytes,
        bucket: layout::IMPORT_BUCKET.to_string(),
        path: path.clone(),
        range_supported,
        material_parts: 0,
    };

    if let Some(body) = full_body {
        meta.material_parts = split_material_parts(store, run_id, &body).await?;
        info!(
            run_id,
            parts = meta.material_parts,
            "range unsupported by origin, material split into parts"
        );
    }

    let body = serde_json::to_vec(&meta).map_err(|e| WorkerError::Storage {
        op: "serialize",
        bucket: layout::EXPORTS_BUCKET.to_string(),
        path: layout::material_meta_path(run_id),
        detail: e.to_string(),
    })?;
    store
        .upload(
            layout::EXPORTS_BUCKET,
            &layout::material_meta_path(run_id),
            body,
            "application/json",
        )
        .await?;
    info!(
        run_id,
        total_bytes,
        header_end,
        range_supported,
        source = %path,
        "material header probed"
    );
    Ok(meta)
}

/// Total byte count from a `Content-Range: bytes a-b/total` header.
pub fn content_range_total(header: Option<&str>) -> Option<u64> {
    let header = header?;
    let total = header.rsplit('/').next()?.trim();
    total.parse::<u64>().ok()
}

/// Split a full material download into 2 MiB parts aligned to absolute file
/// offsets, so the chunker's byte cursor works identically in both modes.
async fn split_material_parts(
    store: &dyn ObjectStore,
    run_id: &str,
    body: &[u8],
) -> WorkerResult<u32> {
    let mut index = 0u32;
    let mut offset = 0usize;
    while offset < body.len() {
        let end = (offset + RANGE_FETCH_BYTES).min(body.len());
        store
            .upload(
                layout::EXPORTS_BUCKET,
                &layout::material_part_path(run_id, index),
                body[offset..end].to_vec(),
                "application/octet-stream",
            )
            .await?;
        index += 1;
        offset = end;
    }
    Ok(index)
}

/// Load both indices and the material metadata for a chunking invocation.
/// `Ok(None)` means a clearly-missing artifact (the one recoverable case);
/// any other failure propagates as-is.
pub async fn load_chunking_artifacts(
    store: &dyn ObjectStore,
    run_id: &str,
) -> WorkerResult<Option<(StockIndex, PriceIndex, MaterialMeta)>> {
    let stock_bytes = store
        .try_download(layout::EXPORTS_BUCKET, &layout::stock_index_path(run_id))
        .await?;
    let price_bytes = store
        .try_download(layout::EXPORTS_BUCKET, &layout::price_index_path(run_id))
        .await?;
    let meta_bytes = store
        .try_download(layout::EXPORTS_BUCKET, &layout::material_meta_path(run_id))
        .await?;
    let (Some(stock_bytes), Some(price_bytes), Some(meta_bytes)) =
        (stock_bytes, price_bytes, meta_bytes)
    else {
        return Ok(None);
    };

    let parse = |what: &'static str, bytes: &[u8]| -> WorkerResult<serde_json::Value> {
        serde_json::from_slice(bytes).map_err(|e| WorkerError::Storage {
            op: "parse",
            bucket: layout::EXPORTS_BUCKET.to_string(),
            path: format!("_pipeline/{run_id}/{what}"),
            detail: e.to_string(),
        })
    };
    let stock: StockIndex = serde_json::from_value(parse("stock_index.json", &stock_bytes)?)
        .map_err(|e| artifact_parse_error(run_id, "stock_index.json", e))?;
    let price: PriceIndex = serde_json::from_value(parse("price_index.json", &price_bytes)?)
        .map_err(|e| artifact_parse_error(run_id, "price_index.json", e))?;
    let meta: MaterialMeta = serde_json::from_value(parse("material_meta.json", &meta_bytes)?)
        .map_err(|e| artifact_parse_error(run_id, "material_meta.json", e))?;
    Ok(Some((stock, price, meta)))
}

fn artifact_parse_error(run_id: &str, what: &str, e: serde_json::Error) -> WorkerError {
    WorkerError::Storage {
        op: "parse",
        bucket: layout::EXPORTS_BUCKET.to_string(),
        path: format!("_pipeline/{run_id}/{what}"),
        detail: e.to_string(),
    }
}
