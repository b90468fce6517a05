//! Stock-location index.
//!
//! The marketplace exports split every product's stock into a domestic (IT)
//! and a cross-border (EU) share, read from an auxiliary per-run feed.
//! Structural anomalies in that feed never abort an export; they are
//! counted into a fixed set of warning counters that land in the run's
//! metrics.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::warn;

use crate::error::WorkerResult;
use crate::models::ProductRow;
use crate::parse_merge::header::{
    decode_utf8_with_fallback, normalize_line_endings, resolve_header, strip_bom,
    STOCK_LOCATION_COLUMNS,
};
use crate::storage::{layout, ObjectStore};

/// Domestic warehouse location id.
pub const LOCATION_IT: &str = "4242";
/// Cross-border (EU) warehouse location id.
pub const LOCATION_EU: &str = "4254";
/// Secondary EU location: ignored for quantities, but an appearance without
/// a `4254` sibling for the same material is flagged.
pub const LOCATION_EU_SECONDARY: &str = "4255";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocationStock {
    pub stock_it: i64,
    pub stock_eu: i64,
}

/// Structural anomalies observed in the location feed and during the
/// product join. Keys mirror the metrics document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationWarnings {
    pub missing_file: u32,
    pub parse_failure: u32,
    pub missing_row: u32,
    pub split_disagreement: u32,
    pub multi_mpn: u32,
    pub orphan_secondary_eu: u32,
    pub decode_fallback_used: u32,
    pub invalid_stock_value: u32,
}

/// Per-run mapping from material number to its warehouse split.
#[derive(Debug, Default)]
pub struct StockLocationIndex {
    entries: HashMap<String, LocationStock>,
    pub warnings: LocationWarnings,
    file_present: bool,
}

impl StockLocationIndex {
    /// Resolve one product's warehouse split. A material absent from the
    /// feed falls back to the product table's stock as domestic; a split
    /// that disagrees with the product table is counted.
    pub fn resolve(&mut self, matnr: &str, product_stock: i64) -> LocationStock {
        match self.entries.get(matnr) {
            Some(&split) => {
                if split.stock_it + split.stock_eu != product_stock {
                    self.warnings.split_disagreement += 1;
                }
                split
            }
            None => {
                if self.file_present {
                    self.warnings.missing_row += 1;
                }
                LocationStock {
                    stock_it: product_stock,
                    stock_eu: 0,
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Load the run's stock-location feed. A missing file or unreadable header
/// degrades to an empty index (every product falls back to domestic stock)
/// with the corresponding warning set.
pub async fn load_stock_location_index(
    store: &dyn ObjectStore,
    run_id: &str,
) -> WorkerResult<StockLocationIndex> {
    let mut index = StockLocationIndex::default();
    let path = layout::stock_location_path(run_id);
    let Some(bytes) = store.try_download(layout::IMPORT_BUCKET, &path).await? else {
        warn!(run_id, path = %path, "stock-location feed missing");
        index.warnings.missing_file = 1;
        return Ok(index);
    };
    index.file_present = true;

    let (text, lossy) = decode_utf8_with_fallback(strip_bom(&bytes));
    if lossy {
        warn!(run_id, "stock-location feed decoded lossily");
        index.warnings.decode_fallback_used = 1;
    }
    let text = normalize_line_endings(&text);
    let mut lines = text.split('\n');
    let Some(header) = lines.next().filter(|l| !l.is_empty()) else {
        index.warnings.parse_failure = 1;
        return Ok(index);
    };
    let resolved = match resolve_header(header, STOCK_LOCATION_COLUMNS, "stock-location") {
        Ok(resolved) => resolved,
        Err(err) => {
            warn!(run_id, error = %err, "stock-location header unusable");
            index.warnings.parse_failure = 1;
            return Ok(index);
        }
    };
    let col_matnr = resolved.required_column("matnr");
    let col_stock = resolved.required_column("stock");
    let col_location = resolved.required_column("locationid");

    let mut saw_secondary: HashSet<String> = HashSet::new();
    let mut saw_eu: HashSet<String> = HashSet::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let cells: Vec<&str> = line.split(resolved.delimiter).collect();
        let matnr = cells.get(col_matnr).map_or("", |c| c.trim());
        if matnr.is_empty() {
            index.warnings.parse_failure += 1;
            continue;
        }
        let qty = match cells.get(col_stock).map_or("", |c| c.trim()).parse::<i64>() {
            Ok(v) if v >= 0 => v,
            _ => {
                index.warnings.invalid_stock_value += 1;
                0
            }
        };
        let entry = index.entries.entry(matnr.to_string()).or_default();
        match cells.get(col_location).map_or("", |c| c.trim()) {
            LOCATION_IT => entry.stock_it += qty,
            LOCATION_EU => {
                entry.stock_eu += qty;
                saw_eu.insert(matnr.to_string());
            }
            LOCATION_EU_SECONDARY => {
                saw_secondary.insert(matnr.to_string());
            }
            _ => {}
        }
    }

    index.warnings.orphan_secondary_eu = saw_secondary
        .iter()
        .filter(|m| !saw_eu.contains(*m))
        .count() as u32;
    Ok(index)
}

/// Collapse duplicate material rows of the product table. The same material
/// carrying different manufacturer parts is a structural anomaly worth
/// counting; the first occurrence wins either way.
pub fn dedup_products(rows: Vec<ProductRow>, warnings: &mut LocationWarnings) -> Vec<ProductRow> {
    let mut seen: HashMap<String, String> = HashMap::new();
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        match seen.get(&row.matnr) {
            None => {
                seen.insert(row.matnr.clone(), row.mpn.clone());
                out.push(row);
            }
            Some(first_mpn) => {
                if first_mpn != &row.mpn {
                    warnings.multi_mpn += 1;
                }
            }
        }
    }
    out
}
