//! Storage path layout.
//!
//! Two buckets: the read-only import bucket holding supplier feeds, and the
//! read-write exports bucket holding run-scoped pipeline artifacts, pinned
//! templates, and finished exports. Every mutable artifact is namespaced by
//! run id; only `templates/` is shared, and it is read-only.

/// Read-only bucket with supplier feeds.
pub const IMPORT_BUCKET: &str = "ftp-import";
/// Read-write bucket with pipeline artifacts and finished exports.
pub const EXPORTS_BUCKET: &str = "exports";

/// Feed folders inside the import bucket.
pub const MATERIAL_PREFIX: &str = "material";
pub const STOCK_PREFIX: &str = "stock";
pub const PRICE_PREFIX: &str = "price";
pub const EAN_MAPPING_PREFIX: &str = "ean-mapping";

/// Shared, read-only template folder inside the exports bucket.
pub const TEMPLATES_PREFIX: &str = "templates";

pub fn pipeline_root(run_id: &str) -> String {
    format!("_pipeline/{run_id}")
}

pub fn stock_index_path(run_id: &str) -> String {
    format!("_pipeline/{run_id}/stock_index.json")
}

pub fn price_index_path(run_id: &str) -> String {
    format!("_pipeline/{run_id}/price_index.json")
}

pub fn material_meta_path(run_id: &str) -> String {
    format!("_pipeline/{run_id}/material_meta.json")
}

pub fn chunk_path(run_id: &str, index: u32) -> String {
    format!("_pipeline/{run_id}/parse_merge_chunks/{index}.tsv")
}

pub fn finalize_partial_path(run_id: &str) -> String {
    format!("_pipeline/{run_id}/parse_merge_chunks/finalize_partial.tsv")
}

pub fn products_path(run_id: &str) -> String {
    format!("_pipeline/{run_id}/products.tsv")
}

/// Numbered material parts written in chunk-file fallback mode.
pub fn material_part_path(run_id: &str, index: u32) -> String {
    format!("_pipeline/{run_id}/material_parts/{index}.bin")
}

pub fn pricing_path(run_id: &str) -> String {
    format!("_pipeline/{run_id}/pricing.tsv")
}

/// Marketplace stock split feed, one file per run.
pub fn stock_location_path(run_id: &str) -> String {
    format!("stock-location/runs/{run_id}.txt")
}

/// Product override list maintained next to the finished exports.
pub const OVERRIDES_PATH: &str = "overrides/products.csv";

/// Run-scoped copy of a finished export.
pub fn run_export_path(run_id: &str, file_name: &str) -> String {
    format!("runs/{run_id}/{file_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifacts_are_namespaced_by_run() {
        assert_eq!(stock_index_path("r9"), "_pipeline/r9/stock_index.json");
        assert_eq!(chunk_path("r9", 3), "_pipeline/r9/parse_merge_chunks/3.tsv");
        assert_eq!(material_part_path("r9", 0), "_pipeline/r9/material_parts/0.bin");
        assert_eq!(run_export_path("r9", "mediaworld.xlsx"), "runs/r9/mediaworld.xlsx");
    }
}
