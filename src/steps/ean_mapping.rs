//! EAN mapping step.
//!
//! Supplier material rows frequently arrive without a barcode; a separate
//! mapping feed (`mpn → ean`) fills the gaps. The product table is rewritten
//! in place; products whose MPN is not mapped stay as they are.

use std::collections::HashMap;

use serde_json::json;
use tracing::{info, warn};

use crate::context::StepContext;
use crate::error::WorkerResult;
use crate::exports::load_products;
use crate::models::{write_product_table, StepStatus};
use crate::parse_merge::header::{
    decode_utf8_with_fallback, normalize_line_endings, resolve_header, strip_bom,
    EAN_MAPPING_COLUMNS,
};
use crate::storage::{layout, newest_under};

pub async fn run(ctx: &StepContext) -> WorkerResult<StepStatus> {
    let Some(path) =
        newest_under(ctx.store(), layout::IMPORT_BUCKET, layout::EAN_MAPPING_PREFIX).await?
    else {
        // No mapping feed delivered: a legitimate no-op.
        warn!(run_id = %ctx.run_id, "no EAN mapping feed found, skipping");
        ctx.checkpoints
            .merge_metrics(&ctx.run_id, json!({ "eanMapped": 0, "eanUnmatched": 0 }))
            .await?;
        return Ok(StepStatus::Completed);
    };

    let bytes = ctx.store().download(layout::IMPORT_BUCKET, &path).await?;
    let (text, _) = decode_utf8_with_fallback(strip_bom(&bytes));
    let text = normalize_line_endings(&text);
    let mut lines = text.split('\n');
    let header = lines.next().unwrap_or_default();
    let resolved = resolve_header(header, EAN_MAPPING_COLUMNS, "ean-mapping")?;
    let col_mpn = resolved.required_column("mpn");
    let col_ean = resolved.required_column("ean");

    let mut mapping: HashMap<String, String> = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let cells: Vec<&str> = line.split(resolved.delimiter).collect();
        let mpn = cells.get(col_mpn).map_or("", |c| c.trim());
        let ean = cells.get(col_ean).map_or("", |c| c.trim());
        if !mpn.is_empty() && !ean.is_empty() {
            mapping.insert(mpn.to_string(), ean.to_string());
        }
    }

    let mut products = load_products(ctx.store(), &ctx.run_id).await?;
    let mut mapped = 0usize;
    let mut unmatched = 0usize;
    for product in &mut products {
        if !product.ean.trim().is_empty() {
            continue;
        }
        match mapping.get(product.mpn.trim()) {
            Some(ean) => {
                product.ean = ean.clone();
                mapped += 1;
            }
            None => unmatched += 1,
        }
    }

    ctx.store()
        .upload(
            layout::EXPORTS_BUCKET,
            &layout::products_path(&ctx.run_id),
            write_product_table(&products).into_bytes(),
            "text/tab-separated-values",
        )
        .await?;
    ctx.checkpoints
        .merge_metrics(
            &ctx.run_id,
            json!({ "eanMapped": mapped, "eanUnmatched": unmatched }),
        )
        .await?;
    info!(run_id = %ctx.run_id, mapped, unmatched, source = %path, "EAN mapping applied");
    Ok(StepStatus::Completed)
}
