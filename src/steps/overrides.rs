//! Product override step.
//!
//! The back office maintains a small override list next to the finished
//! exports (`overrides/products.csv`, semicolon rows `matnr;field;value`).
//! Overrides patch the product table in place; unknown materials and
//! unknown fields are counted, never fatal. A missing override file is a
//! no-op.

use std::collections::HashMap;

use serde_json::json;
use tracing::{info, warn};

use crate::context::StepContext;
use crate::error::WorkerResult;
use crate::exports::load_products;
use crate::models::{write_product_table, StepStatus};
use crate::parse_merge::header::{decode_utf8_with_fallback, normalize_line_endings, strip_bom};
use crate::storage::layout;

pub async fn run(ctx: &StepContext) -> WorkerResult<StepStatus> {
    let Some(bytes) = ctx
        .store()
        .try_download(layout::EXPORTS_BUCKET, layout::OVERRIDES_PATH)
        .await?
    else {
        info!(run_id = %ctx.run_id, "no override file, nothing to apply");
        ctx.checkpoints
            .merge_metrics(&ctx.run_id, json!({ "overridesApplied": 0 }))
            .await?;
        return Ok(StepStatus::Completed);
    };

    let (text, _) = decode_utf8_with_fallback(strip_bom(&bytes));
    let text = normalize_line_endings(&text);

    let mut products = load_products(ctx.store(), &ctx.run_id).await?;
    let by_matnr: HashMap<String, usize> = products
        .iter()
        .enumerate()
        .map(|(index, p)| (p.matnr.clone(), index))
        .collect();

    let mut applied = 0usize;
    let mut unknown_material = 0usize;
    let mut unknown_field = 0usize;
    for line in text.split('\n') {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut cells = line.splitn(3, ';');
        let (Some(matnr), Some(field), Some(value)) = (cells.next(), cells.next(), cells.next())
        else {
            warn!(run_id = %ctx.run_id, line, "override row malformed");
            continue;
        };
        let Some(&index) = by_matnr.get(matnr.trim()) else {
            unknown_material += 1;
            continue;
        };
        let product = &mut products[index];
        match field.trim().to_lowercase().as_str() {
            "stock" => {
                if let Ok(stock) = value.trim().parse::<i64>() {
                    product.stock = stock.max(0);
                    applied += 1;
                }
            }
            "ean" => {
                product.ean = value.trim().to_string();
                applied += 1;
            }
            "description" => {
                product.description = value.trim().to_string();
                applied += 1;
            }
            _ => unknown_field += 1,
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
            json!({
                "overridesApplied": applied,
                "overridesUnknownMaterial": unknown_material,
                "overridesUnknownField": unknown_field,
            }),
        )
        .await?;
    info!(run_id = %ctx.run_id, applied, unknown_material, unknown_field, "overrides applied");
    Ok(StepStatus::Completed)
}
