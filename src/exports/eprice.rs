//! ePrice export.
//!
//! Offer sheet in the marketplace's pinned template: one header row, data
//! from row 2, instructions sheet protected.

use tracing::info;

use crate::config::Marketplace;
use crate::context::StepContext;
use crate::error::WorkerResult;
use crate::exports::template::EPRICE_TEMPLATE;
use crate::exports::xlsx::CellValue;
use crate::exports::{
    merge_export_metrics, prepare_marketplace_rows, render_template_export, upload_export,
    MarketplaceRow, XLSX_CONTENT_TYPE,
};
use crate::models::StepStatus;

const CONDITION_NEW: &str = "NEW";

pub async fn run_export_eprice(ctx: &StepContext) -> WorkerResult<StepStatus> {
    let fees = ctx.fees.resolve(Marketplace::Eprice)?;
    let (rows, warnings) = prepare_marketplace_rows(ctx, &fees).await?;

    let cells: Vec<Vec<CellValue>> = rows.iter().map(offer_row).collect();
    let bytes = render_template_export(ctx.store(), &EPRICE_TEMPLATE, &cells).await?;
    upload_export(ctx, "eprice.xlsx", bytes, XLSX_CONTENT_TYPE).await?;
    merge_export_metrics(ctx, "eprice", rows.len(), &warnings).await?;
    info!(run_id = %ctx.run_id, exported = rows.len(), "ePrice export finished");
    Ok(StepStatus::Completed)
}

fn offer_row(row: &MarketplaceRow) -> Vec<CellValue> {
    let empty = || CellValue::Text(String::new());
    vec![
        CellValue::Text(row.product.matnr.clone()),
        CellValue::Text(row.product.ean.trim().to_string()),
        CellValue::Text(row.product.description.clone()),
        CellValue::Text(row.product.mpn.clone()),
        CellValue::Number(row.price),
        CellValue::Int(row.quantity),
        CellValue::Int(row.lead_days as i64),
        CellValue::Text(CONDITION_NEW.to_string()),
        empty(),
        empty(),
    ]
}
