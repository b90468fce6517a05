//! MediaWorld export.
//!
//! Offer sheet in the marketplace's pinned 22-column template: two header
//! rows, data from row 3, `ReferenceData` and `Columns` sheets protected.

use tracing::info;

use crate::config::Marketplace;
use crate::context::StepContext;
use crate::error::WorkerResult;
use crate::exports::template::MEDIAWORLD_TEMPLATE;
use crate::exports::xlsx::CellValue;
use crate::exports::{
    merge_export_metrics, prepare_marketplace_rows, render_template_export, upload_export,
    MarketplaceRow, XLSX_CONTENT_TYPE,
};
use crate::models::StepStatus;

/// Offer state code for new items.
const STATE_NEW: &str = "11";

pub async fn run_export_mediaworld(ctx: &StepContext) -> WorkerResult<StepStatus> {
    let fees = ctx.fees.resolve(Marketplace::Mediaworld)?;
    let (rows, warnings) = prepare_marketplace_rows(ctx, &fees).await?;

    let cells: Vec<Vec<CellValue>> = rows.iter().map(offer_row).collect();
    let bytes = render_template_export(ctx.store(), &MEDIAWORLD_TEMPLATE, &cells).await?;
    upload_export(ctx, "mediaworld.xlsx", bytes, XLSX_CONTENT_TYPE).await?;
    merge_export_metrics(ctx, "mediaworld", rows.len(), &warnings).await?;
    info!(run_id = %ctx.run_id, exported = rows.len(), "MediaWorld export finished");
    Ok(StepStatus::Completed)
}

fn offer_row(row: &MarketplaceRow) -> Vec<CellValue> {
    let empty = || CellValue::Text(String::new());
    vec![
        CellValue::Text(row.product.matnr.clone()),        // offer sku
        CellValue::Text(row.product.ean.trim().to_string()), // product id
        CellValue::Text("EAN".to_string()),                // product id type
        CellValue::Text(row.product.description.clone()),  // description
        CellValue::Text(row.product.mpn.clone()),          // internal reference
        CellValue::Number(row.price),                      // price
        empty(),                                           // price additional info
        CellValue::Int(row.quantity),                      // quantity
        empty(),                                           // min quantity alert
        CellValue::Text(STATE_NEW.to_string()),            // state
        empty(),                                           // available start date
        empty(),                                           // available end date
        empty(),                                           // logistic class
        empty(),                                           // favourite rank
        empty(),                                           // discount price
        empty(),                                           // discount start date
        empty(),                                           // discount end date
        CellValue::Int(row.lead_days as i64),              // leadtime to ship
        empty(),                                           // update-delete flag
        empty(),                                           // eco contribution
        CellValue::Text(row.source.as_str().to_string()),  // warehouse
        empty(),                                           // notes
    ]
}
