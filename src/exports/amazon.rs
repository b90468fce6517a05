//! Amazon export.
//!
//! Amazon ingests a flat tab-separated listing file, so no template is
//! pinned: header plus one row per exportable product, using the Amazon fee
//! and prep-day parameters and the shared stock resolution.

use tracing::info;

use crate::config::Marketplace;
use crate::context::StepContext;
use crate::error::WorkerResult;
use crate::exports::{merge_export_metrics, prepare_marketplace_rows, upload_export, TSV_CONTENT_TYPE};
use crate::models::{sanitize_field, StepStatus};

const TSV_HEADER: &str = "sku\tean\tquantity\tlead_days\tprice";

pub async fn run_export_amazon(ctx: &StepContext) -> WorkerResult<StepStatus> {
    let fees = ctx.fees.resolve(Marketplace::Amazon)?;
    let (rows, warnings) = prepare_marketplace_rows(ctx, &fees).await?;

    let mut out = String::with_capacity(64 + rows.len() * 48);
    out.push_str(TSV_HEADER);
    out.push('\n');
    for row in &rows {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{:.2}\n",
            sanitize_field(&row.product.matnr),
            sanitize_field(row.product.ean.trim()),
            row.quantity,
            row.lead_days,
            row.price,
        ));
    }

    upload_export(ctx, "amazon.tsv", out.into_bytes(), TSV_CONTENT_TYPE).await?;
    merge_export_metrics(ctx, "amazon", rows.len(), &warnings).await?;
    info!(run_id = %ctx.run_id, exported = rows.len(), "Amazon export finished");
    Ok(StepStatus::Completed)
}
