//! EAN catalog exports.
//!
//! Two renditions of the same data: a plain TSV for internal consumers and
//! the templated workbook for partners. Products without an EAN are skipped
//! in both.

use tracing::info;

use crate::config::round_cents;
use crate::context::StepContext;
use crate::error::WorkerResult;
use crate::exports::stock_location::LocationWarnings;
use crate::exports::template::EAN_CATALOG_TEMPLATE;
use crate::exports::xlsx::CellValue;
use crate::exports::{
    load_products, merge_export_metrics, render_template_export, upload_export,
    TSV_CONTENT_TYPE, XLSX_CONTENT_TYPE,
};
use crate::models::{sanitize_field, StepStatus};

const TSV_HEADER: &str = "EAN\tMatnr\tMPN\tDesc\tStock\tPrice";

pub async fn run_export_ean(ctx: &StepContext) -> WorkerResult<StepStatus> {
    let products = load_products(ctx.store(), &ctx.run_id).await?;
    let mut out = String::with_capacity(64 + products.len() * 64);
    out.push_str(TSV_HEADER);
    out.push('\n');
    let mut exported = 0usize;
    let mut skipped_no_ean = 0usize;
    for product in &products {
        if product.ean.trim().is_empty() {
            skipped_no_ean += 1;
            continue;
        }
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\t{}\n",
            sanitize_field(&product.ean),
            sanitize_field(&product.matnr),
            sanitize_field(&product.mpn),
            sanitize_field(&product.description),
            product.stock,
            round_cents(product.price_base()),
        ));
        exported += 1;
    }

    upload_export(ctx, "ean_catalog.tsv", out.into_bytes(), TSV_CONTENT_TYPE).await?;
    merge_export_metrics(ctx, "ean", exported, &LocationWarnings::default()).await?;
    info!(run_id = %ctx.run_id, exported, skipped_no_ean, "EAN catalog TSV exported");
    Ok(StepStatus::Completed)
}

pub async fn run_export_ean_xlsx(ctx: &StepContext) -> WorkerResult<StepStatus> {
    let products = load_products(ctx.store(), &ctx.run_id).await?;
    let rows: Vec<Vec<CellValue>> = products
        .iter()
        .filter(|p| !p.ean.trim().is_empty())
        .map(|p| {
            vec![
                CellValue::Text(p.ean.trim().to_string()),
                CellValue::Text(p.matnr.clone()),
                CellValue::Text(p.mpn.clone()),
                CellValue::Text(p.description.clone()),
                CellValue::Int(p.stock),
                CellValue::Number(round_cents(p.price_base())),
            ]
        })
        .collect();

    let bytes = render_template_export(ctx.store(), &EAN_CATALOG_TEMPLATE, &rows).await?;
    upload_export(ctx, "ean_catalog.xlsx", bytes, XLSX_CONTENT_TYPE).await?;
    merge_export_metrics(ctx, "eanXlsx", rows.len(), &LocationWarnings::default()).await?;
    info!(run_id = %ctx.run_id, exported = rows.len(), "EAN catalog workbook exported");
    Ok(StepStatus::Completed)
}
