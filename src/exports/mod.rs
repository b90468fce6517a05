//! Marketplace export engine.
//!
//! Renders templated spreadsheets from the merged product table. Every
//! template export follows the same protocol: verify the pinned digest,
//! snapshot the header region, rebuild the data region, then prove at ZIP
//! level that nothing outside the data region moved.

pub mod amazon;
pub mod ean;
pub mod eprice;
pub mod mediaworld;
pub mod stock_location;
pub mod stock_resolution;
pub mod template;
pub mod validate;
pub mod xlsx;

use serde_json::json;
use tracing::{error, info};

use crate::config::{selling_price, ExportFees};
use crate::context::StepContext;
use crate::error::{WorkerError, WorkerResult};
use crate::models::{read_product_table, ProductRow};
use crate::storage::{layout, ObjectStore};

use stock_location::{dedup_products, load_stock_location_index, LocationWarnings};
use stock_resolution::{resolve_stock, verify_golden_cases, StockSource};
use template::{load_template, TemplateSpec};
use validate::{validate_export, verify_package_integrity};
use xlsx::{CellValue, PreparedCell, XlsxPackage};

/// One product resolved for a marketplace export.
#[derive(Debug, Clone)]
pub struct MarketplaceRow {
    pub product: ProductRow,
    pub quantity: i64,
    pub lead_days: u32,
    pub price: f64,
    pub source: StockSource,
}

/// Load the canonical product table produced by `parse_merge`.
pub async fn load_products(store: &dyn ObjectStore, run_id: &str) -> WorkerResult<Vec<ProductRow>> {
    let bytes = store
        .download(layout::EXPORTS_BUCKET, &layout::products_path(run_id))
        .await?;
    read_product_table(&bytes)
}

/// Re-check the stock-resolution golden table. A mismatch is a regression
/// in a pure function: logged loudly, shipped as a diagnostic event, never
/// fatal.
pub async fn run_golden_check(ctx: &StepContext) {
    if let Err(mismatch) = verify_golden_cases() {
        error!(run_id = %ctx.run_id, mismatch = %mismatch, "stock resolution golden case failed");
        let _ = ctx
            .checkpoints
            .log_event(
                &ctx.run_id,
                "error",
                "stock resolution golden case failed",
                json!({ "mismatch": mismatch }),
            )
            .await;
    }
}

/// Join the product table against the run's stock-location split and
/// resolve quantity, lead time, and price for one marketplace.
pub async fn prepare_marketplace_rows(
    ctx: &StepContext,
    fees: &ExportFees,
) -> WorkerResult<(Vec<MarketplaceRow>, LocationWarnings)> {
    run_golden_check(ctx).await;

    let products = load_products(ctx.store(), &ctx.run_id).await?;
    let mut warnings = LocationWarnings::default();
    let products = dedup_products(products, &mut warnings);
    let mut locations = load_stock_location_index(ctx.store(), &ctx.run_id).await?;

    let mut rows = Vec::with_capacity(products.len());
    for product in products {
        let split = locations.resolve(&product.matnr, product.stock);
        let resolution = resolve_stock(
            split.stock_it,
            split.stock_eu,
            fees.include_eu,
            fees.it_prep_days,
            fees.eu_prep_days,
        );
        if !resolution.should_export {
            continue;
        }
        let price = selling_price(product.price_base(), fees);
        rows.push(MarketplaceRow {
            product,
            quantity: resolution.export_qty,
            lead_days: resolution.lead_days,
            price,
            source: resolution.source,
        });
    }

    let mut combined = locations.warnings;
    combined.multi_mpn += warnings.multi_mpn;
    Ok((rows, combined))
}

/// Execute the template write protocol and return the serialized workbook.
///
/// `rows` holds one `CellValue` per template column per product; empty text
/// cells are simply not written.
pub async fn render_template_export(
    store: &dyn ObjectStore,
    spec: &TemplateSpec,
    rows: &[Vec<CellValue>],
) -> WorkerResult<Vec<u8>> {
    let template_bytes = load_template(store, spec).await?;
    let template = XlsxPackage::open(&template_bytes)?;

    for sheet in spec.required_sheets {
        template.sheet_part_path(sheet)?;
    }

    // Header snapshot: the invariant the final workbook must preserve.
    let parse_limit = spec
        .parse_row_limit
        .unwrap_or(spec.first_data_row)
        .max(spec.header_rows);
    let header_sheet = template.read_sheet(spec.data_sheet, Some(parse_limit))?;
    let header_snapshot = header_sheet.value_matrix(spec.header_rows, spec.total_columns());

    let styles = harvest_column_styles(&template, spec)?;
    let prepared: Vec<Vec<PreparedCell>> = rows
        .iter()
        .map(|cells| {
            cells
                .iter()
                .enumerate()
                .map(|(index, value)| PreparedCell {
                    column: index as u32 + 1,
                    value: value.clone(),
                    style: styles[index],
                })
                .collect()
        })
        .collect();

    let mut output = XlsxPackage::open(&template_bytes)?;
    output.replace_sheet_data(
        spec.data_sheet,
        spec.header_rows,
        spec.first_data_row,
        &prepared,
        spec.total_columns(),
    )?;

    // Re-read the header region and compare cell for cell.
    let written_headers = output
        .read_sheet(spec.data_sheet, Some(spec.header_rows))?
        .value_matrix(spec.header_rows, spec.total_columns());
    if written_headers != header_snapshot {
        return Err(WorkerError::HeadersModified {
            detail: format!("{} header region changed during write", spec.name),
        });
    }

    let serialized = output.to_bytes()?;
    let reopened = XlsxPackage::open(&serialized)?;
    verify_package_integrity(&template, &reopened, spec)?;
    validate_export(
        &template,
        &reopened,
        spec,
        &header_snapshot,
        rows.len() as u32,
    )?;
    Ok(serialized)
}

/// Style index per column: the template's own sample data row wins; a style
/// carrying the wanted number format is the fallback for templates without
/// sample rows.
fn harvest_column_styles(
    template: &XlsxPackage,
    spec: &TemplateSpec,
) -> WorkerResult<Vec<Option<u32>>> {
    let sheet = template.read_sheet(spec.data_sheet, Some(spec.first_data_row))?;
    let styles = template.styles()?;
    Ok(spec
        .columns
        .iter()
        .enumerate()
        .map(|(index, kind)| {
            let col = index as u32 + 1;
            sheet
                .cell(col, spec.first_data_row)
                .and_then(|cell| cell.style)
                .or_else(|| styles.find_format(kind.format_code()))
        })
        .collect())
}

/// Upload a finished export twice: the run-scoped copy and the flat
/// latest-wins name at the bucket root.
pub async fn upload_export(
    ctx: &StepContext,
    file_name: &str,
    bytes: Vec<u8>,
    content_type: &str,
) -> WorkerResult<()> {
    ctx.store()
        .upload(
            layout::EXPORTS_BUCKET,
            &layout::run_export_path(&ctx.run_id, file_name),
            bytes.clone(),
            content_type,
        )
        .await?;
    ctx.store()
        .upload(layout::EXPORTS_BUCKET, file_name, bytes, content_type)
        .await?;
    info!(run_id = %ctx.run_id, file_name, "export uploaded");
    Ok(())
}

/// Record an export's outcome in the run metrics.
pub async fn merge_export_metrics(
    ctx: &StepContext,
    export: &str,
    exported: usize,
    warnings: &LocationWarnings,
) -> WorkerResult<()> {
    // Keys are flat because the metrics merge is shallow; a nested map
    // would let the second export stomp the first one's warnings.
    let mut patch = serde_json::Map::new();
    patch.insert(format!("{export}Exported"), json!(exported));
    patch.insert(format!("{export}Warnings"), json!(warnings));
    ctx.checkpoints
        .merge_metrics(&ctx.run_id, patch.into())
        .await
}

pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const TSV_CONTENT_TYPE: &str = "text/tab-separated-values";
