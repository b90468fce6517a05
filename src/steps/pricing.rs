//! Pricing step.
//!
//! Validates the fee configuration and materializes the default selling
//! price per product. The marketplace exports compute their own prices with
//! their override-aware fee views; this table is the reference output the
//! back office reconciles against.

use serde_json::json;
use tracing::info;

use crate::config::{selling_price, round_cents};
use crate::context::StepContext;
use crate::error::{WorkerError, WorkerResult};
use crate::exports::load_products;
use crate::models::{fmt_price, sanitize_field, StepStatus};
use crate::storage::layout;

const TSV_HEADER: &str = "Matnr\tBase\tSelling";

pub async fn run(ctx: &StepContext) -> WorkerResult<StepStatus> {
    let fees = ctx.fees.resolve_default()?;
    let products = load_products(ctx.store(), &ctx.run_id).await?;

    let mut out = String::with_capacity(64 + products.len() * 32);
    out.push_str(TSV_HEADER);
    out.push('\n');
    for product in &products {
        let base = round_cents(product.price_base());
        let selling = selling_price(product.price_base(), &fees);
        if !selling.is_finite() || selling <= 0.0 {
            return Err(WorkerError::PricingConfigInvalid {
                summary: format!("non-positive selling price for material {}", product.matnr),
            });
        }
        out.push_str(&format!(
            "{}\t{}\t{}\n",
            sanitize_field(&product.matnr),
            fmt_price(base),
            fmt_price(selling),
        ));
    }

    ctx.store()
        .upload(
            layout::EXPORTS_BUCKET,
            &layout::pricing_path(&ctx.run_id),
            out.into_bytes(),
            "text/tab-separated-values",
        )
        .await?;
    ctx.checkpoints
        .merge_metrics(&ctx.run_id, json!({ "pricedProducts": products.len() }))
        .await?;
    info!(run_id = %ctx.run_id, products = products.len(), "pricing table written");
    Ok(StepStatus::Completed)
}
