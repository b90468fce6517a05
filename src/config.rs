//! Worker configuration.
//!
//! Two layers: service wiring read once from the environment, and the
//! per-invocation fee configuration the orchestrator ships in the request
//! body. Fee fields are validated at the boundary; anything missing,
//! non-finite, or negative where a positive value is required fails the
//! invocation with `pricing_config_invalid` and a safe summary of the
//! offending fields (values are never echoed back).

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{WorkerError, WorkerResult};

/// Service wiring resolved from the environment at startup.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub storage_url: String,
    pub storage_service_key: String,
    pub checkpoint_rpc_url: String,
    pub checkpoint_service_key: String,
    pub soft_budget: Duration,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("WORKER_BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .context("WORKER_BIND_ADDR is not a valid socket address")?;
        let storage_url = env::var("STORAGE_URL").context("STORAGE_URL is required")?;
        let storage_service_key =
            env::var("STORAGE_SERVICE_KEY").context("STORAGE_SERVICE_KEY is required")?;
        let checkpoint_rpc_url =
            env::var("CHECKPOINT_RPC_URL").context("CHECKPOINT_RPC_URL is required")?;
        let checkpoint_service_key = env::var("CHECKPOINT_SERVICE_KEY")
            .unwrap_or_else(|_| storage_service_key.clone());
        let soft_budget_ms = env::var("WORKER_SOFT_BUDGET_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(8_000);

        Ok(Self {
            bind_addr,
            storage_url,
            storage_service_key,
            checkpoint_rpc_url,
            checkpoint_service_key,
            soft_budget: Duration::from_millis(soft_budget_ms),
        })
    }
}

/// Fee and export parameters supplied per invocation.
///
/// Field names mirror the orchestrator's JSON keys (`feeDrev`,
/// `mediaworldIncludeEu`, ...). Everything is optional at the boundary;
/// required fields are enforced when an export resolves its view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeeConfig {
    pub fee_drev: Option<f64>,
    pub fee_mkt: Option<f64>,
    pub shipping_cost: Option<f64>,

    pub mediaworld_include_eu: Option<bool>,
    pub mediaworld_it_prep_days: Option<u32>,
    pub mediaworld_eu_prep_days: Option<u32>,
    pub mediaworld_fee_drev: Option<f64>,
    pub mediaworld_fee_mkt: Option<f64>,
    pub mediaworld_shipping_cost: Option<f64>,

    pub eprice_include_eu: Option<bool>,
    pub eprice_it_prep_days: Option<u32>,
    pub eprice_eu_prep_days: Option<u32>,
    pub eprice_fee_drev: Option<f64>,
    pub eprice_fee_mkt: Option<f64>,
    pub eprice_shipping_cost: Option<f64>,

    pub amazon_fee_drev: Option<f64>,
    pub amazon_fee_mkt: Option<f64>,
    pub amazon_shipping_cost: Option<f64>,
    pub amazon_it_prep_days: Option<u32>,
    pub amazon_eu_prep_days: Option<u32>,
}

/// The marketplaces with their own fee/prep-day parameter sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marketplace {
    Mediaworld,
    Eprice,
    Amazon,
}

impl Marketplace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Marketplace::Mediaworld => "mediaworld",
            Marketplace::Eprice => "eprice",
            Marketplace::Amazon => "amazon",
        }
    }
}

/// Fully resolved fee view for one export.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExportFees {
    pub fee_drev: f64,
    pub fee_mkt: f64,
    pub shipping_cost: f64,
    pub include_eu: bool,
    pub it_prep_days: u32,
    pub eu_prep_days: u32,
}

impl FeeConfig {
    /// Resolve the global fee set used by the `pricing` step.
    pub fn resolve_default(&self) -> WorkerResult<ExportFees> {
        let mut check = FieldCheck::default();
        let fee_drev = check.fee("feeDrev", self.fee_drev);
        let fee_mkt = check.fee("feeMkt", self.fee_mkt);
        let shipping_cost = check.shipping("shippingCost", self.shipping_cost);
        check.finish()?;
        Ok(ExportFees {
            fee_drev,
            fee_mkt,
            shipping_cost,
            include_eu: false,
            it_prep_days: 1,
            eu_prep_days: 1,
        })
    }

    /// Resolve one marketplace's fee view. Per-export overrides of
    /// `feeDrev`/`feeMkt`/`shippingCost` take precedence over the globals.
    pub fn resolve(&self, marketplace: Marketplace) -> WorkerResult<ExportFees> {
        let mut check = FieldCheck::default();
        let fees = match marketplace {
            Marketplace::Mediaworld => {
                let fee_drev =
                    check.fee("mediaworldFeeDrev", self.mediaworld_fee_drev.or(self.fee_drev));
                let fee_mkt =
                    check.fee("mediaworldFeeMkt", self.mediaworld_fee_mkt.or(self.fee_mkt));
                let shipping_cost = check.shipping(
                    "mediaworldShippingCost",
                    self.mediaworld_shipping_cost.or(self.shipping_cost),
                );
                let include_eu = self.mediaworld_include_eu.unwrap_or(false);
                let it_prep_days =
                    check.prep_days("mediaworldItPrepDays", self.mediaworld_it_prep_days);
                let eu_prep_days = if include_eu {
                    check.prep_days("mediaworldEuPrepDays", self.mediaworld_eu_prep_days)
                } else {
                    self.mediaworld_eu_prep_days.unwrap_or(0)
                };
                ExportFees {
                    fee_drev,
                    fee_mkt,
                    shipping_cost,
                    include_eu,
                    it_prep_days,
                    eu_prep_days,
                }
            }
            Marketplace::Eprice => {
                let fee_drev = check.fee("epriceFeeDrev", self.eprice_fee_drev.or(self.fee_drev));
                let fee_mkt = check.fee("epriceFeeMkt", self.eprice_fee_mkt.or(self.fee_mkt));
                let shipping_cost = check.shipping(
                    "epriceShippingCost",
                    self.eprice_shipping_cost.or(self.shipping_cost),
                );
                let include_eu = self.eprice_include_eu.unwrap_or(false);
                let it_prep_days = check.prep_days("epriceItPrepDays", self.eprice_it_prep_days);
                let eu_prep_days = if include_eu {
                    check.prep_days("epriceEuPrepDays", self.eprice_eu_prep_days)
                } else {
                    self.eprice_eu_prep_days.unwrap_or(0)
                };
                ExportFees {
                    fee_drev,
                    fee_mkt,
                    shipping_cost,
                    include_eu,
                    it_prep_days,
                    eu_prep_days,
                }
            }
            Marketplace::Amazon => {
                let fee_drev = check.fee("amazonFeeDrev", self.amazon_fee_drev.or(self.fee_drev));
                let fee_mkt = check.fee("amazonFeeMkt", self.amazon_fee_mkt.or(self.fee_mkt));
                let shipping_cost = check.shipping(
                    "amazonShippingCost",
                    self.amazon_shipping_cost.or(self.shipping_cost),
                );
                let it_prep_days = check.prep_days("amazonItPrepDays", self.amazon_it_prep_days);
                // Amazon always sells from the domestic warehouse.
                let eu_prep_days = self.amazon_eu_prep_days.unwrap_or(0);
                ExportFees {
                    fee_drev,
                    fee_mkt,
                    shipping_cost,
                    include_eu: false,
                    it_prep_days,
                    eu_prep_days,
                }
            }
        };
        check.finish()?;
        Ok(fees)
    }
}

/// Selling price: supplier base plus shipping, marked up by the reseller
/// and marketplace fee fractions, rounded half-up to cents.
pub fn selling_price(base: f64, fees: &ExportFees) -> f64 {
    round_cents((base + fees.shipping_cost) * (1.0 + fees.fee_drev) * (1.0 + fees.fee_mkt))
}

pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Accumulates offending field names so the error reports all of them at
/// once instead of one per invocation.
#[derive(Default)]
struct FieldCheck {
    bad: Vec<String>,
}

impl FieldCheck {
    /// Fee fractions: required, finite, non-negative.
    fn fee(&mut self, name: &str, value: Option<f64>) -> f64 {
        match value {
            Some(v) if v.is_finite() && v >= 0.0 => v,
            Some(_) => {
                self.bad.push(format!("{name} (invalid)"));
                0.0
            }
            None => {
                self.bad.push(format!("{name} (missing)"));
                0.0
            }
        }
    }

    /// Shipping cost: optional, defaults to zero, must be finite and
    /// non-negative when supplied.
    fn shipping(&mut self, name: &str, value: Option<f64>) -> f64 {
        match value {
            Some(v) if v.is_finite() && v >= 0.0 => v,
            Some(_) => {
                self.bad.push(format!("{name} (invalid)"));
                0.0
            }
            None => 0.0,
        }
    }

    /// Prep days: required and strictly positive.
    fn prep_days(&mut self, name: &str, value: Option<u32>) -> u32 {
        match value {
            Some(v) if v > 0 => v,
            Some(_) => {
                self.bad.push(format!("{name} (invalid)"));
                0
            }
            None => {
                self.bad.push(format!("{name} (missing)"));
                0
            }
        }
    }

    fn finish(self) -> WorkerResult<()> {
        if self.bad.is_empty() {
            Ok(())
        } else {
            Err(WorkerError::PricingConfigInvalid {
                summary: self.bad.join(", "),
            })
        }
    }
}
