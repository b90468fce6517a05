//! Worker invocation endpoint.
//!
//! One POST endpoint driven by the orchestrator: `(run_id, step)` in, a
//! step status out. The step set is a closed enum so adding a pipeline step
//! is a compile-time obligation, not a stringly-typed switch.

use axum::extract::rejection::JsonRejection;
use axum::extract::State as AxumState;
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::api::AppState;
use crate::checkpoint::Lease;
use crate::config::FeeConfig;
use crate::context::StepContext;
use crate::error::{WorkerError, WorkerResult};
use crate::models::{InvocationBudget, StepStatus};
use crate::{exports, parse_merge, steps};

/// The closed set of pipeline steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    ParseMerge,
    EanMapping,
    Pricing,
    OverrideProducts,
    ExportEan,
    ExportEanXlsx,
    ExportMediaworld,
    ExportEprice,
    ExportAmazon,
    ComputeTemplateChecksums,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::ParseMerge => "parse_merge",
            Step::EanMapping => "ean_mapping",
            Step::Pricing => "pricing",
            Step::OverrideProducts => "override_products",
            Step::ExportEan => "export_ean",
            Step::ExportEanXlsx => "export_ean_xlsx",
            Step::ExportMediaworld => "export_mediaworld",
            Step::ExportEprice => "export_eprice",
            Step::ExportAmazon => "export_amazon",
            Step::ComputeTemplateChecksums => "compute_template_checksums",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(name.to_string())).ok()
    }
}

#[derive(Debug, Deserialize)]
pub struct WorkerRequest {
    pub run_id: String,
    pub step: String,
    #[serde(default)]
    pub fee_config: FeeConfig,
    #[serde(default)]
    pub lock_invocation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WorkerResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerResponse {
    fn ok(status: StepStatus) -> Self {
        Self {
            status: "ok",
            step_status: Some(status.as_str()),
            error: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: "error",
            step_status: None,
            error: Some(message.into()),
        }
    }
}

/// `POST /worker`
pub async fn invoke_worker(
    AxumState(state): AxumState<AppState>,
    request: Result<Json<WorkerRequest>, JsonRejection>,
) -> (StatusCode, Json<WorkerResponse>) {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(WorkerResponse::bad_request(format!(
                    "malformed request: {rejection}"
                ))),
            );
        }
    };
    if request.run_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(WorkerResponse::bad_request("run_id is required")),
        );
    }
    let Some(step) = Step::parse(&request.step) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(WorkerResponse::bad_request(format!(
                "unknown step {:?}",
                request.step
            ))),
        );
    };

    let lease = request
        .lock_invocation_id
        .as_deref()
        .map(Lease::new)
        .unwrap_or_else(Lease::generate);
    let ctx = StepContext {
        run_id: request.run_id.clone(),
        lease,
        store: state.store.clone(),
        checkpoints: state.checkpoints.clone(),
        budget: InvocationBudget::new(state.soft_budget),
        fees: request.fee_config,
    };

    info!(run_id = %ctx.run_id, step = step.as_str(), "step invocation");
    match run_step(&ctx, step).await {
        Ok(status) => (StatusCode::OK, Json(WorkerResponse::ok(status))),
        Err(WorkerError::LockLost) => (
            StatusCode::CONFLICT,
            Json(WorkerResponse {
                status: "error",
                step_status: None,
                error: Some("lock_lost".to_string()),
            }),
        ),
        Err(err) => {
            error!(run_id = %ctx.run_id, step = step.as_str(), error = %err, "step failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(WorkerResponse {
                    status: "error",
                    step_status: Some(StepStatus::Failed.as_str()),
                    error: Some(err.code().to_string()),
                }),
            )
        }
    }
}

/// Dispatch one step invocation, recording the failed state (with its
/// diagnostic event) before a fatal error is surfaced.
pub async fn run_step(ctx: &StepContext, step: Step) -> WorkerResult<StepStatus> {
    ctx.checkpoints
        .set_step_in_progress(&ctx.run_id, step.as_str())
        .await?;

    let result = match step {
        Step::ParseMerge => parse_merge::run(ctx).await,
        Step::EanMapping => steps::ean_mapping::run(ctx).await,
        Step::Pricing => steps::pricing::run(ctx).await,
        Step::OverrideProducts => steps::overrides::run(ctx).await,
        Step::ExportEan => exports::ean::run_export_ean(ctx).await,
        Step::ExportEanXlsx => exports::ean::run_export_ean_xlsx(ctx).await,
        Step::ExportMediaworld => exports::mediaworld::run_export_mediaworld(ctx).await,
        Step::ExportEprice => exports::eprice::run_export_eprice(ctx).await,
        Step::ExportAmazon => exports::amazon::run_export_amazon(ctx).await,
        Step::ComputeTemplateChecksums => steps::checksums::run(ctx).await,
    };

    match result {
        Ok(status) => Ok(status),
        Err(WorkerError::LockLost) => Err(WorkerError::LockLost),
        Err(err) => {
            ctx.checkpoints
                .fail_step(
                    &ctx.run_id,
                    step.as_str(),
                    &err,
                    json!({ "step": step.as_str(), "error": err.to_string() }),
                    &ctx.lease,
                )
                .await?;
            Err(err)
        }
    }
}

/// `GET /health`
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
