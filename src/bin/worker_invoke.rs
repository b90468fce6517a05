//! Operational CLI: invoke a pipeline step against a running worker.
//!
//! Posts `(run_id, step)` and, with `--follow`, keeps re-invoking until the
//! step leaves `in_progress`/`finalizing` — a stand-in for the orchestrator
//! during local runs and incident debugging.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "worker-invoke", about = "Invoke a feedbridge pipeline step")]
struct Args {
    /// Worker base URL
    #[arg(long, env = "WORKER_URL", default_value = "http://127.0.0.1:8080")]
    url: String,

    /// Run identifier
    #[arg(long)]
    run_id: String,

    /// Step name (e.g. parse_merge, export_mediaworld)
    #[arg(long)]
    step: String,

    /// JSON file with the fee configuration to ship in each request
    #[arg(long)]
    fee_config: Option<PathBuf>,

    /// Keep re-invoking until the step completes or fails
    #[arg(long)]
    follow: bool,

    /// Delay between re-invocations in milliseconds
    #[arg(long, default_value_t = 500)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let fee_config: Value = match &args.fee_config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str(&text).context("fee config is not valid JSON")?
        }
        None => json!({}),
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()?;
    let endpoint = format!("{}/worker", args.url.trim_end_matches('/'));
    let lease = Uuid::new_v4().to_string();

    let mut invocation = 0u32;
    loop {
        invocation += 1;
        let resp = client
            .post(&endpoint)
            .json(&json!({
                "run_id": args.run_id,
                "step": args.step,
                "fee_config": fee_config,
                "lock_invocation_id": lease,
            }))
            .send()
            .await
            .context("worker request failed")?;
        let status = resp.status();
        let body: Value = resp.json().await.context("worker response unreadable")?;
        let step_status = body["step_status"].as_str().unwrap_or("unknown");
        println!("#{invocation}: http {status} step_status={step_status}");

        if status.as_u16() == 409 {
            bail!("lease rejected: another invocation holds run {}", args.run_id);
        }
        if !status.is_success() {
            bail!(
                "step failed: {}",
                body["error"].as_str().unwrap_or("unknown error")
            );
        }
        if !args.follow || matches!(step_status, "completed" | "failed") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
    }
    Ok(())
}
