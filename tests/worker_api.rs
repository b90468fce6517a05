//! Worker endpoint behavior over real HTTP.
//!
//! The server runs on an ephemeral port with the in-memory backends; the
//! orchestrator side is played by a plain reqwest client.

mod common;

use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use common::{seed_small_feed_set, TestHarness};
use feedbridge_backend::api::{routes, AppState};
use feedbridge_backend::checkpoint::Lease;
use serde_json::{json, Value};

async fn spawn_server(harness: &TestHarness) -> SocketAddr {
    let state = AppState {
        store: harness.store.clone(),
        checkpoints: harness.checkpoints.clone(),
        soft_budget: std::time::Duration::from_secs(8),
    };
    let app = Router::new()
        .route("/worker", post(routes::invoke_worker))
        .route("/health", get(routes::health))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test(flavor = "multi_thread")]
async fn health_endpoint_answers() {
    let harness = TestHarness::new();
    let addr = spawn_server(&harness).await;
    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_requests_return_400() {
    let harness = TestHarness::new();
    let addr = spawn_server(&harness).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/worker");

    // Not JSON at all.
    let resp = client
        .post(&url)
        .header("content-type", "application/json")
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    // Missing run id.
    let resp = client
        .post(&url)
        .json(&json!({ "run_id": "", "step": "parse_merge" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    // Unknown step name.
    let resp = client
        .post(&url)
        .json(&json!({ "run_id": "r1", "step": "transmogrify" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "error");
    assert!(body["error"].as_str().unwrap().contains("transmogrify"));
}

#[tokio::test(flavor = "multi_thread")]
async fn parse_merge_drives_to_completion_over_http() {
    let harness = TestHarness::new();
    seed_small_feed_set(&harness);
    let addr = spawn_server(&harness).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/worker");

    let mut last_status = String::new();
    for _ in 0..16 {
        let resp = client
            .post(&url)
            .json(&json!({
                "run_id": "run-http",
                "step": "parse_merge",
                "lock_invocation_id": "inv-1",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        last_status = body["step_status"].as_str().unwrap().to_string();
        if last_status == "completed" {
            break;
        }
    }
    assert_eq!(last_status, "completed");
    assert!(harness.products_tsv("run-http").is_some());
    assert_eq!(harness.backend.current_step("run-http").as_deref(), Some("parse_merge"));
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_lease_returns_409() {
    let harness = TestHarness::new();
    seed_small_feed_set(&harness);
    let addr = spawn_server(&harness).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/worker");

    // First invocation establishes the checkpoint under lease inv-1.
    let resp = client
        .post(&url)
        .json(&json!({
            "run_id": "run-lease",
            "step": "parse_merge",
            "lock_invocation_id": "inv-1",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    // The orchestrator hands the run to a newer invocation.
    harness.backend.reassign_lease("run-lease", Lease::new("inv-2"));

    let resp = client
        .post(&url)
        .json(&json!({
            "run_id": "run-lease",
            "step": "parse_merge",
            "lock_invocation_id": "inv-1",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "lock_lost");
}

#[tokio::test(flavor = "multi_thread")]
async fn fatal_error_returns_500_with_categorical_code() {
    let harness = TestHarness::new();
    seed_small_feed_set(&harness);
    harness
        .store
        .set_forced_content_range(Some("bytes 100-200/10000".to_string()));
    let addr = spawn_server(&harness).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/worker");

    let mut final_body = Value::Null;
    for _ in 0..8 {
        let resp = client
            .post(&url)
            .json(&json!({ "run_id": "run-fatal", "step": "parse_merge" }))
            .send()
            .await
            .unwrap();
        if resp.status().as_u16() == 500 {
            final_body = resp.json().await.unwrap();
            break;
        }
    }
    assert_eq!(final_body["status"], "error");
    assert_eq!(final_body["step_status"], "failed");
    assert_eq!(final_body["error"], "content_range_mismatch");
    assert_eq!(harness.checkpoint_json("run-fatal")["phase"], "failed");
}

#[tokio::test(flavor = "multi_thread")]
async fn pricing_step_rejects_missing_fees_with_400_level_config_error() {
    let harness = TestHarness::new();
    harness.store.put(
        feedbridge_backend::storage::layout::EXPORTS_BUCKET,
        &feedbridge_backend::storage::layout::products_path("run-cfg"),
        "Matnr\tMPN\tEAN\tDesc\tStock\tLP\tCBP\tSur\nM1\tP\tE\tD\t5\t10\t0\t0\n",
    );
    let addr = spawn_server(&harness).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/worker"))
        .json(&json!({ "run_id": "run-cfg", "step": "pricing", "fee_config": {} }))
        .send()
        .await
        .unwrap();
    // Invalid pricing config is fatal for the step, not a malformed request.
    assert_eq!(resp.status().as_u16(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "pricing_config_invalid");
}
