//! End-to-end pipeline tests in dummy mode: admission, the canned provider
//! path, streaming framing, and billing side effects.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use routerx::cache::MemoryCache;
use routerx::http::AppState;
use routerx::metrics::PrometheusMetrics;
use routerx::store::{
    ApiKey, MemoryStore, ProviderFamily, ProviderInstance, RequestLogFilters, Store, Tenant,
    TransactionKind,
};
use routerx::types::{ChatResponse, ErrorResponse};
use serde_json::json;
use tower::util::ServiceExt;

struct Harness {
    store: Arc<MemoryStore>,
    app: axum::Router,
}

async fn harness() -> Harness {
    harness_with_limits(100, 5).await
}

async fn harness_with_limits(qps: u32, concurrency: u32) -> Harness {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_tenant(Tenant::new("t1", "Tenant One", 10.0))
        .await
        .unwrap();
    store
        .upsert_api_key(ApiKey {
            key: "k1".to_string(),
            tenant_id: "t1".to_string(),
            name: "default".to_string(),
            allowed_models: Vec::new(),
            created_at_ms: 0,
        })
        .await
        .unwrap();
    store
        .upsert_provider(ProviderInstance {
            id: "oa-1".to_string(),
            name: "oa-1".to_string(),
            family: ProviderFamily::OpenAi,
            base_url: None,
            api_key: None,
            default_model: None,
            supports_text: true,
            supports_vision: false,
            enabled: true,
        })
        .await
        .unwrap();
    store
        .upsert_catalog_entry("gpt-4o-mini", ProviderFamily::OpenAi)
        .await
        .unwrap();
    store
        .upsert_model_price("gpt-4o-mini", 0.0015)
        .await
        .unwrap();

    let state = AppState::new(
        store.clone(),
        Arc::new(MemoryCache::new()),
        Arc::new(PrometheusMetrics::new()),
        false,
    )
    .with_limits(qps, concurrency);
    Harness {
        store,
        app: routerx::http::router(state),
    }
}

fn chat_request(key: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {key}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn error_kind(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: ErrorResponse = serde_json::from_slice(&bytes).unwrap();
    parsed.error.kind
}

async fn wait_for_settlement(store: &MemoryStore, expected_logs: u64) {
    for _ in 0..100 {
        let logs = store
            .list_request_logs(1, 100, RequestLogFilters::default())
            .await
            .unwrap();
        if logs.total >= expected_logs {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("settlement did not land in time");
}

#[tokio::test]
async fn basic_success_bills_exactly_once() {
    let harness = harness().await;
    let body = json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}]});
    let response = harness
        .app
        .clone()
        .oneshot(chat_request("k1", body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-provider")
            .and_then(|v| v.to_str().ok()),
        Some("oa-1")
    );
    assert_eq!(
        response
            .headers()
            .get("x-fallback")
            .and_then(|v| v.to_str().ok()),
        Some("false")
    );

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: ChatResponse = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(parsed.usage.total_tokens, 25);
    assert_eq!(
        parsed.choices[0].message.content.as_deref(),
        Some("Dummy response from oa-1. Model=gpt-4o-mini. Messages=1.")
    );

    // Cost = 0.0015 * 25 / 1000.
    let tenant = harness.store.tenant("t1").await.unwrap().unwrap();
    assert!((tenant.balance_usd - 9.9999625).abs() < 1e-9);
    assert!(tenant.last_active_ms.is_some());

    let transactions = harness.store.list_transactions("t1", 10).await.unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].kind, TransactionKind::Charge);
    assert!((transactions[0].balance_after_usd - 9.9999625).abs() < 1e-9);

    let logs = harness
        .store
        .list_request_logs(1, 10, RequestLogFilters::default())
        .await
        .unwrap();
    assert_eq!(logs.total, 1);
    assert_eq!(logs.items[0].provider, "oa-1");
    assert_eq!(logs.items[0].tokens, 25);
    assert_eq!(logs.items[0].status_code, 200);
    assert!(!logs.items[0].fallback_used);
    assert_eq!(logs.items[0].prompt_hash.len(), 64);

    let usage = harness.store.usage_rows();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].tokens, 25);
}

#[tokio::test]
async fn streaming_body_matches_the_dummy_frames_exactly() {
    let harness = harness().await;
    let body = json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": true
    });
    let response = harness
        .app
        .clone()
        .oneshot(chat_request("k1", body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    assert_eq!(
        response
            .headers()
            .get("cache-control")
            .and_then(|v| v.to_str().ok()),
        Some("no-cache")
    );

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    assert_eq!(
        body,
        concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"This is a dummy \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"streamed response \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"from RouterX.\"}}]}\n\n",
            "data: [DONE]\n\n",
        )
    );

    // Settlement runs after the stream closes; the charge still lands.
    wait_for_settlement(&harness.store, 1).await;
    let transactions = harness.store.list_transactions("t1", 10).await.unwrap();
    assert_eq!(transactions.len(), 1);
    let tenant = harness.store.tenant("t1").await.unwrap().unwrap();
    assert!((tenant.balance_usd - 9.9999625).abs() < 1e-9);
}

#[tokio::test]
async fn client_disconnect_mid_stream_logs_cancellation_and_skips_billing() {
    let harness = harness().await;
    let body = json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": true
    });
    let response = harness
        .app
        .clone()
        .oneshot(chat_request("k1", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    // Dropping the response body is the client going away; the next send
    // into the bridge fails and the route ends as cancelled.
    drop(response);

    wait_for_settlement(&harness.store, 1).await;
    let logs = harness
        .store
        .list_request_logs(1, 10, RequestLogFilters::default())
        .await
        .unwrap();
    assert_eq!(logs.items[0].error_code, "client_cancelled");
    assert_eq!(logs.items[0].status_code, 499);
    assert!(harness.store.list_transactions("t1", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn balance_may_go_negative_once_then_blocks() {
    let harness = harness().await;
    let mut tenant = harness.store.tenant("t1").await.unwrap().unwrap();
    tenant.balance_usd = 0.00001;
    harness.store.upsert_tenant(tenant).await.unwrap();

    let body = json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}]});
    let first = harness
        .app
        .clone()
        .oneshot(chat_request("k1", body.clone()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let tenant = harness.store.tenant("t1").await.unwrap().unwrap();
    assert!(tenant.balance_usd < 0.0);

    let second = harness
        .app
        .clone()
        .oneshot(chat_request("k1", body))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::PAYMENT_REQUIRED);
    assert_eq!(error_kind(second).await, "insufficient_balance");
}

#[tokio::test]
async fn admission_rejections_carry_distinct_kinds() {
    let harness = harness().await;
    let body = json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}]});

    // Missing bearer.
    let missing = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = harness.app.clone().oneshot(missing).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_kind(response).await, "auth_missing");

    // Unknown key.
    let response = harness
        .app
        .clone()
        .oneshot(chat_request("nope", body.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_kind(response).await, "auth_invalid");

    // Suspended tenant.
    harness
        .store
        .set_tenant_suspended("t1", true)
        .await
        .unwrap();
    let response = harness
        .app
        .clone()
        .oneshot(chat_request("k1", body.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_kind(response).await, "tenant_suspended");
    harness
        .store
        .set_tenant_suspended("t1", false)
        .await
        .unwrap();

    // Bad JSON.
    let bad = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer k1")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = harness.app.clone().oneshot(bad).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_kind(response).await, "invalid_request");

    // Empty messages list.
    let response = harness
        .app
        .clone()
        .oneshot(chat_request(
            "k1",
            json!({"model": "gpt-4o-mini", "messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_kind(response).await, "invalid_request");
}

#[tokio::test]
async fn api_key_allow_list_blocks_other_models() {
    let harness = harness().await;
    harness
        .store
        .upsert_api_key(ApiKey {
            key: "scoped".to_string(),
            tenant_id: "t1".to_string(),
            name: "scoped".to_string(),
            allowed_models: vec!["gpt-4o".to_string()],
            created_at_ms: 0,
        })
        .await
        .unwrap();

    let body = json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}]});
    let response = harness
        .app
        .clone()
        .oneshot(chat_request("scoped", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_kind(response).await, "model_not_allowed");
    // Nothing reached routing, so nothing was billed or logged.
    assert!(harness.store.list_transactions("t1", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn qps_budget_rejects_with_rate_limited() {
    let harness = harness_with_limits(1, 5).await;
    let body = json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}]});
    let mut saw_rate_limited = false;
    for _ in 0..5 {
        let response = harness
            .app
            .clone()
            .oneshot(chat_request("k1", body.clone()))
            .await
            .unwrap();
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            assert_eq!(error_kind(response).await, "rate_limited");
            saw_rate_limited = true;
            break;
        }
    }
    assert!(saw_rate_limited);
}

#[tokio::test]
async fn unroutable_model_returns_502_no_candidates() {
    let harness = harness().await;
    let body = json!({"model": "unknown-model", "messages": [{"role": "user", "content": "hi"}]});
    let response = harness
        .app
        .clone()
        .oneshot(chat_request("k1", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(error_kind(response).await, "no_candidates");

    // Failures are logged with the error category and zero cost.
    let logs = harness
        .store
        .list_request_logs(1, 10, RequestLogFilters::default())
        .await
        .unwrap();
    assert_eq!(logs.total, 1);
    assert_eq!(logs.items[0].error_code, "no_candidates");
    assert_eq!(logs.items[0].cost_usd, 0.0);
    assert!(harness.store.list_transactions("t1", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn models_health_and_metrics_endpoints_respond() {
    let harness = harness().await;

    let health = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = harness.app.clone().oneshot(health).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&bytes).unwrap(),
        json!({"status": "ok"})
    );

    let models = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .body(Body::empty())
        .unwrap();
    let response = harness.app.clone().oneshot(models).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(parsed["object"], json!("list"));
    assert_eq!(parsed["data"][0]["id"], json!("gpt-4o-mini"));
    assert_eq!(parsed["data"][0]["owned_by"], json!("openai"));
    assert_eq!(parsed["data"][0]["created"], json!(1_700_000_000));

    // Drive one request so the counter has a series.
    let body = json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}]});
    harness
        .app
        .clone()
        .oneshot(chat_request("k1", body))
        .await
        .unwrap();

    let metrics = Request::builder()
        .method("GET")
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let response = harness.app.clone().oneshot(metrics).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("routerx_requests_total{provider=\"oa-1\",status=\"200\"} 1"));
    assert!(text.contains("routerx_latency_ms_bucket"));
    assert!(text.contains("routerx_ttft_ms_count"));
}

#[tokio::test]
async fn empty_model_resolves_through_routing_rule_default() {
    let harness = harness().await;
    harness
        .store
        .upsert_routing_rule(routerx::store::RoutingRule {
            id: "r1".to_string(),
            tenant_id: "t1".to_string(),
            capability: routerx::types::Capability::Text,
            primary_provider_id: "oa-1".to_string(),
            secondary_provider_id: None,
            model: "gpt-4o-mini".to_string(),
        })
        .await
        .unwrap();

    let body = json!({"messages": [{"role": "user", "content": "hi"}]});
    let response = harness
        .app
        .clone()
        .oneshot(chat_request("k1", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: ChatResponse = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(parsed.model, "gpt-4o-mini");
}
