//! The chat completions handler: admission gate, routing, the SSE bridge,
//! and settlement.

use std::convert::Infallible;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes as ByteChunk;
use futures_util::stream;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::accounting::RequestRecord;
use crate::error::GatewayError;
use crate::limiter::ConcurrencyGuard;
use crate::providers::StreamSender;
use crate::router::{RouteOptions, RouteOutcome};
use crate::store::Tenant;
use crate::types::ChatRequest;
use crate::util::prompt_fingerprint;

use super::{AppState, bearer_token};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub(super) async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match handle(state, headers, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle(
    state: AppState,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    // Admission, fail-fast and in order: authenticate, suspension, QPS,
    // concurrency, balance, model allow-list.
    let token = bearer_token(&headers).ok_or(GatewayError::AuthMissing)?;
    let tenant = state
        .store
        .tenant_by_api_key(token)
        .await
        .map_err(|_| GatewayError::AuthInvalid)?
        .ok_or(GatewayError::AuthInvalid)?;

    if tenant.suspended {
        return Err(GatewayError::TenantSuspended);
    }

    if !state.limiter.allow_qps(&tenant).await.unwrap_or(false) {
        return Err(GatewayError::RateLimited);
    }

    let guard = state
        .limiter
        .acquire(&tenant.id)
        .await
        .unwrap_or(None)
        .ok_or(GatewayError::ConcurrencyExceeded)?;

    // The guard now owns the concurrency slot; every return path below
    // releases it, explicitly or on drop.
    let mut request: ChatRequest = serde_json::from_slice(&body)
        .map_err(|err| GatewayError::InvalidRequest(format!("invalid json: {err}")))?;
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "messages must not be empty".to_string(),
        ));
    }

    if tenant.balance_usd <= 0.0 {
        return Err(GatewayError::InsufficientBalance);
    }
    if let Some(limit) = tenant.spend_limit_usd {
        if limit > 0.0 && tenant.total_spent_usd >= limit {
            return Err(GatewayError::SpendLimitExceeded);
        }
    }

    if !request.model.is_empty() {
        if let Ok(Some(api_key)) = state.store.api_key(token).await {
            if !api_key.allowed_models.is_empty()
                && !api_key.allowed_models.contains(&request.model)
            {
                return Err(GatewayError::ModelNotAllowed(request.model.clone()));
            }
        }
    }

    let options = RouteOptions::from_headers(&headers);
    if request.user.is_none() {
        request.user = options.user.clone();
    }
    let request_id = crate::util::request_id();
    let prompt_hash = prompt_fingerprint(&request);
    tracing::info!(
        request_id = %request_id,
        tenant_id = %tenant.id,
        model = %request.model,
        stream = request.stream,
        title = options.title.as_deref().unwrap_or(""),
        "chat request admitted"
    );

    let start = Instant::now();
    if request.stream {
        return Ok(stream_response(
            state,
            tenant,
            request,
            options,
            prompt_hash,
            request_id,
            guard,
            start,
        ));
    }

    let result = state
        .router
        .route(&tenant.id, &mut request, false, None, &options)
        .await;
    let latency = start.elapsed();
    let cost = settle(
        &state,
        &tenant,
        &request.model,
        &prompt_hash,
        &result,
        latency,
    )
    .await;
    guard.release().await;

    let outcome = result?;
    tracing::info!(
        request_id = %request_id,
        tenant_id = %tenant.id,
        provider = %outcome.provider_name,
        model = %request.model,
        latency_ms = latency.as_millis() as u64,
        tokens = outcome.tokens,
        prompt_hash = %prompt_hash,
        fallback = outcome.fallback_used,
        "request completed"
    );

    let mut response = axum::Json(&outcome.response).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = outcome.provider_name.parse() {
        headers.insert("x-provider", value);
    }
    if let Ok(value) = latency.as_millis().to_string().parse() {
        headers.insert("x-latency-ms", value);
    }
    if let Ok(value) = cost.to_string().parse() {
        headers.insert("x-cost-usd", value);
    }
    if let Ok(value) = outcome.fallback_used.to_string().parse() {
        headers.insert("x-fallback", value);
    }
    Ok(response)
}

/// Commits the response as an SSE stream and runs routing in a spawned task
/// so settlement happens even when the client goes away mid-stream.
#[allow(clippy::too_many_arguments)]
fn stream_response(
    state: AppState,
    tenant: Tenant,
    request: ChatRequest,
    options: RouteOptions,
    prompt_hash: String,
    request_id: String,
    guard: ConcurrencyGuard,
    start: Instant,
) -> Response {
    let (sender, rx) = StreamSender::channel();

    tokio::spawn(async move {
        let mut request = request;
        let result = state
            .router
            .route(&tenant.id, &mut request, true, Some(&sender), &options)
            .await;
        // Closing the channel ends the client stream.
        drop(sender);
        let latency = start.elapsed();
        if let Err(err) = &result {
            tracing::warn!(
                request_id = %request_id,
                tenant_id = %tenant.id,
                kind = err.kind(),
                "stream ended with error"
            );
        }
        settle(
            &state,
            &tenant,
            &request.model,
            &prompt_hash,
            &result,
            latency,
        )
        .await;
        guard.release().await;
    });

    let mut response = Response::new(sse_body(rx));
    let headers = response.headers_mut();
    if let Ok(value) = "text/event-stream".parse() {
        headers.insert("content-type", value);
    }
    if let Ok(value) = "no-cache".parse() {
        headers.insert("cache-control", value);
    }
    if let Ok(value) = "keep-alive".parse() {
        headers.insert("connection", value);
    }
    response
}

/// Body stream that forwards frames as they arrive and emits an SSE comment
/// while idle so proxies keep the connection open.
fn sse_body(rx: UnboundedReceiver<ByteChunk>) -> Body {
    let stream = stream::unfold(rx, |mut rx| async move {
        match tokio::time::timeout(KEEPALIVE_INTERVAL, rx.recv()).await {
            Ok(Some(chunk)) => Some((Ok::<_, Infallible>(chunk), rx)),
            Ok(None) => None,
            Err(_) => Some((Ok(ByteChunk::from_static(b": keepalive\n\n")), rx)),
        }
    });
    Body::from_stream(stream)
}

async fn settle(
    state: &AppState,
    tenant: &Tenant,
    model: &str,
    prompt_hash: &str,
    result: &Result<RouteOutcome, GatewayError>,
    latency: Duration,
) -> f64 {
    let record = match result {
        Ok(outcome) => RequestRecord {
            tenant_id: tenant.id.clone(),
            provider: outcome.provider_name.clone(),
            model: model.to_string(),
            latency,
            ttft: outcome.ttft,
            tokens: outcome.tokens,
            prompt_hash: prompt_hash.to_string(),
            fallback_used: outcome.fallback_used,
            status_code: 200,
            error_code: None,
        },
        Err(err) => RequestRecord {
            tenant_id: tenant.id.clone(),
            provider: String::new(),
            model: model.to_string(),
            latency,
            ttft: Duration::ZERO,
            tokens: 0,
            prompt_hash: prompt_hash.to_string(),
            fallback_used: false,
            status_code: err.status(),
            error_code: Some(err.kind()),
        },
    };
    state.accountant.settle(record).await
}
