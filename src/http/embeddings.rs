//! Transparent embeddings passthrough. The raw body is forwarded to the
//! model's OpenAI-family provider; non-OpenAI families never qualify.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::error::GatewayError;
use crate::store::ProviderFamily;

use super::{AppState, bearer_token};

#[derive(Debug, Deserialize)]
struct EmbeddingsProbe {
    #[serde(default)]
    model: String,
}

pub(super) async fn embeddings(
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
    if tenant.balance_usd <= 0.0 {
        return Err(GatewayError::InsufficientBalance);
    }

    let probe: EmbeddingsProbe = serde_json::from_slice(&body)
        .map_err(|err| GatewayError::InvalidRequest(format!("invalid json: {err}")))?;

    let family = state
        .store
        .catalog_family(&probe.model)
        .await
        .ok()
        .flatten()
        .filter(ProviderFamily::is_openai_compatible)
        .unwrap_or(ProviderFamily::OpenAi);

    let providers = state
        .store
        .enabled_providers_by_family(family)
        .await
        .unwrap_or_default();
    if providers.is_empty() {
        return Err(GatewayError::NoCandidates(
            "no provider available for embeddings".to_string(),
        ));
    }

    let mut last_error: Option<String> = None;
    for provider in providers {
        let Some(api_key) = provider.api_key.as_deref().filter(|key| !key.is_empty()) else {
            continue;
        };
        let base = provider
            .base_url
            .as_deref()
            .filter(|base| !base.is_empty())
            .map(|base| base.trim_end_matches('/').to_string())
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let url = format!("{base}/v1/embeddings");

        let upstream = match state
            .embeddings_http
            .post(url)
            .header("content-type", "application/json")
            .bearer_auth(api_key)
            .body(body.clone())
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                last_error = Some(err.to_string());
                continue;
            }
        };

        if upstream.status().as_u16() >= 300 {
            last_error = Some(upstream.text().await.unwrap_or_default());
            continue;
        }

        let payload = upstream
            .bytes()
            .await
            .map_err(|err| GatewayError::Upstream(err.to_string()))?;
        let mut response = Response::new(axum::body::Body::from(payload));
        if let Ok(value) = "application/json".parse() {
            response.headers_mut().insert("content-type", value);
        }
        return Ok(response);
    }

    match last_error {
        Some(detail) => Err(GatewayError::Upstream(format!("embeddings failed: {detail}"))),
        None => Err(GatewayError::NoCandidates(
            "no provider with API key for embeddings".to_string(),
        )),
    }
}
