//! Public HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};

use crate::accounting::Accountant;
use crate::cache::Cache;
use crate::error::GatewayError;
use crate::limiter::{DEFAULT_CONCURRENCY, DEFAULT_QPS, Limiter};
use crate::metrics::MetricsSink;
use crate::router::Router;
use crate::store::Store;
use crate::types::{ErrorDetail, ErrorResponse};

mod chat;
mod embeddings;

const EMBEDDINGS_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub cache: Arc<dyn Cache>,
    pub metrics: Arc<dyn MetricsSink>,
    pub router: Arc<Router>,
    pub limiter: Arc<Limiter>,
    pub accountant: Arc<Accountant>,
    pub(crate) embeddings_http: reqwest::Client,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn Cache>,
        metrics: Arc<dyn MetricsSink>,
        enable_real_calls: bool,
    ) -> Self {
        let router = Arc::new(Router::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            enable_real_calls,
        ));
        let limiter = Arc::new(Limiter::new(
            Arc::clone(&cache),
            DEFAULT_QPS,
            DEFAULT_CONCURRENCY,
        ));
        let accountant = Arc::new(Accountant::new(Arc::clone(&store), Arc::clone(&metrics)));
        let embeddings_http = reqwest::Client::builder()
            .timeout(EMBEDDINGS_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            store,
            cache,
            metrics,
            router,
            limiter,
            accountant,
            embeddings_http,
        }
    }

    /// Overrides the per-tenant admission budgets.
    pub fn with_limits(mut self, qps: u32, concurrency: u32) -> Self {
        self.limiter = Arc::new(Limiter::new(Arc::clone(&self.cache), qps, concurrency));
        self
    }
}

pub fn router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/embeddings", post(embeddings::embeddings))
        .with_state(state)
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse {
            error: ErrorDetail {
                message: self.to_string(),
                kind: self.kind().to_string(),
                code: self.code().to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn metrics(State(state): State<AppState>) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(value) = "text/plain; version=0.0.4".parse() {
        headers.insert("content-type", value);
    }
    (StatusCode::OK, headers, state.metrics.render()).into_response()
}

async fn list_models(State(state): State<AppState>) -> Result<Json<serde_json::Value>, GatewayError> {
    let entries = state
        .store
        .list_catalog()
        .await
        .map_err(|err| GatewayError::Internal(err.to_string()))?;
    let data: Vec<serde_json::Value> = entries
        .into_iter()
        .map(|entry| {
            serde_json::json!({
                "id": entry.model,
                "object": "model",
                "created": 1_700_000_000,
                "owned_by": entry.family.as_str(),
            })
        })
        .collect();
    Ok(Json(serde_json::json!({"object": "list", "data": data})))
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
}
