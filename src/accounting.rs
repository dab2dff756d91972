//! Per-request settlement: metrics, request log, and billing.
//!
//! The three concerns are independent failure domains. A store outage must
//! not hide the request from metrics, and a failed usage roll-up must not
//! block the balance debit; each step logs and moves on.

use std::sync::Arc;
use std::time::Duration;

use crate::metrics::MetricsSink;
use crate::store::{RequestLog, Store, Transaction, TransactionKind};
use crate::util::{day_key, now_epoch_millis, now_epoch_secs};

pub const FALLBACK_PRICE_USD_PER_1K: f64 = 0.002;

/// Built-in USD-per-1K prices consulted when the store has no row for the
/// model. Kept deliberately small; the store is the authoritative table.
pub fn static_price_usd_per_1k(model: &str) -> Option<f64> {
    let price = match model {
        "gpt-4o" => 0.005,
        "gpt-4o-mini" => 0.0015,
        "gpt-4.1" => 0.008,
        "gpt-4.1-mini" => 0.002,
        "gpt-3.5-turbo" => 0.001,
        "claude-3-5-sonnet" => 0.006,
        "claude-3-5-haiku" => 0.001,
        "claude-3-opus" => 0.015,
        "gemini-1.5-pro" => 0.0035,
        "gemini-1.5-flash" => 0.001,
        "gemini-1.0-pro" => 0.001,
        _ => return None,
    };
    Some(price)
}

pub fn fallback_price_usd_per_1k(model: &str) -> f64 {
    static_price_usd_per_1k(model).unwrap_or(FALLBACK_PRICE_USD_PER_1K)
}

/// Everything the accountant needs about one finished request.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub tenant_id: String,
    pub provider: String,
    pub model: String,
    pub latency: Duration,
    pub ttft: Duration,
    pub tokens: u32,
    pub prompt_hash: String,
    pub fallback_used: bool,
    pub status_code: u16,
    pub error_code: Option<&'static str>,
}

pub struct Accountant {
    store: Arc<dyn Store>,
    metrics: Arc<dyn MetricsSink>,
}

impl Accountant {
    pub fn new(store: Arc<dyn Store>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { store, metrics }
    }

    /// Runs on every request exit, success or failure. Returns the cost
    /// charged (zero on failure or free requests).
    pub async fn settle(&self, record: RequestRecord) -> f64 {
        self.metrics
            .record_request(&record.provider, record.status_code);
        self.metrics
            .observe_latency_ms(&record.provider, record.latency.as_millis() as f64);
        self.metrics
            .observe_ttft_ms(&record.provider, record.ttft.as_millis() as f64);

        let success = record.status_code == 200 && record.error_code.is_none();
        let cost = if success && record.tokens > 0 {
            self.cost_usd(&record.model, record.tokens).await
        } else {
            0.0
        };

        let now_ms = now_epoch_millis();
        if let Err(err) = self
            .store
            .insert_request_log(RequestLog {
                id: 0,
                tenant_id: record.tenant_id.clone(),
                provider: record.provider.clone(),
                model: record.model.clone(),
                latency_ms: record.latency.as_millis() as i64,
                ttft_ms: record.ttft.as_millis() as i64,
                tokens: record.tokens,
                cost_usd: cost,
                prompt_hash: record.prompt_hash.clone(),
                fallback_used: record.fallback_used,
                status_code: record.status_code,
                error_code: record.error_code.unwrap_or_default().to_string(),
                created_at_ms: now_ms,
            })
            .await
        {
            tracing::warn!(error = %err, "failed to insert request log");
        }

        if cost > 0.0 {
            self.bill(&record, cost).await;
        }

        if let Err(err) = self.store.touch_last_active(&record.tenant_id, now_ms).await {
            tracing::warn!(error = %err, "failed to touch tenant last_active");
        }

        cost
    }

    async fn bill(&self, record: &RequestRecord, cost: f64) {
        let day = day_key(now_epoch_secs());
        if let Err(err) = self
            .store
            .add_daily_usage(
                &record.tenant_id,
                &record.provider,
                &record.model,
                &day,
                u64::from(record.tokens),
                cost,
            )
            .await
        {
            tracing::warn!(error = %err, "failed to upsert daily usage");
        }

        match self.store.apply_charge(&record.tenant_id, cost).await {
            Ok(balance_after) => {
                let description = format!(
                    "{} / {} / {} tokens",
                    record.provider, record.model, record.tokens
                );
                if let Err(err) = self
                    .store
                    .append_transaction(Transaction {
                        id: 0,
                        tenant_id: record.tenant_id.clone(),
                        kind: TransactionKind::Charge,
                        amount_usd: -cost,
                        balance_after_usd: balance_after,
                        description,
                        created_at_ms: now_epoch_millis(),
                    })
                    .await
                {
                    tracing::warn!(error = %err, "failed to append charge transaction");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to debit tenant balance");
            }
        }
    }

    async fn cost_usd(&self, model: &str, tokens: u32) -> f64 {
        let price = match self.store.model_price(model).await {
            Ok(Some(price)) => price,
            _ => fallback_price_usd_per_1k(model),
        };
        price * f64::from(tokens) / 1000.0
    }
}
