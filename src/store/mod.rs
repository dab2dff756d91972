//! Durable state port. The gateway core only talks to the [`Store`] trait;
//! admin/tenant consoles, migrations, and seeding live outside this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Capability;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Upstream provider family. Many concrete provider instances may share one
/// family; the model catalog routes a model id to a family, not an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderFamily {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "deepseek")]
    DeepSeek,
    #[serde(rename = "mistral")]
    Mistral,
    #[serde(rename = "generic-openai")]
    GenericOpenAi,
}

impl ProviderFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderFamily::OpenAi => "openai",
            ProviderFamily::Anthropic => "anthropic",
            ProviderFamily::Gemini => "gemini",
            ProviderFamily::DeepSeek => "deepseek",
            ProviderFamily::Mistral => "mistral",
            ProviderFamily::GenericOpenAi => "generic-openai",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "openai" => Some(ProviderFamily::OpenAi),
            "anthropic" => Some(ProviderFamily::Anthropic),
            "gemini" => Some(ProviderFamily::Gemini),
            "deepseek" => Some(ProviderFamily::DeepSeek),
            "mistral" => Some(ProviderFamily::Mistral),
            "generic-openai" => Some(ProviderFamily::GenericOpenAi),
            _ => None,
        }
    }

    /// Families that speak the OpenAI chat/embeddings wire format natively.
    pub fn is_openai_compatible(&self) -> bool {
        matches!(
            self,
            ProviderFamily::OpenAi
                | ProviderFamily::DeepSeek
                | ProviderFamily::Mistral
                | ProviderFamily::GenericOpenAi
        )
    }
}

impl std::fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub balance_usd: f64,
    pub suspended: bool,
    pub rate_limit_rpm: u32,
    pub spend_limit_usd: Option<f64>,
    pub total_topup_usd: f64,
    pub total_spent_usd: f64,
    pub created_at_ms: i64,
    pub last_active_ms: Option<i64>,
}

impl Tenant {
    pub fn new(id: impl Into<String>, name: impl Into<String>, balance_usd: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            balance_usd,
            suspended: false,
            rate_limit_rpm: 0,
            spend_limit_usd: None,
            total_topup_usd: 0.0,
            total_spent_usd: 0.0,
            created_at_ms: crate::util::now_epoch_millis(),
            last_active_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub key: String,
    pub tenant_id: String,
    pub name: String,
    /// Empty means every model is allowed.
    pub allowed_models: Vec<String>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInstance {
    pub id: String,
    pub name: String,
    pub family: ProviderFamily,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub default_model: Option<String>,
    pub supports_text: bool,
    pub supports_vision: bool,
    pub enabled: bool,
}

impl ProviderInstance {
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Text => self.supports_text,
            Capability::Vision => self.supports_vision,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    pub tenant_id: String,
    pub capability: Capability,
    pub primary_provider_id: String,
    pub secondary_provider_id: Option<String>,
    /// Default model applied when the request leaves the model empty.
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub model: String,
    pub family: ProviderFamily,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLog {
    pub id: i64,
    pub tenant_id: String,
    pub provider: String,
    pub model: String,
    pub latency_ms: i64,
    pub ttft_ms: i64,
    pub tokens: u32,
    pub cost_usd: f64,
    pub prompt_hash: String,
    pub fallback_used: bool,
    pub status_code: u16,
    pub error_code: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Charge,
    Topup,
    Adjustment,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Charge => "charge",
            TransactionKind::Topup => "topup",
            TransactionKind::Adjustment => "adjustment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "charge" => Some(TransactionKind::Charge),
            "topup" => Some(TransactionKind::Topup),
            "adjustment" => Some(TransactionKind::Adjustment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub tenant_id: String,
    pub kind: TransactionKind,
    pub amount_usd: f64,
    pub balance_after_usd: f64,
    pub description: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageDay {
    pub tenant_id: String,
    pub provider: String,
    pub model: String,
    pub day: String,
    pub tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RequestLogFilters {
    pub tenant_id: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    // Tenants and API keys. Key -> tenant is the request hot path.
    async fn upsert_tenant(&self, tenant: Tenant) -> Result<(), StoreError>;
    async fn tenant(&self, id: &str) -> Result<Option<Tenant>, StoreError>;
    async fn tenant_by_api_key(&self, key: &str) -> Result<Option<Tenant>, StoreError>;
    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError>;
    async fn set_tenant_suspended(&self, id: &str, suspended: bool) -> Result<(), StoreError>;
    async fn upsert_api_key(&self, key: ApiKey) -> Result<(), StoreError>;
    async fn api_key(&self, key: &str) -> Result<Option<ApiKey>, StoreError>;
    async fn delete_api_key(&self, tenant_id: &str, key: &str) -> Result<(), StoreError>;

    // Provider instances.
    async fn upsert_provider(&self, provider: ProviderInstance) -> Result<(), StoreError>;
    async fn provider(&self, id: &str) -> Result<Option<ProviderInstance>, StoreError>;
    async fn list_providers(&self) -> Result<Vec<ProviderInstance>, StoreError>;
    async fn enabled_providers_by_family(
        &self,
        family: ProviderFamily,
    ) -> Result<Vec<ProviderInstance>, StoreError>;
    async fn delete_provider(&self, id: &str) -> Result<(), StoreError>;

    // Routing rules, model catalog, prices.
    async fn upsert_routing_rule(&self, rule: RoutingRule) -> Result<(), StoreError>;
    async fn routing_rule(
        &self,
        tenant_id: &str,
        capability: Capability,
    ) -> Result<Option<RoutingRule>, StoreError>;
    async fn upsert_catalog_entry(
        &self,
        model: &str,
        family: ProviderFamily,
    ) -> Result<(), StoreError>;
    async fn catalog_family(&self, model: &str) -> Result<Option<ProviderFamily>, StoreError>;
    async fn list_catalog(&self) -> Result<Vec<CatalogEntry>, StoreError>;
    async fn upsert_model_price(&self, model: &str, usd_per_1k: f64) -> Result<(), StoreError>;
    async fn model_price(&self, model: &str) -> Result<Option<f64>, StoreError>;

    // Accounting. `apply_charge` is the single atomic balance update: it
    // debits the balance, bumps total_spent, and returns the balance after.
    async fn insert_request_log(&self, log: RequestLog) -> Result<(), StoreError>;
    async fn list_request_logs(
        &self,
        page: u32,
        page_size: u32,
        filters: RequestLogFilters,
    ) -> Result<Page<RequestLog>, StoreError>;
    async fn append_transaction(&self, tx: Transaction) -> Result<(), StoreError>;
    async fn list_transactions(
        &self,
        tenant_id: &str,
        limit: u32,
    ) -> Result<Vec<Transaction>, StoreError>;
    async fn apply_charge(&self, tenant_id: &str, cost_usd: f64) -> Result<f64, StoreError>;
    async fn credit_balance(&self, tenant_id: &str, amount_usd: f64) -> Result<f64, StoreError>;
    async fn add_daily_usage(
        &self,
        tenant_id: &str,
        provider: &str,
        model: &str,
        day: &str,
        tokens: u64,
        cost_usd: f64,
    ) -> Result<(), StoreError>;
    async fn touch_last_active(&self, tenant_id: &str, at_ms: i64) -> Result<(), StoreError>;
}
