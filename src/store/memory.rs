use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::types::Capability;

use super::{
    ApiKey, CatalogEntry, Page, ProviderFamily, ProviderInstance, RequestLog, RequestLogFilters,
    RoutingRule, Store, StoreError, Tenant, Transaction, UsageDay,
};

/// In-process store. Backs tests and the out-of-the-box dummy-mode deployment;
/// nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    tenants: HashMap<String, Tenant>,
    api_keys: HashMap<String, ApiKey>,
    providers: Vec<ProviderInstance>,
    routing_rules: Vec<RoutingRule>,
    catalog: HashMap<String, ProviderFamily>,
    prices: HashMap<String, f64>,
    request_logs: Vec<RequestLog>,
    transactions: Vec<Transaction>,
    usage_daily: HashMap<(String, String, String, String), UsageDay>,
    next_log_id: i64,
    next_tx_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_tenant(&self, tenant: Tenant) -> Result<(), StoreError> {
        self.lock().tenants.insert(tenant.id.clone(), tenant);
        Ok(())
    }

    async fn tenant(&self, id: &str) -> Result<Option<Tenant>, StoreError> {
        Ok(self.lock().tenants.get(id).cloned())
    }

    async fn tenant_by_api_key(&self, key: &str) -> Result<Option<Tenant>, StoreError> {
        let inner = self.lock();
        let Some(api_key) = inner.api_keys.get(key) else {
            return Ok(None);
        };
        Ok(inner.tenants.get(&api_key.tenant_id).cloned())
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let mut tenants: Vec<Tenant> = self.lock().tenants.values().cloned().collect();
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tenants)
    }

    async fn set_tenant_suspended(&self, id: &str, suspended: bool) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let tenant = inner
            .tenants
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("tenant {id}")))?;
        tenant.suspended = suspended;
        Ok(())
    }

    async fn upsert_api_key(&self, key: ApiKey) -> Result<(), StoreError> {
        self.lock().api_keys.insert(key.key.clone(), key);
        Ok(())
    }

    async fn api_key(&self, key: &str) -> Result<Option<ApiKey>, StoreError> {
        Ok(self.lock().api_keys.get(key).cloned())
    }

    async fn delete_api_key(&self, tenant_id: &str, key: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner
            .api_keys
            .get(key)
            .is_some_and(|existing| existing.tenant_id == tenant_id)
        {
            inner.api_keys.remove(key);
        }
        Ok(())
    }

    async fn upsert_provider(&self, provider: ProviderInstance) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(existing) = inner.providers.iter_mut().find(|p| p.id == provider.id) {
            *existing = provider;
        } else {
            inner.providers.push(provider);
        }
        Ok(())
    }

    async fn provider(&self, id: &str) -> Result<Option<ProviderInstance>, StoreError> {
        Ok(self.lock().providers.iter().find(|p| p.id == id).cloned())
    }

    async fn list_providers(&self) -> Result<Vec<ProviderInstance>, StoreError> {
        Ok(self.lock().providers.clone())
    }

    async fn enabled_providers_by_family(
        &self,
        family: ProviderFamily,
    ) -> Result<Vec<ProviderInstance>, StoreError> {
        Ok(self
            .lock()
            .providers
            .iter()
            .filter(|p| p.enabled && p.family == family)
            .cloned()
            .collect())
    }

    async fn delete_provider(&self, id: &str) -> Result<(), StoreError> {
        self.lock().providers.retain(|p| p.id != id);
        Ok(())
    }

    async fn upsert_routing_rule(&self, rule: RoutingRule) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(existing) = inner
            .routing_rules
            .iter_mut()
            .find(|r| r.tenant_id == rule.tenant_id && r.capability == rule.capability)
        {
            *existing = rule;
        } else {
            inner.routing_rules.push(rule);
        }
        Ok(())
    }

    async fn routing_rule(
        &self,
        tenant_id: &str,
        capability: Capability,
    ) -> Result<Option<RoutingRule>, StoreError> {
        Ok(self
            .lock()
            .routing_rules
            .iter()
            .find(|r| r.tenant_id == tenant_id && r.capability == capability)
            .cloned())
    }

    async fn upsert_catalog_entry(
        &self,
        model: &str,
        family: ProviderFamily,
    ) -> Result<(), StoreError> {
        self.lock().catalog.insert(model.to_string(), family);
        Ok(())
    }

    async fn catalog_family(&self, model: &str) -> Result<Option<ProviderFamily>, StoreError> {
        Ok(self.lock().catalog.get(model).copied())
    }

    async fn list_catalog(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        let mut entries: Vec<CatalogEntry> = self
            .lock()
            .catalog
            .iter()
            .map(|(model, family)| CatalogEntry {
                model: model.clone(),
                family: *family,
            })
            .collect();
        entries.sort_by(|a, b| a.model.cmp(&b.model));
        Ok(entries)
    }

    async fn upsert_model_price(&self, model: &str, usd_per_1k: f64) -> Result<(), StoreError> {
        self.lock().prices.insert(model.to_string(), usd_per_1k);
        Ok(())
    }

    async fn model_price(&self, model: &str) -> Result<Option<f64>, StoreError> {
        Ok(self.lock().prices.get(model).copied())
    }

    async fn insert_request_log(&self, mut log: RequestLog) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.next_log_id += 1;
        log.id = inner.next_log_id;
        inner.request_logs.push(log);
        Ok(())
    }

    async fn list_request_logs(
        &self,
        page: u32,
        page_size: u32,
        filters: RequestLogFilters,
    ) -> Result<Page<RequestLog>, StoreError> {
        let page = page.max(1);
        let page_size = page_size.max(1);
        let inner = self.lock();
        let mut matched: Vec<RequestLog> = inner
            .request_logs
            .iter()
            .filter(|log| {
                filters
                    .tenant_id
                    .as_deref()
                    .is_none_or(|t| log.tenant_id == t)
                    && filters.provider.as_deref().is_none_or(|p| log.provider == p)
                    && filters.model.as_deref().is_none_or(|m| log.model == m)
                    && filters.status_code.is_none_or(|s| log.status_code == s)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        let total = matched.len() as u64;
        let start = ((page - 1) * page_size) as usize;
        let items = matched
            .into_iter()
            .skip(start)
            .take(page_size as usize)
            .collect();
        Ok(Page {
            items,
            total,
            page,
            page_size,
        })
    }

    async fn append_transaction(&self, mut tx: Transaction) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.next_tx_id += 1;
        tx.id = inner.next_tx_id;
        inner.transactions.push(tx);
        Ok(())
    }

    async fn list_transactions(
        &self,
        tenant_id: &str,
        limit: u32,
    ) -> Result<Vec<Transaction>, StoreError> {
        let inner = self.lock();
        let mut matched: Vec<Transaction> = inner
            .transactions
            .iter()
            .filter(|tx| tx.tenant_id == tenant_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        matched.truncate(limit.max(1) as usize);
        Ok(matched)
    }

    async fn apply_charge(&self, tenant_id: &str, cost_usd: f64) -> Result<f64, StoreError> {
        let mut inner = self.lock();
        let tenant = inner
            .tenants
            .get_mut(tenant_id)
            .ok_or_else(|| StoreError::NotFound(format!("tenant {tenant_id}")))?;
        tenant.balance_usd -= cost_usd;
        tenant.total_spent_usd += cost_usd;
        Ok(tenant.balance_usd)
    }

    async fn credit_balance(&self, tenant_id: &str, amount_usd: f64) -> Result<f64, StoreError> {
        let mut inner = self.lock();
        let tenant = inner
            .tenants
            .get_mut(tenant_id)
            .ok_or_else(|| StoreError::NotFound(format!("tenant {tenant_id}")))?;
        tenant.balance_usd += amount_usd;
        tenant.total_topup_usd += amount_usd;
        Ok(tenant.balance_usd)
    }

    async fn add_daily_usage(
        &self,
        tenant_id: &str,
        provider: &str,
        model: &str,
        day: &str,
        tokens: u64,
        cost_usd: f64,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let entry = inner
            .usage_daily
            .entry((
                tenant_id.to_string(),
                provider.to_string(),
                model.to_string(),
                day.to_string(),
            ))
            .or_insert_with(|| UsageDay {
                tenant_id: tenant_id.to_string(),
                provider: provider.to_string(),
                model: model.to_string(),
                day: day.to_string(),
                tokens: 0,
                cost_usd: 0.0,
            });
        entry.tokens += tokens;
        entry.cost_usd += cost_usd;
        Ok(())
    }

    async fn touch_last_active(&self, tenant_id: &str, at_ms: i64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(tenant) = inner.tenants.get_mut(tenant_id) {
            tenant.last_active_ms = Some(at_ms);
        }
        Ok(())
    }
}

impl MemoryStore {
    /// Daily-usage rows, primarily for assertions in tests.
    pub fn usage_rows(&self) -> Vec<UsageDay> {
        let mut rows: Vec<UsageDay> = self.lock().usage_daily.values().cloned().collect();
        rows.sort_by(|a, b| (&a.day, &a.model).cmp(&(&b.day, &b.model)));
        rows
    }
}
