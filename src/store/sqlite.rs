use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};

use crate::types::Capability;

use super::{
    ApiKey, CatalogEntry, Page, ProviderFamily, ProviderInstance, RequestLog, RequestLogFilters,
    RoutingRule, Store, StoreError, Tenant, Transaction, TransactionKind,
};

/// SQLite-backed store. Every call opens a connection inside
/// `spawn_blocking`; the schema is created on demand so a fresh file works
/// without a separate migration step.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            init_schema(conn)?;
            Ok(())
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut conn = open_connection(&path)?;
            init_schema(&conn)?;
            f(&mut conn)
        })
        .await?
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", 5_000)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tenants (
             id TEXT PRIMARY KEY,
             name TEXT NOT NULL,
             balance_usd REAL NOT NULL DEFAULT 0,
             suspended INTEGER NOT NULL DEFAULT 0,
             rate_limit_rpm INTEGER NOT NULL DEFAULT 0,
             spend_limit_usd REAL,
             total_topup_usd REAL NOT NULL DEFAULT 0,
             total_spent_usd REAL NOT NULL DEFAULT 0,
             created_at_ms INTEGER NOT NULL,
             last_active_ms INTEGER
         );
         CREATE TABLE IF NOT EXISTS api_keys (
             key TEXT PRIMARY KEY,
             tenant_id TEXT NOT NULL,
             name TEXT NOT NULL DEFAULT '',
             allowed_models TEXT NOT NULL DEFAULT '[]',
             created_at_ms INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS providers (
             id TEXT PRIMARY KEY,
             name TEXT NOT NULL,
             family TEXT NOT NULL,
             base_url TEXT,
             api_key TEXT,
             default_model TEXT,
             supports_text INTEGER NOT NULL DEFAULT 1,
             supports_vision INTEGER NOT NULL DEFAULT 0,
             enabled INTEGER NOT NULL DEFAULT 1
         );
         CREATE TABLE IF NOT EXISTS routing_rules (
             id TEXT PRIMARY KEY,
             tenant_id TEXT NOT NULL,
             capability TEXT NOT NULL,
             primary_provider_id TEXT NOT NULL,
             secondary_provider_id TEXT,
             model TEXT NOT NULL,
             UNIQUE (tenant_id, capability)
         );
         CREATE TABLE IF NOT EXISTS model_catalog (
             model TEXT PRIMARY KEY,
             family TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS model_prices (
             model TEXT PRIMARY KEY,
             usd_per_1k REAL NOT NULL
         );
         CREATE TABLE IF NOT EXISTS request_logs (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             tenant_id TEXT NOT NULL,
             provider TEXT NOT NULL,
             model TEXT NOT NULL,
             latency_ms INTEGER NOT NULL,
             ttft_ms INTEGER NOT NULL,
             tokens INTEGER NOT NULL,
             cost_usd REAL NOT NULL,
             prompt_hash TEXT NOT NULL,
             fallback_used INTEGER NOT NULL,
             status_code INTEGER NOT NULL,
             error_code TEXT NOT NULL DEFAULT '',
             created_at_ms INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_request_logs_tenant
             ON request_logs (tenant_id, created_at_ms);
         CREATE TABLE IF NOT EXISTS transactions (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             tenant_id TEXT NOT NULL,
             kind TEXT NOT NULL,
             amount_usd REAL NOT NULL,
             balance_after_usd REAL NOT NULL,
             description TEXT NOT NULL DEFAULT '',
             created_at_ms INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS usage_daily (
             tenant_id TEXT NOT NULL,
             provider TEXT NOT NULL,
             model TEXT NOT NULL,
             day TEXT NOT NULL,
             tokens INTEGER NOT NULL DEFAULT 0,
             cost_usd REAL NOT NULL DEFAULT 0,
             PRIMARY KEY (tenant_id, provider, model, day)
         );",
    )?;
    Ok(())
}

fn family_from_column(raw: &str) -> ProviderFamily {
    ProviderFamily::parse(raw).unwrap_or(ProviderFamily::GenericOpenAi)
}

fn row_to_tenant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        balance_usd: row.get(2)?,
        suspended: row.get::<_, i64>(3)? != 0,
        rate_limit_rpm: row.get::<_, i64>(4)? as u32,
        spend_limit_usd: row.get(5)?,
        total_topup_usd: row.get(6)?,
        total_spent_usd: row.get(7)?,
        created_at_ms: row.get(8)?,
        last_active_ms: row.get(9)?,
    })
}

const TENANT_COLUMNS: &str = "id, name, balance_usd, suspended, rate_limit_rpm, spend_limit_usd, \
                              total_topup_usd, total_spent_usd, created_at_ms, last_active_ms";

fn row_to_provider(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProviderInstance> {
    let family: String = row.get(2)?;
    Ok(ProviderInstance {
        id: row.get(0)?,
        name: row.get(1)?,
        family: family_from_column(&family),
        base_url: row.get(3)?,
        api_key: row.get(4)?,
        default_model: row.get(5)?,
        supports_text: row.get::<_, i64>(6)? != 0,
        supports_vision: row.get::<_, i64>(7)? != 0,
        enabled: row.get::<_, i64>(8)? != 0,
    })
}

const PROVIDER_COLUMNS: &str = "id, name, family, base_url, api_key, default_model, \
                                supports_text, supports_vision, enabled";

fn row_to_request_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestLog> {
    Ok(RequestLog {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        provider: row.get(2)?,
        model: row.get(3)?,
        latency_ms: row.get(4)?,
        ttft_ms: row.get(5)?,
        tokens: row.get::<_, i64>(6)? as u32,
        cost_usd: row.get(7)?,
        prompt_hash: row.get(8)?,
        fallback_used: row.get::<_, i64>(9)? != 0,
        status_code: row.get::<_, i64>(10)? as u16,
        error_code: row.get(11)?,
        created_at_ms: row.get(12)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_tenant(&self, tenant: Tenant) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tenants (id, name, balance_usd, suspended, rate_limit_rpm, \
                 spend_limit_usd, total_topup_usd, total_spent_usd, created_at_ms, last_active_ms) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10) \
                 ON CONFLICT(id) DO UPDATE SET name=?2, balance_usd=?3, suspended=?4, \
                 rate_limit_rpm=?5, spend_limit_usd=?6, total_topup_usd=?7, total_spent_usd=?8",
                params![
                    tenant.id,
                    tenant.name,
                    tenant.balance_usd,
                    tenant.suspended as i64,
                    tenant.rate_limit_rpm as i64,
                    tenant.spend_limit_usd,
                    tenant.total_topup_usd,
                    tenant.total_spent_usd,
                    tenant.created_at_ms,
                    tenant.last_active_ms,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn tenant(&self, id: &str) -> Result<Option<Tenant>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tenant = conn
                .query_row(
                    &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id=?1"),
                    params![id],
                    row_to_tenant,
                )
                .optional()?;
            Ok(tenant)
        })
        .await
    }

    async fn tenant_by_api_key(&self, key: &str) -> Result<Option<Tenant>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let tenant = conn
                .query_row(
                    "SELECT t.id, t.name, t.balance_usd, t.suspended, t.rate_limit_rpm, \
                     t.spend_limit_usd, t.total_topup_usd, t.total_spent_usd, t.created_at_ms, \
                     t.last_active_ms \
                     FROM api_keys k JOIN tenants t ON k.tenant_id = t.id WHERE k.key=?1",
                    params![key],
                    row_to_tenant,
                )
                .optional()?;
            Ok(tenant)
        })
        .await
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {TENANT_COLUMNS} FROM tenants ORDER BY id"))?;
            let rows = stmt.query_map([], row_to_tenant)?;
            let mut tenants = Vec::new();
            for row in rows {
                tenants.push(row?);
            }
            Ok(tenants)
        })
        .await
    }

    async fn set_tenant_suspended(&self, id: &str, suspended: bool) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE tenants SET suspended=?2 WHERE id=?1",
                params![id, suspended as i64],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("tenant {id}")));
            }
            Ok(())
        })
        .await
    }

    async fn upsert_api_key(&self, key: ApiKey) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let allowed = serde_json::to_string(&key.allowed_models)?;
            conn.execute(
                "INSERT INTO api_keys (key, tenant_id, name, allowed_models, created_at_ms) \
                 VALUES (?1,?2,?3,?4,?5) \
                 ON CONFLICT(key) DO UPDATE SET tenant_id=?2, name=?3, allowed_models=?4",
                params![key.key, key.tenant_id, key.name, allowed, key.created_at_ms],
            )?;
            Ok(())
        })
        .await
    }

    async fn api_key(&self, key: &str) -> Result<Option<ApiKey>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let found = conn
                .query_row(
                    "SELECT key, tenant_id, name, allowed_models, created_at_ms \
                     FROM api_keys WHERE key=?1",
                    params![key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    },
                )
                .optional()?;
            let Some((key, tenant_id, name, allowed_raw, created_at_ms)) = found else {
                return Ok(None);
            };
            let allowed_models: Vec<String> = serde_json::from_str(&allowed_raw)?;
            Ok(Some(ApiKey {
                key,
                tenant_id,
                name,
                allowed_models,
                created_at_ms,
            }))
        })
        .await
    }

    async fn delete_api_key(&self, tenant_id: &str, key: &str) -> Result<(), StoreError> {
        let tenant_id = tenant_id.to_string();
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM api_keys WHERE key=?1 AND tenant_id=?2",
                params![key, tenant_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn upsert_provider(&self, provider: ProviderInstance) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO providers (id, name, family, base_url, api_key, default_model, \
                 supports_text, supports_vision, enabled) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9) \
                 ON CONFLICT(id) DO UPDATE SET name=?2, family=?3, base_url=?4, api_key=?5, \
                 default_model=?6, supports_text=?7, supports_vision=?8, enabled=?9",
                params![
                    provider.id,
                    provider.name,
                    provider.family.as_str(),
                    provider.base_url,
                    provider.api_key,
                    provider.default_model,
                    provider.supports_text as i64,
                    provider.supports_vision as i64,
                    provider.enabled as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn provider(&self, id: &str) -> Result<Option<ProviderInstance>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let provider = conn
                .query_row(
                    &format!("SELECT {PROVIDER_COLUMNS} FROM providers WHERE id=?1"),
                    params![id],
                    row_to_provider,
                )
                .optional()?;
            Ok(provider)
        })
        .await
    }

    async fn list_providers(&self) -> Result<Vec<ProviderInstance>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROVIDER_COLUMNS} FROM providers ORDER BY id"
            ))?;
            let rows = stmt.query_map([], row_to_provider)?;
            let mut providers = Vec::new();
            for row in rows {
                providers.push(row?);
            }
            Ok(providers)
        })
        .await
    }

    async fn enabled_providers_by_family(
        &self,
        family: ProviderFamily,
    ) -> Result<Vec<ProviderInstance>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROVIDER_COLUMNS} FROM providers WHERE family=?1 AND enabled=1 \
                 ORDER BY id"
            ))?;
            let rows = stmt.query_map(params![family.as_str()], row_to_provider)?;
            let mut providers = Vec::new();
            for row in rows {
                providers.push(row?);
            }
            Ok(providers)
        })
        .await
    }

    async fn delete_provider(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM providers WHERE id=?1", params![id])?;
            Ok(())
        })
        .await
    }

    async fn upsert_routing_rule(&self, rule: RoutingRule) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO routing_rules (id, tenant_id, capability, primary_provider_id, \
                 secondary_provider_id, model) VALUES (?1,?2,?3,?4,?5,?6) \
                 ON CONFLICT(tenant_id, capability) DO UPDATE SET primary_provider_id=?4, \
                 secondary_provider_id=?5, model=?6",
                params![
                    rule.id,
                    rule.tenant_id,
                    rule.capability.as_str(),
                    rule.primary_provider_id,
                    rule.secondary_provider_id,
                    rule.model,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn routing_rule(
        &self,
        tenant_id: &str,
        capability: Capability,
    ) -> Result<Option<RoutingRule>, StoreError> {
        let tenant_id = tenant_id.to_string();
        self.with_conn(move |conn| {
            let rule = conn
                .query_row(
                    "SELECT id, tenant_id, capability, primary_provider_id, \
                     secondary_provider_id, model FROM routing_rules \
                     WHERE tenant_id=?1 AND capability=?2",
                    params![tenant_id, capability.as_str()],
                    |row| {
                        let capability_raw: String = row.get(2)?;
                        Ok(RoutingRule {
                            id: row.get(0)?,
                            tenant_id: row.get(1)?,
                            capability: if capability_raw == "vision" {
                                Capability::Vision
                            } else {
                                Capability::Text
                            },
                            primary_provider_id: row.get(3)?,
                            secondary_provider_id: row.get(4)?,
                            model: row.get(5)?,
                        })
                    },
                )
                .optional()?;
            Ok(rule)
        })
        .await
    }

    async fn upsert_catalog_entry(
        &self,
        model: &str,
        family: ProviderFamily,
    ) -> Result<(), StoreError> {
        let model = model.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO model_catalog (model, family) VALUES (?1,?2) \
                 ON CONFLICT(model) DO UPDATE SET family=?2",
                params![model, family.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    async fn catalog_family(&self, model: &str) -> Result<Option<ProviderFamily>, StoreError> {
        let model = model.to_string();
        self.with_conn(move |conn| {
            let family: Option<String> = conn
                .query_row(
                    "SELECT family FROM model_catalog WHERE model=?1",
                    params![model],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(family.as_deref().and_then(ProviderFamily::parse))
        })
        .await
    }

    async fn list_catalog(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT model, family FROM model_catalog ORDER BY model")?;
            let rows = stmt.query_map([], |row| {
                let model: String = row.get(0)?;
                let family: String = row.get(1)?;
                Ok((model, family))
            })?;
            let mut entries = Vec::new();
            for row in rows {
                let (model, family) = row?;
                entries.push(CatalogEntry {
                    model,
                    family: family_from_column(&family),
                });
            }
            Ok(entries)
        })
        .await
    }

    async fn upsert_model_price(&self, model: &str, usd_per_1k: f64) -> Result<(), StoreError> {
        let model = model.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO model_prices (model, usd_per_1k) VALUES (?1,?2) \
                 ON CONFLICT(model) DO UPDATE SET usd_per_1k=?2",
                params![model, usd_per_1k],
            )?;
            Ok(())
        })
        .await
    }

    async fn model_price(&self, model: &str) -> Result<Option<f64>, StoreError> {
        let model = model.to_string();
        self.with_conn(move |conn| {
            let price = conn
                .query_row(
                    "SELECT usd_per_1k FROM model_prices WHERE model=?1",
                    params![model],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(price)
        })
        .await
    }

    async fn insert_request_log(&self, log: RequestLog) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO request_logs (tenant_id, provider, model, latency_ms, ttft_ms, \
                 tokens, cost_usd, prompt_hash, fallback_used, status_code, error_code, \
                 created_at_ms) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                params![
                    log.tenant_id,
                    log.provider,
                    log.model,
                    log.latency_ms,
                    log.ttft_ms,
                    log.tokens as i64,
                    log.cost_usd,
                    log.prompt_hash,
                    log.fallback_used as i64,
                    log.status_code as i64,
                    log.error_code,
                    log.created_at_ms,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_request_logs(
        &self,
        page: u32,
        page_size: u32,
        filters: RequestLogFilters,
    ) -> Result<Page<RequestLog>, StoreError> {
        let page = page.max(1);
        let page_size = page_size.max(1);
        self.with_conn(move |conn| {
            let mut clauses = Vec::new();
            let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
            if let Some(tenant_id) = &filters.tenant_id {
                clauses.push("tenant_id = ?");
                args.push(Box::new(tenant_id.clone()));
            }
            if let Some(provider) = &filters.provider {
                clauses.push("provider = ?");
                args.push(Box::new(provider.clone()));
            }
            if let Some(model) = &filters.model {
                clauses.push("model = ?");
                args.push(Box::new(model.clone()));
            }
            if let Some(status) = filters.status_code {
                clauses.push("status_code = ?");
                args.push(Box::new(status as i64));
            }
            let where_clause = if clauses.is_empty() {
                String::new()
            } else {
                format!(" WHERE {}", clauses.join(" AND "))
            };

            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM request_logs{where_clause}"),
                rusqlite::params_from_iter(args.iter().map(|arg| arg.as_ref())),
                |row| row.get(0),
            )?;

            let offset = ((page - 1) * page_size) as i64;
            let mut stmt = conn.prepare(&format!(
                "SELECT id, tenant_id, provider, model, latency_ms, ttft_ms, tokens, cost_usd, \
                 prompt_hash, fallback_used, status_code, error_code, created_at_ms \
                 FROM request_logs{where_clause} ORDER BY created_at_ms DESC, id DESC \
                 LIMIT {page_size} OFFSET {offset}"
            ))?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(args.iter().map(|arg| arg.as_ref())),
                row_to_request_log,
            )?;
            let mut items = Vec::new();
            for row in rows {
                items.push(row?);
            }
            Ok(Page {
                items,
                total: total as u64,
                page,
                page_size,
            })
        })
        .await
    }

    async fn append_transaction(&self, tx: Transaction) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO transactions (tenant_id, kind, amount_usd, balance_after_usd, \
                 description, created_at_ms) VALUES (?1,?2,?3,?4,?5,?6)",
                params![
                    tx.tenant_id,
                    tx.kind.as_str(),
                    tx.amount_usd,
                    tx.balance_after_usd,
                    tx.description,
                    tx.created_at_ms,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_transactions(
        &self,
        tenant_id: &str,
        limit: u32,
    ) -> Result<Vec<Transaction>, StoreError> {
        let tenant_id = tenant_id.to_string();
        let limit = limit.max(1);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tenant_id, kind, amount_usd, balance_after_usd, description, \
                 created_at_ms FROM transactions WHERE tenant_id=?1 \
                 ORDER BY created_at_ms DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![tenant_id, limit as i64], |row| {
                let kind: String = row.get(2)?;
                Ok(Transaction {
                    id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    kind: TransactionKind::parse(&kind).unwrap_or(TransactionKind::Adjustment),
                    amount_usd: row.get(3)?,
                    balance_after_usd: row.get(4)?,
                    description: row.get(5)?,
                    created_at_ms: row.get(6)?,
                })
            })?;
            let mut transactions = Vec::new();
            for row in rows {
                transactions.push(row?);
            }
            Ok(transactions)
        })
        .await
    }

    async fn apply_charge(&self, tenant_id: &str, cost_usd: f64) -> Result<f64, StoreError> {
        let tenant_id = tenant_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE tenants SET balance_usd = balance_usd - ?2, \
                 total_spent_usd = total_spent_usd + ?2 WHERE id=?1",
                params![tenant_id, cost_usd],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("tenant {tenant_id}")));
            }
            let balance_after: f64 = tx.query_row(
                "SELECT balance_usd FROM tenants WHERE id=?1",
                params![tenant_id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(balance_after)
        })
        .await
    }

    async fn credit_balance(&self, tenant_id: &str, amount_usd: f64) -> Result<f64, StoreError> {
        let tenant_id = tenant_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE tenants SET balance_usd = balance_usd + ?2, \
                 total_topup_usd = total_topup_usd + ?2 WHERE id=?1",
                params![tenant_id, amount_usd],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("tenant {tenant_id}")));
            }
            let balance_after: f64 = tx.query_row(
                "SELECT balance_usd FROM tenants WHERE id=?1",
                params![tenant_id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(balance_after)
        })
        .await
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
        let tenant_id = tenant_id.to_string();
        let provider = provider.to_string();
        let model = model.to_string();
        let day = day.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO usage_daily (tenant_id, provider, model, day, tokens, cost_usd) \
                 VALUES (?1,?2,?3,?4,?5,?6) \
                 ON CONFLICT(tenant_id, provider, model, day) DO UPDATE SET \
                 tokens = tokens + ?5, cost_usd = cost_usd + ?6",
                params![tenant_id, provider, model, day, tokens as i64, cost_usd],
            )?;
            Ok(())
        })
        .await
    }

    async fn touch_last_active(&self, tenant_id: &str, at_ms: i64) -> Result<(), StoreError> {
        let tenant_id = tenant_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE tenants SET last_active_ms=?2 WHERE id=?1",
                params![tenant_id, at_ms],
            )?;
            Ok(())
        })
        .await
    }
}
