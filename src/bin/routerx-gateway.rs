use std::sync::Arc;

use routerx::cache::{Cache, MemoryCache, RedisCache};
use routerx::config::Config;
use routerx::http::AppState;
use routerx::metrics::PrometheusMetrics;
use routerx::store::{ApiKey, MemoryStore, SqliteStore, Store, Tenant};

const DEMO_API_KEY: &str = "demo-key";

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    let otlp_endpoint = (!config.otel_endpoint.is_empty()).then_some(config.otel_endpoint.as_str());
    let _tracing = routerx::observability::init_tracing(
        &config.otel_service_name,
        otlp_endpoint,
        false,
    );

    let store = match build_store(&config).await {
        Ok(store) => store,
        Err(err) => {
            tracing::error!(error = %err, dsn = %config.database_url, "store init failed");
            std::process::exit(1);
        }
    };

    let cache = match build_cache(&config) {
        Ok(cache) => cache,
        Err(err) => {
            tracing::error!(error = %err, dsn = %config.redis_url, "cache init failed");
            std::process::exit(1);
        }
    };

    let metrics = Arc::new(PrometheusMetrics::new());
    let state = AppState::new(store, cache, metrics, config.enable_real_calls);
    let app = routerx::http::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, addr = %addr, "bind failed");
            std::process::exit(1);
        }
    };

    tracing::info!(
        addr = %addr,
        real_calls = config.enable_real_calls,
        "routerx gateway listening"
    );
    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!(error = %err, "server failed");
        std::process::exit(1);
    }
}

async fn build_store(config: &Config) -> Result<Arc<dyn Store>, String> {
    let dsn = config.database_url.as_str();
    if dsn == "memory:" || dsn.starts_with("memory") {
        let store = MemoryStore::new();
        seed_demo_tenant(&store, &config.default_tenant_id).await?;
        return Ok(Arc::new(store));
    }

    let path = dsn
        .strip_prefix("sqlite://")
        .or_else(|| dsn.strip_prefix("sqlite:"))
        .unwrap_or(dsn);
    if path.contains("://") {
        return Err(format!("unsupported store DSN scheme: {dsn}"));
    }

    let store = SqliteStore::new(path);
    store.init().await.map_err(|err| err.to_string())?;
    if store
        .list_tenants()
        .await
        .map_err(|err| err.to_string())?
        .is_empty()
    {
        seed_demo_tenant(&store, &config.default_tenant_id).await?;
    }
    Ok(Arc::new(store))
}

/// Seeds a default tenant and key so a fresh dummy-mode deployment answers
/// requests without any provisioning.
async fn seed_demo_tenant(store: &dyn Store, tenant_id: &str) -> Result<(), String> {
    store
        .upsert_tenant(Tenant::new(tenant_id, "Demo Workspace", 10.0))
        .await
        .map_err(|err| err.to_string())?;
    store
        .upsert_api_key(ApiKey {
            key: DEMO_API_KEY.to_string(),
            tenant_id: tenant_id.to_string(),
            name: "demo".to_string(),
            allowed_models: Vec::new(),
            created_at_ms: routerx::util::now_epoch_millis(),
        })
        .await
        .map_err(|err| err.to_string())?;
    tracing::info!(tenant_id, api_key = DEMO_API_KEY, "seeded demo tenant");
    Ok(())
}

fn build_cache(config: &Config) -> Result<Arc<dyn Cache>, String> {
    if config.redis_url.is_empty() || config.redis_url.starts_with("memory") {
        return Ok(Arc::new(MemoryCache::new()));
    }
    let cache = RedisCache::new(&config.redis_url).map_err(|err| err.to_string())?;
    Ok(Arc::new(cache))
}
