/// Runtime configuration, read once from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub redis_url: String,
    pub jwt_secret: String,
    pub enable_real_calls: bool,
    pub default_tenant_id: String,
    pub otel_endpoint: String,
    pub otel_service_name: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: get_env("PORT", "8080").parse().unwrap_or(8080),
            database_url: get_env("DATABASE_URL", "sqlite://routerx.db"),
            redis_url: get_env("REDIS_URL", ""),
            jwt_secret: get_env("JWT_SECRET", "change_me"),
            enable_real_calls: get_env_bool("ENABLE_REAL_CALLS", false),
            default_tenant_id: get_env("DEFAULT_TENANT_ID", "demo"),
            otel_endpoint: get_env("OTEL_EXPORTER_OTLP_ENDPOINT", ""),
            otel_service_name: get_env("OTEL_SERVICE_NAME", "routerx-gateway"),
        }
    }
}

fn get_env(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

fn get_env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "t" | "true" | "yes" | "on"
        ),
        _ => default,
    }
}
