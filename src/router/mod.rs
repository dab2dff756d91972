//! Request routing: model resolution, candidate planning, and the dispatch
//! loop with circuit recording and transparent failover.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::accounting::fallback_price_usd_per_1k;
use crate::cache::Cache;
use crate::circuit::{CircuitMap, LatencyTracker};
use crate::error::GatewayError;
use crate::providers::{ProviderError, StreamSender, provider_for};
use crate::store::{ProviderInstance, Store};
use crate::types::{Capability, ChatRequest, ChatResponse};
use crate::util::now_epoch_secs;

mod planner;

pub use planner::{RouteOptions, SortMode, plan_candidates};

const PROVIDER_HEALTH_TTL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct RouteOutcome {
    pub response: ChatResponse,
    pub provider_id: String,
    pub provider_name: String,
    pub fallback_used: bool,
    pub ttft: Duration,
    pub tokens: u32,
}

struct TryFailure {
    error: ProviderError,
    /// Terminal failures (4xx, client cancel) stop the whole route, not just
    /// the current candidate list.
    terminal: bool,
}

pub struct Router {
    store: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
    enable_real: bool,
    circuits: CircuitMap,
    latencies: LatencyTracker,
}

impl Router {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn Cache>, enable_real: bool) -> Self {
        Self {
            store,
            cache,
            enable_real,
            circuits: CircuitMap::new(),
            latencies: LatencyTracker::new(),
        }
    }

    pub fn circuits(&self) -> &CircuitMap {
        &self.circuits
    }

    pub fn latencies(&self) -> &LatencyTracker {
        &self.latencies
    }

    /// Auto-routing: catalog lookup first, per-tenant routing rule second.
    /// Mutates the request in place when the model is empty so the resolved
    /// model flows through to accounting.
    pub async fn route(
        &self,
        tenant_id: &str,
        request: &mut ChatRequest,
        stream: bool,
        sender: Option<&StreamSender>,
        options: &RouteOptions,
    ) -> Result<RouteOutcome, GatewayError> {
        let capability = request.capability();

        // Rule errors are tolerated; the rule is only a fallback route.
        let rule = self
            .store
            .routing_rule(tenant_id, capability)
            .await
            .unwrap_or_default();

        if request.model.is_empty() {
            request.model = rule
                .as_ref()
                .map(|rule| rule.model.clone())
                .filter(|model| !model.is_empty())
                .unwrap_or_else(|| "default".to_string());
        }

        let mut errors: Vec<String> = Vec::new();
        let mut attempted = false;

        match self.store.catalog_family(&request.model).await {
            Ok(Some(family)) => {
                let providers = self
                    .store
                    .enabled_providers_by_family(family)
                    .await
                    .unwrap_or_default();
                let candidates = self
                    .plan(providers, capability, options, &request.model)
                    .await;
                if candidates.is_empty() {
                    errors.push(format!(
                        "auto-route({family}): no enabled provider supports {}",
                        capability.as_str()
                    ));
                } else {
                    attempted = true;
                    match self
                        .try_candidates(&candidates, request, stream, sender, options)
                        .await
                    {
                        Ok(outcome) => return Ok(outcome),
                        Err(failure) => {
                            if failure.terminal {
                                return Err(terminal_error(failure.error));
                            }
                            errors.push(format!("auto-route({family}): {}", failure.error));
                        }
                    }
                }
            }
            Ok(None) => errors.push("model not in catalog".to_string()),
            Err(err) => errors.push(format!("catalog lookup: {err}")),
        }

        if let Some(rule) = rule {
            let mut providers = Vec::new();
            if let Ok(Some(primary)) = self.store.provider(&rule.primary_provider_id).await {
                providers.push(primary);
            }
            if let Some(secondary_id) = rule
                .secondary_provider_id
                .as_deref()
                .filter(|id| !id.is_empty())
            {
                if let Ok(Some(secondary)) = self.store.provider(secondary_id).await {
                    providers.push(secondary);
                }
            }
            let candidates = self
                .plan(providers, capability, options, &request.model)
                .await;
            if candidates.is_empty() {
                errors.push("routing rule: no candidate provider".to_string());
            } else {
                attempted = true;
                match self
                    .try_candidates(&candidates, request, stream, sender, options)
                    .await
                {
                    Ok(outcome) => return Ok(outcome),
                    Err(failure) => {
                        if failure.terminal {
                            return Err(terminal_error(failure.error));
                        }
                        errors.push(format!("routing rule: {}", failure.error));
                    }
                }
            }
        }

        let detail = format!(
            "routing failed for model {}: {}",
            request.model,
            errors.join("; ")
        );
        if attempted {
            Err(GatewayError::Upstream(detail))
        } else {
            Err(GatewayError::NoCandidates(detail))
        }
    }

    async fn plan(
        &self,
        providers: Vec<ProviderInstance>,
        capability: Capability,
        options: &RouteOptions,
        requested_model: &str,
    ) -> Vec<ProviderInstance> {
        // Price-sort keys are resolved up front so planning stays synchronous.
        let mut prices: HashMap<String, f64> = HashMap::new();
        if options.sort == SortMode::Price {
            for provider in &providers {
                let model = provider
                    .default_model
                    .as_deref()
                    .filter(|model| !model.is_empty())
                    .unwrap_or(requested_model);
                let price = match self.store.model_price(model).await {
                    Ok(Some(price)) => price,
                    _ => fallback_price_usd_per_1k(model),
                };
                prices.insert(provider.id.clone(), price);
            }
        }

        plan_candidates(
            providers,
            capability,
            options,
            &self.circuits,
            &self.latencies,
            |provider| {
                prices
                    .get(&provider.id)
                    .copied()
                    .unwrap_or_else(|| fallback_price_usd_per_1k(requested_model))
            },
            now_epoch_secs(),
        )
    }

    async fn try_candidates(
        &self,
        candidates: &[ProviderInstance],
        request: &ChatRequest,
        stream: bool,
        sender: Option<&StreamSender>,
        options: &RouteOptions,
    ) -> Result<RouteOutcome, TryFailure> {
        let mut last: Option<ProviderError> = None;

        for (index, instance) in candidates.iter().enumerate() {
            let provider = provider_for(
                instance,
                self.enable_real,
                options.api_key_override.as_deref(),
            );
            let attempt_start = Instant::now();
            let result = provider.chat(request, stream, sender).await;

            self.circuits
                .record(&instance.id, result.is_ok(), now_epoch_secs());
            let health = if result.is_ok() { "ok" } else { "fail" };
            let _ = self
                .cache
                .set(
                    &format!("provider_health:{}", instance.id),
                    health,
                    PROVIDER_HEALTH_TTL,
                )
                .await;

            match result {
                Ok(outcome) => {
                    self.latencies
                        .observe(&instance.id, attempt_start.elapsed().as_millis() as f64);
                    return Ok(RouteOutcome {
                        response: outcome.response,
                        provider_id: instance.id.clone(),
                        provider_name: instance.name.clone(),
                        fallback_used: index > 0,
                        ttft: outcome.ttft,
                        tokens: outcome.tokens,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        provider = %instance.name,
                        kind = error.kind(),
                        error = %error,
                        "provider attempt failed"
                    );
                    let terminal = !error.retriable();
                    if terminal {
                        return Err(TryFailure { error, terminal });
                    }
                    last = Some(error);
                }
            }
        }

        Err(TryFailure {
            error: last.unwrap_or_else(|| {
                ProviderError::Config("no candidate provider".to_string())
            }),
            terminal: false,
        })
    }
}

fn terminal_error(error: ProviderError) -> GatewayError {
    match error {
        ProviderError::ClientCancelled => GatewayError::ClientCancelled,
        other => GatewayError::Upstream(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::store::{MemoryStore, ProviderFamily, RoutingRule};
    use crate::types::ChatMessage;

    fn provider(id: &str, family: ProviderFamily, vision: bool) -> ProviderInstance {
        ProviderInstance {
            id: id.to_string(),
            name: id.to_string(),
            family,
            base_url: None,
            api_key: None,
            default_model: None,
            supports_text: true,
            supports_vision: vision,
            enabled: true,
        }
    }

    fn request(model: &str) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::user("hi")],
            ..ChatRequest::default()
        }
    }

    async fn harness() -> (Arc<MemoryStore>, Router) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let router = Router::new(store.clone(), cache, false);
        (store, router)
    }

    #[tokio::test]
    async fn catalog_hit_routes_to_family_provider_in_dummy_mode() {
        let (store, router) = harness().await;
        store
            .upsert_provider(provider("oa-1", ProviderFamily::OpenAi, false))
            .await
            .unwrap();
        store
            .upsert_catalog_entry("gpt-4o-mini", ProviderFamily::OpenAi)
            .await
            .unwrap();

        let mut req = request("gpt-4o-mini");
        let outcome = router
            .route("t1", &mut req, false, None, &RouteOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.provider_name, "oa-1");
        assert_eq!(outcome.tokens, 25);
        assert!(!outcome.fallback_used);
    }

    #[tokio::test]
    async fn catalog_miss_falls_back_to_routing_rule_and_fills_default_model() {
        let (store, router) = harness().await;
        store
            .upsert_provider(provider("anth-1", ProviderFamily::Anthropic, false))
            .await
            .unwrap();
        store
            .upsert_routing_rule(RoutingRule {
                id: "r1".to_string(),
                tenant_id: "t1".to_string(),
                capability: Capability::Text,
                primary_provider_id: "anth-1".to_string(),
                secondary_provider_id: None,
                model: "claude-3-5-haiku".to_string(),
            })
            .await
            .unwrap();

        let mut req = request("");
        let outcome = router
            .route("t1", &mut req, false, None, &RouteOptions::default())
            .await
            .unwrap();
        assert_eq!(req.model, "claude-3-5-haiku");
        assert_eq!(outcome.provider_name, "anth-1");
    }

    #[tokio::test]
    async fn unroutable_model_reports_no_candidates() {
        let (_store, router) = harness().await;
        let mut req = request("unknown-model");
        let err = router
            .route("t1", &mut req, false, None, &RouteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoCandidates(_)));
        assert_eq!(err.status(), 502);
    }

    #[tokio::test]
    async fn vision_rule_excludes_text_only_secondary() {
        let (store, router) = harness().await;
        store
            .upsert_provider(provider("v", ProviderFamily::OpenAi, true))
            .await
            .unwrap();
        store
            .upsert_provider(provider("t", ProviderFamily::OpenAi, false))
            .await
            .unwrap();
        store
            .upsert_routing_rule(RoutingRule {
                id: "r1".to_string(),
                tenant_id: "t1".to_string(),
                capability: Capability::Vision,
                primary_provider_id: "v".to_string(),
                secondary_provider_id: Some("t".to_string()),
                model: "gpt-4o".to_string(),
            })
            .await
            .unwrap();

        let mut req: ChatRequest = serde_json::from_value(serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": [
                {"type": "image_url", "image_url": "https://x/cat.jpg"}
            ]}]
        }))
        .unwrap();
        let outcome = router
            .route("t1", &mut req, false, None, &RouteOptions::default())
            .await
            .unwrap();
        // The vision-capable primary serves the request; the text-only
        // secondary was never a candidate.
        assert_eq!(outcome.provider_name, "v");
        assert!(!outcome.fallback_used);
    }

    #[tokio::test]
    async fn provider_health_strings_are_written_on_attempts() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let router = Router::new(store.clone(), cache.clone(), false);
        store
            .upsert_provider(provider("oa-1", ProviderFamily::OpenAi, false))
            .await
            .unwrap();
        store
            .upsert_catalog_entry("gpt-4o-mini", ProviderFamily::OpenAi)
            .await
            .unwrap();

        let mut req = request("gpt-4o-mini");
        router
            .route("t1", &mut req, false, None, &RouteOptions::default())
            .await
            .unwrap();
        assert_eq!(
            cache.get("provider_health:oa-1").await.unwrap().as_deref(),
            Some("ok")
        );
    }
}
