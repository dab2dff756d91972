//! Candidate planning: turns an unordered set of provider instances into the
//! ordered trial list. Pure over its inputs; never issues a request.

use axum::http::HeaderMap;

use crate::circuit::{CircuitMap, LatencyTracker};
use crate::store::ProviderInstance;
use crate::types::Capability;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortMode {
    #[default]
    Default,
    Latency,
    Price,
}

/// Per-request routing controls parsed from the optional headers.
#[derive(Debug, Clone)]
pub struct RouteOptions {
    pub sort: SortMode,
    pub only: Option<Vec<String>>,
    pub ignore: Option<Vec<String>>,
    pub order: Option<Vec<String>>,
    pub allow_fallbacks: bool,
    /// BYOK: upstream key supplied by the caller for this request.
    pub api_key_override: Option<String>,
    pub user: Option<String>,
    pub title: Option<String>,
    pub cache: Option<bool>,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            sort: SortMode::Default,
            only: None,
            ignore: None,
            order: None,
            allow_fallbacks: true,
            api_key_override: None,
            user: None,
            title: None,
            cache: None,
        }
    }
}

impl RouteOptions {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        let sort = match header("x-sort").as_deref().map(str::to_ascii_lowercase) {
            Some(ref mode) if mode == "latency" => SortMode::Latency,
            Some(ref mode) if mode == "price" => SortMode::Price,
            _ => SortMode::Default,
        };

        Self {
            sort,
            only: header("x-provider-only").map(|raw| parse_list(&raw)),
            ignore: header("x-provider-ignore").map(|raw| parse_list(&raw)),
            order: header("x-provider-order").map(|raw| parse_list(&raw)),
            allow_fallbacks: header("x-allow-fallbacks")
                .map(|raw| !matches!(raw.to_ascii_lowercase().as_str(), "false" | "0" | "no"))
                .unwrap_or(true),
            api_key_override: header("x-api-key"),
            user: header("x-user"),
            title: header("x-title"),
            cache: header("x-cache")
                .map(|raw| matches!(raw.to_ascii_lowercase().as_str(), "true" | "1" | "yes")),
        }
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

fn matches_ref(provider: &ProviderInstance, reference: &str) -> bool {
    provider.id.eq_ignore_ascii_case(reference) || provider.name.eq_ignore_ascii_case(reference)
}

/// Ordered list of providers to try. Filters run in header-documented order:
/// Only intersects, Ignore subtracts, Order pulls matches to the head while
/// preserving the remainder, then open circuits drop out, the optional sort
/// applies, and disabled fallbacks truncate to a single candidate.
pub fn plan_candidates(
    providers: Vec<ProviderInstance>,
    capability: Capability,
    options: &RouteOptions,
    circuits: &CircuitMap,
    latencies: &LatencyTracker,
    price_for: impl Fn(&ProviderInstance) -> f64,
    now_epoch_secs: u64,
) -> Vec<ProviderInstance> {
    let mut candidates: Vec<ProviderInstance> = providers
        .into_iter()
        .filter(|provider| provider.enabled && provider.supports(capability))
        .collect();

    if let Some(only) = &options.only {
        candidates.retain(|provider| only.iter().any(|item| matches_ref(provider, item)));
    }
    if let Some(ignore) = &options.ignore {
        candidates.retain(|provider| !ignore.iter().any(|item| matches_ref(provider, item)));
    }
    if let Some(order) = &options.order {
        let mut head = Vec::new();
        for item in order {
            while let Some(pos) = candidates
                .iter()
                .position(|provider| matches_ref(provider, item))
            {
                head.push(candidates.remove(pos));
            }
        }
        head.append(&mut candidates);
        candidates = head;
    }

    candidates.retain(|provider| circuits.allow(&provider.id, now_epoch_secs));

    match options.sort {
        SortMode::Default => {}
        SortMode::Latency => {
            // Providers with no latency history sort last.
            candidates.sort_by(|a, b| {
                let left = latencies.ewma_ms(&a.id).unwrap_or(f64::MAX);
                let right = latencies.ewma_ms(&b.id).unwrap_or(f64::MAX);
                left.total_cmp(&right)
            });
        }
        SortMode::Price => {
            candidates.sort_by(|a, b| price_for(a).total_cmp(&price_for(b)));
        }
    }

    if !options.allow_fallbacks {
        candidates.truncate(1);
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ProviderFamily;

    fn provider(id: &str, vision: bool) -> ProviderInstance {
        ProviderInstance {
            id: id.to_string(),
            name: format!("{id}-name"),
            family: ProviderFamily::OpenAi,
            base_url: None,
            api_key: None,
            default_model: None,
            supports_text: true,
            supports_vision: vision,
            enabled: true,
        }
    }

    fn ids(candidates: &[ProviderInstance]) -> Vec<&str> {
        candidates.iter().map(|p| p.id.as_str()).collect()
    }

    fn plan(
        providers: Vec<ProviderInstance>,
        capability: Capability,
        options: &RouteOptions,
        circuits: &CircuitMap,
        latencies: &LatencyTracker,
    ) -> Vec<ProviderInstance> {
        plan_candidates(
            providers,
            capability,
            options,
            circuits,
            latencies,
            |_| 0.002,
            100,
        )
    }

    #[test]
    fn vision_requests_exclude_text_only_providers() {
        let candidates = plan(
            vec![provider("v", true), provider("t", false)],
            Capability::Vision,
            &RouteOptions::default(),
            &CircuitMap::new(),
            &LatencyTracker::new(),
        );
        assert_eq!(ids(&candidates), vec!["v"]);
    }

    #[test]
    fn only_and_ignore_filter_by_id_or_name() {
        let options = RouteOptions {
            only: Some(vec!["a".to_string(), "b-name".to_string()]),
            ignore: Some(vec!["a".to_string()]),
            ..RouteOptions::default()
        };
        let candidates = plan(
            vec![provider("a", false), provider("b", false), provider("c", false)],
            Capability::Text,
            &options,
            &CircuitMap::new(),
            &LatencyTracker::new(),
        );
        assert_eq!(ids(&candidates), vec!["b"]);
    }

    #[test]
    fn order_moves_matches_to_the_head_and_keeps_the_rest() {
        let options = RouteOptions {
            order: Some(vec!["c".to_string(), "a".to_string()]),
            ..RouteOptions::default()
        };
        let candidates = plan(
            vec![provider("a", false), provider("b", false), provider("c", false)],
            Capability::Text,
            &options,
            &CircuitMap::new(),
            &LatencyTracker::new(),
        );
        assert_eq!(ids(&candidates), vec!["c", "a", "b"]);
    }

    #[test]
    fn open_circuits_are_removed() {
        let circuits = CircuitMap::new();
        for _ in 0..10 {
            circuits.record("a", false, 100);
        }
        let candidates = plan(
            vec![provider("a", false), provider("b", false)],
            Capability::Text,
            &RouteOptions::default(),
            &circuits,
            &LatencyTracker::new(),
        );
        assert_eq!(ids(&candidates), vec!["b"]);
    }

    #[test]
    fn latency_sort_prefers_fast_providers_and_unknowns_go_last() {
        let latencies = LatencyTracker::new();
        latencies.observe("slow", 900.0);
        latencies.observe("fast", 80.0);
        let options = RouteOptions {
            sort: SortMode::Latency,
            ..RouteOptions::default()
        };
        let candidates = plan(
            vec![
                provider("slow", false),
                provider("unknown", false),
                provider("fast", false),
            ],
            Capability::Text,
            &options,
            &CircuitMap::new(),
            &latencies,
        );
        assert_eq!(ids(&candidates), vec!["fast", "slow", "unknown"]);
    }

    #[test]
    fn price_sort_orders_ascending() {
        let options = RouteOptions {
            sort: SortMode::Price,
            ..RouteOptions::default()
        };
        let candidates = plan_candidates(
            vec![provider("pricey", false), provider("cheap", false)],
            Capability::Text,
            &options,
            &CircuitMap::new(),
            &LatencyTracker::new(),
            |p| if p.id == "cheap" { 0.001 } else { 0.01 },
            100,
        );
        assert_eq!(ids(&candidates), vec!["cheap", "pricey"]);
    }

    #[test]
    fn disabled_fallbacks_truncate_to_one() {
        let options = RouteOptions {
            allow_fallbacks: false,
            ..RouteOptions::default()
        };
        let candidates = plan(
            vec![provider("a", false), provider("b", false)],
            Capability::Text,
            &options,
            &CircuitMap::new(),
            &LatencyTracker::new(),
        );
        assert_eq!(ids(&candidates), vec!["a"]);
    }

    #[test]
    fn headers_parse_into_options() {
        let mut headers = HeaderMap::new();
        headers.insert("x-sort", "Latency".parse().unwrap());
        headers.insert("x-provider-only", "A, b ,".parse().unwrap());
        headers.insert("x-allow-fallbacks", "false".parse().unwrap());
        headers.insert("x-api-key", "sk-byok".parse().unwrap());
        headers.insert("x-user", "caller-7".parse().unwrap());
        let options = RouteOptions::from_headers(&headers);
        assert_eq!(options.sort, SortMode::Latency);
        assert_eq!(
            options.only,
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert!(!options.allow_fallbacks);
        assert_eq!(options.api_key_override.as_deref(), Some("sk-byok"));
        assert_eq!(options.user.as_deref(), Some("caller-7"));
    }
}
