//! Observability sink for the request path, exposed as Prometheus text.
//!
//! Counters and histograms are plain maps rendered on demand; label keys are
//! fixed at the call sites so series stay stable.

use std::collections::BTreeMap;
use std::sync::Mutex;

pub trait MetricsSink: Send + Sync {
    fn record_request(&self, provider: &str, status: u16);
    fn observe_latency_ms(&self, provider: &str, millis: f64);
    fn observe_ttft_ms(&self, provider: &str, millis: f64);
    /// Prometheus text exposition of everything recorded so far.
    fn render(&self) -> String;
}

/// Linear buckets from 50 ms to 1000 ms in 50 ms steps.
const BUCKET_START: f64 = 50.0;
const BUCKET_WIDTH: f64 = 50.0;
const BUCKET_COUNT: usize = 20;

#[derive(Debug, Clone)]
struct Histogram {
    bucket_counts: Vec<u64>,
    count: u64,
    sum: f64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            bucket_counts: vec![0; BUCKET_COUNT],
            count: 0,
            sum: 0.0,
        }
    }

    fn observe(&mut self, value: f64) {
        for (idx, counter) in self.bucket_counts.iter_mut().enumerate() {
            let upper = BUCKET_START + BUCKET_WIDTH * idx as f64;
            if value <= upper {
                *counter += 1;
            }
        }
        self.count += 1;
        self.sum += value;
    }
}

#[derive(Debug, Default)]
struct Inner {
    requests_total: BTreeMap<(String, u16), u64>,
    latency_ms: BTreeMap<String, Histogram>,
    ttft_ms: BTreeMap<String, Histogram>,
}

#[derive(Debug, Default)]
pub struct PrometheusMetrics {
    inner: Mutex<Inner>,
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_request(&self, provider: &str, status: u16) {
        let mut inner = self.lock();
        *inner
            .requests_total
            .entry((provider.to_string(), status))
            .or_insert(0) += 1;
    }

    fn observe_latency_ms(&self, provider: &str, millis: f64) {
        let mut inner = self.lock();
        inner
            .latency_ms
            .entry(provider.to_string())
            .or_insert_with(Histogram::new)
            .observe(millis);
    }

    fn observe_ttft_ms(&self, provider: &str, millis: f64) {
        let mut inner = self.lock();
        inner
            .ttft_ms
            .entry(provider.to_string())
            .or_insert_with(Histogram::new)
            .observe(millis);
    }

    fn render(&self) -> String {
        let inner = self.lock();
        let mut out = String::new();

        out.push_str("# HELP routerx_requests_total Total requests.\n");
        out.push_str("# TYPE routerx_requests_total counter\n");
        for ((provider, status), count) in &inner.requests_total {
            out.push_str(&format!(
                "routerx_requests_total{{provider=\"{}\",status=\"{status}\"}} {count}\n",
                escape_label(provider),
            ));
        }

        write_histogram_map(
            &mut out,
            "routerx_latency_ms",
            "Request latency in ms.",
            &inner.latency_ms,
        );
        write_histogram_map(
            &mut out,
            "routerx_ttft_ms",
            "Time to first token in ms.",
            &inner.ttft_ms,
        );

        out
    }
}

fn write_histogram_map(
    out: &mut String,
    name: &str,
    help: &str,
    histograms: &BTreeMap<String, Histogram>,
) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} histogram\n"));
    for (provider, histogram) in histograms {
        let provider = escape_label(provider);
        for (idx, count) in histogram.bucket_counts.iter().enumerate() {
            let upper = BUCKET_START + BUCKET_WIDTH * idx as f64;
            out.push_str(&format!(
                "{name}_bucket{{provider=\"{provider}\",le=\"{upper}\"}} {count}\n"
            ));
        }
        out.push_str(&format!(
            "{name}_bucket{{provider=\"{provider}\",le=\"+Inf\"}} {}\n",
            histogram.count
        ));
        out.push_str(&format!(
            "{name}_sum{{provider=\"{provider}\"}} {}\n",
            histogram.sum
        ));
        out.push_str(&format!(
            "{name}_count{{provider=\"{provider}\"}} {}\n",
            histogram.count
        ));
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
