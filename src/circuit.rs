//! Per-provider failure detection shared by every in-flight request.
//!
//! A bounded ring of recent outcomes per provider; once at least ten samples
//! exist and at least half failed, the circuit opens for a cooldown. There is
//! no half-open probe state: the first request after the cooldown re-enters
//! the ring and either confirms recovery or re-opens the circuit.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

pub const WINDOW_SIZE: usize = 20;
pub const MIN_SAMPLES: usize = 10;
pub const FAILURE_THRESHOLD: f64 = 0.5;
pub const COOLDOWN_SECS: u64 = 30;

#[derive(Debug, Default)]
pub struct CircuitBreaker {
    samples: VecDeque<bool>,
    open_until_epoch_secs: u64,
}

impl CircuitBreaker {
    pub fn allow(&self, now_epoch_secs: u64) -> bool {
        now_epoch_secs >= self.open_until_epoch_secs
    }

    pub fn record(&mut self, ok: bool, now_epoch_secs: u64) {
        self.samples.push_back(ok);
        while self.samples.len() > WINDOW_SIZE {
            self.samples.pop_front();
        }
        if self.samples.len() < MIN_SAMPLES {
            return;
        }
        let failures = self.samples.iter().filter(|ok| !**ok).count();
        let rate = failures as f64 / self.samples.len() as f64;
        if rate >= FAILURE_THRESHOLD {
            self.open_until_epoch_secs = now_epoch_secs.saturating_add(COOLDOWN_SECS);
        }
    }
}

/// Map of provider id to circuit state. Entries are created lazily on first
/// access and retained for process life; the outer lock only guards the map,
/// each entry has its own mutex for the ring and open-until.
#[derive(Debug, Default)]
pub struct CircuitMap {
    inner: RwLock<HashMap<String, Arc<Mutex<CircuitBreaker>>>>,
}

impl CircuitMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, provider_id: &str) -> Arc<Mutex<CircuitBreaker>> {
        {
            let map = self
                .inner
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(state) = map.get(provider_id) {
                return Arc::clone(state);
            }
        }
        let mut map = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            map.entry(provider_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(CircuitBreaker::default()))),
        )
    }

    pub fn allow(&self, provider_id: &str, now_epoch_secs: u64) -> bool {
        let state = self.entry(provider_id);
        let state = state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.allow(now_epoch_secs)
    }

    pub fn record(&self, provider_id: &str, ok: bool, now_epoch_secs: u64) {
        let state = self.entry(provider_id);
        let mut state = state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.record(ok, now_epoch_secs);
    }

    /// provider id -> circuit currently open, for dashboards.
    pub fn open_states(&self, now_epoch_secs: u64) -> HashMap<String, bool> {
        let map = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        map.iter()
            .map(|(id, state)| {
                let state = state
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                (id.clone(), !state.allow(now_epoch_secs))
            })
            .collect()
    }
}

const EWMA_ALPHA: f64 = 0.3;

/// Exponentially-weighted recent latency per provider, consulted by
/// `X-Sort: latency` candidate ordering.
#[derive(Debug, Default)]
pub struct LatencyTracker {
    inner: Mutex<HashMap<String, f64>>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, provider_id: &str, millis: f64) {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = map.entry(provider_id.to_string()).or_insert(millis);
        *entry = EWMA_ALPHA * millis + (1.0 - EWMA_ALPHA) * *entry;
    }

    pub fn ewma_ms(&self, provider_id: &str) -> Option<f64> {
        let map = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        map.get(provider_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_stays_closed_below_min_samples() {
        let mut circuit = CircuitBreaker::default();
        for _ in 0..9 {
            circuit.record(false, 100);
        }
        assert!(circuit.allow(100));
    }

    #[test]
    fn circuit_opens_at_tenth_failure_and_recovers_after_cooldown() {
        let mut circuit = CircuitBreaker::default();
        for _ in 0..10 {
            circuit.record(false, 100);
        }
        assert!(!circuit.allow(100));
        assert!(!circuit.allow(100 + COOLDOWN_SECS - 1));
        // First request after the cooldown goes through again.
        assert!(circuit.allow(100 + COOLDOWN_SECS + 1));
    }

    #[test]
    fn circuit_stays_closed_under_half_failure_rate() {
        let mut circuit = CircuitBreaker::default();
        for i in 0..20 {
            // 9 failures in a window of 20 keeps the rate below 0.5.
            circuit.record(i % 20 >= 9, 100);
        }
        assert!(circuit.allow(100));
    }

    #[test]
    fn ring_is_bounded_so_old_failures_age_out() {
        let mut circuit = CircuitBreaker::default();
        for _ in 0..10 {
            circuit.record(false, 100);
        }
        assert!(!circuit.allow(100));
        // 20 successes push every failure out of the window; recording at a
        // later time must not re-open the circuit.
        let later = 100 + COOLDOWN_SECS + 1;
        for _ in 0..20 {
            circuit.record(true, later);
        }
        assert!(circuit.allow(later));
    }

    #[test]
    fn map_creates_entries_lazily_and_tracks_open_state() {
        let map = CircuitMap::new();
        assert!(map.allow("p1", 100));
        for _ in 0..10 {
            map.record("p1", false, 100);
        }
        assert!(!map.allow("p1", 100));
        let states = map.open_states(100);
        assert_eq!(states.get("p1"), Some(&true));
    }

    #[test]
    fn ewma_moves_toward_recent_samples() {
        let tracker = LatencyTracker::new();
        tracker.observe("p1", 100.0);
        tracker.observe("p1", 200.0);
        let ewma = tracker.ewma_ms("p1").unwrap();
        assert!(ewma > 100.0 && ewma < 200.0);
        assert!(tracker.ewma_ms("p2").is_none());
    }
}
