//! Metrics collection utilities.
//!
//! Provides aggregated global and per-provider solve statistics with latency
//! percentiles for observability.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::tasks::error::SolveErrorKind;

/// Aggregated metrics across all providers.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub submitted: u64,
    pub solved: u64,
    pub failed: u64,
    pub average_latency: Option<Duration>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            submitted: 0,
            solved: 0,
            failed: 0,
            average_latency: None,
        }
    }
}

/// Provider-scoped metrics snapshot.
#[derive(Debug, Clone)]
pub struct ProviderStats {
    pub provider: String,
    pub submitted: u64,
    pub solved: u64,
    pub failures: HashMap<SolveErrorKind, u64>,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

impl ProviderStats {
    fn from_accumulator(provider: &str, acc: &ProviderAccumulator) -> Self {
        let (avg, p95) = acc.latency_stats();
        Self {
            provider: provider.to_string(),
            submitted: acc.submitted,
            solved: acc.solved,
            failures: acc.failures.clone(),
            average_latency: avg,
            p95_latency: p95,
        }
    }

    pub fn failed(&self) -> u64 {
        self.failures.values().sum()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub providers: Vec<ProviderStats>,
}

#[derive(Debug)]
struct ProviderAccumulator {
    submitted: u64,
    solved: u64,
    failures: HashMap<SolveErrorKind, u64>,
    latencies: VecDeque<Duration>,
    max_window: usize,
}

impl ProviderAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            submitted: 0,
            solved: 0,
            failures: HashMap::new(),
            latencies: VecDeque::with_capacity(max_window),
            max_window,
        }
    }

    fn record_latency(&mut self, latency: Duration) {
        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        if self.latencies.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.latencies.iter().cloned().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        (Some(Duration::from_secs_f64(avg)), Some(samples[p95_index]))
    }
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    max_window: usize,
    providers: HashMap<String, ProviderAccumulator>,
}

impl MetricsState {
    fn new(max_window: usize) -> Self {
        Self {
            global: GlobalStats::default(),
            max_window,
            providers: HashMap::new(),
        }
    }

    fn accumulator_mut(&mut self, provider: &str) -> &mut ProviderAccumulator {
        self.providers
            .entry(provider.to_string())
            .or_insert_with(|| ProviderAccumulator::new(self.max_window))
    }
}

/// Thread-safe metrics collector shared by every solve of a broker.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(128))),
        }
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16)))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_submitted(&self, provider: &str) {
        let mut guard = self.lock();
        guard.global.submitted += 1;
        guard.accumulator_mut(provider).submitted += 1;
    }

    pub fn record_solved(&self, provider: &str, latency: Duration) {
        let mut guard = self.lock();
        guard.global.solved += 1;
        guard.global.average_latency = Some(match guard.global.average_latency {
            Some(avg) => {
                Duration::from_secs_f64((avg.as_secs_f64() * 0.9) + (latency.as_secs_f64() * 0.1))
            }
            None => latency,
        });

        let acc = guard.accumulator_mut(provider);
        acc.solved += 1;
        acc.record_latency(latency);
    }

    pub fn record_failure(&self, provider: &str, kind: SolveErrorKind) {
        let mut guard = self.lock();
        guard.global.failed += 1;
        *guard.accumulator_mut(provider).failures.entry(kind).or_default() += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.lock();
        let providers = guard
            .providers
            .iter()
            .map(|(provider, acc)| ProviderStats::from_accumulator(provider, acc))
            .collect();
        MetricsSnapshot {
            global: guard.global.clone(),
            providers,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_solves_and_failures() {
        let metrics = MetricsCollector::new();
        metrics.record_submitted("twocaptcha");
        metrics.record_submitted("twocaptcha");
        metrics.record_solved("twocaptcha", Duration::from_secs(12));
        metrics.record_failure("twocaptcha", SolveErrorKind::Timeout);

        let snapshot = metrics.snapshot();
        let provider = snapshot
            .providers
            .iter()
            .find(|p| p.provider == "twocaptcha")
            .unwrap();
        assert_eq!(provider.submitted, 2);
        assert_eq!(provider.solved, 1);
        assert_eq!(provider.failed(), 1);
        assert_eq!(provider.failures.get(&SolveErrorKind::Timeout), Some(&1));
        assert_eq!(provider.p95_latency, Some(Duration::from_secs(12)));
    }
}
