//! Metrics sink abstraction
//!
//! Counters and histograms are emitted best effort; a sink must never fail
//! the operation being measured, so the trait has no error channel.

use std::collections::HashMap;
use std::sync::Mutex;

/// Metric labels as `(name, value)` pairs
pub type Labels<'a> = &'a [(&'a str, &'a str)];

pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, labels: Labels<'_>);
    fn record_histogram(&self, name: &str, value: f64, labels: Labels<'_>);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &str, _labels: Labels<'_>) {}
    fn record_histogram(&self, _name: &str, _value: f64, _labels: Labels<'_>) {}
}

/// Keeps counters and histogram samples in memory, keyed by name and sorted labels
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
}

impl InMemoryMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter
    #[must_use]
    pub fn counter(&self, name: &str, labels: Labels<'_>) -> u64 {
        self.counters
            .lock()
            .map(|counters| counters.get(&series_key(name, labels)).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Number of samples recorded for a histogram
    #[must_use]
    pub fn histogram_count(&self, name: &str, labels: Labels<'_>) -> usize {
        self.histograms
            .lock()
            .map(|h| h.get(&series_key(name, labels)).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &str, labels: Labels<'_>) {
        match self.counters.lock() {
            Ok(mut counters) => *counters.entry(series_key(name, labels)).or_insert(0) += 1,
            Err(_) => log::warn!("Metrics counter store poisoned, dropping {name}"),
        }
    }

    fn record_histogram(&self, name: &str, value: f64, labels: Labels<'_>) {
        match self.histograms.lock() {
            Ok(mut histograms) => histograms
                .entry(series_key(name, labels))
                .or_default()
                .push(value),
            Err(_) => log::warn!("Metrics histogram store poisoned, dropping {name}"),
        }
    }
}

fn series_key(name: &str, labels: Labels<'_>) -> String {
    let mut sorted: Vec<_> = labels.iter().collect();
    sorted.sort_unstable();
    let rendered: Vec<String> = sorted.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", rendered.join(","))
}
