use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Observations kept per histogram; older ones are evicted first.
const HISTOGRAM_WINDOW: usize = 4096;

struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        let _ = self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge stored as f64 bits.
struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0f64.to_bits()),
        }
    }
    fn set(&self, v: f64) {
        self.value.store(v.to_bits(), Ordering::Relaxed);
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }
}

struct Histogram {
    observations: Mutex<VecDeque<f64>>,
    total_count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            observations: Mutex::new(VecDeque::new()),
            total_count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: f64) {
        let mut obs = self.observations.lock();
        if obs.len() == HISTOGRAM_WINDOW {
            let _ = obs.pop_front();
        }
        obs.push_back(value);
        let _ = self.total_count.fetch_add(1, Ordering::Relaxed);
    }

    #[allow(clippy::cast_sign_loss)]
    fn summary(&self) -> HistogramSummary {
        let mut sorted: Vec<f64> = self.observations.lock().iter().copied().collect();
        if sorted.is_empty() {
            return HistogramSummary::default();
        }
        sorted.sort_by(f64::total_cmp);
        let len = sorted.len();
        let at = |q: f64| sorted[((len as f64 * q) as usize).min(len - 1)];
        HistogramSummary {
            count: self.total_count.load(Ordering::Relaxed),
            sum: sorted.iter().sum(),
            max: sorted[len - 1],
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

/// Summary statistics over the retained window of a histogram.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    /// Observations ever recorded, including evicted ones.
    pub count: u64,
    pub sum: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

/// Point-in-time copy of every metric, sorted by name then labels.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub counters: Vec<MetricValue>,
    pub gauges: Vec<MetricValue>,
    pub histograms: Vec<(String, Vec<(String, String)>, HistogramSummary)>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        sorted.sort();
        Self {
            name: name.to_string(),
            labels: sorted,
        }
    }
}

/// Thread-safe in-memory metrics recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl std::fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRecorder")
            .field("counters", &self.counters.read().len())
            .field("gauges", &self.gauges.read().len())
            .field("histograms", &self.histograms.read().len())
            .finish()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        if let Some(c) = self.counters.read().get(&key) {
            c.increment(n);
            return;
        }
        self.counters.write().entry(key).or_insert_with(Counter::new).increment(n);
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        if let Some(g) = self.gauges.read().get(&key) {
            g.set(value);
            return;
        }
        self.gauges.write().entry(key).or_insert_with(Gauge::new).set(value);
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        if let Some(h) = self.histograms.read().get(&key) {
            h.observe(value);
            return;
        }
        self.histograms
            .write()
            .entry(key)
            .or_insert_with(Histogram::new)
            .observe(value);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters.read().get(&key).map_or(0, Counter::get)
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = MetricKey::new(name, labels);
        self.gauges.read().get(&key).map_or(0.0, Gauge::get)
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = MetricKey::new(name, labels);
        self.histograms
            .read()
            .get(&key)
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    /// Sum of a counter across every label set.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .read()
            .iter()
            .filter(|(k, _)| k.name == name)
            .map(|(_, c)| c.get())
            .sum()
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn report(&self) -> MetricsReport {
        let mut counters: Vec<MetricValue> = self
            .counters
            .read()
            .iter()
            .map(|(k, c)| MetricValue {
                name: k.name.clone(),
                labels: k.labels.clone(),
                value: c.get() as f64,
            })
            .collect();
        let mut gauges: Vec<MetricValue> = self
            .gauges
            .read()
            .iter()
            .map(|(k, g)| MetricValue {
                name: k.name.clone(),
                labels: k.labels.clone(),
                value: g.get(),
            })
            .collect();
        let mut histograms: Vec<_> = self
            .histograms
            .read()
            .iter()
            .map(|(k, h)| (k.name.clone(), k.labels.clone(), h.summary()))
            .collect();

        counters.sort_by(|a, b| (&a.name, &a.labels).cmp(&(&b.name, &b.labels)));
        gauges.sort_by(|a, b| (&a.name, &a.labels).cmp(&(&b.name, &b.labels)));
        histograms.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));

        MetricsReport {
            counters,
            gauges,
            histograms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_basic() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("bus.publish", &[], 1);
        recorder.counter_inc("bus.publish", &[], 2);
        assert_eq!(recorder.counter_get("bus.publish", &[]), 3);
        assert_eq!(recorder.counter_get("missing", &[]), 0);
    }

    #[test]
    fn label_order_is_irrelevant() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("stage", &[("outcome", "ok"), ("agent", "a")], 1);
        recorder.counter_inc("stage", &[("agent", "a"), ("outcome", "ok")], 1);
        assert_eq!(recorder.counter_get("stage", &[("outcome", "ok"), ("agent", "a")]), 2);
    }

    #[test]
    fn counter_total_sums_label_sets() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("stage", &[("outcome", "ok")], 4);
        recorder.counter_inc("stage", &[("outcome", "failed")], 1);
        assert_eq!(recorder.counter_total("stage"), 5);
    }

    #[test]
    fn gauge_overwrites() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_set("workflows.active", &[], 3.0);
        recorder.gauge_set("workflows.active", &[], -1.5);
        assert!((recorder.gauge_get("workflows.active", &[]) + 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn histogram_percentiles() {
        let recorder = MetricsRecorder::new();
        for i in 1..=100 {
            recorder.histogram_observe("latency", &[], f64::from(i));
        }
        let s = recorder.histogram_summary("latency", &[]);
        assert_eq!(s.count, 100);
        assert!((s.sum - 5050.0).abs() < f64::EPSILON);
        assert!((s.p50 - 51.0).abs() < f64::EPSILON);
        assert!((s.p99 - 100.0).abs() < f64::EPSILON);
        assert!((s.max - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn histogram_window_is_bounded() {
        let recorder = MetricsRecorder::new();
        for i in 0..(HISTOGRAM_WINDOW + 10) {
            recorder.histogram_observe("h", &[], i as f64);
        }
        let s = recorder.histogram_summary("h", &[]);
        assert_eq!(s.count, (HISTOGRAM_WINDOW + 10) as u64);
        assert!(s.p50 >= 10.0);
    }

    #[test]
    fn report_is_sorted() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("b", &[], 1);
        recorder.counter_inc("a", &[], 1);
        recorder.gauge_set("g", &[("k", "v")], 1.0);
        recorder.histogram_observe("h", &[], 1.0);
        let report = recorder.report();
        let names: Vec<&str> = report.counters.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(report.gauges[0].labels, vec![("k".to_string(), "v".to_string())]);
        assert_eq!(report.histograms.len(), 1);
    }
}
