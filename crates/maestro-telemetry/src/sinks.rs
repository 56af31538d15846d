use crate::recorder::MetricsRecorder;

/// Destination for engine metrics. Injected into the bus, scheduler and
/// coordinator so tests can observe what production exports.
pub trait MetricsSink: Send + Sync {
    fn counter(&self, name: &str, labels: &[(&str, &str)], n: u64);
    fn gauge(&self, name: &str, labels: &[(&str, &str)], value: f64);
    fn timing(&self, name: &str, labels: &[(&str, &str)], millis: f64);
}

impl MetricsSink for MetricsRecorder {
    fn counter(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.counter_inc(name, labels, n);
    }

    fn gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.gauge_set(name, labels, value);
    }

    fn timing(&self, name: &str, labels: &[(&str, &str)], millis: f64) {
        self.histogram_observe(name, labels, millis);
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn counter(&self, _name: &str, _labels: &[(&str, &str)], _n: u64) {}
    fn gauge(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
    fn timing(&self, _name: &str, _labels: &[(&str, &str)], _millis: f64) {}
}

/// Forwards to the `metrics` facade, so whichever exporter the host
/// installs receives engine metrics.
#[derive(Clone, Copy, Debug, Default)]
pub struct FacadeMetrics;

fn facade_labels(labels: &[(&str, &str)]) -> Vec<metrics::Label> {
    labels
        .iter()
        .map(|(k, v)| metrics::Label::new((*k).to_string(), (*v).to_string()))
        .collect()
}

impl MetricsSink for FacadeMetrics {
    fn counter(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        metrics::counter!(name.to_string(), facade_labels(labels)).increment(n);
    }

    fn gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        metrics::gauge!(name.to_string(), facade_labels(labels)).set(value);
    }

    fn timing(&self, name: &str, labels: &[(&str, &str)], millis: f64) {
        metrics::histogram!(name.to_string(), facade_labels(labels)).record(millis);
    }
}
