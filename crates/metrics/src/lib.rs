//! Small wrapper over the `prometheus` crate used for instrumenting the
//! sync core: counters for protocol events, status histograms for latency.
//!
//! This is the ambient observability layer, not a metrics *presentation*
//! surface (dashboards, scrape endpoints) — wiring a Prometheus exporter is
//! a host concern.
mod macros;
mod timer;

pub use prometheus;
pub use timer::StatusTimer;

/// Increment a plain counter by one.
pub fn log_counter(counter: &prometheus::IntCounter) {
    counter.inc();
}

/// Increment a labeled counter by one.
pub fn log_counter_with_labels(counter: &prometheus::IntCounterVec, label_values: &[&str]) {
    counter.with_label_values(label_values).inc();
}

/// Record a single observation into a histogram.
pub fn log_distribution(histogram: &prometheus::Histogram, value: f64) {
    histogram.observe(value);
}
