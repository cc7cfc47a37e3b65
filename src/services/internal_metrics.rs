//! Internal metrics
//!
//! The collector's own health counters, kept in a `prometheus::Registry`
//! and rendered with the standard text encoder on the /metrics endpoint.
//! `collector_errors_total{component, kind}` is always present once any
//! component reported an error.

use dashmap::DashMap;
use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

pub struct InternalMetrics {
    registry: Registry,
    /// collector_errors_total{component, kind}
    errors: IntCounterVec,
    /// collector_stage_dropped_total{stage}
    stage_drops: IntCounterVec,
    /// collector_stage_records_total{stage, direction}, set at scrape time
    /// from the pipeline's atomic stage counters
    stage_records: IntGaugeVec,
    /// collector_stage_errors_total{stage}
    stage_errors: IntGaugeVec,
    /// collector_adapters
    adapters: IntGauge,
    /// Free-form counters (scrape cycles, exported batches, ...), registered
    /// on first use
    counters: DashMap<String, IntCounter>,
}

impl Default for InternalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl InternalMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let errors = IntCounterVec::new(
            Opts::new("collector_errors_total", "Errors observed, by component and kind"),
            &["component", "kind"],
        )
        .expect("errors metric");
        let stage_drops = IntCounterVec::new(
            Opts::new("collector_stage_dropped_total", "Records dropped per pipeline stage"),
            &["stage"],
        )
        .expect("stage drop metric");
        let stage_records = IntGaugeVec::new(
            Opts::new("collector_stage_records_total", "Records entering and leaving each stage"),
            &["stage", "direction"],
        )
        .expect("stage records metric");
        let stage_errors = IntGaugeVec::new(
            Opts::new("collector_stage_errors_total", "Stage-level errors and contained panics"),
            &["stage"],
        )
        .expect("stage errors metric");
        let adapters =
            IntGauge::new("collector_adapters", "Registered database adapters").expect("adapters metric");

        registry.register(Box::new(errors.clone())).expect("register errors");
        registry.register(Box::new(stage_drops.clone())).expect("register stage drops");
        registry.register(Box::new(stage_records.clone())).expect("register stage records");
        registry.register(Box::new(stage_errors.clone())).expect("register stage errors");
        registry.register(Box::new(adapters.clone())).expect("register adapters");

        Self {
            registry,
            errors,
            stage_drops,
            stage_records,
            stage_errors,
            adapters,
            counters: DashMap::new(),
        }
    }

    pub fn record_error(&self, component: &str, kind: &str) {
        self.errors.with_label_values(&[component, kind]).inc();
    }

    pub fn record_stage_drop(&self, stage: &str, count: u64) {
        self.stage_drops.with_label_values(&[stage]).inc_by(count);
    }

    pub fn incr(&self, name: &str, count: u64) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| {
                let counter =
                    IntCounter::new(name.to_string(), format!("Collector counter {}", name))
                        .expect("counter name");
                if let Err(e) = self.registry.register(Box::new(counter.clone())) {
                    tracing::warn!("Could not register counter '{}': {}", name, e);
                }
                counter
            })
            .inc_by(count);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).map(|c| c.get()).unwrap_or(0)
    }

    pub fn error_count(&self, component: &str, kind: &str) -> u64 {
        self.errors.with_label_values(&[component, kind]).get()
    }

    /// Scrape-time refresh of the per-stage counters
    pub fn set_stage_stats(&self, stage: &str, records_in: u64, records_out: u64, errors: u64) {
        self.stage_records.with_label_values(&[stage, "in"]).set(records_in as i64);
        self.stage_records.with_label_values(&[stage, "out"]).set(records_out as i64);
        self.stage_errors.with_label_values(&[stage]).set(errors as i64);
    }

    pub fn set_adapters(&self, count: i64) {
        self.adapters.set(count);
    }

    /// Text exposition of everything in the registry
    pub fn render_prometheus(&self) -> String {
        match TextEncoder::new().encode_to_string(&self.registry.gather()) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("Metrics encoding failed: {}", e);
                String::new()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_counter_accumulates() {
        let m = InternalMetrics::new();
        m.record_error("scraper", "query");
        m.record_error("scraper", "query");
        m.record_error("exporter", "export");
        assert_eq!(m.error_count("scraper", "query"), 2);
        assert_eq!(m.error_count("exporter", "export"), 1);
        assert_eq!(m.error_count("scraper", "connection"), 0);
    }

    #[test]
    fn test_prometheus_rendering() {
        let m = InternalMetrics::new();
        m.record_error("scraper", "query");
        m.record_stage_drop("adaptive_sampler", 7);
        m.incr("collector_scrape_cycles_total", 3);
        m.set_stage_stats("adaptive_sampler", 10, 3, 0);

        let text = m.render_prometheus();
        assert!(text.contains("collector_errors_total{component=\"scraper\",kind=\"query\"} 1"));
        assert!(text.contains("collector_stage_dropped_total{stage=\"adaptive_sampler\"} 7"));
        assert!(text.contains("collector_scrape_cycles_total 3"));
        assert!(
            text.contains("collector_stage_records_total{direction=\"in\",stage=\"adaptive_sampler\"} 10")
        );
    }

    #[test]
    fn test_lazy_counters_register_once() {
        let m = InternalMetrics::new();
        m.incr("collector_records_received_total", 5);
        m.incr("collector_records_received_total", 2);
        assert_eq!(m.counter("collector_records_received_total"), 7);
        assert_eq!(m.counter("collector_never_seen_total"), 0);
    }
}
