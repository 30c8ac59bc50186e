//! Metrics collection for observability

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_vec_with_registry, register_histogram_with_registry, Counter, CounterVec,
    Histogram, HistogramVec, Opts, Registry,
};
use std::sync::Arc;

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> =
    Lazy::new(|| Arc::new(Metrics::new().expect("Failed to initialize metrics")));

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    // Context build metrics
    pub context_builds: CounterVec,
    pub context_truncations: Counter,
    pub context_messages_dropped: Counter,
    pub context_result_tokens: Histogram,
    pub context_build_duration: HistogramVec,
    pub context_budget_enforcements: Counter,
    pub context_system_only: Counter,

    // Summaries and recall
    pub summaries_created: Counter,
    pub messages_recalled: Counter,
    pub search_requests: CounterVec,

    // Result cache
    pub cache_lookups: CounterVec,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let context_builds = register_counter_vec_with_registry!(
            Opts::new("context_builds_total", "Total context builds by strategy"),
            &["strategy"],
            registry
        )?;

        let context_truncations = register_counter_with_registry!(
            Opts::new("context_truncations_total", "Context builds that dropped messages"),
            registry
        )?;

        let context_messages_dropped = register_counter_with_registry!(
            Opts::new("context_messages_dropped_total", "History messages left out of context"),
            registry
        )?;

        let context_result_tokens = register_histogram_with_registry!(
            "context_result_tokens",
            "Tokens in each context result",
            registry
        )?;

        let context_build_duration = register_histogram_vec_with_registry!(
            "context_build_duration_seconds",
            "Context build duration in seconds",
            &["strategy"],
            registry
        )?;

        let context_budget_enforcements = register_counter_with_registry!(
            Opts::new(
                "context_budget_enforcements_total",
                "Strategy outputs that had to be shed to fit the budget"
            ),
            registry
        )?;

        let context_system_only = register_counter_with_registry!(
            Opts::new(
                "context_system_only_total",
                "Builds where system messages alone exceeded the budget"
            ),
            registry
        )?;

        let summaries_created = register_counter_with_registry!(
            Opts::new("context_summaries_created_total", "Summary messages synthesized"),
            registry
        )?;

        let messages_recalled = register_counter_with_registry!(
            Opts::new("context_messages_recalled_total", "Older messages recalled by search"),
            registry
        )?;

        let search_requests = register_counter_vec_with_registry!(
            Opts::new("context_search_requests_total", "Relevance searches by outcome"),
            &["outcome"],
            registry
        )?;

        let cache_lookups = register_counter_vec_with_registry!(
            Opts::new("context_cache_lookups_total", "Context result cache lookups"),
            &["result"],
            registry
        )?;

        Ok(Self {
            registry,
            context_builds,
            context_truncations,
            context_messages_dropped,
            context_result_tokens,
            context_build_duration,
            context_budget_enforcements,
            context_system_only,
            summaries_created,
            messages_recalled,
            search_requests,
            cache_lookups,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the outcome of one context build
    pub fn record_context_build(
        &self,
        strategy: &str,
        total_tokens: usize,
        original_count: usize,
        preserved_count: usize,
    ) {
        self.context_builds.with_label_values(&[strategy]).inc();
        self.context_result_tokens.observe(total_tokens as f64);
        if preserved_count < original_count {
            self.context_truncations.inc();
            self.context_messages_dropped
                .inc_by((original_count - preserved_count) as f64);
        }
    }

    /// Record a cache lookup
    pub fn record_cache_lookup(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups.with_label_values(&[result]).inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();

        String::from_utf8(buffer).unwrap_or_default()
    }
}
