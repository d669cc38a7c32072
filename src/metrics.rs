//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Sync metrics
    pub static ref SYNC_PAGES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("roost_sync_pages_total", "Total number of relation pages fetched"),
        &["endpoint"]
    ).expect("metric can be created");
    pub static ref EDGES_UPSERTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("roost_edges_upserted_total", "Total number of edges upserted during syncs"),
        &["relation"]
    ).expect("metric can be created");
    pub static ref RATE_LIMITS_HIT_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("roost_rate_limits_hit_total", "Total number of remote rate limits encountered"),
        &["endpoint"]
    ).expect("metric can be created");

    // Queue metrics
    pub static ref JOBS_PROCESSED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("roost_jobs_processed_total", "Job invocations by kind and outcome"),
        &["kind", "outcome"]
    ).expect("metric can be created");
    pub static ref JOBS_LIVE: IntGauge = IntGauge::new(
        "roost_jobs_live",
        "Current number of waiting/active/delayed jobs"
    ).expect("metric can be created");

    // Search metrics
    pub static ref SEARCH_QUERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("roost_search_queries_total", "Search queries by outcome"),
        &["outcome"]
    ).expect("metric can be created");

    // Error metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("roost_errors_total", "Errors surfaced to callers by type"),
        &["error_type"]
    ).expect("metric can be created");

    // Application metrics
    pub static ref REMOTE_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("roost_remote_requests_total", "Remote API requests by endpoint and status"),
        &["endpoint", "status"]
    ).expect("metric can be created");
    pub static ref MUTATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("roost_mutations_total", "Remote graph mutations by relation and action"),
        &["relation", "action"]
    ).expect("metric can be created");
}

/// Register all instruments with the global registry.
///
/// Must be called once at startup; duplicate registration is ignored so
/// tests can call it repeatedly.
pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(SYNC_PAGES_TOTAL.clone()),
        Box::new(EDGES_UPSERTED_TOTAL.clone()),
        Box::new(RATE_LIMITS_HIT_TOTAL.clone()),
        Box::new(JOBS_PROCESSED_TOTAL.clone()),
        Box::new(JOBS_LIVE.clone()),
        Box::new(SEARCH_QUERIES_TOTAL.clone()),
        Box::new(ERRORS_TOTAL.clone()),
        Box::new(REMOTE_REQUESTS_TOTAL.clone()),
        Box::new(MUTATIONS_TOTAL.clone()),
    ];

    for collector in collectors {
        // Already-registered collectors are fine (repeated test setup).
        let _ = REGISTRY.register(collector);
    }
}

/// Render all registered metrics in the Prometheus text format.
pub fn gather() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(error) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!(%error, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
