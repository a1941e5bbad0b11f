//! Prometheus metrics for fee-ledger-service.
//!
//! Ledger counters live in the default `prometheus` registry. HTTP request
//! metrics recorded through the `metrics` facade by the service-core
//! middleware are rendered from the installed exporter handle.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Webhook deliveries by event type and outcome.
pub static WEBHOOK_EVENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fee_ledger_webhook_events_total",
        "Total number of gateway webhook deliveries",
        &["event", "outcome"]
    )
    .expect("Failed to register webhook_events_total")
});

/// Reconciliation attempts by outcome (applied, already_processed, error kind).
pub static RECONCILIATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fee_ledger_reconciliations_total",
        "Total number of payment reconciliations",
        &["outcome"]
    )
    .expect("Failed to register reconciliations_total")
});

/// Compensations by kind (refund, move_to_advance) and status.
pub static COMPENSATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fee_ledger_compensations_total",
        "Total number of compensating actions",
        &["kind", "status"]
    )
    .expect("Failed to register compensations_total")
});

/// Office fee collections by payment method and status.
pub static FEE_COLLECTIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fee_ledger_fee_collections_total",
        "Total number of fee collections recorded at the school office",
        &["method", "status"]
    )
    .expect("Failed to register fee_collections_total")
});

/// Events that need a human: unknown transactions, amount mismatches,
/// invariant violations.
pub static LEDGER_ALERTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fee_ledger_alerts_total",
        "Total number of ledger alerts by kind",
        &["kind"]
    )
    .expect("Failed to register ledger_alerts_total")
});

/// Lock contention retries by operation.
pub static LOCK_RETRIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fee_ledger_lock_retries_total",
        "Total number of retries after deadlock or serialization failure",
        &["operation"]
    )
    .expect("Failed to register lock_retries_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "fee_ledger_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Initialize all metrics and install the HTTP metrics recorder.
///
/// Safe to call more than once; later calls keep the first recorder.
pub fn init_metrics() {
    Lazy::force(&WEBHOOK_EVENTS_TOTAL);
    Lazy::force(&RECONCILIATIONS_TOTAL);
    Lazy::force(&COMPENSATIONS_TOTAL);
    Lazy::force(&FEE_COLLECTIONS_TOTAL);
    Lazy::force(&LEDGER_ALERTS_TOTAL);
    Lazy::force(&LOCK_RETRIES_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);

    if METRICS_HANDLE.get().is_some() {
        return;
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = METRICS_HANDLE.set(handle);
        }
        Err(e) => tracing::warn!(error = %e, "Prometheus recorder already installed"),
    }
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_default();

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    output.push_str(&encoder.encode_to_string(&metric_families).unwrap_or_default());
    output
}

pub fn record_alert(kind: &str) {
    LEDGER_ALERTS_TOTAL.with_label_values(&[kind]).inc();
}
