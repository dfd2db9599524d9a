//! Prometheus metrics.
//!
//! Counters are recorded where the work happens through the `metrics`
//! macros; gauges describing stored state are refreshed when `/metrics` is
//! scraped.

use crate::services::{enrichment::DispatcherStats, storage_service::StorageUsage, vector_index::IndexCounts};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::{sync::OnceLock, time::Duration};
use tracing::warn;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the process-wide recorder on first use and return its handle.
pub fn install_recorder() -> PrometheusHandle {
    HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if metrics::set_global_recorder(recorder).is_err() {
                warn!("a metrics recorder was already installed; /metrics will be empty");
            }
            handle
        })
        .clone()
}

/// One finished HTTP request. `route` is the matched route template.
pub fn record_request(method: &str, route: &str, status: u16, elapsed: Duration) {
    let labels = [
        ("method", method.to_string()),
        ("route", route.to_string()),
        ("status", status.to_string()),
    ];
    counter!("ragstore_http_requests_total", &labels).increment(1);
    histogram!("ragstore_http_request_duration_seconds", &labels).record(elapsed.as_secs_f64());
}

/// Outcome of a credential check: `accepted` or the S3 error code.
pub fn record_auth(result: &'static str) {
    counter!("ragstore_auth_requests_total", "result" => result).increment(1);
}

/// A state change of an enrichment job.
pub fn record_job(event: &'static str) {
    counter!("ragstore_enrichment_jobs_total", "event" => event).increment(1);
}

pub fn record_search(kind: &'static str, results: usize) {
    counter!("ragstore_vector_searches_total", "kind" => kind).increment(1);
    histogram!("ragstore_vector_search_results", "kind" => kind).record(results as f64);
}

pub fn set_storage_gauges(usage: &StorageUsage) {
    gauge!("ragstore_buckets").set(usage.buckets as f64);
    gauge!("ragstore_objects").set(usage.objects as f64);
    gauge!("ragstore_stored_bytes").set(usage.bytes as f64);
}

pub fn set_index_gauges(counts: &IndexCounts, dispatcher: &DispatcherStats) {
    for (status, n) in [
        ("pending", counts.pending),
        ("processing", counts.processing),
        ("complete", counts.complete),
        ("failed", counts.failed),
    ] {
        gauge!("ragstore_embeddings", "status" => status).set(n as f64);
    }
    gauge!("ragstore_enrichment_queue_depth").set(dispatcher.queue_depth as f64);
    gauge!("ragstore_enrichment_workers").set(dispatcher.workers as f64);
}
