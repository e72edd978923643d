//! Metrics definitions for the Waiting Room service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `wr_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Queue names are caller-supplied and therefore never used as labels.
//! Remaining labels are bounded by code:
//! - `outcome`: registered, already_registered, error
//! - `source`: scheduler, api
//! - `status`: success, error, timeout, disabled
//! - `operation`: bounded by `QueueStore` methods
//! - `kind`: unavailable, timeout
//! - `result`: hit, miss, valid, invalid

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used by `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Store round-trips should stay in the low milliseconds
        .set_buckets_for_metric(
            Matcher::Prefix("wr_store".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set store latency buckets: {e}"))?
        // Sweeps are bounded by the tick interval (1s by default)
        .set_buckets_for_metric(
            Matcher::Prefix("wr_sweep".to_string()),
            &[0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000],
        )
        .map_err(|e| format!("Failed to set sweep duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Queue Metrics
// ============================================================================

/// Record a registration attempt.
///
/// Metric: `wr_registrations_total`
/// Labels: `outcome`
pub fn record_registration(outcome: &'static str) {
    counter!("wr_registrations_total", "outcome" => outcome).increment(1);
}

/// Record users moved from wait to proceed.
///
/// Metric: `wr_users_promoted_total`
/// Labels: `source` (scheduler, api)
pub fn record_promoted(source: &'static str, count: u64) {
    counter!("wr_users_promoted_total", "source" => source).increment(count);
}

// ============================================================================
// Scheduler Metrics
// ============================================================================

/// Record one scheduler tick.
///
/// Metrics: `wr_sweeps_total`, `wr_sweep_duration_seconds`
/// Labels: `status`
pub fn record_sweep(status: &'static str, duration: Duration) {
    counter!("wr_sweeps_total", "status" => status).increment(1);
    histogram!("wr_sweep_duration_seconds", "status" => status).record(duration.as_secs_f64());
}

/// Record a queue whose promotion failed inside a sweep.
///
/// Metric: `wr_queue_failures_total`
pub fn record_queue_failure() {
    counter!("wr_queue_failures_total").increment(1);
}

/// Set the number of queues found by the latest discovery scan.
///
/// Metric: `wr_queues_discovered`
pub fn set_queues_discovered(count: usize) {
    // usize to f64 is exact for realistic queue counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("wr_queues_discovered").set(count as f64);
}

// ============================================================================
// Store Metrics
// ============================================================================

/// Record the latency of one store call, successful or not.
///
/// Metric: `wr_store_latency_seconds`
/// Labels: `operation`
pub fn record_store_latency(operation: &'static str, duration: Duration) {
    histogram!("wr_store_latency_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

/// Record a failed store call.
///
/// Metric: `wr_store_errors_total`
/// Labels: `operation`, `kind` (unavailable, timeout)
pub fn record_store_error(operation: &'static str, kind: &'static str) {
    counter!("wr_store_errors_total", "operation" => operation, "kind" => kind).increment(1);
}

// ============================================================================
// Token Metrics
// ============================================================================

/// Metric: `wr_token_cache_total`
/// Labels: `result` (hit, miss)
pub fn record_token_cache(result: &'static str) {
    counter!("wr_token_cache_total", "result" => result).increment(1);
}

/// Metric: `wr_token_verifications_total`
/// Labels: `result` (valid, invalid)
pub fn record_token_verification(result: &'static str) {
    counter!("wr_token_verifications_total", "result" => result).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an installed recorder every call is a no-op; these tests pin the
    // function signatures and make sure nothing panics.

    #[test]
    fn test_queue_metrics() {
        record_registration("registered");
        record_registration("already_registered");
        record_registration("error");
        record_promoted("scheduler", 60);
        record_promoted("api", 0);
    }

    #[test]
    fn test_scheduler_metrics() {
        record_sweep("success", Duration::from_millis(12));
        record_sweep("timeout", Duration::from_secs(1));
        record_sweep("disabled", Duration::ZERO);
        record_queue_failure();
        set_queues_discovered(3);
    }

    #[test]
    fn test_store_and_token_metrics() {
        record_store_latency("rank", Duration::from_micros(400));
        record_store_error("move_min", "timeout");
        record_token_cache("hit");
        record_token_verification("invalid");
    }
}
