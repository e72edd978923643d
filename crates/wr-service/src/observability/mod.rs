//! Observability for the Waiting Room service.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Queue names appear in logs but never as metric labels.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `wr_registrations_total` | Counter | `outcome` |
//! | `wr_users_promoted_total` | Counter | `source` |
//! | `wr_sweeps_total` | Counter | `status` |
//! | `wr_sweep_duration_seconds` | Histogram | `status` |
//! | `wr_queue_failures_total` | Counter | none |
//! | `wr_queues_discovered` | Gauge | none |
//! | `wr_store_latency_seconds` | Histogram | `operation` |
//! | `wr_store_errors_total` | Counter | `operation`, `kind` |
//! | `wr_token_cache_total` | Counter | `result` |
//! | `wr_token_verifications_total` | Counter | `result` |

pub mod health;
pub mod metrics;

pub use health::{
    health_router, check_store, spawn_store_check, HealthState, STORE_CHECK_INTERVAL,
};
pub use metrics::init_metrics_recorder;
