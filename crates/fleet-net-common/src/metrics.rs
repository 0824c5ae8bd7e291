//! Metrics registry for fleet networking observability
//!
//! Provides OpenTelemetry metrics for:
//! - Service export latency (member agent, observed on report-back)
//! - Azure Traffic Manager API latency
//! - Reconciliation duration per controller

use std::future::Future;
use std::time::Instant;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for fleet networking metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("fleet-networking"));

/// Histogram buckets shared by the millisecond latency metrics
pub const EXPORT_DURATION_MILLISECONDS_BUCKETS: [f64; 6] =
    [1000.0, 2500.0, 5000.0, 10000.0, 25000.0, 50000.0];

/// Largest export duration recorded; longer exports are clamped to it
pub const EXPORT_DURATION_RIGHT_BOUND: f64 = 100_000.0;

/// Recorded when the export start time is missing or in the future
const EXPORT_DURATION_FALLBACK_MILLIS: f64 = 1000.0;

// ============================================================================
// Export Metrics
// ============================================================================

/// Histogram of the time from a Service change to the hub's conflict decision
/// reaching the member cluster
///
/// Labels:
/// - `originClusterID`: the exporting member cluster
pub static SERVICE_EXPORT_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("fleet_networking_service_export_duration_milliseconds")
        .with_description("The duration of a service export")
        .with_unit("ms")
        .with_boundaries(EXPORT_DURATION_MILLISECONDS_BUCKETS.to_vec())
        .build()
});

// ============================================================================
// Traffic Manager Metrics
// ============================================================================

/// Histogram of Azure Traffic Manager API latency
///
/// Labels:
/// - `operation`: get, create_or_update, delete
/// - `success`: true, false
/// - `resource_type`: profile, endpoint
pub static TRAFFIC_MANAGER_API_LATENCY: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("fleet_networking_traffic_manager_arm_api_latency_milliseconds")
        .with_description("Latency of Azure Traffic Manager API requests in milliseconds")
        .with_unit("ms")
        .with_boundaries(EXPORT_DURATION_MILLISECONDS_BUCKETS.to_vec())
        .build()
});

// ============================================================================
// Reconcile Metrics
// ============================================================================

/// Histogram of reconciliation duration
///
/// Labels:
/// - `controller`: controller name
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("fleet_networking_reconcile_duration_seconds")
        .with_description("Duration of reconciliation in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Export duration in milliseconds as recorded by [`record_service_export_duration`]
///
/// A missing or future start time records the fallback of one second, and
/// durations beyond [`EXPORT_DURATION_RIGHT_BOUND`] are clamped to it.
pub fn export_duration_millis(exported_since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let millis = exported_since
        .map(|since| (now - since).num_milliseconds())
        .unwrap_or(0);
    if millis <= 0 {
        return EXPORT_DURATION_FALLBACK_MILLIS;
    }
    (millis as f64).min(EXPORT_DURATION_RIGHT_BOUND)
}

/// Observe one service export
pub fn record_service_export_duration(origin_cluster_id: &str, millis: f64) {
    SERVICE_EXPORT_DURATION.record(
        millis,
        &[KeyValue::new("originClusterID", origin_cluster_id.to_string())],
    );
}

/// Times one reconciliation
pub struct ReconcileTimer {
    controller: &'static str,
    start: Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start(controller: &'static str) -> Self {
        Self {
            controller,
            start: Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        self.record("success");
    }

    /// Record error completion
    pub fn error(self) {
        self.record("error");
    }

    fn record(self, result: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("controller", self.controller),
                KeyValue::new("result", result),
            ],
        );
    }
}

/// Await a reconcile and record its duration under `controller`
pub async fn observe_reconcile<T, E, F>(controller: &'static str, reconcile: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    let timer = ReconcileTimer::start(controller);
    let result = reconcile.await;
    match &result {
        Ok(_) => timer.success(),
        Err(_) => timer.error(),
    }
    result
}

/// Times one Azure Traffic Manager API call
pub struct ApiTimer {
    operation: &'static str,
    resource_type: &'static str,
    start: Instant,
}

impl ApiTimer {
    /// Start timing a call
    pub fn start(operation: &'static str, resource_type: &'static str) -> Self {
        Self {
            operation,
            resource_type,
            start: Instant::now(),
        }
    }

    /// Record the call outcome
    pub fn complete(self, success: bool) {
        TRAFFIC_MANAGER_API_LATENCY.record(
            self.start.elapsed().as_secs_f64() * 1000.0,
            &[
                KeyValue::new("operation", self.operation),
                KeyValue::new("success", success.to_string()),
                KeyValue::new("resource_type", self.resource_type),
            ],
        );
    }
}
