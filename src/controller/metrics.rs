//! Prometheus metrics for the reach agent
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `reach_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `reach_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `reach_service_oper_state` (gauge): 2 = up, 1 = degraded, 0 = down, labeled by namespace/name.
//! - `reach_endpoints_published` (gauge): endpoint states published by the last pass, labeled by namespace/name.
//! - `reach_stale_endpoint_deletes_total` (counter): stale endpoint deletes labeled by result.
//! - `reach_device_call_failures_total` (counter): failed device calls labeled by operation.
//! - `reach_config_transactions_total` (counter): committed device config transactions.
//! - `reach_pods` (gauge): pod counts labeled by scope (cluster/local).

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::model::ServiceOperState;

/// Labels for reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "service"
    pub controller: String,
}

/// Labels for error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Controller name, e.g. "service"
    pub controller: String,
    /// Error kind/category, e.g. "device", "kube", "decode"
    pub kind: String,
}

/// Labels for per-service metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ServiceLabels {
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    pub result: String, // "deleted" or "failed"
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DeviceCallLabels {
    /// e.g. "telemetry_publish", "route_table"
    pub operation: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PodLabels {
    pub scope: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Gauge tracking the last published state of each service
pub static SERVICE_OPER_STATE: Lazy<Family<ServiceLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Gauge tracking how many endpoint states the last pass published per service
pub static ENDPOINTS_PUBLISHED: Lazy<Family<ServiceLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static STALE_ENDPOINT_DELETES_TOTAL: Lazy<Family<ResultLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static DEVICE_CALL_FAILURES_TOTAL: Lazy<Family<DeviceCallLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static CONFIG_TRANSACTIONS_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

pub static PODS: Lazy<Family<PodLabels, Gauge<i64, AtomicI64>>> = Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "reach_reconcile_duration_seconds",
        "Duration of reconcile passes in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "reach_reconcile_errors",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "reach_service_oper_state",
        "Last published service state (2 = up, 1 = degraded, 0 = down)",
        SERVICE_OPER_STATE.clone(),
    );
    registry.register(
        "reach_endpoints_published",
        "Endpoint states published by the last pass of a service",
        ENDPOINTS_PUBLISHED.clone(),
    );
    registry.register(
        "reach_stale_endpoint_deletes",
        "Total number of stale endpoint deletes",
        STALE_ENDPOINT_DELETES_TOTAL.clone(),
    );
    registry.register(
        "reach_device_call_failures",
        "Total number of failed device calls",
        DEVICE_CALL_FAILURES_TOTAL.clone(),
    );
    registry.register(
        "reach_config_transactions",
        "Total number of committed device config transactions",
        CONFIG_TRANSACTIONS_TOTAL.clone(),
    );
    registry.register("reach_pods", "Pods seen by the agent", PODS.clone());

    registry
});

fn service_labels(namespace: &str, name: &str) -> ServiceLabels {
    ServiceLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn oper_state_value(state: ServiceOperState) -> i64 {
    match state {
        ServiceOperState::Up => 2,
        ServiceOperState::Degraded => 1,
        ServiceOperState::Down => 0,
    }
}

/// Record the state and endpoint count a pass published for a service
pub fn set_service_state(namespace: &str, name: &str, state: ServiceOperState, endpoints: usize) {
    let labels = service_labels(namespace, name);
    SERVICE_OPER_STATE
        .get_or_create(&labels)
        .set(oper_state_value(state));
    ENDPOINTS_PUBLISHED
        .get_or_create(&labels)
        .set(endpoints as i64);
}

/// Stop reporting a deleted service
pub fn remove_service(namespace: &str, name: &str) {
    let labels = service_labels(namespace, name);
    SERVICE_OPER_STATE.remove(&labels);
    ENDPOINTS_PUBLISHED.remove(&labels);
}

pub fn inc_stale_endpoint_deletes(result: &str, count: usize) {
    let labels = ResultLabels {
        result: result.to_string(),
    };
    STALE_ENDPOINT_DELETES_TOTAL
        .get_or_create(&labels)
        .inc_by(count as u64);
}

pub fn inc_device_call_failure(operation: &str) {
    let labels = DeviceCallLabels {
        operation: operation.to_string(),
    };
    DEVICE_CALL_FAILURES_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_config_transaction() {
    CONFIG_TRANSACTIONS_TOTAL.inc();
}

pub fn set_pod_counts(cluster: u32, local: u32) {
    for (scope, count) in [("cluster", cluster), ("local", local)] {
        let labels = PodLabels {
            scope: scope.to_string(),
        };
        PODS.get_or_create(&labels).set(i64::from(count));
    }
}
