//! Prometheus metrics for the database controller. Everything is registered in the
//! default registry on first use; [`preinitialize_metrics`] forces registration so that
//! series exist before the first operation runs.

use database_api::models::DatabaseType;
use once_cell::sync::Lazy;
use prometheus::{
    HistogramVec, IntCounter, IntCounterVec, register_histogram_vec, register_int_counter,
    register_int_counter_vec,
};

use crate::error::PlacementError;

pub(crate) static REGISTRY_OPERATION_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "database_controller_registry_operation_seconds",
        "Latency of registry operations",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .expect("failed to define a metric")
});

pub(crate) static REGISTRY_OPERATION_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "database_controller_registry_operation_errors_total",
        "Number of failed registry operations",
        &["operation"]
    )
    .expect("failed to define a metric")
});

/// Outcome is one of `acquired`, `contended` or `error`.
pub(crate) static LOCK_ACQUISITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "database_controller_lock_acquisitions_total",
        "Attempts to lock a multitenant database record, by outcome",
        &["outcome"]
    )
    .expect("failed to define a metric")
});

pub(crate) static LOCK_RELEASE_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "database_controller_lock_release_failures_total",
        "Lock releases that failed and were left to expire on the registry side"
    )
    .expect("failed to define a metric")
});

/// Outcome is `rolled_back` or `rollback_failed`.
pub(crate) static COUNTER_TAG_ROLLBACKS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "database_controller_counter_tag_rollbacks_total",
        "Counter tag compensations after a failed registry write, by outcome",
        &["outcome"]
    )
    .expect("failed to define a metric")
});

pub(crate) static SQL_CONNECTION_CLOSE_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "database_controller_sql_connection_close_failures_total",
        "SQL connections that failed to close cleanly or were dropped unclosed",
        &["engine", "reason"]
    )
    .expect("failed to define a metric")
});

pub(crate) static LIFECYCLE_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "database_controller_lifecycle_operations_total",
        "Installation database lifecycle operations, by operation, database type and outcome",
        &["operation", "database_type", "outcome"]
    )
    .expect("failed to define a metric")
});

pub fn preinitialize_metrics() {
    Lazy::force(&REGISTRY_OPERATION_LATENCY);
    Lazy::force(&REGISTRY_OPERATION_ERRORS);
    Lazy::force(&LOCK_ACQUISITIONS);
    Lazy::force(&LOCK_RELEASE_FAILURES);
    Lazy::force(&COUNTER_TAG_ROLLBACKS);
    Lazy::force(&SQL_CONNECTION_CLOSE_FAILURES);
    Lazy::force(&LIFECYCLE_OPERATIONS);
}

/// Record the outcome of a lifecycle operation.
pub(crate) fn observe_lifecycle<T>(
    operation: &str,
    database_type: DatabaseType,
    result: &Result<T, PlacementError>,
) {
    let outcome = match result {
        Ok(_) => "success",
        Err(e) => e.kind(),
    };
    LIFECYCLE_OPERATIONS
        .with_label_values(&[operation, database_type.as_tag_value(), outcome])
        .inc();
}
