//! Prometheus metrics for the Vault config operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `vault_reconcile_duration_seconds` (histogram): cycle duration labeled by kind.
//! - `vault_reconcile_errors_total` (counter): failed cycles labeled by kind and error class.
//! - `vault_remote_writes_total` (counter): Vault mutations labeled by kind and operation.
//! - `vault_logins_total` (counter): login exchanges labeled by outcome.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Resource kind, e.g. "DatabaseSecretEngineStaticRole"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub kind: String,
    /// "validation", "auth", "transient" or "conflict"
    pub class: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WriteLabels {
    pub kind: String,
    /// "create", "update" or "delete"
    pub operation: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LoginLabels {
    /// "success" or "failure"
    pub outcome: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static REMOTE_WRITES_TOTAL: Lazy<Family<WriteLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static LOGINS_TOTAL: Lazy<Family<LoginLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global registry served by the REST API
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "vault_reconcile_duration_seconds",
        "Duration of a reconcile cycle in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "vault_reconcile_errors_total",
        "Reconcile cycles that ended in an error, by error class",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "vault_remote_writes_total",
        "Create, update and delete calls issued to Vault",
        REMOTE_WRITES_TOTAL.clone(),
    );
    registry.register(
        "vault_logins_total",
        "Vault login exchanges by outcome",
        LOGINS_TOTAL.clone(),
    );

    registry
});

pub fn observe_reconcile_duration_seconds(kind: &str, seconds: f64) {
    let labels = ReconcileLabels {
        kind: kind.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

pub fn inc_reconcile_error(kind: &str, class: &str) {
    let labels = ErrorLabels {
        kind: kind.to_string(),
        class: class.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_remote_write(kind: &str, operation: &str) {
    let labels = WriteLabels {
        kind: kind.to_string(),
        operation: operation.to_string(),
    };
    REMOTE_WRITES_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_login(success: bool) {
    let labels = LoginLabels {
        outcome: if success { "success" } else { "failure" }.to_string(),
    };
    LOGINS_TOTAL.get_or_create(&labels).inc();
}
