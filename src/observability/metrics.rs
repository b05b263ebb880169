//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `nio_machine_reconciliations_total` - Machine reconcile passes
//! - `nio_configuration_reconciliations_total` - Configuration reconcile passes
//! - `nio_reconciliation_errors_total` - Reconcile errors by kind
//! - `nio_reconcile_duration_seconds` - Configuration reconcile duration
//! - `nio_machines_discoverable` - Machines that answered the last probe
//! - `nio_configurations_applied_total` - Successful applies
//! - `nio_configurations_failed_total` - Failed applies by error kind
//! - `nio_ssh_probes_total` - SSH reachability probes by result
//! - `nio_git_operations_total` - Git clones/ref resolutions by result
//! - `nio_nixos_builds_total` - nixos-rebuild/nixos-anywhere runs by kind and result
//! - `nio_nixos_build_duration_seconds` - Apply command duration
//! - `nio_workdirs_collected_total` - Checkouts removed by garbage collection

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static MACHINE_RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "nio_machine_reconciliations_total",
        "Total number of machine reconcile passes",
    )
    .expect("Failed to create MACHINE_RECONCILIATIONS_TOTAL metric - this should never happen")
});

static CONFIGURATION_RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "nio_configuration_reconciliations_total",
        "Total number of configuration reconcile passes",
    )
    .expect(
        "Failed to create CONFIGURATION_RECONCILIATIONS_TOTAL metric - this should never happen",
    )
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "nio_reconciliation_errors_total",
            "Total number of reconciliation errors by error kind",
        ),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "nio_reconcile_duration_seconds",
            "Duration of configuration reconciles in seconds",
        )
        .buckets(vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]),
    )
    .expect("Failed to create RECONCILE_DURATION metric - this should never happen")
});

static MACHINES_DISCOVERABLE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "nio_machines_discoverable",
        "Number of machines that answered the last reachability probe",
    )
    .expect("Failed to create MACHINES_DISCOVERABLE metric - this should never happen")
});

static CONFIGURATIONS_APPLIED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "nio_configurations_applied_total",
        "Total number of successful configuration applications",
    )
    .expect("Failed to create CONFIGURATIONS_APPLIED_TOTAL metric - this should never happen")
});

static CONFIGURATIONS_FAILED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "nio_configurations_failed_total",
            "Total number of failed configuration applications by error kind",
        ),
        &["kind"],
    )
    .expect("Failed to create CONFIGURATIONS_FAILED_TOTAL metric - this should never happen")
});

static SSH_PROBES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "nio_ssh_probes_total",
            "Total number of SSH reachability probes by result",
        ),
        &["result"],
    )
    .expect("Failed to create SSH_PROBES_TOTAL metric - this should never happen")
});

static GIT_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "nio_git_operations_total",
            "Total number of git operations by operation and result",
        ),
        &["operation", "result"],
    )
    .expect("Failed to create GIT_OPERATIONS_TOTAL metric - this should never happen")
});

static NIXOS_BUILDS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "nio_nixos_builds_total",
            "Total number of nixos apply commands by build type and result",
        ),
        &["build_type", "result"],
    )
    .expect("Failed to create NIXOS_BUILDS_TOTAL metric - this should never happen")
});

static NIXOS_BUILD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "nio_nixos_build_duration_seconds",
            "Duration of nixos apply commands in seconds",
        )
        .buckets(vec![60.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0, 7200.0]),
    )
    .expect("Failed to create NIXOS_BUILD_DURATION metric - this should never happen")
});

static WORKDIRS_COLLECTED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "nio_workdirs_collected_total",
        "Total number of checkout directories removed by garbage collection",
    )
    .expect("Failed to create WORKDIRS_COLLECTED_TOTAL metric - this should never happen")
});

/// Register all metrics with the global registry. Called once at startup.
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(MACHINE_RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CONFIGURATION_RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILE_DURATION.clone()))?;
    REGISTRY.register(Box::new(MACHINES_DISCOVERABLE.clone()))?;
    REGISTRY.register(Box::new(CONFIGURATIONS_APPLIED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CONFIGURATIONS_FAILED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SSH_PROBES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(GIT_OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(NIXOS_BUILDS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(NIXOS_BUILD_DURATION.clone()))?;
    REGISTRY.register(Box::new(WORKDIRS_COLLECTED_TOTAL.clone()))?;
    Ok(())
}

pub fn increment_machine_reconciliations() {
    MACHINE_RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_configuration_reconciliations() {
    CONFIGURATION_RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors(kind: &str) {
    RECONCILIATION_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn observe_reconcile_duration(seconds: f64) {
    RECONCILE_DURATION.observe(seconds);
}

pub fn set_machines_discoverable(count: i64) {
    MACHINES_DISCOVERABLE.set(count);
}

pub fn adjust_machines_discoverable(delta: i64) {
    MACHINES_DISCOVERABLE.add(delta);
}

pub fn increment_configurations_applied() {
    CONFIGURATIONS_APPLIED_TOTAL.inc();
}

pub fn increment_configurations_failed(kind: &str) {
    CONFIGURATIONS_FAILED_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_ssh_probe(success: bool) {
    let result = if success { "success" } else { "failure" };
    SSH_PROBES_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_git_operation(operation: &str, success: bool) {
    let result = if success { "success" } else { "failure" };
    GIT_OPERATIONS_TOTAL
        .with_label_values(&[operation, result])
        .inc();
}

pub fn record_nixos_build(build_type: &str, success: bool, seconds: f64) {
    let result = if success { "success" } else { "failure" };
    NIXOS_BUILDS_TOTAL
        .with_label_values(&[build_type, result])
        .inc();
    if success {
        NIXOS_BUILD_DURATION.observe(seconds);
    }
}

pub fn increment_workdirs_collected(count: u64) {
    WORKDIRS_COLLECTED_TOTAL.inc_by(count);
}

/// Gather all metric families for the `/metrics` endpoint.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent_per_process() {
        // First registration wins; a second is a duplicate error we don't
        // care about in tests that share the process-global registry.
        let _ = register_metrics();

        increment_machine_reconciliations();
        increment_configuration_reconciliations();
        increment_reconciliation_errors("TransientIOError");
        record_ssh_probe(true);
        record_git_operation("clone", true);
        record_nixos_build("nixos-rebuild", true, 42.0);
        increment_workdirs_collected(2);

        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        use prometheus::Encoder as _;
        encoder.encode(&gather(), &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("nio_machine_reconciliations_total"));
        assert!(text.contains("nio_nixos_builds_total"));
    }
}
