//! Prometheus metrics for backend bring-up and teardown.
//!
//! The library only emits through the `metrics` facade; nothing is recorded
//! unless the hosting process installs a recorder.  [`init_metrics`]
//! installs the Prometheus one used by `julea-server`.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

use crate::config::StorageKind;

// -- Metric name constants ----------------------------------------------------

/// Backend `init` calls (counter). Labels: kind, status.
pub const BACKEND_INIT_TOTAL: &str = "julea_backend_init_total";

/// Backend `fini` calls (counter). Labels: kind, status.
pub const BACKEND_FINI_TOTAL: &str = "julea_backend_fini_total";

/// Bring-ups rolled back (counter). Labels: kind.
pub const ROLLBACK_TOTAL: &str = "julea_rollback_total";

/// Backend instances currently ready (gauge).
pub const BACKENDS_READY: &str = "julea_backends_ready";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder.
pub fn describe_metrics() {
    describe_counter!(BACKEND_INIT_TOTAL, "Backend init calls by kind and outcome");
    describe_counter!(BACKEND_FINI_TOTAL, "Backend fini calls by kind and outcome");
    describe_counter!(ROLLBACK_TOTAL, "Bring-ups rolled back, by failing kind");
    describe_gauge!(BACKENDS_READY, "Backend instances currently ready");
}

/// Prometheus exposition text, if the recorder is installed.
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(PrometheusHandle::render)
}

// -- Recording helpers ---------------------------------------------------------

fn status(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "error"
    }
}

pub(crate) fn record_init(kind: StorageKind, ok: bool) {
    counter!(BACKEND_INIT_TOTAL, "kind" => kind.as_str(), "status" => status(ok)).increment(1);
    if ok {
        gauge!(BACKENDS_READY).increment(1.0);
    }
}

pub(crate) fn record_fini(kind: StorageKind, ok: bool) {
    counter!(BACKEND_FINI_TOTAL, "kind" => kind.as_str(), "status" => status(ok)).increment(1);
    gauge!(BACKENDS_READY).decrement(1.0);
}

pub(crate) fn record_rollback(kind: Option<StorageKind>) {
    let kind = kind.map(StorageKind::as_str).unwrap_or("client");
    counter!(ROLLBACK_TOTAL, "kind" => kind).increment(1);
}
