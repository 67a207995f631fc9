//! Observability: daemon gauges for the metrics endpoint, and the NVML
//! telemetry source.

use gpuwatch_core::DaemonStats;
use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntGauge};

#[cfg(feature = "nvidia")]
pub mod nvml;

static SESSIONS: Lazy<IntGauge> =
    Lazy::new(|| prometheus::register_int_gauge!("gpuwatch_sessions", "Open client sessions").expect("gauge"));
static GPU_GROUPS: Lazy<IntGauge> =
    Lazy::new(|| prometheus::register_int_gauge!("gpuwatch_gpu_groups", "Live GPU groups").expect("gauge"));
static FIELD_GROUPS: Lazy<IntGauge> =
    Lazy::new(|| prometheus::register_int_gauge!("gpuwatch_field_groups", "Live field groups").expect("gauge"));
static WATCHES: Lazy<IntGauge> =
    Lazy::new(|| prometheus::register_int_gauge!("gpuwatch_active_watches", "Active watches").expect("gauge"));
static JOBS: Lazy<IntGauge> =
    Lazy::new(|| prometheus::register_int_gauge!("gpuwatch_jobs", "Jobs held in the job table").expect("gauge"));
static BUFFERED: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!("gpuwatch_buffered_samples", "Samples held across all buffers").expect("gauge")
});
static FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!("gpuwatch_sample_failures_total", "Failed telemetry reads").expect("counter")
});

pub fn init() {
    Lazy::force(&SESSIONS);
    Lazy::force(&GPU_GROUPS);
    Lazy::force(&FIELD_GROUPS);
    Lazy::force(&WATCHES);
    Lazy::force(&JOBS);
    Lazy::force(&BUFFERED);
    Lazy::force(&FAILURES);
}

/// Copy a stats snapshot into the registered metrics.
pub fn record(stats: &DaemonStats) {
    SESSIONS.set(stats.sessions as i64);
    GPU_GROUPS.set(stats.gpu_groups as i64);
    FIELD_GROUPS.set(stats.field_groups as i64);
    WATCHES.set(stats.watches as i64);
    JOBS.set(stats.jobs as i64);
    BUFFERED.set(stats.buffered_samples as i64);
    let seen = FAILURES.get();
    if stats.sample_failures > seen {
        FAILURES.inc_by(stats.sample_failures - seen);
    }
}
