//! Session, group, watch and job-statistics engine of the monitoring daemon.

pub mod cache;
pub mod daemon;
pub mod device;
pub mod groups;
pub mod jobs;
pub mod scheduler;
pub mod session;

pub use cache::{FieldKey, Retention, Sample, SampleError};
pub use daemon::{Daemon, DaemonStats};
pub use device::{DeviceInfo, DeviceRegistry};
pub use groups::{FieldGroupId, FieldGroupInfo, GroupId, GroupInfo, GroupKind};
pub use jobs::{DeviceUsage, FieldSummary, JobInfo};
pub use scheduler::{WatchInfo, WatchParams};
pub use session::Handle;

/// Microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(micros)
        .unwrap_or_default()
}

/// `d` in whole microseconds, saturating at `u64::MAX`.
pub fn micros(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

/// `d` in whole milliseconds, saturating at `u64::MAX`.
pub fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
