//! Collaborators the monitoring core talks to: the vendor telemetry library
//! and the process capability switch needed for privileged counters.

use gpuwatch_common::{FieldId, FieldValue, Result};

/// Per-device telemetry reads supplied by a vendor monitoring library.
///
/// Calls are synchronous; the scheduler runs them on the blocking pool with
/// a timeout.
pub trait TelemetrySource: Send + Sync {
    fn device_count(&self) -> Result<u32>;
    fn device_name(&self, index: u32) -> Result<String>;
    fn read_field(&self, index: u32, field: FieldId) -> Result<FieldValue>;

    fn supported_fields(&self) -> Vec<FieldId> {
        FieldId::ALL.to_vec()
    }

    /// Whether usage can be attributed to jobs on this system.
    fn supports_job_stats(&self) -> bool {
        true
    }
}

/// Grants and revokes the OS privilege needed for privileged reads.
pub trait CapabilityProvider: Send + Sync {
    fn raise(&self) -> Result<()>;
    fn lower(&self);
}

/// Holds a raised capability; lowers it when dropped.
pub struct CapabilityGuard<'a> {
    provider: &'a dyn CapabilityProvider,
}

impl<'a> CapabilityGuard<'a> {
    pub fn acquire(provider: &'a dyn CapabilityProvider) -> Result<Self> {
        provider.raise()?;
        Ok(Self { provider })
    }
}

impl Drop for CapabilityGuard<'_> {
    fn drop(&mut self) {
        self.provider.lower();
    }
}

/// Provider for processes that already run with the needed privileges.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapabilities;

impl CapabilityProvider for NoCapabilities {
    fn raise(&self) -> Result<()> {
        Ok(())
    }
    fn lower(&self) {}
}

/// Read one field, holding a capability for the duration of privileged reads.
pub fn read_field_scoped(
    source: &dyn TelemetrySource,
    caps: &dyn CapabilityProvider,
    index: u32,
    field: FieldId,
) -> Result<FieldValue> {
    if field.is_privileged() {
        let _guard = CapabilityGuard::acquire(caps)?;
        return source.read_field(index, field);
    }
    source.read_field(index, field)
}

#[cfg(feature = "mock")]
pub mod mock {
    use super::*;
    use gpuwatch_common::GpuWatchError;
    use rand::Rng;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
    use std::time::Duration;

    /// Synthetic devices with plausible readings.
    #[derive(Default)]
    pub struct MockTelemetry {
        devices: u32,
        failures: HashSet<(u32, FieldId)>,
        delays: HashMap<u32, Duration>,
        unsupported: HashSet<FieldId>,
        no_job_stats: bool,
        reads: AtomicU64,
    }

    impl MockTelemetry {
        pub fn new(devices: u32) -> Self {
            Self { devices, ..Self::default() }
        }

        /// Every read of `field` on `index` fails.
        pub fn with_failure(mut self, index: u32, field: FieldId) -> Self {
            self.failures.insert((index, field));
            self
        }

        /// Every read on `index` blocks for `delay` first.
        pub fn with_delay(mut self, index: u32, delay: Duration) -> Self {
            self.delays.insert(index, delay);
            self
        }

        pub fn without_field(mut self, field: FieldId) -> Self {
            self.unsupported.insert(field);
            self
        }

        pub fn without_job_stats(mut self) -> Self {
            self.no_job_stats = true;
            self
        }

        pub fn reads(&self) -> u64 {
            self.reads.load(Ordering::Relaxed)
        }

        fn check(&self, index: u32) -> Result<()> {
            if index >= self.devices {
                return Err(GpuWatchError::NotFound(format!("mock device {index}")));
            }
            Ok(())
        }
    }

    impl TelemetrySource for MockTelemetry {
        fn device_count(&self) -> Result<u32> {
            Ok(self.devices)
        }

        fn device_name(&self, index: u32) -> Result<String> {
            self.check(index)?;
            Ok(format!("Mock Accelerator {index}"))
        }

        fn read_field(&self, index: u32, field: FieldId) -> Result<FieldValue> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            self.check(index)?;
            if let Some(delay) = self.delays.get(&index) {
                std::thread::sleep(*delay);
            }
            if self.unsupported.contains(&field) {
                return Err(GpuWatchError::NotSupported(format!("{field} on mock device {index}")));
            }
            if self.failures.contains(&(index, field)) {
                return Err(GpuWatchError::Telemetry(format!("injected failure reading {field} on {index}")));
            }
            let base = index as i64;
            let jitter: i64 = rand::thread_rng().gen_range(0..4);
            let value = match field {
                FieldId::GpuCount => FieldValue::Int(self.devices as i64),
                FieldId::DevName => FieldValue::Str(format!("Mock Accelerator {index}")),
                FieldId::GpuClock => FieldValue::Int(1500 + base * 100 + jitter * 10),
                FieldId::MemClock => FieldValue::Int(1000 + base * 50),
                FieldId::MemoryTemp => FieldValue::Int(50 + base * 5 + jitter),
                FieldId::GpuTemp => FieldValue::Int(45 + base * 5 + jitter),
                FieldId::PowerUsage => FieldValue::Int(150 + base * 25 + jitter),
                FieldId::PcieTx => FieldValue::Int(4_000_000 + jitter * 1000),
                FieldId::PcieRx => FieldValue::Int(6_000_000 + jitter * 1000),
                FieldId::GpuUtil => FieldValue::Int(40 + base * 10 + jitter),
                FieldId::GpuMemoryUsage => FieldValue::Int((2_i64 << 30) + base * (512_i64 << 20)),
                FieldId::GpuMemoryTotal => FieldValue::Int(16_i64 << 30),
                FieldId::EccCorrectTotal | FieldId::EccUncorrectTotal => FieldValue::Int(0),
            };
            Ok(value)
        }

        fn supported_fields(&self) -> Vec<FieldId> {
            FieldId::ALL.iter().copied().filter(|f| !self.unsupported.contains(f)).collect()
        }

        fn supports_job_stats(&self) -> bool {
            !self.no_job_stats
        }
    }

    /// Tracks raise/lower pairs so tests can check the guard is balanced.
    #[derive(Default)]
    pub struct CountingCapabilities {
        held: AtomicI64,
        raised: AtomicU64,
        deny: bool,
    }

    impl CountingCapabilities {
        pub fn denying() -> Self {
            Self { deny: true, ..Self::default() }
        }
        pub fn held(&self) -> i64 {
            self.held.load(Ordering::SeqCst)
        }
        pub fn raised(&self) -> u64 {
            self.raised.load(Ordering::SeqCst)
        }
    }

    impl CapabilityProvider for CountingCapabilities {
        fn raise(&self) -> Result<()> {
            if self.deny {
                return Err(GpuWatchError::PermissionDenied("capability not granted".into()));
            }
            self.raised.fetch_add(1, Ordering::SeqCst);
            self.held.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn lower(&self) {
            self.held.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
