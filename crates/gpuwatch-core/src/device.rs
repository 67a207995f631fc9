//! Device enumeration, done once at startup.

use gpuwatch_backend::TelemetrySource;
use gpuwatch_common::{FieldId, GpuWatchError, Result};
use std::collections::BTreeSet;
use serde::{Deserialize, Serialize};

/// Most devices a single daemon will track.
pub const MAX_DEVICES: u32 = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub index: u32,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Vec<DeviceInfo>,
    supported: BTreeSet<FieldId>,
}

impl DeviceRegistry {
    pub fn discover(source: &dyn TelemetrySource) -> Result<Self> {
        let reported = source.device_count()?;
        if reported > MAX_DEVICES {
            tracing::warn!(target: "devices", reported, max = MAX_DEVICES, "ignoring devices past the limit");
        }
        let count = reported.min(MAX_DEVICES);
        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let name = match source.device_name(index) {
                Ok(name) => name,
                Err(e) => {
                    tracing::warn!(target: "devices", index, error = %e, "device name unavailable");
                    format!("device {index}")
                }
            };
            devices.push(DeviceInfo { index, name });
        }
        let supported: BTreeSet<FieldId> = source.supported_fields().into_iter().collect();
        tracing::info!(target: "devices", count, fields = supported.len(), "discovered devices");
        Ok(Self { devices, supported })
    }

    pub fn count(&self) -> u32 {
        self.devices.len() as u32
    }

    pub fn contains(&self, index: u32) -> bool {
        (index as usize) < self.devices.len()
    }

    pub fn get(&self, index: u32) -> Result<&DeviceInfo> {
        self.devices
            .get(index as usize)
            .ok_or_else(|| GpuWatchError::NotFound(format!("device {index}")))
    }

    /// Whether the telemetry source can read `field` at all.
    pub fn supports(&self, field: FieldId) -> bool {
        self.supported.contains(&field)
    }

    pub fn indices(&self) -> Vec<u32> {
        self.devices.iter().map(|d| d.index).collect()
    }
}
