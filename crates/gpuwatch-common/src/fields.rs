//! Telemetry field catalogue and sampled values.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::GpuWatchError;

/// The closed set of fields the daemon knows how to sample.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldId {
    GpuCount = 1,
    DevName = 2,
    GpuClock = 100,
    MemClock = 101,
    MemoryTemp = 200,
    GpuTemp = 201,
    PowerUsage = 300,
    PcieTx = 400,
    PcieRx = 401,
    GpuUtil = 500,
    GpuMemoryUsage = 501,
    GpuMemoryTotal = 502,
    EccCorrectTotal = 600,
    EccUncorrectTotal = 601,
}

impl FieldId {
    pub const ALL: [FieldId; 14] = [
        FieldId::GpuCount,
        FieldId::DevName,
        FieldId::GpuClock,
        FieldId::MemClock,
        FieldId::MemoryTemp,
        FieldId::GpuTemp,
        FieldId::PowerUsage,
        FieldId::PcieTx,
        FieldId::PcieRx,
        FieldId::GpuUtil,
        FieldId::GpuMemoryUsage,
        FieldId::GpuMemoryTotal,
        FieldId::EccCorrectTotal,
        FieldId::EccUncorrectTotal,
    ];

    /// Fields every job summary reports, available or not.
    pub const JOB_FIELDS: [FieldId; 8] = [
        FieldId::PowerUsage,
        FieldId::GpuClock,
        FieldId::MemClock,
        FieldId::GpuUtil,
        FieldId::GpuTemp,
        FieldId::GpuMemoryUsage,
        FieldId::PcieTx,
        FieldId::PcieRx,
    ];

    pub fn from_u32(v: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| *f as u32 == v)
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            FieldId::GpuCount => "GPU_COUNT",
            FieldId::DevName => "DEV_NAME",
            FieldId::GpuClock => "GPU_CLOCK",
            FieldId::MemClock => "MEM_CLOCK",
            FieldId::MemoryTemp => "MEMORY_TEMP",
            FieldId::GpuTemp => "GPU_TEMP",
            FieldId::PowerUsage => "POWER_USAGE",
            FieldId::PcieTx => "PCIE_TX",
            FieldId::PcieRx => "PCIE_RX",
            FieldId::GpuUtil => "GPU_UTIL",
            FieldId::GpuMemoryUsage => "GPU_MEMORY_USAGE",
            FieldId::GpuMemoryTotal => "GPU_MEMORY_TOTAL",
            FieldId::EccCorrectTotal => "ECC_CORRECT_TOTAL",
            FieldId::EccUncorrectTotal => "ECC_UNCORRECT_TOTAL",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            FieldId::GpuCount => "GPU count in the system",
            FieldId::DevName => "Name of the device",
            FieldId::GpuClock => "Current GPU clock",
            FieldId::MemClock => "Current memory clock",
            FieldId::MemoryTemp => "Memory temperature",
            FieldId::GpuTemp => "GPU temperature",
            FieldId::PowerUsage => "Power usage",
            FieldId::PcieTx => "PCIe TX throughput",
            FieldId::PcieRx => "PCIe RX throughput",
            FieldId::GpuUtil => "GPU utilization",
            FieldId::GpuMemoryUsage => "GPU memory in use",
            FieldId::GpuMemoryTotal => "Total GPU memory",
            FieldId::EccCorrectTotal => "Accumulated correctable ECC errors",
            FieldId::EccUncorrectTotal => "Accumulated uncorrectable ECC errors",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            FieldId::GpuCount | FieldId::EccCorrectTotal | FieldId::EccUncorrectTotal => "count",
            FieldId::DevName => "",
            FieldId::GpuClock | FieldId::MemClock => "MHz",
            FieldId::MemoryTemp | FieldId::GpuTemp => "C",
            FieldId::PowerUsage => "W",
            FieldId::PcieTx | FieldId::PcieRx => "B/s",
            FieldId::GpuUtil => "%",
            FieldId::GpuMemoryUsage | FieldId::GpuMemoryTotal => "bytes",
        }
    }

    /// Reading these counters needs elevated process capabilities.
    pub fn is_privileged(self) -> bool {
        matches!(self, FieldId::EccCorrectTotal | FieldId::EccUncorrectTotal)
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u32> for FieldId {
    type Error = GpuWatchError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        FieldId::from_u32(v).ok_or_else(|| GpuWatchError::BadParameter(format!("unknown field id {v}")))
    }
}

impl FromStr for FieldId {
    type Err = GpuWatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(num) = s.parse::<u32>() {
            return FieldId::try_from(num);
        }
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("FI_").unwrap_or(&upper);
        FieldId::ALL
            .iter()
            .copied()
            .find(|f| f.name() == name)
            .ok_or_else(|| GpuWatchError::BadParameter(format!("unknown field name {s}")))
    }
}

/// A single value returned by the telemetry source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            FieldValue::Str(_) => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v:.2}"),
            FieldValue::Str(v) => f.write_str(v),
        }
    }
}
