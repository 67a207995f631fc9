//! `TelemetrySource` backed by NVIDIA's management library.

use gpuwatch_backend::TelemetrySource;
use gpuwatch_common::{FieldId, FieldValue, GpuWatchError, Result};
use nvml_wrapper::enum_wrappers::device::{Clock, EccCounter, MemoryError, PcieUtilCounter, TemperatureSensor};
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;

pub struct NvmlTelemetry {
    nvml: Nvml,
}

impl NvmlTelemetry {
    pub fn init() -> Result<Self> {
        let nvml = Nvml::init().map_err(map_err)?;
        tracing::info!(target: "nvml", "nvml initialized");
        Ok(Self { nvml })
    }
}

fn map_err(e: NvmlError) -> GpuWatchError {
    match e {
        NvmlError::NotSupported => GpuWatchError::NotSupported(e.to_string()),
        NvmlError::NoPermission => GpuWatchError::PermissionDenied(e.to_string()),
        NvmlError::InvalidArg => GpuWatchError::BadParameter(e.to_string()),
        NvmlError::NotFound => GpuWatchError::NotFound(e.to_string()),
        NvmlError::Timeout => GpuWatchError::Timeout(e.to_string()),
        other => GpuWatchError::Telemetry(other.to_string()),
    }
}

impl TelemetrySource for NvmlTelemetry {
    fn device_count(&self) -> Result<u32> {
        self.nvml.device_count().map_err(map_err)
    }

    fn device_name(&self, index: u32) -> Result<String> {
        self.nvml.device_by_index(index).and_then(|d| d.name()).map_err(map_err)
    }

    fn read_field(&self, index: u32, field: FieldId) -> Result<FieldValue> {
        let device = self.nvml.device_by_index(index).map_err(map_err)?;
        let value = match field {
            FieldId::GpuCount => FieldValue::Int(self.nvml.device_count().map_err(map_err)? as i64),
            FieldId::DevName => FieldValue::Str(device.name().map_err(map_err)?),
            FieldId::GpuClock => FieldValue::Int(device.clock_info(Clock::Graphics).map_err(map_err)? as i64),
            FieldId::MemClock => FieldValue::Int(device.clock_info(Clock::Memory).map_err(map_err)? as i64),
            FieldId::GpuTemp => FieldValue::Int(device.temperature(TemperatureSensor::Gpu).map_err(map_err)? as i64),
            FieldId::MemoryTemp => return Err(GpuWatchError::NotSupported("memory temperature via nvml".into())),
            // milliwatts
            FieldId::PowerUsage => FieldValue::Float(device.power_usage().map_err(map_err)? as f64 / 1000.0),
            // KB/s
            FieldId::PcieTx => FieldValue::Int(device.pcie_throughput(PcieUtilCounter::Send).map_err(map_err)? as i64 * 1024),
            FieldId::PcieRx => FieldValue::Int(device.pcie_throughput(PcieUtilCounter::Receive).map_err(map_err)? as i64 * 1024),
            FieldId::GpuUtil => FieldValue::Int(device.utilization_rates().map_err(map_err)?.gpu as i64),
            FieldId::GpuMemoryUsage => FieldValue::Int(device.memory_info().map_err(map_err)?.used as i64),
            FieldId::GpuMemoryTotal => FieldValue::Int(device.memory_info().map_err(map_err)?.total as i64),
            FieldId::EccCorrectTotal => FieldValue::Int(
                device.total_ecc_errors(MemoryError::Corrected, EccCounter::Aggregate).map_err(map_err)? as i64,
            ),
            FieldId::EccUncorrectTotal => FieldValue::Int(
                device.total_ecc_errors(MemoryError::Uncorrected, EccCounter::Aggregate).map_err(map_err)? as i64,
            ),
        };
        Ok(value)
    }

    fn supported_fields(&self) -> Vec<FieldId> {
        FieldId::ALL.iter().copied().filter(|f| *f != FieldId::MemoryTemp).collect()
    }
}
