pub mod fields;
pub mod status;

pub use fields::{FieldId, FieldValue};
pub use status::{LocalCode, StatusCode, TransportCode};

pub type Result<T> = core::result::Result<T, GpuWatchError>;

/// Longest accepted group, field-group or job name, in bytes.
pub const MAX_NAME_LEN: usize = 256;
/// Longest accepted job id, in bytes.
pub const MAX_JOB_ID_LEN: usize = 64;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GpuWatchError {
    #[error("invalid handle")]
    InvalidHandle,
    #[error("bad parameter: {0}")]
    BadParameter(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("resource busy: {0}")]
    Conflict(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("limit reached: {0}")]
    ResourceExhausted(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("telemetry error: {0}")]
    Telemetry(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("{message}")]
    Transport { code: TransportCode, message: String },
    #[error("{message}")]
    Remote { code: StatusCode, message: String },
}

impl GpuWatchError {
    pub fn code(&self) -> StatusCode {
        match self {
            GpuWatchError::InvalidHandle => LocalCode::InvalidHandle.into(),
            GpuWatchError::BadParameter(_) => LocalCode::BadParameter.into(),
            GpuWatchError::NotFound(_) => LocalCode::NotFound.into(),
            GpuWatchError::Conflict(_) => LocalCode::Conflict.into(),
            GpuWatchError::NotSupported(_) => LocalCode::NotSupported.into(),
            GpuWatchError::AlreadyExists(_) => LocalCode::AlreadyExists.into(),
            GpuWatchError::ResourceExhausted(_) => LocalCode::ResourceExhausted.into(),
            GpuWatchError::PermissionDenied(_) => LocalCode::PermissionDenied.into(),
            GpuWatchError::Telemetry(_) => LocalCode::TelemetryError.into(),
            GpuWatchError::Timeout(_) => LocalCode::Timeout.into(),
            GpuWatchError::Transport { code, .. } => (*code).into(),
            GpuWatchError::Remote { code, .. } => *code,
        }
    }

    /// Rebuild an error from a unified code, e.g. one decoded from a response body.
    pub fn from_code(code: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        if let Some(transport) = code.transport().filter(|_| code.is_transport()) {
            return GpuWatchError::Transport { code: transport, message };
        }
        match code.local() {
            Some(LocalCode::InvalidHandle) => GpuWatchError::InvalidHandle,
            Some(LocalCode::BadParameter) => GpuWatchError::BadParameter(message),
            Some(LocalCode::NotFound) => GpuWatchError::NotFound(message),
            Some(LocalCode::Conflict) => GpuWatchError::Conflict(message),
            Some(LocalCode::NotSupported) => GpuWatchError::NotSupported(message),
            Some(LocalCode::AlreadyExists) => GpuWatchError::AlreadyExists(message),
            Some(LocalCode::ResourceExhausted) => GpuWatchError::ResourceExhausted(message),
            Some(LocalCode::PermissionDenied) => GpuWatchError::PermissionDenied(message),
            Some(LocalCode::TelemetryError) => GpuWatchError::Telemetry(message),
            Some(LocalCode::Timeout) => GpuWatchError::Timeout(message),
            _ => GpuWatchError::Remote { code, message },
        }
    }
}

pub mod config {
    use serde::Deserialize;
    use std::env;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
    #[serde(rename_all = "lowercase")]
    pub enum OperationMode {
        /// The daemon runs one sampling task per active watch.
        #[default]
        Auto,
        /// Sampling happens only when a client calls `update_all_fields`.
        Manual,
    }

    impl std::str::FromStr for OperationMode {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.to_ascii_lowercase().as_str() {
                "auto" => Ok(OperationMode::Auto),
                "manual" => Ok(OperationMode::Manual),
                other => Err(format!("unknown operation mode {other}")),
            }
        }
    }

    #[derive(Debug, Clone, Deserialize)]
    #[serde(default)]
    pub struct Limits {
        pub max_groups: usize,
        pub max_field_groups: usize,
        pub max_fields_per_group: usize,
        pub max_group_entities: usize,
    }

    impl Default for Limits {
        fn default() -> Self {
            Self { max_groups: 64, max_field_groups: 64, max_fields_per_group: 128, max_group_entities: 64 }
        }
    }

    #[derive(Debug, Clone, Deserialize)]
    #[serde(default)]
    pub struct GpuWatchConfig {
        pub listen_addr: String,
        pub mode: OperationMode,
        pub read_timeout_ms: u64,
        pub janitor_interval_ms: u64,
        pub mock_devices: u32,
        pub limits: Limits,
    }

    impl Default for GpuWatchConfig {
        fn default() -> Self {
            Self {
                listen_addr: "127.0.0.1:50051".into(),
                mode: OperationMode::Auto,
                read_timeout_ms: 500,
                janitor_interval_ms: 1000,
                mock_devices: 2,
                limits: Limits::default(),
            }
        }
    }

    impl GpuWatchConfig {
        pub fn load() -> Self {
            if let Ok(path) = env::var("GPUWATCH_CONFIG") {
                let Ok(text) = std::fs::read_to_string(path) else { return Self::default() };
                let Ok(cfg) = serde_yaml::from_str::<GpuWatchConfig>(&text) else { return Self::default() };
                return cfg;
            }
            let mut cfg = Self::default();
            if let Ok(addr) = env::var("GPUWATCH_LISTEN") {
                cfg.listen_addr = addr;
            }
            if let Some(v) = env::var("GPUWATCH_MODE").ok().and_then(|v| v.parse().ok()) { cfg.mode = v; }
            if let Some(v) = env::var("GPUWATCH_READ_TIMEOUT_MS").ok().and_then(|v| v.parse().ok()) { cfg.read_timeout_ms = v; }
            if let Some(v) = env::var("GPUWATCH_JANITOR_MS").ok().and_then(|v| v.parse().ok()) { cfg.janitor_interval_ms = v; }
            if let Some(v) = env::var("GPUWATCH_MOCK_DEVICES").ok().and_then(|v| v.parse().ok()) { cfg.mock_devices = v; }
            if let Some(v) = env::var("GPUWATCH_MAX_GROUPS").ok().and_then(|v| v.parse().ok()) { cfg.limits.max_groups = v; }
            if let Some(v) = env::var("GPUWATCH_MAX_FIELD_GROUPS").ok().and_then(|v| v.parse().ok()) { cfg.limits.max_field_groups = v; }
            cfg
        }

        pub fn read_timeout(&self) -> std::time::Duration {
            std::time::Duration::from_millis(self.read_timeout_ms)
        }

        pub fn janitor_interval(&self) -> std::time::Duration {
            std::time::Duration::from_millis(self.janitor_interval_ms.max(1))
        }
    }
}
