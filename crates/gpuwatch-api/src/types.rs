//! Request and response bodies shared by the server and the CLI client.

use gpuwatch_common::StatusCode;
use gpuwatch_core::{FieldGroupId, GroupId, GroupKind, Handle, Sample};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: StatusCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionResponse {
    pub handle: Handle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    #[serde(default)]
    pub kind: GroupKind,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GroupCreated {
    pub id: GroupId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AddDeviceRequest {
    pub device: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFieldGroupRequest {
    pub fields: Vec<u32>,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FieldGroupCreated {
    pub id: FieldGroupId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WatchRequest {
    pub group_id: GroupId,
    pub field_group_id: FieldGroupId,
    pub update_interval_ms: u64,
    pub max_keep_age_ms: u64,
    #[serde(default)]
    pub max_keep_samples: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub ticked: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SinceQuery {
    #[serde(default)]
    pub since_us: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinceResponse {
    pub sample: Sample,
    pub next_since_us: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartJobRequest {
    pub job_id: String,
    pub group_id: GroupId,
    #[serde(default)]
    pub max_keep_age_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RemovedResponse {
    pub removed: usize,
}
