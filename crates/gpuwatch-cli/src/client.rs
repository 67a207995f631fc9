//! HTTP client for a running daemon.
//!
//! Transport failures are folded into the same status space as daemon
//! errors, so callers handle one error type.

use std::time::Duration;

use gpuwatch_api::types::*;
use gpuwatch_common::{FieldId, GpuWatchError, Result, StatusCode, TransportCode};
use gpuwatch_core::{
    DaemonStats, DeviceInfo, FieldGroupId, FieldGroupInfo, GroupId, GroupInfo, GroupKind, Handle, JobInfo, Sample,
    SampleError, WatchInfo,
};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

fn transport(e: reqwest::Error) -> GpuWatchError {
    let code = if e.is_timeout() {
        TransportCode::DeadlineExceeded
    } else if e.is_connect() {
        TransportCode::Unavailable
    } else if e.is_decode() {
        TransportCode::DataLoss
    } else if e.is_builder() {
        TransportCode::InvalidArgument
    } else {
        TransportCode::Unknown
    };
    GpuWatchError::Transport { code, message: e.to_string() }
}

#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build().map_err(transport)?;
        Ok(Self { http, base: base.into().trim_end_matches('/').to_string() })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, format!("{}{}", self.base, path))
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let resp = req.send().await.map_err(transport)?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let http_status = resp.status();
        let bytes = resp.bytes().await.map_err(transport)?;
        match serde_json::from_slice::<ErrorBody>(&bytes) {
            Ok(body) => Err(GpuWatchError::from_code(body.status, body.message)),
            Err(_) => Err(GpuWatchError::Remote {
                code: StatusCode::UNKNOWN,
                message: format!("http {http_status}: {}", String::from_utf8_lossy(&bytes)),
            }),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.send(self.request(Method::GET, path)).await?;
        resp.json().await.map_err(transport)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let resp = self.send(self.request(Method::POST, path).json(body)).await?;
        resp.json().await.map_err(transport)
    }

    async fn post_empty(&self, path: &str, body: Option<&serde_json::Value>) -> Result<()> {
        let mut req = self.request(Method::POST, path);
        if let Some(body) = body {
            req = req.json(body);
        }
        self.send(req).await.map(|_| ())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.send(self.request(Method::DELETE, path)).await.map(|_| ())
    }

    pub async fn connect(&self) -> Result<Handle> {
        let resp = self.send(self.request(Method::POST, "/v1/sessions")).await?;
        let session: SessionResponse = resp.json().await.map_err(transport)?;
        Ok(session.handle)
    }

    pub async fn disconnect(&self, h: Handle) -> Result<()> {
        self.delete(&format!("/v1/sessions/{h}")).await
    }

    pub async fn list_devices(&self, h: Handle) -> Result<Vec<u32>> {
        self.get(&format!("/v1/sessions/{h}/devices")).await
    }

    pub async fn device_attributes(&self, h: Handle, index: u32) -> Result<DeviceInfo> {
        self.get(&format!("/v1/sessions/{h}/devices/{index}")).await
    }

    pub async fn create_group(&self, h: Handle, kind: GroupKind, name: &str) -> Result<GroupId> {
        let body = CreateGroupRequest { kind, name: name.to_string() };
        let created: GroupCreated = self.post(&format!("/v1/sessions/{h}/groups"), &body).await?;
        Ok(created.id)
    }

    pub async fn add_device(&self, h: Handle, group: GroupId, device: u32) -> Result<()> {
        let body = serde_json::to_value(AddDeviceRequest { device }).map_err(|e| GpuWatchError::BadParameter(e.to_string()))?;
        self.post_empty(&format!("/v1/sessions/{h}/groups/{group}/devices"), Some(&body)).await
    }

    pub async fn list_groups(&self, h: Handle) -> Result<Vec<GroupId>> {
        self.get(&format!("/v1/sessions/{h}/groups")).await
    }

    pub async fn group_info(&self, h: Handle, group: GroupId) -> Result<GroupInfo> {
        self.get(&format!("/v1/sessions/{h}/groups/{group}")).await
    }

    pub async fn destroy_group(&self, h: Handle, group: GroupId) -> Result<()> {
        self.delete(&format!("/v1/sessions/{h}/groups/{group}")).await
    }

    pub async fn create_field_group(&self, h: Handle, fields: &[FieldId], name: &str) -> Result<FieldGroupId> {
        let body = CreateFieldGroupRequest { fields: fields.iter().map(|f| f.as_u32()).collect(), name: name.to_string() };
        let created: FieldGroupCreated = self.post(&format!("/v1/sessions/{h}/fieldgroups"), &body).await?;
        Ok(created.id)
    }

    pub async fn list_field_groups(&self, h: Handle) -> Result<Vec<FieldGroupId>> {
        self.get(&format!("/v1/sessions/{h}/fieldgroups")).await
    }

    pub async fn field_group_info(&self, h: Handle, id: FieldGroupId) -> Result<FieldGroupInfo> {
        self.get(&format!("/v1/sessions/{h}/fieldgroups/{id}")).await
    }

    pub async fn destroy_field_group(&self, h: Handle, id: FieldGroupId) -> Result<()> {
        self.delete(&format!("/v1/sessions/{h}/fieldgroups/{id}")).await
    }

    pub async fn watch(&self, h: Handle, req: WatchRequest) -> Result<()> {
        let body = serde_json::to_value(req).map_err(|e| GpuWatchError::BadParameter(e.to_string()))?;
        self.post_empty(&format!("/v1/sessions/{h}/watches"), Some(&body)).await
    }

    pub async fn list_watches(&self, h: Handle) -> Result<Vec<WatchInfo>> {
        self.get(&format!("/v1/sessions/{h}/watches")).await
    }

    pub async fn unwatch(&self, h: Handle, group: GroupId, field_group: FieldGroupId) -> Result<()> {
        self.delete(&format!("/v1/sessions/{h}/watches/{group}/{field_group}")).await
    }

    pub async fn update_all(&self, h: Handle) -> Result<usize> {
        let resp = self.send(self.request(Method::POST, &format!("/v1/sessions/{h}/update"))).await?;
        let body: UpdateResponse = resp.json().await.map_err(transport)?;
        Ok(body.ticked)
    }

    pub async fn latest_value(&self, h: Handle, device: u32, field: FieldId) -> Result<Sample> {
        self.get(&format!("/v1/sessions/{h}/values/{device}/{field}")).await
    }

    pub async fn last_error(&self, h: Handle, device: u32, field: FieldId) -> Result<Option<SampleError>> {
        self.get(&format!("/v1/sessions/{h}/values/{device}/{field}/error")).await
    }

    pub async fn start_job(&self, h: Handle, job_id: &str, group: GroupId, max_keep_age: Duration) -> Result<()> {
        let body = StartJobRequest { job_id: job_id.to_string(), group_id: group, max_keep_age_ms: gpuwatch_core::millis(max_keep_age) };
        let body = serde_json::to_value(body).map_err(|e| GpuWatchError::BadParameter(e.to_string()))?;
        self.post_empty(&format!("/v1/sessions/{h}/jobs"), Some(&body)).await
    }

    pub async fn stop_job(&self, h: Handle, job_id: &str) -> Result<JobInfo> {
        let resp = self.send(self.request(Method::POST, &format!("/v1/sessions/{h}/jobs/{job_id}/stop"))).await?;
        resp.json().await.map_err(transport)
    }

    pub async fn job_info(&self, h: Handle, job_id: &str) -> Result<JobInfo> {
        self.get(&format!("/v1/sessions/{h}/jobs/{job_id}")).await
    }

    pub async fn remove_job(&self, h: Handle, job_id: &str) -> Result<()> {
        self.delete(&format!("/v1/sessions/{h}/jobs/{job_id}")).await
    }

    pub async fn stats(&self) -> Result<DaemonStats> {
        self.get("/v1/stats").await
    }
}
