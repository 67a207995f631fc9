//! HTTP API over the monitoring daemon.

use std::time::Duration;

use axum::{
    extract::{rejection::{JsonRejection, QueryRejection}, Path, Query, State},
    http::StatusCode as HttpStatus,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use gpuwatch_common::FieldId;
use gpuwatch_core::{
    Daemon, DaemonStats, DeviceInfo, FieldGroupId, FieldGroupInfo, GroupId, GroupInfo, Handle, JobInfo, Sample,
    SampleError, WatchInfo, WatchParams,
};
use once_cell::sync::Lazy;
use prometheus::{Encoder, TextEncoder};

pub mod error;
pub mod types;

pub use error::ApiError;
use types::*;

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

static ENCODER: Lazy<TextEncoder> = Lazy::new(TextEncoder::new);

#[derive(Clone)]
pub struct AppState {
    daemon: Daemon,
}

pub fn app(daemon: Daemon) -> Router {
    gpuwatch_obs::init();
    let state = AppState { daemon };
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(metrics))
        .route("/openapi.json", get(openapi))
        .route("/v1/stats", get(stats))
        .route("/v1/sessions", post(connect))
        .route("/v1/sessions/:handle", delete(disconnect))
        .route("/v1/sessions/:handle/devices", get(list_devices))
        .route("/v1/sessions/:handle/devices/:index", get(device_attributes))
        .route("/v1/sessions/:handle/groups", post(create_group).get(list_groups))
        .route("/v1/sessions/:handle/groups/:id", get(group_info).delete(destroy_group))
        .route("/v1/sessions/:handle/groups/:id/devices", post(add_device))
        .route("/v1/sessions/:handle/fieldgroups", post(create_field_group).get(list_field_groups))
        .route("/v1/sessions/:handle/fieldgroups/:id", get(field_group_info).delete(destroy_field_group))
        .route("/v1/sessions/:handle/watches", post(watch).get(list_watches))
        .route("/v1/sessions/:handle/watches/:group/:field_group", delete(unwatch))
        .route("/v1/sessions/:handle/update", post(update_all))
        .route("/v1/sessions/:handle/values/:device/:field", get(latest_value))
        .route("/v1/sessions/:handle/values/:device/:field/since", get(value_since))
        .route("/v1/sessions/:handle/values/:device/:field/samples", get(samples))
        .route("/v1/sessions/:handle/values/:device/:field/error", get(last_error))
        .route("/v1/sessions/:handle/jobs", post(start_job).get(list_jobs).delete(remove_all_jobs))
        .route("/v1/sessions/:handle/jobs/:job_id", get(job_info).delete(remove_job))
        .route("/v1/sessions/:handle/jobs/:job_id/stop", post(stop_job))
        .with_state(state)
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    gpuwatch_obs::record(&state.daemon.stats().await);
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = ENCODER.encode(&metric_families, &mut buffer) {
        tracing::warn!(target: "api", error = %e, "metrics encoding failed");
        return (HttpStatus::INTERNAL_SERVER_ERROR, [("content-type", "text/plain".to_string())], Vec::new());
    }
    (HttpStatus::OK, [("content-type", ENCODER.format_type().to_string())], buffer)
}

async fn stats(State(state): State<AppState>) -> Json<DaemonStats> {
    Json(state.daemon.stats().await)
}

async fn connect(State(state): State<AppState>) -> Json<SessionResponse> {
    let handle = state.daemon.connect().await;
    Json(SessionResponse { handle })
}

async fn disconnect(State(state): State<AppState>, Path(handle): Path<u64>) -> Result<HttpStatus, ApiError> {
    state.daemon.disconnect(Handle(handle)).await?;
    Ok(HttpStatus::NO_CONTENT)
}

async fn list_devices(State(state): State<AppState>, Path(handle): Path<u64>) -> ApiResult<Vec<u32>> {
    Ok(Json(state.daemon.list_devices(Handle(handle)).await?))
}

async fn device_attributes(State(state): State<AppState>, Path((handle, index)): Path<(u64, u32)>) -> ApiResult<DeviceInfo> {
    Ok(Json(state.daemon.device_attributes(Handle(handle), index).await?))
}

async fn create_group(
    State(state): State<AppState>,
    Path(handle): Path<u64>,
    body: Result<Json<CreateGroupRequest>, JsonRejection>,
) -> ApiResult<GroupCreated> {
    let Json(req) = body?;
    let id = state.daemon.create_gpu_group(Handle(handle), req.kind, &req.name).await?;
    tracing::info!(target: "api", handle, group = id.0, "group created");
    Ok(Json(GroupCreated { id }))
}

async fn list_groups(State(state): State<AppState>, Path(handle): Path<u64>) -> ApiResult<Vec<GroupId>> {
    Ok(Json(state.daemon.list_gpu_groups(Handle(handle)).await?))
}

async fn group_info(State(state): State<AppState>, Path((handle, id)): Path<(u64, u32)>) -> ApiResult<GroupInfo> {
    Ok(Json(state.daemon.group_info(Handle(handle), GroupId(id)).await?))
}

async fn destroy_group(State(state): State<AppState>, Path((handle, id)): Path<(u64, u32)>) -> Result<HttpStatus, ApiError> {
    state.daemon.destroy_gpu_group(Handle(handle), GroupId(id)).await?;
    Ok(HttpStatus::NO_CONTENT)
}

async fn add_device(
    State(state): State<AppState>,
    Path((handle, id)): Path<(u64, u32)>,
    body: Result<Json<AddDeviceRequest>, JsonRejection>,
) -> Result<HttpStatus, ApiError> {
    let Json(req) = body?;
    state.daemon.add_device(Handle(handle), GroupId(id), req.device).await?;
    Ok(HttpStatus::NO_CONTENT)
}

async fn create_field_group(
    State(state): State<AppState>,
    Path(handle): Path<u64>,
    body: Result<Json<CreateFieldGroupRequest>, JsonRejection>,
) -> ApiResult<FieldGroupCreated> {
    let Json(req) = body?;
    let id = state.daemon.create_field_group(Handle(handle), &req.fields, &req.name).await?;
    tracing::info!(target: "api", handle, field_group = id.0, "field group created");
    Ok(Json(FieldGroupCreated { id }))
}

async fn list_field_groups(State(state): State<AppState>, Path(handle): Path<u64>) -> ApiResult<Vec<FieldGroupId>> {
    Ok(Json(state.daemon.list_field_groups(Handle(handle)).await?))
}

async fn field_group_info(State(state): State<AppState>, Path((handle, id)): Path<(u64, u32)>) -> ApiResult<FieldGroupInfo> {
    Ok(Json(state.daemon.field_group_info(Handle(handle), FieldGroupId(id)).await?))
}

async fn destroy_field_group(
    State(state): State<AppState>,
    Path((handle, id)): Path<(u64, u32)>,
) -> Result<HttpStatus, ApiError> {
    state.daemon.destroy_field_group(Handle(handle), FieldGroupId(id)).await?;
    Ok(HttpStatus::NO_CONTENT)
}

async fn watch(
    State(state): State<AppState>,
    Path(handle): Path<u64>,
    body: Result<Json<WatchRequest>, JsonRejection>,
) -> Result<HttpStatus, ApiError> {
    let Json(req) = body?;
    let params = WatchParams {
        update_interval: Duration::from_millis(req.update_interval_ms),
        max_keep_age: Duration::from_millis(req.max_keep_age_ms),
        max_keep_samples: req.max_keep_samples,
    };
    state.daemon.watch(Handle(handle), req.group_id, req.field_group_id, params).await?;
    Ok(HttpStatus::NO_CONTENT)
}

async fn list_watches(State(state): State<AppState>, Path(handle): Path<u64>) -> ApiResult<Vec<WatchInfo>> {
    Ok(Json(state.daemon.list_watches(Handle(handle)).await?))
}

async fn unwatch(
    State(state): State<AppState>,
    Path((handle, group, field_group)): Path<(u64, u32, u32)>,
) -> Result<HttpStatus, ApiError> {
    state.daemon.unwatch(Handle(handle), GroupId(group), FieldGroupId(field_group)).await?;
    Ok(HttpStatus::NO_CONTENT)
}

async fn update_all(State(state): State<AppState>, Path(handle): Path<u64>) -> ApiResult<UpdateResponse> {
    let ticked = state.daemon.update_all_fields(Handle(handle)).await?;
    Ok(Json(UpdateResponse { ticked }))
}

async fn latest_value(
    State(state): State<AppState>,
    Path((handle, device, field)): Path<(u64, u32, String)>,
) -> ApiResult<Sample> {
    let field: FieldId = field.parse()?;
    Ok(Json(state.daemon.latest_value(Handle(handle), device, field).await?))
}

async fn value_since(
    State(state): State<AppState>,
    Path((handle, device, field)): Path<(u64, u32, String)>,
    query: Result<Query<SinceQuery>, QueryRejection>,
) -> ApiResult<SinceResponse> {
    let Query(q) = query?;
    let field: FieldId = field.parse()?;
    let (sample, next_since_us) = state.daemon.value_since(Handle(handle), device, field, q.since_us).await?;
    Ok(Json(SinceResponse { sample, next_since_us }))
}

async fn samples(
    State(state): State<AppState>,
    Path((handle, device, field)): Path<(u64, u32, String)>,
) -> ApiResult<Vec<Sample>> {
    let field: FieldId = field.parse()?;
    Ok(Json(state.daemon.samples(Handle(handle), device, field).await?))
}

async fn last_error(
    State(state): State<AppState>,
    Path((handle, device, field)): Path<(u64, u32, String)>,
) -> ApiResult<Option<SampleError>> {
    let field: FieldId = field.parse()?;
    Ok(Json(state.daemon.last_error(Handle(handle), device, field).await?))
}

async fn start_job(
    State(state): State<AppState>,
    Path(handle): Path<u64>,
    body: Result<Json<StartJobRequest>, JsonRejection>,
) -> Result<HttpStatus, ApiError> {
    let Json(req) = body?;
    let keep = Duration::from_millis(req.max_keep_age_ms);
    state.daemon.start_job(Handle(handle), &req.job_id, req.group_id, keep).await?;
    Ok(HttpStatus::CREATED)
}

async fn list_jobs(State(state): State<AppState>, Path(handle): Path<u64>) -> ApiResult<Vec<String>> {
    Ok(Json(state.daemon.list_jobs(Handle(handle)).await?))
}

async fn job_info(State(state): State<AppState>, Path((handle, job_id)): Path<(u64, String)>) -> ApiResult<JobInfo> {
    Ok(Json(state.daemon.job_info(Handle(handle), &job_id).await?))
}

async fn stop_job(State(state): State<AppState>, Path((handle, job_id)): Path<(u64, String)>) -> ApiResult<JobInfo> {
    let handle = Handle(handle);
    state.daemon.stop_job(handle, &job_id).await?;
    Ok(Json(state.daemon.job_info(handle, &job_id).await?))
}

async fn remove_job(State(state): State<AppState>, Path((handle, job_id)): Path<(u64, String)>) -> Result<HttpStatus, ApiError> {
    state.daemon.remove_job(Handle(handle), &job_id).await?;
    Ok(HttpStatus::NO_CONTENT)
}

async fn remove_all_jobs(State(state): State<AppState>, Path(handle): Path<u64>) -> ApiResult<RemovedResponse> {
    let removed = state.daemon.remove_all_jobs(Handle(handle)).await?;
    Ok(Json(RemovedResponse { removed }))
}

async fn openapi() -> impl IntoResponse {
    let spec = serde_json::json!({
        "openapi": "3.0.0",
        "info": {"title": "gpuwatch API", "version": env!("CARGO_PKG_VERSION")},
        "paths": {
            "/v1/sessions": {"post": {"summary": "Open a session"}},
            "/v1/sessions/{handle}": {"delete": {"summary": "Close a session and everything it created"}},
            "/v1/sessions/{handle}/devices": {"get": {"summary": "List device indices"}},
            "/v1/sessions/{handle}/devices/{index}": {"get": {"summary": "Device attributes"}},
            "/v1/sessions/{handle}/groups": {"post": {"summary": "Create a GPU group"}, "get": {"summary": "List GPU groups"}},
            "/v1/sessions/{handle}/groups/{id}": {"get": {"summary": "GPU group info"}, "delete": {"summary": "Destroy a GPU group"}},
            "/v1/sessions/{handle}/groups/{id}/devices": {"post": {"summary": "Add a device to a GPU group"}},
            "/v1/sessions/{handle}/fieldgroups": {"post": {"summary": "Create a field group"}, "get": {"summary": "List field groups"}},
            "/v1/sessions/{handle}/fieldgroups/{id}": {"get": {"summary": "Field group info"}, "delete": {"summary": "Destroy a field group"}},
            "/v1/sessions/{handle}/watches": {"post": {"summary": "Watch a group/field-group pair"}, "get": {"summary": "List watches"}},
            "/v1/sessions/{handle}/watches/{group}/{field_group}": {"delete": {"summary": "Stop watching"}},
            "/v1/sessions/{handle}/update": {"post": {"summary": "Sample due watches (manual mode)"}},
            "/v1/sessions/{handle}/values/{device}/{field}": {"get": {"summary": "Latest sample"}},
            "/v1/sessions/{handle}/values/{device}/{field}/since": {"get": {"summary": "First sample since a timestamp"}},
            "/v1/sessions/{handle}/values/{device}/{field}/samples": {"get": {"summary": "Buffered samples"}},
            "/v1/sessions/{handle}/values/{device}/{field}/error": {"get": {"summary": "Last sampling failure"}},
            "/v1/sessions/{handle}/jobs": {"post": {"summary": "Start a job"}, "get": {"summary": "List jobs"}, "delete": {"summary": "Remove all jobs"}},
            "/v1/sessions/{handle}/jobs/{job_id}": {"get": {"summary": "Job statistics"}, "delete": {"summary": "Remove a job"}},
            "/v1/sessions/{handle}/jobs/{job_id}/stop": {"post": {"summary": "Stop a job"}},
            "/v1/stats": {"get": {"summary": "Daemon table and cache sizes"}},
            "/metrics": {"get": {"summary": "Prometheus metrics"}},
            "/healthz": {"get": {"summary": "health"}}
        }
    });
    Json(spec)
}
