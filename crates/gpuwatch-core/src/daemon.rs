//! Handle-scoped operation surface.

use gpuwatch_backend::{CapabilityProvider, NoCapabilities, TelemetrySource};
use gpuwatch_common::config::{GpuWatchConfig, OperationMode};
use gpuwatch_common::{FieldId, GpuWatchError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::cache::{Sample, SampleCache, SampleError};
use crate::device::{DeviceInfo, DeviceRegistry};
use crate::groups::{FieldGroupId, FieldGroupInfo, GroupId, GroupInfo, GroupKind, GroupRegistry};
use crate::jobs::{validate_job_id, Job, JobInfo, JobTable};
use crate::scheduler::{self, WatchInfo, WatchParams, WatchTable};
use crate::session::{Handle, SessionTable};
use crate::{millis, now_micros};

pub(crate) struct Tables {
    pub(crate) sessions: SessionTable,
    pub(crate) groups: GroupRegistry,
    pub(crate) watches: WatchTable,
    pub(crate) jobs: JobTable,
}

pub(crate) struct Shared {
    pub(crate) config: GpuWatchConfig,
    pub(crate) devices: DeviceRegistry,
    pub(crate) source: Arc<dyn TelemetrySource>,
    pub(crate) caps: Arc<dyn CapabilityProvider>,
    /// Lock order: `tables` before `cache`.
    pub(crate) tables: RwLock<Tables>,
    pub(crate) cache: Mutex<SampleCache>,
    pub(crate) in_flight: scheduler::InFlightSet,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStats {
    pub sessions: usize,
    pub gpu_groups: usize,
    pub field_groups: usize,
    pub watches: usize,
    pub jobs: usize,
    pub buffers: usize,
    pub buffered_samples: usize,
    pub sample_failures: u64,
}

/// The monitoring daemon. Cheap to clone; clones share state.
///
/// Must be started inside a tokio runtime: in `Auto` mode every watch and
/// the buffer janitor run as spawned tasks.
#[derive(Clone)]
pub struct Daemon {
    shared: Arc<Shared>,
}

impl Daemon {
    pub fn start(config: GpuWatchConfig, source: Arc<dyn TelemetrySource>) -> Result<Self> {
        Self::start_with(config, source, Arc::new(NoCapabilities))
    }

    pub fn start_with(
        config: GpuWatchConfig,
        source: Arc<dyn TelemetrySource>,
        caps: Arc<dyn CapabilityProvider>,
    ) -> Result<Self> {
        let devices = DeviceRegistry::discover(source.as_ref())?;
        let tables = Tables {
            sessions: SessionTable::default(),
            groups: GroupRegistry::new(config.limits.clone()),
            watches: WatchTable::default(),
            jobs: JobTable::default(),
        };
        let mode = config.mode;
        let janitor_interval = config.janitor_interval();
        let shared = Arc::new(Shared {
            config,
            devices,
            source,
            caps,
            tables: RwLock::new(tables),
            cache: Mutex::new(SampleCache::new()),
            in_flight: Default::default(),
            janitor: Mutex::new(None),
        });
        if mode == OperationMode::Auto {
            let janitor = scheduler::spawn_janitor(&shared, janitor_interval);
            if let Ok(mut slot) = shared.janitor.try_lock() {
                *slot = Some(janitor);
            }
        }
        tracing::info!(target: "daemon", ?mode, devices = shared.devices.count(), "daemon started");
        Ok(Self { shared })
    }

    pub fn mode(&self) -> OperationMode { self.shared.config.mode }

    pub async fn connect(&self) -> Handle {
        let handle = self.shared.tables.write().await.sessions.open();
        tracing::info!(target: "session", %handle, "connected");
        handle
    }

    /// Tear down everything `handle` created: jobs, then watches, then field
    /// groups, then GPU groups.
    pub async fn disconnect(&self, handle: Handle) -> Result<()> {
        let mut tables = self.shared.tables.write().await;
        if !tables.sessions.close(handle)? {
            return Ok(());
        }
        let jobs = tables.jobs.remove_owned(handle);
        let watches = tables.watches.disarm_owned(handle);
        let mut field_groups = 0;
        for id in tables.groups.field_group_ids(handle) {
            tables.groups.remove_field_group(handle, id)?;
            field_groups += 1;
        }
        let mut groups = 0;
        for id in tables.groups.gpu_group_ids(handle) {
            tables.groups.remove_gpu_group(handle, id)?;
            groups += 1;
        }
        tracing::info!(target: "session", %handle, jobs, watches, field_groups, groups, "disconnected");
        Ok(())
    }

    pub async fn list_devices(&self, handle: Handle) -> Result<Vec<u32>> {
        self.shared.tables.read().await.sessions.validate(handle)?;
        Ok(self.shared.devices.indices())
    }

    pub async fn device_attributes(&self, handle: Handle, index: u32) -> Result<DeviceInfo> {
        self.shared.tables.read().await.sessions.validate(handle)?;
        self.shared.devices.get(index).cloned()
    }

    pub async fn create_gpu_group(&self, handle: Handle, kind: GroupKind, name: &str) -> Result<GroupId> {
        let mut tables = self.shared.tables.write().await;
        tables.sessions.validate(handle)?;
        let id = tables.groups.create_gpu_group(handle, kind, name, &self.shared.devices)?;
        tracing::info!(target: "groups", %handle, group = %id, ?kind, "gpu group created");
        Ok(id)
    }

    pub async fn add_device(&self, handle: Handle, group: GroupId, device: u32) -> Result<()> {
        let mut tables = self.shared.tables.write().await;
        tables.sessions.validate(handle)?;
        tables.groups.add_device(handle, group, device, &self.shared.devices)
    }

    pub async fn group_info(&self, handle: Handle, group: GroupId) -> Result<GroupInfo> {
        let tables = self.shared.tables.read().await;
        tables.sessions.validate(handle)?;
        tables.groups.gpu_group(handle, group).map(GroupInfo::from)
    }

    pub async fn destroy_gpu_group(&self, handle: Handle, group: GroupId) -> Result<()> {
        let mut tables = self.shared.tables.write().await;
        tables.sessions.validate(handle)?;
        tables.groups.gpu_group(handle, group)?;
        if tables.watches.references_group(group) {
            return Err(GpuWatchError::Conflict(format!("gpu group {group} has an active watch")));
        }
        tables.groups.remove_gpu_group(handle, group)?;
        tracing::info!(target: "groups", %handle, %group, "gpu group destroyed");
        Ok(())
    }

    pub async fn list_gpu_groups(&self, handle: Handle) -> Result<Vec<GroupId>> {
        let tables = self.shared.tables.read().await;
        tables.sessions.validate(handle)?;
        Ok(tables.groups.gpu_group_ids(handle))
    }

    pub async fn create_field_group(&self, handle: Handle, fields: &[u32], name: &str) -> Result<FieldGroupId> {
        let mut tables = self.shared.tables.write().await;
        tables.sessions.validate(handle)?;
        let id = tables.groups.create_field_group(handle, fields, name)?;
        tracing::info!(target: "groups", %handle, field_group = %id, fields = fields.len(), "field group created");
        Ok(id)
    }

    pub async fn field_group_info(&self, handle: Handle, id: FieldGroupId) -> Result<FieldGroupInfo> {
        let tables = self.shared.tables.read().await;
        tables.sessions.validate(handle)?;
        tables.groups.field_group(handle, id).map(FieldGroupInfo::from)
    }

    pub async fn destroy_field_group(&self, handle: Handle, id: FieldGroupId) -> Result<()> {
        let mut tables = self.shared.tables.write().await;
        tables.sessions.validate(handle)?;
        tables.groups.field_group(handle, id)?;
        if tables.watches.references_field_group(id) {
            return Err(GpuWatchError::Conflict(format!("field group {id} has an active watch")));
        }
        tables.groups.remove_field_group(handle, id)?;
        tracing::info!(target: "groups", %handle, field_group = %id, "field group destroyed");
        Ok(())
    }

    pub async fn list_field_groups(&self, handle: Handle) -> Result<Vec<FieldGroupId>> {
        let tables = self.shared.tables.read().await;
        tables.sessions.validate(handle)?;
        Ok(tables.groups.field_group_ids(handle))
    }

    /// Arm a watch, or refresh the parameters of an active one. Buffers
    /// already collected for the pair are kept.
    pub async fn watch(&self, handle: Handle, group: GroupId, field_group: FieldGroupId, params: WatchParams) -> Result<()> {
        params.validate()?;
        let mut tables = self.shared.tables.write().await;
        tables.sessions.validate(handle)?;
        tables.groups.gpu_group(handle, group)?;
        tables.groups.field_group(handle, field_group)?;
        let key = (group, field_group);
        let generation = tables.watches.arm(key, handle, params);
        if self.shared.config.mode == OperationMode::Auto {
            let task = scheduler::spawn_watch(&self.shared, key, generation, params.update_interval);
            tables.watches.attach(key, task);
        }
        tracing::info!(
            target: "scheduler",
            %handle,
            %group,
            %field_group,
            interval_ms = millis(params.update_interval),
            max_keep_age_ms = millis(params.max_keep_age),
            "watch armed"
        );
        Ok(())
    }

    pub async fn unwatch(&self, handle: Handle, group: GroupId, field_group: FieldGroupId) -> Result<()> {
        let mut tables = self.shared.tables.write().await;
        tables.sessions.validate(handle)?;
        tables.watches.disarm(handle, (group, field_group))?;
        tracing::info!(target: "scheduler", %handle, %group, %field_group, "watch removed");
        Ok(())
    }

    pub async fn list_watches(&self, handle: Handle) -> Result<Vec<WatchInfo>> {
        let tables = self.shared.tables.read().await;
        tables.sessions.validate(handle)?;
        Ok(tables.watches.info(handle))
    }

    /// Sample every due watch of `handle` once. Only meaningful in `Manual`
    /// mode; returns how many watches ticked.
    pub async fn update_all_fields(&self, handle: Handle) -> Result<usize> {
        scheduler::update_all(&self.shared, handle).await
    }

    async fn check_covered(&self, handle: Handle, device: u32) -> Result<()> {
        let tables = self.shared.tables.read().await;
        tables.sessions.validate(handle)?;
        self.shared.devices.get(device)?;
        if !tables.groups.covers_device(handle, device) {
            return Err(GpuWatchError::NotFound(format!("device {device} is not in any group of this session")));
        }
        Ok(())
    }

    pub async fn latest_value(&self, handle: Handle, device: u32, field: FieldId) -> Result<Sample> {
        self.check_covered(handle, device).await?;
        self.shared.cache.lock().await.latest((device, field)).cloned()
    }

    /// First sample at or after `since`, and the timestamp to ask for next.
    pub async fn value_since(&self, handle: Handle, device: u32, field: FieldId, since: u64) -> Result<(Sample, u64)> {
        self.check_covered(handle, device).await?;
        let cache = self.shared.cache.lock().await;
        let (sample, next) = cache.since((device, field), since)?;
        Ok((sample.clone(), next))
    }

    /// Every buffered sample for the pair, oldest first.
    pub async fn samples(&self, handle: Handle, device: u32, field: FieldId) -> Result<Vec<Sample>> {
        self.check_covered(handle, device).await?;
        Ok(self.shared.cache.lock().await.samples((device, field)))
    }

    pub async fn last_error(&self, handle: Handle, device: u32, field: FieldId) -> Result<Option<SampleError>> {
        self.check_covered(handle, device).await?;
        Ok(self.shared.cache.lock().await.last_error((device, field)).cloned())
    }

    /// Start attributing usage of `group`'s current devices to `job_id`.
    /// Buffers of those devices are kept for at least `max_keep_age` while
    /// the job runs.
    pub async fn start_job(&self, handle: Handle, job_id: &str, group: GroupId, max_keep_age: Duration) -> Result<()> {
        let mut tables = self.shared.tables.write().await;
        tables.sessions.validate(handle)?;
        if !self.shared.source.supports_job_stats() {
            return Err(GpuWatchError::NotSupported("job statistics on this system".into()));
        }
        validate_job_id(job_id)?;
        let devices = tables.groups.gpu_group(handle, group)?.devices.clone();
        if devices.is_empty() {
            return Err(GpuWatchError::NotFound(format!("gpu group {group} has no devices")));
        }
        let job = Job::new(job_id.to_string(), group, handle, devices, now_micros(), max_keep_age);
        tables.jobs.insert(job)?;
        tracing::info!(target: "jobs", %handle, job = job_id, %group, "job started");
        Ok(())
    }

    pub async fn stop_job(&self, handle: Handle, job_id: &str) -> Result<()> {
        let mut tables = self.shared.tables.write().await;
        tables.sessions.validate(handle)?;
        let cache = self.shared.cache.lock().await;
        let info = tables.jobs.stop(handle, job_id, &cache, now_micros())?;
        tracing::info!(target: "jobs", %handle, job = job_id, energy = ?info.summary.energy_consumed, "job stopped");
        Ok(())
    }

    pub async fn job_info(&self, handle: Handle, job_id: &str) -> Result<JobInfo> {
        let tables = self.shared.tables.read().await;
        tables.sessions.validate(handle)?;
        let job = tables.jobs.get(handle, job_id)?;
        let cache = self.shared.cache.lock().await;
        Ok(job.info(&cache, now_micros()))
    }

    pub async fn list_jobs(&self, handle: Handle) -> Result<Vec<String>> {
        let tables = self.shared.tables.read().await;
        tables.sessions.validate(handle)?;
        Ok(tables.jobs.ids(handle))
    }

    pub async fn remove_job(&self, handle: Handle, job_id: &str) -> Result<()> {
        let mut tables = self.shared.tables.write().await;
        tables.sessions.validate(handle)?;
        tables.jobs.remove(handle, job_id)?;
        tracing::info!(target: "jobs", %handle, job = job_id, "job removed");
        Ok(())
    }

    pub async fn remove_all_jobs(&self, handle: Handle) -> Result<usize> {
        let mut tables = self.shared.tables.write().await;
        tables.sessions.validate(handle)?;
        Ok(tables.jobs.remove_owned(handle))
    }

    pub async fn stats(&self) -> DaemonStats {
        let tables = self.shared.tables.read().await;
        let cache = self.shared.cache.lock().await;
        DaemonStats {
            sessions: tables.sessions.live_count(),
            gpu_groups: tables.groups.group_count(),
            field_groups: tables.groups.field_group_count(),
            watches: tables.watches.len(),
            jobs: tables.jobs.len(),
            buffers: cache.buffer_count(),
            buffered_samples: cache.total_samples(),
            sample_failures: cache.total_failures(),
        }
    }

    /// Stop every sampling task and the janitor. Tables stay readable.
    pub async fn shutdown(&self) {
        if let Some(janitor) = self.shared.janitor.lock().await.take() {
            janitor.abort();
        }
        let mut tables = self.shared.tables.write().await;
        let watches = tables.watches.len();
        tables.watches.disarm_all();
        tracing::info!(target: "daemon", watches, "daemon stopped");
    }
}
