//! Watch table and sampling tasks.
//!
//! Each active watch owns one tokio task ticking at its update interval. A
//! tick plans its targets under the table read lock, releases it, reads
//! every (device, field) pair concurrently on the blocking pool with a
//! timeout, and then records and trims under the cache lock. A pair whose
//! previous read is still blocked is not read again until it returns.

use gpuwatch_backend::read_field_scoped;
use gpuwatch_common::{FieldId, FieldValue, GpuWatchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};

use crate::cache::{FieldKey, Retention};
use crate::daemon::{Shared, Tables};
use crate::groups::{FieldGroupId, GroupId};
use crate::{micros, millis, now_micros};
use crate::session::Handle;

pub type WatchKey = (GroupId, FieldGroupId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchParams {
    pub update_interval: Duration,
    pub max_keep_age: Duration,
    /// `0` keeps every sample younger than `max_keep_age`.
    pub max_keep_samples: usize,
}

impl WatchParams {
    pub fn new(update_interval: Duration, max_keep_age: Duration) -> Self {
        Self { update_interval, max_keep_age, max_keep_samples: 0 }
    }

    pub fn retention(&self) -> Retention {
        Retention { max_keep_age: self.max_keep_age, max_keep_samples: self.max_keep_samples }
    }

    pub fn validate(&self) -> Result<()> {
        if self.update_interval.is_zero() {
            return Err(GpuWatchError::BadParameter("update interval must be non-zero".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchInfo {
    pub group_id: GroupId,
    pub field_group_id: FieldGroupId,
    pub update_interval_ms: u64,
    pub max_keep_age_ms: u64,
    pub max_keep_samples: usize,
    /// Microseconds since the epoch; `0` before the first tick.
    pub last_tick: u64,
}

#[derive(Debug)]
pub struct Watch {
    pub owner: Handle,
    pub params: WatchParams,
    generation: u64,
    last_tick: AtomicU64,
    task: Option<JoinHandle<()>>,
}

impl Watch {
    fn is_due(&self, now: u64) -> bool {
        let last = self.last_tick.load(Ordering::Relaxed);
        last == 0 || now.saturating_sub(last) >= micros(self.params.update_interval)
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Debug, Default)]
pub struct WatchTable {
    watches: BTreeMap<WatchKey, Watch>,
    next_generation: u64,
}

impl WatchTable {
    /// Insert or replace the watch on `key`. A replaced watch's task is
    /// aborted; the returned generation identifies the new one.
    pub fn arm(&mut self, key: WatchKey, owner: Handle, params: WatchParams) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        let previous = self.watches.get(&key).map(|w| w.last_tick.load(Ordering::Relaxed)).unwrap_or(0);
        self.watches.insert(
            key,
            Watch { owner, params, generation, last_tick: AtomicU64::new(previous), task: None },
        );
        generation
    }

    pub fn attach(&mut self, key: WatchKey, task: JoinHandle<()>) {
        match self.watches.get_mut(&key) {
            Some(watch) => watch.task = Some(task),
            None => task.abort(),
        }
    }

    pub fn disarm(&mut self, owner: Handle, key: WatchKey) -> Result<Watch> {
        match self.watches.get(&key) {
            Some(w) if w.owner == owner => {}
            _ => return Err(GpuWatchError::NotFound(format!("watch on group {} / field group {}", key.0, key.1))),
        }
        self.watches.remove(&key).ok_or_else(|| GpuWatchError::NotFound("watch".into()))
    }

    pub fn disarm_owned(&mut self, owner: Handle) -> usize {
        let before = self.watches.len();
        self.watches.retain(|_, w| w.owner != owner);
        before - self.watches.len()
    }

    pub fn disarm_all(&mut self) {
        self.watches.clear();
    }

    pub fn get(&self, key: &WatchKey) -> Option<&Watch> { self.watches.get(key) }

    pub fn references_group(&self, id: GroupId) -> bool { self.watches.keys().any(|(g, _)| *g == id) }

    pub fn references_field_group(&self, id: FieldGroupId) -> bool { self.watches.keys().any(|(_, f)| *f == id) }

    pub fn info(&self, owner: Handle) -> Vec<WatchInfo> {
        self.watches
            .iter()
            .filter(|(_, w)| w.owner == owner)
            .map(|(key, w)| WatchInfo {
                group_id: key.0,
                field_group_id: key.1,
                update_interval_ms: millis(w.params.update_interval),
                max_keep_age_ms: millis(w.params.max_keep_age),
                max_keep_samples: w.params.max_keep_samples,
                last_tick: w.last_tick.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Watches of `owner` whose interval has elapsed, with their generation.
    pub fn due(&self, owner: Handle, now: u64) -> Vec<(WatchKey, u64)> {
        self.watches
            .iter()
            .filter(|(_, w)| w.owner == owner && w.is_due(now))
            .map(|(key, w)| (*key, w.generation))
            .collect()
    }

    pub fn len(&self) -> usize { self.watches.len() }
    pub fn is_empty(&self) -> bool { self.watches.is_empty() }

    fn iter(&self) -> impl Iterator<Item = (&WatchKey, &Watch)> + '_ { self.watches.iter() }
}

/// Effective retention of every buffer something still depends on.
pub(crate) struct Coverage {
    pairs: HashMap<FieldKey, Retention>,
    devices: HashMap<u32, Duration>,
}

impl Coverage {
    pub(crate) fn build(tables: &Tables) -> Self {
        let mut pairs: HashMap<FieldKey, Retention> = HashMap::new();
        for (key, watch) in tables.watches.iter() {
            let (devices, fields) = resolve(tables, *key);
            for &device in devices {
                for &field in fields {
                    let retention = watch.params.retention();
                    pairs.entry((device, field)).and_modify(|r| *r = r.merge(retention)).or_insert(retention);
                }
            }
        }
        let mut devices: HashMap<u32, Duration> = HashMap::new();
        for job in tables.jobs.running() {
            for &device in &job.devices {
                let age = devices.entry(device).or_default();
                *age = (*age).max(job.max_keep_age);
            }
        }
        Self { pairs, devices }
    }

    pub(crate) fn get(&self, key: &FieldKey) -> Option<Retention> {
        let pair = self.pairs.get(key).copied();
        let job = self.devices.get(&key.0).map(|age| Retention::age_only(*age));
        match (pair, job) {
            (Some(p), Some(j)) => Some(p.merge(j)),
            (p, j) => p.or(j),
        }
    }
}

/// Devices and fields a watch covers. Watched groups cannot be destroyed,
/// so a miss is a broken table and panics.
fn resolve(tables: &Tables, key: WatchKey) -> (&[u32], &[FieldId]) {
    let Some(group) = tables.groups.find_gpu_group(key.0) else {
        panic!("watch {key:?} references missing gpu group {}", key.0);
    };
    let Some(field_group) = tables.groups.find_field_group(key.1) else {
        panic!("watch {key:?} references missing field group {}", key.1);
    };
    (&group.devices, &field_group.fields)
}

/// Pairs with a read on the blocking pool, and when that read started.
pub(crate) type InFlightSet = Arc<Mutex<HashMap<FieldKey, u64>>>;

/// Claim on one pair's read. Released when the blocking read returns, which
/// can be long after the tick gave up waiting for it.
struct InFlight {
    set: InFlightSet,
    key: FieldKey,
}

impl InFlight {
    /// Fails with the start time of the read already holding `key`.
    fn claim(set: &InFlightSet, key: FieldKey, now: u64) -> std::result::Result<Self, u64> {
        let mut pairs = set.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(started) = pairs.get(&key) {
            return Err(*started);
        }
        pairs.insert(key, now);
        Ok(Self { set: set.clone(), key })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.key);
    }
}

/// Sample every pair covered by the watch once. Returns `false` when the
/// watch is gone or was re-armed under a newer generation.
pub(crate) async fn tick(shared: &Shared, key: WatchKey, generation: u64) -> bool {
    let plan: Vec<(FieldKey, Retention)> = {
        let tables = shared.tables.read().await;
        let Some(watch) = tables.watches.get(&key) else { return false };
        if watch.generation != generation {
            return false;
        }
        watch.last_tick.store(now_micros(), Ordering::Relaxed);
        let coverage = Coverage::build(&tables);
        let (devices, fields) = resolve(&tables, key);
        let mut plan = Vec::with_capacity(devices.len() * fields.len());
        for &device in devices {
            for &field in fields {
                let retention = coverage.get(&(device, field)).unwrap_or_else(|| watch.params.retention());
                plan.push(((device, field), retention));
            }
        }
        plan
    };

    let timeout = shared.config.read_timeout();
    let mut results = Vec::new();
    let mut reads = JoinSet::new();
    for ((device, field), retention) in plan {
        let started = now_micros();
        if !shared.devices.supports(field) {
            let unsupported = GpuWatchError::NotSupported(format!("{field} on device {device}"));
            results.push(((device, field), started, Err(unsupported), retention));
            continue;
        }
        let claim = match InFlight::claim(&shared.in_flight, (device, field), started) {
            Ok(claim) => claim,
            // another watch is reading this pair right now; its result lands in the same buffer
            Err(since) if started.saturating_sub(since) < micros(timeout) => continue,
            Err(since) => {
                let stalled = GpuWatchError::Timeout(format!(
                    "read of {field} on device {device} blocked for {}ms",
                    started.saturating_sub(since) / 1000
                ));
                results.push(((device, field), started, Err(stalled), retention));
                continue;
            }
        };
        let source = shared.source.clone();
        let caps = shared.caps.clone();
        reads.spawn(async move {
            let read = tokio::task::spawn_blocking(move || {
                let _claim = claim;
                read_field_scoped(source.as_ref(), caps.as_ref(), device, field)
            });
            let outcome: Result<FieldValue> = match time::timeout(timeout, read).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(join)) => Err(GpuWatchError::Telemetry(format!("read task failed: {join}"))),
                Err(_) => Err(GpuWatchError::Timeout(format!(
                    "reading {field} on device {device} took longer than {}ms",
                    timeout.as_millis()
                ))),
            };
            ((device, field), now_micros(), outcome, retention)
        });
    }

    while let Some(joined) = reads.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => tracing::warn!(target: "scheduler", error = %e, "sample task ended abnormally"),
        }
    }

    let mut cache = shared.cache.lock().await;
    let now = now_micros();
    let mut failures = 0usize;
    for (pair, ts, outcome, retention) in results {
        if let Err(e) = &outcome {
            failures += 1;
            tracing::warn!(target: "scheduler", device = pair.0, field = %pair.1, code = e.code().0, error = %e, "sample failed");
        }
        cache.record(pair, ts, outcome, retention);
        cache.evict(pair, retention, now);
    }
    tracing::debug!(target: "scheduler", group = %key.0, field_group = %key.1, failures, "tick");
    true
}

pub(crate) fn spawn_watch(shared: &Arc<Shared>, key: WatchKey, generation: u64, interval: Duration) -> JoinHandle<()> {
    let shared: Weak<Shared> = Arc::downgrade(shared);
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(shared) = shared.upgrade() else { break };
            if !tick(&shared, key, generation).await {
                break;
            }
        }
    })
}

/// Trim every buffer and drop the ones nothing covers any more.
pub(crate) async fn sweep(shared: &Shared) {
    let tables = shared.tables.read().await;
    let coverage = Coverage::build(&tables);
    let (sessions, watches, jobs) = (tables.sessions.live_count(), tables.watches.len(), tables.jobs.len());
    let mut cache = shared.cache.lock().await;
    drop(tables);
    let dropped = cache.sweep(&|key| coverage.get(key), now_micros());
    tracing::debug!(
        target: "janitor",
        sessions,
        watches,
        jobs,
        buffers = cache.buffer_count(),
        samples = cache.total_samples(),
        dropped,
        "sweep"
    );
}

pub(crate) fn spawn_janitor(shared: &Arc<Shared>, interval: Duration) -> JoinHandle<()> {
    let shared: Weak<Shared> = Arc::downgrade(shared);
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(shared) = shared.upgrade() else { break };
            sweep(&shared).await;
        }
    })
}

/// Manual-mode sampling: tick every due watch of `owner` once.
pub(crate) async fn update_all(shared: &Shared, owner: Handle) -> Result<usize> {
    let due = {
        let tables = shared.tables.read().await;
        tables.sessions.validate(owner)?;
        tables.watches.due(owner, now_micros())
    };
    let mut ticked = 0;
    for (key, generation) in due {
        if tick(shared, key, generation).await {
            ticked += 1;
        }
    }
    sweep(shared).await;
    Ok(ticked)
}
