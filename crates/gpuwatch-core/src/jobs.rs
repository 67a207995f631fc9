//! Job usage attribution.
//!
//! A job records the device scope of a GPU group at start and a time window.
//! Its summary is computed from the sample buffers on demand while it runs,
//! and frozen once when it stops.

use gpuwatch_common::{FieldId, GpuWatchError, Result, MAX_JOB_ID_LEN};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::cache::SampleCache;
use crate::groups::GroupId;
use crate::session::Handle;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldSummary {
    pub max: f64,
    pub min: f64,
    pub average: f64,
    pub std_dev: f64,
    pub samples: u64,
}

/// Usage of one device, or of the whole scope when `device` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceUsage {
    pub device: Option<u32>,
    pub start_time: u64,
    pub end_time: u64,
    /// Joules, integrated from power samples.
    pub energy_consumed: Option<f64>,
    /// `None` marks a field with no sample inside the window.
    pub fields: BTreeMap<FieldId, Option<FieldSummary>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    pub group_id: GroupId,
    pub running: bool,
    pub start_time: u64,
    pub stop_time: Option<u64>,
    pub num_devices: usize,
    pub summary: DeviceUsage,
    pub devices: Vec<DeviceUsage>,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub group_id: GroupId,
    pub owner: Handle,
    pub devices: Vec<u32>,
    pub start_time: u64,
    pub stop_time: Option<u64>,
    pub max_keep_age: Duration,
    frozen: Option<JobInfo>,
}

impl Job {
    pub fn new(job_id: String, group_id: GroupId, owner: Handle, devices: Vec<u32>, start_time: u64, max_keep_age: Duration) -> Self {
        Self { job_id, group_id, owner, devices, start_time, stop_time: None, max_keep_age, frozen: None }
    }

    pub fn is_running(&self) -> bool { self.stop_time.is_none() }

    /// Frozen summary for stopped jobs, a fresh one against `now` otherwise.
    pub fn info(&self, cache: &SampleCache, now: u64) -> JobInfo {
        match &self.frozen {
            Some(info) => info.clone(),
            None => summarize(self, cache, now),
        }
    }
}

pub fn validate_job_id(job_id: &str) -> Result<()> {
    if job_id.trim().is_empty() {
        return Err(GpuWatchError::BadParameter("job id must not be empty".into()));
    }
    if job_id.len() > MAX_JOB_ID_LEN {
        return Err(GpuWatchError::BadParameter(format!("job id longer than {MAX_JOB_ID_LEN} bytes")));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct JobTable {
    jobs: BTreeMap<String, Job>,
}

impl JobTable {
    pub fn insert(&mut self, job: Job) -> Result<()> {
        if self.jobs.contains_key(&job.job_id) {
            return Err(GpuWatchError::AlreadyExists(format!("job {}", job.job_id)));
        }
        self.jobs.insert(job.job_id.clone(), job);
        Ok(())
    }

    pub fn get(&self, owner: Handle, job_id: &str) -> Result<&Job> {
        self.jobs
            .get(job_id)
            .filter(|j| j.owner == owner)
            .ok_or_else(|| GpuWatchError::NotFound(format!("job {job_id}")))
    }

    /// Freeze the window and summary of a running job.
    pub fn stop(&mut self, owner: Handle, job_id: &str, cache: &SampleCache, now: u64) -> Result<&JobInfo> {
        let job = self
            .jobs
            .get_mut(job_id)
            .filter(|j| j.owner == owner && j.is_running())
            .ok_or_else(|| GpuWatchError::NotFound(format!("running job {job_id}")))?;
        job.stop_time = Some(now);
        let info = summarize(job, cache, now);
        Ok(job.frozen.insert(info))
    }

    pub fn remove(&mut self, owner: Handle, job_id: &str) -> Result<Job> {
        self.get(owner, job_id)?;
        self.jobs.remove(job_id).ok_or_else(|| GpuWatchError::NotFound(format!("job {job_id}")))
    }

    pub fn remove_owned(&mut self, owner: Handle) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, j| j.owner != owner);
        before - self.jobs.len()
    }

    pub fn ids(&self, owner: Handle) -> Vec<String> {
        self.jobs.values().filter(|j| j.owner == owner).map(|j| j.job_id.clone()).collect()
    }

    pub fn running(&self) -> impl Iterator<Item = &Job> + '_ {
        self.jobs.values().filter(|j| j.is_running())
    }

    pub fn len(&self) -> usize { self.jobs.len() }
    pub fn is_empty(&self) -> bool { self.jobs.is_empty() }
}

/// Running mean and variance (Welford).
#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Accumulator {
    fn push(&mut self, x: f64) {
        if self.count == 0 {
            self.min = x;
            self.max = x;
        } else {
            self.min = self.min.min(x);
            self.max = self.max.max(x);
        }
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    fn merge(&mut self, other: &Accumulator) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let total = self.count + other.count;
        let delta = other.mean - self.mean;
        self.m2 += other.m2 + delta * delta * (self.count as f64 * other.count as f64) / total as f64;
        self.mean += delta * other.count as f64 / total as f64;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count = total;
    }

    fn finish(&self) -> Option<FieldSummary> {
        if self.count == 0 {
            return None;
        }
        Some(FieldSummary {
            max: self.max,
            min: self.min,
            average: self.mean,
            std_dev: (self.m2 / self.count as f64).sqrt(),
            samples: self.count,
        })
    }
}

/// Trapezoidal integral of watts over microsecond timestamps, in joules.
fn energy(points: &[(u64, f64)]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let joules = points
        .windows(2)
        .map(|w| (w[0].1 + w[1].1) / 2.0 * (w[1].0 - w[0].0) as f64 / 1_000_000.0)
        .sum();
    Some(joules)
}

pub fn summarize(job: &Job, cache: &SampleCache, end: u64) -> JobInfo {
    let start = job.start_time;
    let mut overall: BTreeMap<FieldId, Accumulator> = FieldId::JOB_FIELDS.iter().map(|f| (*f, Accumulator::default())).collect();
    let mut total_energy: Option<f64> = None;
    let mut devices = Vec::with_capacity(job.devices.len());

    for &device in &job.devices {
        let mut fields: Vec<FieldId> = FieldId::JOB_FIELDS.to_vec();
        fields.extend(cache.fields_for(device).into_iter().filter(|f| !FieldId::JOB_FIELDS.contains(f)));

        let mut usage = BTreeMap::new();
        let mut power = Vec::new();
        for field in fields {
            let mut acc = Accumulator::default();
            for sample in cache.window((device, field), start, end) {
                let Some(x) = sample.value.as_f64() else { continue };
                acc.push(x);
                if field == FieldId::PowerUsage {
                    power.push((sample.ts, x));
                }
            }
            // string-valued fields have nothing to summarize
            if acc.count == 0 && !FieldId::JOB_FIELDS.contains(&field) {
                continue;
            }
            overall.entry(field).or_default().merge(&acc);
            usage.insert(field, acc.finish());
        }

        let energy_consumed = energy(&power);
        if let Some(j) = energy_consumed {
            *total_energy.get_or_insert(0.0) += j;
        }
        devices.push(DeviceUsage { device: Some(device), start_time: start, end_time: end, energy_consumed, fields: usage });
    }

    let summary = DeviceUsage {
        device: None,
        start_time: start,
        end_time: end,
        energy_consumed: total_energy,
        fields: overall.iter().map(|(f, acc)| (*f, acc.finish())).collect(),
    };

    JobInfo {
        job_id: job.job_id.clone(),
        group_id: job.group_id,
        running: job.is_running(),
        start_time: start,
        stop_time: job.stop_time,
        num_devices: job.devices.len(),
        summary,
        devices,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_matches_population_std_dev() {
        let mut acc = Accumulator::default();
        for x in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            acc.push(x);
        }
        let s = acc.finish().unwrap();
        assert_eq!(s.samples, 8);
        assert!((s.average - 5.0).abs() < 1e-9);
        assert!((s.std_dev - 2.0).abs() < 1e-9);
        assert_eq!(s.min, 2.0);
        assert_eq!(s.max, 9.0);
    }

    #[test]
    fn merged_accumulators_equal_a_single_pass() {
        let (mut a, mut b, mut all) = (Accumulator::default(), Accumulator::default(), Accumulator::default());
        for x in [1.0, 3.0, 8.0] { a.push(x); all.push(x); }
        for x in [2.0, 10.0] { b.push(x); all.push(x); }
        a.merge(&b);
        let (m, s) = (a.finish().unwrap(), all.finish().unwrap());
        assert_eq!(m.samples, s.samples);
        assert!((m.average - s.average).abs() < 1e-9);
        assert!((m.std_dev - s.std_dev).abs() < 1e-9);
    }

    #[test]
    fn energy_needs_two_points() {
        assert_eq!(energy(&[(0, 100.0)]), None);
        let joules = energy(&[(0, 100.0), (1_000_000, 200.0), (2_000_000, 200.0)]).unwrap();
        assert!((joules - 350.0).abs() < 1e-9);
    }
}
