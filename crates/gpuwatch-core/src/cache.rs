//! Per (device, field) sample buffers.

use gpuwatch_common::{FieldId, FieldValue, GpuWatchError, Result, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

pub type FieldKey = (u32, FieldId);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Microseconds since the Unix epoch.
    pub ts: u64,
    pub value: FieldValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleError {
    pub ts: u64,
    pub status: StatusCode,
    pub message: String,
    /// Failures recorded for this pair since its buffer was created.
    pub count: u64,
}

/// How long, and how many, samples a buffer keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub max_keep_age: Duration,
    /// `0` leaves the buffer unbounded by count.
    pub max_keep_samples: usize,
}

impl Retention {
    pub fn age_only(max_keep_age: Duration) -> Self { Self { max_keep_age, max_keep_samples: 0 } }

    /// The looser of two retentions.
    pub fn merge(self, other: Retention) -> Retention {
        let max_keep_samples = if self.max_keep_samples == 0 || other.max_keep_samples == 0 {
            0
        } else {
            self.max_keep_samples.max(other.max_keep_samples)
        };
        Retention { max_keep_age: self.max_keep_age.max(other.max_keep_age), max_keep_samples }
    }
}

#[derive(Debug)]
struct Buffer {
    samples: VecDeque<Sample>,
    retention: Retention,
    last_error: Option<SampleError>,
    failures: u64,
}

impl Buffer {
    fn new(retention: Retention) -> Self {
        Self { samples: VecDeque::new(), retention, last_error: None, failures: 0 }
    }

    fn push(&mut self, sample: Sample) {
        match self.samples.back() {
            Some(last) if last.ts > sample.ts => {
                let at = self.samples.partition_point(|s| s.ts <= sample.ts);
                self.samples.insert(at, sample);
            }
            _ => self.samples.push_back(sample),
        }
    }

    /// A watched pair always keeps its newest sample, whatever its age.
    fn evict(&mut self, now: u64, watched: bool) {
        let age = crate::micros(self.retention.max_keep_age);
        let cutoff = now.saturating_sub(age);
        let floor = usize::from(watched);
        while self.samples.len() > floor && self.samples.front().is_some_and(|s| s.ts < cutoff) {
            self.samples.pop_front();
        }
        let cap = self.retention.max_keep_samples;
        if cap > 0 {
            while self.samples.len() > cap {
                self.samples.pop_front();
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct SampleCache {
    buffers: HashMap<FieldKey, Buffer>,
    failures_total: u64,
}

impl SampleCache {
    pub fn new() -> Self { Self::default() }

    /// Store the outcome of one read taken at `ts`.
    pub fn record(&mut self, key: FieldKey, ts: u64, outcome: Result<FieldValue>, retention: Retention) {
        let buffer = self.buffers.entry(key).or_insert_with(|| Buffer::new(retention));
        buffer.retention = retention;
        match outcome {
            Ok(value) => buffer.push(Sample { ts, value }),
            Err(e) => {
                self.failures_total += 1;
                buffer.failures += 1;
                buffer.last_error =
                    Some(SampleError { ts, status: e.code(), message: e.to_string(), count: buffer.failures });
            }
        }
    }

    /// Trim one buffer under `retention`, which also becomes its remembered policy.
    pub fn evict(&mut self, key: FieldKey, retention: Retention, now: u64) {
        if let Some(buffer) = self.buffers.get_mut(&key) {
            buffer.retention = retention;
            buffer.evict(now, true);
        }
    }

    /// Trim every buffer. Pairs missing from `live` fall back to their last
    /// known retention and are dropped once empty.
    pub fn sweep(&mut self, live: &dyn Fn(&FieldKey) -> Option<Retention>, now: u64) -> usize {
        let before = self.buffers.len();
        self.buffers.retain(|key, buffer| {
            let covered = live(key);
            if let Some(retention) = covered {
                buffer.retention = retention;
            }
            buffer.evict(now, covered.is_some());
            covered.is_some() || !buffer.samples.is_empty()
        });
        before - self.buffers.len()
    }

    pub fn latest(&self, key: FieldKey) -> Result<&Sample> {
        self.buffers
            .get(&key)
            .and_then(|b| b.samples.back())
            .ok_or_else(|| no_samples(key))
    }

    /// First sample at or after `since`, and the timestamp to pass next time.
    pub fn since(&self, key: FieldKey, since: u64) -> Result<(&Sample, u64)> {
        let buffer = self.buffers.get(&key).ok_or_else(|| no_samples(key))?;
        let at = buffer.samples.partition_point(|s| s.ts < since);
        let sample = buffer.samples.get(at).ok_or_else(|| no_samples(key))?;
        let next = buffer.samples.get(at + 1).map(|s| s.ts).unwrap_or(sample.ts + 1);
        Ok((sample, next))
    }

    /// Samples with `start <= ts <= end`, oldest first.
    pub fn window(&self, key: FieldKey, start: u64, end: u64) -> impl Iterator<Item = &Sample> + '_ {
        self.buffers
            .get(&key)
            .into_iter()
            .flat_map(|b| b.samples.iter())
            .skip_while(move |s| s.ts < start)
            .take_while(move |s| s.ts <= end)
    }

    pub fn samples(&self, key: FieldKey) -> Vec<Sample> {
        self.buffers.get(&key).map(|b| b.samples.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn len(&self, key: FieldKey) -> usize {
        self.buffers.get(&key).map(|b| b.samples.len()).unwrap_or(0)
    }

    pub fn last_error(&self, key: FieldKey) -> Option<&SampleError> {
        self.buffers.get(&key).and_then(|b| b.last_error.as_ref())
    }

    /// Fields with a buffer for `device`, in catalogue order.
    pub fn fields_for(&self, device: u32) -> Vec<FieldId> {
        let mut fields: Vec<FieldId> = self.buffers.keys().filter(|(d, _)| *d == device).map(|(_, f)| *f).collect();
        fields.sort();
        fields
    }

    pub fn buffer_count(&self) -> usize { self.buffers.len() }
    pub fn total_samples(&self) -> usize { self.buffers.values().map(|b| b.samples.len()).sum() }
    /// Failed reads since startup, including those of dropped buffers.
    pub fn total_failures(&self) -> u64 { self.failures_total }
}

fn no_samples((device, field): FieldKey) -> GpuWatchError {
    GpuWatchError::NotFound(format!("no samples for {field} on device {device}"))
}
