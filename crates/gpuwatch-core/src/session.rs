use gpuwatch_common::{GpuWatchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Opaque session token. `0` is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub u64);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub struct SessionTable {
    next: u64,
    live: BTreeSet<u64>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self { next: 1, live: BTreeSet::new() }
    }
}

impl SessionTable {
    pub fn open(&mut self) -> Handle {
        let id = self.next;
        self.next += 1;
        self.live.insert(id);
        Handle(id)
    }

    pub fn validate(&self, handle: Handle) -> Result<()> {
        if self.live.contains(&handle.0) {
            Ok(())
        } else {
            Err(GpuWatchError::InvalidHandle)
        }
    }

    /// Whether `handle` was issued at some point, live or not.
    pub fn was_issued(&self, handle: Handle) -> bool {
        handle.0 != 0 && handle.0 < self.next
    }

    /// Returns `true` when the handle was live and is now closed.
    pub fn close(&mut self, handle: Handle) -> Result<bool> {
        if self.live.remove(&handle.0) {
            return Ok(true);
        }
        if self.was_issued(handle) {
            return Ok(false);
        }
        Err(GpuWatchError::InvalidHandle)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn live(&self) -> impl Iterator<Item = Handle> + '_ {
        self.live.iter().map(|id| Handle(*id))
    }
}
