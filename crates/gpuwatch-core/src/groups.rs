//! GPU groups and field groups.
//!
//! Ids come from per-category monotonic counters starting at 1 and are never
//! reused. Every entry carries the handle that created it; lookups through a
//! different handle behave as if the id did not exist.

use gpuwatch_common::config::Limits;
use gpuwatch_common::{FieldId, GpuWatchError, Result, MAX_NAME_LEN};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::device::DeviceRegistry;
use crate::session::Handle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldGroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FieldGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    #[default]
    Empty,
    /// Starts with every discovered device.
    Default,
}

#[derive(Debug, Clone)]
pub struct GpuGroup {
    pub id: GroupId,
    pub name: String,
    pub devices: Vec<u32>,
    pub owner: Handle,
}

#[derive(Debug, Clone)]
pub struct FieldGroup {
    pub id: FieldGroupId,
    pub name: String,
    pub fields: Vec<FieldId>,
    pub owner: Handle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub id: GroupId,
    pub name: String,
    pub devices: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldGroupInfo {
    pub id: FieldGroupId,
    pub name: String,
    pub fields: Vec<FieldId>,
}

impl From<&GpuGroup> for GroupInfo {
    fn from(g: &GpuGroup) -> Self {
        Self { id: g.id, name: g.name.clone(), devices: g.devices.clone() }
    }
}

impl From<&FieldGroup> for FieldGroupInfo {
    fn from(g: &FieldGroup) -> Self {
        Self { id: g.id, name: g.name.clone(), fields: g.fields.clone() }
    }
}

fn validate_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(GpuWatchError::BadParameter("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(GpuWatchError::BadParameter(format!("name longer than {MAX_NAME_LEN} bytes")));
    }
    Ok(trimmed.to_string())
}

#[derive(Debug)]
pub struct GroupRegistry {
    limits: Limits,
    next_group: u32,
    next_field_group: u32,
    groups: BTreeMap<GroupId, GpuGroup>,
    field_groups: BTreeMap<FieldGroupId, FieldGroup>,
}

impl GroupRegistry {
    pub fn new(limits: Limits) -> Self {
        Self { limits, next_group: 1, next_field_group: 1, groups: BTreeMap::new(), field_groups: BTreeMap::new() }
    }

    pub fn create_gpu_group(
        &mut self,
        owner: Handle,
        kind: GroupKind,
        name: &str,
        devices: &DeviceRegistry,
    ) -> Result<GroupId> {
        let name = validate_name(name)?;
        if self.groups.len() >= self.limits.max_groups {
            return Err(GpuWatchError::ResourceExhausted(format!("at most {} gpu groups", self.limits.max_groups)));
        }
        let members = match kind {
            GroupKind::Empty => Vec::new(),
            GroupKind::Default => {
                devices.indices().into_iter().take(self.limits.max_group_entities).collect()
            }
        };
        let id = GroupId(self.next_group);
        self.next_group += 1;
        self.groups.insert(id, GpuGroup { id, name, devices: members, owner });
        Ok(id)
    }

    pub fn add_device(&mut self, owner: Handle, id: GroupId, device: u32, devices: &DeviceRegistry) -> Result<()> {
        let max = self.limits.max_group_entities;
        let group = self.gpu_group_mut(owner, id)?;
        devices.get(device)?;
        if group.devices.contains(&device) {
            return Ok(());
        }
        if group.devices.len() >= max {
            return Err(GpuWatchError::ResourceExhausted(format!("gpu group {id} already holds {max} devices")));
        }
        group.devices.push(device);
        Ok(())
    }

    pub fn gpu_group(&self, owner: Handle, id: GroupId) -> Result<&GpuGroup> {
        self.groups
            .get(&id)
            .filter(|g| g.owner == owner)
            .ok_or_else(|| GpuWatchError::NotFound(format!("gpu group {id}")))
    }

    fn gpu_group_mut(&mut self, owner: Handle, id: GroupId) -> Result<&mut GpuGroup> {
        self.groups
            .get_mut(&id)
            .filter(|g| g.owner == owner)
            .ok_or_else(|| GpuWatchError::NotFound(format!("gpu group {id}")))
    }

    pub fn remove_gpu_group(&mut self, owner: Handle, id: GroupId) -> Result<GpuGroup> {
        self.gpu_group(owner, id)?;
        self.groups.remove(&id).ok_or_else(|| GpuWatchError::NotFound(format!("gpu group {id}")))
    }

    pub fn gpu_group_ids(&self, owner: Handle) -> Vec<GroupId> {
        self.groups.values().filter(|g| g.owner == owner).map(|g| g.id).collect()
    }

    /// Unscoped lookup used by the sampling path.
    pub fn find_gpu_group(&self, id: GroupId) -> Option<&GpuGroup> {
        self.groups.get(&id)
    }

    /// Validates the whole request before allocating an id; a rejected
    /// request leaves no trace.
    pub fn create_field_group(&mut self, owner: Handle, fields: &[u32], name: &str) -> Result<FieldGroupId> {
        let name = validate_name(name)?;
        if fields.is_empty() {
            return Err(GpuWatchError::BadParameter("field list must not be empty".into()));
        }
        if fields.len() > self.limits.max_fields_per_group {
            return Err(GpuWatchError::ResourceExhausted(format!(
                "at most {} fields per field group",
                self.limits.max_fields_per_group
            )));
        }
        let mut seen = HashSet::with_capacity(fields.len());
        let mut parsed = Vec::with_capacity(fields.len());
        for raw in fields {
            let field = FieldId::try_from(*raw)?;
            if !seen.insert(field) {
                return Err(GpuWatchError::BadParameter(format!("field {field} listed twice")));
            }
            parsed.push(field);
        }
        if self.field_groups.len() >= self.limits.max_field_groups {
            return Err(GpuWatchError::ResourceExhausted(format!(
                "at most {} field groups",
                self.limits.max_field_groups
            )));
        }
        let id = FieldGroupId(self.next_field_group);
        self.next_field_group += 1;
        self.field_groups.insert(id, FieldGroup { id, name, fields: parsed, owner });
        Ok(id)
    }

    pub fn field_group(&self, owner: Handle, id: FieldGroupId) -> Result<&FieldGroup> {
        self.field_groups
            .get(&id)
            .filter(|g| g.owner == owner)
            .ok_or_else(|| GpuWatchError::NotFound(format!("field group {id}")))
    }

    pub fn remove_field_group(&mut self, owner: Handle, id: FieldGroupId) -> Result<FieldGroup> {
        self.field_group(owner, id)?;
        self.field_groups.remove(&id).ok_or_else(|| GpuWatchError::NotFound(format!("field group {id}")))
    }

    pub fn field_group_ids(&self, owner: Handle) -> Vec<FieldGroupId> {
        self.field_groups.values().filter(|g| g.owner == owner).map(|g| g.id).collect()
    }

    pub fn find_field_group(&self, id: FieldGroupId) -> Option<&FieldGroup> {
        self.field_groups.get(&id)
    }

    /// Whether any of `owner`'s groups contains `device`.
    pub fn covers_device(&self, owner: Handle, device: u32) -> bool {
        self.groups.values().any(|g| g.owner == owner && g.devices.contains(&device))
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn field_group_count(&self) -> usize {
        self.field_groups.len()
    }
}
