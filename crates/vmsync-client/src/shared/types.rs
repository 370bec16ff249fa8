use serde::{Deserialize, Serialize};

pub use vmsync_core::{
    ActionKind, ActionOutcome, ActionRequest, ActionResult, Resource, ResourceId, ResourcePatch,
    ResourceStatus, Snapshot, Task, TaskStatus,
};

/// Backend-issued identifier of a long-running operation.
pub type TaskId = String;

/// Pagination passed through to the list endpoint untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub extra: Vec<(String, String)>,
}

impl ListQuery {
    pub fn with_limit(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::with_capacity(self.extra.len() + 2);
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(offset) = self.offset {
            pairs.push(("offset".to_string(), offset.to_string()));
        }
        pairs.extend(self.extra.iter().cloned());
        pairs
    }
}

/// Single resource as returned by the detail endpoint. Nested collections are
/// carried through for the view and never inspected by the sync core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDetail {
    #[serde(flatten)]
    pub resource: Resource,
    #[serde(default)]
    pub interfaces: Vec<serde_json::Value>,
    #[serde(default)]
    pub disks: Vec<serde_json::Value>,
}

impl ResourceDetail {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            interfaces: Vec::new(),
            disks: Vec::new(),
        }
    }
}

/// Body of a provisioning call. Fields the core does not know about go into
/// `extra` and are sent as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProvisionRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionAccepted {
    #[serde(alias = "taskId", deserialize_with = "task_id_from_string_or_number")]
    pub task_id: TaskId,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTaskId {
    Text(String),
    Number(u64),
}

fn task_id_from_string_or_number<'de, D>(deserializer: D) -> Result<TaskId, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match RawTaskId::deserialize(deserializer)? {
        RawTaskId::Text(id) => id,
        RawTaskId::Number(id) => id.to_string(),
    })
}
