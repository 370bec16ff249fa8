pub mod snapshot;

pub use snapshot::Snapshot;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("Unknown resource status: {0}")]
    UnknownStatus(String),
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error("Unknown task status: {0}")]
    UnknownTaskStatus(String),
    #[error("Invalid task progress: completed {completed} exceeds total {total}")]
    InvalidTaskProgress { completed: u64, total: u64 },
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Stable backend identity of a managed resource.
pub type ResourceId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceStatus {
    PoweredOn,
    PoweredOff,
    Suspended,
    /// Transient. Only ever set locally by an optimistic transition.
    Restarting,
    Unknown,
    Deleted,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::PoweredOn => "POWERED_ON",
            ResourceStatus::PoweredOff => "POWERED_OFF",
            ResourceStatus::Suspended => "SUSPENDED",
            ResourceStatus::Restarting => "RESTARTING",
            ResourceStatus::Unknown => "UNKNOWN",
            ResourceStatus::Deleted => "DELETED",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ResourceStatus::Restarting)
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "POWERED_ON" => Ok(ResourceStatus::PoweredOn),
            "POWERED_OFF" => Ok(ResourceStatus::PoweredOff),
            "SUSPENDED" => Ok(ResourceStatus::Suspended),
            "RESTARTING" => Ok(ResourceStatus::Restarting),
            "UNKNOWN" => Ok(ResourceStatus::Unknown),
            "DELETED" => Ok(ResourceStatus::Deleted),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

impl Serialize for ResourceStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

// Statuses the backend adds later must not break a whole list fetch.
impl<'de> Deserialize<'de> for ResourceStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse().unwrap_or_else(|error: CoreError| {
            tracing::debug!(error = %error, "Mapping unrecognized status to UNKNOWN");
            ResourceStatus::Unknown
        }))
    }
}

/// One remote-managed virtual machine as last reported by the backend.
///
/// Everything except `id` and `status` is opaque to the sync core; it only
/// takes part in change detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub status: ResourceStatus,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub cpu: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub owner_id: Option<u64>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Resource {
    pub fn new(id: ResourceId, status: ResourceStatus) -> Self {
        Self {
            id,
            status,
            name: String::new(),
            hostname: None,
            ip_address: None,
            cpu: None,
            memory_mb: None,
            owner_id: None,
            updated_at: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// True when every field used for change detection is equal.
    pub fn same_tracked_fields(&self, other: &Resource) -> bool {
        self.status == other.status
            && self.name == other.name
            && self.hostname == other.hostname
            && self.ip_address == other.ip_address
            && self.cpu == other.cpu
            && self.memory_mb == other.memory_mb
            && self.owner_id == other.owner_id
            && self.updated_at == other.updated_at
    }
}

/// Partial overwrite of a resource's fields. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourcePatch {
    pub status: Option<ResourceStatus>,
    pub name: Option<String>,
    pub hostname: Option<Option<String>>,
    pub ip_address: Option<Option<String>>,
    pub cpu: Option<Option<u32>>,
    pub memory_mb: Option<Option<u64>>,
    pub owner_id: Option<Option<u64>>,
    pub updated_at: Option<Option<String>>,
}

impl ResourcePatch {
    pub fn status(status: ResourceStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, resource: &mut Resource) {
        if let Some(status) = self.status {
            resource.status = status;
        }
        if let Some(name) = &self.name {
            resource.name = name.clone();
        }
        if let Some(hostname) = &self.hostname {
            resource.hostname = hostname.clone();
        }
        if let Some(ip_address) = &self.ip_address {
            resource.ip_address = ip_address.clone();
        }
        if let Some(cpu) = self.cpu {
            resource.cpu = cpu;
        }
        if let Some(memory_mb) = self.memory_mb {
            resource.memory_mb = memory_mb;
        }
        if let Some(owner_id) = self.owner_id {
            resource.owner_id = owner_id;
        }
        if let Some(updated_at) = &self.updated_at {
            resource.updated_at = updated_at.clone();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Start,
    Stop,
    Restart,
    Sync,
}

impl ActionKind {
    pub const ALL: [ActionKind; 4] = [
        ActionKind::Start,
        ActionKind::Stop,
        ActionKind::Restart,
        ActionKind::Sync,
    ];

    /// Path segment of the backend action endpoint.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Start => "start",
            ActionKind::Stop => "stop",
            ActionKind::Restart => "restart",
            ActionKind::Sync => "sync",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(ActionKind::Start),
            "stop" => Ok(ActionKind::Stop),
            "restart" => Ok(ActionKind::Restart),
            "sync" => Ok(ActionKind::Sync),
            other => Err(CoreError::UnknownAction(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub resource_id: ResourceId,
    pub action: ActionKind,
    pub requested_at: DateTime<Utc>,
}

impl ActionRequest {
    pub fn new(resource_id: ResourceId, action: ActionKind) -> Self {
        Self {
            resource_id,
            action,
            requested_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub resource_id: ResourceId,
    pub action: ActionKind,
    pub outcome: ActionOutcome,
    pub error: Option<String>,
}

impl ActionResult {
    pub fn success(resource_id: ResourceId, action: ActionKind) -> Self {
        Self {
            resource_id,
            action,
            outcome: ActionOutcome::Success,
            error: None,
        }
    }

    pub fn failure(resource_id: ResourceId, action: ActionKind, error: impl Into<String>) -> Self {
        Self {
            resource_id,
            action,
            outcome: ActionOutcome::Failure,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ActionOutcome::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(TaskStatus::Queued),
            "RUNNING" => Ok(TaskStatus::Running),
            "SUCCEEDED" => Ok(TaskStatus::Succeeded),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(CoreError::UnknownTaskStatus(other.to_string())),
        }
    }
}

/// Status payload of a long-running backend operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub status: TaskStatus,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default, alias = "resourceId")]
    pub resource_id: Option<ResourceId>,
}

impl Task {
    pub fn queued(total: u64) -> Self {
        Self {
            status: TaskStatus::Queued,
            completed: 0,
            total,
            resource_id: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn validate(&self) -> Result<()> {
        if self.total > 0 && self.completed > self.total {
            return Err(CoreError::InvalidTaskProgress {
                completed: self.completed,
                total: self.total,
            });
        }
        Ok(())
    }

    /// Completion in percent, `None` while the backend reports no total.
    pub fn percent(&self) -> Option<u8> {
        if self.total == 0 {
            return None;
        }
        let completed = u128::from(self.completed.min(self.total));
        Some(((completed * 100) / u128::from(self.total)) as u8)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_code: String,
    pub message: String,
    pub details: Option<HashMap<String, String>>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorResponse {
    pub fn new(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: HashMap<String, String>) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_status_wire_names() {
        let json = serde_json::to_string(&ResourceStatus::PoweredOn).unwrap();
        assert_eq!(json, "\"POWERED_ON\"");

        let status: ResourceStatus = serde_json::from_str("\"POWERED_OFF\"").unwrap();
        assert_eq!(status, ResourceStatus::PoweredOff);
    }

    #[test]
    fn test_unrecognized_status_maps_to_unknown() {
        let status: ResourceStatus = serde_json::from_str("\"MIGRATING\"").unwrap();
        assert_eq!(status, ResourceStatus::Unknown);
    }

    #[test]
    fn test_status_from_str_rejects_garbage() {
        let err = "sleeping".parse::<ResourceStatus>().unwrap_err();
        assert_eq!(err, CoreError::UnknownStatus("SLEEPING".to_string()));
    }

    #[test]
    fn test_resource_deserializes_with_missing_optional_fields() {
        let resource: Resource =
            serde_json::from_str(r#"{"id": 1, "status": "POWERED_ON"}"#).unwrap();
        assert_eq!(resource.id, 1);
        assert_eq!(resource.status, ResourceStatus::PoweredOn);
        assert!(resource.hostname.is_none());
        assert!(resource.name.is_empty());
    }

    #[test]
    fn test_same_tracked_fields() {
        let a = Resource::new(5, ResourceStatus::PoweredOn).with_name("web-1");
        let mut b = a.clone();
        assert!(a.same_tracked_fields(&b));

        b.memory_mb = Some(2048);
        assert!(!a.same_tracked_fields(&b));

        let mut c = a.clone();
        c.updated_at = Some("2024-01-01T00:00:00Z".to_string());
        assert!(!a.same_tracked_fields(&c));
    }

    #[test]
    fn test_patch_overwrites_only_given_fields() {
        let mut resource = Resource::new(3, ResourceStatus::PoweredOn).with_name("db");
        resource.cpu = Some(4);

        ResourcePatch::status(ResourceStatus::PoweredOff).apply_to(&mut resource);

        assert_eq!(resource.status, ResourceStatus::PoweredOff);
        assert_eq!(resource.name, "db");
        assert_eq!(resource.cpu, Some(4));
    }

    #[test]
    fn test_patch_can_clear_optional_field() {
        let mut resource = Resource::new(3, ResourceStatus::PoweredOn);
        resource.ip_address = Some("10.0.0.3".to_string());

        let patch = ResourcePatch {
            ip_address: Some(None),
            ..ResourcePatch::default()
        };
        patch.apply_to(&mut resource);
        assert!(resource.ip_address.is_none());
    }

    #[test]
    fn test_empty_patch() {
        assert!(ResourcePatch::default().is_empty());
        assert!(!ResourcePatch::status(ResourceStatus::Unknown).is_empty());
    }

    #[test]
    fn test_action_kind_parse_and_display() {
        for kind in ActionKind::ALL {
            assert_eq!(kind.to_string().parse::<ActionKind>().unwrap(), kind);
        }
        assert!(matches!(
            "reboot".parse::<ActionKind>(),
            Err(CoreError::UnknownAction(_))
        ));
    }

    #[test]
    fn test_action_result_constructors() {
        let ok = ActionResult::success(3, ActionKind::Start);
        assert!(ok.is_success());
        assert!(ok.error.is_none());

        let failed = ActionResult::failure(3, ActionKind::Start, "hypervisor unreachable");
        assert_eq!(failed.outcome, ActionOutcome::Failure);
        assert_eq!(failed.error.as_deref(), Some("hypervisor unreachable"));
    }

    #[test]
    fn test_task_terminal_states() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_task_accepts_camel_case_resource_id() {
        let task: Task = serde_json::from_str(
            r#"{"status": "SUCCEEDED", "completed": 5, "total": 5, "resourceId": 42}"#,
        )
        .unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.resource_id, Some(42));
    }

    #[test]
    fn test_task_percent() {
        let mut task = Task::queued(0);
        assert_eq!(task.percent(), None);

        task.total = 4;
        task.completed = 1;
        assert_eq!(task.percent(), Some(25));

        task.completed = 9;
        assert_eq!(task.percent(), Some(100));
        assert!(task.validate().is_err());
    }

    #[test]
    fn test_task_percent_with_huge_totals() {
        let task = Task {
            status: TaskStatus::Running,
            completed: u64::MAX / 2,
            total: u64::MAX,
            resource_id: None,
        };
        assert_eq!(task.percent(), Some(49));

        let done = Task {
            completed: u64::MAX,
            ..task
        };
        assert_eq!(done.percent(), Some(100));
    }

    #[test]
    fn test_error_response_with_details() {
        let mut details = HashMap::new();
        details.insert("resource_id".to_string(), "7".to_string());
        let error = ErrorResponse::new("RESOURCE_NOT_FOUND", "no such vm").with_details(details);
        assert_eq!(error.error_code, "RESOURCE_NOT_FOUND");
        assert_eq!(
            error.details.unwrap().get("resource_id"),
            Some(&"7".to_string())
        );
    }
}
