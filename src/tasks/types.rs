//! Task data types and the status → bucket mapping
//!
//! A task's storage location is a function of its status
//! (`TaskStatus::bucket`). Claimed and in-progress tasks share the `active`
//! bucket; cancelled tasks rest in the `failed` bucket with other
//! unsuccessful outcomes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether no further transition can leave this status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Directory bucket a task with this status must live in
    pub fn bucket(&self) -> Bucket {
        match self {
            TaskStatus::Pending => Bucket::Pending,
            TaskStatus::Claimed | TaskStatus::InProgress => Bucket::Active,
            TaskStatus::Completed => Bucket::Completed,
            TaskStatus::Failed | TaskStatus::Cancelled => Bucket::Failed,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage bucket (one directory each)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Pending,
    Active,
    Completed,
    Failed,
}

impl Bucket {
    /// Lookup order: terminal buckets first, so a task caught mid-move
    /// between buckets resolves to its most advanced copy.
    pub const ALL: [Bucket; 4] = [
        Bucket::Completed,
        Bucket::Failed,
        Bucket::Active,
        Bucket::Pending,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Pending => "pending",
            Bucket::Active => "active",
            Bucket::Completed => "completed",
            Bucket::Failed => "failed",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task priority, lowest first so `Ord` sorts by urgency
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::str::FromStr for Priority {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(crate::Error::Config(format!("Unknown priority '{}'", other))),
        }
    }
}

/// Who created a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCreator {
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
}

/// Who may claim a task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTarget {
    /// Capabilities the claimant must all declare
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// A single instance the task is addressed to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specific_instance: Option<String>,
}

impl TaskTarget {
    /// Open to any instance
    pub fn is_open(&self) -> bool {
        self.capabilities.is_empty() && self.specific_instance.is_none()
    }

    /// Any one of these is sufficient: the task is open, it names this
    /// instance, or the instance declares every required capability.
    pub fn admits(&self, instance_id: &str, capabilities: &BTreeSet<String>) -> bool {
        if self.is_open() {
            return true;
        }
        if self.specific_instance.as_deref() == Some(instance_id) {
            return true;
        }
        !self.capabilities.is_empty()
            && self.capabilities.iter().all(|c| capabilities.contains(c))
    }
}

/// One entry of the append-only status history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: TaskStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Record of the instance that claimed a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
    pub at: DateTime<Utc>,
}

/// Progress note appended while a task is in progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub at: DateTime<Utc>,
    pub by: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
}

/// Outcome of a finished task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Lets the requester find and acknowledge the task's terminal outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitHandle {
    pub requester: String,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// Memories and files a task refers to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRefs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub memories: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

/// A unit of delegated work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub created_by: TaskCreator,
    #[serde(default)]
    pub priority: Priority,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<serde_json::Value>,
    #[serde(default)]
    pub target: TaskTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub related: TaskRefs,
    pub status: TaskStatus,
    #[serde(default)]
    pub status_history: Vec<StatusChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<Claim>,
    #[serde(default)]
    pub progress_updates: Vec<ProgressUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    pub wait_handle: WaitHandle,
}

impl Task {
    pub fn file_name(id: &str) -> String {
        format!("{}.yaml", id)
    }

    /// Set the status and append it to the history.
    pub fn transition(&mut self, status: TaskStatus, by: Option<&str>, note: Option<String>) {
        self.status = status;
        self.status_history.push(StatusChange {
            status,
            at: Utc::now(),
            by: by.map(str::to_string),
            note,
        });
    }

    pub fn is_claimable_by(&self, instance_id: &str, capabilities: &BTreeSet<String>) -> bool {
        self.status == TaskStatus::Pending && self.target.admits(instance_id, capabilities)
    }

    /// Past its advisory timeout without reaching a terminal status
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.timeout_at.is_some_and(|t| t <= now)
    }

    /// Terminal and not yet acknowledged by its requester
    pub fn awaits_acknowledgement(&self) -> bool {
        self.status.is_terminal() && !self.wait_handle.acknowledged
    }
}

/// Input for delegating a task
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DelegateRequest {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub instructions: Option<String>,
    pub expected_output: Option<serde_json::Value>,
    pub target: TaskTarget,
    pub timeout: Option<Duration>,
    pub related: TaskRefs,
}

impl DelegateRequest {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn expected_output(mut self, schema: serde_json::Value) -> Self {
        self.expected_output = Some(schema);
        self
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        let capability = capability.into();
        if !self.target.capabilities.contains(&capability) {
            self.target.capabilities.push(capability);
        }
        self
    }

    pub fn for_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.target.specific_instance = Some(instance_id.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn related_memory(mut self, id: impl Into<String>) -> Self {
        self.related.memories.push(id.into());
        self
    }

    pub fn related_file(mut self, path: impl Into<String>) -> Self {
        self.related.files.push(path.into());
        self
    }
}
