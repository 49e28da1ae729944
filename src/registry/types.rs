//! Registry document types
//!
//! The whole registry is one YAML document shared by every instance. Loading
//! it never fails: missing sections, unknown fields, and unreadable entries
//! fall back to defaults so one bad writer cannot lock everyone out.

use crate::config::HeartbeatSettings;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Current registry document format version
pub const REGISTRY_VERSION: u32 = 1;

/// Presence status of an instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Active,
    Idle,
    Waiting,
    Offline,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Active => "active",
            InstanceStatus::Idle => "idle",
            InstanceStatus::Waiting => "waiting",
            InstanceStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(InstanceStatus::Active),
            "idle" => Ok(InstanceStatus::Idle),
            "waiting" => Ok(InstanceStatus::Waiting),
            "offline" => Ok(InstanceStatus::Offline),
            other => Err(crate::Error::Config(format!(
                "Unknown instance status '{}'",
                other
            ))),
        }
    }
}

/// A task an instance is blocked on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitEntry {
    pub task_id: String,
    pub since: DateTime<Utc>,
}

/// Tool session an instance runs in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// One running agent process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_on: Option<String>,
    #[serde(default)]
    pub waiting_for: Vec<WaitEntry>,
    /// Most recent last
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
}

impl Instance {
    /// Advance `last_activity`, never moving it backwards.
    pub fn bump(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    /// Still heartbeating within the staleness window. A window too large
    /// to represent never expires.
    pub fn is_live(&self, now: DateTime<Utc>, stale_after_seconds: u64) -> bool {
        match i64::try_from(stale_after_seconds)
            .ok()
            .and_then(Duration::try_seconds)
        {
            Some(window) => now - self.last_activity < window,
            None => true,
        }
    }

    /// Declares every capability in `required`
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        let declared: BTreeSet<&str> = self.capabilities.iter().map(String::as_str).collect();
        required.iter().all(|c| declared.contains(c.as_str()))
    }

    /// Move `path` to the most recent position, keeping at most `limit`.
    pub fn touch_file(&mut self, path: &str, limit: usize) {
        self.files_touched.retain(|p| p != path);
        self.files_touched.push(path.to_string());
        if self.files_touched.len() > limit {
            let excess = self.files_touched.len() - limit;
            self.files_touched.drain(..excess);
        }
    }

    /// Start waiting on a task; the instance becomes `waiting`.
    pub fn add_wait(&mut self, task_id: &str, since: DateTime<Utc>) {
        if !self.waiting_for.iter().any(|w| w.task_id == task_id) {
            self.waiting_for.push(WaitEntry {
                task_id: task_id.to_string(),
                since,
            });
        }
        self.status = InstanceStatus::Waiting;
    }

    /// Stop waiting on a task. Status returns to `active` only once nothing
    /// is left to wait for.
    pub fn remove_wait(&mut self, task_id: &str) -> bool {
        let before = self.waiting_for.len();
        self.waiting_for.retain(|w| w.task_id != task_id);
        let removed = self.waiting_for.len() != before;
        if self.waiting_for.is_empty() && self.status == InstanceStatus::Waiting {
            self.status = InstanceStatus::Active;
        }
        removed
    }
}

/// Shared activity log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub instance_id: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// The shared presence document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
    pub version: u32,
    pub instances: BTreeMap<String, Instance>,
    /// Thresholds every reader applies, so all instances agree on staleness
    pub heartbeat: HeartbeatSettings,
    /// Oldest first
    pub activity_log: Vec<ActivityEntry>,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self::with_heartbeat(HeartbeatSettings::default())
    }
}

impl RegistryDocument {
    pub fn with_heartbeat(heartbeat: HeartbeatSettings) -> Self {
        Self {
            version: REGISTRY_VERSION,
            instances: BTreeMap::new(),
            heartbeat,
            activity_log: Vec::new(),
        }
    }

    /// Fill a structurally complete document from whatever parsed.
    ///
    /// `heartbeat` is used when the document does not carry its own.
    pub fn merge_with_defaults(value: &Value, heartbeat: HeartbeatSettings) -> Self {
        let mut doc = Self::with_heartbeat(heartbeat);
        let Some(map) = value.as_mapping() else {
            return doc;
        };

        if let Some(version) = map.get("version").and_then(Value::as_u64) {
            doc.version = version as u32;
        }
        if let Some(hb) = map.get("heartbeat") {
            match serde_yaml::from_value::<HeartbeatSettings>(hb.clone()) {
                Ok(hb) => doc.heartbeat = hb,
                Err(e) => tracing::warn!("Ignoring malformed heartbeat config: {}", e),
            }
        }
        if let Some(instances) = map.get("instances").and_then(Value::as_mapping) {
            for (key, raw) in instances {
                match serde_yaml::from_value::<Instance>(raw.clone()) {
                    Ok(instance) => {
                        doc.instances.insert(instance.id.clone(), instance);
                    }
                    Err(e) => tracing::warn!("Skipping malformed instance {:?}: {}", key, e),
                }
            }
        }
        if let Some(log) = map.get("activity_log").and_then(Value::as_sequence) {
            doc.activity_log = log
                .iter()
                .filter_map(|raw| serde_yaml::from_value(raw.clone()).ok())
                .collect();
        }
        doc
    }

    /// Parse a persisted document, tolerating empty or corrupt content.
    pub fn from_yaml_str(content: &str, heartbeat: HeartbeatSettings) -> Self {
        if content.trim().is_empty() {
            return Self::with_heartbeat(heartbeat);
        }
        match serde_yaml::from_str::<Value>(content) {
            Ok(value) => Self::merge_with_defaults(&value, heartbeat),
            Err(e) => {
                tracing::warn!("Corrupt instance registry, using defaults: {}", e);
                Self::with_heartbeat(heartbeat)
            }
        }
    }

    /// Append to the activity log, keeping the newest `limit` entries.
    pub fn log(&mut self, entry: ActivityEntry, limit: usize) {
        self.activity_log.push(entry);
        if self.activity_log.len() > limit {
            let excess = self.activity_log.len() - limit;
            self.activity_log.drain(..excess);
        }
    }

    /// Instances whose last activity is inside the staleness window
    pub fn live_instances(&self, now: DateTime<Utc>) -> Vec<&Instance> {
        self.instances
            .values()
            .filter(|i| i.is_live(now, self.heartbeat.stale_after_seconds))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, last_activity: DateTime<Utc>) -> Instance {
        Instance {
            id: id.to_string(),
            machine: None,
            capabilities: Vec::new(),
            first_seen: last_activity,
            last_activity,
            status: InstanceStatus::Active,
            working_on: None,
            waiting_for: Vec::new(),
            files_touched: Vec::new(),
            session: None,
        }
    }

    #[test]
    fn test_empty_and_corrupt_documents_default() {
        let hb = HeartbeatSettings::default();
        assert_eq!(
            RegistryDocument::from_yaml_str("", hb.clone()),
            RegistryDocument::default()
        );
        assert_eq!(
            RegistryDocument::from_yaml_str("instances: [unclosed", hb.clone()),
            RegistryDocument::default()
        );
        assert_eq!(
            RegistryDocument::from_yaml_str("- just\n- a list\n", hb),
            RegistryDocument::default()
        );
    }

    #[test]
    fn test_partial_document_keeps_what_parses() {
        let yaml = r#"
instances:
  good:
    id: good
    first_seen: 2026-01-01T00:00:00Z
    last_activity: 2026-01-01T00:00:00Z
  broken:
    id: broken
"#;
        let doc = RegistryDocument::from_yaml_str(yaml, HeartbeatSettings::default());
        assert_eq!(doc.instances.len(), 1);
        let good = &doc.instances["good"];
        assert_eq!(good.status, InstanceStatus::Active);
        assert!(good.waiting_for.is_empty());
        assert_eq!(doc.heartbeat.stale_after_seconds, 300);
        assert!(doc.activity_log.is_empty());
    }

    #[test]
    fn test_document_heartbeat_overrides_local() {
        let yaml = "heartbeat:\n  interval_seconds: 5\n  stale_after_seconds: 20\n";
        let local = HeartbeatSettings {
            interval_seconds: 60,
            stale_after_seconds: 300,
        };
        let doc = RegistryDocument::from_yaml_str(yaml, local);
        assert_eq!(doc.heartbeat.stale_after_seconds, 20);
    }

    #[test]
    fn test_huge_stale_threshold_keeps_instances_live() {
        let now = Utc::now();
        let yaml = format!(
            "heartbeat:\n  stale_after_seconds: 10000000000000000\ninstances:\n  a:\n    id: a\n    first_seen: {now}\n    last_activity: {now}\n",
            now = (now - Duration::days(3)).to_rfc3339()
        );
        let doc = RegistryDocument::from_yaml_str(&yaml, HeartbeatSettings::default());
        assert_eq!(doc.heartbeat.stale_after_seconds, 10_000_000_000_000_000);
        assert_eq!(doc.live_instances(now).len(), 1);

        let inst = &doc.instances["a"];
        assert!(inst.is_live(now, u64::MAX));
    }

    #[test]
    fn test_activity_log_is_bounded() {
        let mut doc = RegistryDocument::default();
        for i in 0..105 {
            doc.log(
                ActivityEntry {
                    timestamp: Utc::now(),
                    instance_id: "a".to_string(),
                    action: format!("step {}", i),
                    details: None,
                },
                100,
            );
        }
        assert_eq!(doc.activity_log.len(), 100);
        assert_eq!(doc.activity_log[0].action, "step 5");
    }

    #[test]
    fn test_files_touched_dedupes_and_caps() {
        let mut inst = instance("a", Utc::now());
        for i in 0..25 {
            inst.touch_file(&format!("src/{}.rs", i), 20);
        }
        inst.touch_file("src/10.rs", 20);
        assert_eq!(inst.files_touched.len(), 20);
        assert_eq!(inst.files_touched.last().unwrap(), "src/10.rs");
        assert_eq!(inst.files_touched[0], "src/5.rs");
        assert_eq!(
            inst.files_touched.iter().filter(|f| *f == "src/10.rs").count(),
            1
        );
    }

    #[test]
    fn test_waits_flip_status() {
        let mut inst = instance("a", Utc::now());
        inst.status = InstanceStatus::Idle;
        inst.add_wait("task-1", Utc::now());
        inst.add_wait("task-2", Utc::now());
        inst.add_wait("task-1", Utc::now());
        assert_eq!(inst.status, InstanceStatus::Waiting);
        assert_eq!(inst.waiting_for.len(), 2);

        assert!(inst.remove_wait("task-1"));
        assert_eq!(inst.status, InstanceStatus::Waiting);
        assert!(inst.remove_wait("task-2"));
        // back to active, not to the idle status held before waiting
        assert_eq!(inst.status, InstanceStatus::Active);
        assert!(!inst.remove_wait("task-2"));
    }

    #[test]
    fn test_liveness_and_capabilities() {
        let now = Utc::now();
        let mut inst = instance("a", now - Duration::seconds(299));
        assert!(inst.is_live(now, 300));
        inst.last_activity = now - Duration::seconds(300);
        assert!(!inst.is_live(now, 300));

        inst.capabilities = vec!["x".to_string(), "y".to_string()];
        assert!(inst.has_capabilities(&["x".to_string()]));
        assert!(inst.has_capabilities(&["x".to_string(), "y".to_string()]));
        assert!(!inst.has_capabilities(&["x".to_string(), "z".to_string()]));
        assert!(inst.has_capabilities(&[]));
    }

    #[test]
    fn test_bump_is_monotonic() {
        let now = Utc::now();
        let mut inst = instance("a", now);
        inst.bump(now - Duration::seconds(10));
        assert_eq!(inst.last_activity, now);
        inst.bump(now + Duration::seconds(10));
        assert_eq!(inst.last_activity, now + Duration::seconds(10));
    }
}
