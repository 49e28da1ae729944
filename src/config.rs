//! Colony configuration management
//!
//! Configuration lives in `config.toml` under the shared root. Every section
//! carries defaults, so a missing, partial or corrupt file still yields a
//! complete configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the shared (version-controlled) root directory inside a project
pub const SHARED_DIR: &str = ".colony";

/// Name of the runtime (gitignored) directory inside the shared root
pub const RUNTIME_DIR: &str = "runtime";

/// Main Colony configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColonyConfig {
    /// Heartbeat configuration
    pub heartbeat: HeartbeatSettings,

    /// Memory store configuration
    pub memory: MemorySettings,

    /// Instance registry configuration
    pub registry: RegistrySettings,

    /// Inbox configuration
    pub inbox: InboxSettings,

    /// Advisory locking around shared documents
    pub locking: LockSettings,
}

/// Heartbeat configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    /// Seconds between heartbeat ticks
    pub interval_seconds: u64,

    /// Seconds after the last activity before an instance counts as stale
    pub stale_after_seconds: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            stale_after_seconds: 300,
        }
    }
}

/// Memory store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    /// Maximum length of the `recent` index list
    pub recent_limit: usize,

    /// Inclusive importance threshold for the `high_importance` index
    pub high_importance_threshold: f64,

    /// Maximum number of timeline entries kept
    pub timeline_limit: usize,

    /// Importance used when none is given
    pub default_importance: f64,

    /// Confidence used when none is given
    pub default_confidence: f64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            recent_limit: 50,
            high_importance_threshold: 0.7,
            timeline_limit: 500,
            default_importance: 0.5,
            default_confidence: 0.8,
        }
    }
}

/// Instance registry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Maximum number of activity log entries kept
    pub activity_log_limit: usize,

    /// Maximum number of recently touched files kept per instance
    pub files_touched_limit: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            activity_log_limit: 100,
            files_touched_limit: 20,
        }
    }
}

/// Inbox configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxSettings {
    /// Read messages older than this are removed by cleanup
    pub retention_days: i64,
}

impl Default for InboxSettings {
    fn default() -> Self {
        Self { retention_days: 7 }
    }
}

/// Advisory lock configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Serialize shared-document updates with lock files
    pub enabled: bool,

    /// How long to wait for a lock before proceeding unlocked
    pub timeout_ms: u64,

    /// Lock files older than this are considered abandoned
    pub stale_after_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 2000,
            stale_after_ms: 10_000,
        }
    }
}

impl ColonyConfig {
    /// Parse configuration text, falling back to defaults on any error.
    pub fn from_toml_str(content: &str) -> Self {
        match toml::from_str::<Self>(content) {
            Ok(mut config) => {
                if config.inbox.retention_days < 0 {
                    tracing::warn!(
                        "Negative inbox retention {} days, using default",
                        config.inbox.retention_days
                    );
                    config.inbox.retention_days = InboxSettings::default().retention_days;
                }
                config
            }
            Err(e) => {
                tracing::warn!("Invalid colony config, using defaults: {}", e);
                Self::default()
            }
        }
    }

    /// Load configuration from disk. A missing file yields defaults.
    pub async fn load(path: &Path) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Self::from_toml_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                tracing::warn!("Failed to read config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Serialize to TOML text
    pub fn to_toml_string(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))
    }
}

/// Resolved directory layout of one project.
///
/// ```text
/// <project>/.colony/
/// ├── config.toml
/// ├── index.yaml
/// ├── timeline.yaml
/// ├── memories/
/// ├── tasks/completed/
/// └── runtime/            (gitignored)
///     ├── instances.yaml
///     ├── inbox/
///     ├── locks/
///     ├── scratch/
///     └── tasks/{pending,active,failed}/
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    project_dir: PathBuf,
    shared_root: PathBuf,
    runtime_root: PathBuf,
}

impl Layout {
    /// Resolve the layout for a project directory
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        let shared_root = project_dir.join(SHARED_DIR);
        let runtime_root = shared_root.join(RUNTIME_DIR);
        Self {
            project_dir,
            shared_root,
            runtime_root,
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn shared_root(&self) -> &Path {
        &self.shared_root
    }

    pub fn runtime_root(&self) -> &Path {
        &self.runtime_root
    }

    pub fn config_path(&self) -> PathBuf {
        self.shared_root.join("config.toml")
    }

    pub fn gitignore_path(&self) -> PathBuf {
        self.shared_root.join(".gitignore")
    }

    pub fn index_path(&self) -> PathBuf {
        self.shared_root.join("index.yaml")
    }

    pub fn timeline_path(&self) -> PathBuf {
        self.shared_root.join("timeline.yaml")
    }

    pub fn memories_dir(&self) -> PathBuf {
        self.shared_root.join("memories")
    }

    pub fn completed_tasks_dir(&self) -> PathBuf {
        self.shared_root.join("tasks").join("completed")
    }

    pub fn pending_tasks_dir(&self) -> PathBuf {
        self.runtime_root.join("tasks").join("pending")
    }

    pub fn active_tasks_dir(&self) -> PathBuf {
        self.runtime_root.join("tasks").join("active")
    }

    pub fn failed_tasks_dir(&self) -> PathBuf {
        self.runtime_root.join("tasks").join("failed")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.runtime_root.join("instances.yaml")
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.runtime_root.join("inbox")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.runtime_root.join("locks")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.runtime_root.join("scratch")
    }

    /// Every directory the stores expect to exist
    pub fn directories(&self) -> Vec<PathBuf> {
        vec![
            self.memories_dir(),
            self.completed_tasks_dir(),
            self.pending_tasks_dir(),
            self.active_tasks_dir(),
            self.failed_tasks_dir(),
            self.inbox_dir(),
            self.locks_dir(),
            self.scratch_dir(),
        ]
    }

    /// Create every directory of the layout
    pub async fn create_dirs(&self) -> std::io::Result<()> {
        for dir in self.directories() {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }
}
