//! Instance registry backed by the shared `instances.yaml` document
//!
//! Every mutation is a locked read-modify-write of the whole document.

use super::types::{
    ActivityEntry, Instance, InstanceStatus, RegistryDocument, SessionInfo, WaitEntry,
};
use crate::config::{ColonyConfig, HeartbeatSettings, Layout, RegistrySettings};
use crate::error::{Error, Result};
use crate::ids;
use crate::storage::{self, SharedLock};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Host name of this machine, if it can be determined
pub fn machine_name() -> Option<String> {
    hostname::get().ok().and_then(|h| h.into_string().ok())
}

/// How this process presents itself in the registry
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceIdentity {
    pub id: String,
    pub machine: Option<String>,
    pub capabilities: Vec<String>,
    pub tool: Option<String>,
    pub session_id: Option<String>,
}

impl InstanceIdentity {
    /// Identity with a generated id on this machine
    pub fn generate() -> Self {
        Self::with_id(ids::instance_id())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            machine: machine_name(),
            capabilities: Vec::new(),
            tool: None,
            session_id: None,
        }
    }
}

/// Registry handle for one instance
///
/// Clones share the identity, so a background heartbeat follows an identity
/// adopted through `recover`.
#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    path: PathBuf,
    lock: SharedLock,
    identity: Arc<RwLock<InstanceIdentity>>,
    started_at: DateTime<Utc>,
    heartbeat: HeartbeatSettings,
    settings: RegistrySettings,
}

impl InstanceRegistry {
    pub fn new(layout: &Layout, config: &ColonyConfig, identity: InstanceIdentity) -> Result<Self> {
        ids::validate(&identity.id)?;
        Ok(Self {
            path: layout.registry_path(),
            lock: SharedLock::new(layout.locks_dir(), "registry", config.locking.clone()),
            identity: Arc::new(RwLock::new(identity)),
            started_at: Utc::now(),
            heartbeat: config.heartbeat.clone(),
            settings: config.registry.clone(),
        })
    }

    /// Id this handle currently acts as
    pub async fn instance_id(&self) -> String {
        self.identity.read().await.id.clone()
    }

    pub async fn identity(&self) -> InstanceIdentity {
        self.identity.read().await.clone()
    }

    // =========================================================================
    // Document access
    // =========================================================================

    /// Load the document; never fails on bad content.
    pub async fn load(&self) -> Result<RegistryDocument> {
        let content = storage::read_optional(&self.path).await?.unwrap_or_default();
        Ok(RegistryDocument::from_yaml_str(&content, self.heartbeat.clone()))
    }

    /// Locked read-modify-write. `mutate` returning `None` leaves the
    /// document untouched on disk.
    async fn modify<T, F>(&self, mutate: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut RegistryDocument, DateTime<Utc>) -> Option<T>,
    {
        let _guard = self.lock.acquire_or_proceed().await;
        let mut doc = self.load().await?;
        let Some(out) = mutate(&mut doc, Utc::now()) else {
            return Ok(None);
        };
        storage::write_yaml(&self.path, &doc).await?;
        Ok(Some(out))
    }

    fn entry(
        identity: &InstanceIdentity,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Instance {
        Instance {
            id: identity.id.clone(),
            machine: identity.machine.clone(),
            capabilities: identity.capabilities.clone(),
            first_seen: now,
            last_activity: now,
            status: InstanceStatus::Active,
            working_on: None,
            waiting_for: Vec::new(),
            files_touched: Vec::new(),
            session: Some(SessionInfo {
                tool: identity.tool.clone(),
                session_id: identity.session_id.clone(),
                started_at,
            }),
        }
    }

    fn log_entry(
        id: &str,
        now: DateTime<Utc>,
        action: &str,
        details: Option<String>,
    ) -> ActivityEntry {
        ActivityEntry {
            timestamp: now,
            instance_id: id.to_string(),
            action: action.to_string(),
            details,
        }
    }

    // =========================================================================
    // Presence
    // =========================================================================

    /// Insert or replace this instance's entry as active.
    pub async fn register(&self) -> Result<Instance> {
        let identity = self.identity().await;
        let started_at = self.started_at;
        let limit = self.settings.activity_log_limit;

        let instance = self
            .modify(|doc, now| {
                let instance = Self::entry(&identity, started_at, now);
                doc.instances.insert(identity.id.clone(), instance.clone());
                doc.log(Self::log_entry(&identity.id, now, "registered", None), limit);
                Some(instance)
            })
            .await?;

        tracing::info!(instance = %identity.id, "Instance registered");
        Ok(instance.unwrap_or_else(|| Self::entry(&identity, started_at, Utc::now())))
    }

    /// Bump `last_activity`. A no-op for an unregistered instance.
    pub async fn heartbeat(&self) -> Result<bool> {
        let id = self.instance_id().await;
        let bumped = self
            .modify(|doc, now| {
                let instance = doc.instances.get_mut(&id)?;
                instance.bump(now);
                Some(())
            })
            .await?;
        tracing::debug!(instance = %id, bumped = bumped.is_some(), "Heartbeat");
        Ok(bumped.is_some())
    }

    /// Set status and what the instance is working on, registering first if
    /// the entry is missing.
    pub async fn update_status(
        &self,
        status: InstanceStatus,
        working_on: Option<String>,
    ) -> Result<Instance> {
        let id = self.instance_id().await;
        let limit = self.settings.activity_log_limit;

        for attempt in 0..2 {
            let working = working_on.clone();
            let updated = self
                .modify(|doc, now| {
                    let instance = doc.instances.get_mut(&id)?;
                    instance.status = status;
                    instance.working_on = working.clone();
                    instance.bump(now);
                    let updated = instance.clone();
                    doc.log(
                        Self::log_entry(&id, now, &format!("status: {}", status), working),
                        limit,
                    );
                    Some(updated)
                })
                .await?;

            match updated {
                Some(instance) => return Ok(instance),
                None if attempt == 0 => {
                    self.register().await?;
                }
                None => {}
            }
        }
        Err(Error::Internal(format!(
            "instance {} vanished from the registry while updating status",
            id
        )))
    }

    /// Mark this instance offline and clear what it was working on.
    pub async fn go_offline(&self) -> Result<bool> {
        let id = self.instance_id().await;
        let limit = self.settings.activity_log_limit;
        let done = self
            .modify(|doc, now| {
                let instance = doc.instances.get_mut(&id)?;
                instance.status = InstanceStatus::Offline;
                instance.working_on = None;
                instance.bump(now);
                doc.log(Self::log_entry(&id, now, "offline", None), limit);
                Some(())
            })
            .await?;
        tracing::info!(instance = %id, "Instance offline");
        Ok(done.is_some())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_instance(&self, id: &str) -> Result<Option<Instance>> {
        Ok(self.load().await?.instances.remove(id))
    }

    pub async fn all_instances(&self) -> Result<Vec<Instance>> {
        Ok(self.load().await?.instances.into_values().collect())
    }

    /// Instances heard from within the document's staleness window,
    /// regardless of their declared status
    pub async fn active_instances(&self) -> Result<Vec<Instance>> {
        let doc = self.load().await?;
        Ok(doc
            .live_instances(Utc::now())
            .into_iter()
            .cloned()
            .collect())
    }

    /// Live instances declaring every capability in `required`
    pub async fn instances_with_capabilities(&self, required: &[String]) -> Result<Vec<Instance>> {
        Ok(self
            .active_instances()
            .await?
            .into_iter()
            .filter(|i| i.has_capabilities(required))
            .collect())
    }

    // =========================================================================
    // Activity
    // =========================================================================

    pub async fn touch_file(&self, path: &str) -> Result<bool> {
        let id = self.instance_id().await;
        let limit = self.settings.files_touched_limit;
        let done = self
            .modify(|doc, now| {
                let instance = doc.instances.get_mut(&id)?;
                instance.touch_file(path, limit);
                instance.bump(now);
                Some(())
            })
            .await?;
        Ok(done.is_some())
    }

    /// Record that this instance is blocked on `task_id`.
    pub async fn wait_for_task(&self, task_id: &str) -> Result<bool> {
        let id = self.instance_id().await;
        let limit = self.settings.activity_log_limit;
        let done = self
            .modify(|doc, now| {
                let instance = doc.instances.get_mut(&id)?;
                instance.add_wait(task_id, now);
                instance.bump(now);
                doc.log(
                    Self::log_entry(&id, now, "waiting", Some(task_id.to_string())),
                    limit,
                );
                Some(())
            })
            .await?;
        Ok(done.is_some())
    }

    /// Drop `task_id` from this instance's wait-set.
    pub async fn clear_wait(&self, task_id: &str) -> Result<bool> {
        let id = self.instance_id().await;
        let removed = self
            .modify(|doc, now| {
                let instance = doc.instances.get_mut(&id)?;
                if !instance.remove_wait(task_id) {
                    return None;
                }
                instance.bump(now);
                Some(())
            })
            .await?;
        Ok(removed.is_some())
    }

    /// Append a free-form entry to the shared activity log.
    pub async fn log_activity(&self, action: &str, details: Option<String>) -> Result<()> {
        let id = self.instance_id().await;
        let limit = self.settings.activity_log_limit;
        self.modify(|doc, now| {
            doc.log(Self::log_entry(&id, now, action, details), limit);
            if let Some(instance) = doc.instances.get_mut(&id) {
                instance.bump(now);
            }
            Some(())
        })
        .await?;
        Ok(())
    }

    /// Newest activity first; `limit` 0 returns everything kept.
    pub async fn activity(&self, limit: usize) -> Result<Vec<ActivityEntry>> {
        let mut log = self.load().await?.activity_log;
        log.reverse();
        if limit > 0 {
            log.truncate(limit);
        }
        Ok(log)
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Take over the identity of `previous_id`.
    ///
    /// Returns the previous entry as it was, or `None` (changing nothing)
    /// when no such instance is registered. The entry is re-registered under
    /// the previous id and its outstanding waits carried over.
    pub async fn recover(&self, previous_id: &str) -> Result<Option<Instance>> {
        ids::validate(previous_id)?;
        let Some(previous) = self.get_instance(previous_id).await? else {
            return Ok(None);
        };

        {
            let mut identity = self.identity.write().await;
            identity.id = previous_id.to_string();
            if identity.capabilities.is_empty() {
                identity.capabilities = previous.capabilities.clone();
            }
        }
        self.register().await?;
        self.restore_waits(&previous.waiting_for).await?;

        tracing::info!(
            instance = %previous_id,
            waits = previous.waiting_for.len(),
            "Recovered previous session"
        );
        Ok(Some(previous))
    }

    async fn restore_waits(&self, waits: &[WaitEntry]) -> Result<()> {
        if waits.is_empty() {
            return Ok(());
        }
        let id = self.instance_id().await;
        let waits = waits.to_vec();
        self.modify(|doc, _now| {
            let instance = doc.instances.get_mut(&id)?;
            for wait in waits {
                instance.add_wait(&wait.task_id, wait.since);
            }
            Some(())
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_registry(dir: &TempDir, id: &str, caps: &[&str]) -> InstanceRegistry {
        let layout = Layout::new(dir.path());
        let mut identity = InstanceIdentity::with_id(id);
        identity.capabilities = caps.iter().map(|c| c.to_string()).collect();
        identity.tool = Some("test".to_string());
        InstanceRegistry::new(&layout, &ColonyConfig::default(), identity).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let dir = TempDir::new().unwrap();
        let registry = make_registry(&dir, "alpha", &["rust"]);

        let inst = registry.register().await.unwrap();
        assert_eq!(inst.id, "alpha");
        assert_eq!(inst.status, InstanceStatus::Active);
        assert_eq!(inst.first_seen, inst.last_activity);

        let stored = registry.get_instance("alpha").await.unwrap().unwrap();
        assert_eq!(stored.capabilities, vec!["rust"]);
        assert_eq!(stored.session.unwrap().tool.as_deref(), Some("test"));

        let log = registry.activity(0).await.unwrap();
        assert_eq!(log[0].action, "registered");
    }

    #[tokio::test]
    async fn test_heartbeat_does_not_register() {
        let dir = TempDir::new().unwrap();
        let registry = make_registry(&dir, "ghost", &[]);

        assert!(!registry.heartbeat().await.unwrap());
        assert!(registry.get_instance("ghost").await.unwrap().is_none());

        registry.register().await.unwrap();
        assert!(registry.heartbeat().await.unwrap());
    }

    #[tokio::test]
    async fn test_update_status_auto_registers() {
        let dir = TempDir::new().unwrap();
        let registry = make_registry(&dir, "late", &[]);

        let inst = registry
            .update_status(InstanceStatus::Idle, Some("reading docs".to_string()))
            .await
            .unwrap();
        assert_eq!(inst.status, InstanceStatus::Idle);
        assert_eq!(inst.working_on.as_deref(), Some("reading docs"));

        let stored = registry.get_instance("late").await.unwrap().unwrap();
        assert_eq!(stored.status, InstanceStatus::Idle);
    }

    #[tokio::test]
    async fn test_shared_document_between_instances() {
        let dir = TempDir::new().unwrap();
        let a = make_registry(&dir, "a", &["x", "y"]);
        let b = make_registry(&dir, "b", &["x"]);
        a.register().await.unwrap();
        b.register().await.unwrap();

        assert_eq!(a.all_instances().await.unwrap().len(), 2);
        assert_eq!(b.active_instances().await.unwrap().len(), 2);

        let both = a
            .instances_with_capabilities(&["x".to_string(), "y".to_string()])
            .await
            .unwrap();
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].id, "a");
    }

    #[tokio::test]
    async fn test_stale_instances_are_not_active() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        let registry = make_registry(&dir, "fresh", &[]);
        registry.register().await.unwrap();

        let mut doc = registry.load().await.unwrap();
        let mut old = doc.instances["fresh"].clone();
        old.id = "old".to_string();
        old.last_activity = Utc::now() - chrono::Duration::seconds(600);
        doc.instances.insert("old".to_string(), old);
        storage::write_yaml(&layout.registry_path(), &doc).await.unwrap();

        let active = registry.active_instances().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "fresh");
        assert_eq!(registry.all_instances().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_out_of_range_threshold_does_not_break_readers() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        let registry = make_registry(&dir, "edited", &["rust"]);
        registry.register().await.unwrap();

        let mut doc = registry.load().await.unwrap();
        doc.heartbeat.stale_after_seconds = 10_000_000_000_000_000;
        storage::write_yaml(&layout.registry_path(), &doc).await.unwrap();

        assert_eq!(registry.active_instances().await.unwrap().len(), 1);
        let found = registry
            .instances_with_capabilities(&["rust".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_waits_and_offline() {
        let dir = TempDir::new().unwrap();
        let registry = make_registry(&dir, "lead", &[]);
        registry.register().await.unwrap();

        assert!(registry.wait_for_task("task-1").await.unwrap());
        let inst = registry.get_instance("lead").await.unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Waiting);
        assert_eq!(inst.waiting_for[0].task_id, "task-1");

        assert!(registry.clear_wait("task-1").await.unwrap());
        assert!(!registry.clear_wait("task-1").await.unwrap());
        let inst = registry.get_instance("lead").await.unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Active);

        registry
            .update_status(InstanceStatus::Active, Some("refactor".to_string()))
            .await
            .unwrap();
        assert!(registry.go_offline().await.unwrap());
        let inst = registry.get_instance("lead").await.unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Offline);
        assert!(inst.working_on.is_none());
    }

    #[tokio::test]
    async fn test_touch_file_and_activity_limit() {
        let dir = TempDir::new().unwrap();
        let registry = make_registry(&dir, "editor", &[]);
        registry.register().await.unwrap();

        registry.touch_file("src/lib.rs").await.unwrap();
        registry.touch_file("src/main.rs").await.unwrap();
        registry.touch_file("src/lib.rs").await.unwrap();
        let inst = registry.get_instance("editor").await.unwrap().unwrap();
        assert_eq!(inst.files_touched, vec!["src/main.rs", "src/lib.rs"]);

        for i in 0..3 {
            registry
                .log_activity("edit", Some(format!("change {}", i)))
                .await
                .unwrap();
        }
        let latest = registry.activity(2).await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].details.as_deref(), Some("change 2"));
    }

    #[tokio::test]
    async fn test_corrupt_document_is_replaced() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        tokio::fs::create_dir_all(layout.runtime_root()).await.unwrap();
        tokio::fs::write(layout.registry_path(), "instances: [unclosed")
            .await
            .unwrap();

        let registry = make_registry(&dir, "fixer", &[]);
        assert!(registry.all_instances().await.unwrap().is_empty());
        registry.register().await.unwrap();
        assert_eq!(registry.all_instances().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recover_adopts_previous_identity() {
        let dir = TempDir::new().unwrap();
        let old = make_registry(&dir, "old-session", &["browser"]);
        old.register().await.unwrap();
        old.wait_for_task("task-abc").await.unwrap();

        let fresh = InstanceRegistry::new(
            &Layout::new(dir.path()),
            &ColonyConfig::default(),
            InstanceIdentity::with_id("new-session"),
        )
        .unwrap();
        assert!(fresh.recover("nobody").await.unwrap().is_none());
        assert_eq!(fresh.instance_id().await, "new-session");

        let previous = fresh.recover("old-session").await.unwrap().unwrap();
        assert_eq!(previous.waiting_for.len(), 1);
        assert_eq!(fresh.instance_id().await, "old-session");

        let current = fresh.get_instance("old-session").await.unwrap().unwrap();
        assert_eq!(current.status, InstanceStatus::Waiting);
        assert_eq!(current.waiting_for[0].task_id, "task-abc");
        assert_eq!(current.capabilities, vec!["browser"]);
    }
}
