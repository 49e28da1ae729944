//! Coordinator facade
//!
//! One `Coordinator` per agent process, bound to a project directory and an
//! instance identity. It holds no state of its own beyond the wiring: every
//! operation goes through the owning store and other processes see the
//! result by re-reading the same files.

use crate::config::{ColonyConfig, Layout};
use crate::error::Result;
use crate::inbox::{Inbox, InboxMessage, MessageType, OutgoingMessage};
use crate::memory::{
    Memory, MemoryQuery, MemoryRepository, NewMemory, RebuildReport, TemporalContext,
    TimelineEntry,
};
use crate::registry::{
    ActivityEntry, Instance, InstanceIdentity, InstanceRegistry, InstanceStatus, WaitEntry,
};
use crate::tasks::{DelegateRequest, ReconcileReport, Task, TaskCreator, TaskQueue};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const GITIGNORE: &str = "# Machine-local coordination state\nruntime/\n";

/// How to open a coordinator
#[derive(Debug, Clone, Default)]
pub struct CoordinatorOptions {
    /// Instance id; generated when absent
    pub instance_id: Option<String>,
    pub capabilities: Vec<String>,
    /// Name of the tool hosting this instance
    pub tool: Option<String>,
    pub session_id: Option<String>,
    /// Overrides `config.toml`
    pub config: Option<ColonyConfig>,
}

/// What `recover_session` found for the previous identity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveredSession {
    pub previous: Instance,
    pub waits: Vec<WaitEntry>,
    pub unread_messages: Vec<InboxMessage>,
}

/// Result of a maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub index: RebuildReport,
    pub tasks: ReconcileReport,
}

pub struct Coordinator {
    layout: Layout,
    config: ColonyConfig,
    memory: MemoryRepository,
    tasks: TaskQueue,
    registry: InstanceRegistry,
    inbox: Inbox,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("layout", &self.layout)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.get_mut().take() {
            handle.abort();
        }
    }
}

impl Coordinator {
    /// Wire up the stores for `project_dir`. Touches nothing on disk besides
    /// reading `config.toml`.
    pub async fn open(project_dir: impl Into<PathBuf>, options: CoordinatorOptions) -> Result<Self> {
        let layout = Layout::new(project_dir);
        let config = match options.config {
            Some(config) => config,
            None => ColonyConfig::load(&layout.config_path()).await,
        };

        let mut identity = match options.instance_id {
            Some(id) => InstanceIdentity::with_id(id),
            None => InstanceIdentity::generate(),
        };
        identity.capabilities = options.capabilities;
        identity.tool = options.tool;
        identity.session_id = options.session_id;

        Ok(Self {
            memory: MemoryRepository::new(&layout, &config),
            tasks: TaskQueue::new(&layout),
            registry: InstanceRegistry::new(&layout, &config, identity)?,
            inbox: Inbox::new(&layout),
            heartbeat: Mutex::new(None),
            layout,
            config,
        })
    }

    /// Create the directory tree and default files, register this instance
    /// and start its heartbeat.
    pub async fn init(&self) -> Result<Instance> {
        self.layout.create_dirs().await?;

        let config_path = self.layout.config_path();
        if !tokio::fs::try_exists(&config_path).await? {
            let text = self.config.to_toml_string()?;
            crate::storage::write_atomic(&config_path, text.as_bytes()).await?;
        }
        let gitignore = self.layout.gitignore_path();
        if !tokio::fs::try_exists(&gitignore).await? {
            crate::storage::write_atomic(&gitignore, GITIGNORE.as_bytes()).await?;
        }

        let instance = self.registry.register().await?;
        self.start_heartbeat().await;
        tracing::info!(
            instance = %instance.id,
            root = %self.layout.shared_root().display(),
            "Coordinator initialized"
        );
        Ok(instance)
    }

    /// (Re)start the background heartbeat loop.
    pub async fn start_heartbeat(&self) {
        let registry = self.registry.clone();
        let period = Duration::from_secs(self.config.heartbeat.interval_seconds.max(1));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; registration just happened.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = registry.heartbeat().await {
                    tracing::warn!("Heartbeat failed: {}", e);
                }
            }
        });

        if let Some(previous) = self.heartbeat.lock().await.replace(handle) {
            previous.abort();
        }
    }

    async fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().await.take() {
            handle.abort();
        }
    }

    /// Stop the heartbeat and mark this instance offline. Tasks it holds are
    /// left as they are.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_heartbeat().await;
        self.registry.go_offline().await?;
        Ok(())
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn config(&self) -> &ColonyConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryRepository {
        &self.memory
    }

    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    pub async fn instance_id(&self) -> String {
        self.registry.instance_id().await
    }

    // =========================================================================
    // Memory
    // =========================================================================

    pub async fn remember(&self, input: NewMemory) -> Result<Memory> {
        let id = self.instance_id().await;
        let memory = self.memory.create(&id, input).await?;
        self.log(
            "remembered",
            Some(format!("{} {}: {}", memory.memory_type, memory.id, memory.title)),
        )
        .await;
        Ok(memory)
    }

    pub async fn recall(&self, query: &MemoryQuery) -> Result<Vec<Memory>> {
        self.memory.query(query).await
    }

    /// Free-text search over active memories (`limit` 0 = unlimited)
    pub async fn search(&self, text: &str, limit: usize) -> Result<Vec<Memory>> {
        self.memory
            .query(&MemoryQuery::text(text).limit(limit))
            .await
    }

    pub async fn get_memory(&self, id: &str) -> Result<Option<Memory>> {
        self.memory.get(id).await
    }

    pub async fn get_recent(&self, limit: usize) -> Result<Vec<Memory>> {
        self.memory.recent(limit).await
    }

    /// Memories at or above `threshold`, or the configured threshold
    pub async fn get_important(&self, threshold: Option<f64>) -> Result<Vec<Memory>> {
        let threshold = threshold.unwrap_or(self.config.memory.high_importance_threshold);
        self.memory.important(threshold).await
    }

    pub async fn get_for_files(&self, files: &[String]) -> Result<Vec<Memory>> {
        self.memory.for_files(files).await
    }

    pub async fn get_timeline(
        &self,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Vec<TimelineEntry> {
        self.memory.timeline(since, limit).await
    }

    pub async fn get_context(&self, id: &str, window: usize) -> Result<Option<TemporalContext>> {
        self.memory.context(id, window).await
    }

    pub async fn supersede(&self, old_id: &str, new_id: &str) -> Result<Option<Memory>> {
        self.memory.supersede(old_id, new_id).await
    }

    pub async fn archive(&self, id: &str) -> Result<Option<Memory>> {
        self.memory.archive(id).await
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Create a task and start waiting on it.
    pub async fn delegate(&self, request: DelegateRequest) -> Result<Task> {
        let identity = self.registry.identity().await;
        let creator = TaskCreator {
            instance_id: identity.id.clone(),
            machine: identity.machine,
        };
        let task = self.tasks.create(creator, request).await?;
        self.registry.wait_for_task(&task.id).await?;
        self.log("delegated", Some(format!("{}: {}", task.id, task.title)))
            .await;
        Ok(task)
    }

    /// Pending tasks this instance may claim, most urgent first
    pub async fn get_available_tasks(&self) -> Result<Vec<Task>> {
        let identity = self.registry.identity().await;
        let capabilities: BTreeSet<String> = identity.capabilities.into_iter().collect();
        self.tasks.claimable(&identity.id, &capabilities).await
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.tasks.get(id).await
    }

    pub async fn claim_task(&self, id: &str) -> Result<Option<Task>> {
        let identity = self.registry.identity().await;
        let task = self
            .tasks
            .claim(id, &identity.id, identity.machine.as_deref())
            .await?;
        if let Some(task) = &task {
            self.log("claimed", Some(format!("{}: {}", task.id, task.title)))
                .await;
        }
        Ok(task)
    }

    pub async fn start_task(&self, id: &str) -> Result<Option<Task>> {
        let me = self.instance_id().await;
        let task = self.tasks.start(id, &me).await?;
        if let Some(task) = &task {
            self.log("started", Some(task.id.clone())).await;
        }
        Ok(task)
    }

    pub async fn update_task_progress(
        &self,
        id: &str,
        message: &str,
        percent: Option<u8>,
    ) -> Result<Option<Task>> {
        let me = self.instance_id().await;
        self.tasks.progress(id, &me, message, percent).await
    }

    pub async fn complete_task(
        &self,
        id: &str,
        summary: Option<String>,
        output: Option<serde_json::Value>,
    ) -> Result<Option<Task>> {
        let me = self.instance_id().await;
        let task = self.tasks.complete(id, &me, summary, output).await?;
        if let Some(task) = &task {
            self.log("completed", Some(task.id.clone())).await;
            self.notify_requester(task).await;
        }
        Ok(task)
    }

    pub async fn fail_task(&self, id: &str, error: &str) -> Result<Option<Task>> {
        let me = self.instance_id().await;
        let task = self.tasks.fail(id, &me, error).await?;
        if let Some(task) = &task {
            self.log("failed", Some(format!("{}: {}", task.id, error)))
                .await;
            self.notify_requester(task).await;
        }
        Ok(task)
    }

    pub async fn cancel_task(&self, id: &str, reason: Option<String>) -> Result<Option<Task>> {
        let me = self.instance_id().await;
        let task = self.tasks.cancel(id, &me, reason).await?;
        if let Some(task) = &task {
            self.log("cancelled", Some(task.id.clone())).await;
            self.notify_requester(task).await;
        }
        Ok(task)
    }

    /// Tell the requester a task reached a terminal status. The transition
    /// already happened, so a failed delivery is only logged.
    async fn notify_requester(&self, task: &Task) {
        let me = self.instance_id().await;
        let requester = &task.wait_handle.requester;
        if *requester == me {
            return;
        }

        let mut body = format!("Task '{}' is {}", task.title, task.status);
        if let Some(result) = &task.result {
            if let Some(detail) = result.summary.as_ref().or(result.error.as_ref()) {
                body.push_str(": ");
                body.push_str(detail);
            }
        }
        let message = OutgoingMessage::new(requester.clone(), MessageType::Response, body)
            .subject(format!("Task {}", task.status))
            .related_task(task.id.clone());
        if let Err(e) = self.inbox.send(&me, message).await {
            tracing::warn!(task = %task.id, to = %requester, "Failed to notify requester: {}", e);
        }
    }

    /// Delegated tasks that finished and still await acknowledgement
    pub async fn check_delegated_tasks(&self) -> Result<Vec<Task>> {
        let me = self.instance_id().await;
        self.tasks.completed_waits(&me).await
    }

    /// Acknowledge a finished task and stop waiting on it.
    pub async fn acknowledge_task(&self, id: &str) -> Result<Option<Task>> {
        let task = self.tasks.acknowledge(id).await?;
        if task.is_some() {
            self.registry.clear_wait(id).await?;
        }
        Ok(task)
    }

    /// Non-terminal tasks past their advisory timeout
    pub async fn timed_out_tasks(&self) -> Result<Vec<Task>> {
        self.tasks.timed_out(Utc::now()).await
    }

    // =========================================================================
    // Instances
    // =========================================================================

    pub async fn set_status(
        &self,
        status: InstanceStatus,
        working_on: Option<String>,
    ) -> Result<Instance> {
        self.registry.update_status(status, working_on).await
    }

    pub async fn get_active_instances(&self) -> Result<Vec<Instance>> {
        self.registry.active_instances().await
    }

    /// Live instances declaring every capability in `required`
    pub async fn find_instances(&self, required: &[String]) -> Result<Vec<Instance>> {
        self.registry.instances_with_capabilities(required).await
    }

    pub async fn get_instance(&self, id: &str) -> Result<Option<Instance>> {
        self.registry.get_instance(id).await
    }

    pub async fn get_activity(&self, limit: usize) -> Result<Vec<ActivityEntry>> {
        self.registry.activity(limit).await
    }

    pub async fn touch_file(&self, path: &str) -> Result<bool> {
        self.registry.touch_file(path).await
    }

    async fn log(&self, action: &str, details: Option<String>) {
        if let Err(e) = self.registry.log_activity(action, details).await {
            tracing::warn!(action, "Failed to log activity: {}", e);
        }
    }

    /// Take over a previous instance's identity and its outstanding waits.
    /// `None` when no such instance was ever registered.
    pub async fn recover_session(&self, previous_id: &str) -> Result<Option<RecoveredSession>> {
        let Some(previous) = self.registry.recover(previous_id).await? else {
            return Ok(None);
        };
        let unread_messages = self.inbox.get_unread(previous_id).await?;
        Ok(Some(RecoveredSession {
            waits: previous.waiting_for.clone(),
            previous,
            unread_messages,
        }))
    }

    // =========================================================================
    // Messages
    // =========================================================================

    pub async fn send_message(&self, message: OutgoingMessage) -> Result<InboxMessage> {
        let me = self.instance_id().await;
        self.inbox.send(&me, message).await
    }

    /// Messages addressed to this instance, newest first
    pub async fn get_messages(&self, unread_only: bool) -> Result<Vec<InboxMessage>> {
        let me = self.instance_id().await;
        if unread_only {
            self.inbox.get_unread(&me).await
        } else {
            self.inbox.get_all(&me).await
        }
    }

    pub async fn mark_read(&self, id: &str) -> Result<Option<InboxMessage>> {
        self.inbox.mark_read(id).await
    }

    /// Delete read messages older than the configured retention.
    pub async fn cleanup_inbox(&self) -> Result<usize> {
        self.inbox.cleanup(self.config.inbox.retention_days).await
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Rebuild the memory index and repair task buckets.
    pub async fn reconcile(&self) -> Result<MaintenanceReport> {
        Ok(MaintenanceReport {
            index: self.memory.rebuild_index().await?,
            tasks: self.tasks.reconcile().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryType;
    use crate::tasks::TaskStatus;
    use tempfile::TempDir;

    async fn open(dir: &TempDir, id: &str, caps: &[&str]) -> Coordinator {
        let coordinator = Coordinator::open(
            dir.path(),
            CoordinatorOptions {
                instance_id: Some(id.to_string()),
                capabilities: caps.iter().map(|c| c.to_string()).collect(),
                tool: Some("test".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        coordinator.init().await.unwrap();
        coordinator
    }

    #[tokio::test]
    async fn test_init_creates_layout() {
        let dir = TempDir::new().unwrap();
        let coordinator = open(&dir, "lead", &[]).await;
        let layout = coordinator.layout();

        for path in layout.directories() {
            assert!(path.is_dir(), "missing {}", path.display());
        }
        let gitignore = std::fs::read_to_string(layout.gitignore_path()).unwrap();
        assert!(gitignore.contains("runtime/"));
        let config = ColonyConfig::load(&layout.config_path()).await;
        assert_eq!(config, ColonyConfig::default());

        let me = coordinator.get_instance("lead").await.unwrap().unwrap();
        assert_eq!(me.status, InstanceStatus::Active);
    }

    #[tokio::test]
    async fn test_important_memories_scenario() {
        let dir = TempDir::new().unwrap();
        let coordinator = open(&dir, "lead", &[]).await;

        let loved = coordinator
            .remember(
                NewMemory::new(MemoryType::Preference, "Tabs", "Use tabs in Makefiles")
                    .importance(0.9),
            )
            .await
            .unwrap();
        let important = coordinator.get_important(Some(0.7)).await.unwrap();
        assert_eq!(important.len(), 1);
        assert_eq!(important[0].id, loved.id);

        coordinator
            .remember(NewMemory::new(MemoryType::Fact, "Minor", "trivia").importance(0.3))
            .await
            .unwrap();
        let important = coordinator.get_important(None).await.unwrap();
        assert_eq!(important.len(), 1);
        assert_eq!(important[0].id, loved.id);

        assert_eq!(coordinator.search("makefiles", 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_two_coordinators_race_for_one_task() {
        let dir = TempDir::new().unwrap();
        let lead = open(&dir, "lead", &[]).await;
        let a = open(&dir, "worker-a", &["browser_testing"]).await;
        let b = open(&dir, "worker-b", &["browser_testing"]).await;

        let task = lead
            .delegate(DelegateRequest::new("E2E", "Run browser tests").capability("browser_testing"))
            .await
            .unwrap();
        assert_eq!(a.get_available_tasks().await.unwrap().len(), 1);
        assert!(lead.get_available_tasks().await.unwrap().is_empty());

        let (ra, rb) = tokio::join!(a.claim_task(&task.id), b.claim_task(&task.id));
        let results = [ra, rb];
        assert_eq!(results.iter().filter(|r| matches!(r, Ok(Some(_)))).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(e) if e.is_invalid_transition()))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_delegation_round_trip() {
        let dir = TempDir::new().unwrap();
        let lead = open(&dir, "lead", &[]).await;
        let worker = open(&dir, "worker", &["rust"]).await;

        let task = lead
            .delegate(DelegateRequest::new("Port module", "Port it").capability("rust"))
            .await
            .unwrap();
        let waiting = lead.get_instance("lead").await.unwrap().unwrap();
        assert_eq!(waiting.status, InstanceStatus::Waiting);

        worker.claim_task(&task.id).await.unwrap().unwrap();
        worker.start_task(&task.id).await.unwrap().unwrap();
        worker
            .update_task_progress(&task.id, "tests green", Some(80))
            .await
            .unwrap()
            .unwrap();
        let done = worker
            .complete_task(&task.id, Some("ported".to_string()), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);

        let finished = lead.check_delegated_tasks().await.unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].id, task.id);

        let messages = lead.get_messages(true).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type, MessageType::Response);
        assert_eq!(messages[0].related_task.as_deref(), Some(task.id.as_str()));

        lead.acknowledge_task(&task.id).await.unwrap().unwrap();
        assert!(lead.check_delegated_tasks().await.unwrap().is_empty());
        let me = lead.get_instance("lead").await.unwrap().unwrap();
        assert_eq!(me.status, InstanceStatus::Active);
        assert!(me.waiting_for.is_empty());

        assert!(lead.acknowledge_task("task-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_notifies_requester() {
        let dir = TempDir::new().unwrap();
        let lead = open(&dir, "lead", &[]).await;
        let other = open(&dir, "other", &[]).await;

        let task = lead
            .delegate(DelegateRequest::new("Obsolete", "drop it"))
            .await
            .unwrap();
        let cancelled = other
            .cancel_task(&task.id, Some("not needed".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        let messages = lead.get_messages(true).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].message.contains("not needed"));
    }

    #[tokio::test]
    async fn test_shutdown_and_recover_session() {
        let dir = TempDir::new().unwrap();
        let old = open(&dir, "session-1", &[]).await;
        let task = old
            .delegate(DelegateRequest::new("Long job", "takes a while"))
            .await
            .unwrap();
        old.send_message(OutgoingMessage::new("session-1", MessageType::Info, "note to self"))
            .await
            .unwrap();
        old.shutdown().await.unwrap();
        let offline = old.get_instance("session-1").await.unwrap().unwrap();
        assert_eq!(offline.status, InstanceStatus::Offline);

        let fresh = open(&dir, "session-2", &[]).await;
        assert!(fresh.recover_session("never-was").await.unwrap().is_none());

        let recovered = fresh.recover_session("session-1").await.unwrap().unwrap();
        assert_eq!(recovered.waits.len(), 1);
        assert_eq!(recovered.waits[0].task_id, task.id);
        assert_eq!(recovered.unread_messages.len(), 1);

        assert_eq!(fresh.instance_id().await, "session-1");
        let adopted = fresh.get_instance("session-1").await.unwrap().unwrap();
        assert_eq!(adopted.status, InstanceStatus::Waiting);
    }

    #[tokio::test]
    async fn test_activity_and_files() {
        let dir = TempDir::new().unwrap();
        let coordinator = open(&dir, "editor", &[]).await;

        coordinator.touch_file("src/lib.rs").await.unwrap();
        coordinator
            .set_status(InstanceStatus::Idle, Some("thinking".to_string()))
            .await
            .unwrap();
        let activity = coordinator.get_activity(1).await.unwrap();
        assert_eq!(activity[0].action, "status: idle");

        let found = coordinator.find_instances(&[]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].files_touched, vec!["src/lib.rs"]);
    }

    #[tokio::test]
    async fn test_reconcile_reports() {
        let dir = TempDir::new().unwrap();
        let coordinator = open(&dir, "keeper", &[]).await;
        coordinator
            .remember(NewMemory::new(MemoryType::Decision, "Use YAML", "For all documents"))
            .await
            .unwrap();

        let report = coordinator.reconcile().await.unwrap();
        assert_eq!(report.index.indexed, 1);
        assert!(report.tasks.relocated.is_empty());
        assert_eq!(coordinator.cleanup_inbox().await.unwrap(), 0);
    }
}
