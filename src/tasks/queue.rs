//! Task queue over status-bucket directories
//!
//! Directory layout:
//! ```text
//! .colony/tasks/completed/<task id>.yaml          (version-controlled)
//! .colony/runtime/tasks/pending/<task id>.yaml
//! .colony/runtime/tasks/active/<task id>.yaml     (claimed, in_progress)
//! .colony/runtime/tasks/failed/<task id>.yaml     (failed, cancelled)
//! ```
//!
//! Claiming is a rename out of `pending/`: of several instances racing for
//! the same task exactly one rename succeeds, and the others observe the
//! task as no longer pending. Every other bucket change writes the new copy
//! first and then deletes the old one, so a crash leaves at worst a
//! duplicate, which lookups resolve to the copy with the longest history.

use super::types::{
    Bucket, Claim, DelegateRequest, ProgressUpdate, Task, TaskCreator, TaskResult, TaskStatus,
    WaitHandle,
};
use crate::config::Layout;
use crate::error::{Error, Result};
use crate::ids;
use crate::storage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::PathBuf;

/// A task together with the bucket its file was found in
#[derive(Debug, Clone, PartialEq)]
struct Located {
    bucket: Bucket,
    task: Task,
}

/// What `reconcile` repaired
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Tasks moved to the bucket matching their status
    pub relocated: Vec<String>,
    /// Stale copies deleted because a more advanced copy exists
    pub duplicates_removed: Vec<String>,
    /// Files that could not be parsed
    pub unreadable: Vec<String>,
}

/// Owns task files and enforces the task state machine
#[derive(Debug, Clone)]
pub struct TaskQueue {
    pending_dir: PathBuf,
    active_dir: PathBuf,
    completed_dir: PathBuf,
    failed_dir: PathBuf,
}

impl TaskQueue {
    pub fn new(layout: &Layout) -> Self {
        Self {
            pending_dir: layout.pending_tasks_dir(),
            active_dir: layout.active_tasks_dir(),
            completed_dir: layout.completed_tasks_dir(),
            failed_dir: layout.failed_tasks_dir(),
        }
    }

    fn bucket_dir(&self, bucket: Bucket) -> &PathBuf {
        match bucket {
            Bucket::Pending => &self.pending_dir,
            Bucket::Active => &self.active_dir,
            Bucket::Completed => &self.completed_dir,
            Bucket::Failed => &self.failed_dir,
        }
    }

    fn path_in(&self, bucket: Bucket, id: &str) -> PathBuf {
        self.bucket_dir(bucket).join(Task::file_name(id))
    }

    // =========================================================================
    // Storage helpers
    // =========================================================================

    /// Write `task` into `bucket`, refusing any location that disagrees with
    /// the task's status.
    async fn write_in(&self, bucket: Bucket, task: &Task) -> Result<()> {
        if task.status.bucket() != bucket {
            return Err(Error::Internal(format!(
                "task {} with status {} does not belong in bucket {}",
                task.id, task.status, bucket
            )));
        }
        storage::write_yaml(&self.path_in(bucket, &task.id), task).await
    }

    /// Persist a task after a transition: new location first, then drop the
    /// copy in the bucket it was loaded from.
    async fn store(&self, from: Bucket, task: &Task) -> Result<()> {
        let to = task.status.bucket();
        self.write_in(to, task).await?;
        if from != to {
            storage::remove_if_exists(&self.path_in(from, &task.id)).await?;
            tracing::debug!(id = %task.id, from = %from, to = %to, "Task moved");
        }
        Ok(())
    }

    async fn read_in(&self, bucket: Bucket, id: &str) -> Result<Option<Task>> {
        storage::read_yaml(&self.path_in(bucket, id)).await
    }

    /// Find a task in any bucket, preferring the copy with the longest
    /// status history when more than one exists.
    ///
    /// A task moving forward while the buckets are scanned can slip past a
    /// single pass, so an empty result is re-checked once.
    async fn locate(&self, id: &str) -> Result<Option<Located>> {
        ids::validate(id)?;
        for _ in 0..2 {
            let mut best: Option<Located> = None;
            for bucket in Bucket::ALL {
                let Some(task) = self.read_in(bucket, id).await? else {
                    continue;
                };
                let better = best
                    .as_ref()
                    .map_or(true, |b| task.status_history.len() > b.task.status_history.len());
                if better {
                    best = Some(Located { bucket, task });
                }
            }
            if best.is_some() {
                return Ok(best);
            }
        }
        Ok(None)
    }

    /// Every parseable task in a bucket, oldest first
    pub async fn list(&self, bucket: Bucket) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for path in storage::list_yaml_files(self.bucket_dir(bucket)).await? {
            match storage::read_yaml::<Task>(&path).await {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable task {}: {}", path.display(), e),
            }
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    // =========================================================================
    // Creation and lookup
    // =========================================================================

    /// Create a pending task.
    pub async fn create(&self, creator: TaskCreator, req: DelegateRequest) -> Result<Task> {
        if let Some(target) = &req.target.specific_instance {
            ids::validate(target)?;
        }

        let now = Utc::now();
        let timeout_at = match req.timeout {
            Some(t) => Some(now.checked_add_signed(t).ok_or_else(|| {
                Error::Config(format!("task timeout {} is out of range", t))
            })?),
            None => None,
        };
        let mut task = Task {
            id: ids::task_id(),
            created_at: now,
            wait_handle: WaitHandle {
                requester: creator.instance_id.clone(),
                acknowledged: false,
                acknowledged_at: None,
            },
            created_by: creator,
            priority: req.priority,
            title: req.title,
            description: req.description,
            instructions: req.instructions,
            expected_output: req.expected_output,
            target: req.target,
            timeout_at,
            related: req.related,
            status: TaskStatus::Pending,
            status_history: Vec::new(),
            claimed_by: None,
            progress_updates: Vec::new(),
            completed_at: None,
            result: None,
        };
        let by = task.created_by.instance_id.clone();
        task.transition(TaskStatus::Pending, Some(&by), None);

        self.write_in(Bucket::Pending, &task).await?;
        tracing::info!(id = %task.id, priority = ?task.priority, "Task created");
        Ok(task)
    }

    /// Look up a task by id
    pub async fn get(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.locate(id).await?.map(|l| l.task))
    }

    /// Pending tasks this instance may claim, most urgent first
    pub async fn claimable(
        &self,
        instance_id: &str,
        capabilities: &BTreeSet<String>,
    ) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .list(Bucket::Pending)
            .await?
            .into_iter()
            .filter(|t| t.is_claimable_by(instance_id, capabilities))
            .collect();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(tasks)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// pending → claimed. Raises when the task is not (or no longer) pending.
    pub async fn claim(
        &self,
        id: &str,
        claimant: &str,
        machine: Option<&str>,
    ) -> Result<Option<Task>> {
        let Some(located) = self.locate(id).await? else {
            return Ok(None);
        };
        if located.task.status != TaskStatus::Pending {
            return Err(Error::task_transition(
                "claim",
                id,
                located.task.status,
                TaskStatus::Pending.as_str(),
            ));
        }

        let from = self.path_in(Bucket::Pending, id);
        let to = self.path_in(Bucket::Active, id);
        tokio::fs::create_dir_all(&self.active_dir).await?;
        if let Err(e) = tokio::fs::rename(&from, &to).await {
            // Only a vanished source means another claimant got there first
            if e.kind() != ErrorKind::NotFound || tokio::fs::try_exists(&from).await? {
                return Err(e.into());
            }
            let actual = match self.locate(id).await? {
                // Moved out of pending by the winner but not yet rewritten
                Some(l) if l.task.status == TaskStatus::Pending && l.bucket != Bucket::Pending => {
                    TaskStatus::Claimed
                }
                Some(l) => l.task.status,
                None => TaskStatus::Claimed,
            };
            tracing::warn!(id = %id, claimant = %claimant, "Lost claim race");
            return Err(Error::task_transition(
                "claim",
                id,
                actual,
                TaskStatus::Pending.as_str(),
            ));
        }

        // The file is ours now; re-read it in case it changed since lookup.
        let mut task = self.read_in(Bucket::Active, id).await?.unwrap_or(located.task);
        task.claimed_by = Some(Claim {
            instance_id: claimant.to_string(),
            machine: machine.map(str::to_string),
            at: Utc::now(),
        });
        task.transition(TaskStatus::Claimed, Some(claimant), None);
        self.write_in(Bucket::Active, &task).await?;

        tracing::info!(id = %id, claimant = %claimant, "Task claimed");
        Ok(Some(task))
    }

    /// claimed → in_progress
    pub async fn start(&self, id: &str, by: &str) -> Result<Option<Task>> {
        let Some(Located { bucket, mut task }) = self.locate(id).await? else {
            return Ok(None);
        };
        if task.status != TaskStatus::Claimed {
            return Err(Error::task_transition(
                "start",
                id,
                task.status,
                TaskStatus::Claimed.as_str(),
            ));
        }

        task.progress_updates.clear();
        task.transition(TaskStatus::InProgress, Some(by), None);
        self.store(bucket, &task).await?;
        tracing::info!(id = %id, by = %by, "Task started");
        Ok(Some(task))
    }

    /// Append a progress note to an in-progress task.
    pub async fn progress(
        &self,
        id: &str,
        by: &str,
        message: impl Into<String>,
        percent: Option<u8>,
    ) -> Result<Option<Task>> {
        let Some(Located { bucket, mut task }) = self.locate(id).await? else {
            return Ok(None);
        };
        if task.status != TaskStatus::InProgress {
            return Err(Error::task_transition(
                "update progress of",
                id,
                task.status,
                TaskStatus::InProgress.as_str(),
            ));
        }

        task.progress_updates.push(ProgressUpdate {
            at: Utc::now(),
            by: by.to_string(),
            message: message.into(),
            percent: percent.map(|p| p.min(100)),
        });
        self.store(bucket, &task).await?;
        Ok(Some(task))
    }

    /// claimed | in_progress → completed
    pub async fn complete(
        &self,
        id: &str,
        by: &str,
        summary: Option<String>,
        output: Option<serde_json::Value>,
    ) -> Result<Option<Task>> {
        let Some(Located { bucket, mut task }) = self.locate(id).await? else {
            return Ok(None);
        };
        if !matches!(task.status, TaskStatus::Claimed | TaskStatus::InProgress) {
            return Err(Error::task_transition(
                "complete",
                id,
                task.status,
                "claimed or in_progress",
            ));
        }

        task.result = Some(TaskResult {
            success: true,
            summary,
            output,
            error: None,
        });
        task.completed_at = Some(Utc::now());
        task.transition(TaskStatus::Completed, Some(by), None);
        self.store(bucket, &task).await?;
        tracing::info!(id = %id, by = %by, "Task completed");
        Ok(Some(task))
    }

    /// Any non-terminal status → failed
    pub async fn fail(&self, id: &str, by: &str, error: impl Into<String>) -> Result<Option<Task>> {
        let Some(Located { bucket, mut task }) = self.locate(id).await? else {
            return Ok(None);
        };
        if task.status.is_terminal() {
            return Err(Error::task_transition(
                "fail",
                id,
                task.status,
                "pending, claimed or in_progress",
            ));
        }

        let error = error.into();
        task.result = Some(TaskResult {
            success: false,
            summary: None,
            output: None,
            error: Some(error.clone()),
        });
        task.completed_at = Some(Utc::now());
        task.transition(TaskStatus::Failed, Some(by), Some(error));
        self.store(bucket, &task).await?;
        tracing::info!(id = %id, by = %by, "Task failed");
        Ok(Some(task))
    }

    /// Any non-terminal status → cancelled
    pub async fn cancel(
        &self,
        id: &str,
        by: &str,
        reason: Option<String>,
    ) -> Result<Option<Task>> {
        let Some(Located { bucket, mut task }) = self.locate(id).await? else {
            return Ok(None);
        };
        if task.status.is_terminal() {
            return Err(Error::task_transition(
                "cancel",
                id,
                task.status,
                "pending, claimed or in_progress",
            ));
        }

        task.result = Some(TaskResult {
            success: false,
            summary: None,
            output: None,
            error: reason.clone(),
        });
        task.completed_at = Some(Utc::now());
        task.transition(TaskStatus::Cancelled, Some(by), reason);
        self.store(bucket, &task).await?;
        tracing::info!(id = %id, by = %by, "Task cancelled");
        Ok(Some(task))
    }

    // =========================================================================
    // Waits
    // =========================================================================

    /// Terminal, unacknowledged tasks requested by `requester`, newest
    /// outcome first
    pub async fn completed_waits(&self, requester: &str) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for bucket in [Bucket::Completed, Bucket::Failed] {
            tasks.extend(
                self.list(bucket)
                    .await?
                    .into_iter()
                    .filter(|t| t.wait_handle.requester == requester && t.awaits_acknowledgement()),
            );
        }
        tasks.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        Ok(tasks)
    }

    /// Mark the task's wait handle acknowledged. Repeating it is harmless.
    pub async fn acknowledge(&self, id: &str) -> Result<Option<Task>> {
        let Some(Located { bucket, mut task }) = self.locate(id).await? else {
            return Ok(None);
        };
        if task.wait_handle.acknowledged {
            return Ok(Some(task));
        }

        task.wait_handle.acknowledged = true;
        task.wait_handle.acknowledged_at = Some(Utc::now());
        self.store(bucket, &task).await?;
        Ok(Some(task))
    }

    // =========================================================================
    // Supervision
    // =========================================================================

    /// Non-terminal tasks past their advisory timeout. Nothing is failed
    /// automatically; a supervising process decides what to do.
    pub async fn timed_out(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for bucket in [Bucket::Pending, Bucket::Active] {
            tasks.extend(
                self.list(bucket)
                    .await?
                    .into_iter()
                    .filter(|t| t.is_timed_out(now)),
            );
        }
        Ok(tasks)
    }

    /// Repair duplicates and misplaced files left by interrupted transitions.
    ///
    /// Meant for a quiet moment: a claim in flight briefly looks like a
    /// pending task in the active bucket and would be moved back.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut copies: BTreeMap<String, Vec<Located>> = BTreeMap::new();

        for bucket in Bucket::ALL {
            for path in storage::list_yaml_files(self.bucket_dir(bucket)).await? {
                match storage::read_yaml::<Task>(&path).await {
                    Ok(Some(task)) => copies
                        .entry(task.id.clone())
                        .or_default()
                        .push(Located { bucket, task }),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!("Unreadable task {}: {}", path.display(), e);
                        report.unreadable.push(storage::file_name(&path).to_string());
                    }
                }
            }
        }

        for (id, found) in copies {
            let mut best = &found[0];
            for candidate in &found[1..] {
                if candidate.task.status_history.len() > best.task.status_history.len() {
                    best = candidate;
                }
            }

            let target = best.task.status.bucket();
            if best.bucket != target {
                self.write_in(target, &best.task).await?;
                report.relocated.push(id.clone());
                tracing::warn!(id = %id, from = %best.bucket, to = %target, "Relocated task");
            }
            for copy in found.iter().filter(|c| c.bucket != target) {
                storage::remove_if_exists(&self.path_in(copy.bucket, &id)).await?;
                if copy.bucket != best.bucket {
                    report.duplicates_removed.push(id.clone());
                    tracing::warn!(id = %id, bucket = %copy.bucket, "Removed stale task copy");
                }
            }
        }
        Ok(report)
    }
}
