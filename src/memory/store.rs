//! File-backed memory repository
//!
//! Directory layout (shared root):
//! ```text
//! .colony/
//! ├── index.yaml
//! ├── timeline.yaml
//! └── memories/
//!     ├── 20250304-101500-decision-k3x9a2bq.yaml
//!     └── ...
//! ```
//!
//! Memory files are authoritative. The index and timeline are derived and
//! updated after the memory file is written, so a crash in between leaves
//! stale bookkeeping that `rebuild_index` repairs, never a dangling id.

use super::index::{IndexLimits, MemoryIndex, Timeline, TimelineEntry};
use super::types::{clamp_score, Memory, MemoryLinks, MemoryQuery, MemoryStatus, NewMemory};
use crate::config::{ColonyConfig, Layout, MemorySettings};
use crate::error::{Error, Result};
use crate::ids;
use crate::storage::{self, SharedLock};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::path::PathBuf;

/// A memory together with its surroundings in time and in the supersede chain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemporalContext {
    pub memory: Memory,
    /// Timeline entries immediately before the memory, oldest first
    pub before: Vec<TimelineEntry>,
    /// Timeline entries immediately after the memory, oldest first
    pub after: Vec<TimelineEntry>,
    pub superseded_by: Option<Memory>,
    pub supersedes: Vec<Memory>,
}

/// Outcome of rebuilding the index from memory files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub indexed: usize,
    pub skipped: Vec<String>,
    /// Timeline entries dropped because their memory file is gone
    pub timeline_pruned: usize,
}

/// Owns memory files and keeps the index and timeline in step with them
#[derive(Debug, Clone)]
pub struct MemoryRepository {
    memories_dir: PathBuf,
    index_path: PathBuf,
    timeline_path: PathBuf,
    settings: MemorySettings,
    index_lock: SharedLock,
    timeline_lock: SharedLock,
}

impl MemoryRepository {
    pub fn new(layout: &Layout, config: &ColonyConfig) -> Self {
        Self {
            memories_dir: layout.memories_dir(),
            index_path: layout.index_path(),
            timeline_path: layout.timeline_path(),
            settings: config.memory.clone(),
            index_lock: SharedLock::new(layout.locks_dir(), "index", config.locking.clone()),
            timeline_lock: SharedLock::new(layout.locks_dir(), "timeline", config.locking.clone()),
        }
    }

    fn limits(&self) -> IndexLimits {
        IndexLimits::from(&self.settings)
    }

    // =========================================================================
    // Create / read
    // =========================================================================

    /// Create a memory, index it, and supersede any targets it names.
    pub async fn create(&self, instance_id: &str, input: NewMemory) -> Result<Memory> {
        for target in &input.supersedes {
            ids::validate(target)?;
        }

        let memory = Memory {
            id: ids::memory_id(),
            memory_type: input.memory_type,
            timestamp: Utc::now(),
            instance_id: instance_id.to_string(),
            title: input.title,
            summary: input.summary,
            details: input.details,
            context: input.context,
            tags: input.tags,
            importance: clamp_score(input.importance, self.settings.default_importance),
            confidence: clamp_score(input.confidence, self.settings.default_confidence),
            status: MemoryStatus::Active,
            links: MemoryLinks {
                superseded_by: None,
                supersedes: input.supersedes,
            },
            last_accessed: None,
            access_count: 0,
        };

        let path = self.memories_dir.join(memory.file_name());
        storage::write_yaml(&path, &memory).await?;

        self.update_index(|index, limits| index.insert(&memory, limits))
            .await?;
        self.append_timeline(TimelineEntry::for_memory(&memory)).await?;

        tracing::info!(
            id = %memory.id,
            memory_type = %memory.memory_type,
            "Memory created"
        );

        for old_id in &memory.links.supersedes {
            if let Err(e) = self.supersede(old_id, &memory.id).await {
                tracing::warn!("Failed to supersede {} with {}: {}", old_id, memory.id, e);
            }
        }

        Ok(memory)
    }

    /// Load a memory and record the access on disk.
    pub async fn get(&self, id: &str) -> Result<Option<Memory>> {
        let Some((path, mut memory)) = self.load(id).await? else {
            return Ok(None);
        };
        memory.record_access();
        storage::write_yaml(&path, &memory).await?;
        Ok(Some(memory))
    }

    /// Load a memory without recording an access.
    pub async fn peek(&self, id: &str) -> Result<Option<Memory>> {
        Ok(self.load(id).await?.map(|(_, memory)| memory))
    }

    async fn find_path(&self, id: &str) -> Result<Option<PathBuf>> {
        ids::validate(id)?;
        let suffix = Memory::file_suffix(id);
        let files = storage::list_yaml_files(&self.memories_dir).await?;
        Ok(files
            .into_iter()
            .find(|p| storage::file_name(p).ends_with(&suffix)))
    }

    async fn load(&self, id: &str) -> Result<Option<(PathBuf, Memory)>> {
        let Some(path) = self.find_path(id).await? else {
            return Ok(None);
        };
        let memory: Option<Memory> = storage::read_yaml(&path).await?;
        Ok(memory.map(|m| (path, m)))
    }

    // =========================================================================
    // Query
    // =========================================================================

    /// Resolve candidates from the index, load them, filter, sort newest
    /// first and apply the limit (zero or absent means unlimited).
    pub async fn query(&self, query: &MemoryQuery) -> Result<Vec<Memory>> {
        let index = self.load_index().await;
        let candidates = index.candidates(query);
        let mut memories = self.load_many(candidates.iter().map(String::as_str)).await?;

        memories.retain(|m| query.matches_loaded(m));
        memories.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = query.effective_limit() {
            memories.truncate(limit);
        }
        Ok(memories)
    }

    /// Load several memories by id, skipping ids whose file is missing or
    /// unreadable. Order follows `ids`.
    async fn load_many<'a>(&self, ids: impl Iterator<Item = &'a str>) -> Result<Vec<Memory>> {
        let files = storage::list_yaml_files(&self.memories_dir).await?;

        let mut paths = Vec::new();
        for id in ids {
            let suffix = Memory::file_suffix(id);
            match files.iter().find(|p| storage::file_name(p).ends_with(&suffix)) {
                Some(path) => paths.push(path.clone()),
                None => tracing::warn!("Index references missing memory {}", id),
            }
        }

        let loaded = join_all(paths.iter().map(|p| storage::read_yaml::<Memory>(p))).await;
        let mut memories = Vec::with_capacity(loaded.len());
        for (path, result) in paths.iter().zip(loaded) {
            match result {
                Ok(Some(memory)) => memories.push(memory),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable memory {}: {}", path.display(), e),
            }
        }
        Ok(memories)
    }

    /// The most recent active memories, newest first (zero = all indexed).
    pub async fn recent(&self, limit: usize) -> Result<Vec<Memory>> {
        let index = self.load_index().await;
        let take = if limit == 0 { index.recent.len() } else { limit };
        let ids = index.recent.iter().take(take).map(String::as_str);
        self.load_many(ids).await
    }

    /// Active memories with importance at or above `threshold`, most
    /// important first.
    pub async fn important(&self, threshold: f64) -> Result<Vec<Memory>> {
        let mut memories = if threshold >= self.settings.high_importance_threshold {
            let index = self.load_index().await;
            self.load_many(index.high_importance.iter().map(String::as_str))
                .await?
        } else {
            self.query(&MemoryQuery::all()).await?
        };

        memories.retain(|m| m.status == MemoryStatus::Active && m.importance >= threshold);
        memories.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        Ok(memories)
    }

    /// Active memories related to any of `files`, newest first
    pub async fn for_files(&self, files: &[String]) -> Result<Vec<Memory>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let query = MemoryQuery {
            files: files.to_vec(),
            ..Default::default()
        };
        self.query(&query).await
    }

    // =========================================================================
    // Status changes
    // =========================================================================

    /// Mark `old_id` as superseded by `new_id`. `Ok(None)` when `old_id`
    /// does not exist.
    pub async fn supersede(&self, old_id: &str, new_id: &str) -> Result<Option<Memory>> {
        ids::validate(new_id)?;
        let Some((path, mut old)) = self.load(old_id).await? else {
            tracing::debug!("Supersede target {} not found", old_id);
            return Ok(None);
        };
        if !old.status.can_transition_to(MemoryStatus::Superseded) {
            return Err(Error::InvalidTransition {
                operation: "supersede",
                entity: "memory",
                id: old_id.to_string(),
                actual: old.status.to_string(),
                expected: MemoryStatus::Active.to_string(),
            });
        }

        old.status = MemoryStatus::Superseded;
        old.links.superseded_by = Some(new_id.to_string());
        storage::write_yaml(&path, &old).await?;

        self.update_index(|index, _| index.set_status(old_id, MemoryStatus::Superseded))
            .await?;
        tracing::info!(old = %old_id, new = %new_id, "Memory superseded");
        Ok(Some(old))
    }

    /// Archive a memory. `Ok(None)` when it does not exist.
    pub async fn archive(&self, id: &str) -> Result<Option<Memory>> {
        let Some((path, mut memory)) = self.load(id).await? else {
            return Ok(None);
        };
        if !memory.status.can_transition_to(MemoryStatus::Archived) {
            return Err(Error::InvalidTransition {
                operation: "archive",
                entity: "memory",
                id: id.to_string(),
                actual: memory.status.to_string(),
                expected: "active or superseded".to_string(),
            });
        }

        memory.status = MemoryStatus::Archived;
        storage::write_yaml(&path, &memory).await?;
        self.update_index(|index, _| index.set_status(id, MemoryStatus::Archived))
            .await?;
        tracing::info!(id = %id, "Memory archived");
        Ok(Some(memory))
    }

    // =========================================================================
    // Timeline and context
    // =========================================================================

    /// Timeline entries at or after `since`, newest first (zero = all)
    pub async fn timeline(&self, since: Option<DateTime<Utc>>, limit: usize) -> Vec<TimelineEntry> {
        self.load_timeline().await.newest_first(since, limit)
    }

    /// A memory with its neighbouring timeline entries and supersede chain.
    pub async fn context(&self, id: &str, window: usize) -> Result<Option<TemporalContext>> {
        let Some(memory) = self.get(id).await? else {
            return Ok(None);
        };

        let (before, after) = self
            .load_timeline()
            .await
            .around(id, window)
            .unwrap_or_default();

        let superseded_by = match &memory.links.superseded_by {
            Some(newer) => self.peek(newer).await?,
            None => None,
        };
        let supersedes = self
            .load_many(memory.links.supersedes.iter().map(String::as_str))
            .await?;

        Ok(Some(TemporalContext {
            memory,
            before,
            after,
            superseded_by,
            supersedes,
        }))
    }

    // =========================================================================
    // Index maintenance
    // =========================================================================

    /// Load the index, falling back to defaults on a missing or corrupt file.
    pub async fn load_index(&self) -> MemoryIndex {
        match storage::read_optional(&self.index_path).await {
            Ok(Some(content)) => MemoryIndex::from_yaml_str(&content),
            Ok(None) => MemoryIndex::default(),
            Err(e) => {
                tracing::warn!("Failed to read index {}: {}", self.index_path.display(), e);
                MemoryIndex::default()
            }
        }
    }

    /// Load the timeline, falling back to empty on a missing or corrupt file.
    pub async fn load_timeline(&self) -> Timeline {
        match storage::read_optional(&self.timeline_path).await {
            Ok(Some(content)) => Timeline::from_yaml_str(&content),
            Ok(None) => Timeline::default(),
            Err(e) => {
                tracing::warn!("Failed to read timeline {}: {}", self.timeline_path.display(), e);
                Timeline::default()
            }
        }
    }

    async fn update_index<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut MemoryIndex, IndexLimits),
    {
        let _guard = self.index_lock.acquire_or_proceed().await;
        let mut index = self.load_index().await;
        mutate(&mut index, self.limits());
        storage::write_yaml(&self.index_path, &index).await
    }

    async fn append_timeline(&self, entry: TimelineEntry) -> Result<()> {
        let _guard = self.timeline_lock.acquire_or_proceed().await;
        let mut timeline = self.load_timeline().await;
        timeline.append(entry, self.settings.timeline_limit);
        storage::write_yaml(&self.timeline_path, &timeline).await
    }

    /// Rebuild the index from scratch by scanning every memory file.
    pub async fn rebuild_index(&self) -> Result<RebuildReport> {
        let files = storage::list_yaml_files(&self.memories_dir).await?;
        let loaded = join_all(files.iter().map(|p| storage::read_yaml::<Memory>(p))).await;

        let mut report = RebuildReport::default();
        let mut memories = Vec::new();
        for (path, result) in files.iter().zip(loaded) {
            match result {
                Ok(Some(memory)) => memories.push(memory),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Skipping unreadable memory {}: {}", path.display(), e);
                    report.skipped.push(storage::file_name(path).to_string());
                }
            }
        }
        report.indexed = memories.len();

        let known: std::collections::BTreeSet<&str> =
            memories.iter().map(|m| m.id.as_str()).collect();
        {
            let _guard = self.timeline_lock.acquire_or_proceed().await;
            let mut timeline = self.load_timeline().await;
            let before = timeline.entries.len();
            timeline
                .entries
                .retain(|e| known.contains(e.memory_id.as_str()));
            report.timeline_pruned = before - timeline.entries.len();
            if report.timeline_pruned > 0 {
                storage::write_yaml(&self.timeline_path, &timeline).await?;
            }
        }

        let rebuilt = MemoryIndex::rebuild(&memories, self.limits());
        self.update_index(move |index, _| *index = rebuilt).await?;
        tracing::info!(
            indexed = report.indexed,
            skipped = report.skipped.len(),
            timeline_pruned = report.timeline_pruned,
            "Index rebuilt"
        );
        Ok(report)
    }
}
