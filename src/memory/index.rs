//! Memory index and timeline documents
//!
//! Both documents are derived caches over the memory files. Loading never
//! fails: a missing or corrupt document yields a structurally complete
//! default, and a partially shaped one (older schema, hand edits) is merged
//! over the defaults one top-level map at a time.

use super::types::{Memory, MemoryQuery, MemoryStatus, MemoryType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Current index schema version
pub const INDEX_VERSION: u32 = 1;

/// Multi-index over memory ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryIndex {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub by_type: BTreeMap<String, Vec<String>>,
    pub by_tag: BTreeMap<String, Vec<String>>,
    pub by_file: BTreeMap<String, Vec<String>>,
    pub by_status: BTreeMap<String, Vec<String>>,
    /// Newest first, capped
    pub recent: Vec<String>,
    /// Active memories at or above the importance threshold
    pub high_importance: Vec<String>,
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            updated_at: None,
            by_type: MemoryType::ALL
                .iter()
                .map(|t| (t.as_str().to_string(), Vec::new()))
                .collect(),
            by_tag: BTreeMap::new(),
            by_file: BTreeMap::new(),
            by_status: MemoryStatus::ALL
                .iter()
                .map(|s| (s.as_str().to_string(), Vec::new()))
                .collect(),
            recent: Vec::new(),
            high_importance: Vec::new(),
        }
    }
}

/// Limits applied while maintaining the index
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexLimits {
    pub recent_limit: usize,
    pub high_importance_threshold: f64,
}

impl From<&crate::config::MemorySettings> for IndexLimits {
    fn from(settings: &crate::config::MemorySettings) -> Self {
        Self {
            recent_limit: settings.recent_limit,
            high_importance_threshold: settings.high_importance_threshold,
        }
    }
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    value.as_sequence().map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    })
}

fn merge_map(target: &mut BTreeMap<String, Vec<String>>, value: Option<&Value>) {
    let Some(map) = value.and_then(Value::as_mapping) else {
        return;
    };
    for (key, ids) in map {
        if let (Some(key), Some(ids)) = (key.as_str(), string_list(ids)) {
            target.insert(key.to_string(), ids);
        }
    }
}

fn push_unique(list: &mut Vec<String>, id: &str) {
    if !list.iter().any(|x| x == id) {
        list.push(id.to_string());
    }
}

impl MemoryIndex {
    /// Merge a parsed document over the defaults.
    ///
    /// Keys present in the document replace the default entry of the same
    /// key; keys it lacks keep their default. Values of the wrong shape are
    /// ignored.
    pub fn merge_with_defaults(value: &Value) -> Self {
        let mut index = Self::default();
        let Some(doc) = value.as_mapping() else {
            return index;
        };

        if let Some(version) = doc.get("version").and_then(Value::as_u64) {
            index.version = version as u32;
        }
        index.updated_at = doc
            .get("updated_at")
            .and_then(|v| serde_yaml::from_value(v.clone()).ok());

        merge_map(&mut index.by_type, doc.get("by_type"));
        merge_map(&mut index.by_tag, doc.get("by_tag"));
        merge_map(&mut index.by_file, doc.get("by_file"));
        merge_map(&mut index.by_status, doc.get("by_status"));

        if let Some(recent) = doc.get("recent").and_then(string_list) {
            index.recent = recent;
        }
        if let Some(high) = doc.get("high_importance").and_then(string_list) {
            index.high_importance = high;
        }
        index
    }

    /// Parse index text; anything unparseable yields the defaults.
    pub fn from_yaml_str(content: &str) -> Self {
        if content.trim().is_empty() {
            return Self::default();
        }
        match serde_yaml::from_str::<Value>(content) {
            Ok(value) => Self::merge_with_defaults(&value),
            Err(e) => {
                tracing::warn!("Corrupt memory index, using defaults: {}", e);
                Self::default()
            }
        }
    }

    /// Add a memory to every applicable index list.
    pub fn insert(&mut self, memory: &Memory, limits: IndexLimits) {
        let id = memory.id.as_str();

        push_unique(
            self.by_type.entry(memory.memory_type.to_string()).or_default(),
            id,
        );
        for tag in &memory.tags {
            push_unique(self.by_tag.entry(tag.clone()).or_default(), id);
        }
        for file in memory.related_files() {
            push_unique(self.by_file.entry(file.clone()).or_default(), id);
        }
        for ids in self.by_status.values_mut() {
            ids.retain(|x| x != id);
        }
        push_unique(
            self.by_status.entry(memory.status.to_string()).or_default(),
            id,
        );

        if memory.status == MemoryStatus::Active {
            self.recent.retain(|x| x != id);
            self.recent.insert(0, id.to_string());
            self.recent.truncate(limits.recent_limit);

            if memory.importance >= limits.high_importance_threshold {
                push_unique(&mut self.high_importance, id);
            }
        }
        self.updated_at = Some(Utc::now());
    }

    /// Move `id` into the `status` bucket, out of every other status bucket,
    /// and out of `recent`/`high_importance` when it is no longer active.
    pub fn set_status(&mut self, id: &str, status: MemoryStatus) {
        for ids in self.by_status.values_mut() {
            ids.retain(|x| x != id);
        }
        push_unique(self.by_status.entry(status.to_string()).or_default(), id);

        if status != MemoryStatus::Active {
            self.recent.retain(|x| x != id);
            self.high_importance.retain(|x| x != id);
        }
        self.updated_at = Some(Utc::now());
    }

    /// Rebuild from the authoritative memory files.
    pub fn rebuild<'a>(memories: impl IntoIterator<Item = &'a Memory>, limits: IndexLimits) -> Self {
        let mut sorted: Vec<&Memory> = memories.into_iter().collect();
        sorted.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        let mut index = Self::default();
        for memory in sorted {
            index.insert(memory, limits);
        }
        index
    }

    /// Ids listed under the status buckets
    pub fn ids_with_status(&self, statuses: &[MemoryStatus]) -> BTreeSet<String> {
        union(&self.by_status, statuses.iter().map(|s| s.as_str()))
    }

    /// Candidate ids for a query, by intersecting index lists.
    ///
    /// Filters not answerable from the index (time range, importance, text)
    /// are applied by the caller after loading the candidates.
    pub fn candidates(&self, query: &MemoryQuery) -> BTreeSet<String> {
        let mut ids = self.ids_with_status(&query.effective_statuses());

        if !query.types.is_empty() {
            let by_type = union(&self.by_type, query.types.iter().map(|t| t.as_str()));
            ids.retain(|id| by_type.contains(id));
        }
        if !query.tags.is_empty() {
            let by_tag = union(&self.by_tag, query.tags.iter().map(String::as_str));
            ids.retain(|id| by_tag.contains(id));
        }
        if !query.files.is_empty() {
            let by_file = union(&self.by_file, query.files.iter().map(String::as_str));
            ids.retain(|id| by_file.contains(id));
        }
        ids
    }
}

fn union<'a>(
    map: &BTreeMap<String, Vec<String>>,
    keys: impl Iterator<Item = &'a str>,
) -> BTreeSet<String> {
    keys.filter_map(|k| map.get(k))
        .flat_map(|ids| ids.iter().cloned())
        .collect()
}

/// One chronological ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub timestamp: DateTime<Utc>,
    pub memory_id: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supersedes: Vec<String>,
}

impl TimelineEntry {
    pub fn for_memory(memory: &Memory) -> Self {
        Self {
            timestamp: memory.timestamp,
            memory_id: memory.id.clone(),
            memory_type: memory.memory_type,
            summary: memory.summary.clone(),
            supersedes: memory.links.supersedes.clone(),
        }
    }
}

/// Append-only, bounded chronological ledger (oldest first on disk)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub entries: Vec<TimelineEntry>,
}

impl Timeline {
    /// Parse timeline text, keeping every entry that still parses.
    pub fn from_yaml_str(content: &str) -> Self {
        let value: Value = match serde_yaml::from_str(content) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Corrupt timeline, starting empty: {}", e);
                return Self::default();
            }
        };
        let entries = value
            .get("entries")
            .and_then(Value::as_sequence)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_yaml::from_value(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        Self { entries }
    }

    /// Append an entry, dropping the oldest beyond `limit`.
    pub fn append(&mut self, entry: TimelineEntry, limit: usize) {
        self.entries.push(entry);
        if self.entries.len() > limit {
            let excess = self.entries.len() - limit;
            self.entries.drain(..excess);
        }
    }

    /// Entries at or after `since`, newest first; a zero limit is unlimited.
    pub fn newest_first(&self, since: Option<DateTime<Utc>>, limit: usize) -> Vec<TimelineEntry> {
        let iter = self
            .entries
            .iter()
            .rev()
            .filter(|e| since.map_or(true, |s| e.timestamp >= s))
            .cloned();
        if limit == 0 {
            iter.collect()
        } else {
            iter.take(limit).collect()
        }
    }

    /// Up to `window` entries immediately before and after `memory_id`,
    /// both in chronological order. `None` when the id is not in the ledger.
    pub fn around(
        &self,
        memory_id: &str,
        window: usize,
    ) -> Option<(Vec<TimelineEntry>, Vec<TimelineEntry>)> {
        let pos = self.entries.iter().position(|e| e.memory_id == memory_id)?;
        let start = pos.saturating_sub(window);
        let end = (pos + 1 + window).min(self.entries.len());
        Some((
            self.entries[start..pos].to_vec(),
            self.entries[pos + 1..end].to_vec(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::MemoryLinks;
    use chrono::Duration;

    const LIMITS: IndexLimits = IndexLimits {
        recent_limit: 3,
        high_importance_threshold: 0.7,
    };

    fn memory(id: &str, importance: f64, offset_secs: i64) -> Memory {
        Memory {
            id: id.to_string(),
            memory_type: MemoryType::Fact,
            timestamp: Utc::now() + Duration::seconds(offset_secs),
            instance_id: "inst-1".to_string(),
            title: format!("title {}", id),
            summary: format!("summary {}", id),
            details: None,
            context: None,
            tags: vec!["rust".to_string()],
            importance,
            confidence: 0.8,
            status: MemoryStatus::Active,
            links: MemoryLinks::default(),
            last_accessed: None,
            access_count: 0,
        }
    }

    #[test]
    fn test_default_has_every_enum_key() {
        let index = MemoryIndex::default();
        for t in MemoryType::ALL {
            assert_eq!(index.by_type.get(t.as_str()), Some(&Vec::new()));
        }
        for s in MemoryStatus::ALL {
            assert_eq!(index.by_status.get(s.as_str()), Some(&Vec::new()));
        }
    }

    #[test]
    fn test_corrupt_and_empty_documents_use_defaults() {
        assert_eq!(MemoryIndex::from_yaml_str(""), MemoryIndex::default());
        assert_eq!(
            MemoryIndex::from_yaml_str("by_type: [unclosed"),
            MemoryIndex::default()
        );
        assert_eq!(MemoryIndex::from_yaml_str("- just\n- a list\n"), MemoryIndex::default());
    }

    #[test]
    fn test_partial_document_is_shallow_merged() {
        let index = MemoryIndex::from_yaml_str(
            "by_type:\n  decision: [a1]\nby_status:\n  active: [a1]\nrecent: [a1]\n",
        );
        assert_eq!(index.by_type["decision"], vec!["a1"]);
        // keys missing from the persisted map keep their defaults
        assert_eq!(index.by_type["fact"], Vec::<String>::new());
        assert_eq!(index.by_status["superseded"], Vec::<String>::new());
        assert_eq!(index.recent, vec!["a1"]);
        assert!(index.high_importance.is_empty());
        assert!(index.by_tag.is_empty());
    }

    #[test]
    fn test_wrongly_shaped_values_are_ignored() {
        let index = MemoryIndex::from_yaml_str("by_type: 42\nrecent: nope\nhigh_importance: [x]\n");
        assert_eq!(index.by_type, MemoryIndex::default().by_type);
        assert!(index.recent.is_empty());
        assert_eq!(index.high_importance, vec!["x"]);
    }

    #[test]
    fn test_insert_caps_recent_newest_first() {
        let mut index = MemoryIndex::default();
        for (i, id) in ["m1", "m2", "m3", "m4"].iter().enumerate() {
            index.insert(&memory(id, 0.5, i as i64), LIMITS);
        }
        assert_eq!(index.recent, vec!["m4", "m3", "m2"]);
        assert_eq!(index.by_type["fact"].len(), 4);
        assert_eq!(index.by_tag["rust"].len(), 4);
        assert_eq!(index.by_status["active"].len(), 4);
    }

    #[test]
    fn test_high_importance_threshold_is_inclusive() {
        let mut index = MemoryIndex::default();
        index.insert(&memory("edge", 0.7, 0), LIMITS);
        index.insert(&memory("low", 0.69, 1), LIMITS);
        assert_eq!(index.high_importance, vec!["edge"]);
    }

    #[test]
    fn test_set_status_prunes_recent_and_high_importance() {
        let mut index = MemoryIndex::default();
        index.insert(&memory("old", 0.9, 0), LIMITS);
        index.insert(&memory("new", 0.9, 1), LIMITS);

        index.set_status("old", MemoryStatus::Superseded);

        assert_eq!(index.by_status["superseded"], vec!["old"]);
        assert_eq!(index.by_status["active"], vec!["new"]);
        assert!(index.by_status["archived"].is_empty());
        assert_eq!(index.recent, vec!["new"]);
        assert_eq!(index.high_importance, vec!["new"]);
    }

    #[test]
    fn test_candidates_intersect_lists() {
        let mut index = MemoryIndex::default();
        let mut a = memory("a", 0.5, 0);
        a.tags = vec!["db".to_string()];
        let mut b = memory("b", 0.5, 1);
        b.memory_type = MemoryType::Decision;
        b.tags = vec!["db".to_string(), "api".to_string()];
        let mut c = memory("c", 0.5, 2);
        c.tags = vec!["api".to_string()];
        for m in [&a, &b, &c] {
            index.insert(m, LIMITS);
        }

        let by_tags = index.candidates(&MemoryQuery::all().with_tag("db").with_tag("api"));
        assert_eq!(by_tags.len(), 3);

        let decision_db = index.candidates(
            &MemoryQuery::all()
                .with_type(MemoryType::Decision)
                .with_tag("db"),
        );
        assert_eq!(decision_db.into_iter().collect::<Vec<_>>(), vec!["b"]);

        index.set_status("a", MemoryStatus::Superseded);
        assert!(!index.candidates(&MemoryQuery::all()).contains("a"));
        assert!(index
            .candidates(&MemoryQuery::all().include_superseded())
            .contains("a"));
    }

    #[test]
    fn test_rebuild_orders_by_timestamp() {
        let m1 = memory("m1", 0.9, 0);
        let m2 = memory("m2", 0.2, 5);
        let mut m3 = memory("m3", 0.9, 10);
        m3.status = MemoryStatus::Superseded;

        let index = MemoryIndex::rebuild([&m3, &m1, &m2], LIMITS);
        assert_eq!(index.recent, vec!["m2", "m1"]);
        assert_eq!(index.high_importance, vec!["m1"]);
        assert_eq!(index.by_status["superseded"], vec!["m3"]);
    }

    #[test]
    fn test_timeline_bounded_and_ordered() {
        let mut timeline = Timeline::default();
        for i in 0..5 {
            timeline.append(TimelineEntry::for_memory(&memory(&format!("m{}", i), 0.5, i)), 3);
        }
        let ids: Vec<&str> = timeline.entries.iter().map(|e| e.memory_id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3", "m4"]);

        let newest = timeline.newest_first(None, 2);
        assert_eq!(newest[0].memory_id, "m4");
        assert_eq!(newest.len(), 2);
        assert_eq!(timeline.newest_first(None, 0).len(), 3);
    }

    #[test]
    fn test_timeline_around() {
        let mut timeline = Timeline::default();
        for i in 0..6 {
            timeline.append(TimelineEntry::for_memory(&memory(&format!("m{}", i), 0.5, i)), 100);
        }
        let (before, after) = timeline.around("m1", 2).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].memory_id, "m0");
        assert_eq!(after.len(), 2);
        assert_eq!(after[1].memory_id, "m3");
        assert!(timeline.around("missing", 2).is_none());
    }

    #[test]
    fn test_timeline_skips_unparseable_entries() {
        let timeline = Timeline::from_yaml_str(
            "entries:\n  - timestamp: 2025-01-01T00:00:00Z\n    memory_id: ok\n    type: fact\n    summary: fine\n  - memory_id: broken\n",
        );
        assert_eq!(timeline.entries.len(), 1);
        assert_eq!(timeline.entries[0].memory_id, "ok");
        assert!(Timeline::from_yaml_str("entries: [unclosed").entries.is_empty());
    }
}
