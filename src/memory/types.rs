//! Memory data types
//!
//! A `Memory` is a durable fact record shared between instances. Content is
//! fixed at creation; only `status`, `links` and the access-tracking fields
//! change afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Kind of knowledge a memory records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Decision,
    Event,
    Fact,
    Preference,
    Context,
    Conclusion,
}

impl MemoryType {
    pub const ALL: [MemoryType; 6] = [
        MemoryType::Decision,
        MemoryType::Event,
        MemoryType::Fact,
        MemoryType::Preference,
        MemoryType::Context,
        MemoryType::Conclusion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Decision => "decision",
            MemoryType::Event => "event",
            MemoryType::Fact => "fact",
            MemoryType::Preference => "preference",
            MemoryType::Context => "context",
            MemoryType::Conclusion => "conclusion",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MemoryType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| crate::Error::Config(format!("Unknown memory type '{}'", s)))
    }
}

/// Lifecycle status of a memory.
///
/// Transitions only go forward: active → superseded, and
/// active | superseded → archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    Active,
    Superseded,
    Archived,
}

impl MemoryStatus {
    pub const ALL: [MemoryStatus; 3] = [
        MemoryStatus::Active,
        MemoryStatus::Superseded,
        MemoryStatus::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryStatus::Active => "active",
            MemoryStatus::Superseded => "superseded",
            MemoryStatus::Archived => "archived",
        }
    }

    /// Whether moving from `self` to `next` is allowed
    pub fn can_transition_to(&self, next: MemoryStatus) -> bool {
        matches!(
            (self, next),
            (MemoryStatus::Active, MemoryStatus::Superseded)
                | (MemoryStatus::Active, MemoryStatus::Archived)
                | (MemoryStatus::Superseded, MemoryStatus::Archived)
        )
    }
}

impl fmt::Display for MemoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form provenance recorded with a memory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryContext {
    /// Conversation the memory came out of
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,

    /// Project files the memory is about
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_files: Vec<String>,

    /// Anything else the writer wanted to keep
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Links between memories
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryLinks {
    /// Memory that replaced this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,

    /// Memories this one replaced
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supersedes: Vec<String>,
}

/// A durable knowledge record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub timestamp: DateTime<Utc>,
    pub instance_id: String,
    pub title: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<MemoryContext>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub importance: f64,
    pub confidence: f64,
    pub status: MemoryStatus,
    #[serde(default)]
    pub links: MemoryLinks,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub access_count: u64,
}

impl Memory {
    /// File name: sortable timestamp, type, then the id suffix.
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-{}.yaml",
            self.timestamp.format("%Y%m%d-%H%M%S"),
            self.memory_type,
            self.id
        )
    }

    /// Suffix every file name of memory `id` ends with
    pub fn file_suffix(id: &str) -> String {
        format!("-{}.yaml", id)
    }

    pub fn related_files(&self) -> &[String] {
        self.context
            .as_ref()
            .map(|c| c.related_files.as_slice())
            .unwrap_or(&[])
    }

    /// Record an access, incrementing the counter and updating the timestamp.
    pub fn record_access(&mut self) {
        self.access_count += 1;
        self.last_accessed = Some(Utc::now());
    }

    /// Case-insensitive substring match over title, summary, details and tags
    pub fn matches_text(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.title.to_lowercase().contains(&needle)
            || self.summary.to_lowercase().contains(&needle)
            || self
                .details
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&needle))
            || self.tags.iter().any(|t| t.to_lowercase().contains(&needle))
    }
}

/// Input for creating a memory
#[derive(Debug, Clone, PartialEq)]
pub struct NewMemory {
    pub memory_type: MemoryType,
    pub title: String,
    pub summary: String,
    pub details: Option<String>,
    pub context: Option<MemoryContext>,
    pub tags: Vec<String>,
    /// Clamped into [0, 1]; the configured default applies when `None`
    pub importance: Option<f64>,
    /// Clamped into [0, 1]; the configured default applies when `None`
    pub confidence: Option<f64>,
    /// Existing memories this one replaces
    pub supersedes: Vec<String>,
}

impl NewMemory {
    pub fn new(memory_type: MemoryType, title: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            memory_type,
            title: title.into(),
            summary: summary.into(),
            details: None,
            context: None,
            tags: Vec::new(),
            importance: None,
            confidence: None,
            supersedes: Vec::new(),
        }
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Add a tag; duplicates are ignored and insertion order is kept.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    pub fn tags<I, S>(self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        tags.into_iter().fold(self, |acc, t| acc.tag(t))
    }

    pub fn importance(mut self, importance: f64) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.context
            .get_or_insert_with(MemoryContext::default)
            .conversation_id = Some(conversation_id.into());
        self
    }

    pub fn related_file(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        let context = self.context.get_or_insert_with(MemoryContext::default);
        if !context.related_files.contains(&path) {
            context.related_files.push(path);
        }
        self
    }

    pub fn supersedes(mut self, id: impl Into<String>) -> Self {
        self.supersedes.push(id.into());
        self
    }
}

/// Clamp a score into [0, 1], using `default` for missing or NaN input.
pub fn clamp_score(value: Option<f64>, default: f64) -> f64 {
    value
        .filter(|v| !v.is_nan())
        .unwrap_or(default)
        .clamp(0.0, 1.0)
}

/// Filter for memory queries. All set fields are ANDed together; within
/// `types`, `tags`, `files` and `statuses` any listed value matches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryQuery {
    pub types: Vec<MemoryType>,
    pub tags: Vec<String>,
    pub files: Vec<String>,
    /// Explicit status buckets; overrides `include_superseded` when set
    pub statuses: Vec<MemoryStatus>,
    pub include_superseded: bool,
    /// Inclusive lower bound on the timestamp
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the timestamp
    pub before: Option<DateTime<Utc>>,
    pub min_importance: Option<f64>,
    pub text: Option<String>,
    /// `None` or `Some(0)` both mean "no limit"
    pub limit: Option<usize>,
}

impl MemoryQuery {
    /// Matches every active memory.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_type(mut self, memory_type: MemoryType) -> Self {
        self.types.push(memory_type);
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.files.push(path.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: MemoryStatus) -> Self {
        self.statuses.push(status);
        self
    }

    #[must_use]
    pub fn include_superseded(mut self) -> Self {
        self.include_superseded = true;
        self
    }

    #[must_use]
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    #[must_use]
    pub fn before(mut self, before: DateTime<Utc>) -> Self {
        self.before = Some(before);
        self
    }

    #[must_use]
    pub fn min_importance(mut self, min: f64) -> Self {
        self.min_importance = Some(min);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Status buckets the query draws candidates from
    pub fn effective_statuses(&self) -> Vec<MemoryStatus> {
        if !self.statuses.is_empty() {
            self.statuses.clone()
        } else if self.include_superseded {
            vec![MemoryStatus::Active, MemoryStatus::Superseded]
        } else {
            vec![MemoryStatus::Active]
        }
    }

    /// Effective result cap; zero means unlimited.
    pub fn effective_limit(&self) -> Option<usize> {
        self.limit.filter(|l| *l > 0)
    }

    /// Checks the filters that cannot be answered from the index.
    pub fn matches_loaded(&self, memory: &Memory) -> bool {
        if !self.effective_statuses().contains(&memory.status) {
            return false;
        }
        if let Some(since) = self.since {
            if memory.timestamp < since {
                return false;
            }
        }
        if let Some(before) = self.before {
            if memory.timestamp >= before {
                return false;
            }
        }
        if let Some(min) = self.min_importance {
            if memory.importance < min {
                return false;
            }
        }
        if let Some(text) = &self.text {
            if !memory.matches_text(text) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Memory {
        Memory {
            id: "abc12345".to_string(),
            memory_type: MemoryType::Decision,
            timestamp: Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap(),
            instance_id: "inst-1".to_string(),
            title: "Use Postgres".to_string(),
            summary: "We picked Postgres for the ledger".to_string(),
            details: Some("JSONB support sealed it".to_string()),
            context: None,
            tags: vec!["Database".to_string()],
            importance: 0.8,
            confidence: 0.9,
            status: MemoryStatus::Active,
            links: MemoryLinks::default(),
            last_accessed: None,
            access_count: 0,
        }
    }

    #[test]
    fn test_file_name_embeds_timestamp_type_and_id() {
        let memory = sample();
        assert_eq!(memory.file_name(), "20250304-050607-decision-abc12345.yaml");
        assert!(memory.file_name().ends_with(&Memory::file_suffix(&memory.id)));
    }

    #[test]
    fn test_status_transitions_only_forward() {
        use MemoryStatus::*;
        assert!(Active.can_transition_to(Superseded));
        assert!(Active.can_transition_to(Archived));
        assert!(Superseded.can_transition_to(Archived));
        assert!(!Superseded.can_transition_to(Active));
        assert!(!Archived.can_transition_to(Active));
        assert!(!Archived.can_transition_to(Superseded));
    }

    #[test]
    fn test_clamp_score() {
        assert_eq!(clamp_score(Some(1.7), 0.5), 1.0);
        assert_eq!(clamp_score(Some(-0.2), 0.5), 0.0);
        assert_eq!(clamp_score(Some(0.3), 0.5), 0.3);
        assert_eq!(clamp_score(None, 0.8), 0.8);
        assert_eq!(clamp_score(Some(f64::NAN), 0.5), 0.5);
    }

    #[test]
    fn test_matches_text_case_insensitive() {
        let memory = sample();
        assert!(memory.matches_text("postgres"));
        assert!(memory.matches_text("JSONB"));
        assert!(memory.matches_text("database"));
        assert!(!memory.matches_text("mysql"));
    }

    #[test]
    fn test_query_statuses_and_limit() {
        assert_eq!(MemoryQuery::all().effective_statuses(), vec![MemoryStatus::Active]);
        assert_eq!(
            MemoryQuery::all().include_superseded().effective_statuses(),
            vec![MemoryStatus::Active, MemoryStatus::Superseded]
        );
        assert_eq!(
            MemoryQuery::all()
                .include_superseded()
                .with_status(MemoryStatus::Archived)
                .effective_statuses(),
            vec![MemoryStatus::Archived]
        );
        assert_eq!(MemoryQuery::all().limit(0).effective_limit(), None);
        assert_eq!(MemoryQuery::all().limit(3).effective_limit(), Some(3));
    }

    #[test]
    fn test_query_time_range_is_half_open() {
        let memory = sample();
        let at = memory.timestamp;
        assert!(MemoryQuery::all().since(at).matches_loaded(&memory));
        assert!(!MemoryQuery::all().before(at).matches_loaded(&memory));
        assert!(MemoryQuery::all()
            .before(at + chrono::Duration::seconds(1))
            .matches_loaded(&memory));
        assert!(!MemoryQuery::all().min_importance(0.9).matches_loaded(&memory));
    }

    #[test]
    fn test_builder_dedupes_tags_and_files() {
        let input = NewMemory::new(MemoryType::Fact, "t", "s")
            .tags(["a", "b", "a"])
            .related_file("src/lib.rs")
            .related_file("src/lib.rs")
            .conversation("conv-1");
        assert_eq!(input.tags, vec!["a", "b"]);
        let context = input.context.unwrap();
        assert_eq!(context.related_files, vec!["src/lib.rs"]);
        assert_eq!(context.conversation_id.as_deref(), Some("conv-1"));
    }

    #[test]
    fn test_memory_yaml_has_greppable_keys() {
        let yaml = serde_yaml::to_string(&sample()).unwrap();
        assert!(yaml.lines().any(|l| l == "type: decision"));
        assert!(yaml.lines().any(|l| l == "title: Use Postgres"));
        assert!(yaml.lines().any(|l| l == "importance: 0.8"));
        assert!(yaml.lines().any(|l| l.starts_with("summary: ")));
        let back: Memory = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, sample());
    }
}
