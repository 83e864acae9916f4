use chrono::{DateTime, Utc};
use regex::Regex;
use std::fmt;

/// Arbitrary cluster object as a tree of JSON-like values.
pub type Document = serde_json::Value;

/// A watchable resource type as returned by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKindDescriptor {
    pub group: String,
    pub version: String,
    pub resource_name: String,
    pub kind: String,
}

impl ResourceKindDescriptor {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ResourceKindDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.resource_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Added => "ADDED",
            EventKind::Modified => "MODIFIED",
            EventKind::Deleted => "DELETED",
            EventKind::Bookmark => "BOOKMARK",
            EventKind::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One event delivered by a subscription.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: EventKind,
    pub entity: Option<Document>,
}

/// Identity of one observed object (or one pod for log lines).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl EntityKey {
    /// Path components below the host root. The empty group is stored as
    /// `core` and cluster-scoped objects have no namespace directory.
    pub fn components(&self) -> Vec<&str> {
        let group = if self.group.is_empty() {
            "core"
        } else {
            self.group.as_str()
        };
        let mut parts = vec![group, self.kind.as_str()];
        if !self.namespace.is_empty() {
            parts.push(self.namespace.as_str());
        }
        parts.push(self.name.as_str());
        parts
    }

    pub fn pod(namespace: &str, name: &str) -> Self {
        Self {
            group: String::new(),
            kind: "Pod".to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.components().join("/"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Serialized object state.
    Document,
    /// Final state of an object whose deletion was observed.
    Tombstone,
    /// One raw log line.
    Log,
}

impl RecordKind {
    pub fn suffix(self) -> &'static str {
        match self {
            RecordKind::Document => ".yaml",
            RecordKind::Tombstone => ".tombstone",
            RecordKind::Log => ".log",
        }
    }

    pub fn from_file_name(name: &str) -> Option<(&str, RecordKind)> {
        [RecordKind::Document, RecordKind::Tombstone, RecordKind::Log]
            .into_iter()
            .find_map(|kind| name.strip_suffix(kind.suffix()).map(|stem| (stem, kind)))
    }

    pub fn holds_document(self) -> bool {
        matches!(self, RecordKind::Document | RecordKind::Tombstone)
    }
}

/// A single persisted observation.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    pub host: String,
    pub key: EntityKey,
    pub captured_at: DateTime<Utc>,
    pub kind: RecordKind,
    pub payload: String,
}

/// A pod and its containers, as listed at the start of a log recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodTarget {
    pub namespace: String,
    pub name: String,
    pub containers: Vec<String>,
}

/// Parsed line of the ignore-log-lines file.
#[derive(Debug, Clone)]
pub struct IgnoreRule {
    pub file_match: Regex,
    pub line_match: Option<Regex>,
}
