//! Append-only snapshot store on the local filesystem.
//!
//! Layout below the output directory:
//!
//! ```text
//! <host>/
//!   record-<timestamp>                          # one per recording session
//!   <group>/<kind>/[<namespace>/]<name>/
//!     <timestamp>.yaml                          # object snapshot
//!     <timestamp>.tombstone                     # last state before deletion
//!     <timestamp>.log                           # one pod log line
//! ```
//!
//! Timestamps are UTC with microsecond precision and fixed width, so sorting
//! file names sorts records chronologically.

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::StoreError;
use crate::types::{Document, EntityKey, RecordKind, SnapshotRecord};

pub const TIME_FORMAT: &str = "%Y%m%d-%H%M%S%.6f";
/// Accepts any fractional precision, older recordings used five digits.
const PARSE_FORMAT: &str = "%Y%m%d-%H%M%S%.f";
pub const MARKER_PREFIX: &str = "record-";
/// Size of the per-partition clock table before stale entries are dropped.
const LAST_ISSUED_PRUNE_AT: usize = 1024;

pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    NaiveDateTime::parse_from_str(s, PARSE_FORMAT)
        .map(|t| t.and_utc())
        .map_err(|_| StoreError::InvalidFileName(s.to_string()))
}

/// Derive the store directory name from a cluster URL.
pub fn host_dir_name(cluster_url: &str) -> String {
    let host = cluster_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    host.strip_suffix(":443").unwrap_or(host).to_string()
}

/// Directory holding all records of one entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Partition {
    pub rel_path: PathBuf,
    pub key: EntityKey,
}

impl Partition {
    fn from_rel_path(rel_path: PathBuf) -> Option<Self> {
        let parts: Vec<String> = rel_path
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str().map(str::to_string),
                _ => None,
            })
            .collect();
        let (group, kind, namespace, name) = match parts.as_slice() {
            [g, k, n] => (g, k, String::new(), n),
            [g, k, ns, n] => (g, k, ns.clone(), n),
            _ => return None,
        };
        let group = if group == "core" {
            String::new()
        } else {
            group.clone()
        };
        Some(Self {
            rel_path,
            key: EntityKey {
                group,
                kind: kind.clone(),
                namespace,
                name: name.clone(),
            },
        })
    }

    /// Slash separated path relative to the host root, used for matching.
    pub fn display_path(&self) -> String {
        self.key.to_string()
    }
}

/// A record file inside a partition, not yet read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFile {
    pub file_name: String,
    pub captured_at: DateTime<Utc>,
    pub kind: RecordKind,
}

pub struct SnapshotStore {
    root: PathBuf,
    host: String,
    last_issued: Mutex<HashMap<PathBuf, DateTime<Utc>>>,
}

impl SnapshotStore {
    pub fn new(output_dir: impl AsRef<Path>, host: &str) -> Self {
        Self {
            root: output_dir.as_ref().join(host),
            host: host.to_string(),
            last_issued: Mutex::new(HashMap::new()),
        }
    }

    /// Open an existing host directory for reading.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let host = root
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        Self {
            root,
            host,
            last_issued: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_dir(&self, key: &EntityKey) -> PathBuf {
        let mut dir = self.root.clone();
        for part in key.components() {
            dir.push(part);
        }
        dir
    }

    /// Make sure the root directory exists and accepts writes.
    pub async fn init(&self) -> Result<(), StoreError> {
        create_dir(&self.root).await
    }

    /// Next capture time for a partition, strictly after the last one issued.
    fn next_timestamp(&self, partition: &Path) -> DateTime<Utc> {
        let now = Utc::now();
        let mut guard = match self.last_issued.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let issued = match guard.get(partition) {
            Some(last) if now <= *last => *last + TimeDelta::microseconds(1),
            _ => now,
        };
        // Drop sub-microsecond precision so the file name round-trips.
        let issued = DateTime::from_timestamp_micros(issued.timestamp_micros()).unwrap_or(issued);
        guard.insert(partition.to_path_buf(), issued);
        // Entries behind the clock cannot cause a bump any more.
        if guard.len() > LAST_ISSUED_PRUNE_AT {
            guard.retain(|_, last| *last >= issued);
        }
        issued
    }

    /// Append one record to the entity's partition. Returns once the file is
    /// synced to disk.
    pub async fn write(
        &self,
        key: &EntityKey,
        kind: RecordKind,
        payload: &str,
    ) -> Result<SnapshotRecord, StoreError> {
        let dir = self.partition_dir(key);
        create_dir(&dir).await?;
        let captured_at = self.next_timestamp(&dir);
        let path = dir.join(format!("{}{}", format_timestamp(captured_at), kind.suffix()));
        write_new_file(&path, payload.as_bytes()).await?;
        debug!("Wrote {}", path.display());
        Ok(SnapshotRecord {
            host: self.host.clone(),
            key: key.clone(),
            captured_at,
            kind,
            payload: payload.to_string(),
        })
    }

    pub async fn write_document(
        &self,
        key: &EntityKey,
        kind: RecordKind,
        document: &Document,
    ) -> Result<SnapshotRecord, StoreError> {
        let yaml = serde_yaml::to_string(document)?;
        self.write(key, kind, &yaml).await
    }

    /// Write the zero-byte marker of a recording session.
    pub async fn write_marker(&self, at: DateTime<Utc>) -> Result<PathBuf, StoreError> {
        create_dir(&self.root).await?;
        let path = self
            .root
            .join(format!("{}{}", MARKER_PREFIX, format_timestamp(at)));
        write_new_file(&path, b"").await?;
        Ok(path)
    }

    /// Timestamp of the most recent recording session, if any.
    pub fn latest_marker(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        let mut latest = None;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.root, e))?;
            let name = entry.file_name();
            let Some(stamp) = name.to_str().and_then(|n| n.strip_prefix(MARKER_PREFIX)) else {
                continue;
            };
            match parse_timestamp(stamp) {
                Ok(t) => latest = latest.max(Some(t)),
                Err(e) => debug!("Ignoring marker: {}", e),
            }
        }
        Ok(latest)
    }

    /// Every directory below the root that holds at least one record.
    /// Directories that cannot be read are logged and left out.
    pub fn list_partitions(&self) -> Result<Vec<Partition>, StoreError> {
        let mut dirs = BTreeSet::new();
        for entry in WalkDir::new(&self.root).min_depth(2) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable part of {}: {}", self.root.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let is_record = entry
                .file_name()
                .to_str()
                .and_then(RecordKind::from_file_name)
                .is_some();
            if !is_record {
                continue;
            }
            if let Some(parent) = entry.path().parent()
                && let Ok(rel) = parent.strip_prefix(&self.root)
            {
                dirs.insert(rel.to_path_buf());
            }
        }
        let mut partitions: Vec<Partition> = dirs
            .into_iter()
            .filter_map(|rel| {
                let partition = Partition::from_rel_path(rel.clone());
                if partition.is_none() {
                    debug!("Skipping unexpected directory {}", rel.display());
                }
                partition
            })
            .collect();
        partitions.sort_by_key(|p| p.display_path());
        Ok(partitions)
    }

    /// Records of one partition, oldest first.
    pub fn list_records(&self, partition: &Partition) -> Result<Vec<RecordFile>, StoreError> {
        let dir = self.root.join(&partition.rel_path);
        let entries = std::fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Some((stem, kind)) = RecordKind::from_file_name(&name) else {
                continue;
            };
            match parse_timestamp(stem) {
                Ok(captured_at) => records.push(RecordFile {
                    file_name: name,
                    captured_at,
                    kind,
                }),
                Err(e) => debug!("Skipping {}: {}", dir.join(&name).display(), e),
            }
        }
        records.sort_by(|a, b| {
            a.captured_at
                .cmp(&b.captured_at)
                .then_with(|| a.file_name.cmp(&b.file_name))
        });
        Ok(records)
    }

    pub fn record_path(&self, partition: &Partition, file: &RecordFile) -> PathBuf {
        self.root.join(&partition.rel_path).join(&file.file_name)
    }

    pub fn read_record(
        &self,
        partition: &Partition,
        file: &RecordFile,
    ) -> Result<SnapshotRecord, StoreError> {
        let path = self.record_path(partition, file);
        let mut payload = std::fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
        if file.kind == RecordKind::Log && payload.ends_with('\n') {
            payload.pop();
        }
        Ok(SnapshotRecord {
            host: self.host.clone(),
            key: partition.key.clone(),
            captured_at: file.captured_at,
            kind: file.kind,
            payload,
        })
    }

    /// Every record of every entity whose name contains `text`.
    pub fn find_by_name_substring(&self, text: &str) -> Result<Vec<SnapshotRecord>, StoreError> {
        let mut found = Vec::new();
        for partition in self.list_partitions()? {
            if !partition.key.name.contains(text) {
                continue;
            }
            for file in self.list_records(&partition)? {
                found.push(self.read_record(&partition, &file)?);
            }
        }
        Ok(found)
    }
}

async fn create_dir(dir: &Path) -> Result<(), StoreError> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder
        .create(dir)
        .await
        .map_err(|e| StoreError::io(dir, e))
}

async fn write_new_file(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options
        .open(path)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    file.write_all(contents)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    file.sync_all().await.map_err(|e| StoreError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn key(kind: &str, namespace: &str, name: &str) -> EntityKey {
        EntityKey {
            group: "apps".to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_timestamp_format_sorts_chronologically() {
        let a = DateTime::from_timestamp_micros(1_700_000_000_000_001).unwrap();
        let b = DateTime::from_timestamp_micros(1_700_000_000_000_010).unwrap();
        let (fa, fb) = (format_timestamp(a), format_timestamp(b));
        assert_eq!(fa.len(), fb.len());
        assert!(fa < fb);
        assert_eq!(parse_timestamp(&fa).unwrap(), a);
    }

    #[test]
    fn test_parse_five_digit_timestamp() {
        let t = parse_timestamp("20240131-235959.12345").unwrap();
        assert_eq!(t.timestamp_subsec_micros(), 123_450);
    }

    #[test]
    fn test_host_dir_name() {
        assert_eq!(host_dir_name("https://10.0.0.1:443"), "10.0.0.1");
        assert_eq!(host_dir_name("https://api.example.com:6443/"), "api.example.com:6443");
        assert_eq!(host_dir_name("http://localhost:8080"), "localhost:8080");
    }

    #[tokio::test]
    async fn test_burst_writes_are_strictly_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), "cluster");
        let k = key("Deployment", "default", "web");
        for i in 0..50 {
            store
                .write(&k, RecordKind::Log, &format!("line {i}\n"))
                .await
                .unwrap();
        }
        let partitions = store.list_partitions().unwrap();
        assert_eq!(partitions.len(), 1);
        let records = store.list_records(&partitions[0]).unwrap();
        assert_eq!(records.len(), 50);
        for pair in records.windows(2) {
            assert!(pair[0].captured_at < pair[1].captured_at);
        }
        let last = store.read_record(&partitions[0], &records[49]).unwrap();
        assert_eq!(last.payload, "line 49");
    }

    #[tokio::test]
    async fn test_concurrent_writers_on_disjoint_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SnapshotStore::new(dir.path(), "cluster"));
        let mut tasks = Vec::new();
        for name in ["a", "b", "c", "d"] {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let k = key("Deployment", "default", name);
                for i in 0..20 {
                    store
                        .write_document(&k, RecordKind::Document, &json!({"i": i}))
                        .await
                        .unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        let partitions = store.list_partitions().unwrap();
        assert_eq!(partitions.len(), 4);
        for partition in &partitions {
            let records = store.list_records(partition).unwrap();
            assert_eq!(records.len(), 20);
            let values: Vec<i64> = records
                .iter()
                .map(|r| {
                    let doc: Document =
                        serde_yaml::from_str(&store.read_record(partition, r).unwrap().payload)
                            .unwrap();
                    doc["i"].as_i64().unwrap()
                })
                .collect();
            assert_eq!(values, (0..20).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_partition_layout_and_marker() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), "cluster");
        let node = EntityKey {
            group: String::new(),
            kind: "Node".to_string(),
            namespace: String::new(),
            name: "worker-1".to_string(),
        };
        store
            .write_document(&node, RecordKind::Document, &json!({"kind": "Node"}))
            .await
            .unwrap();
        store
            .write(&EntityKey::pod("default", "web-1"), RecordKind::Log, "hello\n")
            .await
            .unwrap();
        assert!(dir.path().join("cluster/core/Node/worker-1").is_dir());
        assert!(dir.path().join("cluster/core/Pod/default/web-1").is_dir());

        assert_eq!(store.latest_marker().unwrap(), None);
        let first = Utc::now();
        store.write_marker(first).await.unwrap();
        let second = first + TimeDelta::seconds(5);
        let marker = store.write_marker(second).await.unwrap();
        assert_eq!(std::fs::metadata(&marker).unwrap().len(), 0);
        assert_eq!(
            store.latest_marker().unwrap().map(|t| t.timestamp_micros()),
            Some(second.timestamp_micros())
        );

        let paths: Vec<String> = store
            .list_partitions()
            .unwrap()
            .iter()
            .map(Partition::display_path)
            .collect();
        assert_eq!(paths, vec!["core/Node/worker-1", "core/Pod/default/web-1"]);
    }

    #[tokio::test]
    async fn test_find_by_name_substring() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), "cluster");
        store
            .write_document(&key("Deployment", "default", "frontend"), RecordKind::Document, &json!({}))
            .await
            .unwrap();
        store
            .write_document(&key("Deployment", "default", "backend"), RecordKind::Document, &json!({}))
            .await
            .unwrap();
        store
            .write_document(&key("StatefulSet", "db", "postgres"), RecordKind::Document, &json!({}))
            .await
            .unwrap();

        let found = store.find_by_name_substring("end").unwrap();
        let mut names: Vec<&str> = found.iter().map(|r| r.key.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["backend", "frontend"]);
        assert!(found.iter().all(|r| r.host == "cluster"));
    }

    #[test]
    fn test_clock_table_drops_stale_partitions() {
        let store = SnapshotStore::new("/unused", "cluster");
        let hour_ago = Utc::now() - TimeDelta::hours(1);
        {
            let mut table = store.last_issued.lock().unwrap();
            for i in 0..=LAST_ISSUED_PRUNE_AT {
                table.insert(PathBuf::from(format!("core/ConfigMap/default/cm-{i}")), hour_ago);
            }
        }
        let fresh = PathBuf::from("apps/Deployment/default/web");
        let issued = store.next_timestamp(&fresh);
        let table = store.last_issued.lock().unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&fresh), Some(&issued));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_directory_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), "cluster");
        store
            .write_document(&key("Deployment", "default", "web"), RecordKind::Document, &json!({}))
            .await
            .unwrap();
        store
            .write_document(&key("StatefulSet", "db", "postgres"), RecordKind::Document, &json!({}))
            .await
            .unwrap();
        let locked = dir.path().join("cluster/apps/StatefulSet");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
        // Permission bits do not stop root.
        let readable = std::fs::read_dir(&locked).is_ok();

        let paths: Vec<String> = store
            .list_partitions()
            .unwrap()
            .iter()
            .map(Partition::display_path)
            .collect();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o700)).unwrap();
        if !readable {
            assert_eq!(paths, vec!["apps/Deployment/default/web"]);
        }
    }
}
