//! Reconstructs what changed since the last recording session.
//!
//! Every record at or after the newest `record-*` marker is a subject. A
//! document subject is compared with the record just before it in the same
//! partition, which may well predate the marker. Volatile metadata is
//! stripped first, so only semantic changes are reported. Log lines are
//! reported as they are.

use chrono::{DateTime, TimeDelta, Utc};
use crossterm::style::Stylize;
use regex::Regex;
use similar::TextDiff;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::DeltaError;
use crate::store::{Partition, RecordFile, SnapshotStore, format_timestamp};
use crate::types::{Document, RecordKind};
use crate::utils::{format_elapsed, get_color};

const LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";
const VOLATILE_METADATA: [&str; 4] = ["managedFields", "resourceVersion", "generation", "uid"];

#[derive(Debug, Clone, Default)]
pub struct DeltaOptions {
    pub skip: Vec<String>,
    pub only: Vec<String>,
    pub skip_initial: bool,
}

/// Include/exclude patterns over a partition path such as
/// `apps/Deployment/default/web`.
#[derive(Debug)]
pub struct PathFilter {
    skip: Vec<Regex>,
    only: Vec<Regex>,
}

impl PathFilter {
    pub fn new(skip: &[String], only: &[String]) -> Result<Self, DeltaError> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|source| DeltaError::Pattern {
                        pattern: p.clone(),
                        source,
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            skip: compile(skip)?,
            only: compile(only)?,
        })
    }

    /// With any `only` pattern the path must match one of them and `skip`
    /// is not consulted.
    pub fn allows(&self, path: &str) -> bool {
        if !self.only.is_empty() {
            return self.only.iter().any(|r| r.is_match(path));
        }
        !self.skip.iter().any(|r| r.is_match(path))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeltaComparison {
    pub path: String,
    pub before: DateTime<Utc>,
    pub after: DateTime<Utc>,
    pub diff: String,
    pub elapsed: TimeDelta,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeltaReport {
    /// First observation of an entity.
    Initial {
        path: String,
        captured_at: DateTime<Utc>,
        document: String,
    },
    Changed(DeltaComparison),
    /// Compared equal after stripping volatile fields.
    Unchanged {
        path: String,
        before: DateTime<Utc>,
        after: DateTime<Utc>,
    },
    Deleted {
        path: String,
        captured_at: DateTime<Utc>,
        elapsed: Option<TimeDelta>,
    },
    Log {
        path: String,
        captured_at: DateTime<Utc>,
        line: String,
    },
    /// The subject could not be read or parsed.
    Failed {
        path: String,
        file: PathBuf,
        error: String,
    },
}

/// Walk the store below `dir` and report every change since its most recent
/// recording session, ordered by partition path and then capture time.
pub fn compute_deltas(dir: &Path, options: &DeltaOptions) -> Result<Vec<DeltaReport>, DeltaError> {
    let filter = PathFilter::new(&options.skip, &options.only)?;
    if !dir.is_dir() {
        return Err(DeltaError::NotADirectory(dir.to_path_buf()));
    }
    let store = SnapshotStore::open(dir);
    let anchor = store
        .latest_marker()?
        .ok_or_else(|| DeltaError::NoRecording(dir.to_path_buf()))?;
    info!("Using record-{} as start timestamp", format_timestamp(anchor));

    let mut reports = Vec::new();
    for partition in store.list_partitions()? {
        let path = partition.display_path();
        if !filter.allows(&path) {
            continue;
        }
        let records = match store.list_records(&partition) {
            Ok(records) => records,
            Err(e) => {
                reports.push(DeltaReport::Failed {
                    path,
                    file: store.root().join(&partition.rel_path),
                    error: e.to_string(),
                });
                continue;
            }
        };
        for (idx, file) in records.iter().enumerate() {
            if file.captured_at < anchor {
                continue;
            }
            let report = match file.kind {
                RecordKind::Log => log_report(&store, &partition, file),
                RecordKind::Document | RecordKind::Tombstone => {
                    document_report(&store, &partition, &records, idx, options.skip_initial)
                }
            };
            match report {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => reports.push(DeltaReport::Failed {
                    path: path.clone(),
                    file: store.record_path(&partition, file),
                    error: e.to_string(),
                }),
            }
        }
    }
    Ok(reports)
}

fn log_report(
    store: &SnapshotStore,
    partition: &Partition,
    file: &RecordFile,
) -> Result<Option<DeltaReport>, DeltaError> {
    let record = store.read_record(partition, file)?;
    Ok(Some(DeltaReport::Log {
        path: partition.display_path(),
        captured_at: file.captured_at,
        line: record.payload,
    }))
}

fn document_report(
    store: &SnapshotStore,
    partition: &Partition,
    records: &[RecordFile],
    idx: usize,
    skip_initial: bool,
) -> Result<Option<DeltaReport>, DeltaError> {
    let subject = &records[idx];
    let path = partition.display_path();
    let predecessor = records[..idx].iter().rev().find(|r| r.kind.holds_document());
    let elapsed = predecessor.map(|p| truncate_to_seconds(subject.captured_at - p.captured_at));

    if subject.kind == RecordKind::Tombstone {
        return Ok(Some(DeltaReport::Deleted {
            path,
            captured_at: subject.captured_at,
            elapsed,
        }));
    }

    let mut after = load_document(store, partition, subject)?;
    strip_volatile_fields(&mut after);

    let (Some(predecessor), Some(elapsed)) = (predecessor, elapsed) else {
        if skip_initial {
            return Ok(None);
        }
        let document = canonical_yaml(&after).map_err(|source| DeltaError::Parse {
            path: store.record_path(partition, subject),
            source,
        })?;
        return Ok(Some(DeltaReport::Initial {
            path,
            captured_at: subject.captured_at,
            document,
        }));
    };

    let mut before = load_document(store, partition, predecessor)?;
    strip_volatile_fields(&mut before);
    if before == after {
        return Ok(Some(DeltaReport::Unchanged {
            path,
            before: predecessor.captured_at,
            after: subject.captured_at,
        }));
    }

    let to_yaml = |doc: &Document, file: &RecordFile| {
        canonical_yaml(doc).map_err(|source| DeltaError::Parse {
            path: store.record_path(partition, file),
            source,
        })
    };
    let old = to_yaml(&before, predecessor)?;
    let new = to_yaml(&after, subject)?;
    let diff = TextDiff::from_lines(&old, &new)
        .unified_diff()
        .context_radius(3)
        .header(&predecessor.file_name, &subject.file_name)
        .to_string();
    Ok(Some(DeltaReport::Changed(DeltaComparison {
        path,
        before: predecessor.captured_at,
        after: subject.captured_at,
        diff,
        elapsed,
    })))
}

fn load_document(
    store: &SnapshotStore,
    partition: &Partition,
    file: &RecordFile,
) -> Result<Document, DeltaError> {
    let record = store.read_record(partition, file)?;
    serde_yaml::from_str(&record.payload).map_err(|source| DeltaError::Parse {
        path: store.record_path(partition, file),
        source,
    })
}

fn truncate_to_seconds(d: TimeDelta) -> TimeDelta {
    TimeDelta::seconds(d.num_seconds())
}

/// Remove metadata that changes without the object changing.
pub fn strip_volatile_fields(doc: &mut Document) {
    let Some(metadata) = doc.get_mut("metadata").and_then(|m| m.as_object_mut()) else {
        return;
    };
    for field in VOLATILE_METADATA {
        metadata.remove(field);
    }
    let annotations_empty = match metadata
        .get_mut("annotations")
        .and_then(|a| a.as_object_mut())
    {
        Some(annotations) => {
            annotations.remove(LAST_APPLIED);
            annotations.is_empty()
        }
        None => false,
    };
    if annotations_empty {
        metadata.remove("annotations");
    }
}

/// YAML with map keys in sorted order, so equal documents render equally.
pub fn canonical_yaml(doc: &Document) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(&sorted(doc))
}

fn sorted(value: &Document) -> Document {
    match value {
        Document::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Document::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sorted(v)))
                    .collect(),
            )
        }
        Document::Array(items) => Document::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// Text for one report, or `None` for verdicts that are not printed.
pub fn render(report: &DeltaReport, color: bool) -> Option<String> {
    let header = |text: String, path: &str| {
        if color {
            text.with(get_color(path)).bold().to_string()
        } else {
            text
        }
    };
    match report {
        DeltaReport::Initial {
            path,
            captured_at,
            document,
        } => Some(format!(
            "\n{}\n{}",
            header(
                format!("Initial YAML: {} {}", path, format_timestamp(*captured_at)),
                path
            ),
            document
        )),
        DeltaReport::Changed(cmp) => Some(format!(
            "\n{}\n{}\n",
            header(
                format!(
                    "Diff of {} {} -> {} ({})",
                    cmp.path,
                    format_timestamp(cmp.before),
                    format_timestamp(cmp.after),
                    format_elapsed(cmp.elapsed)
                ),
                &cmp.path
            ),
            colorize_diff(&cmp.diff, color)
        )),
        DeltaReport::Deleted {
            path,
            captured_at,
            elapsed,
        } => {
            let since = elapsed
                .map(|e| format!(" ({} after last change)", format_elapsed(e)))
                .unwrap_or_default();
            Some(format!(
                "\n{}\n",
                header(
                    format!("Deleted: {} {}{}", path, format_timestamp(*captured_at), since),
                    path
                )
            ))
        }
        DeltaReport::Log {
            path,
            captured_at,
            line,
        } => Some(format!(
            "{} {}",
            header(format!("Log: {} {}", path, format_timestamp(*captured_at)), path),
            line
        )),
        DeltaReport::Unchanged { .. } | DeltaReport::Failed { .. } => None,
    }
}

fn colorize_diff(diff: &str, color: bool) -> String {
    if !color {
        return diff.to_string();
    }
    diff.lines()
        .map(|line| {
            if line.starts_with("+++") || line.starts_with("---") {
                line.bold().to_string()
            } else if line.starts_with('+') {
                line.green().to_string()
            } else if line.starts_with('-') {
                line.red().to_string()
            } else if line.starts_with("@@") {
                line.cyan().to_string()
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
