use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize document: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("invalid snapshot file name {0:?}")]
    InvalidFileName(String),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the failure means nothing else can be written either. A stray
    /// file in place of a store directory counts.
    pub fn is_fatal(&self) -> bool {
        match self {
            StoreError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::PermissionDenied
                    | io::ErrorKind::NotADirectory
                    | io::ErrorKind::StorageFull
                    | io::ErrorKind::ReadOnlyFilesystem
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("failed to open watch for {resource}: {reason}")]
    Subscribe { resource: String, reason: String },

    #[error("watch for {resource} failed: {reason}")]
    Stream { resource: String, reason: String },

    #[error("failed to stream logs of {pod}/{container}: {reason}")]
    Logs {
        pod: String,
        container: String,
        reason: String,
    },

    #[error(transparent)]
    Kube(#[from] kube::Error),
}

#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("invalid pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("no record-* marker file found in {0}")]
    NoRecording(PathBuf),

    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum IgnoreRuleError {
    #[error("line {line}: expected 'file-regex ~~ line-regex', got {text:?}")]
    Syntax { line: usize, text: String },

    #[error("line {line}: file regex is empty")]
    EmptyFileRegex { line: usize },

    #[error("line {line}: invalid regex {pattern:?}: {source}")]
    Regex {
        line: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("snapshot store is not writable: {0}")]
    Store(#[from] StoreError),

    #[error("cluster discovery failed: {0}")]
    Discovery(#[source] ClusterError),

    #[error("failed to list pods: {0}")]
    ListPods(#[source] ClusterError),
}
