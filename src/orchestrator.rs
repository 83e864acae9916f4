//! Starts one watch session per discovered resource kind and one log tailer
//! per container, and waits for all of them.

use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::RecordError;
use crate::ignore::plan_tails;
use crate::kubernetes::ClusterApi;
use crate::logs::LogTailer;
use crate::session::WatchSession;
use crate::shutdown::{Shutdown, TaskRegistry};
use crate::store::SnapshotStore;
use crate::types::IgnoreRule;

/// Kinds that are never watched, keyed by (group, resource name).
const RESOURCES_TO_SKIP: &[(&str, &str)] = &[
    ("authentication.k8s.io", "tokenreviews"),
    ("authorization.k8s.io", "localsubjectaccessreviews"),
    ("authorization.k8s.io", "subjectaccessreviews"),
    ("authorization.k8s.io", "selfsubjectrulesreviews"),
    ("authorization.k8s.io", "selfsubjectaccessreviews"),
    ("authentication.k8s.io", "selfsubjectreviews"),
    ("", "componentstatuses"),
    ("", "bindings"),
    // Also served as events.k8s.io.
    ("", "events"),
    ("apiextensions.k8s.io", "customresourcedefinitions"),
    ("metallb.io", "addresspools"),
    // Renewed every few seconds.
    ("coordination.k8s.io", "leases"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipList(HashSet<(String, String)>);

impl SkipList {
    pub fn new<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self(
            entries
                .into_iter()
                .map(|(g, r)| (g.to_string(), r.to_string()))
                .collect(),
        )
    }

    pub fn contains(&self, group: &str, resource: &str) -> bool {
        self.0.contains(&(group.to_string(), resource.to_string()))
    }
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new(RESOURCES_TO_SKIP.iter().copied())
    }
}

#[derive(Debug, Clone)]
pub struct RecordOptions {
    pub record_resources: bool,
    pub with_logs: bool,
    pub ignore_rules: Vec<IgnoreRule>,
    pub log_lookback_seconds: i64,
}

impl Default for RecordOptions {
    fn default() -> Self {
        Self {
            record_resources: true,
            with_logs: false,
            ignore_rules: Vec::new(),
            log_lookback_seconds: 1,
        }
    }
}

/// Handle on a running recording.
pub struct RecordingHandle {
    tasks: JoinSet<()>,
    registry: TaskRegistry,
}

impl RecordingHandle {
    fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            registry: TaskRegistry::default(),
        }
    }

    fn spawn<F>(&mut self, label: String, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.registry.enter(label);
        self.tasks.spawn(async move {
            let _guard = guard;
            task.await;
        });
    }

    /// Block until every spawned task has exited.
    pub async fn wait(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined
                && e.is_panic()
            {
                error!("Recording task panicked: {}", e);
            }
        }
    }

    pub fn registry(&self) -> TaskRegistry {
        self.registry.clone()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

/// Discover kinds, list pods, write the session marker and spawn all tasks.
/// Failures here are fatal and returned; everything after that is reported
/// through the shutdown handle. The marker is only written once every task
/// can be started, so a failed start leaves the previous session as anchor.
pub async fn start(
    cluster: Arc<dyn ClusterApi>,
    store: Arc<SnapshotStore>,
    skip: &SkipList,
    options: RecordOptions,
    shutdown: Shutdown,
) -> Result<RecordingHandle, RecordError> {
    store.init().await?;

    let mut kinds = Vec::new();
    if options.record_resources {
        let discovered = cluster.discover().await.map_err(RecordError::Discovery)?;
        for warning in &discovered.warnings {
            warn!("{}", warning);
        }
        for kind in discovered.kinds {
            if skip.contains(&kind.group, &kind.resource_name) {
                debug!("Skipping {}", kind);
                continue;
            }
            kinds.push(kind);
        }
    }

    let mut plans = Vec::new();
    if options.with_logs {
        let pods = cluster.list_pods().await.map_err(RecordError::ListPods)?;
        plans = plan_tails(&pods, &options.ignore_rules);
    }

    let marker = store.write_marker(Utc::now()).await?;
    info!("Recording into {}", marker.display());

    let mut handle = RecordingHandle::new();
    for kind in kinds {
        let label = format!("watch {}", kind);
        let session = WatchSession::new(cluster.clone(), store.clone(), shutdown.clone(), kind);
        handle.spawn(label, session.run());
    }
    for plan in plans {
        let tailer = LogTailer::new(
            cluster.clone(),
            store.clone(),
            shutdown.clone(),
            plan,
            options.log_lookback_seconds,
        );
        handle.spawn(tailer.label(), tailer.run());
    }

    info!("Started {} recording tasks", handle.task_count());
    Ok(handle)
}
