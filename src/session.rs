use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::kubernetes::ClusterApi;
use crate::redact::redact;
use crate::shutdown::Shutdown;
use crate::store::SnapshotStore;
use crate::types::{ChangeEvent, Document, EntityKey, EventKind, RecordKind, ResourceKindDescriptor};

/// Records every event of one resource kind until the subscription closes or
/// shutdown is requested. Failures stay local to this session.
pub struct WatchSession {
    cluster: Arc<dyn ClusterApi>,
    store: Arc<SnapshotStore>,
    shutdown: Shutdown,
    kind: ResourceKindDescriptor,
}

impl WatchSession {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        store: Arc<SnapshotStore>,
        shutdown: Shutdown,
        kind: ResourceKindDescriptor,
    ) -> Self {
        Self {
            cluster,
            store,
            shutdown,
            kind,
        }
    }

    pub async fn run(self) {
        debug!("Watching {}", self.kind);
        let opened = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return,
            opened = self.cluster.subscribe(&self.kind) => opened,
        };
        let mut events = match opened {
            Ok(events) => events,
            Err(e) => {
                warn!("Not recording {}: {}", self.kind, e);
                return;
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("Stopping watch of {}", self.kind);
                    return;
                }
                next = events.next() => next,
            };
            match next {
                None => {
                    debug!("Watch of {} closed", self.kind);
                    return;
                }
                Some(Err(e)) => {
                    warn!("Watch of {} ended: {}", self.kind, e);
                    return;
                }
                Some(Ok(event)) => self.handle_event(event).await,
            }
        }
    }

    async fn handle_event(&self, event: ChangeEvent) {
        let Some(entity) = event.entity else {
            if event.kind == EventKind::Bookmark {
                debug!("{} {}", event.kind, self.kind);
            } else {
                warn!("{} event for {} without object, skipping", event.kind, self.kind);
            }
            return;
        };
        let Some(key) = entity_key(&self.kind, &entity) else {
            warn!("{} event for {} has no metadata.name, skipping", event.kind, self.kind);
            return;
        };
        info!("{} {} {}", event.kind, self.kind.kind, key);

        let record_kind = match event.kind {
            EventKind::Deleted => RecordKind::Tombstone,
            _ => RecordKind::Document,
        };
        let document = redact(&entity, &self.kind.group, &self.kind.kind);
        if let Err(e) = self.store.write_document(&key, record_kind, &document).await {
            if e.is_fatal() {
                self.shutdown
                    .report_fatal(format!("cannot write snapshot of {}: {}", key, e));
            } else {
                warn!("Failed to store {}: {}", key, e);
            }
        }
    }
}

pub fn entity_key(kind: &ResourceKindDescriptor, entity: &Document) -> Option<EntityKey> {
    let metadata = entity.get("metadata")?;
    let name = metadata.get("name")?.as_str().filter(|n| !n.is_empty())?;
    let namespace = metadata
        .get("namespace")
        .and_then(|n| n.as_str())
        .unwrap_or_default();
    Some(EntityKey {
        group: kind.group.clone(),
        kind: kind.kind.clone(),
        namespace: namespace.to_string(),
        name: name.to_string(),
    })
}
