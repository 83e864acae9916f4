use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::ignore::{TailPlan, identity};
use crate::kubernetes::ClusterApi;
use crate::shutdown::Shutdown;
use crate::store::SnapshotStore;
use crate::types::{EntityKey, RecordKind};

/// Follows the log of one container and stores each line that survives the
/// ignore rules. Containers of one pod share the pod's partition.
pub struct LogTailer {
    cluster: Arc<dyn ClusterApi>,
    store: Arc<SnapshotStore>,
    shutdown: Shutdown,
    plan: TailPlan,
    lookback_seconds: i64,
}

impl LogTailer {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        store: Arc<SnapshotStore>,
        shutdown: Shutdown,
        plan: TailPlan,
        lookback_seconds: i64,
    ) -> Self {
        Self {
            cluster,
            store,
            shutdown,
            plan,
            lookback_seconds,
        }
    }

    pub fn label(&self) -> String {
        format!(
            "logs {}",
            identity(&self.plan.namespace, &self.plan.pod, &self.plan.container)
        )
    }

    pub async fn run(self) {
        let plan = &self.plan;
        info!(
            "Watching logs for pod {}/{} container {}",
            plan.namespace, plan.pod, plan.container
        );
        let opened = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return,
            opened = self.cluster.stream_logs(
                &plan.namespace,
                &plan.pod,
                &plan.container,
                self.lookback_seconds,
            ) => opened,
        };
        let mut lines = match opened {
            Ok(lines) => lines,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };
        let key = EntityKey::pod(&plan.namespace, &plan.pod);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                next = lines.next() => next,
            };
            let line = match next {
                None => {
                    debug!("Log stream of {}/{} [{}] ended", plan.namespace, plan.pod, plan.container);
                    return;
                }
                Some(Err(e)) => {
                    warn!("{}", e);
                    return;
                }
                Some(Ok(line)) => line,
            };
            if let Some(rule) = plan.line_filters.iter().find(|re| re.is_match(&line)) {
                debug!(
                    "Ignoring log line of {}/{} [{}] matching {:?}: {:?}",
                    plan.namespace,
                    plan.pod,
                    plan.container,
                    rule.as_str(),
                    line
                );
                continue;
            }
            if let Err(e) = self.store.write(&key, RecordKind::Log, &format!("{}\n", line)).await {
                if e.is_fatal() {
                    self.shutdown
                        .report_fatal(format!("cannot write log line of {}: {}", key, e));
                } else {
                    warn!("Failed to store log line of {}: {}", key, e);
                }
            }
        }
    }
}
