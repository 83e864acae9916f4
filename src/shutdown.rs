//! Coordinated shutdown of all recording tasks.
//!
//! One cancellation token fans out to every task. Fatal conditions go through
//! a single slot: the first report is kept as the shutdown cause and cancels
//! the token, later reports are only logged.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    Interrupted,
    Fatal(String),
}

impl std::fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownCause::Interrupted => f.write_str("received interrupt"),
            ShutdownCause::Fatal(msg) => f.write_str(msg),
        }
    }
}

#[derive(Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    cause: Arc<OnceLock<ShutdownCause>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Request shutdown. Returns true if this call set the cause.
    pub fn trigger(&self, cause: ShutdownCause) -> bool {
        match self.cause.set(cause) {
            Ok(()) => {
                if let Some(ShutdownCause::Fatal(msg)) = self.cause.get() {
                    error!("Fatal: {}", msg);
                }
                self.token.cancel();
                true
            }
            Err(ignored) => {
                debug!("Shutdown already requested, ignoring: {}", ignored);
                false
            }
        }
    }

    pub fn report_fatal(&self, err: impl std::fmt::Display) -> bool {
        self.trigger(ShutdownCause::Fatal(err.to_string()))
    }

    pub fn cause(&self) -> Option<&ShutdownCause> {
        self.cause.get()
    }
}

/// Labels of the tasks that are still running, for diagnosing a stalled
/// shutdown.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    next_id: Arc<AtomicU64>,
    running: Arc<Mutex<BTreeMap<u64, String>>>,
}

impl TaskRegistry {
    /// Register a task; it is removed when the returned guard drops.
    pub fn enter(&self, label: impl Into<String>) -> TaskGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, label.into());
        TaskGuard {
            id,
            registry: self.clone(),
        }
    }

    pub fn running(&self) -> Vec<String> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, String>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct TaskGuard {
    id: u64,
    registry: TaskRegistry,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_cause_wins() {
        let shutdown = Shutdown::new();
        assert!(shutdown.cause().is_none());
        assert!(shutdown.report_fatal("disk full"));
        assert!(!shutdown.trigger(ShutdownCause::Interrupted));
        assert!(!shutdown.report_fatal("second"));
        assert_eq!(
            shutdown.cause(),
            Some(&ShutdownCause::Fatal("disk full".to_string()))
        );
        // Every clone observes the same cancellation.
        shutdown.clone().cancelled().await;
    }

    #[test]
    fn test_registry_tracks_running_tasks() {
        let registry = TaskRegistry::default();
        let a = registry.enter("watch v1/pods");
        let b = registry.enter("logs default/web/nginx");
        assert_eq!(registry.running(), vec!["watch v1/pods", "logs default/web/nginx"]);
        drop(a);
        assert_eq!(registry.running(), vec!["logs default/web/nginx"]);
        drop(b);
        assert!(registry.running().is_empty());
    }
}
