use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const CAPACITY: usize = 1000;
const MAX_AGE_SECS: i64 = 15 * 60;

struct Entry {
    token: CancellationToken,
    created_at: DateTime<Utc>,
}

/// Bounded registry `{task_id -> (context, cancel_fn, created_at)}` (§4.6).
/// `cancel_task_by_admin` and `cancel_running_task` resolve contexts here to
/// signal cooperative cancellation to the worker handling that task.
#[derive(Clone)]
pub struct TaskContextManager {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl Default for TaskContextManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskContextManager {
    pub fn new() -> Self {
        TaskContextManager {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers a new cancellation context for `task_id`, evicting the
    /// oldest entry first if the registry is at capacity.
    pub async fn register(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let mut entries = self.entries.write().await;

        if entries.len() >= CAPACITY && !entries.contains_key(task_id) {
            if let Some(oldest_id) = entries
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(id, _)| id.clone())
            {
                if let Some(evicted) = entries.remove(&oldest_id) {
                    evicted.token.cancel();
                    warn!("task context registry full, evicted oldest entry {}", oldest_id);
                }
            }
        }

        entries.insert(
            task_id.to_string(),
            Entry {
                token: token.clone(),
                created_at: Utc::now(),
            },
        );
        token
    }

    pub async fn cancel(&self, task_id: &str) -> bool {
        let entries = self.entries.read().await;
        if let Some(entry) = entries.get(task_id) {
            entry.token.cancel();
            true
        } else {
            false
        }
    }

    pub async fn deregister(&self, task_id: &str) {
        self.entries.write().await.remove(task_id);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Cancels and evicts entries older than 15 minutes. Intended to run on
    /// a 30s tick.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, e)| (now - e.created_at).num_seconds() > MAX_AGE_SECS)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            if let Some(entry) = entries.remove(id) {
                entry.token.cancel();
            }
        }

        if !stale.is_empty() {
            info!("task context sweeper evicted {} stale entries", stale.len());
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_cancel_round_trips() {
        let mgr = TaskContextManager::new();
        let token = mgr.register("task-1").await;
        assert!(!token.is_cancelled());
        assert!(mgr.cancel("task-1").await);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_unknown_task_returns_false() {
        let mgr = TaskContextManager::new();
        assert!(!mgr.cancel("missing").await);
    }

    #[tokio::test]
    async fn deregister_removes_entry() {
        let mgr = TaskContextManager::new();
        mgr.register("task-1").await;
        assert_eq!(mgr.len().await, 1);
        mgr.deregister("task-1").await;
        assert_eq!(mgr.len().await, 0);
    }
}
