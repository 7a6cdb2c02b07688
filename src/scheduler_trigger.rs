//! Scheduler trigger (§2 item 9): the task service's only outbound signal.
//! Its implementation (wake a poll loop, push onto a channel, ping another
//! process) is deliberately not specified here; the scheduler binary wires
//! a concrete implementation at startup.

use async_trait::async_trait;

#[async_trait]
pub trait SchedulerTrigger: Send + Sync {
    async fn notify(&self, provider_id: Option<&str>);
}

/// Drives the `ProviderPoolManager` directly in-process: the scheduler
/// binary has no separate signaling channel, so "wake the scheduler" and
/// "dispatch onto the pool" are the same step.
pub struct PoolDispatchTrigger {
    pool_manager: std::sync::Arc<crate::pool::ProviderPoolManager>,
    db: sqlx::MySqlPool,
}

impl PoolDispatchTrigger {
    pub fn new(pool_manager: std::sync::Arc<crate::pool::ProviderPoolManager>, db: sqlx::MySqlPool) -> Self {
        PoolDispatchTrigger { pool_manager, db }
    }
}

#[async_trait]
impl SchedulerTrigger for PoolDispatchTrigger {
    async fn notify(&self, provider_id: Option<&str>) {
        let Some(provider_id) = provider_id else {
            return;
        };
        let pending: Result<Vec<String>, sqlx::Error> = sqlx::query_scalar(
            "SELECT id FROM tasks WHERE provider_id = ? AND status = 'pending' ORDER BY created_at LIMIT 50",
        )
        .bind(provider_id)
        .fetch_all(&self.db)
        .await;

        let Ok(task_ids) = pending else {
            tracing::warn!("scheduler trigger failed to list pending tasks for provider {}", provider_id);
            return;
        };

        for task_id in task_ids {
            if let Err(e) = self.pool_manager.dispatch(provider_id, &task_id).await {
                tracing::warn!("failed to dispatch task {} to provider {}: {}", task_id, provider_id, e);
                break;
            }
        }
    }
}
