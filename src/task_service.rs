//! Task service (§4.1, §2 item 8): creates/persists tasks, dispatches to
//! provider pools, drives completion/cancellation, and keeps quota and
//! reservation bookkeeping in lockstep with task state.

use std::sync::Arc;

use serde_json::json;
use sqlx::MySqlPool;
use tracing::{info, warn};

use crate::config::FleetConfig;
use crate::context::TaskContextManager;
use crate::error::{CoreError, Result};
use crate::model::{Instance, ResourceTuple, Task, TaskType};
use crate::quota::{self, AdmissionRequest};
use crate::reservation_store;
use crate::scheduler_trigger::SchedulerTrigger;

/// Grace period between signalling a running task's context and running
/// cleanup, matching the cooperative-cancellation window in §5.
const CANCEL_GRACE_SECS: u64 = 5;

#[derive(Clone)]
pub struct TaskService {
    db: MySqlPool,
    config: Arc<FleetConfig>,
    context_manager: TaskContextManager,
    trigger: Arc<dyn SchedulerTrigger>,
}

impl TaskService {
    pub fn new(
        db: MySqlPool,
        config: Arc<FleetConfig>,
        context_manager: TaskContextManager,
        trigger: Arc<dyn SchedulerTrigger>,
    ) -> Self {
        TaskService {
            db,
            config,
            context_manager,
            trigger,
        }
    }

    /// Admits and creates a `create_instance` task in one transaction:
    /// validate quota, allocate a reservation, allocate pending quota,
    /// then persist the task row (§4.3 step 8, §4.4).
    #[allow(clippy::too_many_arguments)]
    pub async fn submit_create_instance_task(
        &self,
        user_id: &str,
        provider_id: &str,
        instance_is_vm: bool,
        requested: ResourceTuple,
        mut task_data: serde_json::Value,
        timeout_duration: i64,
    ) -> Result<(Task, String)> {
        let mut tx = self.db.begin().await?;

        quota::validate_instance_creation(
            &mut tx,
            &self.config,
            &AdmissionRequest {
                user_id: user_id.to_string(),
                provider_id: Some(provider_id.to_string()),
                instance_is_vm,
                requested,
            },
        )
        .await?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let instance_type = if instance_is_vm { "vm" } else { "container" };
        reservation_store::reserve(
            &mut tx,
            &session_id,
            user_id,
            provider_id,
            instance_type,
            requested,
            self.config.reservation_ttl_secs,
        )
        .await?;
        quota::allocate_pending(&mut *tx, user_id, requested).await?;

        if let Some(obj) = task_data.as_object_mut() {
            obj.insert("sessionId".to_string(), json!(session_id));
            obj.insert("instanceType".to_string(), json!(instance_type));
        }

        let task = Task::create(
            &self.db,
            user_id,
            Some(provider_id),
            None,
            TaskType::CreateInstance,
            task_data,
            timeout_duration,
            requested,
            false,
        )
        .await?;

        tx.commit().await?;
        self.trigger.notify(Some(provider_id)).await;
        Ok((task, session_id))
    }

    /// Creates a task for an operation against an existing instance
    /// (start/stop/restart/reset/delete/reset-password/port mapping).
    /// No admission step: the instance already consumed quota.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit_instance_task(
        &self,
        user_id: &str,
        provider_id: &str,
        instance_id: &str,
        task_type: TaskType,
        task_data: serde_json::Value,
        timeout_duration: i64,
        is_force_stoppable: bool,
    ) -> Result<Task> {
        let task = Task::create(
            &self.db,
            user_id,
            Some(provider_id),
            Some(instance_id),
            task_type,
            task_data,
            timeout_duration,
            ResourceTuple::default(),
            is_force_stoppable,
        )
        .await?;
        self.trigger.notify(Some(provider_id)).await;
        Ok(task)
    }

    /// `pending -> running`, registers a cancellation context, and returns
    /// it for the caller (the pool worker) to pass down into the flow.
    pub async fn start_task(&self, task_id: &str) -> Result<tokio_util::sync::CancellationToken> {
        Task::mark_running(&self.db, task_id).await?;
        Ok(self.context_manager.register(task_id).await)
    }

    pub async fn update_progress(&self, task_id: &str, progress: i32, message: Option<&str>) -> Result<()> {
        Task::update_progress(&self.db, task_id, progress, message).await?;
        Ok(())
    }

    /// Idempotent. On failure with no linked instance, releases the
    /// reservation and pending quota recorded in the payload (§4.1).
    pub async fn complete_task(
        &self,
        task_id: &str,
        success: bool,
        error_message: Option<&str>,
        status_message: Option<&str>,
    ) -> Result<()> {
        let Some(task) = Task::fetch_by_id(&self.db, task_id).await? else {
            return Err(CoreError::NotFound(format!("task {task_id} not found")));
        };

        let changed = Task::complete(&self.db, task_id, success, error_message, status_message).await?;
        if !changed {
            self.context_manager.deregister(task_id).await;
            return Ok(());
        }

        if !success && task.instance_id.is_none() {
            self.release_unlinked_task_resources(&task).await;
        }

        self.context_manager.deregister(task_id).await;
        self.trigger.notify(task.provider_id.as_deref()).await;
        Ok(())
    }

    async fn release_unlinked_task_resources(&self, task: &Task) {
        if let Some(session_id) = task.session_id() {
            if let Err(e) = reservation_store::release(&self.db, &session_id).await {
                warn!("failed to release reservation for task {}: {}", task.id, e);
            }
        }
        if let Err(e) = quota::release_pending(&self.db, &task.user_id, task.preallocated()).await {
            warn!("failed to release pending quota for task {}: {}", task.id, e);
        }
    }

    /// User-initiated cancel; only valid on force-stoppable tasks.
    /// `pending` cancels immediately; `running`/`processing` sets
    /// `cancelling`, signals the context, waits the grace window, then
    /// runs cleanup (§4.1, §5).
    pub async fn cancel_task(&self, task_id: &str, reason: &str) -> Result<()> {
        let Some(task) = Task::fetch_by_id(&self.db, task_id).await? else {
            return Err(CoreError::NotFound(format!("task {task_id} not found")));
        };
        if !task.is_force_stoppable {
            return Err(CoreError::StateConflict(format!(
                "task {task_id} is not force-stoppable"
            )));
        }

        if Task::cancel_pending(&self.db, task_id, reason).await? {
            self.cleanup_cancelled_task(&task).await;
            return Ok(());
        }

        if Task::mark_cancelling(&self.db, task_id, reason).await? {
            self.context_manager.cancel(task_id).await;
            tokio::time::sleep(tokio::time::Duration::from_secs(CANCEL_GRACE_SECS)).await;
            Task::force_cancel(&self.db, task_id, reason).await?;
            self.cleanup_cancelled_task(&task).await;
        }

        Ok(())
    }

    /// Admin cancel: forces `cancelled` immediately regardless of current
    /// state, then runs the same cleanup (§4.1 "cancel_task_by_admin").
    pub async fn cancel_task_by_admin(&self, task_id: &str, reason: &str) -> Result<()> {
        let Some(task) = Task::fetch_by_id(&self.db, task_id).await? else {
            return Err(CoreError::NotFound(format!("task {task_id} not found")));
        };

        self.context_manager.cancel(task_id).await;
        if Task::force_cancel(&self.db, task_id, reason).await? {
            self.cleanup_cancelled_task(&task).await;
        }
        Ok(())
    }

    /// Equivalent to admin cancel (§4.1 "force_stop").
    pub async fn force_stop(&self, task_id: &str, reason: &str) -> Result<()> {
        self.cancel_task_by_admin(task_id, reason).await
    }

    /// Reaps a task still in flight past its `timeout_duration` (§4.4
    /// "Timeouts"): marks it `failed` rather than `cancelled`, then runs the
    /// same revert/release cleanup as a cancellation.
    pub async fn fail_timed_out_task(&self, task_id: &str) -> Result<()> {
        let Some(task) = Task::fetch_by_id(&self.db, task_id).await? else {
            return Ok(());
        };

        self.context_manager.cancel(task_id).await;
        if Task::force_fail(&self.db, task_id, "task exceeded its timeout_duration").await? {
            self.cleanup_cancelled_task(&task).await;
        }
        Ok(())
    }

    /// Reverts any transient instance status left behind, and releases
    /// reservation/pending quota if the task never reached "instance
    /// linked" (§4.1 "Cancellation cleanup").
    async fn cleanup_cancelled_task(&self, task: &Task) {
        self.context_manager.deregister(&task.id).await;

        if let Some(instance_id) = &task.instance_id {
            if let Some(task_type) = task.task_type() {
                let original_status = task
                    .task_data
                    .get("originalStatus")
                    .and_then(|v| v.as_str());
                if let Some(revert_to) = task_type.revert_status_on_cancel(original_status) {
                    if let Some(status) = crate::model::InstanceStatus::from_db_value(revert_to) {
                        if let Err(e) = Instance::set_status(&self.db, instance_id, status).await {
                            warn!(
                                "failed to revert instance {} status on cancel of task {}: {}",
                                instance_id, task.id, e
                            );
                        }
                    }
                }
            }
        } else {
            self.release_unlinked_task_resources(task).await;
        }

        info!("cleaned up cancelled task {}", task.id);
        self.trigger.notify(task.provider_id.as_deref()).await;
    }
}
