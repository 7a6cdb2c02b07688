use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    CreateInstance,
    Delete,
    Start,
    Stop,
    Restart,
    Reset,
    ResetPassword,
    CreatePortMapping,
    DeletePortMapping,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::CreateInstance => "create_instance",
            TaskType::Delete => "delete",
            TaskType::Start => "start",
            TaskType::Stop => "stop",
            TaskType::Restart => "restart",
            TaskType::Reset => "reset",
            TaskType::ResetPassword => "reset-password",
            TaskType::CreatePortMapping => "create_port_mapping",
            TaskType::DeletePortMapping => "delete_port_mapping",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        Some(match value {
            "create_instance" => TaskType::CreateInstance,
            "delete" => TaskType::Delete,
            "start" => TaskType::Start,
            "stop" => TaskType::Stop,
            "restart" => TaskType::Restart,
            "reset" => TaskType::Reset,
            "reset-password" => TaskType::ResetPassword,
            "create_port_mapping" => TaskType::CreatePortMapping,
            "delete_port_mapping" => TaskType::DeletePortMapping,
            _ => return None,
        })
    }

    /// Whether the instance this task targets bears a transient status that
    /// must be reverted on cancellation (§4.1 "Cancellation cleanup").
    pub fn revert_status_on_cancel(&self, original_status: Option<&str>) -> Option<&'static str> {
        match self {
            TaskType::CreateInstance => Some("stopped"),
            TaskType::Delete => Some("stopped"),
            TaskType::Reset => Some(original_status.unwrap_or("stopped")),
            TaskType::Start => Some("stopped"),
            TaskType::Stop => Some("running"),
            TaskType::Restart => Some("running"),
            _ => None,
        }
    }
}

/// `processing` and `running` are treated as equivalent "in flight" states
/// throughout the lifecycle (spec leaves the distinction undefined outside
/// cancel paths); both variants exist because cancel handling names them
/// separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Processing,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Processing => "processing",
            TaskStatus::Cancelling => "cancelling",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        Some(match value {
            "pending" => TaskStatus::Pending,
            "running" => TaskStatus::Running,
            "processing" => TaskStatus::Processing,
            "cancelling" => TaskStatus::Cancelling,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// `running` and `processing` are equivalent "in flight" states.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TaskStatus::Running | TaskStatus::Processing | TaskStatus::Cancelling
        )
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub provider_id: Option<String>,
    pub instance_id: Option<String>,
    pub task_type: String,
    pub status: String,
    pub progress: i32,
    pub task_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_duration: i64,
    pub estimated_duration: i64,
    pub preallocated_cpu: i32,
    pub preallocated_memory: i32,
    pub preallocated_disk: i32,
    pub preallocated_bandwidth: i32,
    pub error_message: Option<String>,
    pub cancel_reason: Option<String>,
    pub is_force_stoppable: bool,
    pub status_message: Option<String>,
}

impl Task {
    pub fn status(&self) -> Option<TaskStatus> {
        TaskStatus::from_db_value(&self.status)
    }

    pub fn task_type(&self) -> Option<TaskType> {
        TaskType::from_db_value(&self.task_type)
    }

    pub fn preallocated(&self) -> crate::model::ResourceTuple {
        crate::model::ResourceTuple::new(
            self.preallocated_cpu,
            self.preallocated_memory,
            self.preallocated_disk,
            self.preallocated_bandwidth,
        )
    }

    pub fn session_id(&self) -> Option<String> {
        self.task_data
            .get("sessionId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        pool: &sqlx::MySqlPool,
        user_id: &str,
        provider_id: Option<&str>,
        instance_id: Option<&str>,
        task_type: TaskType,
        task_data: serde_json::Value,
        timeout_duration: i64,
        preallocated: crate::model::ResourceTuple,
        is_force_stoppable: bool,
    ) -> Result<Task, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let instance_kind = task_data.get("instanceType").and_then(|v| v.as_str());
        let estimated_duration =
            crate::config::estimated_duration_secs(task_type.as_str(), instance_kind);

        sqlx::query(
            r#"
            INSERT INTO tasks
                (id, user_id, provider_id, instance_id, task_type, status, progress, task_data,
                 created_at, timeout_duration, estimated_duration,
                 preallocated_cpu, preallocated_memory, preallocated_disk, preallocated_bandwidth,
                 is_force_stoppable)
            VALUES (?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(provider_id)
        .bind(instance_id)
        .bind(task_type.as_str())
        .bind(&task_data)
        .bind(now)
        .bind(timeout_duration)
        .bind(estimated_duration)
        .bind(preallocated.cpu)
        .bind(preallocated.memory_mb)
        .bind(preallocated.disk_mb)
        .bind(preallocated.bandwidth_mbps)
        .bind(is_force_stoppable)
        .execute(pool)
        .await?;

        Ok(Task {
            id,
            user_id: user_id.to_string(),
            provider_id: provider_id.map(|s| s.to_string()),
            instance_id: instance_id.map(|s| s.to_string()),
            task_type: task_type.as_str().to_string(),
            status: "pending".to_string(),
            progress: 0,
            task_data,
            created_at: now,
            started_at: None,
            completed_at: None,
            timeout_duration,
            estimated_duration,
            preallocated_cpu: preallocated.cpu,
            preallocated_memory: preallocated.memory_mb,
            preallocated_disk: preallocated.disk_mb,
            preallocated_bandwidth: preallocated.bandwidth_mbps,
            error_message: None,
            cancel_reason: None,
            is_force_stoppable,
            status_message: None,
        })
    }

    pub async fn fetch_by_id(
        pool: &sqlx::MySqlPool,
        task_id: &str,
    ) -> Result<Option<Task>, sqlx::Error> {
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn fetch_for_update(
        tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
        task_id: &str,
    ) -> Result<Option<Task>, sqlx::Error> {
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ? FOR UPDATE")
            .bind(task_id)
            .fetch_optional(&mut **tx)
            .await
    }

    pub async fn mark_running(
        pool: &sqlx::MySqlPool,
        task_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE tasks SET status = 'running', started_at = NOW() WHERE id = ? AND status = 'pending'",
        )
        .bind(task_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn update_progress(
        pool: &sqlx::MySqlPool,
        task_id: &str,
        progress: i32,
        message: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tasks SET progress = ?, status_message = ? WHERE id = ?")
            .bind(progress.clamp(0, 100))
            .bind(message)
            .bind(task_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Idempotent: a no-op if the task is already terminal.
    pub async fn complete(
        pool: &sqlx::MySqlPool,
        task_id: &str,
        success: bool,
        error_message: Option<&str>,
        status_message: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let status = if success { "completed" } else { "failed" };
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, progress = 100, completed_at = NOW(), error_message = ?, status_message = ?
            WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(status)
        .bind(error_message)
        .bind(status_message)
        .bind(task_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_cancelling(
        pool: &sqlx::MySqlPool,
        task_id: &str,
        reason: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'cancelling', cancel_reason = ? WHERE id = ? AND status IN ('running', 'processing')",
        )
        .bind(reason)
        .bind(task_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn force_cancel(
        pool: &sqlx::MySqlPool,
        task_id: &str,
        reason: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'cancelled', cancel_reason = ?, completed_at = NOW()
            WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(reason)
        .bind(task_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Forces a still-in-flight task to `failed` regardless of current
    /// status, for the sweeper's timeout reaper (§4.4 "Timeouts").
    pub async fn force_fail(
        pool: &sqlx::MySqlPool,
        task_id: &str,
        error_message: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed', error_message = ?, completed_at = NOW()
            WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(error_message)
        .bind(task_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn cancel_pending(
        pool: &sqlx::MySqlPool,
        task_id: &str,
        reason: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'cancelled', cancel_reason = ?, completed_at = NOW() WHERE id = ? AND status = 'pending'",
        )
        .bind(reason)
        .bind(task_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Links a just-created instance row to its create_instance task so
    /// cancellation cleanup (`cleanup_cancelled_task`) can find it instead
    /// of treating the task as having no instance yet.
    pub async fn link_instance(
        pool: &sqlx::MySqlPool,
        task_id: &str,
        instance_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tasks SET instance_id = ? WHERE id = ?")
            .bind(instance_id)
            .bind(task_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Tasks past their timeout that are still in flight.
    pub async fn fetch_timed_out(pool: &sqlx::MySqlPool) -> Result<Vec<Task>, sqlx::Error> {
        sqlx::query_as::<_, Task>(
            r#"
            SELECT * FROM tasks
            WHERE status IN ('pending', 'running', 'processing')
              AND TIMESTAMPDIFF(SECOND, COALESCE(started_at, created_at), NOW()) > timeout_duration
            LIMIT 50
            "#,
        )
        .fetch_all(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_round_trips_through_db_value() {
        for t in [
            TaskType::CreateInstance,
            TaskType::Delete,
            TaskType::Start,
            TaskType::Stop,
            TaskType::Restart,
            TaskType::Reset,
            TaskType::ResetPassword,
            TaskType::CreatePortMapping,
            TaskType::DeletePortMapping,
        ] {
            assert_eq!(TaskType::from_db_value(t.as_str()), Some(t));
        }
        assert_eq!(TaskType::from_db_value("bogus"), None);
    }

    #[test]
    fn task_status_round_trips_through_db_value() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Processing,
            TaskStatus::Cancelling,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::from_db_value(s.as_str()), Some(s));
        }
    }

    #[test]
    fn only_completed_failed_cancelled_are_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(!TaskStatus::Cancelling.is_terminal());
    }

    #[test]
    fn running_and_processing_are_equivalent_in_flight_states() {
        assert!(TaskStatus::Running.is_in_flight());
        assert!(TaskStatus::Processing.is_in_flight());
        assert!(TaskStatus::Cancelling.is_in_flight());
        assert!(!TaskStatus::Pending.is_in_flight());
        assert!(!TaskStatus::Completed.is_in_flight());
    }

    #[test]
    fn revert_status_on_cancel_matches_cancellation_cleanup_table() {
        assert_eq!(TaskType::Delete.revert_status_on_cancel(None), Some("stopped"));
        assert_eq!(TaskType::Start.revert_status_on_cancel(None), Some("stopped"));
        assert_eq!(TaskType::Stop.revert_status_on_cancel(None), Some("running"));
        assert_eq!(TaskType::Restart.revert_status_on_cancel(None), Some("running"));
        assert_eq!(
            TaskType::Reset.revert_status_on_cancel(Some("stopped")),
            Some("stopped")
        );
        assert_eq!(TaskType::Reset.revert_status_on_cancel(None), Some("stopped"));
        assert_eq!(
            TaskType::CreateInstance.revert_status_on_cancel(None),
            Some("stopped")
        );
        assert_eq!(TaskType::ResetPassword.revert_status_on_cancel(None), None);
    }
}
