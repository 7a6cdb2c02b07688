use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceType {
    Container,
    Vm,
}

impl InstanceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceType::Container => "container",
            InstanceType::Vm => "vm",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "container" => Some(InstanceType::Container),
            "vm" => Some(InstanceType::Vm),
            _ => None,
        }
    }

    pub fn is_vm(&self) -> bool {
        matches!(self, InstanceType::Vm)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Creating,
    Running,
    Stopped,
    Paused,
    Starting,
    Stopping,
    Restarting,
    Resetting,
    Deleting,
    Deleted,
    Failed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Creating => "creating",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Restarting => "restarting",
            InstanceStatus::Resetting => "resetting",
            InstanceStatus::Deleting => "deleting",
            InstanceStatus::Deleted => "deleted",
            InstanceStatus::Failed => "failed",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        Some(match value {
            "creating" => InstanceStatus::Creating,
            "running" => InstanceStatus::Running,
            "stopped" => InstanceStatus::Stopped,
            "paused" => InstanceStatus::Paused,
            "starting" => InstanceStatus::Starting,
            "stopping" => InstanceStatus::Stopping,
            "restarting" => InstanceStatus::Restarting,
            "resetting" => InstanceStatus::Resetting,
            "deleting" => InstanceStatus::Deleting,
            "deleted" => InstanceStatus::Deleted,
            "failed" => InstanceStatus::Failed,
            _ => return None,
        })
    }

    /// `creating` and `resetting` are exactly the pending-quota-bearing
    /// states; every other live state bears used_quota.
    pub fn bears_pending_quota(&self) -> bool {
        matches!(self, InstanceStatus::Creating | InstanceStatus::Resetting)
    }

    /// `running`, `stopped`, `paused` count as "stable" for admission's
    /// live-instance tally.
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Running | InstanceStatus::Stopped | InstanceStatus::Paused
        )
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, InstanceStatus::Deleted)
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub provider_id: String,
    pub user_id: String,
    pub name: String,
    pub instance_type: String,
    pub image: String,
    pub cpu: i32,
    pub memory: i32,
    pub disk: i32,
    pub bandwidth: i32,
    pub status: String,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub ssh_port: Option<i32>,
    pub password: Option<String>,
    pub max_traffic: i64,
    pub traffic_limited: bool,
    pub traffic_limit_reason: String,
    pub backend_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Instance {
    /// Persists a brand-new instance row. `status` is always `creating` on
    /// the create-instance flow, or `creating`/`running` depending on
    /// caller context for reset's replacement row (§4.8.1, §4.8.3).
    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        executor: impl sqlx::Executor<'_, Database = sqlx::MySql>,
        id: &str,
        provider_id: &str,
        user_id: &str,
        name: &str,
        instance_type: InstanceType,
        image: &str,
        resources: crate::model::ResourceTuple,
        status: InstanceStatus,
        backend_id: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO instances
                (id, provider_id, user_id, name, instance_type, image, cpu, memory, disk, bandwidth,
                 status, public_ip, private_ip, ssh_port, password, max_traffic, traffic_limited,
                 traffic_limit_reason, backend_id, created_at, updated_at, deleted_at)
            VALUES
                (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL, NULL, 0, FALSE, '', ?, NOW(), NOW(), NULL)
            "#,
        )
        .bind(id)
        .bind(provider_id)
        .bind(user_id)
        .bind(name)
        .bind(instance_type.as_str())
        .bind(image)
        .bind(resources.cpu)
        .bind(resources.memory_mb)
        .bind(resources.disk_mb)
        .bind(resources.bandwidth_mbps)
        .bind(status.as_str())
        .bind(backend_id)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Persists the private IP, public IP, and password discovered once the
    /// backend instance is reachable (§4.8.1 steps 5-6).
    pub async fn set_network_and_password(
        executor: impl sqlx::Executor<'_, Database = sqlx::MySql>,
        instance_id: &str,
        private_ip: Option<&str>,
        public_ip: Option<&str>,
        password: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE instances SET private_ip = ?, public_ip = ?, password = ?, updated_at = NOW() WHERE id = ?",
        )
        .bind(private_ip)
        .bind(public_ip)
        .bind(password)
        .bind(instance_id)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Soft-deletes the row and, when `new_name` is given, renames it first
    /// (reset's "rename to `<name>-old-<epoch>`" step, §4.8.3 step 2).
    pub async fn soft_delete(
        executor: impl sqlx::Executor<'_, Database = sqlx::MySql>,
        instance_id: &str,
        new_name: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        if let Some(new_name) = new_name {
            sqlx::query("UPDATE instances SET name = ?, deleted_at = NOW(), updated_at = NOW() WHERE id = ?")
                .bind(new_name)
                .bind(instance_id)
                .execute(executor)
                .await?;
        } else {
            sqlx::query("UPDATE instances SET deleted_at = NOW(), updated_at = NOW() WHERE id = ?")
                .bind(instance_id)
                .execute(executor)
                .await?;
        }
        Ok(())
    }

    /// Undoes a soft-delete and restores the original name (reset's
    /// rollback path on create failure, §4.8.3 step 4).
    pub async fn restore(
        executor: impl sqlx::Executor<'_, Database = sqlx::MySql>,
        instance_id: &str,
        original_name: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE instances SET name = ?, deleted_at = NULL, updated_at = NOW() WHERE id = ?")
            .bind(original_name)
            .bind(instance_id)
            .execute(executor)
            .await?;
        Ok(())
    }

    pub fn status(&self) -> Option<InstanceStatus> {
        InstanceStatus::from_db_value(&self.status)
    }

    pub fn instance_type(&self) -> Option<InstanceType> {
        InstanceType::from_db_value(&self.instance_type)
    }

    pub fn resources(&self) -> crate::model::ResourceTuple {
        crate::model::ResourceTuple::new(self.cpu, self.memory, self.disk, self.bandwidth)
    }

    pub async fn fetch_for_update(
        tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
        instance_id: &str,
    ) -> Result<Option<Instance>, sqlx::Error> {
        sqlx::query_as::<_, Instance>(
            "SELECT * FROM instances WHERE id = ? AND deleted_at IS NULL FOR UPDATE",
        )
        .bind(instance_id)
        .fetch_optional(&mut **tx)
        .await
    }

    pub async fn fetch_by_id(
        pool: &sqlx::MySqlPool,
        instance_id: &str,
    ) -> Result<Option<Instance>, sqlx::Error> {
        sqlx::query_as::<_, Instance>("SELECT * FROM instances WHERE id = ? AND deleted_at IS NULL")
            .bind(instance_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn set_status(
        executor: impl sqlx::Executor<'_, Database = sqlx::MySql>,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE instances SET status = ?, updated_at = NOW() WHERE id = ?")
            .bind(status.as_str())
            .bind(instance_id)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Live instance counts for a user, split into `stable` and `pending`
    /// buckets, summing resources for admission (§4.3 step 4).
    pub async fn count_user_instances_for_admission(
        tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
        user_id: &str,
    ) -> Result<(crate::model::ResourceTuple, crate::model::ResourceTuple), sqlx::Error> {
        let rows: Vec<(String, i32, i32, i32, i32)> = sqlx::query_as(
            r#"
            SELECT status, cpu, memory, disk, bandwidth
            FROM instances
            WHERE user_id = ? AND deleted_at IS NULL
            LOCK IN SHARE MODE
            "#,
        )
        .bind(user_id)
        .fetch_all(&mut **tx)
        .await?;

        let mut stable = crate::model::ResourceTuple::default();
        let mut pending = crate::model::ResourceTuple::default();

        for (status, cpu, memory, disk, bandwidth) in rows {
            let Some(status) = InstanceStatus::from_db_value(&status) else {
                continue;
            };
            let r = crate::model::ResourceTuple::new(cpu, memory, disk, bandwidth);
            if status.is_stable() {
                stable = stable.add(&r);
            } else if status.bears_pending_quota() {
                pending = pending.add(&r);
            }
        }

        Ok((stable, pending))
    }

    /// Count of this user's live instances on `provider_id`, excluding
    /// deleting/deleted/failed/creating/resetting, for the provider's
    /// `max_instances` cap.
    pub async fn count_user_instances_on_provider(
        tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
        user_id: &str,
        provider_id: &str,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM instances
            WHERE user_id = ? AND provider_id = ? AND deleted_at IS NULL
              AND status NOT IN ('deleting', 'deleted', 'failed', 'creating', 'resetting')
            "#,
        )
        .bind(user_id)
        .bind(provider_id)
        .fetch_one(&mut **tx)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_quota_is_borne_by_exactly_creating_and_resetting() {
        let pending_bearing = [InstanceStatus::Creating, InstanceStatus::Resetting];
        let all = [
            InstanceStatus::Creating,
            InstanceStatus::Running,
            InstanceStatus::Stopped,
            InstanceStatus::Paused,
            InstanceStatus::Starting,
            InstanceStatus::Stopping,
            InstanceStatus::Restarting,
            InstanceStatus::Resetting,
            InstanceStatus::Deleting,
            InstanceStatus::Deleted,
            InstanceStatus::Failed,
        ];
        for status in all {
            assert_eq!(
                status.bears_pending_quota(),
                pending_bearing.contains(&status),
                "unexpected bears_pending_quota for {status:?}"
            );
        }
    }

    #[test]
    fn stable_is_exactly_running_stopped_paused() {
        assert!(InstanceStatus::Running.is_stable());
        assert!(InstanceStatus::Stopped.is_stable());
        assert!(InstanceStatus::Paused.is_stable());
        assert!(!InstanceStatus::Creating.is_stable());
        assert!(!InstanceStatus::Resetting.is_stable());
        assert!(!InstanceStatus::Deleted.is_stable());
    }

    #[test]
    fn only_deleted_is_not_live() {
        assert!(!InstanceStatus::Deleted.is_live());
        assert!(InstanceStatus::Failed.is_live());
        assert!(InstanceStatus::Creating.is_live());
    }

    #[test]
    fn instance_type_round_trips_and_flags_vm() {
        assert_eq!(InstanceType::from_db_value("vm"), Some(InstanceType::Vm));
        assert_eq!(
            InstanceType::from_db_value("container"),
            Some(InstanceType::Container)
        );
        assert_eq!(InstanceType::from_db_value("bogus"), None);
        assert!(InstanceType::Vm.is_vm());
        assert!(!InstanceType::Container.is_vm());
    }

    #[test]
    fn instance_status_round_trips_through_db_value() {
        for status in [
            InstanceStatus::Creating,
            InstanceStatus::Running,
            InstanceStatus::Stopped,
            InstanceStatus::Paused,
            InstanceStatus::Starting,
            InstanceStatus::Stopping,
            InstanceStatus::Restarting,
            InstanceStatus::Resetting,
            InstanceStatus::Deleting,
            InstanceStatus::Deleted,
            InstanceStatus::Failed,
        ] {
            assert_eq!(InstanceStatus::from_db_value(status.as_str()), Some(status));
        }
    }
}
