use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::model::ResourceTuple;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ResourceReservation {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub provider_id: String,
    pub instance_type: String,
    pub cpu: i32,
    pub memory: i32,
    pub disk: i32,
    pub bandwidth: i32,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ResourceReservation {
    pub fn resources(&self) -> ResourceTuple {
        ResourceTuple::new(self.cpu, self.memory, self.disk, self.bandwidth)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub async fn insert(
        tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
        session_id: &str,
        user_id: &str,
        provider_id: &str,
        instance_type: &str,
        resources: ResourceTuple,
        ttl_secs: i64,
    ) -> Result<ResourceReservation, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(ttl_secs);

        sqlx::query(
            r#"
            INSERT INTO resource_reservations
                (id, session_id, user_id, provider_id, instance_type, cpu, memory, disk, bandwidth, expires_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(session_id)
        .bind(user_id)
        .bind(provider_id)
        .bind(instance_type)
        .bind(resources.cpu)
        .bind(resources.memory_mb)
        .bind(resources.disk_mb)
        .bind(resources.bandwidth_mbps)
        .bind(expires_at)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        Ok(ResourceReservation {
            id,
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            provider_id: provider_id.to_string(),
            instance_type: instance_type.to_string(),
            cpu: resources.cpu,
            memory: resources.memory_mb,
            disk: resources.disk_mb,
            bandwidth: resources.bandwidth_mbps,
            expires_at,
            consumed_at: None,
            created_at: now,
        })
    }

    pub async fn fetch_by_session(
        pool: &sqlx::MySqlPool,
        session_id: &str,
    ) -> Result<Option<ResourceReservation>, sqlx::Error> {
        sqlx::query_as::<_, ResourceReservation>(
            "SELECT * FROM resource_reservations WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(pool)
        .await
    }

    /// Exactly-once consumption; returns `true` if this call performed the
    /// consumption, `false` if it was already consumed (caller should treat a
    /// post-expiry consumption as a warning, not an error).
    pub async fn try_consume(
        executor: impl sqlx::Executor<'_, Database = sqlx::MySql>,
        session_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE resource_reservations
            SET consumed_at = NOW()
            WHERE session_id = ? AND consumed_at IS NULL
            "#,
        )
        .bind(session_id)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_by_session(
        executor: impl sqlx::Executor<'_, Database = sqlx::MySql>,
        session_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM resource_reservations WHERE session_id = ?")
            .bind(session_id)
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn sweep_expired(pool: &sqlx::MySqlPool) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM resource_reservations WHERE expires_at <= NOW()")
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn reservation_expiring_at(expires_at: DateTime<Utc>) -> ResourceReservation {
        ResourceReservation {
            id: "r1".into(),
            session_id: "s1".into(),
            user_id: "u1".into(),
            provider_id: "p1".into(),
            instance_type: "container".into(),
            cpu: 2,
            memory: 1024,
            disk: 20480,
            bandwidth: 100,
            expires_at,
            consumed_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn is_expired_is_inclusive_of_the_exact_boundary() {
        let now = Utc::now();
        let reservation = reservation_expiring_at(now);
        assert!(reservation.is_expired(now));
        assert!(!reservation.is_expired(now - Duration::seconds(1)));
        assert!(reservation.is_expired(now + Duration::seconds(1)));
    }

    #[test]
    fn resources_reads_back_the_stored_tuple() {
        let reservation = reservation_expiring_at(Utc::now());
        let tuple = reservation.resources();
        assert_eq!(tuple.cpu, 2);
        assert_eq!(tuple.memory_mb, 1024);
        assert_eq!(tuple.disk_mb, 20480);
        assert_eq!(tuple.bandwidth_mbps, 100);
    }
}
