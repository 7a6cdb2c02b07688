use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Enabled,
    Disabled,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Enabled => "enabled",
            UserStatus::Disabled => "disabled",
        }
    }

    pub fn from_db_value(value: &str) -> Self {
        match value {
            "disabled" => UserStatus::Disabled,
            _ => UserStatus::Enabled,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub status: String,
    pub level: i32,
    pub used_quota: i64,
    pub pending_quota: i64,
    pub total_traffic: i64,
    pub used_traffic: i64,
}

impl User {
    pub fn status(&self) -> UserStatus {
        UserStatus::from_db_value(&self.status)
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.status(), UserStatus::Enabled)
    }

    pub async fn fetch_for_update(
        tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
        user_id: &str,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, status, level, used_quota, pending_quota, total_traffic, used_traffic
            FROM users
            WHERE id = ?
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await
    }

    pub async fn fetch_by_id(
        pool: &sqlx::MySqlPool,
        user_id: &str,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, status, level, used_quota, pending_quota, total_traffic, used_traffic
            FROM users
            WHERE id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(pool)
        .await
    }

    /// Users carrying a nonzero pending reservation, the only ones whose
    /// counters can drift out from under a crashed or cancelled flow.
    /// Feeds the sweeper's periodic `quota::recalculate` pass (§4.3).
    pub async fn fetch_ids_with_pending_quota(pool: &sqlx::MySqlPool) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar("SELECT id FROM users WHERE pending_quota > 0 LIMIT 500")
            .fetch_all(pool)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_with_status(status: &str) -> User {
        User {
            id: "u1".into(),
            status: status.into(),
            level: 1,
            used_quota: 0,
            pending_quota: 0,
            total_traffic: 0,
            used_traffic: 0,
        }
    }

    #[test]
    fn unknown_status_values_default_to_enabled() {
        assert_eq!(UserStatus::from_db_value("bogus"), UserStatus::Enabled);
        assert_eq!(UserStatus::from_db_value("enabled"), UserStatus::Enabled);
        assert_eq!(UserStatus::from_db_value("disabled"), UserStatus::Disabled);
    }

    #[test]
    fn is_enabled_reflects_status_column() {
        assert!(user_with_status("enabled").is_enabled());
        assert!(!user_with_status("disabled").is_enabled());
    }
}
