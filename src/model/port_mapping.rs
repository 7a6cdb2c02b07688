use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Both,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Both => "both",
        }
    }

    pub fn from_db_value(value: &str) -> Self {
        match value {
            "udp" => Protocol::Udp,
            "both" => Protocol::Both,
            _ => Protocol::Tcp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortMappingStatus {
    Pending,
    Active,
    Failed,
}

impl PortMappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortMappingStatus::Pending => "pending",
            PortMappingStatus::Active => "active",
            PortMappingStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PortMapping {
    pub id: String,
    pub instance_id: String,
    pub provider_id: String,
    pub host_port: i32,
    pub host_port_end: i32,
    pub guest_port: i32,
    pub guest_port_end: i32,
    pub port_count: i32,
    pub protocol: String,
    pub status: String,
    pub is_ssh: bool,
    pub is_automatic: bool,
    pub port_type: String,
    pub mapping_method: String,
    pub ipv6_enabled: bool,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PortMapping {
    pub fn protocol(&self) -> Protocol {
        Protocol::from_db_value(&self.protocol)
    }

    /// Whether this row is a contiguous 1:1 identity mapping that can be
    /// grouped with an adjacent row into a single backend call (§4.8.3).
    pub fn is_identity(&self) -> bool {
        self.host_port == self.guest_port && self.host_port_end == self.guest_port_end
    }

    pub async fn active_ports_in_window(
        executor: impl sqlx::Executor<'_, Database = sqlx::MySql>,
        provider_id: &str,
        range_start: i32,
        range_end: i32,
    ) -> Result<Vec<(i32, i32)>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT host_port, host_port_end
            FROM port_mappings
            WHERE provider_id = ? AND status = 'active'
              AND host_port <= ? AND GREATEST(host_port, host_port_end) >= ?
            "#,
        )
        .bind(provider_id)
        .bind(range_end)
        .bind(range_start)
        .fetch_all(executor)
        .await
    }

    pub async fn list_for_instance(
        pool: &sqlx::MySqlPool,
        instance_id: &str,
    ) -> Result<Vec<PortMapping>, sqlx::Error> {
        sqlx::query_as::<_, PortMapping>(
            "SELECT * FROM port_mappings WHERE instance_id = ? ORDER BY host_port",
        )
        .bind(instance_id)
        .fetch_all(pool)
        .await
    }

    pub async fn set_status(
        executor: impl sqlx::Executor<'_, Database = sqlx::MySql>,
        id: &str,
        status: PortMappingStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE port_mappings SET status = ?, updated_at = NOW() WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn delete(
        executor: impl sqlx::Executor<'_, Database = sqlx::MySql>,
        id: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM port_mappings WHERE id = ?")
            .bind(id)
            .execute(executor)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
