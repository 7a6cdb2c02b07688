use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Image catalog entry: name x provider kind x instance_type x architecture
/// -> downloadable URL and metadata. Looked up but never mutated by the core.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SystemImage {
    pub id: String,
    pub name: String,
    pub provider_kind: String,
    pub instance_type: String,
    pub architecture: String,
    pub download_url: String,
    pub cache_filename: String,
    pub metadata: serde_json::Value,
}

impl SystemImage {
    pub async fn lookup(
        pool: &sqlx::MySqlPool,
        name: &str,
        provider_kind: &str,
        instance_type: &str,
        architecture: &str,
    ) -> Result<Option<SystemImage>, sqlx::Error> {
        sqlx::query_as::<_, SystemImage>(
            r#"
            SELECT * FROM system_images
            WHERE name = ? AND provider_kind = ? AND instance_type = ? AND architecture = ?
            "#,
        )
        .bind(name)
        .bind(provider_kind)
        .bind(instance_type)
        .bind(architecture)
        .fetch_optional(pool)
        .await
    }
}
