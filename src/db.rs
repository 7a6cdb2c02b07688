use std::sync::Arc;

use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySql, Pool};
use tracing::{error, info, warn};

pub type DbPool = Arc<Pool<MySql>>;

/// Connect to MySQL and run migrations, tolerating "already applied" errors.
pub async fn init_database(database_url: &str) -> Result<DbPool, Box<dyn std::error::Error>> {
    let db = Arc::new(
        MySqlPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?,
    );

    if std::env::var("SKIP_MIGRATIONS").is_err() {
        info!("running database migrations...");

        match sqlx::migrate!("./db/migrations").run(&*db).await {
            Ok(_) => info!("database migrations completed successfully"),
            Err(e) => {
                if e.to_string().contains("already applied") {
                    info!("migrations already applied, continuing...");
                } else {
                    warn!("migration error: {}", e);

                    let table_check = sqlx::query_scalar::<_, i64>(
                        "SELECT COUNT(*) FROM information_schema.tables \
                         WHERE table_schema = DATABASE() AND table_name = 'tasks'",
                    )
                    .fetch_one(&*db)
                    .await
                    .unwrap_or(0);

                    if table_check == 0 {
                        error!("database tables do not exist and migrations failed");
                        return Err(Box::new(e));
                    }
                    info!("tables exist, continuing despite migration error");
                }
            }
        }
    } else {
        info!("skipping migrations (SKIP_MIGRATIONS set)");
    }

    Ok(db)
}
