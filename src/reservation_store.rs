use sqlx::MySqlPool;
use tracing::{info, warn};

use crate::error::Result;
use crate::model::{ResourceReservation, ResourceTuple};

const DEFAULT_TTL_SECS: i64 = 60 * 60;

/// Reserves provider capacity against `session_id` inside the caller's
/// admission transaction. Expires after `ttl_secs` (default ~1h).
pub async fn reserve(
    tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
    session_id: &str,
    user_id: &str,
    provider_id: &str,
    instance_type: &str,
    resources: ResourceTuple,
    ttl_secs: Option<i64>,
) -> Result<ResourceReservation> {
    let reservation = ResourceReservation::insert(
        tx,
        session_id,
        user_id,
        provider_id,
        instance_type,
        resources,
        ttl_secs.unwrap_or(DEFAULT_TTL_SECS),
    )
    .await?;
    Ok(reservation)
}

/// Consumes a reservation exactly once. A post-expiry consumption is logged
/// as a warning rather than surfaced as an error, per §4.4.
pub async fn consume(pool: &MySqlPool, session_id: &str) -> Result<Option<ResourceReservation>> {
    let Some(reservation) = ResourceReservation::fetch_by_session(pool, session_id).await? else {
        return Ok(None);
    };

    let consumed = ResourceReservation::try_consume(pool, session_id).await?;
    if !consumed {
        return Ok(None);
    }

    if reservation.is_expired(chrono::Utc::now()) {
        warn!(
            "reservation for session {} consumed after expiry at {}",
            session_id, reservation.expires_at
        );
    }

    Ok(Some(reservation))
}

pub async fn release(pool: &MySqlPool, session_id: &str) -> Result<()> {
    ResourceReservation::delete_by_session(pool, session_id).await?;
    Ok(())
}

/// Reclaims expired reservation rows; intended to run on a periodic sweep.
pub async fn sweep_expired(pool: &MySqlPool) -> Result<u64> {
    let reclaimed = ResourceReservation::sweep_expired(pool).await?;
    if reclaimed > 0 {
        info!("reservation sweeper reclaimed {} expired rows", reclaimed);
    }
    Ok(reclaimed)
}
