//! Per-provider port allocation (§4.7): a port is available iff no active
//! `PortMapping` row holds it and a live remote scan doesn't show it
//! occupied. Single-port and contiguous-range allocation both combine one
//! batch DB query with one batch remote scan rather than probing per port.

use std::collections::HashSet;

use sqlx::MySqlPool;
use tokio::time::{sleep, Duration};
use tracing::warn;

use crate::driver::Driver;
use crate::error::{CoreError, Result};
use crate::model::{PortMapping, Provider};

const RETRY_ATTEMPTS: u32 = 3;
const SUGGEST_PROBES: i32 = 10;
const SUGGEST_OFFSET: i32 = 100;
const SUGGEST_STEP: i32 = 10;

/// Occupied ports in `[range_start, range_end]`: DB active rows unioned
/// with a single remote `ss` scan (§4.7 "Availability").
async fn occupied_ports(
    pool: &MySqlPool,
    driver: &dyn Driver,
    provider_id: &str,
    range_start: i32,
    range_end: i32,
) -> Result<HashSet<i32>> {
    let mut occupied = HashSet::new();
    for (start, end) in
        PortMapping::active_ports_in_window(pool, provider_id, range_start, range_end).await?
    {
        let end = if end > 0 { end } else { start };
        for port in start.max(range_start)..=end.min(range_end) {
            occupied.insert(port);
        }
    }
    occupied.extend(driver.scan_used_ports(range_start, range_end).await?);
    Ok(occupied)
}

fn next_wrapping(start: i32, range_start: i32, range_end: i32) -> impl Iterator<Item = i32> {
    let start = start.clamp(range_start, range_end);
    (start..=range_end).chain(range_start..start)
}

/// Picks the first free port scanning forward from `next_available_port`,
/// then wrapping to `range_start` (§4.7 "Single-port allocation"). Retries
/// the confirm transaction up to 3x with 50/100/150ms backoff on collision.
pub async fn allocate_single(pool: &MySqlPool, driver: &dyn Driver, provider: &Provider) -> Result<i32> {
    for attempt in 1..=RETRY_ATTEMPTS {
        let occupied = occupied_ports(
            pool,
            driver,
            &provider.id,
            provider.port_range_start,
            provider.port_range_end,
        )
        .await?;

        let candidate = next_wrapping(
            provider.next_available_port,
            provider.port_range_start,
            provider.port_range_end,
        )
        .find(|p| !occupied.contains(p));

        let Some(candidate) = candidate else {
            return Err(CoreError::CapacityUnavailable(format!(
                "no free port in range for provider {}",
                provider.id
            )));
        };

        let mut tx = pool.begin().await?;
        let still_free = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM port_mappings
            WHERE provider_id = ? AND status = 'active'
              AND host_port <= ? AND GREATEST(host_port, host_port_end) >= ?
            FOR UPDATE
            "#,
        )
        .bind(&provider.id)
        .bind(candidate)
        .bind(candidate)
        .fetch_one(&mut *tx)
        .await?;

        if still_free > 0 {
            tx.rollback().await?;
            warn!(
                "port {} claimed concurrently for provider {}, retrying (attempt {})",
                candidate, provider.id, attempt
            );
            sleep(Duration::from_millis(50 * attempt as u64)).await;
            continue;
        }

        let next = wrap_next(candidate + 1, provider.port_range_start, provider.port_range_end);
        sqlx::query("UPDATE providers SET next_available_port = ? WHERE id = ?")
            .bind(next)
            .bind(&provider.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        return Ok(candidate);
    }

    Err(CoreError::CapacityUnavailable(format!(
        "port allocation for provider {} failed after {} attempts",
        provider.id, RETRY_ATTEMPTS
    )))
}

/// Finds the first `count`-length run of free ports, preferring a start at
/// or after `next_available_port`, else from `range_start` (§4.7
/// "Contiguous range allocation").
pub async fn allocate_range(
    pool: &MySqlPool,
    driver: &dyn Driver,
    provider: &Provider,
    count: i32,
) -> Result<(i32, i32)> {
    let occupied = occupied_ports(
        pool,
        driver,
        &provider.id,
        provider.port_range_start,
        provider.port_range_end,
    )
    .await?;

    let start = find_run(
        &occupied,
        provider.next_available_port,
        provider.port_range_start,
        provider.port_range_end,
        count,
    )
    .or_else(|| {
        find_run(
            &occupied,
            provider.port_range_start,
            provider.port_range_start,
            provider.port_range_end,
            count,
        )
    })
    .ok_or_else(|| {
        CoreError::CapacityUnavailable(format!(
            "no contiguous range of {} ports available for provider {}",
            count, provider.id
        ))
    })?;
    let end = start + count - 1;

    let mut tx = pool.begin().await?;
    let still_free = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COUNT(*) FROM port_mappings
        WHERE provider_id = ? AND status = 'active'
          AND host_port <= ? AND GREATEST(host_port, host_port_end) >= ?
        FOR UPDATE
        "#,
    )
    .bind(&provider.id)
    .bind(end)
    .bind(start)
    .fetch_one(&mut *tx)
    .await?;

    if still_free > 0 {
        tx.rollback().await?;
        return Err(CoreError::CapacityUnavailable(format!(
            "range [{start}..{end}] claimed concurrently for provider {}",
            provider.id
        )));
    }

    let next = wrap_next(end + 1, provider.port_range_start, provider.port_range_end);
    sqlx::query("UPDATE providers SET next_available_port = ? WHERE id = ?")
        .bind(next)
        .bind(&provider.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok((start, end))
}

/// First run of `count` consecutive ports, all absent from `occupied`,
/// scanning forward from `from` to `range_end` only (no wrap within a
/// single search — callers retry from `range_start` themselves).
fn find_run(
    occupied: &HashSet<i32>,
    from: i32,
    range_start: i32,
    range_end: i32,
    count: i32,
) -> Option<i32> {
    let from = from.clamp(range_start, range_end);
    let mut run_start = from;
    let mut run_len = 0;
    for port in from..=range_end {
        if occupied.contains(&port) {
            run_start = port + 1;
            run_len = 0;
            continue;
        }
        run_len += 1;
        if run_len == count {
            return Some(run_start);
        }
    }
    None
}

fn wrap_next(candidate: i32, range_start: i32, range_end: i32) -> i32 {
    if candidate > range_end {
        range_start
    } else {
        candidate
    }
}

/// On conflict, offers `start+100, start+110, ...` (wrapping) up to 10
/// probes and reports the first free range found (§4.7 "Suggestion").
pub async fn suggest_range(
    pool: &MySqlPool,
    driver: &dyn Driver,
    provider: &Provider,
    count: i32,
) -> Result<Option<(i32, i32)>> {
    let occupied = occupied_ports(
        pool,
        driver,
        &provider.id,
        provider.port_range_start,
        provider.port_range_end,
    )
    .await?;

    let span = provider.port_range_end - provider.port_range_start + 1;
    for probe in 0..SUGGEST_PROBES {
        let offset = SUGGEST_OFFSET + probe * SUGGEST_STEP;
        let candidate_start = provider.port_range_start + (offset % span.max(1));
        if let Some(start) = find_run(
            &occupied,
            candidate_start,
            provider.port_range_start,
            provider.port_range_end,
            count,
        ) {
            return Ok(Some((start, start + count - 1)));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_run_skips_occupied_block() {
        let occupied: HashSet<i32> = [1000, 1001, 1002, 1010, 1011, 1012, 1013, 1014, 1015]
            .into_iter()
            .collect();
        // [1003..1009] is only 7 free before the occupied block; need 8.
        let start = find_run(&occupied, 1000, 1000, 1099, 8);
        assert_eq!(start, Some(1016));
    }

    #[test]
    fn find_run_returns_none_when_not_enough_room() {
        let occupied: HashSet<i32> = (1..=99).collect();
        assert_eq!(find_run(&occupied, 0, 0, 99, 5), None);
    }

    #[test]
    fn wrap_next_wraps_at_range_end() {
        assert_eq!(wrap_next(1100, 1000, 1099), 1000);
        assert_eq!(wrap_next(1050, 1000, 1099), 1050);
    }
}
