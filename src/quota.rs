use sqlx::MySqlPool;
use tracing::warn;

use crate::config::FleetConfig;
use crate::error::{CoreError, Result};
use crate::model::provider::Resource;
use crate::model::{Instance, Provider, ResourceTuple, User};

#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub user_id: String,
    pub provider_id: Option<String>,
    pub instance_is_vm: bool,
    pub requested: ResourceTuple,
}

#[derive(Debug, Clone)]
pub struct AdmissionResult {
    pub stable: ResourceTuple,
    pub pending: ResourceTuple,
    pub merged_cap: ResourceTuple,
}

/// Runs the two-phase admission check (§4.3) inside a serializable
/// transaction. Does not allocate a reservation; callers that pass do so
/// immediately after inside the same transaction.
pub async fn validate_instance_creation(
    tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
    config: &FleetConfig,
    req: &AdmissionRequest,
) -> Result<AdmissionResult> {
    let user = User::fetch_for_update(tx, &req.user_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("user {} not found", req.user_id)))?;

    if !user.is_enabled() {
        return Err(CoreError::AdmissionDenied(format!(
            "user {} is disabled",
            req.user_id
        )));
    }

    let level_cap = config
        .level_cap(user.level)
        .ok_or_else(|| CoreError::AdmissionDenied(format!("unknown level {}", user.level)))?;

    if req.instance_is_vm && user.level < config.min_level_for_vm {
        return Err(CoreError::AdmissionDenied(format!(
            "level {} may not create vm instances (requires level >= {})",
            user.level, config.min_level_for_vm
        )));
    }

    let user_cap = ResourceTuple::new(
        level_cap.max_cpu,
        level_cap.max_memory_mb,
        level_cap.max_disk_mb,
        level_cap.max_bandwidth_mbps,
    );

    let provider = match &req.provider_id {
        Some(provider_id) => Some(
            Provider::fetch_for_update(tx, provider_id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("provider {} not found", provider_id)))?,
        ),
        None => None,
    };

    let mut merged_cap = user_cap;
    if let Some(provider) = &provider {
        if let Some(level_override) = provider.level_override(user.level) {
            merge_cap(&mut merged_cap.cpu, level_override.max_cpu, provider, Resource::Cpu, req.instance_is_vm);
            merge_cap(
                &mut merged_cap.memory_mb,
                level_override.max_memory_mb,
                provider,
                Resource::Memory,
                req.instance_is_vm,
            );
            merge_cap(
                &mut merged_cap.disk_mb,
                level_override.max_disk_mb,
                provider,
                Resource::Disk,
                req.instance_is_vm,
            );
            // Bandwidth is checked strictly against the user cap only; the
            // provider's bandwidth cap/over-commit flag never participates
            // (preserved as-documented ambiguity, see DESIGN.md).
        }

        if let Some(max_instances) = max_instances_for_kind(provider, req.instance_is_vm) {
            if max_instances > 0 {
                let count =
                    Instance::count_user_instances_on_provider(tx, &req.user_id, &provider.id)
                        .await?;
                if count >= max_instances as i64 {
                    return Err(CoreError::AdmissionDenied(format!(
                        "provider {} instance cap reached for user {}",
                        provider.id, req.user_id
                    )));
                }
            }
        }
    }

    let (stable, pending) = Instance::count_user_instances_for_admission(tx, &req.user_id).await?;

    check_resource(
        "cpu",
        stable.cpu + pending.cpu + req.requested.cpu,
        merged_cap.cpu,
        provider.as_ref(),
        Resource::Cpu,
        req.instance_is_vm,
    )?;
    check_resource(
        "memory",
        stable.memory_mb + pending.memory_mb + req.requested.memory_mb,
        merged_cap.memory_mb,
        provider.as_ref(),
        Resource::Memory,
        req.instance_is_vm,
    )?;
    check_resource(
        "disk",
        stable.disk_mb + pending.disk_mb + req.requested.disk_mb,
        merged_cap.disk_mb,
        provider.as_ref(),
        Resource::Disk,
        req.instance_is_vm,
    )?;
    // Bandwidth is always checked against the user cap (no provider override).
    if stable.bandwidth_mbps + pending.bandwidth_mbps + req.requested.bandwidth_mbps
        > user_cap.bandwidth_mbps
    {
        return Err(CoreError::AdmissionDenied(
            "bandwidth quota exceeded".to_string(),
        ));
    }

    Ok(AdmissionResult {
        stable,
        pending,
        merged_cap,
    })
}

fn merge_cap(
    user_field: &mut i32,
    provider_override: Option<i32>,
    provider: &Provider,
    resource: Resource,
    instance_is_vm: bool,
) {
    if provider.overcommits(resource, instance_is_vm) {
        // Over-committed: provider cap (if any) does not participate.
        return;
    }
    if let Some(provider_cap) = provider_override {
        *user_field = (*user_field).min(provider_cap);
    }
}

fn check_resource(
    name: &str,
    total: i32,
    cap: i32,
    provider: Option<&Provider>,
    resource: Resource,
    instance_is_vm: bool,
) -> Result<()> {
    let checked = match provider {
        Some(provider) => provider.is_limited(resource, instance_is_vm),
        None => true,
    };
    if checked && total > cap {
        return Err(CoreError::AdmissionDenied(format!(
            "{name} quota exceeded ({total} > {cap})"
        )));
    }
    Ok(())
}

fn max_instances_for_kind(provider: &Provider, instance_is_vm: bool) -> Option<i32> {
    if instance_is_vm {
        Some(provider.max_vm_instances)
    } else {
        Some(provider.max_container_instances)
    }
}

pub async fn allocate_pending(
    executor: impl sqlx::Executor<'_, Database = sqlx::MySql>,
    user_id: &str,
    resources: ResourceTuple,
) -> Result<()> {
    sqlx::query("UPDATE users SET pending_quota = pending_quota + ? WHERE id = ?")
        .bind(resources.weight())
        .bind(user_id)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn confirm_pending(
    executor: impl sqlx::Executor<'_, Database = sqlx::MySql>,
    user_id: &str,
    resources: ResourceTuple,
) -> Result<()> {
    let weight = resources.weight();
    sqlx::query(
        r#"
        UPDATE users
        SET pending_quota = GREATEST(pending_quota - ?, 0),
            used_quota = used_quota + ?
        WHERE id = ?
        "#,
    )
    .bind(weight)
    .bind(weight)
    .bind(user_id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn release_pending(
    executor: impl sqlx::Executor<'_, Database = sqlx::MySql>,
    user_id: &str,
    resources: ResourceTuple,
) -> Result<()> {
    sqlx::query("UPDATE users SET pending_quota = GREATEST(pending_quota - ?, 0) WHERE id = ?")
        .bind(resources.weight())
        .bind(user_id)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn release_used(
    executor: impl sqlx::Executor<'_, Database = sqlx::MySql>,
    user_id: &str,
    resources: ResourceTuple,
) -> Result<()> {
    sqlx::query("UPDATE users SET used_quota = GREATEST(used_quota - ?, 0) WHERE id = ?")
        .bind(resources.weight())
        .bind(user_id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Inverse of `release_used`: re-adds `used_quota` for a rollback that
/// restores an instance to a stable, used-quota-bearing state.
pub async fn add_used(
    executor: impl sqlx::Executor<'_, Database = sqlx::MySql>,
    user_id: &str,
    resources: ResourceTuple,
) -> Result<()> {
    sqlx::query("UPDATE users SET used_quota = used_quota + ? WHERE id = ?")
        .bind(resources.weight())
        .bind(user_id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Idempotent: recomputes both counters from the live instance set and
/// writes the row only when the current values disagree.
pub async fn recalculate(pool: &MySqlPool, user_id: &str) -> Result<()> {
    let mut tx = pool.begin().await?;

    let user = User::fetch_for_update(&mut tx, user_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("user {user_id} not found")))?;

    let (stable, pending) = Instance::count_user_instances_for_admission(&mut tx, user_id).await?;
    let used_quota = stable.weight();
    let pending_quota = pending.weight();

    if used_quota != user.used_quota || pending_quota != user.pending_quota {
        sqlx::query("UPDATE users SET used_quota = ?, pending_quota = ? WHERE id = ?")
            .bind(used_quota)
            .bind(pending_quota)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        warn!(
            "recalculated quota for user {}: used {} -> {}, pending {} -> {}",
            user_id, user.used_quota, used_quota, user.pending_quota, pending_quota
        );
    }

    tx.commit().await?;
    Ok(())
}
