//! Reset-instance flow (§4.8.3): rebuilds a new instance under the same
//! logical name with the same spec, restoring port mappings afterward.

use sqlx::MySqlPool;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::driver::{CreateInstanceSpec, Driver};
use crate::error::{CoreError, Result};
use crate::model::{Instance, InstanceStatus, PortMapping, Provider, SystemImage, Task};
use crate::port_mapping::{self, group_contiguous_identity_runs, MappingSpec};
use crate::quota;
use crate::task_service::TaskService;

use super::{cancellable_sleep, generate_password, wait_until_healthy};

const DELETE_WAIT_SECS: u64 = 10;
const HEALTH_CEILING_SECS: u64 = 90;
const PASSWORD_RETRY_ATTEMPTS: u32 = 3;

pub async fn run(
    db: &MySqlPool,
    driver: &dyn Driver,
    provider: &Provider,
    task_service: &TaskService,
    task: &Task,
    instance_id: &str,
    cancel: CancellationToken,
) -> Result<()> {
    match run_inner(db, driver, provider, task_service, task, instance_id, &cancel).await {
        Ok(()) => {
            task_service
                .complete_task(&task.id, true, None, Some("instance reset"))
                .await?;
            Ok(())
        }
        Err(e) => {
            task_service
                .complete_task(&task.id, false, Some(&e.to_string()), None)
                .await?;
            Err(e)
        }
    }
}

async fn run_inner(
    db: &MySqlPool,
    driver: &dyn Driver,
    provider: &Provider,
    task_service: &TaskService,
    task: &Task,
    instance_id: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    task_service
        .update_progress(&task.id, 10, Some("loading instance state"))
        .await?;
    let old_instance = Instance::fetch_by_id(db, instance_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("instance {instance_id} not found")))?;
    let old_mappings = PortMapping::list_for_instance(db, instance_id).await?;
    let instance_type = old_instance
        .instance_type()
        .ok_or_else(|| CoreError::Internal("instance has unknown instance_type".to_string()))?;
    let original_name = old_instance.name.clone();
    let resources = old_instance.resources();
    let old_backend_id = old_instance.backend_id.clone();
    let was_stable = old_instance.status().map(|s| s.is_stable()).unwrap_or(false);

    let image = SystemImage::lookup(
        db,
        &old_instance.image,
        provider.kind().map(|k| k.as_str()).unwrap_or("unknown"),
        instance_type.as_str(),
        &provider.architecture,
    )
    .await?
    .ok_or_else(|| CoreError::NotFound(format!("system image {} not found", old_instance.image)))?;

    task_service
        .update_progress(&task.id, 20, Some("retiring old instance row"))
        .await?;
    let epoch = chrono::Utc::now().timestamp();
    let old_name_renamed = format!("{original_name}-old-{epoch}");
    let new_instance_id = uuid::Uuid::new_v4().to_string();

    let mut tx = db.begin().await?;
    Instance::soft_delete(&mut *tx, instance_id, Some(&old_name_renamed)).await?;
    if was_stable {
        quota::release_used(&mut *tx, &old_instance.user_id, resources).await?;
    }
    quota::allocate_pending(&mut *tx, &old_instance.user_id, resources).await?;
    Instance::insert(
        &mut *tx,
        &new_instance_id,
        &provider.id,
        &old_instance.user_id,
        &original_name,
        instance_type,
        &old_instance.image,
        resources,
        InstanceStatus::Creating,
        None,
    )
    .await?;
    tx.commit().await?;

    task_service
        .update_progress(&task.id, 30, Some("deleting old backend instance"))
        .await?;
    if let Some(old_backend_id) = &old_backend_id {
        if let Err(e) = driver.delete_instance(old_backend_id).await {
            warn!("old backend instance {} delete failed during reset: {}", old_backend_id, e);
        }
    }
    cancellable_sleep(DELETE_WAIT_SECS, cancel).await?;

    task_service
        .update_progress(&task.id, 60, Some("creating replacement backend instance"))
        .await?;
    let create_result = create_replacement(
        driver,
        provider,
        &original_name,
        instance_type,
        &image,
        resources,
        cancel,
    )
    .await;

    let (backend_id, password) = match create_result {
        Ok(pair) => pair,
        Err(e) => {
            warn!(
                "replacement instance creation failed during reset of {}, rolling back: {}",
                instance_id, e
            );
            rollback_failed_reset(
                db,
                instance_id,
                &original_name,
                &new_instance_id,
                &old_instance.user_id,
                resources,
                was_stable,
            )
            .await;
            return Err(e);
        }
    };

    task_service
        .update_progress(&task.id, 80, Some("probing network"))
        .await?;
    let private_ip = driver.get_ipv4(&backend_id).await.unwrap_or(None);

    task_service
        .update_progress(&task.id, 85, Some("confirming quota"))
        .await?;
    let mut tx = db.begin().await?;
    Instance::set_status(&mut *tx, &new_instance_id, InstanceStatus::Running).await?;
    Instance::set_network_and_password(&mut *tx, &new_instance_id, private_ip.as_deref(), None, Some(&password))
        .await?;
    quota::confirm_pending(&mut *tx, &old_instance.user_id, resources).await?;
    sqlx::query("UPDATE instances SET backend_id = ? WHERE id = ?")
        .bind(&backend_id)
        .bind(&new_instance_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    task_service
        .update_progress(&task.id, 95, Some("restoring port mappings"))
        .await?;
    restore_port_mappings(
        db,
        driver,
        provider,
        &new_instance_id,
        &backend_id,
        private_ip.as_deref(),
        &old_mappings,
    )
    .await?;

    if provider.enable_traffic_control {
        task_service
            .update_progress(&task.id, 98, Some("reattaching monitoring"))
            .await?;
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn create_replacement(
    driver: &dyn Driver,
    provider: &Provider,
    name: &str,
    instance_type: crate::model::InstanceType,
    image: &SystemImage,
    resources: crate::model::ResourceTuple,
    cancel: &CancellationToken,
) -> Result<(String, String)> {
    let backend_id = driver.next_backend_id(instance_type).await?;
    let password = generate_password();

    let spec = CreateInstanceSpec {
        backend_id: backend_id.clone(),
        name: name.to_string(),
        instance_type,
        image: image.cache_filename.clone(),
        cpu: resources.cpu,
        memory_mb: resources.memory_mb,
        disk_mb: resources.disk_mb,
        storage_pool: "local".to_string(),
        network_type: provider.network_type.clone(),
        password: Some(password.clone()),
    };
    driver.create_instance(&spec).await?;

    let healthy = wait_until_healthy(driver, &backend_id, HEALTH_CEILING_SECS, cancel).await?;
    if !healthy {
        return Err(CoreError::BackendError(format!(
            "replacement instance {backend_id} did not become healthy within {HEALTH_CEILING_SECS}s"
        )));
    }

    let mut last_err = None;
    for attempt in 1..=PASSWORD_RETRY_ATTEMPTS {
        match driver.set_password(&backend_id, instance_type, &password, true).await {
            Ok(()) => {
                last_err = None;
                break;
            }
            Err(e) => {
                warn!(
                    "set_password attempt {}/{} failed for {}: {}",
                    attempt, PASSWORD_RETRY_ATTEMPTS, backend_id, e
                );
                last_err = Some(e);
            }
        }
    }
    if let Some(e) = last_err {
        warn!("password reset exhausted retries for {}: {}", backend_id, e);
    }

    Ok((backend_id, password))
}

#[allow(clippy::too_many_arguments)]
async fn rollback_failed_reset(
    db: &MySqlPool,
    old_instance_id: &str,
    original_name: &str,
    new_instance_id: &str,
    user_id: &str,
    resources: crate::model::ResourceTuple,
    was_stable: bool,
) {
    if let Err(e) = Instance::restore(db, old_instance_id, original_name).await {
        warn!("failed to restore old instance {} after reset rollback: {}", old_instance_id, e);
    }
    if let Err(e) = sqlx::query("DELETE FROM instances WHERE id = ?")
        .bind(new_instance_id)
        .execute(db)
        .await
    {
        warn!("failed to delete failed replacement instance {}: {}", new_instance_id, e);
    }
    // Reverses the retire-tx quota mutations (old used->released, new
    // pending allocated) now that the old instance is stable again and the
    // new one no longer exists, keeping the quota-consistency invariant
    // (§8) intact without waiting on the recalculate sweeper.
    if was_stable {
        if let Err(e) = quota::add_used(db, user_id, resources).await {
            warn!("failed to re-add used quota for {} after reset rollback: {}", old_instance_id, e);
        }
    }
    if let Err(e) = quota::release_pending(db, user_id, resources).await {
        warn!("failed to release pending quota for {} after reset rollback: {}", new_instance_id, e);
    }
}

async fn restore_port_mappings(
    db: &MySqlPool,
    driver: &dyn Driver,
    provider: &Provider,
    new_instance_id: &str,
    backend_id: &str,
    private_ip: Option<&str>,
    old_mappings: &[PortMapping],
) -> Result<()> {
    if old_mappings.is_empty() {
        return Ok(());
    }

    let runs = group_contiguous_identity_runs(old_mappings);
    let mut ssh_host_port = None;

    for (run, members) in runs {
        if members.len() > 1 {
            let spec = MappingSpec {
                host_port: run.start,
                host_port_end: run.end,
                guest_port: run.start,
                guest_port_end: run.end,
                protocol: run.protocol,
                is_ssh: members.iter().any(|m| m.is_ssh),
                is_automatic: true,
                description: None,
            };
            let row = port_mapping::apply(
                db,
                driver,
                new_instance_id,
                &provider.id,
                backend_id,
                private_ip,
                provider.ipv4_port_mapping_method.as_str(),
                &spec,
            )
            .await?;
            if row.is_ssh {
                ssh_host_port = Some(row.host_port);
            }
        } else {
            let m = members[0];
            let spec = MappingSpec {
                host_port: m.host_port,
                host_port_end: m.host_port_end,
                guest_port: m.guest_port,
                guest_port_end: m.guest_port_end,
                protocol: m.protocol(),
                is_ssh: m.is_ssh,
                is_automatic: m.is_automatic,
                description: m.description.clone(),
            };
            let row = port_mapping::apply(
                db,
                driver,
                new_instance_id,
                &provider.id,
                backend_id,
                private_ip,
                provider.ipv4_port_mapping_method.as_str(),
                &spec,
            )
            .await?;
            if row.is_ssh {
                ssh_host_port = Some(row.host_port);
            }
        }
    }

    if let Some(ssh_port) = ssh_host_port {
        sqlx::query("UPDATE instances SET ssh_port = ? WHERE id = ?")
            .bind(ssh_port)
            .bind(new_instance_id)
            .execute(db)
            .await?;
    }

    Ok(())
}
