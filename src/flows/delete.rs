//! Delete-instance flow (§4.8.2).

use sqlx::MySqlPool;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::driver::Driver;
use crate::error::Result;
use crate::model::provider::Resource;
use crate::model::{Instance, InstanceStatus, Provider, Task};
use crate::quota;
use crate::task_service::TaskService;

use super::cancellable_sleep;

const DELETE_RETRY_ATTEMPTS: u32 = 3;
const DELETE_RETRY_BASE_SECS: u64 = 2;

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
        Ok(message) => {
            task_service
                .complete_task(&task.id, true, None, Some(&message))
                .await?;
            Ok(())
        }
        Err(e) => {
            if let Err(revert_err) = Instance::set_status(db, instance_id, InstanceStatus::Stopped).await {
                warn!(
                    "failed to revert instance {} to stopped after delete failure: {}",
                    instance_id, revert_err
                );
            }
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
) -> Result<String> {
    let instance = Instance::fetch_by_id(db, instance_id)
        .await?
        .ok_or_else(|| crate::error::CoreError::NotFound(format!("instance {instance_id} not found")))?;

    task_service
        .update_progress(&task.id, 20, Some("syncing traffic counters"))
        .await?;
    cancellable_sleep(5, cancel).await?;

    task_service
        .update_progress(&task.id, 25, Some("deleting backend instance"))
        .await?;
    let backend_id = instance.backend_id.clone();
    let mut provider_delete_failed = false;
    if let Some(backend_id) = &backend_id {
        provider_delete_failed = delete_with_retry(driver, backend_id, cancel).await.is_err();
    }
    task_service
        .update_progress(&task.id, 70, Some("backend delete complete"))
        .await?;

    task_service
        .update_progress(&task.id, 80, Some("detaching monitoring"))
        .await?;

    let instance_type = instance
        .instance_type()
        .ok_or_else(|| crate::error::CoreError::Internal("instance has unknown instance_type".to_string()))?;
    let was_pending = instance
        .status()
        .map(|s| s.bears_pending_quota())
        .unwrap_or(false);
    let resources = instance.resources();

    let cleanup_result: Result<()> = async {
        let mut tx = db.begin().await?;
        sqlx::query("DELETE FROM port_mappings WHERE instance_id = ?")
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;
        release_provider_resources(&mut tx, provider, instance_type, resources).await?;
        if was_pending {
            quota::release_pending(&mut *tx, &instance.user_id, resources).await?;
        } else {
            quota::release_used(&mut *tx, &instance.user_id, resources).await?;
        }
        Instance::soft_delete(&mut *tx, instance_id, None).await?;
        tx.commit().await?;
        Ok(())
    }
    .await;

    if let Err(e) = cleanup_result {
        warn!(
            "delete cleanup tx failed for instance {}, reverting to stopped: {}",
            instance_id, e
        );
        return Err(e);
    }

    task_service.update_progress(&task.id, 90, Some("instance cleaned up")).await?;

    let message = if provider_delete_failed {
        "provider delete failed but database cleaned up".to_string()
    } else {
        "instance deleted".to_string()
    };
    Ok(message)
}

async fn delete_with_retry(
    driver: &dyn Driver,
    backend_id: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut delay = DELETE_RETRY_BASE_SECS;
    for attempt in 1..=DELETE_RETRY_ATTEMPTS {
        match driver.delete_instance(backend_id).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if attempt == DELETE_RETRY_ATTEMPTS {
                    warn!(
                        "backend delete for {} failed after {} attempts: {}",
                        backend_id, DELETE_RETRY_ATTEMPTS, e
                    );
                    return Err(e);
                }
                warn!(
                    "backend delete for {} failed (attempt {}/{}): {}, retrying in {}s",
                    backend_id, attempt, DELETE_RETRY_ATTEMPTS, e, delay
                );
                cancellable_sleep(delay, cancel).await?;
                delay *= 2;
            }
        }
    }
    Ok(())
}

async fn release_provider_resources(
    tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
    provider: &Provider,
    instance_type: crate::model::InstanceType,
    resources: crate::model::ResourceTuple,
) -> Result<()> {
    let is_vm = instance_type.is_vm();

    if provider.is_limited(Resource::Cpu, is_vm) {
        sqlx::query("UPDATE providers SET used_cpu_cores = GREATEST(used_cpu_cores - ?, 0) WHERE id = ?")
            .bind(resources.cpu)
            .bind(&provider.id)
            .execute(&mut **tx)
            .await?;
    }
    if provider.is_limited(Resource::Memory, is_vm) {
        sqlx::query("UPDATE providers SET used_memory = GREATEST(used_memory - ?, 0) WHERE id = ?")
            .bind(resources.memory_mb)
            .bind(&provider.id)
            .execute(&mut **tx)
            .await?;
    }
    if provider.is_limited(Resource::Disk, is_vm) {
        sqlx::query("UPDATE providers SET used_disk = GREATEST(used_disk - ?, 0) WHERE id = ?")
            .bind(resources.disk_mb)
            .bind(&provider.id)
            .execute(&mut **tx)
            .await?;
    }

    if is_vm {
        sqlx::query("UPDATE providers SET vm_count = GREATEST(vm_count - 1, 0) WHERE id = ?")
            .bind(&provider.id)
            .execute(&mut **tx)
            .await?;
    } else {
        sqlx::query("UPDATE providers SET container_count = GREATEST(container_count - 1, 0) WHERE id = ?")
            .bind(&provider.id)
            .execute(&mut **tx)
            .await?;
    }

    Ok(())
}
