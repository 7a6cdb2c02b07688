//! Start/stop/restart/reset-password task flows (§4.1 estimated-duration
//! table, §4.2 instance status state machine). Each of these is a single
//! driver call plus a status transition; unlike create/delete/reset they
//! never touch a reservation.

use sqlx::MySqlPool;
use tokio_util::sync::CancellationToken;

use crate::driver::Driver;
use crate::error::{CoreError, Result};
use crate::model::{Instance, InstanceStatus, Task};
use crate::quota;
use crate::task_service::TaskService;

use super::{cancellable_sleep, generate_password};

/// `stopped|creating -> starting -> running`. If the instance was still
/// carrying pending quota (a `creating` instance started before it ever
/// reached `running`), promotes pending to used on confirm (§4.2).
pub async fn run_start(
    db: &MySqlPool,
    driver: &dyn Driver,
    task_service: &TaskService,
    task: &Task,
    instance_id: &str,
    cancel: CancellationToken,
) -> Result<()> {
    match run_start_inner(db, driver, task_service, task, instance_id, &cancel).await {
        Ok(()) => {
            task_service
                .complete_task(&task.id, true, None, Some("instance started"))
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

async fn run_start_inner(
    db: &MySqlPool,
    driver: &dyn Driver,
    task_service: &TaskService,
    task: &Task,
    instance_id: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let instance = fetch_live(db, instance_id).await?;
    let was_pending = instance
        .status()
        .map(|s| s.bears_pending_quota())
        .unwrap_or(false);

    task_service
        .update_progress(&task.id, 20, Some("starting instance"))
        .await?;
    Instance::set_status(db, instance_id, InstanceStatus::Starting).await?;

    let backend_id = backend_id_of(&instance)?;
    driver.start_instance(&backend_id).await?;

    if cancel.is_cancelled() {
        return Err(CoreError::Cancelled);
    }

    task_service
        .update_progress(&task.id, 80, Some("confirming instance is up"))
        .await?;
    Instance::set_status(db, instance_id, InstanceStatus::Running).await?;
    if was_pending {
        quota::confirm_pending(db, &instance.user_id, instance.resources()).await?;
    }

    Ok(())
}

/// `running -> stopping -> stopped`.
pub async fn run_stop(
    db: &MySqlPool,
    driver: &dyn Driver,
    task_service: &TaskService,
    task: &Task,
    instance_id: &str,
    cancel: CancellationToken,
) -> Result<()> {
    match run_stop_inner(db, driver, task_service, task, instance_id, &cancel).await {
        Ok(()) => {
            task_service
                .complete_task(&task.id, true, None, Some("instance stopped"))
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

async fn run_stop_inner(
    db: &MySqlPool,
    driver: &dyn Driver,
    task_service: &TaskService,
    task: &Task,
    instance_id: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let instance = fetch_live(db, instance_id).await?;
    let backend_id = backend_id_of(&instance)?;

    task_service
        .update_progress(&task.id, 20, Some("stopping instance"))
        .await?;
    Instance::set_status(db, instance_id, InstanceStatus::Stopping).await?;

    driver.stop_instance(&backend_id).await?;

    if cancel.is_cancelled() {
        return Err(CoreError::Cancelled);
    }

    task_service
        .update_progress(&task.id, 90, Some("confirming instance is down"))
        .await?;
    Instance::set_status(db, instance_id, InstanceStatus::Stopped).await?;
    Ok(())
}

/// `running -> restarting -> running`. Same quota-promotion rule as start,
/// though a `running` instance already bears used_quota so it never fires
/// in practice; kept for symmetry with the state machine in §4.2.
pub async fn run_restart(
    db: &MySqlPool,
    driver: &dyn Driver,
    task_service: &TaskService,
    task: &Task,
    instance_id: &str,
    cancel: CancellationToken,
) -> Result<()> {
    match run_restart_inner(db, driver, task_service, task, instance_id, &cancel).await {
        Ok(()) => {
            task_service
                .complete_task(&task.id, true, None, Some("instance restarted"))
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

async fn run_restart_inner(
    db: &MySqlPool,
    driver: &dyn Driver,
    task_service: &TaskService,
    task: &Task,
    instance_id: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let instance = fetch_live(db, instance_id).await?;
    let was_pending = instance
        .status()
        .map(|s| s.bears_pending_quota())
        .unwrap_or(false);
    let backend_id = backend_id_of(&instance)?;

    task_service
        .update_progress(&task.id, 15, Some("restarting instance"))
        .await?;
    Instance::set_status(db, instance_id, InstanceStatus::Restarting).await?;

    driver.restart_instance(&backend_id).await?;

    if cancel.is_cancelled() {
        return Err(CoreError::Cancelled);
    }
    cancellable_sleep(5, cancel).await?;

    task_service
        .update_progress(&task.id, 90, Some("confirming instance is back up"))
        .await?;
    Instance::set_status(db, instance_id, InstanceStatus::Running).await?;
    if was_pending {
        quota::confirm_pending(db, &instance.user_id, instance.resources()).await?;
    }

    Ok(())
}

/// Generates a fresh password and pushes it to the backend. Leaves the
/// instance's status untouched; only VMs reboot as a side effect of
/// `set_password` when running (driver responsibility, see DESIGN.md).
pub async fn run_reset_password(
    db: &MySqlPool,
    driver: &dyn Driver,
    task_service: &TaskService,
    task: &Task,
    instance_id: &str,
    _cancel: CancellationToken,
) -> Result<()> {
    match run_reset_password_inner(db, driver, task_service, task, instance_id).await {
        Ok(()) => {
            task_service
                .complete_task(&task.id, true, None, Some("password reset"))
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

async fn run_reset_password_inner(
    db: &MySqlPool,
    driver: &dyn Driver,
    task_service: &TaskService,
    task: &Task,
    instance_id: &str,
) -> Result<()> {
    let instance = fetch_live(db, instance_id).await?;
    let instance_type = instance
        .instance_type()
        .ok_or_else(|| CoreError::Internal("instance has unknown instance_type".to_string()))?;
    let backend_id = backend_id_of(&instance)?;
    let currently_running = instance
        .status()
        .map(|s| matches!(s, InstanceStatus::Running))
        .unwrap_or(false);

    task_service
        .update_progress(&task.id, 30, Some("setting new password"))
        .await?;
    let password = generate_password();
    driver
        .set_password(&backend_id, instance_type, &password, currently_running)
        .await?;

    task_service
        .update_progress(&task.id, 90, Some("persisting new password"))
        .await?;
    Instance::set_network_and_password(
        db,
        instance_id,
        instance.private_ip.as_deref(),
        instance.public_ip.as_deref(),
        Some(&password),
    )
    .await?;

    Ok(())
}

async fn fetch_live(db: &MySqlPool, instance_id: &str) -> Result<Instance> {
    Instance::fetch_by_id(db, instance_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("instance {instance_id} not found")))
}

fn backend_id_of(instance: &Instance) -> Result<String> {
    instance
        .backend_id
        .clone()
        .ok_or_else(|| CoreError::StateConflict(format!("instance {} has no backend id", instance.id)))
}
