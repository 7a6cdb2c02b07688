//! Port-mapping apply/remove task flows (§4.8.4). Unlike create/delete/reset,
//! these operate on a single logical mapping rather than the whole instance.

use sqlx::MySqlPool;
use tokio_util::sync::CancellationToken;

use crate::driver::Driver;
use crate::error::{CoreError, Result};
use crate::model::{Instance, PortMapping, Protocol, Provider, Task};
use crate::port_mapping::{self, MappingSpec};
use crate::task_service::TaskService;

pub struct CreateMappingParams {
    pub host_port: i32,
    pub host_port_end: i32,
    pub guest_port: i32,
    pub guest_port_end: i32,
    pub protocol: Protocol,
    pub description: Option<String>,
}

/// Refreshes the instance's private IP from the backend before applying a
/// new mapping, persisting it if it drifted from the DB value (§4.8.4
/// "Apply").
pub async fn run_create(
    db: &MySqlPool,
    driver: &dyn Driver,
    provider: &Provider,
    task_service: &TaskService,
    task: &Task,
    instance_id: &str,
    params: CreateMappingParams,
    _cancel: CancellationToken,
) -> Result<()> {
    match run_create_inner(db, driver, provider, task_service, task, instance_id, params).await {
        Ok(()) => {
            task_service
                .complete_task(&task.id, true, None, Some("port mapping applied"))
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

async fn run_create_inner(
    db: &MySqlPool,
    driver: &dyn Driver,
    provider: &Provider,
    task_service: &TaskService,
    task: &Task,
    instance_id: &str,
    params: CreateMappingParams,
) -> Result<()> {
    task_service
        .update_progress(&task.id, 20, Some("refreshing private ip"))
        .await?;
    let instance = Instance::fetch_by_id(db, instance_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("instance {instance_id} not found")))?;
    let backend_id = instance
        .backend_id
        .clone()
        .ok_or_else(|| CoreError::StateConflict(format!("instance {instance_id} has no backend id")))?;

    let fresh_ip = driver.get_ipv4(&backend_id).await.unwrap_or(None);
    if fresh_ip != instance.private_ip {
        Instance::set_network_and_password(
            db,
            instance_id,
            fresh_ip.as_deref(),
            instance.public_ip.as_deref(),
            instance.password.as_deref(),
        )
        .await?;
    }

    task_service
        .update_progress(&task.id, 60, Some("applying port mapping"))
        .await?;
    let spec = MappingSpec {
        host_port: params.host_port,
        host_port_end: params.host_port_end,
        guest_port: params.guest_port,
        guest_port_end: params.guest_port_end,
        protocol: params.protocol,
        is_ssh: false,
        is_automatic: false,
        description: params.description,
    };
    let row = port_mapping::apply(
        db,
        driver,
        instance_id,
        &provider.id,
        &backend_id,
        fresh_ip.as_deref(),
        provider.ipv4_port_mapping_method.as_str(),
        &spec,
    )
    .await?;

    if row.status != "active" {
        return Err(CoreError::BackendError(format!(
            "port mapping {} could not be applied to instance {}",
            row.id, instance_id
        )));
    }

    task_service.update_progress(&task.id, 100, Some("port mapping active")).await?;
    Ok(())
}

/// Best-effort backend removal always followed by DB cleanup (§4.8.4
/// "Remove").
pub async fn run_remove(
    db: &MySqlPool,
    driver: &dyn Driver,
    task_service: &TaskService,
    task: &Task,
    mapping_id: &str,
    _cancel: CancellationToken,
) -> Result<()> {
    match run_remove_inner(db, driver, task_service, task, mapping_id).await {
        Ok(message) => {
            task_service
                .complete_task(&task.id, true, None, Some(&message))
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

async fn run_remove_inner(
    db: &MySqlPool,
    driver: &dyn Driver,
    task_service: &TaskService,
    task: &Task,
    mapping_id: &str,
) -> Result<String> {
    task_service
        .update_progress(&task.id, 30, Some("removing port mapping"))
        .await?;

    let instance_id = task
        .task_data
        .get("instanceId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::Internal("task payload missing instanceId".to_string()))?;

    let mapping = PortMapping::list_for_instance(db, instance_id)
        .await?
        .into_iter()
        .find(|m| m.id == mapping_id)
        .ok_or_else(|| CoreError::NotFound(format!("port mapping {mapping_id} not found")))?;

    let removed_cleanly = port_mapping::remove(db, driver, &mapping).await?;

    task_service.update_progress(&task.id, 100, Some("port mapping removed")).await?;
    if removed_cleanly {
        Ok("port mapping removed".to_string())
    } else {
        Ok("remote removal failed but database cleaned up".to_string())
    }
}
