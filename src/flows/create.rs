//! Create-instance flow (§4.8.1).

use sqlx::MySqlPool;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::driver::{CreateInstanceSpec, Driver};
use crate::error::{CoreError, Result};
use crate::model::{Instance, InstanceStatus, InstanceType, Provider, ResourceTuple, SystemImage, Task};
use crate::port_mapping;
use crate::quota;
use crate::reservation_store;
use crate::task_service::TaskService;

use super::{cancellable_sleep, generate_password, wait_until_healthy};

const HEALTH_CEILING_SECS: u64 = 90;

pub struct CreateInstanceParams {
    pub instance_id: String,
    pub name: String,
    pub instance_type: InstanceType,
    pub image_name: String,
    pub architecture: String,
    pub cpu: i32,
    pub memory_mb: i32,
    pub disk_mb: i32,
    pub bandwidth_mbps: i32,
}

impl CreateInstanceParams {
    /// Resolves cpu/memory/disk/bandwidth from the spec catalog ids carried
    /// in the task payload (§6 "Task payloads").
    pub fn from_task_data(instance_id: String, data: &serde_json::Value) -> Result<Self> {
        let get_str = |key: &str| {
            data.get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| CoreError::Internal(format!("task payload missing {key}")))
        };

        let cpu = crate::catalog::cpu_cores_from_id(&get_str("cpuId")?)
            .ok_or_else(|| CoreError::Internal("invalid cpuId".to_string()))?;
        let memory_mb = crate::catalog::memory_mb_from_id(&get_str("memoryId")?)
            .ok_or_else(|| CoreError::Internal("invalid memoryId".to_string()))?;
        let disk_mb = crate::catalog::disk_mb_from_id(&get_str("diskId")?)
            .ok_or_else(|| CoreError::Internal("invalid diskId".to_string()))?;
        let bandwidth_mbps = crate::catalog::bandwidth_mbps_from_id(&get_str("bandwidthId")?)
            .ok_or_else(|| CoreError::Internal("invalid bandwidthId".to_string()))?;

        let instance_type = match get_str("instanceType")?.as_str() {
            "vm" => InstanceType::Vm,
            _ => InstanceType::Container,
        };

        Ok(CreateInstanceParams {
            instance_id,
            name: get_str("name")?,
            instance_type,
            image_name: get_str("imageId")?,
            architecture: data
                .get("architecture")
                .and_then(|v| v.as_str())
                .unwrap_or("x86_64")
                .to_string(),
            cpu,
            memory_mb,
            disk_mb,
            bandwidth_mbps,
        })
    }
}

pub async fn run(
    db: &MySqlPool,
    driver: &dyn Driver,
    provider: &Provider,
    task_service: &TaskService,
    task: &Task,
    params: CreateInstanceParams,
    cancel: CancellationToken,
) -> Result<()> {
    let requested = ResourceTuple::new(
        params.cpu,
        params.memory_mb,
        params.disk_mb,
        params.bandwidth_mbps,
    );
    let mut linked = false;
    match run_inner(db, driver, provider, task_service, task, params, &cancel, &mut linked).await {
        Ok(()) => {
            task_service
                .complete_task(&task.id, true, None, Some("instance created"))
                .await?;
            Ok(())
        }
        Err(e) => {
            // Once the instance row is linked, `complete_task`'s own
            // unlinked-task release guard no longer fires (§4.1), so this
            // flow must release the reservation/pending quota itself here.
            if linked {
                release_failed_create_resources(db, task, requested).await;
            }
            task_service
                .complete_task(&task.id, false, Some(&e.to_string()), None)
                .await?;
            Err(e)
        }
    }
}

async fn release_failed_create_resources(db: &MySqlPool, task: &Task, requested: ResourceTuple) {
    if let Some(session_id) = task.session_id() {
        if let Err(e) = reservation_store::release(db, &session_id).await {
            warn!("failed to release reservation for task {}: {}", task.id, e);
        }
    }
    if let Err(e) = quota::release_pending(db, &task.user_id, requested).await {
        warn!("failed to release pending quota for task {}: {}", task.id, e);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_inner(
    db: &MySqlPool,
    driver: &dyn Driver,
    provider: &Provider,
    task_service: &TaskService,
    task: &Task,
    params: CreateInstanceParams,
    cancel: &CancellationToken,
    linked: &mut bool,
) -> Result<()> {
    let requested = ResourceTuple::new(
        params.cpu,
        params.memory_mb,
        params.disk_mb,
        params.bandwidth_mbps,
    );

    task_service
        .update_progress(&task.id, 10, Some("resolving backend id"))
        .await?;
    let backend_id = driver.next_backend_id(params.instance_type).await?;

    Instance::insert(
        db,
        &params.instance_id,
        &provider.id,
        &task.user_id,
        &params.name,
        params.instance_type,
        &params.image_name,
        requested,
        InstanceStatus::Creating,
        Some(&backend_id),
    )
    .await?;
    Task::link_instance(db, &task.id, &params.instance_id).await?;
    *linked = true;

    task_service
        .update_progress(&task.id, 20, Some("resolving system image"))
        .await?;
    let image = SystemImage::lookup(
        db,
        &params.image_name,
        provider.kind().map(|k| k.as_str()).unwrap_or("unknown"),
        params.instance_type.as_str(),
        &params.architecture,
    )
    .await?
    .ok_or_else(|| CoreError::NotFound(format!("system image {} not found", params.image_name)))?;

    if cancel.is_cancelled() {
        return Err(CoreError::Cancelled);
    }

    let password = generate_password();
    let spec = CreateInstanceSpec {
        backend_id: backend_id.clone(),
        name: params.name.clone(),
        instance_type: params.instance_type,
        image: image.cache_filename.clone(),
        cpu: params.cpu,
        memory_mb: params.memory_mb,
        disk_mb: params.disk_mb,
        storage_pool: "local".to_string(),
        network_type: provider.network_type.clone(),
        password: Some(password.clone()),
    };

    task_service
        .update_progress(&task.id, 40, Some("creating backend instance"))
        .await?;
    driver.create_instance(&spec).await.map_err(|e| {
        mark_failed(db, &params.instance_id);
        e
    })?;

    task_service
        .update_progress(&task.id, 70, Some("configuring network"))
        .await?;
    let private_ip = driver.get_ipv4(&backend_id).await.unwrap_or(None);

    let nat_mode = matches!(provider.network_type.as_str(), "nat_ipv4" | "nat_ipv4_ipv6");
    if nat_mode {
        if let Err(e) = port_mapping::create_default_mappings(
            db,
            driver,
            provider,
            &params.instance_id,
            &backend_id,
            private_ip.as_deref(),
        )
        .await
        {
            warn!(
                "default port mapping creation failed for instance {}: {}",
                params.instance_id, e
            );
        }
    }

    task_service
        .update_progress(&task.id, 90, Some("waiting for instance to boot"))
        .await?;
    let healthy = wait_until_healthy(driver, &backend_id, HEALTH_CEILING_SECS, cancel).await?;
    if !healthy {
        mark_failed(db, &params.instance_id);
        return Err(CoreError::BackendError(format!(
            "instance {backend_id} did not become healthy within {HEALTH_CEILING_SECS}s"
        )));
    }

    task_service
        .update_progress(&task.id, 92, Some("setting ssh password"))
        .await?;
    if let Err(e) = driver
        .set_password(&backend_id, params.instance_type, &password, true)
        .await
    {
        warn!("failed to set password on instance {}: {}", params.instance_id, e);
    }

    Instance::set_network_and_password(
        db,
        &params.instance_id,
        private_ip.as_deref(),
        None,
        Some(&password),
    )
    .await?;
    Instance::set_status(db, &params.instance_id, InstanceStatus::Running).await?;

    quota::confirm_pending(db, &task.user_id, requested).await?;
    if let Some(session_id) = task.session_id() {
        reservation_store::consume(db, &session_id).await.ok();
    }

    cancellable_sleep(0, cancel).await?;
    task_service
        .update_progress(&task.id, 95, Some("traffic monitoring hooks are external"))
        .await?;
    Ok(())
}

fn mark_failed(db: &MySqlPool, instance_id: &str) {
    let db = db.clone();
    let instance_id = instance_id.to_string();
    tokio::spawn(async move {
        if let Err(e) = Instance::set_status(&db, &instance_id, InstanceStatus::Failed).await {
            warn!("failed to mark instance {} failed: {}", instance_id, e);
        }
    });
}
