//! Builds the `TaskHandler` closure the provider pool invokes per task
//! (§4.5, §4.8): resolves provider/instance context, picks a driver from the
//! registry, and routes to the matching operation flow by `task_type`.

use std::sync::Arc;

use fleetctl::driver::registry::DriverRegistry;
use fleetctl::error::{CoreError, Result};
use fleetctl::flows::{create, delete, instance_ops, port, reset};
use fleetctl::model::{Protocol, Provider, Task, TaskType};
use fleetctl::pool::TaskHandler;
use fleetctl::task_service::TaskService;
use sqlx::MySqlPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

pub fn build_handler(
    db: MySqlPool,
    task_service: TaskService,
    registry: Arc<DriverRegistry>,
) -> TaskHandler {
    Arc::new(move |task_id: String, _pool_token: CancellationToken| {
        let db = db.clone();
        let task_service = task_service.clone();
        let registry = registry.clone();
        Box::pin(async move {
            if let Err(e) = run_task(&db, &task_service, &registry, &task_id).await {
                if !e.is_cancelled() {
                    error!("task {} failed before flow could record an outcome: {}", task_id, e);
                }
            }
        })
    })
}

async fn run_task(
    db: &MySqlPool,
    task_service: &TaskService,
    registry: &DriverRegistry,
    task_id: &str,
) -> Result<()> {
    let Some(task) = Task::fetch_by_id(db, task_id).await? else {
        warn!("dispatched task {} no longer exists", task_id);
        return Ok(());
    };
    if task.status().map(|s| s.is_terminal()).unwrap_or(true) {
        return Ok(());
    }

    let Some(task_type) = task.task_type() else {
        task_service
            .complete_task(task_id, false, Some("unknown task_type"), None)
            .await?;
        return Ok(());
    };

    let cancel = task_service.start_task(task_id).await?;

    let result = load_provider_and_dispatch(db, task_service, registry, &task, task_type, cancel).await;
    if let Err(e) = &result {
        if !e.is_cancelled() {
            warn!("task {} ({}) ended in error: {}", task.id, task_type.as_str(), e);
        }
        // Flows complete_task internally on their own errors; this is the
        // safety net for failures (missing provider, bad payload) that
        // happen before a flow takes over. Task::complete is idempotent, so
        // a flow that already completed the task is unaffected.
        task_service
            .complete_task(task_id, false, Some(&e.to_string()), None)
            .await?;
    }
    result
}

async fn load_provider_and_dispatch(
    db: &MySqlPool,
    task_service: &TaskService,
    registry: &DriverRegistry,
    task: &Task,
    task_type: TaskType,
    cancel: CancellationToken,
) -> Result<()> {
    let provider = match &task.provider_id {
        Some(provider_id) => Some(
            Provider::fetch_by_id(db, provider_id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("provider {provider_id} not found")))?,
        ),
        None => None,
    };

    dispatch(db, task_service, registry, task, task_type, provider.as_ref(), cancel).await
}

async fn dispatch(
    db: &MySqlPool,
    task_service: &TaskService,
    registry: &DriverRegistry,
    task: &Task,
    task_type: TaskType,
    provider: Option<&Provider>,
    cancel: CancellationToken,
) -> Result<()> {
    match task_type {
        TaskType::CreateInstance => {
            let provider = provider
                .ok_or_else(|| CoreError::Internal("create_instance task missing provider".to_string()))?;
            let driver = registry.driver_for(provider).await?;
            let instance_id = uuid::Uuid::new_v4().to_string();
            let params = create::CreateInstanceParams::from_task_data(instance_id, &task.task_data)?;
            create::run(db, driver.as_ref(), provider, task_service, task, params, cancel).await
        }
        TaskType::Delete => {
            let provider = provider
                .ok_or_else(|| CoreError::Internal("delete task missing provider".to_string()))?;
            let instance_id = instance_id_of(task)?;
            let driver = registry.driver_for(provider).await?;
            delete::run(db, driver.as_ref(), provider, task_service, task, &instance_id, cancel).await
        }
        TaskType::Reset => {
            let provider = provider
                .ok_or_else(|| CoreError::Internal("reset task missing provider".to_string()))?;
            let instance_id = instance_id_of(task)?;
            let driver = registry.driver_for(provider).await?;
            reset::run(db, driver.as_ref(), provider, task_service, task, &instance_id, cancel).await
        }
        TaskType::Start => {
            let provider = provider
                .ok_or_else(|| CoreError::Internal("start task missing provider".to_string()))?;
            let instance_id = instance_id_of(task)?;
            let driver = registry.driver_for(provider).await?;
            instance_ops::run_start(db, driver.as_ref(), task_service, task, &instance_id, cancel).await
        }
        TaskType::Stop => {
            let provider = provider
                .ok_or_else(|| CoreError::Internal("stop task missing provider".to_string()))?;
            let instance_id = instance_id_of(task)?;
            let driver = registry.driver_for(provider).await?;
            instance_ops::run_stop(db, driver.as_ref(), task_service, task, &instance_id, cancel).await
        }
        TaskType::Restart => {
            let provider = provider
                .ok_or_else(|| CoreError::Internal("restart task missing provider".to_string()))?;
            let instance_id = instance_id_of(task)?;
            let driver = registry.driver_for(provider).await?;
            instance_ops::run_restart(db, driver.as_ref(), task_service, task, &instance_id, cancel).await
        }
        TaskType::ResetPassword => {
            let provider = provider
                .ok_or_else(|| CoreError::Internal("reset-password task missing provider".to_string()))?;
            let instance_id = instance_id_of(task)?;
            let driver = registry.driver_for(provider).await?;
            instance_ops::run_reset_password(db, driver.as_ref(), task_service, task, &instance_id, cancel)
                .await
        }
        TaskType::CreatePortMapping => {
            let provider = provider
                .ok_or_else(|| CoreError::Internal("create_port_mapping task missing provider".to_string()))?;
            let instance_id = instance_id_of(task)?;
            let driver = registry.driver_for(provider).await?;
            let params = mapping_params_from_task_data(&task.task_data)?;
            port::run_create(db, driver.as_ref(), provider, task_service, task, &instance_id, params, cancel)
                .await
        }
        TaskType::DeletePortMapping => {
            let provider = provider
                .ok_or_else(|| CoreError::Internal("delete_port_mapping task missing provider".to_string()))?;
            let driver = registry.driver_for(provider).await?;
            let mapping_id = task
                .task_data
                .get("mappingId")
                .and_then(|v| v.as_str())
                .ok_or_else(|| CoreError::Internal("task payload missing mappingId".to_string()))?;
            port::run_remove(db, driver.as_ref(), task_service, task, mapping_id, cancel).await
        }
    }
}

fn instance_id_of(task: &Task) -> Result<String> {
    task.instance_id
        .clone()
        .ok_or_else(|| CoreError::Internal(format!("task {} has no linked instance", task.id)))
}

fn mapping_params_from_task_data(data: &serde_json::Value) -> Result<port::CreateMappingParams> {
    let get_i32 = |key: &str| -> Result<i32> {
        data.get(key)
            .and_then(|v| v.as_i64())
            .map(|v| v as i32)
            .ok_or_else(|| CoreError::Internal(format!("task payload missing {key}")))
    };
    let protocol = data
        .get("protocol")
        .and_then(|v| v.as_str())
        .map(Protocol::from_db_value)
        .unwrap_or(Protocol::Tcp);
    let host_port = get_i32("hostPort")?;
    let guest_port = get_i32("guestPort")?;
    let host_port_end = data.get("hostPortEnd").and_then(|v| v.as_i64()).map(|v| v as i32).unwrap_or(host_port);
    let guest_port_end = data.get("guestPortEnd").and_then(|v| v.as_i64()).map(|v| v as i32).unwrap_or(guest_port);

    Ok(port::CreateMappingParams {
        host_port,
        host_port_end,
        guest_port,
        guest_port_end,
        protocol,
        description: data.get("description").and_then(|v| v.as_str()).map(|s| s.to_string()),
    })
}
