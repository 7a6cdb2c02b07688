use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::driver::{BackendInstanceInfo, CreateInstanceSpec, Driver, PortMappingRequest};
use crate::error::{CoreError, Result};
use crate::model::InstanceType;

/// Thin wrapper over `bollard::Docker` exposing container lifecycle
/// operations (create/start/stop/remove/exec) through the uniform `Driver`
/// capability set.
pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    pub fn new(docker: Docker) -> Self {
        DockerDriver { docker }
    }

    fn container_name(backend_id: &str) -> String {
        format!("fleetctl-{}", backend_id.to_ascii_lowercase())
    }

    fn to_core_err(context: &str, err: bollard::errors::Error) -> CoreError {
        CoreError::BackendError(format!("{context}: {err}"))
    }
}

#[async_trait]
impl Driver for DockerDriver {
    async fn list_instances(&self) -> Result<Vec<BackendInstanceInfo>> {
        let containers = self
            .docker
            .list_containers::<String>(None)
            .await
            .map_err(|e| Self::to_core_err("list_containers", e))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let name = c
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string())?;
                if !name.starts_with("fleetctl-") {
                    return None;
                }
                Some(BackendInstanceInfo {
                    backend_id: name.trim_start_matches("fleetctl-").to_string(),
                    name: name.clone(),
                    status: c.state.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn next_backend_id(&self, _instance_type: InstanceType) -> Result<String> {
        // Docker's backend id is simply the container name, not a scanned
        // numeric range (glossary: "name elsewhere"); a fresh uuid is always
        // free.
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn create_instance(&self, spec: &CreateInstanceSpec) -> Result<()> {
        let name = Self::container_name(&spec.backend_id);

        let host_config = HostConfig {
            memory: Some(spec.memory_mb as i64 * 1024 * 1024),
            nano_cpus: Some(spec.cpu as i64 * 1_000_000_000),
            port_bindings: Some(HashMap::new()),
            ..Default::default()
        };

        let mut env = vec![];
        if let Some(password) = &spec.password {
            env.push(format!("FLEETCTL_ROOT_PASSWORD={password}"));
        }

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            host_config: Some(host_config),
            tty: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| Self::to_core_err("create_container", e))?;

        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Self::to_core_err("start_container", e))?;

        info!("created and started docker container {}", name);
        Ok(())
    }

    async fn start_instance(&self, backend_id: &str) -> Result<()> {
        let name = Self::container_name(backend_id);
        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Self::to_core_err("start_container", e))
    }

    async fn stop_instance(&self, backend_id: &str) -> Result<()> {
        let name = Self::container_name(backend_id);
        self.docker
            .stop_container(&name, None::<StopContainerOptions>)
            .await
            .map_err(|e| Self::to_core_err("stop_container", e))
    }

    async fn restart_instance(&self, backend_id: &str) -> Result<()> {
        let name = Self::container_name(backend_id);
        self.docker
            .restart_container(&name, None)
            .await
            .map_err(|e| Self::to_core_err("restart_container", e))
    }

    async fn delete_instance(&self, backend_id: &str) -> Result<()> {
        let name = Self::container_name(backend_id);
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(&name, Some(options)).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.to_string().contains("404") || e.to_string().contains("No such container") {
                    warn!("container {} already removed, treating as success", name);
                    Ok(())
                } else {
                    Err(Self::to_core_err("remove_container", e))
                }
            }
        }
    }

    async fn set_password(
        &self,
        backend_id: &str,
        _instance_type: InstanceType,
        password: &str,
        _currently_running: bool,
    ) -> Result<()> {
        let name = Self::container_name(backend_id);
        let command = format!("echo 'root:{password}' | chpasswd");
        self.exec(&name, &command).await.map(|_| ())
    }

    async fn get_ipv4(&self, backend_id: &str) -> Result<Option<String>> {
        let name = Self::container_name(backend_id);
        let info = self
            .docker
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Self::to_core_err("inspect_container", e))?;

        Ok(info
            .network_settings
            .and_then(|ns| ns.ip_address)
            .filter(|ip| !ip.is_empty()))
    }

    async fn get_ipv6(&self, _backend_id: &str) -> Result<Option<String>> {
        // Docker's default bridge network does not expose IPv6; ipv6-capable
        // networks are an operator-configured concern outside the core.
        Ok(None)
    }

    async fn apply_port_mapping(&self, _req: &PortMappingRequest) -> Result<()> {
        // Docker port exposure is create-time only (native port exposure);
        // manual post-create adds are not supported (§4.8.4).
        Err(CoreError::BackendError(
            "docker does not support manual port mapping after creation".to_string(),
        ))
    }

    async fn remove_port_mapping(&self, _req: &PortMappingRequest) -> Result<()> {
        // Nothing to remove remotely since apply never ran; DB-level cleanup
        // still proceeds at the caller.
        Ok(())
    }

    async fn scan_used_ports(
        &self,
        _range_start: i32,
        _range_end: i32,
    ) -> Result<std::collections::HashSet<i32>> {
        // Docker ports are exposed at create time via the container's own
        // port bindings, never through the shared port allocator/mapping
        // manager (§4.8.4), so there is nothing to scan here.
        Ok(std::collections::HashSet::new())
    }

    async fn health_probe(&self, backend_id: &str) -> Result<bool> {
        let name = Self::container_name(backend_id);
        match self
            .docker
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(info
                .state
                .and_then(|s| s.running)
                .unwrap_or(false)),
            Err(_) => Ok(false),
        }
    }
}

impl DockerDriver {
    async fn exec(&self, container_name: &str, command: &str) -> Result<String> {
        let exec_config = CreateExecOptions {
            cmd: Some(vec!["/bin/sh", "-c", command]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(container_name, exec_config)
            .await
            .map_err(|e| Self::to_core_err("create_exec", e))?;

        let mut output = String::new();
        if let StartExecResults::Attached { mut output: stream, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Self::to_core_err("start_exec", e))?
        {
            while let Some(Ok(msg)) = stream.next().await {
                output.push_str(&msg.to_string());
            }
        }

        Ok(output)
    }

    #[allow(dead_code)]
    fn bridge_port(binding: Option<Vec<PortBinding>>) -> Option<String> {
        binding?.into_iter().find_map(|b| b.host_port)
    }
}
