//! Builds a `Driver` trait object per provider row, pooling SSH sessions
//! and the Docker API client across calls. Host-key verification and
//! credential storage proper are out of scope; one operator-configured SSH
//! identity (`config::SshDefaults`) connects to every Proxmox/LXD/Incus node.

use std::collections::HashMap;

use bollard::Docker;
use tokio::sync::{Mutex, RwLock};

use crate::config::{self, SshDefaults};
use crate::driver::docker::DockerDriver;
use crate::driver::incus::IncusDriver;
use crate::driver::lxd::LxdDriver;
use crate::driver::proxmox::ProxmoxDriver;
use crate::driver::Driver;
use crate::error::{CoreError, Result};
use crate::model::{Provider, ProviderKind};
use crate::ssh::{SshConfig, SshSession};

pub struct DriverRegistry {
    ssh_defaults: SshDefaults,
    ssh_sessions: RwLock<HashMap<String, std::sync::Arc<SshSession>>>,
    docker: Mutex<Option<Docker>>,
}

impl DriverRegistry {
    pub fn new(ssh_defaults: SshDefaults) -> Self {
        DriverRegistry {
            ssh_defaults,
            ssh_sessions: RwLock::new(HashMap::new()),
            docker: Mutex::new(None),
        }
    }

    async fn ssh_for(&self, provider: &Provider) -> Result<std::sync::Arc<SshSession>> {
        if let Some(session) = self.ssh_sessions.read().await.get(&provider.id) {
            return Ok(session.clone());
        }

        let mut sessions = self.ssh_sessions.write().await;
        if let Some(session) = sessions.get(&provider.id) {
            return Ok(session.clone());
        }

        let (host, port) = parse_endpoint(&provider.endpoint);
        let private_key_path = config::expand_path(self.ssh_defaults.private_key_path.clone())
            .to_string_lossy()
            .to_string();

        let session = SshSession::connect(&SshConfig {
            host,
            port,
            username: self.ssh_defaults.username.clone(),
            private_key_path,
        })
        .await
        .map_err(|e| CoreError::BackendError(format!("ssh connect to provider {}: {e}", provider.id)))?;

        let session = std::sync::Arc::new(session);
        sessions.insert(provider.id.clone(), session.clone());
        Ok(session)
    }

    async fn docker_client(&self) -> Result<Docker> {
        let mut guard = self.docker.lock().await;
        if let Some(docker) = &*guard {
            return Ok(docker.clone());
        }
        let docker = Docker::connect_with_socket_defaults()
            .map_err(|e| CoreError::BackendError(format!("docker connect: {e}")))?;
        *guard = Some(docker.clone());
        Ok(docker)
    }

    /// Builds the driver for `provider`, reusing a pooled SSH session or the
    /// shared Docker client where one already exists.
    pub async fn driver_for(&self, provider: &Provider) -> Result<Box<dyn Driver>> {
        let kind = provider.kind().ok_or_else(|| {
            CoreError::Internal(format!("provider {} has unknown kind {}", provider.id, provider.kind))
        })?;

        Ok(match kind {
            ProviderKind::Proxmox => Box::new(ProxmoxDriver::new(self.ssh_for(provider).await?)),
            ProviderKind::Lxd => Box::new(LxdDriver::new(self.ssh_for(provider).await?)),
            ProviderKind::Incus => Box::new(IncusDriver::new(self.ssh_for(provider).await?)),
            ProviderKind::Docker => Box::new(DockerDriver::new(self.docker_client().await?)),
        })
    }

    /// Drops the cached SSH session for `provider_id`. A dead session (node
    /// reboot, network blip) would otherwise fail every subsequent command
    /// until the process restarts; callers evict on a backend error and let
    /// the next `driver_for` reconnect.
    pub async fn evict(&self, provider_id: &str) {
        self.ssh_sessions.write().await.remove(provider_id);
    }
}

fn parse_endpoint(endpoint: &str) -> (String, u16) {
    if let Some((host, port)) = endpoint.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            return (host.to_string(), port);
        }
    }
    (endpoint.to_string(), 22)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_endpoint_defaults_to_port_22() {
        assert_eq!(parse_endpoint("10.0.0.5"), ("10.0.0.5".to_string(), 22));
    }

    #[test]
    fn parse_endpoint_splits_explicit_port() {
        assert_eq!(parse_endpoint("10.0.0.5:2222"), ("10.0.0.5".to_string(), 2222));
    }

    #[test]
    fn parse_endpoint_ignores_non_numeric_suffix() {
        assert_eq!(parse_endpoint("node-a"), ("node-a".to_string(), 22));
    }
}
