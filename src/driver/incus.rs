//! Incus driver: SSH to the node, drive the `incus` CLI (§6). Incus forked
//! from LXD and keeps a near-identical command surface, but is dispatched
//! through its own tagged variant rather than folded into `LxdDriver` so the
//! two can diverge independently as their CLIs drift.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::driver::{
    parse_ss_listening_ports, BackendInstanceInfo, CreateInstanceSpec, Driver, PortMappingRequest,
    PortProtocol,
};
use crate::error::{CoreError, Result};
use crate::model::InstanceType;
use crate::ssh::SshSession;

pub struct IncusDriver {
    ssh: Arc<SshSession>,
}

impl IncusDriver {
    pub fn new(ssh: Arc<SshSession>) -> Self {
        IncusDriver { ssh }
    }

    fn to_core_err(context: &str, err: anyhow::Error) -> CoreError {
        CoreError::BackendError(format!("{context}: {err}"))
    }

    async fn exec(&self, command: &str) -> Result<String> {
        self.ssh
            .exec(command)
            .await
            .map_err(|e| Self::to_core_err(command, e))
    }

    fn parse_list(output: &str) -> Vec<BackendInstanceInfo> {
        output
            .lines()
            .filter(|l| !l.is_empty())
            .filter_map(|line| {
                let fields: Vec<&str> = line.split(',').collect();
                let name = fields.first()?.to_string();
                let status = fields.get(1).unwrap_or(&"unknown").to_string();
                Some(BackendInstanceInfo {
                    backend_id: name.clone(),
                    name,
                    status,
                })
            })
            .collect()
    }

    fn proxy_device_name(host_port: i32, protocol: PortProtocol) -> String {
        let tag = match protocol {
            PortProtocol::Tcp => "tcp",
            PortProtocol::Udp => "udp",
            PortProtocol::Both => "both",
        };
        format!("port-{tag}-{host_port}")
    }
}

#[async_trait]
impl Driver for IncusDriver {
    async fn list_instances(&self) -> Result<Vec<BackendInstanceInfo>> {
        let output = self.exec("incus list -c ns4 --format csv").await?;
        Ok(Self::parse_list(&output))
    }

    async fn next_backend_id(&self, _instance_type: InstanceType) -> Result<String> {
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn create_instance(&self, spec: &CreateInstanceSpec) -> Result<()> {
        self.exec(&format!(
            "incus launch {image} {name} --storage {pool} \
             -c limits.cpu={cpu} -c limits.memory={mem}MB",
            image = spec.image,
            name = spec.name,
            pool = spec.storage_pool,
            cpu = spec.cpu,
            mem = spec.memory_mb,
        ))
        .await?;

        self.exec(&format!(
            "incus config device override {name} root size={disk}MB",
            name = spec.name,
            disk = spec.disk_mb,
        ))
        .await?;

        if let Some(password) = &spec.password {
            self.exec(&format!(
                "incus exec {name} -- bash -c \"echo 'root:{password}' | chpasswd\"",
                name = spec.name,
                password = password,
            ))
            .await?;
        }

        info!("created incus container {}", spec.name);
        Ok(())
    }

    async fn start_instance(&self, backend_id: &str) -> Result<()> {
        self.exec(&format!("incus start {backend_id}")).await?;
        Ok(())
    }

    async fn stop_instance(&self, backend_id: &str) -> Result<()> {
        self.exec(&format!("incus stop {backend_id}")).await?;
        Ok(())
    }

    async fn restart_instance(&self, backend_id: &str) -> Result<()> {
        self.exec(&format!("incus restart {backend_id}")).await?;
        Ok(())
    }

    async fn delete_instance(&self, backend_id: &str) -> Result<()> {
        self.exec(&format!("incus delete {backend_id} --force")).await?;
        Ok(())
    }

    async fn set_password(
        &self,
        backend_id: &str,
        _instance_type: InstanceType,
        password: &str,
        _currently_running: bool,
    ) -> Result<()> {
        self.exec(&format!(
            "incus exec {backend_id} -- bash -c \"echo 'root:{password}' | chpasswd\""
        ))
        .await?;
        Ok(())
    }

    async fn get_ipv4(&self, backend_id: &str) -> Result<Option<String>> {
        let output = self
            .exec(&format!("incus list {backend_id} -c 4 --format csv"))
            .await?;
        Ok(output
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().next())
            .map(|s| s.to_string()))
    }

    async fn get_ipv6(&self, backend_id: &str) -> Result<Option<String>> {
        let output = self
            .exec(&format!("incus list {backend_id} -c 6 --format csv"))
            .await?;
        Ok(output
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().next())
            .map(|s| s.to_string()))
    }

    async fn apply_port_mapping(&self, req: &PortMappingRequest) -> Result<()> {
        let private_ip = req
            .private_ip
            .clone()
            .ok_or_else(|| CoreError::BackendError("no private ip for proxy device".to_string()))?;
        let device = Self::proxy_device_name(req.host_port, req.protocol);
        let proto = match req.protocol {
            PortProtocol::Udp => "udp",
            _ => "tcp",
        };
        self.exec(&format!(
            "incus config device add {backend_id} {device} proxy \
             listen={proto}:0.0.0.0:{host_port} connect={proto}:{ip}:{guest_port}",
            backend_id = req.backend_id,
            device = device,
            proto = proto,
            host_port = req.host_port,
            ip = private_ip,
            guest_port = req.guest_port,
        ))
        .await?;
        Ok(())
    }

    async fn remove_port_mapping(&self, req: &PortMappingRequest) -> Result<()> {
        let device = Self::proxy_device_name(req.host_port, req.protocol);
        let _ = self
            .exec(&format!(
                "incus config device remove {backend_id} {device}",
                backend_id = req.backend_id,
                device = device,
            ))
            .await;
        Ok(())
    }

    async fn health_probe(&self, backend_id: &str) -> Result<bool> {
        let output = self
            .exec(&format!("incus list {backend_id} -c s --format csv"))
            .await?;
        Ok(output.trim().eq_ignore_ascii_case("running"))
    }

    async fn scan_used_ports(&self, range_start: i32, range_end: i32) -> Result<HashSet<i32>> {
        let output = self.exec("ss -Htln && ss -Htun").await?;
        Ok(parse_ss_listening_ports(&output, range_start, range_end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_reads_csv() {
        let output = "web1,RUNNING,10.10.10.5\n";
        let parsed = IncusDriver::parse_list(output);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].status, "RUNNING");
    }
}
