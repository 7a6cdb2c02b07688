pub mod docker;
pub mod incus;
pub mod lxd;
pub mod proxmox;
pub mod registry;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::InstanceType;

#[derive(Debug, Clone)]
pub struct BackendInstanceInfo {
    pub backend_id: String,
    pub name: String,
    pub status: String,
}

/// Everything a create_instance flow (§4.8.1) needs to hand a driver.
#[derive(Debug, Clone)]
pub struct CreateInstanceSpec {
    pub backend_id: String,
    pub name: String,
    pub instance_type: InstanceType,
    pub image: String,
    pub cpu: i32,
    pub memory_mb: i32,
    pub disk_mb: i32,
    pub storage_pool: String,
    pub network_type: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortProtocol {
    Tcp,
    Udp,
    Both,
}

#[derive(Debug, Clone)]
pub struct PortMappingRequest {
    pub backend_id: String,
    pub private_ip: Option<String>,
    pub host_port: i32,
    pub host_port_end: i32,
    pub guest_port: i32,
    pub guest_port_end: i32,
    pub protocol: PortProtocol,
}

/// Uniform capability set across Proxmox/LXD/Incus/Docker (§2, §9): tagged
/// dispatch through this trait rather than deep inheritance.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn list_instances(&self) -> Result<Vec<BackendInstanceInfo>>;

    /// Lowest unused backend id for the given kind (§4.8.1 step 1).
    async fn next_backend_id(&self, instance_type: InstanceType) -> Result<String>;

    async fn create_instance(&self, spec: &CreateInstanceSpec) -> Result<()>;
    async fn start_instance(&self, backend_id: &str) -> Result<()>;
    async fn stop_instance(&self, backend_id: &str) -> Result<()>;
    async fn restart_instance(&self, backend_id: &str) -> Result<()>;
    async fn delete_instance(&self, backend_id: &str) -> Result<()>;

    /// Sets the SSH password. For Proxmox VMs, implementations reboot the
    /// instance after the write if it was running (see DESIGN.md open
    /// question on password-reset-reboot).
    async fn set_password(
        &self,
        backend_id: &str,
        instance_type: InstanceType,
        password: &str,
        currently_running: bool,
    ) -> Result<()>;

    async fn get_ipv4(&self, backend_id: &str) -> Result<Option<String>>;
    async fn get_ipv6(&self, backend_id: &str) -> Result<Option<String>>;

    async fn apply_port_mapping(&self, req: &PortMappingRequest) -> Result<()>;
    async fn remove_port_mapping(&self, req: &PortMappingRequest) -> Result<()>;

    async fn health_probe(&self, backend_id: &str) -> Result<bool>;

    /// Live occupancy scan of host ports in `[range_start, range_end]` via
    /// the node's `ss`/`netstat` (§4.7 "Availability"). The port allocator
    /// intersects this with a single DB query rather than scanning per port.
    async fn scan_used_ports(&self, range_start: i32, range_end: i32) -> Result<HashSet<i32>>;
}

/// Parses `ss -Htln` / `ss -Htun` style output (`State  Recv-Q  Send-Q
/// Local Address:Port  Peer Address:Port ...`) into the set of listening
/// ports within `[range_start, range_end]`. Shared by the SSH-backed
/// drivers since the command and output shape is identical on any Linux
/// node regardless of hypervisor.
pub fn parse_ss_listening_ports(output: &str, range_start: i32, range_end: i32) -> HashSet<i32> {
    let mut ports = HashSet::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // Local Address:Port is the 4th column for `ss -tln`/`ss -tun`.
        let Some(local) = fields.get(3) else {
            continue;
        };
        let Some(port_str) = local.rsplit(':').next() else {
            continue;
        };
        let Ok(port) = port_str.parse::<i32>() else {
            continue;
        };
        if port >= range_start && port <= range_end {
            ports.insert(port);
        }
    }
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ss_output_within_range() {
        let output = "State   Recv-Q  Send-Q   Local Address:Port   Peer Address:Port\n\
                       LISTEN  0       128      0.0.0.0:22           0.0.0.0:*\n\
                       LISTEN  0       128      0.0.0.0:20005        0.0.0.0:*\n\
                       LISTEN  0       128      127.0.0.1:3306       0.0.0.0:*\n";
        let ports = parse_ss_listening_ports(output, 20000, 20100);
        assert_eq!(ports.len(), 1);
        assert!(ports.contains(&20005));
    }

    #[test]
    fn ignores_malformed_lines() {
        let ports = parse_ss_listening_ports("garbage line with no colon port\n", 1, 100);
        assert!(ports.is_empty());
    }
}
