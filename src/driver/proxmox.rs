//! Proxmox VE driver: SSH to the node and drive `qm`/`pct`, parsing their
//! textual output. No native Proxmox API client is used; the hypervisor
//! command surface is text I/O over SSH.

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

/// VMIDs `100..=177` are VMs, `178..=255` are containers (§4.8.1 step 1).
/// Because Proxmox shares one id namespace across `qm`/`pct`, the instance
/// kind for an existing backend id can always be recovered from its value,
/// so the `Driver` trait doesn't need to carry it through every call.
const VM_ID_RANGE: std::ops::RangeInclusive<i32> = 100..=177;
const CT_ID_RANGE: std::ops::RangeInclusive<i32> = 178..=255;

pub struct ProxmoxDriver {
    ssh: Arc<SshSession>,
}

impl ProxmoxDriver {
    pub fn new(ssh: Arc<SshSession>) -> Self {
        ProxmoxDriver { ssh }
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

    fn kind_of_id(vmid: i32) -> InstanceType {
        if VM_ID_RANGE.contains(&vmid) {
            InstanceType::Vm
        } else {
            InstanceType::Container
        }
    }

    /// `qm list`: `VMID NAME STATUS MEM(MB) BOOTDISK(GB) PID`.
    fn parse_qm_list(output: &str) -> Vec<BackendInstanceInfo> {
        output
            .lines()
            .skip(1)
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < 3 {
                    return None;
                }
                Some(BackendInstanceInfo {
                    backend_id: fields[0].to_string(),
                    name: fields[1].to_string(),
                    status: fields[2].to_string(),
                })
            })
            .collect()
    }

    /// `pct list` has 2-4 fields depending on whether the lock column is
    /// present; name defaults to the last non-empty field, or the VMID if
    /// no distinct name field exists (§6).
    fn parse_pct_list(output: &str) -> Vec<BackendInstanceInfo> {
        output
            .lines()
            .skip(1)
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                let backend_id = fields.first()?.to_string();
                let status = fields.get(1).unwrap_or(&"unknown").to_string();
                let name = fields
                    .last()
                    .filter(|f| **f != backend_id)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| backend_id.clone());
                Some(BackendInstanceInfo {
                    backend_id,
                    name,
                    status,
                })
            })
            .collect()
    }

    async fn used_vmids(&self) -> Result<HashSet<i32>> {
        let mut used = HashSet::new();
        for info in Self::parse_qm_list(&self.exec("qm list").await?) {
            if let Ok(id) = info.backend_id.parse() {
                used.insert(id);
            }
        }
        for info in Self::parse_pct_list(&self.exec("pct list").await?) {
            if let Ok(id) = info.backend_id.parse() {
                used.insert(id);
            }
        }
        Ok(used)
    }

    fn instance_ip(vmid: i32) -> String {
        format!("172.16.1.{vmid}")
    }

    async fn has_kvm(&self) -> bool {
        self.exec("test -r /dev/kvm && echo yes || echo no")
            .await
            .map(|out| out.trim() == "yes")
            .unwrap_or(false)
    }

    async fn arch(&self) -> String {
        self.exec("uname -m")
            .await
            .unwrap_or_else(|_| "x86_64".to_string())
            .trim()
            .to_string()
    }

    async fn create_vm(&self, spec: &CreateInstanceSpec) -> Result<()> {
        let vmid = &spec.backend_id;
        let kvm_available = self.has_kvm().await;
        let cpu_type = if kvm_available {
            "host"
        } else {
            match self.arch().await.as_str() {
                "aarch64" => "qemu32",
                _ => "qemu64",
            }
        };

        self.exec(&format!(
            "qm create {vmid} --name {name} --memory {mem} --cores {cpu} --cpu {cpu_type} \
             --kvm {kvm} --net0 virtio,bridge=vmbr0 --scsihw virtio-scsi-pci",
            vmid = vmid,
            name = spec.name,
            mem = spec.memory_mb,
            cpu = spec.cpu,
            cpu_type = cpu_type,
            kvm = if kvm_available { 1 } else { 0 },
        ))
        .await?;

        self.exec(&format!(
            "qm importdisk {vmid} /var/lib/vz/template/cache/{image} {pool}",
            vmid = vmid,
            image = spec.image,
            pool = spec.storage_pool,
        ))
        .await?;

        self.exec(&format!(
            "qm set {vmid} --scsi0 {pool}:vm-{vmid}-disk-0",
            vmid = vmid,
            pool = spec.storage_pool,
        ))
        .await?;

        // Target disk is always >= the freshly imported template's size on
        // first create, so resize never needs the "only if target > current"
        // guard from §4.8.1 step 3 here (that guard applies on reset, where
        // the disk may already have been grown once).
        let disk_gb = (spec.disk_mb as f64 / 1024.0).ceil().max(1.0) as i64;
        self.exec(&format!("qm resize {vmid} scsi0 {disk_gb}G"))
            .await?;

        if let Some(password) = &spec.password {
            self.exec(&format!(
                "qm set {vmid} --ide1 {pool}:cloudinit --ciuser root --cipassword {password}",
                vmid = vmid,
                pool = spec.storage_pool,
                password = password,
            ))
            .await?;
        }

        let vmid_n: i32 = vmid.parse().unwrap_or(0);
        self.exec(&format!(
            "qm set {vmid} --ipconfig0 ip={ip}/24,gw=172.16.1.1",
            vmid = vmid,
            ip = Self::instance_ip(vmid_n),
        ))
        .await?;
        self.exec(&format!("qm set {vmid} --boot order=scsi0"))
            .await?;
        Ok(())
    }

    async fn create_container(&self, spec: &CreateInstanceSpec) -> Result<()> {
        let vmid = &spec.backend_id;
        let vmid_n: i32 = vmid.parse().unwrap_or(0);
        let disk_gb = (spec.disk_mb as f64 / 1024.0).ceil().max(1.0) as i64;

        self.exec(&format!(
            "pct create {vmid} {pool}:vztmpl/{image} --hostname {name} --memory {mem} \
             --cores {cpu} --rootfs {pool}:{disk_gb} --features nesting=1 \
             --net0 name=eth0,bridge=vmbr0,ip={ip}/24,gw=172.16.1.1",
            vmid = vmid,
            pool = spec.storage_pool,
            image = spec.image,
            name = spec.name,
            mem = spec.memory_mb,
            cpu = spec.cpu,
            disk_gb = disk_gb,
            ip = Self::instance_ip(vmid_n),
        ))
        .await?;

        if let Some(password) = &spec.password {
            self.exec(&format!(
                "pct exec {vmid} -- bash -c \"echo 'root:{password}' | chpasswd\""
            ))
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for ProxmoxDriver {
    async fn list_instances(&self) -> Result<Vec<BackendInstanceInfo>> {
        let mut all = Self::parse_qm_list(&self.exec("qm list").await?);
        all.extend(Self::parse_pct_list(&self.exec("pct list").await?));
        Ok(all)
    }

    async fn next_backend_id(&self, instance_type: InstanceType) -> Result<String> {
        let used = self.used_vmids().await?;
        let range = if instance_type.is_vm() {
            VM_ID_RANGE
        } else {
            CT_ID_RANGE
        };
        range
            .clone()
            .find(|id| !used.contains(id))
            .map(|id| id.to_string())
            .ok_or_else(|| {
                CoreError::CapacityUnavailable(format!(
                    "no free proxmox id in range for {instance_type:?}"
                ))
            })
    }

    async fn create_instance(&self, spec: &CreateInstanceSpec) -> Result<()> {
        match spec.instance_type {
            InstanceType::Vm => self.create_vm(spec).await?,
            InstanceType::Container => self.create_container(spec).await?,
        }
        info!(
            "created proxmox {:?} {}",
            spec.instance_type, spec.backend_id
        );
        Ok(())
    }

    async fn start_instance(&self, backend_id: &str) -> Result<()> {
        let vmid: i32 = backend_id
            .parse()
            .map_err(|_| CoreError::BackendError(format!("invalid vmid {backend_id}")))?;
        match Self::kind_of_id(vmid) {
            InstanceType::Vm => self.exec(&format!("qm start {backend_id}")).await?,
            InstanceType::Container => self.exec(&format!("pct start {backend_id}")).await?,
        };
        // Unconditional settle wait before the caller's first status check
        // (§9 open question: unclear whether this is backend-command
        // serialization or a coincidental timing mitigation; kept literal).
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        Ok(())
    }

    async fn stop_instance(&self, backend_id: &str) -> Result<()> {
        let vmid: i32 = backend_id
            .parse()
            .map_err(|_| CoreError::BackendError(format!("invalid vmid {backend_id}")))?;
        match Self::kind_of_id(vmid) {
            InstanceType::Vm => self.exec(&format!("qm stop {backend_id}")).await?,
            InstanceType::Container => self.exec(&format!("pct stop {backend_id}")).await?,
        };
        Ok(())
    }

    async fn restart_instance(&self, backend_id: &str) -> Result<()> {
        let vmid: i32 = backend_id
            .parse()
            .map_err(|_| CoreError::BackendError(format!("invalid vmid {backend_id}")))?;
        match Self::kind_of_id(vmid) {
            InstanceType::Vm => self.exec(&format!("qm reboot {backend_id}")).await?,
            InstanceType::Container => self.exec(&format!("pct reboot {backend_id}")).await?,
        };
        Ok(())
    }

    async fn delete_instance(&self, backend_id: &str) -> Result<()> {
        let vmid: i32 = backend_id
            .parse()
            .map_err(|_| CoreError::BackendError(format!("invalid vmid {backend_id}")))?;
        match Self::kind_of_id(vmid) {
            InstanceType::Vm => self.exec(&format!("qm destroy {backend_id} --purge")).await?,
            InstanceType::Container => {
                self.exec(&format!("pct destroy {backend_id} --purge")).await?
            }
        };
        Ok(())
    }

    async fn set_password(
        &self,
        backend_id: &str,
        instance_type: InstanceType,
        password: &str,
        currently_running: bool,
    ) -> Result<()> {
        match instance_type {
            InstanceType::Vm => {
                self.exec(&format!(
                    "qm set {backend_id} --cipassword {password}"
                ))
                .await?;
                // Cloud-init only re-applies credentials on boot; reboot if
                // the instance is already running. Unclear whether every
                // image honors this, kept as a literal unconditional reboot.
                if currently_running {
                    self.exec(&format!("qm reboot {backend_id}")).await?;
                }
            }
            InstanceType::Container => {
                self.exec(&format!(
                    "pct exec {backend_id} -- bash -c \"echo 'root:{password}' | chpasswd\""
                ))
                .await?;
            }
        }
        Ok(())
    }

    async fn get_ipv4(&self, backend_id: &str) -> Result<Option<String>> {
        let vmid: i32 = backend_id
            .parse()
            .map_err(|_| CoreError::BackendError(format!("invalid vmid {backend_id}")))?;
        Ok(Some(Self::instance_ip(vmid)))
    }

    async fn get_ipv6(&self, _backend_id: &str) -> Result<Option<String>> {
        // IPv6 attachment is a second interface on a dedicated bridge,
        // configured only for network_type variants that include ipv6;
        // the core's flow layer decides whether to ask for one at all.
        Ok(None)
    }

    async fn apply_port_mapping(&self, req: &PortMappingRequest) -> Result<()> {
        let protocols: &[&str] = match req.protocol {
            PortProtocol::Tcp => &["tcp"],
            PortProtocol::Udp => &["udp"],
            PortProtocol::Both => &["tcp", "udp"],
        };
        let private_ip = req
            .private_ip
            .clone()
            .ok_or_else(|| CoreError::BackendError("no private ip for DNAT target".to_string()))?;

        for proto in protocols {
            self.exec(&format!(
                "iptables -t nat -A PREROUTING -p {proto} --dport {host_port} \
                 -j DNAT --to-destination {ip}:{guest_port}",
                proto = proto,
                host_port = req.host_port,
                ip = private_ip,
                guest_port = req.guest_port,
            ))
            .await?;
        }
        Ok(())
    }

    async fn remove_port_mapping(&self, req: &PortMappingRequest) -> Result<()> {
        let protocols: &[&str] = match req.protocol {
            PortProtocol::Tcp => &["tcp"],
            PortProtocol::Udp => &["udp"],
            PortProtocol::Both => &["tcp", "udp"],
        };
        let private_ip = req.private_ip.clone().unwrap_or_default();

        for proto in protocols {
            // Best-effort: a missing rule returns non-zero from iptables but
            // that must not fail the whole remove flow (§4.8.4).
            let _ = self
                .exec(&format!(
                    "iptables -t nat -D PREROUTING -p {proto} --dport {host_port} \
                     -j DNAT --to-destination {ip}:{guest_port}",
                    proto = proto,
                    host_port = req.host_port,
                    ip = private_ip,
                    guest_port = req.guest_port,
                ))
                .await;
        }
        Ok(())
    }

    async fn health_probe(&self, backend_id: &str) -> Result<bool> {
        let vmid: i32 = backend_id
            .parse()
            .map_err(|_| CoreError::BackendError(format!("invalid vmid {backend_id}")))?;
        let output = match Self::kind_of_id(vmid) {
            InstanceType::Vm => self.exec(&format!("qm status {backend_id}")).await?,
            InstanceType::Container => self.exec(&format!("pct status {backend_id}")).await?,
        };
        Ok(output.contains("status: running"))
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
    fn qm_list_parses_fields() {
        let output = "VMID NAME STATUS MEM(MB) BOOTDISK(GB) PID\n\
                       101  web1  running 2048 20 1234\n";
        let parsed = ProxmoxDriver::parse_qm_list(output);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].backend_id, "101");
        assert_eq!(parsed[0].status, "running");
    }

    #[test]
    fn pct_list_handles_missing_lock_column() {
        let output = "VMID Status Lock Name\n\
                       201  running      ct1\n\
                       202  stopped\n";
        let parsed = ProxmoxDriver::parse_pct_list(output);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "ct1");
        // No distinct name field: falls back to the VMID.
        assert_eq!(parsed[1].name, "202");
    }

    #[test]
    fn kind_of_id_splits_by_range() {
        assert_eq!(ProxmoxDriver::kind_of_id(150), InstanceType::Vm);
        assert_eq!(ProxmoxDriver::kind_of_id(200), InstanceType::Container);
    }
}
