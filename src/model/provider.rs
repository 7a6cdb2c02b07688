use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Proxmox,
    Lxd,
    Incus,
    Docker,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Proxmox => "proxmox",
            ProviderKind::Lxd => "lxd",
            ProviderKind::Incus => "incus",
            ProviderKind::Docker => "docker",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "proxmox" => Some(ProviderKind::Proxmox),
            "lxd" => Some(ProviderKind::Lxd),
            "incus" => Some(ProviderKind::Incus),
            "docker" => Some(ProviderKind::Docker),
            _ => None,
        }
    }
}

/// Per-level resource caps a provider may override for a given instance kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelOverride {
    pub level: i32,
    pub max_cpu: Option<i32>,
    pub max_memory_mb: Option<i32>,
    pub max_disk_mb: Option<i32>,
    pub max_bandwidth_mbps: Option<i32>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub endpoint: String,
    pub architecture: String,
    pub container_enabled: bool,
    pub vm_enabled: bool,

    pub node_cpu_cores: i32,
    pub node_memory_total: i32,
    pub node_disk_total: i32,

    pub used_cpu_cores: i32,
    pub used_memory: i32,
    pub used_disk: i32,
    pub container_count: i32,
    pub vm_count: i32,

    pub max_container_instances: i32,
    pub max_vm_instances: i32,

    pub container_limit_cpu: bool,
    pub container_limit_memory: bool,
    pub container_limit_disk: bool,
    pub vm_limit_cpu: bool,
    pub vm_limit_memory: bool,
    pub vm_limit_disk: bool,

    pub port_range_start: i32,
    pub port_range_end: i32,
    pub next_available_port: i32,
    pub default_port_count: i32,

    pub network_type: String,
    pub ipv4_port_mapping_method: String,

    /// JSON-encoded `Vec<LevelOverride>`; empty array when absent.
    pub level_limits: serde_json::Value,

    pub enable_traffic_control: bool,
    pub traffic_limited: bool,
    pub count_cache_expiry: i64,
}

impl Provider {
    pub fn kind(&self) -> Option<ProviderKind> {
        ProviderKind::from_db_value(&self.kind)
    }

    pub fn level_override(&self, level: i32) -> Option<LevelOverride> {
        let overrides: Vec<LevelOverride> =
            serde_json::from_value(self.level_limits.clone()).unwrap_or_default();
        overrides.into_iter().find(|o| o.level == level)
    }

    /// Whether the given resource dimension is limited (admission-checked,
    /// decremented from provider usage counters) for this instance kind. The
    /// stored `container_limit_*`/`vm_limit_*` columns carry this directly;
    /// `false` means the provider over-commits that dimension.
    pub fn is_limited(&self, resource: Resource, instance_is_vm: bool) -> bool {
        if instance_is_vm {
            match resource {
                Resource::Cpu => self.vm_limit_cpu,
                Resource::Memory => self.vm_limit_memory,
                Resource::Disk => self.vm_limit_disk,
                Resource::Bandwidth => true,
            }
        } else {
            match resource {
                Resource::Cpu => self.container_limit_cpu,
                Resource::Memory => self.container_limit_memory,
                Resource::Disk => self.container_limit_disk,
                Resource::Bandwidth => true,
            }
        }
    }

    /// Inverse of `is_limited`: true when this provider over-commits the
    /// resource for the given instance kind (disables admission checking and
    /// counter bookkeeping for it).
    pub fn overcommits(&self, resource: Resource, instance_is_vm: bool) -> bool {
        !self.is_limited(resource, instance_is_vm)
    }

    pub async fn fetch_for_update(
        tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
        provider_id: &str,
    ) -> Result<Option<Provider>, sqlx::Error> {
        sqlx::query_as::<_, Provider>("SELECT * FROM providers WHERE id = ? FOR UPDATE")
            .bind(provider_id)
            .fetch_optional(&mut **tx)
            .await
    }

    pub async fn fetch_by_id(
        pool: &sqlx::MySqlPool,
        provider_id: &str,
    ) -> Result<Option<Provider>, sqlx::Error> {
        sqlx::query_as::<_, Provider>("SELECT * FROM providers WHERE id = ?")
            .bind(provider_id)
            .fetch_optional(pool)
            .await
    }
}

/// `container_limit_*`/`vm_limit_*` are **true** when the provider's cap
/// for that resource/kind participates in admission and usage bookkeeping;
/// **false** means the provider over-commits that dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Cpu,
    Memory,
    Disk,
    Bandwidth,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_with(level_limits: serde_json::Value, overcommit_container_cpu: bool) -> Provider {
        Provider {
            id: "p1".into(),
            name: "test".into(),
            kind: "lxd".into(),
            endpoint: "10.0.0.1".into(),
            architecture: "x86_64".into(),
            container_enabled: true,
            vm_enabled: true,
            node_cpu_cores: 32,
            node_memory_total: 65536,
            node_disk_total: 1_000_000,
            used_cpu_cores: 0,
            used_memory: 0,
            used_disk: 0,
            container_count: 0,
            vm_count: 0,
            max_container_instances: 0,
            max_vm_instances: 0,
            container_limit_cpu: !overcommit_container_cpu,
            container_limit_memory: true,
            container_limit_disk: true,
            vm_limit_cpu: true,
            vm_limit_memory: true,
            vm_limit_disk: true,
            port_range_start: 20000,
            port_range_end: 21000,
            next_available_port: 20000,
            default_port_count: 11,
            network_type: "nat_ipv4".into(),
            ipv4_port_mapping_method: "device_proxy".into(),
            level_limits,
            enable_traffic_control: false,
            traffic_limited: false,
            count_cache_expiry: 0,
        }
    }

    #[test]
    fn level_override_finds_matching_level_only() {
        let provider = provider_with(
            serde_json::json!([
                {"level": 2, "max_cpu": 4, "max_memory_mb": null, "max_disk_mb": null, "max_bandwidth_mbps": null},
                {"level": 3, "max_cpu": 8, "max_memory_mb": 4096, "max_disk_mb": null, "max_bandwidth_mbps": null},
            ]),
            false,
        );
        assert_eq!(provider.level_override(2).unwrap().max_cpu, Some(4));
        assert_eq!(provider.level_override(3).unwrap().max_memory_mb, Some(4096));
        assert!(provider.level_override(5).is_none());
    }

    #[test]
    fn level_override_defaults_to_empty_on_malformed_json() {
        let provider = provider_with(serde_json::json!("not-an-array"), false);
        assert!(provider.level_override(1).is_none());
    }

    #[test]
    fn is_limited_and_overcommits_are_inverse_per_kind() {
        let provider = provider_with(serde_json::json!([]), true);
        // container cpu over-committed
        assert!(!provider.is_limited(Resource::Cpu, false));
        assert!(provider.overcommits(Resource::Cpu, false));
        // vm cpu still limited
        assert!(provider.is_limited(Resource::Cpu, true));
        assert!(!provider.overcommits(Resource::Cpu, true));
    }

    #[test]
    fn bandwidth_is_always_limited_regardless_of_flags() {
        let provider = provider_with(serde_json::json!([]), true);
        assert!(provider.is_limited(Resource::Bandwidth, false));
        assert!(provider.is_limited(Resource::Bandwidth, true));
        assert!(!provider.overcommits(Resource::Bandwidth, false));
    }
}
