//! Port-mapping manager (§2.2): translates logical host->guest port mappings
//! into backend-specific side effects (LXD/Incus proxy devices, Proxmox
//! iptables DNAT, Docker native exposure) and persists the resulting rows.

use sqlx::MySqlPool;
use tracing::warn;

use crate::driver::{Driver, PortMappingRequest, PortProtocol};
use crate::error::Result;
use crate::model::{PortMapping, PortMappingStatus, Protocol, Provider};

/// A logical mapping request before it becomes a persisted row.
#[derive(Debug, Clone)]
pub struct MappingSpec {
    pub host_port: i32,
    pub host_port_end: i32,
    pub guest_port: i32,
    pub guest_port_end: i32,
    pub protocol: Protocol,
    pub is_ssh: bool,
    pub is_automatic: bool,
    pub description: Option<String>,
}

impl MappingSpec {
    pub fn port_count(&self) -> i32 {
        if self.host_port_end > self.host_port {
            self.host_port_end - self.host_port + 1
        } else {
            1
        }
    }
}

fn to_driver_protocol(protocol: Protocol) -> PortProtocol {
    match protocol {
        Protocol::Tcp => PortProtocol::Tcp,
        Protocol::Udp => PortProtocol::Udp,
        Protocol::Both => PortProtocol::Both,
    }
}

/// Applies one logical mapping against the backend and persists the row as
/// `active` on success or `failed` otherwise (§4.8.4). A failed apply does
/// not propagate as an error — the caller decides whether that fails the
/// enclosing flow.
pub async fn apply(
    pool: &MySqlPool,
    driver: &dyn Driver,
    instance_id: &str,
    provider_id: &str,
    backend_id: &str,
    private_ip: Option<&str>,
    method: &str,
    spec: &MappingSpec,
) -> Result<PortMapping> {
    let req = PortMappingRequest {
        backend_id: backend_id.to_string(),
        private_ip: private_ip.map(|s| s.to_string()),
        host_port: spec.host_port,
        host_port_end: spec.host_port_end,
        guest_port: spec.guest_port,
        guest_port_end: spec.guest_port_end,
        protocol: to_driver_protocol(spec.protocol),
    };

    let apply_result = driver.apply_port_mapping(&req).await;
    let status = match &apply_result {
        Ok(()) => PortMappingStatus::Active,
        Err(e) => {
            warn!(
                "port mapping apply failed for instance {} host_port {}: {}",
                instance_id, spec.host_port, e
            );
            PortMappingStatus::Failed
        }
    };

    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO port_mappings
            (id, instance_id, provider_id, host_port, host_port_end, guest_port, guest_port_end,
             port_count, protocol, status, is_ssh, is_automatic, port_type, mapping_method,
             ipv6_enabled, description, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'user', ?, FALSE, ?, NOW(), NOW())
        "#,
    )
    .bind(&id)
    .bind(instance_id)
    .bind(provider_id)
    .bind(spec.host_port)
    .bind(spec.host_port_end)
    .bind(spec.guest_port)
    .bind(spec.guest_port_end)
    .bind(spec.port_count())
    .bind(spec.protocol.as_str())
    .bind(status.as_str())
    .bind(spec.is_ssh)
    .bind(spec.is_automatic)
    .bind(method)
    .bind(&spec.description)
    .execute(pool)
    .await?;

    PortMapping::list_for_instance(pool, instance_id)
        .await?
        .into_iter()
        .find(|m| m.id == id)
        .ok_or_else(|| crate::error::CoreError::Internal("port mapping row vanished after insert".into()))
}

/// Best-effort backend removal followed by unconditional DB cleanup
/// (§4.8.4 "Remove"): a missing remote row or unreachable backend never
/// blocks deleting the DB record.
pub async fn remove(pool: &MySqlPool, driver: &dyn Driver, mapping: &PortMapping) -> Result<bool> {
    let req = PortMappingRequest {
        backend_id: String::new(),
        private_ip: None,
        host_port: mapping.host_port,
        host_port_end: mapping.host_port_end,
        guest_port: mapping.guest_port,
        guest_port_end: mapping.guest_port_end,
        protocol: to_driver_protocol(mapping.protocol()),
    };

    let remote_ok = driver.remove_port_mapping(&req).await.is_ok();
    if !remote_ok {
        warn!(
            "remote removal may have failed for port mapping {} (host_port {}); DB row removed regardless",
            mapping.id, mapping.host_port
        );
    }

    let deleted = PortMapping::delete(pool, &mapping.id).await?;
    Ok(deleted && remote_ok)
}

/// Default port-mapping creation on instance create under NAT modes
/// (§4.8.5): allocates a contiguous run of `provider.default_port_count`
/// ports, the first being SSH (guest 22, protocol=both), the rest 1:1
/// identity mappings, persisted in bulk (100-row batches).
pub async fn create_default_mappings(
    pool: &MySqlPool,
    driver: &dyn Driver,
    provider: &Provider,
    instance_id: &str,
    backend_id: &str,
    private_ip: Option<&str>,
) -> Result<Vec<PortMapping>> {
    let count = provider.default_port_count.max(1);
    let (start, end) = crate::port_allocator::allocate_range(pool, driver, provider, count).await?;

    let specs: Vec<MappingSpec> = (start..=end)
        .enumerate()
        .map(|(i, host_port)| {
            if i == 0 {
                MappingSpec {
                    host_port,
                    host_port_end: 0,
                    guest_port: 22,
                    guest_port_end: 0,
                    protocol: Protocol::Both,
                    is_ssh: true,
                    is_automatic: true,
                    description: Some("ssh".to_string()),
                }
            } else {
                MappingSpec {
                    host_port,
                    host_port_end: 0,
                    guest_port: host_port,
                    guest_port_end: 0,
                    protocol: Protocol::Both,
                    is_ssh: false,
                    is_automatic: true,
                    description: None,
                }
            }
        })
        .collect();

    let mut rows = Vec::with_capacity(specs.len());
    for chunk in specs.chunks(100) {
        for spec in chunk {
            let row = apply(
                pool,
                driver,
                instance_id,
                &provider.id,
                backend_id,
                private_ip,
                provider.ipv4_port_mapping_method.as_str(),
                spec,
            )
            .await?;
            rows.push(row);
        }
    }

    if let Some(ssh_row) = rows.iter().find(|m| m.is_ssh) {
        sqlx::query("UPDATE instances SET ssh_port = ? WHERE id = ?")
            .bind(ssh_row.host_port)
            .bind(instance_id)
            .execute(pool)
            .await?;
    }

    Ok(rows)
}

/// A run of contiguous 1:1 identity mappings sharing one protocol, grouped
/// so a single backend call can cover them (§4.8.3 step 7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContiguousRun {
    pub protocol: Protocol,
    pub start: i32,
    pub end: i32,
}

/// Groups `mappings` (assumed sorted by host_port within each protocol) into
/// contiguous 1:1 runs (`host == guest`, and each row's host_port is one
/// more than the previous). Non-identity or non-contiguous rows are
/// returned as singleton runs so callers fall back to per-port handling.
pub fn group_contiguous_identity_runs(mappings: &[PortMapping]) -> Vec<(ContiguousRun, Vec<&PortMapping>)> {
    let mut by_protocol: std::collections::BTreeMap<&str, Vec<&PortMapping>> =
        std::collections::BTreeMap::new();
    for m in mappings {
        by_protocol.entry(&m.protocol).or_default().push(m);
    }

    let mut runs = Vec::new();
    for (_, mut rows) in by_protocol {
        rows.sort_by_key(|m| m.host_port);
        let mut i = 0;
        while i < rows.len() {
            let protocol = rows[i].protocol();
            if !rows[i].is_identity() {
                runs.push((
                    ContiguousRun {
                        protocol,
                        start: rows[i].host_port,
                        end: rows[i].host_port,
                    },
                    vec![rows[i]],
                ));
                i += 1;
                continue;
            }

            let mut j = i + 1;
            while j < rows.len() && rows[j].is_identity() && rows[j].host_port == rows[j - 1].host_port + 1 {
                j += 1;
            }
            let group: Vec<&PortMapping> = rows[i..j].to_vec();
            runs.push((
                ContiguousRun {
                    protocol,
                    start: rows[i].host_port,
                    end: rows[j - 1].host_port,
                },
                group,
            ));
            i = j;
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn mapping(host_port: i32, guest_port: i32, is_ssh: bool) -> PortMapping {
        PortMapping {
            id: format!("pm-{host_port}"),
            instance_id: "inst-1".to_string(),
            provider_id: "prov-1".to_string(),
            host_port,
            host_port_end: 0,
            guest_port,
            guest_port_end: 0,
            port_count: 1,
            protocol: "both".to_string(),
            status: "active".to_string(),
            is_ssh,
            is_automatic: true,
            port_type: "user".to_string(),
            mapping_method: "iptables".to_string(),
            ipv6_enabled: false,
            description: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn groups_contiguous_identity_runs() {
        let rows = vec![mapping(22, 22, true), mapping(20001, 20001, false), mapping(20002, 20002, false)];
        let runs = group_contiguous_identity_runs(&rows);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].0.start, 20001);
        assert_eq!(runs[1].0.end, 20002);
        assert_eq!(runs[1].1.len(), 2);
    }

    #[test]
    fn non_identity_mapping_is_its_own_run() {
        let rows = vec![mapping(20001, 8080, false)];
        let runs = group_contiguous_identity_runs(&rows);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].1.len(), 1);
    }

    #[test]
    fn gap_breaks_the_run() {
        let rows = vec![mapping(20001, 20001, false), mapping(20003, 20003, false)];
        let runs = group_contiguous_identity_runs(&rows);
        assert_eq!(runs.len(), 2);
    }
}
