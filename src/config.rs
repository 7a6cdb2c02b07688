use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub levels: Vec<LevelLimits>,
    #[serde(default = "default_min_level_for_vm")]
    pub min_level_for_vm: i32,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub reservation_ttl_secs: Option<i64>,
    #[serde(default)]
    pub ssh: SshDefaults,
}

/// Single operator-wide SSH identity used to reach every Proxmox/LXD/Incus
/// node. The credential store proper is out of scope; this is the one
/// config-level credential the core needs.
#[derive(Debug, Clone, Deserialize)]
pub struct SshDefaults {
    #[serde(default = "default_ssh_username")]
    pub username: String,
    #[serde(default = "default_ssh_key_path")]
    pub private_key_path: String,
}

impl Default for SshDefaults {
    fn default() -> Self {
        SshDefaults {
            username: default_ssh_username(),
            private_key_path: default_ssh_key_path(),
        }
    }
}

fn default_ssh_username() -> String {
    "root".to_string()
}

fn default_ssh_key_path() -> String {
    "~/.ssh/id_rsa".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LevelLimits {
    pub level: i32,
    pub max_cpu: i32,
    pub max_memory_mb: i32,
    pub max_disk_mb: i32,
    pub max_bandwidth_mbps: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_worker_count")]
    pub default_worker_count: usize,
    #[serde(default = "default_idle_reclaim_secs")]
    pub idle_reclaim_secs: i64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            channel_capacity: default_channel_capacity(),
            default_worker_count: default_worker_count(),
            idle_reclaim_secs: default_idle_reclaim_secs(),
        }
    }
}

fn default_channel_capacity() -> usize {
    1000
}

fn default_worker_count() -> usize {
    2
}

fn default_idle_reclaim_secs() -> i64 {
    30 * 60
}

fn default_min_level_for_vm() -> i32 {
    2
}

impl FleetConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config at {}: {}", path.display(), e))?;
        let config: FleetConfig = serde_json::from_str(&data)
            .map_err(|e| anyhow!("Failed to parse config JSON at {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_default() -> Result<(Self, PathBuf)> {
        let path = resolve_config_path();
        let config = Self::load_from_path(&path)?;
        Ok((config, path))
    }

    fn validate(&self) -> Result<()> {
        if self.levels.is_empty() {
            return Err(anyhow!("config must define at least one level"));
        }
        for level in &self.levels {
            if level.level <= 0 {
                return Err(anyhow!("level must be a positive integer"));
            }
        }
        Ok(())
    }

    pub fn level_cap(&self, level: i32) -> Option<&LevelLimits> {
        self.levels.iter().find(|l| l.level == level)
    }
}

pub fn resolve_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("FLEETCTL_CONFIG_PATH") {
        return expand_path(path);
    }
    default_config_path()
}

pub(crate) fn expand_path(input: String) -> PathBuf {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(input)
}

fn default_config_path() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fleetctl")
        .join("fleetctl.json")
}

fn home_dir() -> Option<PathBuf> {
    if cfg!(windows) {
        std::env::var_os("USERPROFILE").map(PathBuf::from)
    } else {
        std::env::var_os("HOME").map(PathBuf::from)
    }
}

/// Fixed estimated-duration table keyed by (task_type, instance_type).
/// Falls back to 60s for unknown combinations.
pub fn estimated_duration_secs(task_type: &str, instance_type: Option<&str>) -> i64 {
    match (task_type, instance_type) {
        ("create_instance", Some("vm")) => 300,
        ("create_instance", Some("container")) => 180,
        ("reset", Some("vm")) => 450,
        ("reset", Some("container")) => 270,
        ("start", Some("vm")) => 90,
        ("stop", Some("vm")) => 60,
        ("restart", Some("vm")) => 150,
        ("delete", _) => 60,
        ("reset-password", _) => 30,
        _ => 60,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimated_duration_matches_spec_table() {
        assert_eq!(estimated_duration_secs("create_instance", Some("vm")), 300);
        assert_eq!(
            estimated_duration_secs("create_instance", Some("container")),
            180
        );
        assert_eq!(estimated_duration_secs("reset", Some("vm")), 450);
        assert_eq!(estimated_duration_secs("reset", Some("container")), 270);
        assert_eq!(estimated_duration_secs("start", Some("vm")), 90);
        assert_eq!(estimated_duration_secs("stop", Some("vm")), 60);
        assert_eq!(estimated_duration_secs("restart", Some("vm")), 150);
        assert_eq!(estimated_duration_secs("delete", None), 60);
        assert_eq!(estimated_duration_secs("reset-password", None), 30);
    }

    #[test]
    fn estimated_duration_falls_back_to_60_for_unknown_combinations() {
        assert_eq!(estimated_duration_secs("create_instance", None), 60);
        assert_eq!(estimated_duration_secs("start", Some("container")), 60);
        assert_eq!(estimated_duration_secs("frobnicate", Some("vm")), 60);
    }

    #[test]
    fn level_cap_finds_matching_level() {
        let config = FleetConfig {
            levels: vec![
                LevelLimits {
                    level: 1,
                    max_cpu: 2,
                    max_memory_mb: 1024,
                    max_disk_mb: 20480,
                    max_bandwidth_mbps: 100,
                },
                LevelLimits {
                    level: 3,
                    max_cpu: 8,
                    max_memory_mb: 8192,
                    max_disk_mb: 102400,
                    max_bandwidth_mbps: 1000,
                },
            ],
            min_level_for_vm: 2,
            pool: PoolConfig::default(),
            reservation_ttl_secs: None,
            ssh: SshDefaults::default(),
        };
        assert_eq!(config.level_cap(3).unwrap().max_cpu, 8);
        assert!(config.level_cap(2).is_none());
    }

    #[test]
    fn validate_rejects_empty_levels_and_nonpositive_level_numbers() {
        let empty = FleetConfig {
            levels: vec![],
            min_level_for_vm: 2,
            pool: PoolConfig::default(),
            reservation_ttl_secs: None,
            ssh: SshDefaults::default(),
        };
        assert!(empty.validate().is_err());

        let bad_level = FleetConfig {
            levels: vec![LevelLimits {
                level: 0,
                max_cpu: 1,
                max_memory_mb: 1,
                max_disk_mb: 1,
                max_bandwidth_mbps: 1,
            }],
            min_level_for_vm: 2,
            pool: PoolConfig::default(),
            reservation_ttl_secs: None,
            ssh: SshDefaults::default(),
        };
        assert!(bad_level.validate().is_err());
    }

    #[test]
    fn expand_path_substitutes_home_prefix() {
        std::env::set_var("HOME", "/home/tester");
        let expanded = expand_path("~/.fleetctl/fleetctl.json".to_string());
        assert_eq!(expanded, PathBuf::from("/home/tester/.fleetctl/fleetctl.json"));

        let unchanged = expand_path("/etc/fleetctl/fleetctl.json".to_string());
        assert_eq!(unchanged, PathBuf::from("/etc/fleetctl/fleetctl.json"));
    }
}
