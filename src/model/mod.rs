pub mod instance;
pub mod port_mapping;
pub mod provider;
pub mod reservation;
pub mod system_image;
pub mod task;
pub mod user;

pub use instance::{Instance, InstanceStatus, InstanceType};
pub use port_mapping::{PortMapping, PortMappingStatus, Protocol};
pub use provider::{Provider, ProviderKind};
pub use reservation::ResourceReservation;
pub use system_image::SystemImage;
pub use task::{Task, TaskStatus, TaskType};
pub use user::{User, UserStatus};

/// A resource tuple as used throughout admission, quota, and reservation math.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceTuple {
    pub cpu: i32,
    pub memory_mb: i32,
    pub disk_mb: i32,
    pub bandwidth_mbps: i32,
}

impl ResourceTuple {
    pub fn new(cpu: i32, memory_mb: i32, disk_mb: i32, bandwidth_mbps: i32) -> Self {
        ResourceTuple {
            cpu,
            memory_mb,
            disk_mb,
            bandwidth_mbps,
        }
    }

    /// `cpu*4 + floor(memory/512)*2 + floor(disk/5)*1`. Stable by design; do not
    /// change without a corresponding recalculation of every stored quota row.
    pub fn weight(&self) -> i64 {
        let cpu_term = self.cpu as i64 * 4;
        let mem_term = (self.memory_mb as i64 / 512) * 2;
        let disk_term = self.disk_mb as i64 / 5;
        cpu_term + mem_term + disk_term
    }

    pub fn checked_sub(&self, other: &ResourceTuple) -> ResourceTuple {
        ResourceTuple {
            cpu: (self.cpu - other.cpu).max(0),
            memory_mb: (self.memory_mb - other.memory_mb).max(0),
            disk_mb: (self.disk_mb - other.disk_mb).max(0),
            bandwidth_mbps: (self.bandwidth_mbps - other.bandwidth_mbps).max(0),
        }
    }

    pub fn add(&self, other: &ResourceTuple) -> ResourceTuple {
        ResourceTuple {
            cpu: self.cpu + other.cpu,
            memory_mb: self.memory_mb + other.memory_mb,
            disk_mb: self.disk_mb + other.disk_mb,
            bandwidth_mbps: self.bandwidth_mbps + other.bandwidth_mbps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_matches_formula() {
        let r = ResourceTuple::new(2, 1024, 25, 100);
        // 2*4 + (1024/512)*2 + 25/5 = 8 + 4 + 5 = 17
        assert_eq!(r.weight(), 17);
    }

    #[test]
    fn weight_floors_partial_units() {
        let r = ResourceTuple::new(1, 600, 7, 0);
        // 1*4 + (600/512=1)*2 + 7/5=1 => 4+2+1=7
        assert_eq!(r.weight(), 7);
    }
}
