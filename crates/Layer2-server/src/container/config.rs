//! Container configuration for one instance
//!
//! Resource limits and the security profile are fixed by the manager; the
//! instance only chooses the build profile, port and game image.

use crate::record::BuildProfile;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Where the sandbox root appears inside the container
pub const CONTAINER_HOME: &str = "/home/container";

/// Where the shared static directory appears inside the container
pub const CONTAINER_STATIC: &str = "/opt/ss-static";

/// Resource limits derived from a build profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Hard memory limit in bytes
    pub memory: i64,
    /// Soft reservation in bytes
    pub memory_reservation: i64,
    /// -1 is unlimited swap
    pub memory_swap: i64,
    /// Microseconds per period; -1 is unlimited
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub cpu_shares: i64,
    pub blkio_weight: u16,
}

impl ResourceLimits {
    pub fn from_build(build: &BuildProfile) -> Self {
        let memory = (build.mem as i64).saturating_mul(1_000_000);
        Self {
            memory,
            memory_reservation: memory,
            memory_swap: -1,
            cpu_quota: if build.cpu > 0 {
                i64::from(build.cpu) * 1000
            } else {
                -1
            },
            cpu_period: 100_000,
            cpu_shares: 1024,
            blkio_weight: build.io,
        }
    }
}

/// Volume mount configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub read_only: bool,
}

impl VolumeMount {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host.into(),
            container_path: container.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Security profile applied to every instance container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityProfile {
    pub drop_caps: Vec<String>,
    pub no_new_privileges: bool,
    pub read_only_rootfs: bool,
}

impl Default for SecurityProfile {
    fn default() -> Self {
        Self {
            drop_caps: [
                "setpcap",
                "mknod",
                "audit_write",
                "net_raw",
                "dac_override",
                "fowner",
                "fsetid",
                "net_bind_service",
                "sys_chroot",
                "setfcap",
            ]
            .iter()
            .map(|c| c.to_string())
            .collect(),
            no_new_privileges: true,
            read_only_rootfs: true,
        }
    }
}

/// Rotation for the engine's own container log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRotation {
    pub max_size: String,
    pub max_files: u32,
}

impl Default for LogRotation {
    fn default() -> Self {
        Self {
            max_size: "5m".to_string(),
            max_files: 1,
        }
    }
}

/// Container configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container name; the instance id
    pub name: String,
    pub image: String,
    /// Numeric user to run as
    pub user: Option<String>,
    pub volumes: Vec<VolumeMount>,
    pub limits: ResourceLimits,
    pub security: SecurityProfile,
    /// Published on the same host port, TCP and UDP
    pub port: u16,
    /// Mount point to tmpfs options
    pub tmpfs: HashMap<String, String>,
    pub dns: Vec<String>,
    pub log_rotation: LogRotation,
}

impl ContainerConfig {
    pub fn new(name: impl Into<String>, image: impl Into<String>, port: u16, build: &BuildProfile) -> Self {
        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), "rw,exec,nosuid,size=50M".to_string());

        Self {
            name: name.into(),
            image: image.into(),
            user: None,
            volumes: Vec::new(),
            limits: ResourceLimits::from_build(build),
            security: SecurityProfile::default(),
            port,
            tmpfs,
            dns: vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()],
            log_rotation: LogRotation::default(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_volume(mut self, mount: VolumeMount) -> Self {
        self.volumes.push(mount);
        self
    }

    /// `<port>/tcp` and `<port>/udp`
    pub fn port_keys(&self) -> [String; 2] {
        [format!("{}/tcp", self.port), format!("{}/udp", self.port)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_from_build() {
        let limits = ResourceLimits::from_build(&BuildProfile {
            io: 500,
            cpu: 150,
            mem: 2048,
        });
        assert_eq!(limits.memory, 2_048_000_000);
        assert_eq!(limits.memory_reservation, limits.memory);
        assert_eq!(limits.memory_swap, -1);
        assert_eq!(limits.cpu_quota, 150_000);
        assert_eq!(limits.cpu_period, 100_000);
        assert_eq!(limits.blkio_weight, 500);
    }

    #[test]
    fn test_zero_cpu_is_unlimited() {
        let limits = ResourceLimits::from_build(&BuildProfile {
            io: 10,
            cpu: 0,
            mem: 512,
        });
        assert_eq!(limits.cpu_quota, -1);
    }

    #[test]
    fn test_fixed_profile() {
        let config = ContainerConfig::new("alice", "ssjava", 25565, &BuildProfile::default());
        assert_eq!(config.port_keys(), ["25565/tcp".to_string(), "25565/udp".to_string()]);
        assert_eq!(config.tmpfs["/tmp"], "rw,exec,nosuid,size=50M");
        assert_eq!(config.security.drop_caps.len(), 10);
        assert!(config.security.read_only_rootfs);
        assert_eq!(config.dns, vec!["8.8.8.8", "8.8.4.4"]);
    }
}
