//! Manager Config - settings shared by every server instance

use crate::storage::JsonStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name
pub const MANAGER_CONFIG_FILE: &str = "config.json";

// ============================================================================
// Manager Config
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerConfig {
    #[serde(default)]
    pub servers: ServersConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub socket: SocketConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub docker: DockerConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,
}

impl ManagerConfig {
    /// Default config location (`<config dir>/ssmanager/config.json`)
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Cannot find config directory".to_string()))?;
        Ok(dir.join("ssmanager").join(MANAGER_CONFIG_FILE))
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| MANAGER_CONFIG_FILE.to_string());

        let config: ManagerConfig = JsonStore::new(dir)
            .load_optional(&filename)?
            .ok_or_else(|| Error::Config(format!("Config file not found: {}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api.secret.trim().is_empty() {
            return Err(Error::Config("api.secret must be set".to_string()));
        }
        if self.servers.min_port == 0 || self.servers.min_port > self.servers.max_port {
            return Err(Error::Config(format!(
                "invalid port range {}-{}",
                self.servers.min_port, self.servers.max_port
            )));
        }
        if self.servers.ping_time == 0 {
            return Err(Error::Config("servers.pingTime must be positive".to_string()));
        }
        Ok(())
    }

    /// Store rooted at the storage directory
    pub fn storage(&self) -> JsonStore {
        JsonStore::new(&self.paths.storage)
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServersConfig {
    /// Health probe interval in milliseconds
    pub ping_time: u64,
    pub min_port: u16,
    pub max_port: u16,
}

impl Default for ServersConfig {
    fn default() -> Self {
        Self {
            ping_time: 10_000,
            min_port: 25565,
            max_port: 25665,
        }
    }
}

impl ServersConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_time)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiConfig {
    pub addr: String,
    pub port: u16,
    /// Shared secret for API and telemetry handshakes
    pub secret: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0".to_string(),
            port: 8443,
            secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SocketConfig {
    /// Upload limit in megabytes
    pub max_file_size: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self { max_file_size: 100 }
    }
}

impl SocketConfig {
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_file_size * 1_000_000
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathsConfig {
    /// Holds `servers/`, `games/` and `plugins/`
    pub storage: PathBuf,
    /// Parent of every instance home directory
    pub home_root: PathBuf,
    /// Account provisioning scripts
    pub scripts: PathBuf,
    /// Shared read-only assets mounted into every container
    pub static_assets: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            storage: PathBuf::from("/opt/ssmanager/storage"),
            home_root: PathBuf::from("/home"),
            scripts: PathBuf::from("/opt/ssmanager/bashScripts"),
            static_assets: PathBuf::from("/opt/ss-static"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DockerConfig {
    pub socket_path: String,
    /// Container type tag (`dockerType`) to pre-built image name
    pub images: HashMap<String, String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        let mut images = HashMap::new();
        images.insert("Java".to_string(), "ssjava".to_string());
        Self {
            socket_path: "/var/run/docker.sock".to_string(),
            images,
        }
    }
}

impl DockerConfig {
    pub fn image_for(&self, container_type: &str) -> Option<&str> {
        self.images.get(container_type).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
    /// Per command in an install/update/plugin stack
    pub shell_secs: u64,
    /// Per container engine call
    pub engine_secs: u64,
    /// Per health probe
    pub probe_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            shell_secs: 1800,
            engine_secs: 120,
            probe_secs: 5,
        }
    }
}

impl TimeoutConfig {
    pub fn shell(&self) -> Duration {
        Duration::from_secs(self.shell_secs)
    }

    pub fn engine(&self) -> Duration {
        Duration::from_secs(self.engine_secs)
    }

    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxConfig {
    /// Largest file served for in-browser editing
    pub max_edit_bytes: u64,
    /// Chown sandbox files and run containers as the instance account
    pub manage_ownership: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_edit_bytes: 1_000_000,
            manage_ownership: true,
        }
    }
}
