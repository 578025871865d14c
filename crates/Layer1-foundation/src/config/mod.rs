//! Config - manager settings
//!
//! - `manager.rs` - ManagerConfig and its sections

mod manager;

pub use manager::{
    ApiConfig, DockerConfig, ManagerConfig, PathsConfig, SandboxConfig, ServersConfig,
    SocketConfig, TimeoutConfig, MANAGER_CONFIG_FILE,
};
