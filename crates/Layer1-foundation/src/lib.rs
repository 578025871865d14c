//! # ssm-foundation
//!
//! Foundation layer for the Simply Servers manager:
//! - Error: shared error taxonomy and reason codes
//! - Config: `ManagerConfig` loaded from `config.json`
//! - Event: typed publish/subscribe bus
//! - Storage: JSON document store

pub mod config;
pub mod error;
pub mod event;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{ActionCode, Error, Result};

// ============================================================================
// Config
// ============================================================================
pub use config::{
    ApiConfig, DockerConfig, ManagerConfig, PathsConfig, SandboxConfig, ServersConfig,
    SocketConfig, TimeoutConfig, MANAGER_CONFIG_FILE,
};

// ============================================================================
// Event
// ============================================================================
pub use event::{EventBus, EventBusConfig, EventId, EventListener, EventRecord, ListenerId};

// ============================================================================
// Storage
// ============================================================================
pub use storage::JsonStore;
