//! # ssm-server
//!
//! Game server instances for the Simply Servers manager:
//! - Instance: lifecycle coordinator and its state machine
//! - Container: engine abstraction, Docker engine, per-instance driver
//! - Health: periodic liveness probe with crash recovery
//! - Query: game status protocols the probe speaks
//! - Sandbox: file access bounded to the instance root
//! - Executor: command stacks run as the instance's OS user

pub mod account;
pub mod catalog;
pub mod container;
pub mod context;
pub mod definition;
pub mod event;
pub mod executor;
pub mod health;
pub mod instance;
pub mod query;
pub mod record;
pub mod sandbox;
pub mod state;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// ============================================================================
// Definitions and records
// ============================================================================
pub use definition::{
    GameDefinition, HealthProbe, LogFile, LoggingPolicy, PluginDefinition, ShellCommand,
    VerifyRule,
};
pub use record::{record_file_name, validate_id, BuildProfile, InstanceRecord};

// ============================================================================
// Instance
// ============================================================================
pub use context::{ServerContext, SERVERS_DIR};
pub use event::{ServerEvent, Status, StatusSnapshot};
pub use instance::{Instance, InstanceInfo};
pub use state::InstanceState;

// ============================================================================
// Collaborators
// ============================================================================
pub use account::{shell_escape, AccountProvisioner, Owner};
pub use catalog::{Catalog, PluginCatalog, GAMES_DIR, PLUGINS_DIR};
pub use container::{ContainerConfig, ContainerDriver, ContainerEngine, DockerEngine};
pub use executor::{CommandSpec, ExitResult, ProcessSpawner, ShellExecutor, SystemSpawner};
pub use health::{HealthMonitor, QueryProbe, TickOutcome, FAILURE_THRESHOLD};
pub use query::{minecraft_status, GameQueryProbe};
pub use sandbox::{DirEntry, Sandbox, IDENTITY_FILE};
