//! Container layer - engine abstraction, Docker implementation, per-instance driver

mod config;
mod docker;
mod driver;
mod engine;
mod tail;

pub use config::{
    ContainerConfig, LogRotation, ResourceLimits, SecurityProfile, VolumeMount, CONTAINER_HOME,
    CONTAINER_STATIC,
};
pub use docker::{to_engine_config, DockerEngine};
pub use driver::{render_start_command, ContainerDriver};
pub use engine::{ContainerEngine, ExecSession, OutputStream, ProcessInput};
pub use tail::{LogTail, TAIL_INTERVAL};
