//! Container engine abstraction

use super::config::ContainerConfig;
use async_trait::async_trait;
use futures::Stream;
use ssm_foundation::Result;
use std::pin::Pin;
use tokio::io::AsyncWrite;

/// Output chunks from a container stream, decoded as UTF-8 (lossy)
pub type OutputStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Writable stdin of an attached process
pub type ProcessInput = Pin<Box<dyn AsyncWrite + Send>>;

/// An interactive process started inside a container
pub struct ExecSession {
    pub input: ProcessInput,
    pub output: OutputStream,
}

/// Docker-compatible engine operations, scoped by container name
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Engine name (for debugging)
    fn name(&self) -> &'static str;

    async fn ping(&self) -> Result<()>;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn create(&self, config: &ContainerConfig) -> Result<()>;

    async fn start(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;

    async fn remove(&self, name: &str) -> Result<()>;

    async fn is_running(&self, name: &str) -> Result<bool>;

    /// Run `cmd` with an interactive tty and attached stdin
    async fn exec(&self, name: &str, cmd: Vec<String>) -> Result<ExecSession>;

    /// Attach to the container's primary process output; the stream ends when it exits
    async fn attach(&self, name: &str) -> Result<OutputStream>;
}
