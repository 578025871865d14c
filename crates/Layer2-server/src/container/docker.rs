//! Docker engine - `ContainerEngine` over the Docker API

use super::config::ContainerConfig;
use super::engine::{ContainerEngine, ExecSession, OutputStream};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, HostConfigLogConfig, Mount, MountTypeEnum, PortBinding};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::{Stream, StreamExt};
use ssm_foundation::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

pub struct DockerEngine {
    docker: Docker,

    /// Per-call limit for control requests (not for attached streams)
    timeout: Duration,
}

impl DockerEngine {
    /// Connect to the engine's Unix socket
    pub fn connect(socket_path: &str, call_timeout: Duration) -> Result<Self> {
        let docker = Docker::connect_with_unix(socket_path, call_timeout.as_secs(), API_DEFAULT_VERSION)
            .map_err(|e| Error::Engine(format!("Failed to connect to {}: {}", socket_path, e)))?;
        Ok(Self {
            docker,
            timeout: call_timeout,
        })
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, BollardError>>,
    {
        match timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::Engine(format!("{}: {}", op, e))),
            Err(_) => Err(Error::Timeout(format!(
                "engine {} did not answer within {}s",
                op,
                self.timeout.as_secs()
            ))),
        }
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == 404
    )
}

fn decode_output<S>(stream: S) -> OutputStream
where
    S: Stream<Item = std::result::Result<LogOutput, BollardError>> + Send + 'static,
{
    Box::pin(stream.map(|chunk| {
        chunk
            .map(|log| String::from_utf8_lossy(&log.into_bytes()).to_string())
            .map_err(|e| Error::Engine(format!("stream: {}", e)))
    }))
}

/// Map a container configuration onto the Docker create request
pub fn to_engine_config(config: &ContainerConfig) -> Config<String> {
    let mounts = config
        .volumes
        .iter()
        .map(|v| Mount {
            target: Some(v.container_path.to_string_lossy().to_string()),
            source: Some(v.host_path.to_string_lossy().to_string()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(v.read_only),
            ..Default::default()
        })
        .collect();

    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for key in config.port_keys() {
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(config.port.to_string()),
            }]),
        );
    }

    let mut log_options = HashMap::new();
    log_options.insert("max-size".to_string(), config.log_rotation.max_size.clone());
    log_options.insert(
        "max-file".to_string(),
        config.log_rotation.max_files.to_string(),
    );

    let limits = &config.limits;
    let security = &config.security;

    Config {
        image: Some(config.image.clone()),
        user: config.user.clone(),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        open_stdin: Some(true),
        tty: Some(true),
        exposed_ports: Some(exposed_ports),
        host_config: Some(HostConfig {
            port_bindings: Some(port_bindings),
            mounts: Some(mounts),
            tmpfs: Some(config.tmpfs.clone()),
            memory: Some(limits.memory),
            memory_reservation: Some(limits.memory_reservation),
            memory_swap: Some(limits.memory_swap),
            cpu_quota: Some(limits.cpu_quota),
            cpu_period: Some(limits.cpu_period),
            cpu_shares: Some(limits.cpu_shares),
            blkio_weight: (limits.blkio_weight > 0).then_some(limits.blkio_weight),
            dns: Some(config.dns.clone()),
            log_config: Some(HostConfigLogConfig {
                typ: Some("json-file".to_string()),
                config: Some(log_options),
            }),
            security_opt: security
                .no_new_privileges
                .then(|| vec!["no-new-privileges".to_string()]),
            readonly_rootfs: Some(security.read_only_rootfs),
            cap_drop: Some(security.drop_caps.clone()),
            oom_kill_disable: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        self.bounded("ping", self.docker.ping()).await.map(|_| ())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match timeout(self.timeout, self.docker.inspect_image(image)).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) if is_not_found(&e) => Ok(false),
            Ok(Err(e)) => Err(Error::Engine(format!("inspect image {}: {}", image, e))),
            Err(_) => Err(Error::Timeout(format!("inspect image {}", image))),
        }
    }

    async fn create(&self, config: &ContainerConfig) -> Result<()> {
        let options = CreateContainerOptions {
            name: config.name.clone(),
            ..Default::default()
        };
        let response = self
            .bounded(
                "create container",
                self.docker
                    .create_container(Some(options), to_engine_config(config)),
            )
            .await?;
        for warning in response.warnings {
            warn!(container = %config.name, "Engine warning: {}", warning);
        }
        debug!(container = %config.name, id = %response.id, "Container created");
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.bounded(
            "start container",
            self.docker
                .start_container(name, None::<StartContainerOptions<String>>),
        )
        .await
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.bounded(
            "stop container",
            self.docker.stop_container(name, None::<StopContainerOptions>),
        )
        .await
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match timeout(self.timeout, self.docker.remove_container(name, Some(options))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if is_not_found(&e) => {
                warn!(container = %name, "Container already gone");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Engine(format!("remove container: {}", e))),
            Err(_) => Err(Error::Timeout(format!("remove container {}", name))),
        }
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        match timeout(
            self.timeout,
            self.docker
                .inspect_container(name, None::<InspectContainerOptions>),
        )
        .await
        {
            Ok(Ok(info)) => Ok(info.state.and_then(|s| s.running).unwrap_or(false)),
            Ok(Err(e)) if is_not_found(&e) => Ok(false),
            Ok(Err(e)) => Err(Error::Engine(format!("inspect container: {}", e))),
            Err(_) => Err(Error::Timeout(format!("inspect container {}", name))),
        }
    }

    async fn exec(&self, name: &str, cmd: Vec<String>) -> Result<ExecSession> {
        let options = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            ..Default::default()
        };
        let exec = self
            .bounded("create exec", self.docker.create_exec(name, options))
            .await?;

        match self
            .bounded("start exec", self.docker.start_exec(&exec.id, None))
            .await?
        {
            StartExecResults::Attached { output, input } => Ok(ExecSession {
                input,
                output: decode_output(output),
            }),
            StartExecResults::Detached => Err(Error::Engine(
                "exec started detached; no stream to attach".to_string(),
            )),
        }
    }

    async fn attach(&self, name: &str) -> Result<OutputStream> {
        let options = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };
        let AttachContainerResults { output, .. } = self
            .bounded(
                "attach container",
                self.docker.attach_container(name, Some(options)),
            )
            .await?;
        Ok(decode_output(output))
    }
}
