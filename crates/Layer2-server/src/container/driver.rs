//! Container driver - one instance's container and its process streams

use super::config::{ContainerConfig, VolumeMount, CONTAINER_HOME, CONTAINER_STATIC};
use super::engine::{ContainerEngine, OutputStream, ProcessInput};
use super::tail::{self, LogTail};
use crate::account::Owner;
use crate::event::Status;
use crate::record::InstanceRecord;
use crate::sandbox::Sandbox;
use crate::state::InstanceState;
use futures::StreamExt;
use ssm_foundation::{ActionCode, ManagerConfig, Result};
use std::sync::{Arc, Weak};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Substitute `{memory}`, `{port}` and `{players}` into a start command template
pub fn render_start_command(record: &InstanceRecord) -> String {
    record
        .game
        .start_command
        .replace("{memory}", &record.build.mem.to_string())
        .replace("{port}", &record.port.to_string())
        .replace("{players}", &record.players.to_string())
}

/// Live attachments to a started container
#[derive(Default)]
struct Streams {
    /// Stdin of the exec'd game process
    input: Option<ProcessInput>,
    /// Drains the exec output; stops the container when the process exits
    process: Option<JoinHandle<()>>,
    /// Watches the container's primary process; its end means the container exited
    container: Option<JoinHandle<()>>,
    log_tail: Option<JoinHandle<()>>,
}

pub struct ContainerDriver {
    state: Arc<InstanceState>,
    sandbox: Arc<Sandbox>,
    engine: Arc<dyn ContainerEngine>,
    config: Arc<ManagerConfig>,
    streams: Mutex<Streams>,
}

impl ContainerDriver {
    pub fn new(
        state: Arc<InstanceState>,
        sandbox: Arc<Sandbox>,
        engine: Arc<dyn ContainerEngine>,
        config: Arc<ManagerConfig>,
    ) -> Self {
        Self {
            state,
            sandbox,
            engine,
            config,
            streams: Mutex::new(Streams::default()),
        }
    }

    fn name(&self) -> &str {
        self.state.id()
    }

    /// Image for the game's container type
    pub fn image(&self) -> Result<String> {
        let container_type = self.state.game().container_type;
        self.config
            .docker
            .image_for(&container_type)
            .map(str::to_string)
            .ok_or_else(|| ActionCode::InvalidContainerType.into())
    }

    pub fn container_config(&self) -> Result<ContainerConfig> {
        let record = self.state.record();
        let mut config = ContainerConfig::new(&record.id, self.image()?, record.port, &record.build)
            .with_volume(VolumeMount::new(self.sandbox.root(), CONTAINER_HOME))
            .with_volume(
                VolumeMount::new(&self.config.paths.static_assets, CONTAINER_STATIC).read_only(),
            );
        if self.config.sandbox.manage_ownership {
            config = config.with_user(Owner::lookup(&record.id)?.uid.to_string());
        }
        Ok(config)
    }

    // ========================================================================
    // Control
    // ========================================================================

    pub async fn create(&self) -> Result<()> {
        let config = self.container_config()?;
        self.engine.create(&config).await?;
        info!(server_id = %self.name(), image = %config.image, "Container created");
        Ok(())
    }

    pub async fn destroy(&self) -> Result<()> {
        self.ensure_stopped().await?;
        self.close_streams().await;
        self.engine.remove(self.name()).await?;
        info!(server_id = %self.name(), "Container removed");
        Ok(())
    }

    pub async fn rebuild(&self) -> Result<()> {
        self.destroy().await?;
        self.create().await
    }

    /// Stop the container if it is running; returns whether it was
    pub async fn ensure_stopped(&self) -> Result<bool> {
        if self.engine.is_running(self.name()).await? {
            debug!(server_id = %self.name(), "Stopping running container");
            self.engine.stop(self.name()).await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn kill_container(&self) -> Result<bool> {
        let stopped = self.ensure_stopped().await?;
        if stopped {
            info!(server_id = %self.name(), "Container killed");
        }
        Ok(stopped)
    }

    /// Kill path: Stopping, stop the container, and go straight to Off when
    /// nothing was running (no stream end will report it)
    pub async fn force_stop(&self) -> Result<()> {
        self.state.set_status(Status::Stopping).await;
        let stopped = self.kill_container().await?;
        if !stopped {
            self.close_streams().await;
            self.state.set_status(Status::Off).await;
        }
        Ok(())
    }

    // ========================================================================
    // Process
    // ========================================================================

    /// Start the container, exec the game's start command and attach to its output
    pub async fn start_container(self: &Arc<Self>) -> Result<()> {
        self.close_streams().await;
        self.ensure_stopped().await?;
        self.engine.start(self.name()).await?;

        let record = self.state.record();
        let command = render_start_command(&record);
        debug!(server_id = %self.name(), command = %command, "Start command");

        let session = self
            .engine
            .exec(
                self.name(),
                vec!["/bin/bash".to_string(), "-c".to_string(), command],
            )
            .await?;
        let container_output = self.engine.attach(self.name()).await?;

        let mut streams = self.streams.lock().await;
        streams.input = Some(session.input);
        streams.container = Some(tokio::spawn(watch_container(
            Arc::downgrade(self),
            container_output,
            record.game.logging.use_stdout,
        )));
        streams.process = Some(tokio::spawn(watch_process(
            Arc::downgrade(self),
            session.output,
        )));

        if let Some(log_file) = record.game.log_file() {
            self.sandbox.ensure_file(log_file).await?;
            self.sandbox.truncate_file(log_file).await?;
            let tail = LogTail::new(self.sandbox.extend_path(log_file));
            streams.log_tail = Some(tokio::spawn(tail::follow(
                tail,
                log_file.to_string(),
                Arc::clone(&self.state),
                Arc::clone(&self.sandbox),
            )));
        }

        info!(server_id = %self.name(), "Container started");
        Ok(())
    }

    /// Write one line to the game process; a no-op when nothing is attached
    pub async fn write_to_process(&self, data: &str) -> Result<()> {
        let mut streams = self.streams.lock().await;
        let Some(input) = streams.input.as_mut() else {
            debug!(server_id = %self.name(), "No process attached, dropping input");
            return Ok(());
        };
        // The remote shell only runs the line once it sees the newline
        input.write_all(format!("{}\n", data).as_bytes()).await?;
        input.flush().await?;
        Ok(())
    }

    pub async fn has_process(&self) -> bool {
        self.streams.lock().await.input.is_some()
    }

    pub async fn close_streams(&self) {
        let mut streams = self.streams.lock().await;
        Self::release(&mut streams, true);
    }

    fn release(streams: &mut Streams, abort_container_watch: bool) {
        streams.input = None;
        if let Some(task) = streams.process.take() {
            task.abort();
        }
        if let Some(task) = streams.log_tail.take() {
            task.abort();
        }
        if let Some(task) = streams.container.take() {
            if abort_container_watch {
                task.abort();
            }
        }
    }

    async fn on_container_exit(&self) {
        {
            let mut streams = self.streams.lock().await;
            Self::release(&mut streams, false);
        }
        debug!(server_id = %self.name(), "Container output closed");
        self.state.set_status(Status::Off).await;
    }

    async fn on_process_exit(&self) {
        debug!(server_id = %self.name(), "Game process exited");
        // Runs on the process watch task; detach it so release() cannot abort us mid-stop
        drop(self.streams.lock().await.process.take());
        if self.state.status().is_off() {
            return;
        }
        if let Err(e) = self.force_stop().await {
            error!(server_id = %self.name(), error = %e, "Failed to stop container after process exit");
        }
    }
}

impl Drop for ContainerDriver {
    fn drop(&mut self) {
        Self::release(self.streams.get_mut(), true);
    }
}

async fn watch_container(driver: Weak<ContainerDriver>, mut output: OutputStream, forward: bool) {
    while let Some(chunk) = output.next().await {
        let Some(driver) = driver.upgrade() else {
            return;
        };
        match chunk {
            Ok(text) if forward => driver.state.log_console(&text).await,
            Ok(text) => trace!(server_id = %driver.name(), "{}", text.trim_end()),
            Err(e) => {
                warn!(server_id = %driver.name(), error = %e, "Container stream error");
                driver
                    .state
                    .announce(format!("Your servers container encountered an error; {}", e))
                    .await;
            }
        }
    }
    if let Some(driver) = driver.upgrade() {
        driver.on_container_exit().await;
    }
}

async fn watch_process(driver: Weak<ContainerDriver>, mut output: OutputStream) {
    while let Some(chunk) = output.next().await {
        if let (Ok(text), Some(driver)) = (chunk, driver.upgrade()) {
            trace!(server_id = %driver.name(), "{}", text.trim_end());
        }
    }
    if let Some(driver) = driver.upgrade() {
        driver.on_process_exit().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixtures, MockEngine};
    use std::time::Duration;

    struct Rig {
        _dir: tempfile::TempDir,
        engine: Arc<MockEngine>,
        state: Arc<InstanceState>,
        driver: Arc<ContainerDriver>,
    }

    fn rig(record: InstanceRecord) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(fixtures::config(dir.path()));
        let engine = Arc::new(MockEngine::new());
        let state = Arc::new(InstanceState::new(record));
        let sandbox = Arc::new(Sandbox::new(
            dir.path().join("alice/public"),
            state.clone(),
            1_000_000,
            false,
        ));
        std::fs::create_dir_all(sandbox.root()).unwrap();
        let driver = Arc::new(ContainerDriver::new(
            state.clone(),
            sandbox,
            engine.clone(),
            config,
        ));
        Rig {
            _dir: dir,
            engine,
            state,
            driver,
        }
    }

    async fn wait_for(state: &InstanceState, status: Status) {
        for _ in 0..200 {
            if state.status() == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("status never became {:?}, is {:?}", status, state.status());
    }

    #[test]
    fn test_render_start_command() {
        let record = fixtures::record("alice", 25570).with_players(12);
        assert_eq!(
            render_start_command(&record),
            "java -Xmx1024M -jar server.jar --port 25570 --players 12"
        );
    }

    #[tokio::test]
    async fn test_create_maps_image_and_mounts() {
        let rig = rig(fixtures::record("alice", 25565));
        rig.driver.create().await.unwrap();

        let config = rig.engine.container("alice").unwrap();
        assert_eq!(config.image, "ssjava");
        assert_eq!(config.port, 25565);
        assert_eq!(config.volumes.len(), 2);
        assert!(config.volumes[1].read_only);
        assert_eq!(config.user, None);
    }

    #[tokio::test]
    async fn test_unknown_container_type() {
        let mut record = fixtures::record("alice", 25565);
        record.game.container_type = "Dotnet".to_string();
        let rig = rig(record);

        let err = rig.driver.create().await.unwrap_err();
        assert!(err.is_action(ActionCode::InvalidContainerType));
        assert_eq!(rig.engine.count("create"), 0);
    }

    #[tokio::test]
    async fn test_start_write_and_exit() {
        let rig = rig(fixtures::record("alice", 25565));
        rig.driver.create().await.unwrap();
        rig.state.set_status(Status::Starting).await;

        rig.driver.start_container().await.unwrap();
        assert!(rig.engine.is_running_now("alice"));
        assert_eq!(
            rig.engine.exec_commands("alice"),
            vec![vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                "java -Xmx1024M -jar server.jar --port 25565 --players 20".to_string()
            ]]
        );

        rig.engine.emit_output("alice", "Done (1.2s)!\n");
        wait_for(&rig.state, Status::Running).await;

        rig.driver.write_to_process("say hi").await.unwrap();
        assert_eq!(rig.engine.stdin("alice"), "say hi\n");

        rig.engine.stop("alice").await.unwrap();
        wait_for(&rig.state, Status::Off).await;
        assert!(!rig.driver.has_process().await);

        // No stream attached any more
        rig.driver.write_to_process("ignored").await.unwrap();
    }

    #[tokio::test]
    async fn test_process_exit_stops_container() {
        let rig = rig(fixtures::record("alice", 25565));
        rig.driver.create().await.unwrap();
        rig.state.set_status(Status::Starting).await;
        rig.driver.start_container().await.unwrap();

        rig.engine.end_process("alice");
        wait_for(&rig.state, Status::Off).await;
        assert!(!rig.engine.is_running_now("alice"));
        assert_eq!(rig.engine.count("stop"), 1);
    }

    #[tokio::test]
    async fn test_ensure_stopped_is_idempotent() {
        let rig = rig(fixtures::record("alice", 25565));
        rig.driver.create().await.unwrap();
        assert!(!rig.driver.ensure_stopped().await.unwrap());

        rig.engine.start("alice").await.unwrap();
        assert!(rig.driver.kill_container().await.unwrap());
        assert!(!rig.driver.kill_container().await.unwrap());
        assert_eq!(rig.engine.count("stop"), 1);
    }

    #[tokio::test]
    async fn test_force_stop_without_container_goes_off() {
        let rig = rig(fixtures::record("alice", 25565));
        rig.state.set_status(Status::Running).await;
        rig.driver.force_stop().await.unwrap();
        assert_eq!(rig.state.status(), Status::Off);
    }

    #[tokio::test]
    async fn test_rebuild_replaces_container() {
        let rig = rig(fixtures::record("alice", 25565));
        rig.driver.create().await.unwrap();
        rig.engine.start("alice").await.unwrap();

        rig.driver.rebuild().await.unwrap();
        assert_eq!(rig.engine.count("remove"), 1);
        assert_eq!(rig.engine.count("create"), 2);
        assert!(!rig.engine.is_running_now("alice"));
    }

    #[tokio::test]
    async fn test_log_file_lines_reach_console() {
        let mut record = fixtures::record("alice", 25565);
        record.game.logging.log_file.use_log_file = true;
        record.game.logging.log_file.path = "logs/latest.log".to_string();
        record.game.logging.use_stdout = false;
        let rig = rig(record);
        rig.driver.create().await.unwrap();
        rig.state.set_status(Status::Starting).await;

        rig.driver.start_container().await.unwrap();
        let log = rig.driver.sandbox.extend_path("logs/latest.log");
        assert!(log.exists());

        // Primary output is not forwarded with useStdout off
        rig.engine.emit_output("alice", "ignored\n");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rig.state.status(), Status::Starting);

        std::fs::write(&log, "[Server] Done\n").unwrap();
        wait_for(&rig.state, Status::Running).await;
        rig.driver.close_streams().await;
    }
}
