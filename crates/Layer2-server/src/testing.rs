//! In-memory fakes for the engine, spawner and probe, plus fixtures
//!
//! Compiled for this crate's tests and, with the `testing` feature, for
//! downstream crates' tests.

use crate::container::{ContainerConfig, ContainerEngine, ExecSession, OutputStream};
use crate::executor::{CommandSpec, ExitResult, ProcessSpawner};
use crate::health::QueryProbe;
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use parking_lot::Mutex;
use ssm_foundation::{Error, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;

// ============================================================================
// MockEngine
// ============================================================================

struct MockContainer {
    config: ContainerConfig,
    running: bool,
    stdin: Arc<Mutex<Vec<u8>>>,
    exec_commands: Vec<Vec<String>>,
    primary: Option<UnboundedSender<Result<String>>>,
    process: Option<UnboundedSender<Result<String>>>,
}

#[derive(Default)]
struct EngineState {
    containers: HashMap<String, MockContainer>,
    calls: Vec<String>,
    failing: HashSet<String>,
    images: HashSet<String>,
}

/// Container engine that keeps containers in memory.
///
/// Stopping a container ends both its primary and exec streams, the way a
/// real engine does when the container exits.
pub struct MockEngine {
    state: Mutex<EngineState>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    /// Engine with the `ssjava` image present
    pub fn new() -> Self {
        let mut state = EngineState::default();
        state.images.insert("ssjava".to_string());
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn with_image(self, image: &str) -> Self {
        self.state.lock().images.insert(image.to_string());
        self
    }

    /// Make every later call of `op` ("create", "start", "stop", "remove", ...) fail
    pub fn fail_on(&self, op: &str) {
        self.state.lock().failing.insert(op.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    /// Operation names in call order
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == op).count()
    }

    pub fn container(&self, name: &str) -> Option<ContainerConfig> {
        self.state
            .lock()
            .containers
            .get(name)
            .map(|c| c.config.clone())
    }

    pub fn is_running_now(&self, name: &str) -> bool {
        self.state
            .lock()
            .containers
            .get(name)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    /// Everything written to exec stdin so far
    pub fn stdin(&self, name: &str) -> String {
        self.state
            .lock()
            .containers
            .get(name)
            .map(|c| String::from_utf8_lossy(&c.stdin.lock()).to_string())
            .unwrap_or_default()
    }

    pub fn exec_commands(&self, name: &str) -> Vec<Vec<String>> {
        self.state
            .lock()
            .containers
            .get(name)
            .map(|c| c.exec_commands.clone())
            .unwrap_or_default()
    }

    /// Push a chunk onto the container's primary output
    pub fn emit_output(&self, name: &str, chunk: &str) {
        let state = self.state.lock();
        if let Some(tx) = state.containers.get(name).and_then(|c| c.primary.as_ref()) {
            let _ = tx.unbounded_send(Ok(chunk.to_string()));
        }
    }

    /// End the exec'd process without stopping the container
    pub fn end_process(&self, name: &str) {
        if let Some(container) = self.state.lock().containers.get_mut(name) {
            container.process = None;
        }
    }

    fn record(&self, op: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(op.to_string());
        if state.failing.contains(op) {
            return Err(Error::Engine(format!("{} failed (injected)", op)));
        }
        Ok(())
    }
}

fn no_such_container(name: &str) -> Error {
    Error::Engine(format!("no such container: {}", name))
}

#[async_trait]
impl ContainerEngine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn ping(&self) -> Result<()> {
        self.record("ping")
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        self.record("image_exists")?;
        Ok(self.state.lock().images.contains(image))
    }

    async fn create(&self, config: &ContainerConfig) -> Result<()> {
        self.record("create")?;
        let mut state = self.state.lock();
        if state.containers.contains_key(&config.name) {
            return Err(Error::Engine(format!("conflict: {} exists", config.name)));
        }
        state.containers.insert(
            config.name.clone(),
            MockContainer {
                config: config.clone(),
                running: false,
                stdin: Arc::new(Mutex::new(Vec::new())),
                exec_commands: Vec::new(),
                primary: None,
                process: None,
            },
        );
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.record("start")?;
        let mut state = self.state.lock();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| no_such_container(name))?;
        container.running = true;
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.record("stop")?;
        let mut state = self.state.lock();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| no_such_container(name))?;
        container.running = false;
        container.primary = None;
        container.process = None;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.record("remove")?;
        self.state.lock().containers.remove(name);
        Ok(())
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        self.record("is_running")?;
        Ok(self.is_running_now(name))
    }

    async fn exec(&self, name: &str, cmd: Vec<String>) -> Result<ExecSession> {
        self.record("exec")?;
        let mut state = self.state.lock();
        let container = state
            .containers
            .get_mut(name)
            .filter(|c| c.running)
            .ok_or_else(|| Error::Engine(format!("container {} is not running", name)))?;

        let (tx, rx) = unbounded();
        container.process = Some(tx);
        container.exec_commands.push(cmd);
        Ok(ExecSession {
            input: Box::pin(CaptureWriter(Arc::clone(&container.stdin))),
            output: Box::pin(rx),
        })
    }

    async fn attach(&self, name: &str) -> Result<OutputStream> {
        self.record("attach")?;
        let mut state = self.state.lock();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| no_such_container(name))?;
        let (tx, rx) = unbounded();
        container.primary = Some(tx);
        Ok(Box::pin(rx))
    }
}

/// AsyncWrite into a shared buffer
struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl AsyncWrite for CaptureWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.0.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ============================================================================
// ScriptedSpawner
// ============================================================================

#[derive(Default)]
struct SpawnerState {
    calls: Vec<CommandSpec>,
    failures: Vec<(String, i32)>,
    timeouts: Vec<String>,
}

/// Spawner that records commands and exits 0 unless told otherwise
#[derive(Default)]
pub struct ScriptedSpawner {
    state: Mutex<SpawnerState>,
}

impl ScriptedSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit with `code` for any command whose arguments contain `pattern`
    pub fn fail_when_contains(&self, pattern: &str, code: i32) {
        self.state.lock().failures.push((pattern.to_string(), code));
    }

    /// Fail with `Timeout` for any command whose arguments contain `pattern`
    pub fn timeout_when_contains(&self, pattern: &str) {
        self.state.lock().timeouts.push(pattern.to_string());
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.state.lock().calls.clone()
    }

    /// The `-c` argument of every call, in order
    pub fn shell_commands(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|spec| {
                let pos = spec.args.iter().position(|a| a == "-c")?;
                spec.args.get(pos + 1).cloned()
            })
            .collect()
    }
}

#[async_trait]
impl ProcessSpawner for ScriptedSpawner {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(&self, spec: &CommandSpec, _limit: Duration) -> Result<ExitResult> {
        let mut state = self.state.lock();
        state.calls.push(spec.clone());
        let matches = |pattern: &String| spec.args.iter().any(|a| a.contains(pattern.as_str()));

        if state.timeouts.iter().any(matches) {
            return Err(Error::Timeout(format!("{} (injected)", spec.display())));
        }
        if let Some((_, code)) = state.failures.iter().find(|(p, _)| matches(p)) {
            return Ok(ExitResult::new(*code));
        }
        Ok(ExitResult::new(0))
    }
}

// ============================================================================
// ScriptedProbe
// ============================================================================

/// Probe answering from a queue, then a fixed default
pub struct ScriptedProbe {
    answers: Mutex<VecDeque<bool>>,
    default: bool,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn healthy() -> Self {
        Self::with_default([], true)
    }

    pub fn failing() -> Self {
        Self::with_default([], false)
    }

    /// Answer `answers` in order, then healthy
    pub fn sequence(answers: impl IntoIterator<Item = bool>) -> Self {
        Self::with_default(answers, true)
    }

    fn with_default(answers: impl IntoIterator<Item = bool>, default: bool) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            default,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryProbe for ScriptedProbe {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn query(&self, protocol: &str, host: &str, port: u16) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = self.answers.lock().pop_front().unwrap_or(self.default);
        if answer {
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "{} query on {}:{} unanswered",
                protocol, host, port
            )))
        }
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub mod fixtures {
    use crate::catalog::PluginCatalog;
    use crate::container::ContainerEngine;
    use crate::context::ServerContext;
    use crate::definition::{GameDefinition, HealthProbe, PluginDefinition, ShellCommand};
    use crate::executor::ProcessSpawner;
    use crate::health::QueryProbe;
    use crate::record::InstanceRecord;
    use ssm_foundation::ManagerConfig;
    use std::path::Path;
    use std::sync::Arc;

    /// Java game with a two-step install and an active probe
    pub fn game(name: &str) -> GameDefinition {
        GameDefinition {
            name: name.to_string(),
            health_probe: HealthProbe {
                active: true,
                id: "minecraft".to_string(),
            },
            install: vec![ShellCommand::new("./install.sh"), ShellCommand::new("./eula.sh")],
            update: vec![ShellCommand::new("./update.sh")],
            start_command: "java -Xmx{memory}M -jar server.jar --port {port} --players {players}"
                .to_string(),
            stop_console_command: "stop".to_string(),
            container_type: "Java".to_string(),
            logging: Default::default(),
            verify: Vec::new(),
        }
    }

    pub fn record(id: &str, port: u16) -> InstanceRecord {
        InstanceRecord::new(id, game("minecraft"), port).with_players(20)
    }

    pub fn plugin(name: &str, game: &str) -> PluginDefinition {
        PluginDefinition {
            name: name.to_string(),
            game: game.to_string(),
            install: vec![ShellCommand::new(format!("./plugins/{}/install.sh", name))],
            remove: vec![ShellCommand::new(format!("./plugins/{}/remove.sh", name))],
        }
    }

    /// Config with every path under `root` and ownership management off
    pub fn config(root: &Path) -> ManagerConfig {
        let mut config = ManagerConfig::default();
        config.api.secret = "secret".to_string();
        config.servers.ping_time = 50;
        config.paths.storage = root.join("storage");
        config.paths.home_root = root.join("home");
        config.paths.scripts = root.join("scripts");
        config.paths.static_assets = root.join("static");
        config.sandbox.manage_ownership = false;
        config
    }

    pub fn context(
        root: &Path,
        engine: Arc<dyn ContainerEngine>,
        spawner: Arc<dyn ProcessSpawner>,
        probe: Arc<dyn QueryProbe>,
        catalog: Arc<dyn PluginCatalog>,
    ) -> ServerContext {
        ServerContext::new(Arc::new(config(root)), engine, spawner, probe, catalog)
    }
}
