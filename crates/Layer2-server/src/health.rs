//! Health monitor - periodic liveness probe with crash recovery
//!
//! Each tick queries the game's probe protocol on the instance port. Three
//! consecutive failures while the server is up kill the container and end
//! the loop; the next `start()` begins a fresh one.

use crate::container::ContainerDriver;
use crate::state::InstanceState;
use async_trait::async_trait;
use parking_lot::Mutex;
use ssm_foundation::Result;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Consecutive failures that count as a crash
pub const FAILURE_THRESHOLD: u32 = 3;

const PROBE_HOST: &str = "127.0.0.1";

const CRASH_ANNOUNCEMENT: &str = "Your server has been killed due to the server not responding.";

// ============================================================================
// QueryProbe Trait
// ============================================================================

/// Answers whether a game server responds to its query protocol
#[async_trait]
pub trait QueryProbe: Send + Sync {
    /// Probe name (for debugging)
    fn name(&self) -> &'static str;

    /// Whether `protocol` can be queried at all
    fn supports(&self, _protocol: &str) -> bool {
        true
    }

    async fn query(&self, protocol: &str, host: &str, port: u16) -> Result<()>;
}

// ============================================================================
// HealthMonitor
// ============================================================================

/// What a single tick decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Monitoring no longer applies; the loop ends
    Stopped,
    /// Lifecycle operation in progress; nothing probed
    Paused,
    Healthy,
    /// Failed probe with the consecutive count so far
    Failed(u32),
    /// Threshold reached; container killed and the loop ends
    Killed,
}

pub struct HealthMonitor {
    state: Arc<InstanceState>,
    driver: Arc<ContainerDriver>,
    probe: Arc<dyn QueryProbe>,
    interval: Duration,
    probe_timeout: Duration,
    failures: AtomicU32,
    enabled: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        state: Arc<InstanceState>,
        driver: Arc<ContainerDriver>,
        probe: Arc<dyn QueryProbe>,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            state,
            driver,
            probe,
            interval,
            probe_timeout,
            failures: AtomicU32::new(0),
            enabled: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Begin probing; replaces any loop already running
    pub fn start(self: &Arc<Self>) {
        let game = self.state.game();
        let Some(protocol) = game.probe_protocol() else {
            debug!(server_id = %self.state.id(), "Probe inactive, not monitoring");
            return;
        };
        if !self.probe.supports(protocol) {
            warn!(
                server_id = %self.state.id(),
                protocol,
                probe = self.probe.name(),
                "No query support for protocol, not monitoring"
            );
            return;
        }
        self.stop();
        self.enabled.store(true, Ordering::SeqCst);

        let monitor = Arc::downgrade(self);
        let period = self.interval;
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(monitor) = Weak::upgrade(&monitor) else {
                    break;
                };
                match monitor.tick().await {
                    TickOutcome::Stopped | TickOutcome::Killed => break,
                    _ => {}
                }
            }
        });
        *self.handle.lock() = Some(task);
        info!(server_id = %self.state.id(), interval_ms = period.as_millis() as u64, "Health monitor started");
    }

    /// Cancel the loop and reset the counter; idempotent
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.failures.store(0, Ordering::SeqCst);
        if let Some(task) = self.handle.lock().take() {
            task.abort();
            debug!(server_id = %self.state.id(), "Health monitor stopped");
        }
    }

    pub(crate) async fn tick(&self) -> TickOutcome {
        if !self.enabled.load(Ordering::SeqCst) || self.state.status().is_off() {
            return TickOutcome::Stopped;
        }
        let game = self.state.game();
        let Some(protocol) = game.probe_protocol() else {
            return TickOutcome::Stopped;
        };
        if self.state.is_blocked() {
            return TickOutcome::Paused;
        }

        let port = self.state.port();
        let answered = match timeout(
            self.probe_timeout,
            self.probe.query(protocol, PROBE_HOST, port),
        )
        .await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(server_id = %self.state.id(), error = %e, "Probe failed");
                false
            }
            Err(_) => {
                debug!(server_id = %self.state.id(), "Probe timed out");
                false
            }
        };

        if answered {
            self.failures.store(0, Ordering::SeqCst);
            return TickOutcome::Healthy;
        }

        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures < FAILURE_THRESHOLD || self.state.status().is_off() {
            return TickOutcome::Failed(failures);
        }

        warn!(server_id = %self.state.id(), failures, "Server not responding, killing container");
        self.enabled.store(false, Ordering::SeqCst);
        if let Err(e) = self.driver.force_stop().await {
            warn!(server_id = %self.state.id(), error = %e, "Kill after failed probes did not complete");
        }
        self.state.announce(CRASH_ANNOUNCEMENT).await;
        self.failures.store(0, Ordering::SeqCst);
        TickOutcome::Killed
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.handle.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ServerEvent, Status};
    use crate::container::{ContainerConfig, ContainerEngine};
    use crate::query::GameQueryProbe;
    use crate::sandbox::Sandbox;
    use crate::testing::{fixtures, MockEngine, ScriptedProbe};

    struct Rig {
        _dir: tempfile::TempDir,
        engine: Arc<MockEngine>,
        state: Arc<InstanceState>,
        probe: Arc<ScriptedProbe>,
        monitor: Arc<HealthMonitor>,
    }

    fn rig(probe: ScriptedProbe) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(fixtures::config(dir.path()));
        let engine = Arc::new(MockEngine::new());
        let state = Arc::new(InstanceState::new(fixtures::record("alice", 25565)));
        let sandbox = Arc::new(Sandbox::new(
            dir.path().join("alice/public"),
            state.clone(),
            1_000_000,
            false,
        ));
        let driver = Arc::new(ContainerDriver::new(
            state.clone(),
            sandbox,
            engine.clone(),
            config,
        ));
        let probe = Arc::new(probe);
        let monitor = Arc::new(HealthMonitor::new(
            state.clone(),
            driver,
            probe.clone(),
            Duration::from_millis(20),
            Duration::from_millis(200),
        ));
        Rig {
            _dir: dir,
            engine,
            state,
            probe,
            monitor,
        }
    }

    async fn running(rig: &Rig) {
        let config = ContainerConfig::new("alice", "ssjava", 25565, &Default::default());
        rig.engine.create(&config).await.unwrap();
        rig.engine.start("alice").await.unwrap();
        rig.state.set_status(Status::Running).await;
        rig.monitor.enabled.store(true, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_three_failures_kill_once() {
        let rig = rig(ScriptedProbe::failing());
        running(&rig).await;
        let mut rx = rig.state.events().receiver();

        assert_eq!(rig.monitor.tick().await, TickOutcome::Failed(1));
        assert_eq!(rig.monitor.tick().await, TickOutcome::Failed(2));
        assert_eq!(rig.monitor.tick().await, TickOutcome::Killed);
        assert_eq!(rig.monitor.failures(), 0);
        assert_eq!(rig.engine.count("stop"), 1);

        // The loop is over; later ticks do nothing
        assert_eq!(rig.monitor.tick().await, TickOutcome::Stopped);
        assert_eq!(rig.engine.count("stop"), 1);

        let mut announced = Vec::new();
        while let Ok(record) = rx.try_recv() {
            if let ServerEvent::Announcement(text) = record.payload {
                announced.push(text);
            }
        }
        assert_eq!(announced, vec![CRASH_ANNOUNCEMENT.to_string()]);
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let rig = rig(ScriptedProbe::sequence([false, false, true]));
        running(&rig).await;

        assert_eq!(rig.monitor.tick().await, TickOutcome::Failed(1));
        assert_eq!(rig.monitor.tick().await, TickOutcome::Failed(2));
        assert_eq!(rig.monitor.tick().await, TickOutcome::Healthy);
        assert_eq!(rig.monitor.failures(), 0);
        assert_eq!(rig.engine.count("stop"), 0);
    }

    #[tokio::test]
    async fn test_paused_while_blocked() {
        let rig = rig(ScriptedProbe::failing());
        running(&rig).await;

        let guard = rig.state.block().await.unwrap();
        for _ in 0..5 {
            assert_eq!(rig.monitor.tick().await, TickOutcome::Paused);
        }
        assert_eq!(rig.probe.calls(), 0);
        guard.release().await;

        assert_eq!(rig.monitor.tick().await, TickOutcome::Failed(1));
    }

    #[tokio::test]
    async fn test_off_stops_loop() {
        let rig = rig(ScriptedProbe::healthy());
        rig.monitor.enabled.store(true, Ordering::SeqCst);
        assert_eq!(rig.monitor.tick().await, TickOutcome::Stopped);
        assert_eq!(rig.probe.calls(), 0);
    }

    #[tokio::test]
    async fn test_inactive_probe_never_starts() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = fixtures::record("alice", 25565);
        record.game.health_probe.active = false;
        let state = Arc::new(InstanceState::new(record));
        let sandbox = Arc::new(Sandbox::new(dir.path(), state.clone(), 1_000_000, false));
        let driver = Arc::new(ContainerDriver::new(
            state.clone(),
            sandbox,
            Arc::new(MockEngine::new()),
            Arc::new(fixtures::config(dir.path())),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            state,
            driver,
            Arc::new(ScriptedProbe::healthy()),
            Duration::from_millis(10),
            Duration::from_millis(10),
        ));

        monitor.start();
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_loop_kills_unresponsive_server() {
        let rig = rig(ScriptedProbe::failing());
        running(&rig).await;

        rig.monitor.start();
        assert!(rig.monitor.is_running());
        for _ in 0..200 {
            if !rig.monitor.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!rig.monitor.is_running());
        assert_eq!(rig.engine.count("stop"), 1);
        assert_eq!(rig.probe.calls(), FAILURE_THRESHOLD as usize);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let rig = rig(ScriptedProbe::healthy());
        running(&rig).await;
        rig.monitor.start();
        rig.monitor.stop();
        rig.monitor.stop();
        assert!(!rig.monitor.is_running());
        assert_eq!(rig.monitor.failures(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_protocol_never_starts() {
        let mut record = fixtures::record("alice", 25565);
        record.game.health_probe.id = "terraria".to_string();
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(InstanceState::new(record));
        let sandbox = Arc::new(Sandbox::new(dir.path(), state.clone(), 1_000_000, false));
        let driver = Arc::new(ContainerDriver::new(
            state.clone(),
            sandbox,
            Arc::new(MockEngine::new()),
            Arc::new(fixtures::config(dir.path())),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            state,
            driver,
            Arc::new(GameQueryProbe::new(Duration::from_millis(10))),
            Duration::from_millis(10),
            Duration::from_millis(10),
        ));

        monitor.start();
        assert!(!monitor.is_running());
    }
}
