//! Instance - lifecycle coordinator for one game server
//!
//! Owns the server's container driver, sandbox, health monitor and shell
//! executor. Lifecycle operations live in `ops`.

mod ops;


use crate::account::AccountProvisioner;
use crate::container::ContainerDriver;
use crate::context::ServerContext;
use crate::event::{ServerEvent, Status, StatusSnapshot};
use crate::executor::ShellExecutor;
use crate::health::HealthMonitor;
use crate::record::InstanceRecord;
use crate::sandbox::Sandbox;
use crate::state::InstanceState;
use serde::Serialize;
use ssm_foundation::{EventBus, Result};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Record plus live status, as reported to API callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceInfo {
    #[serde(flatten)]
    pub record: InstanceRecord,
    pub status: Status,
    pub blocked: bool,
}

pub struct Instance {
    ctx: ServerContext,
    state: Arc<InstanceState>,
    sandbox: Arc<Sandbox>,
    driver: Arc<ContainerDriver>,
    monitor: Arc<HealthMonitor>,
    shell: ShellExecutor,
    accounts: AccountProvisioner,
}

impl Instance {
    pub fn new(ctx: ServerContext, record: InstanceRecord) -> Result<Self> {
        record.validate()?;

        let config = Arc::clone(&ctx.config);
        let root = Sandbox::root_for(&config.paths.home_root, &record.id);
        let id = record.id.clone();
        let state = Arc::new(InstanceState::new(record));

        let sandbox = Arc::new(Sandbox::new(
            &root,
            Arc::clone(&state),
            config.sandbox.max_edit_bytes,
            config.sandbox.manage_ownership,
        ));
        let driver = Arc::new(ContainerDriver::new(
            Arc::clone(&state),
            Arc::clone(&sandbox),
            Arc::clone(&ctx.engine),
            Arc::clone(&config),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&state),
            Arc::clone(&driver),
            Arc::clone(&ctx.probe),
            config.servers.ping_interval(),
            config.timeouts.probe(),
        ));
        let shell = ShellExecutor::new(
            id,
            root,
            Arc::clone(&ctx.spawner),
            config.timeouts.shell(),
        );
        let accounts = AccountProvisioner::new(
            &config.paths.scripts,
            Arc::clone(&ctx.spawner),
            config.timeouts.shell(),
        );

        Ok(Self {
            ctx,
            state,
            sandbox,
            driver,
            monitor,
            shell,
            accounts,
        })
    }

    pub fn id(&self) -> &str {
        self.state.id()
    }

    pub fn status(&self) -> Status {
        self.state.status()
    }

    pub fn is_blocked(&self) -> bool {
        self.state.is_blocked()
    }

    pub fn is_installed(&self) -> bool {
        self.state.is_installed()
    }

    pub fn port(&self) -> u16 {
        self.state.port()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.state.snapshot()
    }

    pub fn events(&self) -> &EventBus<ServerEvent> {
        self.state.events()
    }

    /// File access bounded to the instance's root
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            record: self.state.record(),
            status: self.state.status(),
            blocked: self.state.is_blocked(),
        }
    }

    /// The persisted form of the instance
    pub fn export_config(&self) -> InstanceRecord {
        self.state.record()
    }

    /// Write the record to `servers/<id>.json`
    pub fn persist(&self) -> Result<()> {
        let record = self.state.record();
        self.ctx.store.save(&record.file_name(), &record)?;
        debug!(server_id = %record.id, "Record saved");
        Ok(())
    }

    /// Stop monitoring and detach from the container; the container keeps running
    pub async fn shutdown(&self) {
        self.monitor.stop();
        self.driver.close_streams().await;
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id())
            .field("port", &self.port())
            .field("status", &self.status())
            .field("blocked", &self.is_blocked())
            .finish()
    }
}
