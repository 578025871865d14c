//! Shared instance state
//!
//! `InstanceState` is owned by the instance and shared (via `Arc`) with its
//! container driver and health monitor, which report status changes and
//! console output back through it.

use crate::definition::GameDefinition;
use crate::event::{ServerEvent, Status, StatusSnapshot};
use crate::record::InstanceRecord;
use parking_lot::RwLock;
use ssm_foundation::{ActionCode, EventBus, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

pub struct InstanceState {
    id: String,

    record: RwLock<InstanceRecord>,

    status: RwLock<Status>,

    /// Lifecycle mutual exclusion
    blocked: AtomicBool,

    events: EventBus<ServerEvent>,
}

impl InstanceState {
    pub fn new(record: InstanceRecord) -> Self {
        let id = record.id.clone();
        Self {
            events: EventBus::new(id.clone()),
            id,
            record: RwLock::new(record),
            status: RwLock::new(Status::Off),
            blocked: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn record(&self) -> InstanceRecord {
        self.record.read().clone()
    }

    pub fn game(&self) -> GameDefinition {
        self.record.read().game.clone()
    }

    pub fn port(&self) -> u16 {
        self.record.read().port
    }

    pub(crate) fn update_record<R>(&self, f: impl FnOnce(&mut InstanceRecord) -> R) -> R {
        f(&mut self.record.write())
    }

    pub fn status(&self) -> Status {
        *self.status.read()
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    pub fn is_installed(&self) -> bool {
        self.record.read().installed
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            status: self.status(),
            installed: self.is_installed(),
            blocked: self.is_blocked(),
        }
    }

    pub fn events(&self) -> &EventBus<ServerEvent> {
        &self.events
    }

    pub async fn set_status(&self, status: Status) {
        *self.status.write() = status;
        info!(server_id = %self.id, status = %status, "Server status updated");
        self.events.publish(ServerEvent::StatusChange(status)).await;
    }

    /// Move from `from` to `to` only if the status is still `from`
    pub async fn compare_and_set_status(&self, from: Status, to: Status) -> bool {
        {
            let mut status = self.status.write();
            if *status != from {
                return false;
            }
            *status = to;
        }
        info!(server_id = %self.id, status = %to, "Server status updated");
        self.events.publish(ServerEvent::StatusChange(to)).await;
        true
    }

    /// Take the lifecycle lock, or fail with `Locked` if another operation holds it
    pub(crate) async fn block(self: &Arc<Self>) -> Result<BlockGuard> {
        if self
            .blocked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ActionCode::Locked.into());
        }
        debug!(server_id = %self.id, "Blocked set to true");
        self.events.publish(ServerEvent::Block(true)).await;
        Ok(BlockGuard {
            state: Arc::clone(self),
            armed: true,
        })
    }

    pub(crate) async fn set_installed(&self, installed: bool) {
        self.update_record(|r| r.installed = installed);
        self.events.publish(ServerEvent::Installed(installed)).await;
    }

    /// Forward console output; the first line promotes Starting to Running
    pub async fn log_console(&self, data: &str) {
        let promoted = {
            let mut status = self.status.write();
            if *status == Status::Starting {
                *status = Status::Running;
                true
            } else {
                false
            }
        };
        if promoted {
            info!(server_id = %self.id, status = %Status::Running, "Server status updated");
            self.events
                .publish(ServerEvent::StatusChange(Status::Running))
                .await;
        }

        let line = strip_ansi_escapes::strip_str(data);
        trace!(server_id = %self.id, line = %line.trim_end(), "console");
        self.events.publish(ServerEvent::Console(line)).await;
    }

    pub async fn announce(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(server_id = %self.id, "{}", message);
        self.events.publish(ServerEvent::Announcement(message)).await;
    }
}

/// Holds `blocked` for one lifecycle operation.
///
/// `release` clears the flag and publishes the change. Dropping an
/// unreleased guard (a cancelled or panicking operation) still clears it.
pub(crate) struct BlockGuard {
    state: Arc<InstanceState>,
    armed: bool,
}

impl BlockGuard {
    pub(crate) async fn release(mut self) {
        self.armed = false;
        self.state.blocked.store(false, Ordering::SeqCst);
        debug!(server_id = %self.state.id, "Blocked set to false");
        self.state.events.publish(ServerEvent::Block(false)).await;
    }
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.state.blocked.store(false, Ordering::SeqCst);
        debug!(server_id = %self.state.id, "Blocked released by dropped operation");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let state = Arc::clone(&self.state);
            handle.spawn(async move {
                state.events.publish(ServerEvent::Block(false)).await;
            });
        }
    }
}
