//! Fleet registry - every instance on the host
//!
//! Ids and ports are unique across the fleet. The write lock is held from
//! the uniqueness check through the insert so concurrent adds cannot both
//! claim the same id or port. A reload moving a server to a new port holds
//! a claim on that port until the reload finishes.

use crate::ports::{allocate_port, is_port_free, PortRange};
use parking_lot::Mutex;
use ssm_foundation::{ActionCode, Result};
use ssm_server::{validate_id, Instance, InstanceInfo, InstanceRecord, ServerContext};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

type PortCheck = Arc<dyn Fn(u16) -> bool + Send + Sync>;

/// Port held for an in-flight reload; released on drop
struct PortClaim<'a> {
    claims: &'a Mutex<HashSet<u16>>,
    port: u16,
}

impl Drop for PortClaim<'_> {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.port);
    }
}

pub struct Fleet {
    ctx: ServerContext,
    servers: RwLock<Vec<Arc<Instance>>>,
    /// Only locked while `servers` is write-locked or on claim release
    claimed_ports: Mutex<HashSet<u16>>,
    port_check: PortCheck,
}

impl Fleet {
    pub fn new(ctx: ServerContext) -> Self {
        Self {
            ctx,
            servers: RwLock::new(Vec::new()),
            claimed_ports: Mutex::new(HashSet::new()),
            port_check: Arc::new(is_port_free),
        }
    }

    /// Replace the host port probe used by auto-allocation
    pub fn with_port_check(mut self, check: impl Fn(u16) -> bool + Send + Sync + 'static) -> Self {
        self.port_check = Arc::new(check);
        self
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    /// Load every record under `servers/`; returns how many were added
    pub async fn load_servers(&self) -> Result<usize> {
        let records = self.ctx.store.load_all::<InstanceRecord>()?;
        let mut servers = self.servers.write().await;
        let before = servers.len();

        for (file, record) in records {
            if servers
                .iter()
                .any(|s| s.id() == record.id || s.port() == record.port)
            {
                warn!(file = %file, server_id = %record.id, port = record.port, "Duplicate id or port, skipping record");
                continue;
            }
            match Instance::new(self.ctx.clone(), record) {
                Ok(instance) => {
                    info!(server_id = %instance.id(), port = instance.port(), "Loaded server");
                    servers.push(Arc::new(instance));
                }
                Err(e) => error!(file = %file, error = %e, "Invalid server record, skipping"),
            }
        }

        Ok(servers.len() - before)
    }

    /// Register a new instance and persist its record.
    ///
    /// The caller runs `create()` and `install()` on the returned instance.
    pub async fn add_new_server(&self, mut record: InstanceRecord, auto_port: bool) -> Result<Arc<Instance>> {
        validate_id(&record.id)?;

        let mut servers = self.servers.write().await;
        if servers.iter().any(|s| s.id() == record.id) {
            return Err(ActionCode::DuplicateId.into());
        }

        let mut held: HashSet<u16> = servers.iter().map(|s| s.port()).collect();
        held.extend(self.claimed_ports.lock().iter().copied());
        if auto_port {
            let range = PortRange::from(&self.ctx.config.servers);
            let check = Arc::clone(&self.port_check);
            record.port = allocate_port(range, &held, move |port| check(port))?;
        } else if held.contains(&record.port) {
            return Err(ActionCode::PortInUse.into());
        }

        let instance = Arc::new(Instance::new(self.ctx.clone(), record)?);
        servers.push(Arc::clone(&instance));
        if let Err(e) = instance.persist() {
            servers.pop();
            error!(server_id = %instance.id(), error = %e, "Failed to persist new server");
            return Err(e);
        }

        info!(server_id = %instance.id(), port = instance.port(), "Server added");
        Ok(instance)
    }

    /// Remove the instance; it stays registered if its own removal fails
    pub async fn remove_server(&self, id: &str) -> Result<()> {
        let instance = self.get(id).await.ok_or(ActionCode::NotFound)?;
        instance.remove().await?;
        self.servers.write().await.retain(|s| s.id() != id);
        info!(server_id = %id, "Server evicted");
        Ok(())
    }

    /// Apply `record` to a registered instance.
    ///
    /// Port uniqueness is checked here, not by `Instance::reload_config`, so
    /// port changes go through the fleet.
    pub async fn reload_server(&self, id: &str, record: InstanceRecord) -> Result<()> {
        let (instance, _claim) = self.claim_port(id, record.port).await?;
        instance.reload_config(record).await
    }

    /// Find `id` and reserve `port` for it unless it already owns the port
    async fn claim_port(&self, id: &str, port: u16) -> Result<(Arc<Instance>, Option<PortClaim<'_>>)> {
        let servers = self.servers.write().await;
        let instance = servers
            .iter()
            .find(|s| s.id() == id)
            .cloned()
            .ok_or(ActionCode::NotFound)?;
        if instance.port() == port {
            return Ok((instance, None));
        }

        let mut claimed = self.claimed_ports.lock();
        if claimed.contains(&port) || servers.iter().any(|s| s.id() != id && s.port() == port) {
            return Err(ActionCode::PortInUse.into());
        }
        claimed.insert(port);
        drop(claimed);

        let claim = PortClaim {
            claims: &self.claimed_ports,
            port,
        };
        Ok((instance, Some(claim)))
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Instance>> {
        self.servers
            .read()
            .await
            .iter()
            .find(|s| s.id() == id)
            .cloned()
    }

    pub async fn list_info(&self) -> Vec<InstanceInfo> {
        self.servers.read().await.iter().map(|s| s.info()).collect()
    }

    pub async fn len(&self) -> usize {
        self.servers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.servers.read().await.is_empty()
    }

    /// Stop monitors and detach streams; containers keep running
    pub async fn shutdown(&self) {
        let servers: Vec<_> = self.servers.read().await.clone();
        for server in servers {
            server.shutdown().await;
        }
        info!("Fleet shut down");
    }
}
