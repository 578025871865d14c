//! Collaborators shared by every instance on the host

use crate::catalog::PluginCatalog;
use crate::container::ContainerEngine;
use crate::executor::ProcessSpawner;
use crate::health::QueryProbe;
use ssm_foundation::{JsonStore, ManagerConfig};
use std::sync::Arc;

/// Directory of instance records under the storage root
pub const SERVERS_DIR: &str = "servers";

/// Everything an instance needs from its host, passed explicitly to constructors
#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<ManagerConfig>,
    pub engine: Arc<dyn ContainerEngine>,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub probe: Arc<dyn QueryProbe>,
    pub catalog: Arc<dyn PluginCatalog>,
    /// Where instance records are persisted
    pub store: JsonStore,
}

impl ServerContext {
    pub fn new(
        config: Arc<ManagerConfig>,
        engine: Arc<dyn ContainerEngine>,
        spawner: Arc<dyn ProcessSpawner>,
        probe: Arc<dyn QueryProbe>,
        catalog: Arc<dyn PluginCatalog>,
    ) -> Self {
        let store = config.storage().sub(SERVERS_DIR);
        Self {
            config,
            engine,
            spawner,
            probe,
            catalog,
            store,
        }
    }

    pub fn with_store(mut self, store: JsonStore) -> Self {
        self.store = store;
        self
    }
}
