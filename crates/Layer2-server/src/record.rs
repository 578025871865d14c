//! Instance records - the persisted form of one server

use crate::definition::{GameDefinition, PluginDefinition};
use regex::Regex;
use serde::{Deserialize, Serialize};
use ssm_foundation::{Error, Result};

/// Valid instance id; the id doubles as OS username and container name
const ID_PATTERN: &str = r"^[a-z_][a-z0-9_-]{0,31}$";

/// Block-IO weights the engine accepts; 0 leaves the weight unset
const IO_WEIGHT_RANGE: std::ops::RangeInclusive<u16> = 10..=1000;

/// Smallest memory limit in MB the engine will create a container with
const MIN_MEM_MB: u64 = 6;

/// Resource quota for the instance's container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildProfile {
    /// Block-IO weight (10-1000, or 0 for the engine default)
    pub io: u16,
    /// CPU quota in thousandths of a core per period; 0 is unlimited
    pub cpu: u32,
    /// Memory in MB
    pub mem: u64,
}

impl BuildProfile {
    pub fn validate(&self) -> Result<()> {
        if self.io != 0 && !IO_WEIGHT_RANGE.contains(&self.io) {
            return Err(Error::validation("build.io"));
        }
        if self.mem < MIN_MEM_MB {
            return Err(Error::validation("build.mem"));
        }
        Ok(())
    }
}

impl Default for BuildProfile {
    fn default() -> Self {
        Self {
            io: 500,
            cpu: 0,
            mem: 1024,
        }
    }
}

/// One JSON document per instance under `servers/`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,

    /// Snapshot of the game definition at install time
    pub game: GameDefinition,

    pub port: u16,

    #[serde(default)]
    pub build: BuildProfile,

    #[serde(default)]
    pub installed: bool,

    #[serde(default)]
    pub players: u32,

    /// Snapshots of the installed plugins
    #[serde(default)]
    pub plugins: Vec<PluginDefinition>,
}

impl InstanceRecord {
    pub fn new(id: impl Into<String>, game: GameDefinition, port: u16) -> Self {
        Self {
            id: id.into(),
            game,
            port,
            build: BuildProfile::default(),
            installed: false,
            players: 0,
            plugins: Vec::new(),
        }
    }

    pub fn with_build(mut self, build: BuildProfile) -> Self {
        self.build = build;
        self
    }

    pub fn with_players(mut self, players: u32) -> Self {
        self.players = players;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_id(&self.id)?;
        self.game.validate()?;
        if self.port == 0 {
            return Err(Error::validation("port"));
        }
        self.build.validate()?;
        for plugin in &self.plugins {
            plugin.validate()?;
        }
        Ok(())
    }

    /// Document name in the servers store
    pub fn file_name(&self) -> String {
        record_file_name(&self.id)
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginDefinition> {
        self.plugins.iter().find(|p| p.name == name)
    }
}

pub fn record_file_name(id: &str) -> String {
    format!("{}.json", id)
}

/// Check that an id is usable as an OS username and container name
pub fn validate_id(id: &str) -> Result<()> {
    let pattern =
        Regex::new(ID_PATTERN).map_err(|e| Error::Internal(format!("id pattern: {}", e)))?;
    if pattern.is_match(id) {
        Ok(())
    } else {
        Err(Error::validation("id"))
    }
}
