//! Game and plugin catalog loaded from `games/` and `plugins/`

use crate::definition::{GameDefinition, PluginDefinition};
use ssm_foundation::{JsonStore, Result};
use std::collections::HashMap;
use tracing::{info, warn};

pub const GAMES_DIR: &str = "games";
pub const PLUGINS_DIR: &str = "plugins";

/// Lookup of catalog entries by name
pub trait PluginCatalog: Send + Sync {
    fn plugin(&self, name: &str) -> Option<PluginDefinition>;

    fn game(&self, name: &str) -> Option<GameDefinition>;
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    games: HashMap<String, GameDefinition>,
    plugins: HashMap<String, PluginDefinition>,
}

impl Catalog {
    /// Load every definition under the storage root; invalid files are logged and skipped
    pub fn load(storage: &JsonStore) -> Result<Self> {
        let mut games = HashMap::new();
        for (file, game) in storage.sub(GAMES_DIR).load_all::<GameDefinition>()? {
            match game.validate() {
                Ok(()) => {
                    games.insert(game.name.clone(), game);
                }
                Err(e) => warn!(file = %file, error = %e, "Skipping invalid game definition"),
            }
        }

        let mut plugins = HashMap::new();
        for (file, plugin) in storage.sub(PLUGINS_DIR).load_all::<PluginDefinition>()? {
            match plugin.validate() {
                Ok(()) => {
                    plugins.insert(plugin.name.clone(), plugin);
                }
                Err(e) => warn!(file = %file, error = %e, "Skipping invalid plugin definition"),
            }
        }

        info!(games = games.len(), plugins = plugins.len(), "Catalog loaded");
        Ok(Self { games, plugins })
    }

    pub fn from_parts(
        games: impl IntoIterator<Item = GameDefinition>,
        plugins: impl IntoIterator<Item = PluginDefinition>,
    ) -> Self {
        Self {
            games: games.into_iter().map(|g| (g.name.clone(), g)).collect(),
            plugins: plugins.into_iter().map(|p| (p.name.clone(), p)).collect(),
        }
    }

    /// Games sorted by name
    pub fn games(&self) -> Vec<&GameDefinition> {
        let mut games: Vec<_> = self.games.values().collect();
        games.sort_by(|a, b| a.name.cmp(&b.name));
        games
    }

    /// Plugins sorted by name
    pub fn plugins(&self) -> Vec<&PluginDefinition> {
        let mut plugins: Vec<_> = self.plugins.values().collect();
        plugins.sort_by(|a, b| a.name.cmp(&b.name));
        plugins
    }
}

impl PluginCatalog for Catalog {
    fn plugin(&self, name: &str) -> Option<PluginDefinition> {
        self.plugins.get(name).cloned()
    }

    fn game(&self, name: &str) -> Option<GameDefinition> {
        self.games.get(name).cloned()
    }
}
