//! Catalog definitions - games and plugins
//!
//! The on-disk JSON keeps its historical camelCase field names
//! (`gamedig`, `dockerType`, ...) so existing storage directories load
//! unchanged; the Rust names describe what the fields mean.

use serde::{Deserialize, Serialize};
use ssm_foundation::{Error, Result};

/// One step of an install/update/plugin command stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellCommand {
    pub command: String,
}

impl ShellCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

/// File that must match a known SHA-1 before the server may start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyRule {
    /// Path relative to the sandbox root
    pub path: String,
    /// Lowercase hex digest
    pub sha1: String,
}

/// Game query protocol used by the health monitor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthProbe {
    #[serde(default)]
    pub active: bool,
    /// Protocol id understood by the query collaborator
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFile {
    #[serde(default)]
    pub use_log_file: bool,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingPolicy {
    #[serde(default)]
    pub log_file: LogFile,
    /// Forward the container's primary output to the console
    #[serde(default = "default_true")]
    pub use_stdout: bool,
}

impl Default for LoggingPolicy {
    fn default() -> Self {
        Self {
            log_file: LogFile::default(),
            use_stdout: true,
        }
    }
}

fn default_true() -> bool {
    true
}

// ============================================================================
// GameDefinition
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameDefinition {
    pub name: String,

    #[serde(rename = "gamedig", default)]
    pub health_probe: HealthProbe,

    #[serde(default)]
    pub install: Vec<ShellCommand>,

    #[serde(default)]
    pub update: Vec<ShellCommand>,

    /// Template with `{memory}`, `{port}` and `{players}` placeholders
    pub start_command: String,

    #[serde(default)]
    pub stop_console_command: String,

    /// Container image type tag
    #[serde(rename = "dockerType")]
    pub container_type: String,

    #[serde(default)]
    pub logging: LoggingPolicy,

    #[serde(default)]
    pub verify: Vec<VerifyRule>,
}

impl GameDefinition {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("game.name"));
        }
        if self.start_command.trim().is_empty() {
            return Err(Error::validation("game.startCommand"));
        }
        if self.container_type.trim().is_empty() {
            return Err(Error::validation("game.dockerType"));
        }
        if self.logging.log_file.use_log_file && self.logging.log_file.path.trim().is_empty() {
            return Err(Error::validation("game.logging.logFile.path"));
        }
        Ok(())
    }

    /// Live log file path, when the game logs to a file
    pub fn log_file(&self) -> Option<&str> {
        let log = &self.logging.log_file;
        if log.use_log_file && !log.path.is_empty() {
            Some(&log.path)
        } else {
            None
        }
    }

    /// Protocol id, when health probing is enabled for this game
    pub fn probe_protocol(&self) -> Option<&str> {
        if self.health_probe.active && !self.health_probe.id.is_empty() {
            Some(&self.health_probe.id)
        } else {
            None
        }
    }
}

// ============================================================================
// PluginDefinition
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDefinition {
    pub name: String,

    /// Name of the game this plugin targets
    pub game: String,

    #[serde(default)]
    pub install: Vec<ShellCommand>,

    #[serde(default)]
    pub remove: Vec<ShellCommand>,
}

impl PluginDefinition {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("plugin.name"));
        }
        if self.game.trim().is_empty() {
            return Err(Error::validation("plugin.game"));
        }
        Ok(())
    }

    pub fn supports(&self, game: &GameDefinition) -> bool {
        self.game == game.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_game_json_shape() {
        let json = r#"{
            "name": "minecraft",
            "gamedig": { "active": true, "id": "minecraftping" },
            "install": [{ "command": "wget -q https://example.com/server.jar" }],
            "update": [],
            "startCommand": "java -Xmx{memory}M -jar server.jar --port {port}",
            "stopConsoleCommand": "stop",
            "dockerType": "Java",
            "logging": { "logFile": { "useLogFile": true, "path": "logs/latest.log" }, "useStdout": false },
            "verify": [{ "path": "server.jar", "sha1": "abc" }]
        }"#;

        let game: GameDefinition = serde_json::from_str(json).unwrap();
        game.validate().unwrap();
        assert_eq!(game.container_type, "Java");
        assert_eq!(game.probe_protocol(), Some("minecraftping"));
        assert_eq!(game.log_file(), Some("logs/latest.log"));
        assert!(!game.logging.use_stdout);

        let back = serde_json::to_value(&game).unwrap();
        assert_eq!(back["gamedig"]["id"], "minecraftping");
        assert_eq!(back["dockerType"], "Java");
        assert_eq!(back["logging"]["logFile"]["useLogFile"], true);
    }

    #[test]
    fn test_minimal_game_defaults() {
        let json = r#"{ "name": "g", "startCommand": "./run", "dockerType": "Java" }"#;
        let game: GameDefinition = serde_json::from_str(json).unwrap();

        assert!(game.logging.use_stdout);
        assert_eq!(game.log_file(), None);
        assert_eq!(game.probe_protocol(), None);
        assert!(game.verify.is_empty());
    }

    #[test]
    fn test_game_validation() {
        let json = r#"{ "name": " ", "startCommand": "./run", "dockerType": "Java" }"#;
        let game: GameDefinition = serde_json::from_str(json).unwrap();
        assert!(matches!(game.validate(), Err(Error::Validation(f)) if f == "game.name"));
    }

    #[test]
    fn test_plugin_supports_game() {
        let game: GameDefinition =
            serde_json::from_str(r#"{ "name": "minecraft", "startCommand": "x", "dockerType": "Java" }"#)
                .unwrap();
        let plugin: PluginDefinition =
            serde_json::from_str(r#"{ "name": "essentials", "game": "minecraft" }"#).unwrap();
        assert!(plugin.supports(&game));

        let other = PluginDefinition {
            game: "terraria".to_string(),
            ..plugin
        };
        assert!(!other.supports(&game));
    }
}
