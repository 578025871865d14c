//! Server events and status

use serde::{Deserialize, Serialize};

/// Instance run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Status {
    Off,
    Starting,
    Running,
    Stopping,
}

impl Status {
    pub fn is_off(&self) -> bool {
        matches!(self, Status::Off)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Status::Off => "Off",
            Status::Starting => "Starting",
            Status::Running => "Running",
            Status::Stopping => "Stopping",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Events published on an instance's bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    StatusChange(Status),
    /// Progress or warning message for the console
    Announcement(String),
    Block(bool),
    Installed(bool),
    /// One chunk of console output, ANSI sequences removed
    Console(String),
}

/// Point-in-time view sent to new telemetry subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: Status,
    pub installed: bool,
    pub blocked: bool,
}
