//! Error types for the manager
//!
//! Every layer reports through this one enum so the API surface can map
//! failures to stable reason codes without inspecting engine internals.

use std::fmt;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Reason codes for rejected or failed server actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionCode {
    /// Another lifecycle operation holds the instance
    Locked,
    /// Operation requires the instance to be off
    NotOff,
    /// Operation requires the instance to be running
    NotRunning,
    /// `install` on an installed instance
    AlreadyInstalled,
    /// `reinstall` on an instance that was never installed
    NotInstalled,
    /// Verify rules did not match the files on disk
    ReinstallRequired,
    NotFound,
    DuplicateId,
    PortInUse,
    PortsExhausted,
    InvalidPlugin,
    PluginNotSupported,
    PluginInstalled,
    PluginNotInstalled,
    InvalidContainerType,
    ContainerRemoveFailed,
    ContainerRebuildFailed,
}

impl ActionCode {
    /// Stable wire code
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionCode::Locked => "SERVER_LOCKED",
            ActionCode::NotOff => "SERVER_NOT_OFF",
            ActionCode::NotRunning => "SERVER_NOT_RUNNING",
            ActionCode::AlreadyInstalled => "REINSTALL_INSTEAD",
            ActionCode::NotInstalled => "INSTALL_INSTEAD",
            ActionCode::ReinstallRequired => "REINSTALL",
            ActionCode::NotFound => "SERVER_NOT_FOUND",
            ActionCode::DuplicateId => "SERVER_EXISTS",
            ActionCode::PortInUse => "PORT_IN_USE",
            ActionCode::PortsExhausted => "NO_FREE_PORT",
            ActionCode::InvalidPlugin => "INVALID_PLUGIN",
            ActionCode::PluginNotSupported => "PLUGIN_NOT_SUPPORTED",
            ActionCode::PluginInstalled => "PLUGIN_INSTALLED",
            ActionCode::PluginNotInstalled => "PLUGIN_NOT_INSTALLED",
            ActionCode::InvalidContainerType => "INVALID_CONTAINER_TYPE",
            ActionCode::ContainerRemoveFailed => "FAILED_TO_REMOVE_DOCKER",
            ActionCode::ContainerRebuildFailed => "FAILED_TO_INSTALL_DOCKER",
        }
    }
}

impl fmt::Display for ActionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Manager error type
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Caller input
    // ========================================================================
    #[error("Input malformed: {0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    // ========================================================================
    // Server state
    // ========================================================================
    #[error("Server action rejected: {0}")]
    Action(ActionCode),

    /// Carries the path the caller asked for, never the resolved host path
    #[error("File error: {0}")]
    File(String),

    // ========================================================================
    // Collaborators
    // ========================================================================
    #[error("Container engine error: {0}")]
    Engine(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // External conversions
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Validation error for a named field
    pub fn validation(field: impl Into<String>) -> Self {
        Error::Validation(field.into())
    }

    /// File error for a caller-supplied path
    pub fn file(path: impl Into<String>) -> Self {
        Error::File(path.into())
    }

    /// Whether the action failed with the given reason code
    pub fn is_action(&self, code: ActionCode) -> bool {
        matches!(self, Error::Action(c) if *c == code)
    }

    /// Errors whose message can be shown to an untrusted caller as-is
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::Unauthorized | Error::Action(_) | Error::File(_)
        )
    }

    /// Stable error family code for the API layer
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATIONERROR",
            Error::Unauthorized => "UNAUTHORIZED",
            Error::Action(_) => "SERVERERROR",
            Error::File(_) => "FILEERROR",
            _ => "INTERNALERROR",
        }
    }

    /// Message safe to cross the trust boundary.
    ///
    /// Engine, process and IO failures can embed host paths, so they are
    /// reduced to a generic message; callers are expected to have logged the
    /// full error already.
    pub fn public_message(&self) -> String {
        match self {
            Error::Validation(field) => format!("Input malformed: {}", field),
            Error::Unauthorized => "Unauthorized".to_string(),
            Error::Action(code) => code.as_str().to_string(),
            Error::File(path) => format!("File error: {}", path),
            Error::Timeout(_) => "Operation timed out".to_string(),
            _ => "An internal error occurred".to_string(),
        }
    }
}

impl From<ActionCode> for Error {
    fn from(code: ActionCode) -> Self {
        Error::Action(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_message_hides_host_details() {
        let err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "/home/alice/public/server.jar",
        ));
        assert!(!err.public_message().contains("/home"));
        assert!(!err.is_user_facing());

        let err = Error::Engine("no such container: alice".to_string());
        assert_eq!(err.public_message(), "An internal error occurred");
    }

    #[test]
    fn test_action_codes() {
        let err: Error = ActionCode::ReinstallRequired.into();
        assert!(err.is_action(ActionCode::ReinstallRequired));
        assert!(!err.is_action(ActionCode::Locked));
        assert_eq!(err.public_message(), "REINSTALL");
        assert_eq!(err.code(), "SERVERERROR");
    }

    #[test]
    fn test_file_error_keeps_caller_path() {
        let err = Error::file("../identity.json");
        assert_eq!(err.public_message(), "File error: ../identity.json");
        assert_eq!(err.code(), "FILEERROR");
    }
}
