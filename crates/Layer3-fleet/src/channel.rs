//! Live telemetry channel
//!
//! One session per connected client and instance. The handshake checks the
//! shared API secret; afterwards the session yields the instance's events as
//! wire messages and serves bounded file transfers through the sandbox.

use crate::registry::Fleet;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use ssm_foundation::{ActionCode, Error, EventRecord, Result};
use ssm_server::{Instance, ServerEvent, Status, StatusSnapshot};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

/// Messages sent to a connected client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ChannelMessage {
    InitialStatus(StatusSnapshot),
    StatusUpdate(Status),
    Announcement(String),
    Block(bool),
    Installed(bool),
    Console { line: String },
    /// Transfer finished
    Status(String),
    /// Transfer rejected; the client is disconnected after this
    Fail(String),
}

impl ChannelMessage {
    pub fn done() -> Self {
        ChannelMessage::Status("done".to_string())
    }

    pub fn fail(err: &Error) -> Self {
        ChannelMessage::Fail(err.public_message())
    }

    /// Wire form of an instance event; console noise maps to `None`
    pub fn from_event(event: ServerEvent) -> Option<Self> {
        Some(match event {
            ServerEvent::StatusChange(status) => ChannelMessage::StatusUpdate(status),
            ServerEvent::Announcement(text) => ChannelMessage::Announcement(text),
            ServerEvent::Block(blocked) => ChannelMessage::Block(blocked),
            ServerEvent::Installed(installed) => ChannelMessage::Installed(installed),
            ServerEvent::Console(data) => ChannelMessage::Console {
                line: console_line(&data)?,
            },
        })
    }
}

/// Drop `\r\n`, terminate with `\n`, and skip lines with at most one visible character
fn console_line(data: &str) -> Option<String> {
    if data.chars().filter(|c| !c.is_whitespace()).count() <= 1 {
        return None;
    }
    Some(format!("{}\n", data.replace("\r\n", "")))
}

/// Requests a client may send
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientRequest {
    GetStatus,
    Download { path: String },
    Upload { path: String, name: String },
}

// ============================================================================
// TelemetryHub
// ============================================================================

pub struct TelemetryHub {
    fleet: Arc<Fleet>,
    secret: String,
    max_upload_bytes: u64,
}

impl TelemetryHub {
    pub fn new(fleet: Arc<Fleet>) -> Self {
        let config = &fleet.context().config;
        let secret = config.api.secret.clone();
        let max_upload_bytes = config.socket.max_upload_bytes();
        Self {
            fleet,
            secret,
            max_upload_bytes,
        }
    }

    /// Handshake for the channel of instance `id`
    pub async fn connect(&self, id: &str, secret: &str) -> Result<ChannelSession> {
        if self.secret.is_empty() || !secrets_match(&self.secret, secret) {
            warn!(server_id = %id, "Channel handshake rejected");
            return Err(Error::Unauthorized);
        }
        let instance = self.fleet.get(id).await.ok_or(ActionCode::NotFound)?;
        info!(server_id = %id, "Channel connected");
        Ok(ChannelSession {
            events: instance.events().receiver(),
            instance,
            max_upload_bytes: self.max_upload_bytes,
        })
    }
}

/// Compares fixed-length digests without an early exit, so timing reveals
/// neither the secret's length nor the first differing byte
fn secrets_match(expected: &str, given: &str) -> bool {
    let expected = Sha1::digest(expected.as_bytes());
    let given = Sha1::digest(given.as_bytes());
    expected
        .iter()
        .zip(given.iter())
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

// ============================================================================
// ChannelSession
// ============================================================================

pub struct ChannelSession {
    instance: Arc<Instance>,
    events: broadcast::Receiver<EventRecord<ServerEvent>>,
    max_upload_bytes: u64,
}

impl ChannelSession {
    pub fn id(&self) -> &str {
        self.instance.id()
    }

    /// First message after the handshake
    pub fn initial_status(&self) -> ChannelMessage {
        ChannelMessage::InitialStatus(self.instance.snapshot())
    }

    /// Answer to `getStatus`
    pub fn status(&self) -> ChannelMessage {
        ChannelMessage::StatusUpdate(self.instance.status())
    }

    /// Next message to forward; `None` once the instance's bus is gone
    pub async fn next_message(&mut self) -> Option<ChannelMessage> {
        loop {
            match self.events.recv().await {
                Ok(record) => {
                    if let Some(message) = ChannelMessage::from_event(record.payload) {
                        return Some(message);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(server_id = %self.id(), skipped, "Channel client lagging, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Open a sandboxed file for download
    pub async fn download(&self, path: &str) -> Result<(tokio::fs::File, u64)> {
        let opened = self.instance.sandbox().open_download(path).await?;
        debug!(server_id = %self.id(), path = %path, size = opened.1, "Download started");
        Ok(opened)
    }

    /// Store an upload as `path/name`, at most `socket.maxFileSize` MB
    pub async fn upload<R>(&self, path: &str, name: &str, reader: R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        if path.is_empty() || name.is_empty() {
            return Err(Error::validation("path"));
        }
        let written = self
            .instance
            .sandbox()
            .write_upload(path, name, reader, self.max_upload_bytes)
            .await?;
        debug!(server_id = %self.id(), path = %path, name = %name, written, "Upload stored");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_line_filter() {
        assert_eq!(console_line("Done!\r\n"), Some("Done!\n".to_string()));
        assert_eq!(console_line("> \r\n"), None);
        assert_eq!(console_line("   "), None);
        assert_eq!(console_line(" a b "), Some(" a b \n".to_string()));
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(ChannelMessage::Console {
            line: "hi\n".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({ "event": "console", "data": { "line": "hi\n" } }));

        let json = serde_json::to_value(ChannelMessage::StatusUpdate(Status::Running)).unwrap();
        assert_eq!(json, serde_json::json!({ "event": "statusUpdate", "data": "running" }));

        let request: ClientRequest =
            serde_json::from_str(r#"{ "event": "upload", "data": { "path": "plugins", "name": "a.jar" } }"#)
                .unwrap();
        assert_eq!(
            request,
            ClientRequest::Upload {
                path: "plugins".to_string(),
                name: "a.jar".to_string()
            }
        );
        let request: ClientRequest = serde_json::from_str(r#"{ "event": "getStatus" }"#).unwrap();
        assert_eq!(request, ClientRequest::GetStatus);
    }

    #[test]
    fn test_fail_hides_details() {
        let message = ChannelMessage::fail(&Error::Engine("socket /var/run/docker.sock".to_string()));
        assert_eq!(message, ChannelMessage::Fail("An internal error occurred".to_string()));
    }

    #[test]
    fn test_secrets_match() {
        assert!(secrets_match("secret", "secret"));
        for wrong in ["", "secre", "secreT", "secret ", "xsecret"] {
            assert!(!secrets_match("secret", wrong), "{:?}", wrong);
        }
    }
}
