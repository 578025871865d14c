//! Log file tailing
//!
//! Polls a file for appended bytes and yields complete lines. A file that
//! shrinks (truncated or rotated) is read again from the start.

use crate::sandbox::Sandbox;
use crate::state::InstanceState;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::warn;

/// How often the log file is polled
pub const TAIL_INTERVAL: Duration = Duration::from_millis(250);

const LOG_UNAVAILABLE: &str =
    "Failed to find log file for server. You may need to restart to see log messages again.";

pub struct LogTail {
    path: PathBuf,
    offset: u64,
    pending: String,
}

impl LogTail {
    /// Follow `path` from its beginning
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            pending: String::new(),
        }
    }

    pub fn reset(&mut self) {
        self.offset = 0;
        self.pending.clear();
    }

    /// Read whatever was appended since the last poll
    pub async fn poll(&mut self) -> std::io::Result<Vec<String>> {
        let len = tokio::fs::metadata(&self.path).await?.len();
        if len < self.offset {
            self.reset();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        file.take(len - self.offset).read_to_end(&mut buf).await?;
        self.offset += buf.len() as u64;
        self.pending.push_str(&String::from_utf8_lossy(&buf));

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            lines.push(line.trim_end_matches(&['\r', '\n'][..]).to_string());
        }
        Ok(lines)
    }
}

/// Forward log lines to the console until the task is aborted.
///
/// On a read error the "log unavailable" announcement is made once, then
/// the file is recreated and following resumes from its start.
pub(crate) async fn follow(
    mut tail: LogTail,
    relative: String,
    state: Arc<InstanceState>,
    sandbox: Arc<Sandbox>,
) {
    let mut announced = false;
    let mut ticker = tokio::time::interval(TAIL_INTERVAL);
    loop {
        ticker.tick().await;
        match tail.poll().await {
            Ok(lines) => {
                for line in lines {
                    state.log_console(&line).await;
                }
            }
            Err(e) => {
                if !announced {
                    warn!(server_id = %state.id(), error = %e, "Log file unavailable");
                    state.announce(LOG_UNAVAILABLE).await;
                    announced = true;
                }
                if sandbox.ensure_file(&relative).await.is_ok() {
                    tail.reset();
                    announced = false;
                }
            }
        }
    }
}
