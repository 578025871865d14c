//! Process spawner - runs one host command and waits for it

use async_trait::async_trait;
use ssm_foundation::{Error, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Program, arguments and working directory of one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Command line for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Exit code plus combined stdout/stderr
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitResult {
    /// `None` when the process was killed by a signal
    pub code: Option<i32>,
    pub output: String,
}

impl ExitResult {
    pub fn new(code: i32) -> Self {
        Self {
            code: Some(code),
            output: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Spawns host processes
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Spawner name (for debugging)
    fn name(&self) -> &'static str;

    /// Run to completion; exceeding `limit` kills the process and fails with `Timeout`
    async fn run(&self, spec: &CommandSpec, limit: Duration) -> Result<ExitResult>;
}

/// Spawner backed by `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct SystemSpawner;

impl SystemSpawner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessSpawner for SystemSpawner {
    fn name(&self) -> &'static str {
        "system"
    }

    async fn run(&self, spec: &CommandSpec, limit: Duration) -> Result<ExitResult> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }

        debug!(program = %spec.program, "Spawning process");
        let child = cmd
            .spawn()
            .map_err(|e| Error::Process(format!("Failed to spawn {}: {}", spec.program, e)))?;

        // Dropping the wait future on timeout kills the child
        match timeout(limit, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut content = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.is_empty() {
                    if !content.is_empty() {
                        content.push_str("\n--- stderr ---\n");
                    }
                    content.push_str(&stderr);
                }
                Ok(ExitResult {
                    code: output.status.code(),
                    output: content,
                })
            }
            Ok(Err(e)) => Err(Error::Process(format!("{}: {}", spec.program, e))),
            Err(_) => Err(Error::Timeout(format!(
                "{} did not finish within {}s",
                spec.program,
                limit.as_secs()
            ))),
        }
    }
}
