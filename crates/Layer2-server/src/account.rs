//! OS account provisioning and file ownership

use crate::executor::{CommandSpec, ProcessSpawner};
use nix::unistd::{chown, Gid, Uid, User};
use ssm_foundation::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const NEW_USER_SCRIPT: &str = "newUser.sh";
const REMOVE_USER_SCRIPT: &str = "removeUser.sh";
const CLEAR_USER_SCRIPT: &str = "clearUser.sh";
const RESET_PASSWORD_SCRIPT: &str = "resetPassword.sh";

/// Quote a value for `sh`: wrap in double quotes and backslash-escape
/// `"`, whitespace, `'`, `` ` ``, `$` and `\`.
pub fn shell_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\'' | '$' | '`' | '\\') || c.is_whitespace() {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('"');
    escaped
}

/// Runs the account scripts in the configured scripts directory
pub struct AccountProvisioner {
    scripts: PathBuf,
    spawner: Arc<dyn ProcessSpawner>,
    timeout: Duration,
}

impl AccountProvisioner {
    pub fn new(scripts: impl Into<PathBuf>, spawner: Arc<dyn ProcessSpawner>, timeout: Duration) -> Self {
        Self {
            scripts: scripts.into(),
            spawner,
            timeout,
        }
    }

    pub async fn create(&self, id: &str, password: &str) -> Result<()> {
        self.run_script(NEW_USER_SCRIPT, &[id.to_string(), shell_escape(password)])
            .await
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.run_script(REMOVE_USER_SCRIPT, &[id.to_string()]).await
    }

    /// Wipe the account's home directory
    pub async fn clear(&self, id: &str) -> Result<()> {
        self.run_script(CLEAR_USER_SCRIPT, &[id.to_string()]).await
    }

    pub async fn reset_password(&self, id: &str, password: &str) -> Result<()> {
        self.run_script(RESET_PASSWORD_SCRIPT, &[id.to_string(), shell_escape(password)])
            .await
    }

    /// Scripts go through `sh -c` so escaped arguments are unquoted by the shell
    async fn run_script(&self, script: &str, args: &[String]) -> Result<()> {
        let path = self.scripts.join(script);
        let mut line = shell_escape(&path.to_string_lossy());
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }

        let spec = CommandSpec::new("sh").args(["-c".to_string(), line]);
        let result = self.spawner.run(&spec, self.timeout).await?;
        if !result.success() {
            error!(script, code = ?result.code, output = %result.output.trim(), "Account script failed");
            return Err(Error::Process(format!(
                "{} exited with {:?}",
                script, result.code
            )));
        }
        info!(script, user = args.first().map(String::as_str).unwrap_or(""), "Account script finished");
        Ok(())
    }
}

/// Numeric owner of an instance's files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    pub fn lookup(username: &str) -> Result<Self> {
        let user = User::from_name(username)
            .map_err(|e| Error::Internal(format!("user lookup for {}: {}", username, e)))?
            .ok_or_else(|| Error::Internal(format!("no OS account named {}", username)))?;
        Ok(Self {
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
        })
    }

    pub fn apply(&self, path: &Path) -> Result<()> {
        chown(
            path,
            Some(Uid::from_raw(self.uid)),
            Some(Gid::from_raw(self.gid)),
        )
        .map_err(|e| Error::Internal(format!("chown {}: {}", path.display(), e)))
    }
}
