//! Shell executor - command stacks run as the instance's OS user

use super::process::{CommandSpec, ProcessSpawner};
use crate::definition::ShellCommand;
use ssm_foundation::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

pub struct ShellExecutor {
    user: String,
    root: PathBuf,
    spawner: Arc<dyn ProcessSpawner>,
    timeout: Duration,
}

impl ShellExecutor {
    pub fn new(
        user: impl Into<String>,
        root: impl Into<PathBuf>,
        spawner: Arc<dyn ProcessSpawner>,
        timeout: Duration,
    ) -> Self {
        Self {
            user: user.into(),
            root: root.into(),
            spawner,
            timeout,
        }
    }

    /// `su -s /bin/bash -l <user> -c "cd <root> && <command>"`
    pub fn command_for(&self, command: &ShellCommand) -> CommandSpec {
        CommandSpec::new("su").args([
            "-s".to_string(),
            "/bin/bash".to_string(),
            "-l".to_string(),
            self.user.clone(),
            "-c".to_string(),
            format!("cd {} && {}", self.root.display(), command.command),
        ])
    }

    /// Run each command in order; the first failure aborts the rest
    pub async fn run_stack(&self, stack: &[ShellCommand]) -> Result<()> {
        let total = stack.len();
        for (index, command) in stack.iter().enumerate() {
            let spec = self.command_for(command);
            info!(
                user = %self.user,
                step = index + 1,
                total,
                "Running command: {}",
                command.command
            );

            let result = self.spawner.run(&spec, self.timeout).await.map_err(|e| {
                error!(user = %self.user, step = index + 1, error = %e, "Command failed to run");
                e
            })?;

            for line in result.output.lines() {
                debug!(user = %self.user, "{}", line);
            }

            if !result.success() {
                error!(
                    user = %self.user,
                    step = index + 1,
                    code = ?result.code,
                    "Command exited unsuccessfully, aborting stack"
                );
                return Err(Error::Process(format!(
                    "command {} of {} exited with {:?}",
                    index + 1,
                    total,
                    result.code
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSpawner;

    fn stack(commands: &[&str]) -> Vec<ShellCommand> {
        commands.iter().map(|c| ShellCommand::new(*c)).collect()
    }

    #[test]
    fn test_command_for_runs_as_user_in_root() {
        let shell = ShellExecutor::new(
            "alice",
            "/home/alice/public",
            Arc::new(ScriptedSpawner::new()),
            Duration::from_secs(1),
        );
        let spec = shell.command_for(&ShellCommand::new("./install.sh"));

        assert_eq!(spec.program, "su");
        assert_eq!(
            spec.args,
            vec![
                "-s",
                "/bin/bash",
                "-l",
                "alice",
                "-c",
                "cd /home/alice/public && ./install.sh"
            ]
        );
    }

    #[tokio::test]
    async fn test_stack_runs_in_order() {
        let spawner = Arc::new(ScriptedSpawner::new());
        let shell = ShellExecutor::new("alice", "/srv", spawner.clone(), Duration::from_secs(1));

        shell.run_stack(&stack(&["one", "two", "three"])).await.unwrap();

        assert_eq!(
            spawner.shell_commands(),
            vec!["cd /srv && one", "cd /srv && two", "cd /srv && three"]
        );
    }

    #[tokio::test]
    async fn test_failure_aborts_stack() {
        let spawner = Arc::new(ScriptedSpawner::new());
        spawner.fail_when_contains("two", 1);
        let shell = ShellExecutor::new("alice", "/srv", spawner.clone(), Duration::from_secs(1));

        let err = shell
            .run_stack(&stack(&["one", "two", "three"]))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Process(_)));
        assert_eq!(spawner.shell_commands().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_stack() {
        let spawner = Arc::new(ScriptedSpawner::new());
        let shell = ShellExecutor::new("alice", "/srv", spawner.clone(), Duration::from_secs(1));
        shell.run_stack(&[]).await.unwrap();
        assert!(spawner.calls().is_empty());
    }
}
