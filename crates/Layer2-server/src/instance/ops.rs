//! Lifecycle operations
//!
//! Preconditions are checked before `blocked` is taken, so a rejected call
//! changes nothing. Operations that take `blocked` release it on every exit.

use super::Instance;
use crate::event::Status;
use crate::record::InstanceRecord;
use sha1::{Digest, Sha1};
use ssm_foundation::{ActionCode, Error, Result};
use std::future::Future;
use tracing::{error, info, warn};

impl Instance {
    // ========================================================================
    // Guards
    // ========================================================================

    fn ensure_unblocked(&self) -> Result<()> {
        if self.state.is_blocked() {
            return Err(ActionCode::Locked.into());
        }
        Ok(())
    }

    fn ensure_off(&self) -> Result<()> {
        if !self.state.status().is_off() {
            return Err(ActionCode::NotOff.into());
        }
        Ok(())
    }

    /// Run `op` holding `blocked`
    async fn blocking<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        let guard = self.state.block().await?;
        let result = op.await;
        guard.release().await;
        result
    }

    // ========================================================================
    // Provisioning
    // ========================================================================

    /// Create the OS account and container, then write the identity marker
    pub async fn create(&self, password: &str) -> Result<()> {
        if password.trim().is_empty() {
            return Err(Error::validation("password"));
        }
        self.ensure_unblocked()?;

        self.blocking(async {
            self.accounts.create(self.id(), password).await?;
            self.driver.create().await?;
            self.sandbox.create_identity().await?;
            info!(server_id = %self.id(), "Server created");
            Ok(())
        })
        .await
    }

    pub async fn install(&self) -> Result<()> {
        self.ensure_unblocked()?;
        if self.state.is_installed() {
            return Err(ActionCode::AlreadyInstalled.into());
        }
        self.ensure_off()?;

        self.blocking(async {
            self.state.announce("Installing server...").await;
            self.persist()?;
            self.state.announce("Installing server files...").await;
            self.shell.run_stack(&self.state.game().install).await?;
            self.state
                .announce("Finished installing server. You may now start it!")
                .await;
            Ok(())
        })
        .await?;

        self.state.set_installed(true).await;
        self.persist()
    }

    pub async fn reinstall(&self) -> Result<()> {
        self.ensure_unblocked()?;
        if !self.state.is_installed() {
            return Err(ActionCode::NotInstalled.into());
        }
        self.ensure_off()?;

        self.blocking(async {
            self.state.announce("Reinstalling server...").await;
            self.persist()?;

            self.state.announce("Removing old server data...").await;
            self.accounts.clear(self.id()).await?;
            self.sandbox.create_identity().await?;

            self.state.announce("Installing server files...").await;
            self.shell.run_stack(&self.state.game().install).await?;

            self.state.announce("Rebuilding container...").await;
            self.rebuild_container().await?;

            self.state
                .announce("Finished reinstalling server. You may now start it!")
                .await;
            Ok(())
        })
        .await
    }

    /// Tear everything down. The fleet evicts the instance only on `Ok`.
    pub async fn remove(&self) -> Result<()> {
        self.ensure_unblocked()?;
        self.ensure_off()?;

        self.blocking(async {
            if let Err(e) = self.driver.destroy().await {
                error!(server_id = %self.id(), error = %e, "Failed to remove container");
                return Err(ActionCode::ContainerRemoveFailed.into());
            }
            self.accounts.remove(self.id()).await?;
            self.ctx.store.remove(&self.state.record().file_name())?;
            Ok(())
        })
        .await?;

        self.monitor.stop();
        info!(server_id = %self.id(), "Server removed");
        Ok(())
    }

    /// Replace game, players, build and port from `record`, then rebuild.
    ///
    /// Only this instance is checked; port uniqueness across the host is
    /// the fleet's job (`Fleet::reload_server`).
    pub async fn reload_config(&self, record: InstanceRecord) -> Result<()> {
        record.validate()?;
        if record.id != self.id() {
            return Err(Error::validation("id"));
        }
        self.ensure_unblocked()?;
        self.ensure_off()?;

        self.blocking(async {
            self.state.update_record(|current| {
                current.game = record.game;
                current.players = record.players;
                current.build = record.build;
                current.port = record.port;
            });
            self.persist()?;
            self.rebuild_container().await?;
            self.shell.run_stack(&self.state.game().update).await?;
            info!(server_id = %self.id(), "Config reloaded");
            Ok(())
        })
        .await
    }

    async fn rebuild_container(&self) -> Result<()> {
        self.driver.rebuild().await.map_err(|e| {
            error!(server_id = %self.id(), error = %e, "Failed to rebuild container");
            ActionCode::ContainerRebuildFailed.into()
        })
    }

    // ========================================================================
    // Plugins
    // ========================================================================

    pub async fn install_plugin(&self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::validation("plugin"));
        }
        self.ensure_unblocked()?;
        self.ensure_off()?;

        let plugin = self
            .ctx
            .catalog
            .plugin(name)
            .ok_or(ActionCode::InvalidPlugin)?;
        if !plugin.supports(&self.state.game()) {
            return Err(ActionCode::PluginNotSupported.into());
        }
        if self.state.record().plugin(name).is_some() {
            return Err(ActionCode::PluginInstalled.into());
        }

        self.blocking(async {
            let added = self.state.update_record(|record| {
                if record.plugin(&plugin.name).is_some() {
                    return false;
                }
                record.plugins.push(plugin.clone());
                true
            });
            if !added {
                return Err(ActionCode::PluginInstalled.into());
            }
            self.persist()?;
            self.shell.run_stack(&plugin.install).await?;
            info!(server_id = %self.id(), plugin = %plugin.name, "Plugin installed");
            Ok(())
        })
        .await
    }

    pub async fn remove_plugin(&self, name: &str) -> Result<()> {
        self.ensure_unblocked()?;
        self.ensure_off()?;
        if self.state.record().plugin(name).is_none() {
            return Err(ActionCode::PluginNotInstalled.into());
        }

        self.blocking(async {
            let plugin = self
                .state
                .record()
                .plugin(name)
                .cloned()
                .ok_or(ActionCode::PluginNotInstalled)?;
            self.shell.run_stack(&plugin.remove).await?;
            self.state
                .update_record(|record| record.plugins.retain(|p| p.name != plugin.name));
            self.persist()?;
            info!(server_id = %self.id(), plugin = %plugin.name, "Plugin removed");
            Ok(())
        })
        .await
    }

    // ========================================================================
    // Account
    // ========================================================================

    pub async fn change_password(&self, password: &str) -> Result<()> {
        if password.trim().is_empty() {
            return Err(Error::validation("password"));
        }
        self.accounts.reset_password(self.id(), password).await
    }

    // ========================================================================
    // Runtime
    // ========================================================================

    pub async fn start(&self) -> Result<()> {
        self.ensure_unblocked()?;
        self.ensure_off()?;

        self.state.announce("Verifying server integrity...").await;
        self.verify_files().await?;
        self.state.announce("Server files checked out.").await;
        self.state.announce("Bootstrapping server...").await;

        if !self
            .state
            .compare_and_set_status(Status::Off, Status::Starting)
            .await
        {
            return Err(ActionCode::NotOff.into());
        }
        self.monitor.start();

        if let Err(e) = self.driver.start_container().await {
            error!(server_id = %self.id(), error = %e, "Failed to start container");
            self.monitor.stop();
            self.driver.close_streams().await;
            if let Err(stop_err) = self.driver.ensure_stopped().await {
                warn!(server_id = %self.id(), error = %stop_err, "Container may still be running");
            }
            self.state.set_status(Status::Off).await;
            return Err(e);
        }
        Ok(())
    }

    /// Every verify rule must match the SHA-1 of its file
    async fn verify_files(&self) -> Result<()> {
        for rule in &self.state.game().verify {
            let path = self.sandbox.extend_path(&rule.path);
            let contents = match tokio::fs::read(&path).await {
                Ok(contents) => contents,
                Err(e) => {
                    warn!(server_id = %self.id(), file = %rule.path, error = %e, "Verify file unreadable");
                    return Err(ActionCode::ReinstallRequired.into());
                }
            };
            let digest = hex::encode(Sha1::digest(&contents));
            if !digest.eq_ignore_ascii_case(&rule.sha1) {
                warn!(server_id = %self.id(), file = %rule.path, "Verify checksum mismatch");
                return Err(ActionCode::ReinstallRequired.into());
            }
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if self.state.status() != Status::Running {
            return Err(ActionCode::NotRunning.into());
        }
        let command = self.state.game().stop_console_command;
        self.driver.write_to_process(&command).await?;
        self.state.set_status(Status::Stopping).await;
        Ok(())
    }

    /// Write a console command to the game process
    pub async fn execute_command(&self, command: &str) -> Result<()> {
        if command.trim().is_empty() {
            return Err(Error::validation("command"));
        }
        if self.state.status() != Status::Running {
            return Err(ActionCode::NotRunning.into());
        }
        if command == self.state.game().stop_console_command {
            self.state.set_status(Status::Stopping).await;
        }
        self.driver.write_to_process(command).await
    }

    pub async fn force_kill(&self) -> Result<()> {
        if self.state.status().is_off() {
            return Err(ActionCode::NotRunning.into());
        }
        self.kill().await
    }

    /// Kill path: no status precondition
    pub async fn kill(&self) -> Result<()> {
        self.monitor.stop();
        self.driver.force_stop().await
    }
}
