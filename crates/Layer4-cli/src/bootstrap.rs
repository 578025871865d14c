//! Boot sequencing for the `ssmanager` binary

use anyhow::Context;
use ssm_fleet::Fleet;
use ssm_foundation::{ManagerConfig, Result};
use ssm_server::{
    Catalog, ContainerEngine, DockerEngine, GameQueryProbe, InstanceRecord, ServerContext,
    SystemSpawner, SERVERS_DIR,
};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Boot the fleet and serve until Ctrl-C
pub async fn run(config: ManagerConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let engine = connect_engine(&config)?;
    engine
        .ping()
        .await
        .with_context(|| format!("container engine unreachable at {}", config.docker.socket_path))?;

    for (container_type, image) in missing_images(engine.as_ref(), &config).await {
        warn!(
            container_type = %container_type,
            image = %image,
            "Image not present on the engine; servers of this type cannot be created"
        );
    }

    let fleet = boot(Arc::clone(&config), engine).await?;
    info!(servers = fleet.len().await, "Manager running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutting down");
    fleet.shutdown().await;
    Ok(())
}

/// Print the stored servers as JSON
pub async fn list(config: ManagerConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let engine = connect_engine(&config)?;
    let fleet = boot(config, engine).await?;
    let info = fleet.list_info().await;
    println!("{}", serde_json::to_string_pretty(&info)?);
    fleet.shutdown().await;
    Ok(())
}

fn connect_engine(config: &ManagerConfig) -> Result<Arc<dyn ContainerEngine>> {
    let engine = DockerEngine::connect(&config.docker.socket_path, config.timeouts.engine())?;
    Ok(Arc::new(engine))
}

/// Load the catalog and every stored server record
pub async fn boot(config: Arc<ManagerConfig>, engine: Arc<dyn ContainerEngine>) -> Result<Arc<Fleet>> {
    let catalog = Catalog::load(&config.storage())?;
    let probe = GameQueryProbe::new(config.timeouts.probe());
    let ctx = ServerContext::new(
        config,
        engine,
        Arc::new(SystemSpawner::new()),
        Arc::new(probe),
        Arc::new(catalog),
    );
    let fleet = Arc::new(Fleet::new(ctx));
    let loaded = fleet.load_servers().await?;
    info!(loaded, "Servers loaded");
    Ok(fleet)
}

/// Configured `(container type, image)` pairs the engine does not have
pub async fn missing_images(engine: &dyn ContainerEngine, config: &ManagerConfig) -> Vec<(String, String)> {
    let mut images: Vec<_> = config.docker.images.iter().collect();
    images.sort();

    let mut missing = Vec::new();
    for (container_type, image) in images {
        match engine.image_exists(image).await {
            Ok(true) => {}
            Ok(false) => missing.push((container_type.clone(), image.clone())),
            Err(e) => {
                warn!(image = %image, error = %e, "Image lookup failed");
                missing.push((container_type.clone(), image.clone()));
            }
        }
    }
    missing
}

// ============================================================================
// Check
// ============================================================================

#[derive(Debug, Default)]
pub struct CheckReport {
    pub games: usize,
    pub plugins: usize,
    pub servers: usize,
    /// `file: reason` for every record that would be skipped at boot
    pub invalid: Vec<String>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.invalid.is_empty()
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "games:   {}", self.games)?;
        writeln!(f, "plugins: {}", self.plugins)?;
        write!(f, "servers: {}", self.servers)?;
        for problem in &self.invalid {
            write!(f, "\n  invalid {}", problem)?;
        }
        Ok(())
    }
}

/// Validate the catalog and server records the way boot would load them
pub fn check(config: &ManagerConfig) -> Result<CheckReport> {
    config.validate()?;
    let storage = config.storage();
    let catalog = Catalog::load(&storage)?;
    let mut report = CheckReport {
        games: catalog.games().len(),
        plugins: catalog.plugins().len(),
        ..CheckReport::default()
    };

    let store = storage.sub(SERVERS_DIR);
    let mut ids = HashSet::new();
    let mut ports = HashSet::new();
    let mut files = store.list()?;
    files.sort();
    for file in files {
        let record = match store.load::<InstanceRecord>(&file) {
            Ok(record) => record,
            Err(e) => {
                report.invalid.push(format!("{}: {}", file, e));
                continue;
            }
        };
        if let Err(e) = record.validate() {
            report.invalid.push(format!("{}: {}", file, e));
        } else if !ids.insert(record.id.clone()) {
            report.invalid.push(format!("{}: duplicate id {}", file, record.id));
        } else if !ports.insert(record.port) {
            report.invalid.push(format!("{}: duplicate port {}", file, record.port));
        } else if config.docker.image_for(&record.game.container_type).is_none() {
            report.invalid.push(format!(
                "{}: no image configured for {}",
                file, record.game.container_type
            ));
        } else {
            report.servers += 1;
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssm_server::testing::{fixtures, MockEngine};

    #[test]
    fn test_check_reports_bad_records() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixtures::config(dir.path());
        let storage = config.storage();
        storage
            .sub("games")
            .save("minecraft.json", &fixtures::game("minecraft"))
            .unwrap();

        let servers = storage.sub(SERVERS_DIR);
        servers.save("alice.json", &fixtures::record("alice", 25565)).unwrap();
        servers.save("bob.json", &fixtures::record("bob", 25565)).unwrap();
        let mut odd = fixtures::record("carol", 25567);
        odd.game.container_type = "Bedrock".to_string();
        servers.save("carol.json", &odd).unwrap();
        std::fs::write(servers.base_dir().join("dave.json"), "[]").unwrap();

        let report = check(&config).unwrap();
        assert_eq!(report.games, 1);
        assert_eq!(report.servers, 1);
        assert_eq!(report.invalid.len(), 3);
        assert!(report.invalid[0].starts_with("bob.json: duplicate port"));
        assert!(report.invalid[1].starts_with("carol.json: no image"));
        assert!(report.invalid[2].starts_with("dave.json"));
        assert!(!report.is_clean());
    }

    #[test]
    fn test_check_rejects_bad_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fixtures::config(dir.path());
        config.api.secret.clear();
        assert!(check(&config).is_err());
    }

    #[tokio::test]
    async fn test_missing_images() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fixtures::config(dir.path());
        config
            .docker
            .images
            .insert("Bedrock".to_string(), "ssbedrock".to_string());

        let missing = missing_images(&MockEngine::new(), &config).await;
        assert_eq!(missing, vec![("Bedrock".to_string(), "ssbedrock".to_string())]);
    }

    #[tokio::test]
    async fn test_boot_loads_stored_servers() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixtures::config(dir.path());
        config
            .storage()
            .sub(SERVERS_DIR)
            .save("alice.json", &fixtures::record("alice", 25565))
            .unwrap();

        let fleet = boot(Arc::new(config), Arc::new(MockEngine::new())).await.unwrap();
        assert_eq!(fleet.len().await, 1);
        assert!(fleet.get("alice").await.is_some());
    }
}
