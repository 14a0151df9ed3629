//! Administrative operations on target configurations.
//!
//! Servers and artifacts are added/removed here, outside any run; the
//! scheduler only ever reads configurations.

use std::path::Path;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{DeployError, Result};
use crate::model::{ServerSpec, TargetConfig};
use crate::store::ConfigStore;

pub struct AdminService {
    configs: Arc<dyn ConfigStore>,
    app: Arc<AppConfig>,
}

impl AdminService {
    pub fn new(configs: Arc<dyn ConfigStore>, app: Arc<AppConfig>) -> Self {
        Self { configs, app }
    }

    async fn load(&self, config_id: Uuid) -> Result<TargetConfig> {
        self.configs.find(config_id).await?.ok_or_else(|| {
            DeployError::NotFound(format!("no configuration with id '{config_id}'"))
        })
    }

    /// Add a server to a configuration, seeding its working directory from
    /// the server template.
    pub async fn add_server(&self, config_id: Uuid, name: &str) -> Result<ServerSpec> {
        let mut config = self.load(config_id).await?;
        if config.servers.iter().any(|s| s.name == name) {
            return Err(DeployError::Conflict(format!(
                "a server named '{name}' already exists in '{}'",
                config.full_name()
            )));
        }
        let folder = self.app.server_folder(&config.name, name);
        if folder.exists() {
            return Err(DeployError::Conflict(format!(
                "a server folder already exists at '{}'",
                folder.display()
            )));
        }
        copy_dir_all(&self.app.template_folder, &folder)?;

        let spec = ServerSpec {
            name: name.to_string(),
            artifacts: Vec::new(),
        };
        config.servers.push(spec.clone());
        self.configs.update(&config).await?;
        Ok(spec)
    }

    /// Remove a server and its working directory.
    pub async fn remove_server(&self, config_id: Uuid, name: &str) -> Result<()> {
        let mut config = self.load(config_id).await?;
        let index = config
            .servers
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| {
                DeployError::NotFound(format!(
                    "no server named '{name}' in '{}'",
                    config.full_name()
                ))
            })?;
        let folder = self.app.server_folder(&config.name, name);
        if folder.exists() {
            std::fs::remove_dir_all(&folder)?;
        }
        config.servers.remove(index);
        self.configs.update(&config).await
    }

    pub async fn add_artifact(&self, config_id: Uuid, server: &str, artifact: &str) -> Result<()> {
        let mut config = self.load(config_id).await?;
        let full_name = config.full_name();
        let spec = server_spec_mut(&mut config, server, &full_name)?;
        if spec.artifacts.iter().any(|a| a == artifact) {
            return Err(DeployError::Conflict(format!(
                "an artifact named '{artifact}' is already tracked by server '{server}'"
            )));
        }
        spec.artifacts.push(artifact.to_string());
        self.configs.update(&config).await
    }

    pub async fn remove_artifact(
        &self,
        config_id: Uuid,
        server: &str,
        artifact: &str,
    ) -> Result<()> {
        let mut config = self.load(config_id).await?;
        let full_name = config.full_name();
        let spec = server_spec_mut(&mut config, server, &full_name)?;
        let index = spec
            .artifacts
            .iter()
            .position(|a| a == artifact)
            .ok_or_else(|| {
                DeployError::NotFound(format!(
                    "no artifact named '{artifact}' tracked by server '{server}'"
                ))
            })?;
        spec.artifacts.remove(index);
        self.configs.update(&config).await
    }

    pub async fn set_paused(&self, config_id: Uuid, paused: bool) -> Result<()> {
        let mut config = self.load(config_id).await?;
        config.paused = paused;
        self.configs.update(&config).await
    }
}

fn server_spec_mut<'a>(
    config: &'a mut TargetConfig,
    server: &str,
    full_name: &str,
) -> Result<&'a mut ServerSpec> {
    config
        .servers
        .iter_mut()
        .find(|s| s.name == server)
        .ok_or_else(|| {
            DeployError::NotFound(format!("no server named '{server}' in '{full_name}'"))
        })
}

fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    if !src.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tempfile::TempDir;
    use url::Url;

    async fn setup(temp: &TempDir) -> (AdminService, Uuid) {
        let mut app = AppConfig::default();
        app.deployer_folder = temp.path().join("servers");
        app.template_folder = temp.path().join("template");
        std::fs::create_dir_all(app.template_folder.join("configuration")).unwrap();
        std::fs::write(
            app.template_folder.join("configuration").join("standalone.xml"),
            b"<server/>",
        )
        .unwrap();

        let store = Arc::new(MemoryStore::new());
        let config = ConfigStore::create(
            &*store,
            TargetConfig::new(
                "webapp",
                "1.2",
                Url::parse("http://repo.example.com/libs/").unwrap(),
            ),
        )
        .await
        .unwrap();
        (AdminService::new(store, Arc::new(app)), config.id)
    }

    #[tokio::test]
    async fn add_server_seeds_folder_from_template() {
        let temp = TempDir::new().unwrap();
        let (admin, config_id) = setup(&temp).await;

        admin.add_server(config_id, "srv-1").await.unwrap();
        assert!(
            temp.path()
                .join("servers/webapp/srv-1/configuration/standalone.xml")
                .is_file()
        );
    }

    #[tokio::test]
    async fn duplicate_server_name_is_a_conflict() {
        let temp = TempDir::new().unwrap();
        let (admin, config_id) = setup(&temp).await;

        admin.add_server(config_id, "srv-1").await.unwrap();
        let err = admin.add_server(config_id, "srv-1").await.unwrap_err();
        assert!(matches!(err, DeployError::Conflict(_)));
    }

    #[tokio::test]
    async fn artifacts_are_tracked_per_server() {
        let temp = TempDir::new().unwrap();
        let (admin, config_id) = setup(&temp).await;
        admin.add_server(config_id, "srv-1").await.unwrap();

        admin.add_artifact(config_id, "srv-1", "foo").await.unwrap();
        let err = admin
            .add_artifact(config_id, "srv-1", "foo")
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Conflict(_)));

        admin
            .remove_artifact(config_id, "srv-1", "foo")
            .await
            .unwrap();
        let err = admin
            .remove_artifact(config_id, "srv-1", "foo")
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::NotFound(_)));
    }
}
