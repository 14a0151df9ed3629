//! Entity storage contracts and the in-memory implementation.
//!
//! Persistent storage is an external collaborator; the engine only relies
//! on these narrow contracts. `MemoryStore` backs tests and single-host
//! daemon setups.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{DeployError, Result};
use crate::model::{Run, RunStatus, TargetConfig};

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn create(&self, config: TargetConfig) -> Result<TargetConfig>;

    async fn find(&self, id: Uuid) -> Result<Option<TargetConfig>>;

    async fn list(&self) -> Result<Vec<TargetConfig>>;

    async fn update(&self, config: &TargetConfig) -> Result<()>;

    async fn delete(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create(&self, run: Run) -> Result<Run>;

    async fn find(&self, id: Uuid) -> Result<Option<Run>>;

    async fn update(&self, run: &Run) -> Result<()>;

    async fn delete(&self, id: Uuid) -> Result<()>;

    /// Oldest pending run by creation time, if any.
    async fn oldest_pending(&self) -> Result<Option<Run>>;

    /// All runs of one configuration, ascending by creation time.
    async fn runs_for_config(&self, config_id: Uuid) -> Result<Vec<Run>>;
}

#[derive(Default)]
pub struct MemoryStore {
    configs: RwLock<HashMap<Uuid, TargetConfig>>,
    runs: RwLock<HashMap<Uuid, Run>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn create(&self, config: TargetConfig) -> Result<TargetConfig> {
        let mut configs = self.configs.write().await;
        if configs.values().any(|c| c.name == config.name) {
            return Err(DeployError::Conflict(format!(
                "a configuration named '{}' already exists",
                config.name
            )));
        }
        configs.insert(config.id, config.clone());
        Ok(config)
    }

    async fn find(&self, id: Uuid) -> Result<Option<TargetConfig>> {
        Ok(self.configs.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<TargetConfig>> {
        let mut all: Vec<TargetConfig> = self.configs.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn update(&self, config: &TargetConfig) -> Result<()> {
        let mut configs = self.configs.write().await;
        if !configs.contains_key(&config.id) {
            return Err(DeployError::NotFound(format!(
                "no configuration with id '{}'",
                config.id
            )));
        }
        configs.insert(config.id, config.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.configs.write().await.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create(&self, run: Run) -> Result<Run> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(run)
    }

    async fn find(&self, id: Uuid) -> Result<Option<Run>> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn update(&self, run: &Run) -> Result<()> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.runs.write().await.remove(&id);
        Ok(())
    }

    async fn oldest_pending(&self) -> Result<Option<Run>> {
        let runs = self.runs.read().await;
        Ok(runs
            .values()
            .filter(|r| r.status == RunStatus::Pending)
            .min_by_key(|r| r.created_at)
            .cloned())
    }

    async fn runs_for_config(&self, config_id: Uuid) -> Result<Vec<Run>> {
        let runs = self.runs.read().await;
        let mut matching: Vec<Run> = runs
            .values()
            .filter(|r| r.config_id == config_id)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.created_at);
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn config(name: &str) -> TargetConfig {
        TargetConfig::new(
            name,
            "1.2",
            Url::parse("http://repo.example.com/libs/").unwrap(),
        )
    }

    #[tokio::test]
    async fn duplicate_configuration_name_is_a_conflict() {
        let store = MemoryStore::new();
        ConfigStore::create(&store, config("webapp")).await.unwrap();
        let err = ConfigStore::create(&store, config("webapp"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Conflict(_)));
    }

    #[tokio::test]
    async fn oldest_pending_orders_by_creation_time() {
        let store = MemoryStore::new();
        let config_id = Uuid::new_v4();

        let mut first = Run::new(config_id);
        first.created_at = chrono::Utc::now() - chrono::Duration::seconds(10);
        let first = RunStore::create(&store, first).await.unwrap();

        let mut done = Run::new(config_id);
        done.created_at = chrono::Utc::now() - chrono::Duration::seconds(20);
        done.status = RunStatus::Succeed;
        RunStore::create(&store, done).await.unwrap();

        RunStore::create(&store, Run::new(config_id)).await.unwrap();

        let next = store.oldest_pending().await.unwrap().unwrap();
        assert_eq!(next.id, first.id);
    }
}
