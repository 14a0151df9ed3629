//! Process-wide single-flight holder of the run currently executing.
//!
//! The registry owns the one "current run" slot. The scheduler is the only
//! component that registers, mutates, and unregisters through it; every
//! other component receives run/server identifiers by parameter and only
//! reaches the slot through the log helpers.

use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{DeployError, Result};
use crate::events::{EventSink, RunEvent};
use crate::model::{LogLevel, Run, RunStatus};
use crate::store::RunStore;

pub struct RunRegistry {
    current: Mutex<Option<Run>>,
    runs: Arc<dyn RunStore>,
    events: Arc<dyn EventSink>,
}

impl RunRegistry {
    pub fn new(runs: Arc<dyn RunStore>, events: Arc<dyn EventSink>) -> Self {
        Self {
            current: Mutex::new(None),
            runs,
            events,
        }
    }

    /// Register a run as current and flip it to IN-PROGRESS.
    ///
    /// Rejected when a run is already registered; callers check first via
    /// `is_active`, the registry itself does not queue.
    pub async fn register(&self, mut run: Run) -> Result<()> {
        let mut current = self.current.lock().await;
        if let Some(active) = current.as_ref() {
            return Err(DeployError::Conflict(format!(
                "run '{}' is already in progress",
                active.id
            )));
        }
        tracing::debug!(run_id = %run.id, "registering run");
        run.status = RunStatus::InProgress;
        self.runs.update(&run).await?;
        self.events
            .publish(RunEvent::RunStarted { run: run.clone() })
            .await;
        *current = Some(run);
        Ok(())
    }

    /// Persist the final state of the current run, if any, and clear the
    /// slot.
    pub async fn unregister(&self) -> Result<Option<Run>> {
        let mut current = self.current.lock().await;
        let Some(run) = current.take() else {
            return Ok(None);
        };
        tracing::debug!(run_id = %run.id, status = ?run.status, "unregistering run");
        self.runs.update(&run).await?;
        self.events
            .publish(RunEvent::RunFinished { run: run.clone() })
            .await;
        Ok(Some(run))
    }

    pub async fn is_active(&self) -> bool {
        self.current.lock().await.is_some()
    }

    /// Snapshot of the current run, if any.
    pub async fn active_run(&self) -> Option<Run> {
        self.current.lock().await.clone()
    }

    /// Mutate the current run in place. Returns `None` when no run is
    /// registered.
    pub async fn update<T>(&self, f: impl FnOnce(&mut Run) -> T) -> Option<T> {
        let mut current = self.current.lock().await;
        let run = current.as_mut()?;
        let out = f(run);
        self.events
            .publish(RunEvent::RunProgress { run: run.clone() })
            .await;
        Some(out)
    }

    /// Append a line to the current run's log. Falls through to tracing
    /// when no run is active.
    pub async fn log_run(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        trace_line(level, &message);
        let mut current = self.current.lock().await;
        if let Some(run) = current.as_mut() {
            run.push_log(level, message);
            self.events
                .publish(RunEvent::RunProgress { run: run.clone() })
                .await;
        }
    }

    /// Append a line to one server record's log and mirror it, prefixed
    /// with the server name, into the run log.
    pub async fn log_server(&self, server_id: Uuid, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        trace_line(level, &message);
        let mut current = self.current.lock().await;
        let Some(run) = current.as_mut() else {
            return;
        };
        let run_id = run.id;
        if let Some(server) = run.server_mut(server_id) {
            server.push_log(level, message.clone());
            let server = server.clone();
            run.push_log(level, format!("[SERVER:{}] - {}", server.name, message));
            self.events
                .publish(RunEvent::ServerProgress { run_id, server })
                .await;
            self.events
                .publish(RunEvent::RunProgress { run: run.clone() })
                .await;
        } else {
            run.push_log(level, message);
        }
    }
}

fn trace_line(level: LogLevel, message: &str) {
    match level {
        LogLevel::Info => tracing::info!("{message}"),
        LogLevel::Warning => tracing::warn!("{message}"),
        LogLevel::Error => tracing::error!("{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::store::MemoryStore;

    fn registry(store: Arc<MemoryStore>) -> RunRegistry {
        RunRegistry::new(store, Arc::new(NullSink))
    }

    #[tokio::test]
    async fn register_rejects_a_second_run() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());

        let first = RunStore::create(&*store, Run::new(Uuid::new_v4()))
            .await
            .unwrap();
        let second = RunStore::create(&*store, Run::new(Uuid::new_v4()))
            .await
            .unwrap();

        registry.register(first).await.unwrap();
        let err = registry.register(second).await.unwrap_err();
        assert!(matches!(err, DeployError::Conflict(_)));
    }

    #[tokio::test]
    async fn register_flips_status_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let run = RunStore::create(&*store, Run::new(Uuid::new_v4()))
            .await
            .unwrap();
        let run_id = run.id;

        registry.register(run).await.unwrap();
        let stored = store.find(run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::InProgress);

        let finished = registry.unregister().await.unwrap().unwrap();
        assert_eq!(finished.id, run_id);
        assert!(!registry.is_active().await);
    }

    #[tokio::test]
    async fn unregister_without_active_run_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store);
        assert!(registry.unregister().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn server_log_is_mirrored_into_run_log() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let mut run = Run::new(Uuid::new_v4());
        run.servers
            .push(crate::model::ServerRecord::new("srv-1", &["foo".into()]));
        let server_id = run.servers[0].id;
        let run = RunStore::create(&*store, run).await.unwrap();
        registry.register(run).await.unwrap();

        registry
            .log_server(server_id, LogLevel::Info, "staging artifacts")
            .await;

        let active = registry.active_run().await.unwrap();
        assert_eq!(active.servers[0].logs.len(), 1);
        assert_eq!(
            active.logs.last().unwrap().message,
            "[SERVER:srv-1] - staging artifacts"
        );
    }
}
