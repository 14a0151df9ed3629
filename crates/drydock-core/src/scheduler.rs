//! Run scheduling: single-flight promotion of pending runs and the
//! per-server deployment loop.
//!
//! Runs are globally serialized: the next run never starts before the
//! previous one unregisters. Within a run, servers are processed strictly
//! in sequence to bound resource contention on the deployment host;
//! artifact downloads within one server fan out concurrently.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::container::{ContainerLifecycle, ContainerRuntime};
use crate::download::DownloadManager;
use crate::error::{DeployError, Result};
use crate::events::{EventSink, RunEvent};
use crate::fetch::HttpFetch;
use crate::model::{LogLevel, Run, RunStatus, ServerRecord, ServerSpec, StepStatus, TargetConfig};
use crate::notify::{self, Notifier};
use crate::poller::{StatusPoller, WaitOutcome};
use crate::registry::RunRegistry;
use crate::store::{ConfigStore, RunStore};

/// Outcome of requesting a new run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run: Run,
    /// Old runs deleted to honor the retention limit.
    pub pruned: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy)]
pub struct CancelOutcome {
    /// Cancelling an in-progress run requires restarting the whole
    /// orchestration process; in-flight downloads and containers cannot be
    /// safely aborted mid-flight.
    pub restart_required: bool,
}

pub struct Scheduler {
    app: Arc<AppConfig>,
    configs: Arc<dyn ConfigStore>,
    runs: Arc<dyn RunStore>,
    runtime: Arc<dyn ContainerRuntime>,
    events: Arc<dyn EventSink>,
    notifier: Arc<dyn Notifier>,
    registry: Arc<RunRegistry>,
    downloads: DownloadManager,
    lifecycle: ContainerLifecycle,
    poller: StatusPoller,
    triggers: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    /// Serializes promotion so the timer and post-request calls cannot
    /// race each other into `register`.
    promote_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(
        app: Arc<AppConfig>,
        configs: Arc<dyn ConfigStore>,
        runs: Arc<dyn RunStore>,
        fetch: Arc<dyn HttpFetch>,
        runtime: Arc<dyn ContainerRuntime>,
        events: Arc<dyn EventSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let registry = Arc::new(RunRegistry::new(runs.clone(), events.clone()));
        let downloads = DownloadManager::new(fetch, registry.clone());
        let lifecycle = ContainerLifecycle::new(runtime.clone(), registry.clone(), app.clone());
        let poller = StatusPoller::new(registry.clone(), app.poll_interval(), app.poll_timeout());
        Arc::new(Self {
            app,
            configs,
            runs,
            runtime,
            events,
            notifier,
            registry,
            downloads,
            lifecycle,
            poller,
            triggers: Mutex::new(HashMap::new()),
            promote_lock: Mutex::new(()),
        })
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Validate and queue a new run for one configuration.
    ///
    /// Validation failures (configuration missing or paused) surface
    /// synchronously and never create a run. Runs beyond the most recent
    /// `retained_runs` are pruned, oldest first, before the new run is
    /// created; nothing is deleted until the limit is exceeded.
    pub async fn request_run(&self, config_id: Uuid) -> Result<RunRequest> {
        let config = self.configs.find(config_id).await?.ok_or_else(|| {
            DeployError::NotFound(format!("no configuration with id '{config_id}'"))
        })?;
        if config.paused {
            return Err(DeployError::Conflict(format!(
                "configuration '{}' is paused",
                config.full_name()
            )));
        }

        let existing = self.runs.runs_for_config(config_id).await?;
        let mut pruned = Vec::new();
        if existing.len() > self.app.retained_runs {
            let excess = existing.len() - self.app.retained_runs;
            for run in existing
                .iter()
                .filter(|r| r.status != RunStatus::InProgress)
                .take(excess)
            {
                self.runs.delete(run.id).await?;
                pruned.push(run.id);
            }
            if !pruned.is_empty() {
                self.events
                    .publish(RunEvent::RunDeleted {
                        run_ids: pruned.clone(),
                    })
                    .await;
            }
        }

        let run = self.runs.create(Run::new(config_id)).await?;
        self.events
            .publish(RunEvent::RunCreated { run: run.clone() })
            .await;
        tracing::info!(run_id = %run.id, config = %config.full_name(), "run queued");
        Ok(RunRequest { run, pruned })
    }

    /// Promote and execute pending runs until the backlog is drained or a
    /// run is already active.
    ///
    /// Called after every completed run and from the periodic safety-net
    /// timer; concurrent callers coalesce.
    pub async fn promote_next(&self) -> Result<()> {
        let Ok(_guard) = self.promote_lock.try_lock() else {
            return Ok(());
        };
        loop {
            if self.registry.is_active().await {
                return Ok(());
            }
            let Some(next) = self.runs.oldest_pending().await? else {
                return Ok(());
            };
            self.execute_run(next).await?;
        }
    }

    /// Fetch one run, serving the in-memory active run when it matches.
    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        if let Some(active) = self.registry.active_run().await
            && active.id == run_id
        {
            return Ok(active);
        }
        self.runs
            .find(run_id)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("no run with id '{run_id}'")))
    }

    /// Cancel a pending or in-progress run.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<CancelOutcome> {
        let run = self.get_run(run_id).await?;
        match run.status {
            RunStatus::Pending => {
                self.runs.delete(run_id).await?;
                self.events
                    .publish(RunEvent::RunDeleted {
                        run_ids: vec![run_id],
                    })
                    .await;
                Ok(CancelOutcome {
                    restart_required: false,
                })
            }
            RunStatus::InProgress => {
                self.runs.delete(run_id).await?;
                self.events
                    .publish(RunEvent::RunDeleted {
                        run_ids: vec![run_id],
                    })
                    .await;
                // Best-effort container stop; the process restart cuts off
                // everything else that is in flight.
                if let Err(err) = self.runtime.terminate().await {
                    tracing::warn!(error = %err, "container stop during cancellation failed");
                }
                Ok(CancelOutcome {
                    restart_required: true,
                })
            }
            RunStatus::Succeed | RunStatus::Failed => Err(DeployError::Conflict(format!(
                "run '{run_id}' already finished"
            ))),
        }
    }

    /// Archived runtime log of one server record.
    pub fn server_log_path(&self, server_id: Uuid) -> Result<PathBuf> {
        let path = self.app.history_log(server_id);
        if path.is_file() {
            Ok(path)
        } else {
            Err(DeployError::NotFound(format!(
                "no archived log for server '{server_id}'"
            )))
        }
    }

    /// Install (or replace) the periodic trigger of one configuration.
    ///
    /// A trigger tick only requests a new pending run; promotion goes
    /// through the same single-flight loop as everything else.
    pub async fn set_trigger(self: &Arc<Self>, config: &TargetConfig) -> Result<()> {
        let mut triggers = self.triggers.lock().await;
        if let Some(handle) = triggers.remove(&config.id) {
            handle.abort();
        }
        let Some(expr) = config.notify.schedule.as_deref() else {
            return Ok(());
        };
        let schedule = Schedule::from_str(expr).map_err(|err| {
            DeployError::Validation(format!("invalid trigger expression '{expr}': {err}"))
        })?;
        let timezone: Tz = self.app.trigger_timezone.parse().map_err(|_| {
            DeployError::Validation(format!(
                "unknown trigger timezone '{}'",
                self.app.trigger_timezone
            ))
        })?;

        let scheduler = Arc::clone(self);
        let config_id = config.id;
        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(timezone).next() else {
                    break;
                };
                let wait = (next.with_timezone(&Utc) - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                tracing::info!(%config_id, "periodic trigger fired");
                if let Err(err) = scheduler.request_run(config_id).await {
                    tracing::warn!(%config_id, error = %err, "periodic run request rejected");
                }
            }
        });
        triggers.insert(config.id, handle);
        Ok(())
    }

    pub async fn remove_trigger(&self, config_id: Uuid) {
        if let Some(handle) = self.triggers.lock().await.remove(&config_id) {
            handle.abort();
        }
    }

    /// Install triggers for every configuration that carries a schedule.
    pub async fn init_triggers(self: &Arc<Self>) -> Result<()> {
        for config in self.configs.list().await? {
            if config.notify.schedule.is_none() {
                continue;
            }
            if let Err(err) = self.set_trigger(&config).await {
                tracing::error!(config = %config.full_name(), error = %err, "trigger setup failed");
            }
        }
        Ok(())
    }

    /// Daemon loop: periodic safety-net scan for pending runs.
    pub async fn run_promote_loop(self: &Arc<Self>) {
        let mut ticker = tokio::time::interval(self.app.promote_scan_period());
        loop {
            ticker.tick().await;
            if let Err(err) = self.promote_next().await {
                tracing::error!(error = %err, "run promotion failed");
            }
        }
    }

    /// Execute one run end to end and always unregister it.
    async fn execute_run(&self, run: Run) -> Result<()> {
        let Some(config) = self.configs.find(run.config_id).await? else {
            return self
                .fail_unstarted(run, "configuration of this run no longer exists")
                .await;
        };
        if config.paused {
            return self
                .fail_unstarted(
                    run,
                    &format!("configuration '{}' is paused", config.full_name()),
                )
                .await;
        }

        self.registry.register(run).await?;
        let final_status = match self.deploy_servers(&config).await {
            Ok(status) => status,
            Err(err) => {
                self.registry
                    .log_run(
                        LogLevel::Error,
                        format!(
                            "Deployment of '{}' aborted with an error: {err}",
                            config.full_name()
                        ),
                    )
                    .await;
                RunStatus::Failed
            }
        };
        self.registry
            .update(|run| run.status = final_status)
            .await;

        if let Some(finished) = self.registry.active_run().await
            && notify::should_notify(&config, &finished)
        {
            let report = notify::build_report(&self.app, &config, &finished);
            if let Err(err) = self
                .notifier
                .send(&config.notify.recipients, &report.subject, &report.body)
                .await
            {
                tracing::error!(error = %err, "failed to send deployment report");
            }
        }
        self.registry.unregister().await?;
        Ok(())
    }

    /// Deploy every server of the configuration in sequence.
    ///
    /// A staging or infrastructure error on one server aborts the run;
    /// marker-file failures and timeouts only fail that server and the
    /// loop moves on.
    async fn deploy_servers(&self, config: &TargetConfig) -> Result<RunStatus> {
        self.registry
            .log_run(
                LogLevel::Info,
                format!("Starting deployment of '{}'", config.full_name()),
            )
            .await;

        for spec in &config.servers {
            let record = ServerRecord::new(&spec.name, &spec.artifacts);
            let server_id = record.id;
            self.registry
                .update(|run| run.servers.push(record.clone()))
                .await;

            if let Err(err) = self.deploy_server(config, spec, &record).await {
                self.registry
                    .log_server(
                        server_id,
                        LogLevel::Error,
                        format!("Deployment error: {err}"),
                    )
                    .await;
                self.fail_server(server_id).await;
                return Err(err);
            }
        }

        let status = self
            .registry
            .active_run()
            .await
            .map(|run| run.aggregate_status())
            .unwrap_or(RunStatus::Failed);
        self.registry
            .log_run(
                LogLevel::Info,
                format!(
                    "Deployment of '{}' finished: {}",
                    config.full_name(),
                    if status == RunStatus::Succeed {
                        "success"
                    } else {
                        "failure"
                    }
                ),
            )
            .await;
        Ok(status)
    }

    /// Clean → stage → start → poll → stop for one server.
    async fn deploy_server(
        &self,
        config: &TargetConfig,
        spec: &ServerSpec,
        record: &ServerRecord,
    ) -> Result<()> {
        let server_id = record.id;
        let server_folder = self.app.server_folder(&config.name, &spec.name);
        let deployments = server_folder.join("deployments");
        tokio::fs::create_dir_all(&deployments).await?;

        self.lifecycle.clean(record, &server_folder).await?;

        let staged = self
            .downloads
            .stage_server(
                config,
                server_id,
                &spec.artifacts,
                &deployments,
                self.app.max_download_attempts,
            )
            .await?;
        self.registry
            .update(|run| {
                let Some(server) = run.server_mut(server_id) else {
                    return;
                };
                for item in &staged {
                    if let Some(artifact) =
                        server.artifacts.iter_mut().find(|a| a.name == item.name)
                    {
                        artifact.url = Some(item.url.clone());
                        artifact.local_path = Some(item.path.clone());
                    }
                }
            })
            .await;

        self.lifecycle.start(record, &server_folder).await;
        let wait = self.poller.await_completion(server_id).await;
        let (status, forced) = match wait {
            WaitOutcome::Completed(status) => (status, false),
            WaitOutcome::TimedOut => (StepStatus::Failed, true),
            WaitOutcome::Errored => (StepStatus::Failed, false),
        };
        if let Err(err) = self.lifecycle.stop(record, &server_folder, forced).await {
            self.registry
                .log_server(
                    server_id,
                    LogLevel::Error,
                    format!("Cleanup after stop failed: {err}"),
                )
                .await;
        }

        self.registry
            .update(|run| {
                let Some(server) = run.server_mut(server_id) else {
                    return;
                };
                server.status = status;
                if status == StepStatus::Failed {
                    for artifact in &mut server.artifacts {
                        if artifact.status == StepStatus::InProgress {
                            artifact.status = StepStatus::Failed;
                        }
                    }
                }
            })
            .await;
        self.registry
            .log_server(
                server_id,
                LogLevel::Info,
                format!(
                    "Server finished: {}",
                    if status == StepStatus::Succeed {
                        "success"
                    } else {
                        "failure"
                    }
                ),
            )
            .await;
        Ok(())
    }

    /// Mark a server record and its unfinished artifacts as failed.
    async fn fail_server(&self, server_id: Uuid) {
        self.registry
            .update(|run| {
                let Some(server) = run.server_mut(server_id) else {
                    return;
                };
                server.status = StepStatus::Failed;
                for artifact in &mut server.artifacts {
                    if artifact.status == StepStatus::InProgress {
                        artifact.status = StepStatus::Failed;
                    }
                }
            })
            .await;
    }

    /// Record a run as failed without ever registering it (configuration
    /// vanished or was paused after queueing).
    async fn fail_unstarted(&self, mut run: Run, reason: &str) -> Result<()> {
        tracing::warn!(run_id = %run.id, "{reason}");
        run.push_log(LogLevel::Error, reason);
        run.status = RunStatus::Failed;
        self.runs.update(&run).await?;
        self.events
            .publish(RunEvent::RunFinished { run })
            .await;
        Ok(())
    }
}
