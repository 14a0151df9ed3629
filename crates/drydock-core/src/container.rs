//! Container lifecycle for one deployment server.
//!
//! The runtime process itself sits behind the `ContainerRuntime` trait so
//! tests can swap in a fake that flips marker files. Launch and stop exit
//! codes are logged into the run tree but never drive deployment status;
//! logical success is determined solely by the status poller's marker-file
//! checks.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::AppConfig;
use crate::error::Result;
use crate::model::{LogLevel, ServerRecord};
use crate::registry::RunRegistry;

/// Output of one runtime command (launch or terminate).
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Launch the runtime bound to the server's working directories. The
    /// runtime keeps running after the launch step resolves.
    async fn launch(&self, server_folder: &Path) -> Result<ProcessOutput>;

    /// Terminate and remove the runtime instance. Idempotent; safe when
    /// nothing is running.
    async fn terminate(&self) -> Result<ProcessOutput>;

    async fn is_running(&self) -> Result<bool>;
}

/// Docker-backed runtime: `docker run -d` with the configuration,
/// deployments, and log directories bind-mounted into the container.
pub struct DockerRuntime {
    container_name: String,
    image: String,
    container_home: String,
}

impl DockerRuntime {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            container_name: config.container_name.clone(),
            image: config.container_image.clone(),
            container_home: config.container_home.clone(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<ProcessOutput> {
        let output = Command::new("docker").args(args).output().await?;
        Ok(ProcessOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn launch(&self, server_folder: &Path) -> Result<ProcessOutput> {
        let mount = |dir: &str| {
            format!(
                "{}:{}/{dir}",
                server_folder.join(dir).display(),
                self.container_home
            )
        };
        let args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.container_name.clone(),
            "-v".to_string(),
            mount("configuration"),
            "-v".to_string(),
            mount("deployments"),
            "-v".to_string(),
            mount("log"),
            self.image.clone(),
        ];
        self.run(&args).await
    }

    async fn terminate(&self) -> Result<ProcessOutput> {
        self.run(&[
            "rm".to_string(),
            "-f".to_string(),
            self.container_name.clone(),
        ])
        .await
    }

    async fn is_running(&self) -> Result<bool> {
        let output = self
            .run(&[
                "ps".to_string(),
                "-q".to_string(),
                "--filter".to_string(),
                format!("name={}", self.container_name),
            ])
            .await?;
        Ok(!output.stdout.trim().is_empty())
    }
}

/// Clean/start/stop of one server's runtime, with log archiving.
pub struct ContainerLifecycle {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<RunRegistry>,
    config: Arc<AppConfig>,
}

impl ContainerLifecycle {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<RunRegistry>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            runtime,
            registry,
            config,
        }
    }

    /// Empty the deployments folder (keeping only the allow-listed
    /// resource file, which also clears any stale completion markers),
    /// archive the previous runtime log under the server record's id, and
    /// empty the log folder.
    ///
    /// Runs before every attempt so stale artifacts and logs never leak
    /// across runs.
    pub async fn clean(&self, server: &ServerRecord, server_folder: &Path) -> Result<()> {
        let deployments = server_folder.join("deployments");
        if deployments.is_dir() {
            let mut entries = tokio::fs::read_dir(&deployments).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_name().to_string_lossy() == self.config.keep_resource.as_str() {
                    continue;
                }
                let path = entry.path();
                if path.is_dir() {
                    tokio::fs::remove_dir_all(&path).await?;
                } else {
                    tokio::fs::remove_file(&path).await?;
                }
            }
        }

        let log_folder = server_folder.join("log");
        let server_log = log_folder.join("server.log");
        if server_log.is_file() {
            tokio::fs::create_dir_all(&self.config.history_folder).await?;
            tokio::fs::copy(&server_log, self.config.history_log(server.id)).await?;
        }
        if log_folder.is_dir() {
            let mut entries = tokio::fs::read_dir(&log_folder).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    tokio::fs::remove_dir_all(&path).await?;
                } else {
                    tokio::fs::remove_file(&path).await?;
                }
            }
        }
        Ok(())
    }

    /// Launch the runtime and stream its launch output into the run log.
    ///
    /// Resolves with the launch step's exit code; a failed launch is
    /// logged, never raised.
    pub async fn start(&self, server: &ServerRecord, server_folder: &Path) -> Option<i32> {
        self.registry
            .log_server(server.id, LogLevel::Info, "Starting server")
            .await;
        match self.runtime.launch(server_folder).await {
            Ok(output) => {
                self.log_output(server, &output).await;
                if output.exit_code == Some(0) {
                    self.registry
                        .log_server(server.id, LogLevel::Info, "Server start finished")
                        .await;
                } else {
                    self.registry
                        .log_server(server.id, LogLevel::Info, "Server start failed")
                        .await;
                }
                output.exit_code
            }
            Err(err) => {
                self.registry
                    .log_server(
                        server.id,
                        LogLevel::Error,
                        format!("Server launch command failed: {err}"),
                    )
                    .await;
                None
            }
        }
    }

    /// Terminate the runtime unconditionally, then archive and clean.
    ///
    /// `forced` marks a stop after a polling timeout; it changes the log
    /// wording only.
    pub async fn stop(&self, server: &ServerRecord, server_folder: &Path, forced: bool) -> Result<()> {
        let label = if forced { "Forced stop" } else { "Stop" };
        self.registry
            .log_server(server.id, LogLevel::Info, format!("{label} of the server"))
            .await;
        match self.runtime.terminate().await {
            Ok(output) => {
                self.log_output(server, &output).await;
                if output.exit_code == Some(0) {
                    self.registry
                        .log_server(
                            server.id,
                            LogLevel::Info,
                            format!("{label} of the server finished"),
                        )
                        .await;
                } else {
                    self.registry
                        .log_server(
                            server.id,
                            LogLevel::Info,
                            format!("{label} of the server failed"),
                        )
                        .await;
                }
            }
            Err(err) => {
                self.registry
                    .log_server(
                        server.id,
                        LogLevel::Error,
                        format!("Server stop command failed: {err}"),
                    )
                    .await;
            }
        }
        self.clean(server, server_folder).await
    }

    async fn log_output(&self, server: &ServerRecord, output: &ProcessOutput) {
        for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
            self.registry
                .log_server(server.id, LogLevel::Info, line.to_string())
                .await;
        }
        for line in output.stderr.lines().filter(|l| !l.trim().is_empty()) {
            self.registry
                .log_server(server.id, LogLevel::Error, line.to_string())
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    struct NoopRuntime;

    #[async_trait]
    impl ContainerRuntime for NoopRuntime {
        async fn launch(&self, _server_folder: &Path) -> Result<ProcessOutput> {
            Ok(ProcessOutput::default())
        }

        async fn terminate(&self) -> Result<ProcessOutput> {
            Ok(ProcessOutput::default())
        }

        async fn is_running(&self) -> Result<bool> {
            Ok(false)
        }
    }

    fn lifecycle(config: Arc<AppConfig>) -> ContainerLifecycle {
        let registry = Arc::new(RunRegistry::new(
            Arc::new(MemoryStore::new()),
            Arc::new(NullSink),
        ));
        ContainerLifecycle::new(Arc::new(NoopRuntime), registry, config)
    }

    #[tokio::test]
    async fn clean_keeps_only_the_allow_listed_resource() {
        let temp = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.history_folder = temp.path().join("history");
        let server_folder = temp.path().join("srv-1");
        let deployments = server_folder.join("deployments");
        std::fs::create_dir_all(&deployments).unwrap();
        std::fs::write(deployments.join("app.ear"), b"stale").unwrap();
        std::fs::write(deployments.join("app.ear.deployed"), b"").unwrap();
        std::fs::write(deployments.join(&config.keep_resource), b"keep").unwrap();

        let lifecycle = lifecycle(Arc::new(config.clone()));
        let server = ServerRecord::new("srv-1", &[]);
        lifecycle.clean(&server, &server_folder).await.unwrap();

        let remaining: Vec<String> = std::fs::read_dir(&deployments)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(remaining, vec![config.keep_resource]);
    }

    #[tokio::test]
    async fn clean_archives_the_runtime_log_under_the_record_id() {
        let temp = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.history_folder = temp.path().join("history");
        let server_folder = temp.path().join("srv-1");
        let log_folder = server_folder.join("log");
        std::fs::create_dir_all(&log_folder).unwrap();
        std::fs::write(log_folder.join("server.log"), b"boot output").unwrap();
        std::fs::write(log_folder.join("gc.log"), b"gc output").unwrap();

        let config = Arc::new(config);
        let lifecycle = lifecycle(config.clone());
        let server = ServerRecord::new("srv-1", &[]);
        lifecycle.clean(&server, &server_folder).await.unwrap();

        let archived = std::fs::read(config.history_log(server.id)).unwrap();
        assert_eq!(archived, b"boot output");
        assert_eq!(std::fs::read_dir(&log_folder).unwrap().count(), 0);
    }
}
