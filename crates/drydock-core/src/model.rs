//! Domain model: target configurations and the run → server → artifact
//! status tree.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Lifecycle of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum RunStatus {
    Pending,
    InProgress,
    Succeed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeed | RunStatus::Failed)
    }
}

/// Status of one server or artifact within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum StepStatus {
    InProgress,
    Succeed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// One append-only log line in a run or server record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub date: DateTime<Utc>,
    pub message: String,
}

impl LogLine {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            date: Utc::now(),
            message: message.into(),
        }
    }
}

/// Per-run tracking of one packaged artifact destined for one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub name: String,
    pub status: StepStatus,
    /// Resolved download URL, filled in once staging resolves it.
    pub url: Option<String>,
    /// Staged location inside the server's deployments folder.
    pub local_path: Option<PathBuf>,
}

impl ArtifactRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::InProgress,
            url: None,
            local_path: None,
        }
    }
}

/// Per-run tracking of one server within a target configuration.
///
/// The artifact set is fixed when the record is created and never grows or
/// shrinks during the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: Uuid,
    pub name: String,
    pub status: StepStatus,
    pub artifacts: Vec<ArtifactRecord>,
    pub logs: Vec<LogLine>,
}

impl ServerRecord {
    pub fn new(name: impl Into<String>, artifacts: &[String]) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: StepStatus::InProgress,
            artifacts: artifacts.iter().map(ArtifactRecord::new).collect(),
            logs: Vec::new(),
        }
    }

    pub fn push_log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(LogLine::new(level, message));
    }

    /// Failed iff at least one artifact failed; Succeed only once no
    /// artifact remains in progress.
    pub fn aggregate_status(&self) -> StepStatus {
        aggregate(self.artifacts.iter().map(|a| a.status))
    }
}

/// One execution attempt of deploying all artifacts to all servers of one
/// target configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,
    pub config_id: Uuid,
    pub servers: Vec<ServerRecord>,
    pub logs: Vec<LogLine>,
}

impl Run {
    pub fn new(config_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            status: RunStatus::Pending,
            config_id,
            servers: Vec::new(),
            logs: Vec::new(),
        }
    }

    pub fn push_log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(LogLine::new(level, message));
    }

    pub fn server_mut(&mut self, server_id: Uuid) -> Option<&mut ServerRecord> {
        self.servers.iter_mut().find(|s| s.id == server_id)
    }

    /// Failed iff at least one server failed; Succeed only once every
    /// server record is terminal.
    pub fn aggregate_status(&self) -> RunStatus {
        match aggregate(self.servers.iter().map(|s| s.status)) {
            StepStatus::Failed => RunStatus::Failed,
            StepStatus::InProgress => RunStatus::InProgress,
            StepStatus::Succeed => RunStatus::Succeed,
        }
    }
}

fn aggregate(statuses: impl Iterator<Item = StepStatus>) -> StepStatus {
    let mut in_progress = false;
    for status in statuses {
        match status {
            StepStatus::Failed => return StepStatus::Failed,
            StepStatus::InProgress => in_progress = true,
            StepStatus::Succeed => {}
        }
    }
    if in_progress {
        StepStatus::InProgress
    } else {
        StepStatus::Succeed
    }
}

/// One server belonging to a target configuration and the artifacts it
/// tracks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum NotifyMode {
    Always,
    Failed,
    Succeed,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySettings {
    pub recipients: Vec<String>,
    pub mode: NotifyMode,
    /// Cron expression for periodic automatic runs, if configured.
    pub schedule: Option<String>,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            recipients: Vec::new(),
            mode: NotifyMode::Always,
            schedule: None,
        }
    }
}

/// A named deployment target: which servers and artifacts belong to it and
/// where their artifact family lives in the binary repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub id: Uuid,
    pub name: String,
    /// Artifact family label, e.g. "1.2".
    pub numero: String,
    pub snapshot: bool,
    pub paused: bool,
    pub servers: Vec<ServerSpec>,
    pub notify: NotifySettings,
    pub repository_url: Url,
}

impl TargetConfig {
    pub fn new(name: impl Into<String>, numero: impl Into<String>, repository_url: Url) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            numero: numero.into(),
            snapshot: false,
            paused: false,
            servers: Vec::new(),
            notify: NotifySettings::default(),
            repository_url,
        }
    }

    pub fn full_name(&self) -> String {
        if self.snapshot {
            format!("{} - {}-SNAPSHOT", self.name, self.numero)
        } else {
            format!("{} - {}", self.name, self.numero)
        }
    }

    /// Repository listing URL for one artifact family, without a trailing
    /// slash.
    pub fn family_url(&self, artifact: &str) -> String {
        format!(
            "{}/{}",
            self.repository_url.as_str().trim_end_matches('/'),
            artifact
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_with(statuses: &[StepStatus]) -> ServerRecord {
        let names: Vec<String> = (0..statuses.len()).map(|i| format!("ear-{i}")).collect();
        let mut server = ServerRecord::new("srv", &names);
        for (artifact, status) in server.artifacts.iter_mut().zip(statuses) {
            artifact.status = *status;
        }
        server
    }

    #[test]
    fn server_aggregates_failed_over_succeed() {
        let server = server_with(&[StepStatus::Succeed, StepStatus::Failed]);
        assert_eq!(server.aggregate_status(), StepStatus::Failed);
    }

    #[test]
    fn server_aggregates_succeed_only_when_all_done() {
        let server = server_with(&[StepStatus::Succeed, StepStatus::Succeed]);
        assert_eq!(server.aggregate_status(), StepStatus::Succeed);

        let server = server_with(&[StepStatus::Succeed, StepStatus::InProgress]);
        assert_eq!(server.aggregate_status(), StepStatus::InProgress);
    }

    #[test]
    fn failed_beats_in_progress_in_aggregation() {
        let server = server_with(&[StepStatus::InProgress, StepStatus::Failed]);
        assert_eq!(server.aggregate_status(), StepStatus::Failed);
    }

    #[test]
    fn run_aggregates_over_servers() {
        let mut run = Run::new(Uuid::new_v4());
        run.servers.push(server_with(&[StepStatus::Succeed]));
        run.servers.push(server_with(&[StepStatus::Succeed]));
        run.servers[1].status = StepStatus::Failed;
        run.servers[0].status = StepStatus::Succeed;
        assert_eq!(run.aggregate_status(), RunStatus::Failed);

        run.servers[1].status = StepStatus::Succeed;
        assert_eq!(run.aggregate_status(), RunStatus::Succeed);
    }

    #[test]
    fn full_name_includes_snapshot_marker() {
        let url = Url::parse("http://repo.example.com/libs/").unwrap();
        let mut config = TargetConfig::new("webapp", "1.2", url);
        assert_eq!(config.full_name(), "webapp - 1.2");
        config.snapshot = true;
        assert_eq!(config.full_name(), "webapp - 1.2-SNAPSHOT");
    }

    #[test]
    fn family_url_joins_without_double_slash() {
        let url = Url::parse("http://repo.example.com/libs/").unwrap();
        let config = TargetConfig::new("webapp", "1.2", url);
        assert_eq!(
            config.family_url("foo"),
            "http://repo.example.com/libs/foo"
        );
    }
}
