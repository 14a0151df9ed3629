//! Marker-file polling for artifact deployment completion.
//!
//! The target runtime signals hot-deployment outcome by writing a
//! `.deployed` or `.failed` marker next to each staged artifact. Each tick
//! is evaluated by a pure function over the current artifact statuses and
//! elapsed time, wrapped in a plain interval loop, so the decision logic
//! is testable without timers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::model::{LogLevel, StepStatus};
use crate::registry::RunRegistry;

/// Decision of one poll tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// At least one artifact still in progress and budget remains.
    Continue,
    /// Every artifact terminal; carries the aggregated server status.
    Done(StepStatus),
    /// Budget exhausted with artifacts still in progress.
    TimedOut,
}

/// Final outcome of a completion wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed(StepStatus),
    /// Treated by the caller as FAILED, with a forced stop.
    TimedOut,
    /// A poll tick raised; the wait terminated early as failed.
    Errored,
}

/// Pure tick evaluation: artifact statuses and elapsed time in, decision
/// out.
pub fn evaluate_tick(
    statuses: &[StepStatus],
    elapsed: Duration,
    timeout: Duration,
) -> TickOutcome {
    let mut failed = false;
    let mut in_progress = false;
    for status in statuses {
        match status {
            StepStatus::Failed => failed = true,
            StepStatus::InProgress => in_progress = true,
            StepStatus::Succeed => {}
        }
    }
    if !in_progress {
        return TickOutcome::Done(if failed {
            StepStatus::Failed
        } else {
            StepStatus::Succeed
        });
    }
    if elapsed > timeout {
        TickOutcome::TimedOut
    } else {
        TickOutcome::Continue
    }
}

/// Marker-file check for one staged artifact.
pub fn marker_status(staged_path: &Path) -> StepStatus {
    let deployed = staged_path.with_file_name(format!(
        "{}.deployed",
        staged_path.file_name().unwrap_or_default().to_string_lossy()
    ));
    let failed = staged_path.with_file_name(format!(
        "{}.failed",
        staged_path.file_name().unwrap_or_default().to_string_lossy()
    ));
    if deployed.exists() {
        StepStatus::Succeed
    } else if failed.exists() {
        StepStatus::Failed
    } else {
        StepStatus::InProgress
    }
}

pub struct StatusPoller {
    registry: Arc<RunRegistry>,
    interval: Duration,
    timeout: Duration,
}

impl StatusPoller {
    pub fn new(registry: Arc<RunRegistry>, interval: Duration, timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            timeout,
        }
    }

    /// Wait until every artifact of one server record reaches a terminal
    /// status, or the timeout budget runs out.
    ///
    /// Artifact transitions are written back into the run tree as they are
    /// observed. Never hangs past the timeout, regardless of internal
    /// errors.
    pub async fn await_completion(&self, server_id: Uuid) -> WaitOutcome {
        self.registry
            .log_server(server_id, LogLevel::Info, "Waiting for deployment completion")
            .await;
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let outcome = match self.poll_once(server_id).await {
                Some(statuses) => evaluate_tick(&statuses, started.elapsed(), self.timeout),
                None => {
                    self.registry
                        .log_server(
                            server_id,
                            LogLevel::Error,
                            "Server record vanished while polling",
                        )
                        .await;
                    return WaitOutcome::Errored;
                }
            };
            match outcome {
                TickOutcome::Continue => {}
                TickOutcome::Done(status) => return WaitOutcome::Completed(status),
                TickOutcome::TimedOut => {
                    self.registry
                        .log_server(server_id, LogLevel::Error, "Deployment timed out")
                        .await;
                    return WaitOutcome::TimedOut;
                }
            }
        }
    }

    /// Check marker files for every in-progress artifact of the server and
    /// record transitions. Returns the statuses after the tick, or `None`
    /// when the server record cannot be found.
    async fn poll_once(&self, server_id: Uuid) -> Option<Vec<StepStatus>> {
        let transitions = self
            .registry
            .update(|run| {
                let server = run.server_mut(server_id)?;
                let mut transitions = Vec::new();
                for artifact in &mut server.artifacts {
                    if artifact.status != StepStatus::InProgress {
                        continue;
                    }
                    let Some(path) = artifact.local_path.as_deref() else {
                        // Staged path missing means staging never finished;
                        // treat the artifact as failed.
                        artifact.status = StepStatus::Failed;
                        transitions.push((artifact.name.clone(), StepStatus::Failed));
                        continue;
                    };
                    let status = marker_status(path);
                    if status != StepStatus::InProgress {
                        artifact.status = status;
                        transitions.push((artifact.name.clone(), status));
                    }
                }
                Some((
                    transitions,
                    server.artifacts.iter().map(|a| a.status).collect::<Vec<_>>(),
                ))
            })
            .await??;

        let (transitions, statuses) = transitions;
        for (name, status) in transitions {
            let (level, verdict) = match status {
                StepStatus::Succeed => (LogLevel::Info, "deployed successfully"),
                _ => (LogLevel::Error, "failed to deploy"),
            };
            self.registry
                .log_server(server_id, level, format!("Artifact '{name}' {verdict}"))
                .await;
        }
        Some(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_succeed_is_done_succeed() {
        let outcome = evaluate_tick(
            &[StepStatus::Succeed, StepStatus::Succeed],
            Duration::from_secs(4),
            Duration::from_secs(180),
        );
        assert_eq!(outcome, TickOutcome::Done(StepStatus::Succeed));
    }

    #[test]
    fn any_failed_is_done_failed_once_all_terminal() {
        let outcome = evaluate_tick(
            &[StepStatus::Succeed, StepStatus::Failed],
            Duration::from_secs(4),
            Duration::from_secs(180),
        );
        assert_eq!(outcome, TickOutcome::Done(StepStatus::Failed));
    }

    #[test]
    fn in_progress_keeps_waiting_within_budget() {
        let outcome = evaluate_tick(
            &[StepStatus::Succeed, StepStatus::InProgress],
            Duration::from_secs(4),
            Duration::from_secs(180),
        );
        assert_eq!(outcome, TickOutcome::Continue);
    }

    #[test]
    fn a_failure_does_not_stop_the_wait_while_others_run() {
        let outcome = evaluate_tick(
            &[StepStatus::Failed, StepStatus::InProgress],
            Duration::from_secs(4),
            Duration::from_secs(180),
        );
        assert_eq!(outcome, TickOutcome::Continue);
    }

    #[test]
    fn budget_exhaustion_times_out() {
        let outcome = evaluate_tick(
            &[StepStatus::InProgress],
            Duration::from_secs(181),
            Duration::from_secs(180),
        );
        assert_eq!(outcome, TickOutcome::TimedOut);
    }

    #[test]
    fn empty_artifact_set_is_immediately_done() {
        let outcome = evaluate_tick(&[], Duration::ZERO, Duration::from_secs(180));
        assert_eq!(outcome, TickOutcome::Done(StepStatus::Succeed));
    }

    #[test]
    fn marker_files_decide_artifact_status() {
        let temp = tempfile::TempDir::new().unwrap();
        let staged = temp.path().join("foo-1.2.ear");
        std::fs::write(&staged, b"artifact").unwrap();

        assert_eq!(marker_status(&staged), StepStatus::InProgress);

        std::fs::write(temp.path().join("foo-1.2.ear.deployed"), b"").unwrap();
        assert_eq!(marker_status(&staged), StepStatus::Succeed);

        std::fs::remove_file(temp.path().join("foo-1.2.ear.deployed")).unwrap();
        std::fs::write(temp.path().join("foo-1.2.ear.failed"), b"").unwrap();
        assert_eq!(marker_status(&staged), StepStatus::Failed);
    }
}
