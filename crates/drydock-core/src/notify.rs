//! Deployment report notifications.
//!
//! Delivery (SMTP etc.) is a collaborator behind the `Notifier` trait and
//! is strictly best effort: failures are logged, never propagated into the
//! run outcome.

use async_trait::async_trait;

use crate::config::AppConfig;
use crate::model::{NotifyMode, Run, RunStatus, StepStatus, TargetConfig};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipients: &[String], subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Fallback notifier that only traces the report.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipients: &[String], subject: &str, _body: &str) -> anyhow::Result<()> {
        tracing::info!(?recipients, subject, "deployment report");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Report {
    pub subject: String,
    pub body: String,
}

/// Whether the configuration's notification settings ask for a report on
/// this run outcome.
pub fn should_notify(config: &TargetConfig, run: &Run) -> bool {
    if config.notify.recipients.is_empty() {
        return false;
    }
    match config.notify.mode {
        NotifyMode::Always => true,
        NotifyMode::Never => false,
        NotifyMode::Failed => run.status == RunStatus::Failed,
        NotifyMode::Succeed => run.status == RunStatus::Succeed,
    }
}

/// Build the per-server, per-artifact HTML report for a finished run.
pub fn build_report(app: &AppConfig, config: &TargetConfig, run: &Run) -> Report {
    let verdict = if run.status == RunStatus::Failed {
        "KO"
    } else {
        "OK"
    };
    let mut body = String::new();
    let mut total = 0usize;
    let mut failed = 0usize;

    for server in &run.servers {
        let (color, server_verdict) = colorize(server.status);
        body.push_str(&format!(
            "<br/><h3><font color=\"{color}\">{server_verdict}</font> : Server {} - \
             <a href=\"{}/servers/{}/log\">server.log</a></h3>",
            server.name, app.server_location, server.id
        ));
        for artifact in &server.artifacts {
            let (color, artifact_verdict) = colorize(artifact.status);
            let link = artifact.url.as_deref().unwrap_or("#");
            body.push_str(&format!(
                "<font color=\"{color}\">{artifact_verdict}</font> : {} - \
                 <a href=\"{link}\">Download</a><br/>",
                artifact.name
            ));
            total += 1;
            if artifact.status == StepStatus::Failed {
                failed += 1;
            }
        }
    }

    let counts = if failed > 0 {
        format!("{failed}/{total} KO")
    } else {
        format!("{total}/{total} OK")
    };
    let subject = format!(
        "[{}] [{}] Deployment {verdict} - {counts}",
        config.full_name(),
        run.created_at.format("%d/%m/%Y, %H:%M:%S")
    );

    Report { subject, body }
}

fn colorize(status: StepStatus) -> (&'static str, &'static str) {
    if status == StepStatus::Failed {
        ("red", "KO")
    } else {
        ("green", "OK")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServerRecord;
    use url::Url;
    use uuid::Uuid;

    fn config_with_mode(mode: NotifyMode, recipients: Vec<String>) -> TargetConfig {
        let mut config = TargetConfig::new(
            "webapp",
            "1.2",
            Url::parse("http://repo.example.com/libs/").unwrap(),
        );
        config.notify.mode = mode;
        config.notify.recipients = recipients;
        config
    }

    fn finished_run(status: RunStatus) -> Run {
        let mut run = Run::new(Uuid::new_v4());
        run.status = status;
        run
    }

    #[test]
    fn no_recipients_means_no_report() {
        let config = config_with_mode(NotifyMode::Always, vec![]);
        assert!(!should_notify(&config, &finished_run(RunStatus::Failed)));
    }

    #[test]
    fn mode_gates_on_run_status() {
        let config = config_with_mode(NotifyMode::Failed, vec!["ops@example.com".into()]);
        assert!(should_notify(&config, &finished_run(RunStatus::Failed)));
        assert!(!should_notify(&config, &finished_run(RunStatus::Succeed)));

        let config = config_with_mode(NotifyMode::Always, vec!["ops@example.com".into()]);
        assert!(should_notify(&config, &finished_run(RunStatus::Succeed)));
    }

    #[test]
    fn report_counts_failed_artifacts() {
        let app = AppConfig::default();
        let config = config_with_mode(NotifyMode::Always, vec!["ops@example.com".into()]);
        let mut run = finished_run(RunStatus::Failed);
        let mut server = ServerRecord::new("srv-1", &["foo".into(), "bar".into()]);
        server.artifacts[0].status = StepStatus::Succeed;
        server.artifacts[1].status = StepStatus::Failed;
        server.status = StepStatus::Failed;
        run.servers.push(server);

        let report = build_report(&app, &config, &run);
        assert!(report.subject.contains("Deployment KO - 1/2 KO"));
        assert!(report.body.contains("Server srv-1"));
        assert!(report.body.contains("bar"));
    }
}
