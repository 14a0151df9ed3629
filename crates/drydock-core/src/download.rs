//! Checksummed artifact downloads with bounded retries.
//!
//! The repository publishes an `.md5` sidecar next to every artifact. The
//! sidecar is fetched once per logical download and reused across retries;
//! only the artifact body is re-fetched on a checksum mismatch. Bodies are
//! streamed to disk and hashed chunk by chunk, never buffered whole.
//! Transport errors are not retried.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use futures::future::try_join_all;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{DeployError, Result};
use crate::fetch::HttpFetch;
use crate::model::{LogLevel, TargetConfig};
use crate::registry::RunRegistry;
use crate::resolver::{self, Resolver};

/// A verified artifact staged into a deployments folder.
#[derive(Debug, Clone)]
pub struct StagedArtifact {
    /// Artifact name as configured on the server.
    pub name: String,
    /// Resolved download URL.
    pub url: String,
    /// Local filename, the URL's trailing path segment.
    pub file_name: String,
    pub path: PathBuf,
}

pub struct DownloadManager {
    fetch: Arc<dyn HttpFetch>,
    registry: Arc<RunRegistry>,
}

impl DownloadManager {
    pub fn new(fetch: Arc<dyn HttpFetch>, registry: Arc<RunRegistry>) -> Self {
        Self { fetch, registry }
    }

    /// Download one artifact into `folder` and verify it against its
    /// checksum sidecar.
    ///
    /// On mismatch the body is re-fetched until the attempt budget runs
    /// out, then the download fails with an integrity error. The sidecar
    /// is removed once verification passes.
    pub async fn fetch_verified(
        &self,
        server_id: Uuid,
        url: &str,
        folder: &Path,
        max_attempts: u32,
    ) -> Result<PathBuf> {
        let file_name = url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| DeployError::Validation(format!("no file name in URL '{url}'")))?;
        let path = folder.join(file_name);
        let sidecar = folder.join(format!("{file_name}.md5"));

        // The sidecar survives retries of the same logical download; only
        // fetch it when it is not on disk yet.
        if !sidecar.exists() {
            self.registry
                .log_server(
                    server_id,
                    LogLevel::Info,
                    format!("Fetching checksum sidecar for '{file_name}'"),
                )
                .await;
            let bytes = self.fetch.fetch_bytes(&format!("{url}.md5")).await?;
            tokio::fs::write(&sidecar, &bytes).await?;
        }
        let expected = read_sidecar_checksum(&sidecar).await?;

        for attempt in 1..=max_attempts.max(1) {
            if attempt == 1 {
                self.registry
                    .log_server(
                        server_id,
                        LogLevel::Info,
                        format!("Downloading '{url}' into '{}'", folder.display()),
                    )
                    .await;
            } else {
                self.registry
                    .log_server(
                        server_id,
                        LogLevel::Info,
                        format!("Retrying download of '{url}' (attempt {attempt}/{max_attempts})"),
                    )
                    .await;
            }
            let mut stream = self.fetch.fetch_stream(url).await?;
            let mut file = tokio::fs::File::create(&path).await?;
            let mut digest = md5::Context::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                digest.consume(&chunk);
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            drop(file);

            let actual = format!("{:x}", digest.compute());
            if actual.eq_ignore_ascii_case(&expected) {
                self.registry
                    .log_server(
                        server_id,
                        LogLevel::Info,
                        format!("Checksum verification of '{file_name}' passed"),
                    )
                    .await;
                tokio::fs::remove_file(&sidecar).await?;
                return Ok(path);
            }
            self.registry
                .log_server(
                    server_id,
                    LogLevel::Warning,
                    format!("Checksum mismatch for '{file_name}' on attempt {attempt}"),
                )
                .await;
        }

        self.registry
            .log_server(
                server_id,
                LogLevel::Error,
                format!("Download of '{url}' failed after {max_attempts} attempt(s)"),
            )
            .await;
        Err(DeployError::Integrity {
            url: url.to_string(),
            attempts: max_attempts,
        })
    }

    /// Resolve and download the latest version of every artifact of one
    /// server, concurrently.
    ///
    /// The staging step completes only once every fetch has resolved; any
    /// single failure fails the whole step.
    pub async fn stage_server(
        &self,
        config: &TargetConfig,
        server_id: Uuid,
        artifacts: &[String],
        folder: &Path,
        max_attempts: u32,
    ) -> Result<Vec<StagedArtifact>> {
        let resolver = Resolver::new(self.fetch.clone());
        let downloads = artifacts.iter().map(|artifact| {
            let resolver = &resolver;
            async move {
                self.stage_one(config, server_id, artifact, resolver, folder, max_attempts)
                    .await
            }
        });
        try_join_all(downloads).await
    }

    async fn stage_one(
        &self,
        config: &TargetConfig,
        server_id: Uuid,
        artifact: &str,
        resolver: &Resolver,
        folder: &Path,
        max_attempts: u32,
    ) -> Result<StagedArtifact> {
        let family_url = config.family_url(artifact);
        self.registry
            .log_server(
                server_id,
                LogLevel::Info,
                format!("Resolving latest version of '{}'", config.full_name()),
            )
            .await;

        let listing = self.fetch.fetch(&family_url).await?;
        if listing.status != 200 {
            return Err(DeployError::Http {
                url: family_url,
                reason: format!("HTTP {}", listing.status),
            });
        }
        let version = resolver::latest_version(&config.numero, config.snapshot, &listing.body)?
            .ok_or_else(|| {
                DeployError::NotFound(format!(
                    "no version of artifact '{artifact}' found in the repository"
                ))
            })?;
        self.registry
            .log_server(
                server_id,
                LogLevel::Info,
                format!("Latest version of '{artifact}': {version}"),
            )
            .await;

        let url = resolver
            .resolve_artifact_url(&config.numero, config.snapshot, artifact, &family_url, &version)
            .await?;
        let path = self
            .fetch_verified(server_id, &url, folder, max_attempts)
            .await?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| artifact.to_string());

        Ok(StagedArtifact {
            name: artifact.to_string(),
            url,
            file_name,
            path,
        })
    }
}

async fn read_sidecar_checksum(sidecar: &Path) -> Result<String> {
    let content = tokio::fs::read_to_string(sidecar).await?;
    let first_line = content.lines().next().unwrap_or("").trim().to_string();
    if first_line.is_empty() {
        return Err(DeployError::RepositoryFormat(format!(
            "empty checksum sidecar '{}'",
            sidecar.display()
        )));
    }
    Ok(first_line)
}
