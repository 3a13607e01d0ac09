//! Local tool resolution and download.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use apkflow_types::{ToolDescriptor, ToolId};
use apkflow_util::{AppConfig, LogSink};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::client::ReleaseClient;
use crate::error::ProvisionError;

/// Source of tool jars consumed by the pipeline.
///
/// [`ToolProvisioner`] is the production implementation; the seam lets
/// callers substitute a scripted source.
#[async_trait]
pub trait ToolSource: Send + Sync {
    /// Describe `tool`: where it lives locally, whether it is there, and where to fetch it.
    ///
    /// Never fails; unreachable metadata falls back to pinned values.
    async fn ensure(&self, tool: ToolId) -> ToolDescriptor;

    /// Fetch `descriptor.download_url` into `descriptor.local_path`.
    ///
    /// `on_progress` receives percentages when the total size is known.
    async fn download(&self, descriptor: &ToolDescriptor, on_progress: &mut (dyn FnMut(u8) + Send)) -> bool;
}

/// Resolves tool jars under the tools directory, downloading them from GitHub releases.
#[derive(Debug, Clone)]
pub struct ToolProvisioner {
    client: ReleaseClient,
    tools_dir: PathBuf,
    log: Arc<LogSink>,
}

impl ToolProvisioner {
    pub fn new(client: ReleaseClient, tools_dir: impl Into<PathBuf>, log: Arc<LogSink>) -> Self {
        Self {
            client,
            tools_dir: tools_dir.into(),
            log,
        }
    }

    /// Builds the client and provisioner from application configuration.
    pub fn from_config(config: &AppConfig, log: Arc<LogSink>) -> Result<Self, ProvisionError> {
        let client = ReleaseClient::new(&config.release_api_base, &config.user_agent, config.http_timeout())?;
        Ok(Self::new(client, config.tools_dir(), log))
    }

    /// Deterministic local path of a tool jar.
    pub fn tool_path(&self, tool: ToolId) -> PathBuf {
        self.tools_dir.join(tool.jar_file_name())
    }

    async fn resolve_latest(&self, tool: ToolId) -> Result<(String, String), ProvisionError> {
        let release = self.client.latest_release(tool.release_repository()).await?;
        let asset = release.select_asset(tool).ok_or_else(|| ProvisionError::NoMatchingAsset {
            tool: tool.display_name().to_string(),
        })?;
        Ok((release.version(), asset.browser_download_url.clone()))
    }

    /// Streams the jar into its `.part` sibling and renames it into place
    /// once the body is complete, so an interrupted download never looks
    /// installed.
    async fn fetch_to_disk(
        &self,
        descriptor: &ToolDescriptor,
        on_progress: &mut (dyn FnMut(u8) + Send),
    ) -> Result<u64, ProvisionError> {
        let response = self.client.download(&descriptor.download_url).await?;
        let total = response.content_length().filter(|length| *length > 0);

        let path = &descriptor.local_path;
        let partial = partial_path(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(filesystem(parent))?;
        }
        let mut file = fs::File::create(&partial).await.map_err(filesystem(&partial))?;

        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut last_reported: Option<u8> = None;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| ProvisionError::Network {
                url: descriptor.download_url.clone(),
                source,
            })?;
            file.write_all(&chunk).await.map_err(filesystem(&partial))?;
            downloaded += chunk.len() as u64;

            if let Some(total) = total {
                let percent = (downloaded.saturating_mul(100) / total).min(100) as u8;
                if last_reported != Some(percent) {
                    on_progress(percent);
                    last_reported = Some(percent);
                }
            }
        }
        file.flush().await.map_err(filesystem(&partial))?;
        file.sync_all().await.map_err(filesystem(&partial))?;
        drop(file);

        fs::rename(&partial, path).await.map_err(filesystem(path))?;
        Ok(downloaded)
    }
}

/// In-progress download location for `path`: `apktool.jar` becomes `apktool.jar.part`.
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|name| name.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

fn filesystem(path: &Path) -> impl Fn(std::io::Error) -> ProvisionError + '_ {
    move |source| ProvisionError::Filesystem {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl ToolSource for ToolProvisioner {
    async fn ensure(&self, tool: ToolId) -> ToolDescriptor {
        let local_path = self.tool_path(tool);
        let is_present_locally = local_path.is_file();

        let (resolved_version, download_url) = match self.resolve_latest(tool).await {
            Ok(resolved) => resolved,
            Err(error) => {
                warn!(tool = %tool, error = %error, "release lookup failed; using pinned fallback");
                self.log
                    .warning(format!("GitHub API failed for {tool}, using fallback: {error}"));
                (tool.fallback_version().to_string(), tool.fallback_download_url().to_string())
            }
        };

        debug!(tool = %tool, version = %resolved_version, present = is_present_locally, "resolved tool");
        ToolDescriptor {
            id: tool,
            name: tool.display_name().to_string(),
            resolved_version,
            local_path,
            download_url,
            is_present_locally,
        }
    }

    async fn download(&self, descriptor: &ToolDescriptor, on_progress: &mut (dyn FnMut(u8) + Send)) -> bool {
        self.log.info(format!(
            "Downloading {} from {}",
            descriptor.name, descriptor.download_url
        ));
        match self.fetch_to_disk(descriptor, on_progress).await {
            Ok(bytes) => {
                info!(tool = %descriptor.id, bytes, path = %descriptor.local_path.display(), "download complete");
                self.log.info(format!(
                    "Successfully downloaded {} to {}",
                    descriptor.name,
                    descriptor.local_path.display()
                ));
                true
            }
            Err(error) => {
                warn!(tool = %descriptor.id, error = %error, "download failed");
                self.log
                    .error(format!("Failed to download {}: {error}", descriptor.name));
                let partial = partial_path(&descriptor.local_path);
                if let Err(error) = fs::remove_file(&partial).await
                    && error.kind() != std::io::ErrorKind::NotFound
                {
                    debug!(path = %partial.display(), error = %error, "could not remove partial download");
                }
                false
            }
        }
    }
}
