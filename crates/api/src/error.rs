use std::path::PathBuf;

use thiserror::Error;

/// Failures while resolving or downloading a tool.
///
/// None of these escape [`crate::ToolProvisioner::ensure`], which falls back
/// to pinned versions; `download` reports them as `false`.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid release API base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("release has no downloadable jar for {tool}")]
    NoMatchingAsset { tool: String },
    #[error("failed to write {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
