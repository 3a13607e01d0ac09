//! GitHub "latest release" payload and asset selection rules.

use apkflow_types::ToolId;
use serde::{Deserialize, Serialize};

/// Subset of the GitHub release document used for tool discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubRelease {
    pub tag_name: String,
    pub name: String,
    pub prerelease: bool,
    pub assets: Vec<GitHubAsset>,
}

/// A downloadable file attached to a release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubAsset {
    pub name: String,
    pub browser_download_url: String,
    pub size: u64,
}

impl GitHubRelease {
    /// Tag name without a leading `v` (`v2.9.3` -> `2.9.3`).
    pub fn version(&self) -> String {
        self.tag_name.trim().trim_start_matches('v').to_string()
    }

    /// Picks the jar to download for `tool`.
    ///
    /// apktool releases also ship a sources jar, which is skipped; for the
    /// signer any jar asset is accepted. The first match in asset order wins.
    pub fn select_asset(&self, tool: ToolId) -> Option<&GitHubAsset> {
        self.assets.iter().find(|asset| {
            let is_jar = asset.name.ends_with(".jar");
            match tool {
                ToolId::ApkTool => is_jar && !asset.name.contains("sources"),
                ToolId::UberApkSigner => is_jar,
            }
        })
    }
}
