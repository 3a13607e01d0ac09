//! External tool identities and their resolved descriptors.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The Java tools the pipeline shells out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolId {
    /// apktool, used to decompile and rebuild.
    ApkTool,
    /// uber-apk-signer, used to sign rebuilt packages.
    UberApkSigner,
}

impl ToolId {
    pub const ALL: [ToolId; 2] = [ToolId::ApkTool, ToolId::UberApkSigner];

    pub fn display_name(self) -> &'static str {
        match self {
            ToolId::ApkTool => "APKTool",
            ToolId::UberApkSigner => "Uber APK Signer",
        }
    }

    /// Fixed file name of the jar inside the tools directory.
    pub fn jar_file_name(self) -> &'static str {
        match self {
            ToolId::ApkTool => "apktool.jar",
            ToolId::UberApkSigner => "uber-apk-signer.jar",
        }
    }

    /// `owner/repo` slug of the GitHub project publishing the tool.
    pub fn release_repository(self) -> &'static str {
        match self {
            ToolId::ApkTool => "iBotPeaches/Apktool",
            ToolId::UberApkSigner => "patrickfav/uber-apk-signer",
        }
    }

    /// Last known good version, used when release metadata is unavailable.
    pub fn fallback_version(self) -> &'static str {
        match self {
            ToolId::ApkTool => "2.9.3",
            ToolId::UberApkSigner => "1.3.0",
        }
    }

    /// Download URL matching [`ToolId::fallback_version`].
    pub fn fallback_download_url(self) -> &'static str {
        match self {
            ToolId::ApkTool => "https://github.com/iBotPeaches/Apktool/releases/download/v2.9.3/apktool_2.9.3.jar",
            ToolId::UberApkSigner => {
                "https://github.com/patrickfav/uber-apk-signer/releases/download/v1.3.0/uber-apk-signer-1.3.0.jar"
            }
        }
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// A tool resolved against the local tools directory and the release feed.
///
/// `is_present_locally` reflects only whether a file exists at `local_path`;
/// the installed version is never compared with `resolved_version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub id: ToolId,
    pub name: String,
    pub resolved_version: String,
    pub local_path: PathBuf,
    pub download_url: String,
    pub is_present_locally: bool,
}

impl ToolDescriptor {
    /// Descriptor carrying the pinned fallback version and URL.
    pub fn fallback(id: ToolId, local_path: PathBuf) -> Self {
        let is_present_locally = local_path.is_file();
        Self {
            id,
            name: id.display_name().to_string(),
            resolved_version: id.fallback_version().to_string(),
            local_path,
            download_url: id.fallback_download_url().to_string(),
            is_present_locally,
        }
    }
}
