//! On-disk layout of tools, decompiled projects and rebuilt packages.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use apkflow_types::ToolId;
use apkflow_util::AppConfig;
use tracing::{debug, warn};

use crate::error::StepError;

const TOOLS_DIR_NAME: &str = "tools";
const WORKSPACE_DIR_NAME: &str = "workspace";
const OUTPUT_DIR_NAME: &str = "output";

/// Maps pipeline artifacts onto `<base>/tools`, `<base>/workspace` and `<base>/output`.
///
/// Directories are created the first time they are requested, never up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceManager {
    base_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.base_dir)
    }

    pub fn tools_dir(&self) -> Result<PathBuf, StepError> {
        ensure_dir(self.base_dir.join(TOOLS_DIR_NAME))
    }

    pub fn workspace_dir(&self) -> Result<PathBuf, StepError> {
        ensure_dir(self.base_dir.join(WORKSPACE_DIR_NAME))
    }

    pub fn output_dir(&self) -> Result<PathBuf, StepError> {
        ensure_dir(self.base_dir.join(OUTPUT_DIR_NAME))
    }

    /// Location of a tool jar. Does not create anything.
    pub fn tool_path(&self, tool: ToolId) -> PathBuf {
        self.base_dir.join(TOOLS_DIR_NAME).join(tool.jar_file_name())
    }

    /// Directory a project decompiles into. Does not create anything.
    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.base_dir.join(WORKSPACE_DIR_NAME).join(project)
    }

    /// Returns the project directory for `project`, removing any previous contents.
    ///
    /// The directory itself is left for the decompiler to create.
    pub fn prepare_workspace_for(&self, project: &str) -> Result<PathBuf, StepError> {
        let target = self.workspace_dir()?.join(project);
        match fs::remove_dir_all(&target) {
            Ok(()) => debug!(path = %target.display(), "removed previous project directory"),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(source) => return Err(StepError::filesystem(&target, source)),
        }
        Ok(target)
    }

    /// Names of the decompiled projects under the workspace.
    ///
    /// Order follows the filesystem. A missing or empty workspace yields an empty list.
    pub fn list_completed_projects(&self) -> Vec<String> {
        let root = self.base_dir.join(WORKSPACE_DIR_NAME);
        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    warn!(path = %root.display(), error = %error, "cannot list workspace");
                }
                return Vec::new();
            }
        };

        entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| !name.is_empty())
            .collect()
    }

    /// `output/<project>_recompiled.apk`.
    pub fn recompiled_apk_path(&self, project: &str) -> Result<PathBuf, StepError> {
        Ok(self.output_dir()?.join(format!("{project}_recompiled.apk")))
    }
}

/// Expected name of the signed copy of `apk`: `<dir>/<stem>_signed.apk`.
///
/// The signer picks the real file name; this is the naming it uses by default.
pub fn signed_apk_path(apk: &Path) -> PathBuf {
    let stem = apk.file_stem().map(|stem| stem.to_string_lossy().to_string()).unwrap_or_default();
    apk.with_file_name(format!("{stem}_signed.apk"))
}

/// Project name derived from an input package: its file stem.
pub fn project_name_for(input: &Path) -> String {
    input
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string())
}

fn ensure_dir(path: PathBuf) -> Result<PathBuf, StepError> {
    fs::create_dir_all(&path).map_err(|source| StepError::filesystem(&path, source))?;
    Ok(path)
}
