use std::path::PathBuf;
use std::time::Duration;

use apkflow_types::{StepId, TransitionError};
use thiserror::Error;

/// Why a single step attempt failed.
///
/// The orchestrator turns every variant into a `Failed` step and a status
/// message; none of them escape a run.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("failed to launch '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process exited with code {code}")]
    ExitFailure { code: i32 },
    #[error("expected output {path} was not produced")]
    ArtifactMissing { path: PathBuf },
    #[error("{0}")]
    Network(String),
    #[error("filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("'{program}' did not finish within {}s", .after.as_secs())]
    Timeout { program: String, after: Duration },
    #[error("Java runtime not found: {reason}")]
    JavaMissing { reason: String },
    #[error("no decompiled project is available")]
    ProjectMissing,
    #[error("no input APK has been selected")]
    InputNotSelected,
}

impl StepError {
    pub(crate) fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StepError::Filesystem {
            path: path.into(),
            source,
        }
    }
}

/// Caller mistakes rejected by the orchestrator without changing its state.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("the pipeline is busy running a step")]
    Busy,
    #[error("cannot {action} while the pipeline is at '{current}'")]
    NotReady { action: &'static str, current: StepId },
    #[error("input file {path} does not exist")]
    InputMissing { path: PathBuf },
    #[error(transparent)]
    Transition(#[from] TransitionError),
}
