//! Pipeline step model shared by the engine and the command line front end.
//!
//! A run walks a fixed, ordered list of [`StepId`]s. Each step owns a
//! [`PipelineStep`] record whose status may only move along
//! `Pending -> InProgress -> {Completed | Failed | Skipped}`; the helpers on
//! [`PipelineStep`] enforce that path and return a [`TransitionError`] for
//! anything else.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound for step progress.
pub const MAX_PROGRESS: u8 = 100;

/// Ceiling applied to incremental progress while a step's outcome is unknown.
pub const IN_FLIGHT_PROGRESS_CEILING: u8 = 95;

/// Identity of a pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    /// Verify a Java runtime is available.
    ToolCheck,
    /// Make sure apktool and uber-apk-signer exist locally.
    ToolProvision,
    /// Wait for the user to choose an APK.
    InputSelection,
    /// Decompile the APK into the workspace.
    Unpack,
    /// Wait while the user edits the decompiled project.
    ManualEdit,
    /// Rebuild the project into an APK.
    Repack,
    /// Sign the rebuilt APK.
    Sign,
    /// Terminal marker for a finished run.
    Done,
}

impl StepId {
    /// Every step, in execution order.
    pub const ALL: [StepId; 8] = [
        StepId::ToolCheck,
        StepId::ToolProvision,
        StepId::InputSelection,
        StepId::Unpack,
        StepId::ManualEdit,
        StepId::Repack,
        StepId::Sign,
        StepId::Done,
    ];

    /// Position of the step within [`StepId::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// The step that follows this one, if any.
    pub fn next(self) -> Option<StepId> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Whether the step chains automatically or waits for an external trigger.
    pub fn kind(self) -> StepKind {
        match self {
            StepId::InputSelection | StepId::ManualEdit => StepKind::UserGated,
            _ => StepKind::Automatic,
        }
    }

    /// Human readable title.
    pub fn title(self) -> &'static str {
        match self {
            StepId::ToolCheck => "Check Java",
            StepId::ToolProvision => "Download Tools",
            StepId::InputSelection => "Select APK",
            StepId::Unpack => "Decompile APK",
            StepId::ManualEdit => "Edit Files",
            StepId::Repack => "Recompile APK",
            StepId::Sign => "Sign APK",
            StepId::Done => "Complete",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// How a step is entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Runs as soon as the previous step completes.
    Automatic,
    /// Requires an explicit trigger from the user.
    UserGated,
}

/// Lifecycle status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped)
    }

    /// Returns true when `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        match self {
            StepStatus::Pending => next == StepStatus::InProgress,
            StepStatus::InProgress => next.is_terminal(),
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped => false,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// Raised when a status change would leave the allowed path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("step '{step}' cannot move from {from} to {to}")]
pub struct TransitionError {
    pub step: StepId,
    pub from: StepStatus,
    pub to: StepStatus,
}

/// State of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStep {
    id: StepId,
    status: StepStatus,
    progress: u8,
    message: String,
}

impl PipelineStep {
    pub fn new(id: StepId) -> Self {
        Self {
            id,
            status: StepStatus::Pending,
            progress: 0,
            message: String::new(),
        }
    }

    pub fn id(&self) -> StepId {
        self.id
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn title(&self) -> &'static str {
        self.id.title()
    }

    pub fn kind(&self) -> StepKind {
        self.id.kind()
    }

    /// Moves the step from `Pending` to `InProgress` and zeroes its progress.
    pub fn begin(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(StepStatus::InProgress)?;
        self.progress = 0;
        self.message = message.into();
        Ok(())
    }

    /// Marks the step completed and snaps progress to 100.
    pub fn complete(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(StepStatus::Completed)?;
        self.progress = MAX_PROGRESS;
        self.message = message.into();
        Ok(())
    }

    /// Marks the step failed. Progress keeps whatever value it reached.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(StepStatus::Failed)?;
        self.message = message.into();
        Ok(())
    }

    pub fn skip(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(StepStatus::Skipped)?;
        self.message = message.into();
        Ok(())
    }

    /// Assigns progress, clamped to `[0, 100]`.
    pub fn set_progress(&mut self, value: i64) {
        self.progress = value.clamp(0, i64::from(MAX_PROGRESS)) as u8;
    }

    /// Adds `increment` to the current progress without exceeding `ceiling`.
    ///
    /// Progress never moves backwards through this call.
    pub fn bump_progress(&mut self, increment: u8, ceiling: u8) {
        let ceiling = ceiling.min(MAX_PROGRESS);
        let bumped = self.progress.saturating_add(increment).min(ceiling);
        self.progress = self.progress.max(bumped);
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = message.into();
    }

    /// Returns the step to `Pending`, clearing progress and message.
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.progress = 0;
        self.message.clear();
    }

    fn transition(&mut self, to: StepStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                step: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

/// Which output stream of a child process a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Notifications published by the orchestrator to its subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Snapshot of a step after any change to its status, progress or message.
    StepChanged { step: PipelineStep, at: DateTime<Utc> },
    /// A line written by an external tool while a step runs.
    ToolOutput { step: StepId, stream: OutputStream, line: String },
    /// Tools are ready; the pipeline waits for an input APK.
    AwaitingInput,
    /// Decompilation finished; the pipeline waits until editing is done.
    AwaitingEdit { project_dir: PathBuf },
    /// A step failed and the pipeline stopped.
    Halted { step: StepId, message: String },
    /// The run reached its terminal step.
    Completed { artifact: PathBuf },
}
