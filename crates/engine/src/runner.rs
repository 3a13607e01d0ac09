//! External process execution with line streaming.
//!
//! [`ProcessRunner`] spawns a child with piped stdout/stderr and hands each
//! line to a caller-supplied sink as soon as it is read. Lines of one stream
//! arrive in order; there is no ordering guarantee between the two streams.
//! The runner keeps no state between invocations.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use apkflow_types::OutputStream;
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::StepError;

/// Callback receiving every line printed by a child process.
pub type LineSink<'a> = &'a mut (dyn FnMut(OutputStream, &str) + Send);

/// A fully described process launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub executable: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Kill the child after this long. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl ToolInvocation {
    pub fn new<I, S>(executable: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            executable: executable.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
            timeout: None,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Command line rendered for logs.
    pub fn display(&self) -> String {
        let mut rendered = self.executable.clone();
        for arg in &self.args {
            rendered.push(' ');
            if arg.contains(' ') {
                rendered.push('"');
                rendered.push_str(arg);
                rendered.push('"');
            } else {
                rendered.push_str(arg);
            }
        }
        rendered
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, or -1 when the process was terminated by a signal.
    pub exit_code: i32,
    /// True when the process exited successfully.
    pub completed: bool,
}

impl ExitOutcome {
    pub fn from_code(exit_code: i32) -> Self {
        Self {
            exit_code,
            completed: exit_code == 0,
        }
    }
}

/// Seam between pipeline steps and the operating system.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Runs `invocation` to completion, feeding every output line to `sink`.
    ///
    /// A process that cannot be started is reported as [`StepError::Launch`];
    /// a non-zero exit is reported through the returned [`ExitOutcome`].
    async fn run(&self, invocation: &ToolInvocation, sink: LineSink<'_>) -> Result<ExitOutcome, StepError>;
}

/// [`ToolRunner`] backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, invocation: &ToolInvocation, sink: LineSink<'_>) -> Result<ExitOutcome, StepError> {
        let program = invocation.executable.clone();
        debug!(command = %invocation.display(), cwd = ?invocation.working_dir, "spawning process");

        let mut command = Command::new(&invocation.executable);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| StepError::Launch {
            program: program.clone(),
            source,
        })?;

        let mut stdout = child.stdout.take().map(|pipe| BufReader::new(pipe).lines());
        let mut stderr = child.stderr.take().map(|pipe| BufReader::new(pipe).lines());

        let child_ref = &mut child;
        let drive = async move {
            loop {
                tokio::select! {
                    line = next_line(&mut stdout), if stdout.is_some() => match line {
                        Some(line) => sink(OutputStream::Stdout, &line),
                        None => stdout = None,
                    },
                    line = next_line(&mut stderr), if stderr.is_some() => match line {
                        Some(line) => sink(OutputStream::Stderr, &line),
                        None => stderr = None,
                    },
                    else => break,
                }
            }
            child_ref.wait().await
        };

        let status = match invocation.timeout {
            Some(limit) => match tokio::time::timeout(limit, drive).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(program = %program, timeout_secs = limit.as_secs(), "process timed out; killing");
                    if let Err(error) = child.kill().await {
                        warn!(program = %program, error = %error, "failed to kill timed-out process");
                    }
                    return Err(StepError::Timeout { program, after: limit });
                }
            },
            None => drive.await,
        }
        .map_err(|source| StepError::Launch {
            program: program.clone(),
            source,
        })?;

        let outcome = ExitOutcome {
            exit_code: status.code().unwrap_or(-1),
            completed: status.success(),
        };
        debug!(program = %program, exit_code = outcome.exit_code, "process exited");
        Ok(outcome)
    }
}

/// Next line of an optional stream; read errors end the stream.
async fn next_line<R>(lines: &mut Option<Lines<R>>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    let reader = lines.as_mut()?;
    match reader.next_line().await {
        Ok(line) => line,
        Err(error) => {
            debug!(error = %error, "output stream closed with error");
            None
        }
    }
}
