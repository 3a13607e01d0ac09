//! apktool and uber-apk-signer invocations.
//!
//! [`ApkToolchain`] turns the three package operations (decompile, rebuild,
//! sign) into `java -jar` command lines, runs them through a [`ToolRunner`]
//! and decides success. The orchestrator drives it step by step; the CLI
//! also calls it directly for one-off operations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use apkflow_types::{OutputStream, ToolId};
use apkflow_util::{AppConfig, LogLevel, LogSink};
use tracing::info;

use crate::error::StepError;
use crate::java::probe_java;
use crate::runner::{ExitOutcome, LineSink, ToolInvocation, ToolRunner};
use crate::workspace::{WorkspaceManager, project_name_for, signed_apk_path};

/// How lines of one tool are written to the log file.
struct LogLabels {
    stdout: &'static str,
    stderr: &'static str,
    stderr_level: LogLevel,
}

const DECOMPILE_LABELS: LogLabels = LogLabels {
    stdout: "APKTool Output",
    stderr: "APKTool Error",
    stderr_level: LogLevel::Error,
};

const BUILD_LABELS: LogLabels = LogLabels {
    stdout: "APKTool Build Output",
    stderr: "APKTool Build Error",
    stderr_level: LogLevel::Error,
};

// The signer reports progress on stderr.
const SIGN_LABELS: LogLabels = LogLabels {
    stdout: "UberSigner Output",
    stderr: "UberSigner Info",
    stderr_level: LogLevel::Info,
};

/// Runs the package tools against a [`WorkspaceManager`] layout.
#[derive(Clone)]
pub struct ApkToolchain {
    runner: Arc<dyn ToolRunner>,
    workspace: WorkspaceManager,
    java: String,
    timeout: Option<Duration>,
    log: Arc<LogSink>,
}

impl std::fmt::Debug for ApkToolchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApkToolchain")
            .field("workspace", &self.workspace)
            .field("java", &self.java)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ApkToolchain {
    pub fn new(
        runner: Arc<dyn ToolRunner>,
        workspace: WorkspaceManager,
        java: impl Into<String>,
        timeout: Option<Duration>,
        log: Arc<LogSink>,
    ) -> Self {
        Self {
            runner,
            workspace,
            java: java.into(),
            timeout,
            log,
        }
    }

    pub fn from_config(config: &AppConfig, runner: Arc<dyn ToolRunner>, log: Arc<LogSink>) -> Self {
        Self::new(
            runner,
            WorkspaceManager::from_config(config),
            config.java_executable.clone(),
            config.process_timeout(),
            log,
        )
    }

    pub fn workspace(&self) -> &WorkspaceManager {
        &self.workspace
    }

    pub fn log(&self) -> &Arc<LogSink> {
        &self.log
    }

    /// Probes the configured Java executable; returns its version.
    pub async fn check_java(&self) -> Result<String, StepError> {
        probe_java(self.runner.as_ref(), &self.java, self.timeout).await
    }

    /// `java -jar apktool.jar d <apk> -o <project_dir> -f`, run from the workspace.
    pub fn decompile_invocation(&self, apk: &Path, project_dir: &Path, workspace_dir: &Path) -> ToolInvocation {
        let jar = self.workspace.tool_path(ToolId::ApkTool);
        ToolInvocation::new(
            self.java.clone(),
            [
                "-jar".to_string(),
                path_arg(&jar),
                "d".to_string(),
                path_arg(apk),
                "-o".to_string(),
                path_arg(project_dir),
                "-f".to_string(),
            ],
        )
        .working_dir(workspace_dir)
        .timeout(self.timeout)
    }

    /// `java -jar apktool.jar b <project_dir> -o <output_apk>`, run from the workspace.
    pub fn rebuild_invocation(&self, project_dir: &Path, output_apk: &Path, workspace_dir: &Path) -> ToolInvocation {
        let jar = self.workspace.tool_path(ToolId::ApkTool);
        ToolInvocation::new(
            self.java.clone(),
            [
                "-jar".to_string(),
                path_arg(&jar),
                "b".to_string(),
                path_arg(project_dir),
                "-o".to_string(),
                path_arg(output_apk),
            ],
        )
        .working_dir(workspace_dir)
        .timeout(self.timeout)
    }

    /// `java -jar uber-apk-signer.jar --apks <apk> --out <apk dir>`, run from the APK's directory.
    pub fn sign_invocation(&self, apk: &Path) -> ToolInvocation {
        let jar = self.workspace.tool_path(ToolId::UberApkSigner);
        let out_dir = apk.parent().map(Path::to_path_buf).unwrap_or_default();
        ToolInvocation::new(
            self.java.clone(),
            [
                "-jar".to_string(),
                path_arg(&jar),
                "--apks".to_string(),
                path_arg(apk),
                "--out".to_string(),
                path_arg(&out_dir),
            ],
        )
        .working_dir(out_dir)
        .timeout(self.timeout)
    }

    /// Decompiles `apk` into `workspace/<stem>`, replacing any earlier copy.
    ///
    /// Succeeds on exit code 0 and returns the project directory.
    pub async fn unpack(&self, apk: &Path, sink: LineSink<'_>) -> Result<PathBuf, StepError> {
        let project = project_name_for(apk);
        let workspace_dir = self.workspace.workspace_dir()?;
        let project_dir = self.workspace.prepare_workspace_for(&project)?;

        self.log
            .info(format!("Decompiling APK: {} to {}", apk.display(), project_dir.display()));
        let invocation = self.decompile_invocation(apk, &project_dir, &workspace_dir);
        let outcome = self
            .run_logged(&invocation, &DECOMPILE_LABELS, sink)
            .await
            .inspect_err(|error| self.log.error(format!("Decompilation error: {error}")))?;

        if !outcome.completed {
            self.log
                .error(format!("APKTool failed with exit code: {}", outcome.exit_code));
            return Err(StepError::ExitFailure { code: outcome.exit_code });
        }
        self.log
            .info(format!("Successfully decompiled APK to {}", project_dir.display()));
        info!(project = %project, "decompiled");
        Ok(project_dir)
    }

    /// Rebuilds `workspace/<project>` into `output/<project>_recompiled.apk`.
    ///
    /// Succeeds only when the exit code is 0 and the APK exists afterwards.
    pub async fn repack(&self, project: &str, sink: LineSink<'_>) -> Result<PathBuf, StepError> {
        let project_dir = self.workspace.project_dir(project);
        if !project_dir.is_dir() {
            return Err(StepError::ProjectMissing);
        }
        let workspace_dir = self.workspace.workspace_dir()?;
        let output_apk = self.workspace.recompiled_apk_path(project)?;

        self.log.info(format!(
            "Recompiling project: {} to {}",
            project_dir.display(),
            output_apk.display()
        ));
        let invocation = self.rebuild_invocation(&project_dir, &output_apk, &workspace_dir);
        let outcome = self
            .run_logged(&invocation, &BUILD_LABELS, sink)
            .await
            .inspect_err(|error| self.log.error(format!("Recompilation error: {error}")))?;

        if !outcome.completed {
            self.log
                .error(format!("APKTool build failed with exit code: {}", outcome.exit_code));
            return Err(StepError::ExitFailure { code: outcome.exit_code });
        }
        if !output_apk.is_file() {
            self.log
                .error(format!("APKTool build produced no file at {}", output_apk.display()));
            return Err(StepError::ArtifactMissing { path: output_apk });
        }
        self.log
            .info(format!("Successfully recompiled APK to {}", output_apk.display()));
        info!(project = %project, "recompiled");
        Ok(output_apk)
    }

    /// Signs `apk` in place (output next to the input).
    ///
    /// Only the exit code decides success; the returned path is the signer's
    /// default naming and is not checked.
    pub async fn sign(&self, apk: &Path, sink: LineSink<'_>) -> Result<PathBuf, StepError> {
        if !apk.is_file() {
            return Err(StepError::ArtifactMissing { path: apk.to_path_buf() });
        }

        self.log.info(format!("Signing APK: {}", apk.display()));
        let invocation = self.sign_invocation(apk);
        let outcome = self
            .run_logged(&invocation, &SIGN_LABELS, sink)
            .await
            .inspect_err(|error| self.log.error(format!("Signing error: {error}")))?;

        if !outcome.completed {
            self.log
                .error(format!("UberSigner failed with exit code: {}", outcome.exit_code));
            return Err(StepError::ExitFailure { code: outcome.exit_code });
        }
        self.log.info("Successfully signed APK");
        Ok(signed_apk_path(apk))
    }

    async fn run_logged(
        &self,
        invocation: &ToolInvocation,
        labels: &LogLabels,
        sink: LineSink<'_>,
    ) -> Result<ExitOutcome, StepError> {
        let log = self.log.as_ref();
        let mut forward = |stream: OutputStream, line: &str| {
            match stream {
                OutputStream::Stdout => log.info(format!("{}: {line}", labels.stdout)),
                OutputStream::Stderr => log.write(labels.stderr_level, &format!("{}: {line}", labels.stderr)),
            }
            sink(stream, line);
        };
        self.runner.run(invocation, &mut forward).await
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Records invocations and replies with a fixed exit code, optionally creating a file.
    struct Scripted {
        exit_code: i32,
        creates: Option<PathBuf>,
        seen: Mutex<Vec<ToolInvocation>>,
    }

    impl Scripted {
        fn new(exit_code: i32, creates: Option<PathBuf>) -> Arc<Self> {
            Arc::new(Self {
                exit_code,
                creates,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ToolRunner for Scripted {
        async fn run(&self, invocation: &ToolInvocation, sink: LineSink<'_>) -> Result<ExitOutcome, StepError> {
            self.seen.lock().unwrap().push(invocation.clone());
            sink(OutputStream::Stdout, "I: working");
            sink(OutputStream::Stderr, "W: careful");
            if let Some(path) = &self.creates {
                fs::write(path, b"apk").unwrap();
            }
            Ok(ExitOutcome::from_code(self.exit_code))
        }
    }

    fn toolchain(base: &Path, runner: Arc<Scripted>) -> ApkToolchain {
        let log = Arc::new(LogSink::new(base.join("logs").join("app.log")));
        ApkToolchain::new(runner, WorkspaceManager::new(base), "java", None, log)
    }

    #[tokio::test]
    async fn unpack_builds_decompile_command() {
        let dir = tempdir().unwrap();
        let runner = Scripted::new(0, None);
        let chain = toolchain(dir.path(), runner.clone());
        let apk = dir.path().join("sample.apk");
        fs::write(&apk, b"apk").unwrap();

        let mut lines = Vec::new();
        let project_dir = chain
            .unpack(&apk, &mut |_, line: &str| lines.push(line.to_string()))
            .await
            .unwrap();

        let workspace = dir.path().join("workspace");
        assert_eq!(project_dir, workspace.join("sample"));
        assert_eq!(lines, vec!["I: working", "W: careful"]);

        let seen = runner.seen.lock().unwrap();
        let invocation = &seen[0];
        assert_eq!(invocation.executable, "java");
        assert_eq!(
            invocation.args,
            vec![
                "-jar".to_string(),
                path_arg(&dir.path().join("tools").join("apktool.jar")),
                "d".to_string(),
                path_arg(&apk),
                "-o".to_string(),
                path_arg(&workspace.join("sample")),
                "-f".to_string(),
            ]
        );
        assert_eq!(invocation.working_dir.as_deref(), Some(workspace.as_path()));

        let log = fs::read_to_string(dir.path().join("logs").join("app.log")).unwrap();
        assert!(log.contains("[INFO] APKTool Output: I: working"));
        assert!(log.contains("[ERROR] APKTool Error: W: careful"));
    }

    #[tokio::test]
    async fn repack_requires_the_artifact() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("workspace").join("sample")).unwrap();

        let chain = toolchain(dir.path(), Scripted::new(0, None));
        let error = chain.repack("sample", &mut |_, _: &str| {}).await.unwrap_err();
        assert!(matches!(error, StepError::ArtifactMissing { .. }));

        let output = dir.path().join("output").join("sample_recompiled.apk");
        let runner = Scripted::new(0, Some(output.clone()));
        let chain = toolchain(dir.path(), runner.clone());
        assert_eq!(chain.repack("sample", &mut |_, _: &str| {}).await.unwrap(), output);
        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen[0].args[2], "b");
        assert_eq!(seen[0].args[5], path_arg(&output));
    }

    #[tokio::test]
    async fn repack_without_project_is_rejected() {
        let dir = tempdir().unwrap();
        let runner = Scripted::new(0, None);
        let chain = toolchain(dir.path(), runner.clone());
        let error = chain.repack("ghost", &mut |_, _: &str| {}).await.unwrap_err();
        assert!(matches!(error, StepError::ProjectMissing));
        assert!(runner.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sign_trusts_exit_code() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("output");
        fs::create_dir_all(&output).unwrap();
        let apk = output.join("sample_recompiled.apk");
        fs::write(&apk, b"apk").unwrap();

        let runner = Scripted::new(0, None);
        let chain = toolchain(dir.path(), runner.clone());
        let signed = chain.sign(&apk, &mut |_, _: &str| {}).await.unwrap();
        assert_eq!(signed, output.join("sample_recompiled_signed.apk"));

        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen[0].args[2..], ["--apks".to_string(), path_arg(&apk), "--out".to_string(), path_arg(&output)]);
        assert_eq!(seen[0].working_dir.as_deref(), Some(output.as_path()));
    }

    #[tokio::test]
    async fn failing_exit_code_is_reported() {
        let dir = tempdir().unwrap();
        let apk = dir.path().join("broken.apk");
        fs::write(&apk, b"apk").unwrap();
        let chain = toolchain(dir.path(), Scripted::new(1, None));
        let error = chain.unpack(&apk, &mut |_, _: &str| {}).await.unwrap_err();
        assert!(matches!(error, StepError::ExitFailure { code: 1 }));
    }
}
