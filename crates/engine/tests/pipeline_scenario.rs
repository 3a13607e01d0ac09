use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use apkflow_api::ToolSource;
use apkflow_engine::{
    ApkToolchain, ExitOutcome, Halt, LineSink, PipelineOrchestrator, StepError, ToolInvocation, ToolRunner,
    WorkspaceManager,
};
use apkflow_types::{OutputStream, PipelineEvent, StepId, StepStatus, ToolDescriptor, ToolId};
use apkflow_util::LogSink;
use async_trait::async_trait;
use tempfile::TempDir;

/// Stands in for `java`: answers the version probe and mimics apktool and the signer.
#[derive(Default)]
struct ScriptedJava {
    /// Pending forced exit codes keyed by tool verb (`d`, `b`, `--apks`).
    failures: Mutex<Vec<(&'static str, i32)>>,
    /// When set, `b` exits 0 without writing the APK.
    skip_build_output: bool,
    /// Tool verb whose launch fails as if the executable vanished.
    unlaunchable: Option<&'static str>,
    calls: Mutex<Vec<ToolInvocation>>,
}

impl ScriptedJava {
    fn failing(verb: &'static str, code: i32) -> Self {
        Self {
            failures: Mutex::new(vec![(verb, code)]),
            ..Self::default()
        }
    }

    fn verbs(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|call| call.args.get(2).cloned().unwrap_or_else(|| call.args[0].clone()))
            .collect()
    }
}

#[async_trait]
impl ToolRunner for ScriptedJava {
    async fn run(&self, invocation: &ToolInvocation, sink: LineSink<'_>) -> Result<ExitOutcome, StepError> {
        self.calls.lock().unwrap().push(invocation.clone());
        let args = &invocation.args;
        if args.first().map(String::as_str) == Some("-version") {
            sink(OutputStream::Stderr, r#"openjdk version "17.0.9" 2023-10-17"#);
            return Ok(ExitOutcome::from_code(0));
        }

        let verb = args.get(2).map(String::as_str).unwrap_or_default();
        if self.unlaunchable == Some(verb) {
            return Err(StepError::Launch {
                program: invocation.executable.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
            });
        }
        let forced = {
            let mut failures = self.failures.lock().unwrap();
            failures
                .iter()
                .position(|(failing, _)| *failing == verb)
                .map(|index| failures.remove(index).1)
        };
        if let Some(code) = forced {
            sink(OutputStream::Stderr, "E: scripted failure");
            return Ok(ExitOutcome::from_code(code));
        }

        let output = args.iter().position(|arg| arg == "-o").map(|at| PathBuf::from(&args[at + 1]));
        match (verb, output) {
            ("d", Some(dir)) => {
                sink(OutputStream::Stdout, "I: Baksmaling classes.dex...");
                fs::create_dir_all(dir.join("smali")).unwrap();
                fs::write(dir.join("AndroidManifest.xml"), "<manifest/>").unwrap();
            }
            ("b", Some(apk)) => {
                sink(OutputStream::Stdout, "I: Building apk file...");
                if !self.skip_build_output {
                    fs::write(apk, b"PK").unwrap();
                }
            }
            _ => sink(OutputStream::Stderr, "signing with debug keystore"),
        }
        Ok(ExitOutcome::from_code(0))
    }
}

/// Both tools already installed.
struct InstalledTools;

#[async_trait]
impl ToolSource for InstalledTools {
    async fn ensure(&self, tool: ToolId) -> ToolDescriptor {
        let mut descriptor = ToolDescriptor::fallback(tool, PathBuf::from(tool.jar_file_name()));
        descriptor.is_present_locally = true;
        descriptor
    }

    async fn download(&self, _: &ToolDescriptor, _: &mut (dyn FnMut(u8) + Send)) -> bool {
        true
    }
}

struct Fixture {
    home: TempDir,
    runner: Arc<ScriptedJava>,
    pipeline: PipelineOrchestrator,
}

impl Fixture {
    fn new(runner: ScriptedJava) -> Self {
        let home = tempfile::tempdir().expect("temp home");
        let runner = Arc::new(runner);
        let log = Arc::new(LogSink::new(home.path().join("logs").join("app.log")));
        let toolchain = ApkToolchain::new(runner.clone(), WorkspaceManager::new(home.path()), "java", None, log);
        let pipeline = PipelineOrchestrator::new(toolchain, Arc::new(InstalledTools));
        Self { home, runner, pipeline }
    }

    fn base(&self) -> &Path {
        self.home.path()
    }

    fn sample_apk(&self) -> PathBuf {
        let downloads = self.base().join("downloads");
        fs::create_dir_all(&downloads).expect("downloads dir");
        let apk = downloads.join("sample.apk");
        fs::write(&apk, b"PK").expect("write sample.apk");
        apk
    }

    fn status(&self, id: StepId) -> StepStatus {
        self.pipeline.step(id).status()
    }
}

#[tokio::test]
async fn sample_apk_runs_end_to_end() {
    let fixture = Fixture::new(ScriptedJava::default());
    let mut events = fixture.pipeline.subscribe();
    let apk = fixture.sample_apk();

    assert_eq!(fixture.pipeline.start().await.expect("start"), Halt::AwaitingInput);
    assert_eq!(fixture.pipeline.current_step(), StepId::InputSelection);
    assert_eq!(fixture.status(StepId::ToolCheck), StepStatus::Completed);
    assert_eq!(fixture.status(StepId::ToolProvision), StepStatus::Completed);
    assert!(fixture.pipeline.step(StepId::ToolCheck).message().contains("17.0.9"));

    let project_dir = fixture.base().join("workspace").join("sample");
    assert_eq!(
        fixture.pipeline.select_input(&apk).await.expect("select input"),
        Halt::AwaitingEdit {
            project_dir: project_dir.clone()
        }
    );
    assert!(project_dir.join("smali").is_dir());
    assert_eq!(fixture.status(StepId::Unpack), StepStatus::Completed);
    assert_eq!(fixture.pipeline.step(StepId::Unpack).progress(), 100);
    assert_eq!(fixture.status(StepId::ManualEdit), StepStatus::InProgress);
    assert_eq!(fixture.pipeline.run_context().project_name.as_deref(), Some("sample"));

    let output = fixture.base().join("output");
    let halt = fixture.pipeline.finish_editing().await.expect("finish editing");
    assert_eq!(
        halt,
        Halt::Completed {
            artifact: output.join("sample_recompiled_signed.apk")
        }
    );
    assert!(output.join("sample_recompiled.apk").is_file());
    assert!(
        fixture
            .pipeline
            .steps()
            .iter()
            .all(|step| step.status() == StepStatus::Completed && step.progress() == 100)
    );
    assert_eq!(fixture.pipeline.current_step(), StepId::Done);
    assert!(!fixture.pipeline.is_busy());
    assert_eq!(fixture.runner.verbs(), vec!["-version", "d", "b", "--apks"]);

    let mut milestones = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            PipelineEvent::AwaitingInput => milestones.push("input"),
            PipelineEvent::AwaitingEdit { .. } => milestones.push("edit"),
            PipelineEvent::Completed { .. } => milestones.push("completed"),
            PipelineEvent::Halted { .. } => milestones.push("halted"),
            _ => {}
        }
    }
    assert_eq!(milestones, vec!["input", "edit", "completed"]);

    let log = fs::read_to_string(fixture.base().join("logs").join("app.log")).expect("log file");
    assert!(log.contains("[INFO] Decompiling APK:"));
    assert!(log.contains("[INFO] Successfully signed APK"));
}

#[tokio::test]
async fn failed_decompile_halts_and_retry_recovers() {
    let fixture = Fixture::new(ScriptedJava::failing("d", 1));
    let apk = fixture.sample_apk();
    fixture.pipeline.start().await.expect("start");

    let halt = fixture.pipeline.select_input(&apk).await.expect("select input");
    assert!(matches!(halt, Halt::Failed { step: StepId::Unpack, .. }), "halt: {halt:?}");
    assert_eq!(fixture.status(StepId::Unpack), StepStatus::Failed);
    assert_eq!(fixture.status(StepId::ManualEdit), StepStatus::Pending);
    assert_eq!(fixture.pipeline.current_step(), StepId::Unpack);
    assert!(!fixture.pipeline.is_busy());
    assert!(fixture.pipeline.status_message().contains("exited with code 1"));
    // The line printed before the failure still moved progress.
    assert_eq!(fixture.pipeline.step(StepId::Unpack).progress(), 5);

    let halt = fixture.pipeline.retry().await.expect("retry");
    assert!(matches!(halt, Halt::AwaitingEdit { .. }));
    assert_eq!(fixture.status(StepId::Unpack), StepStatus::Completed);
    assert_eq!(fixture.status(StepId::ManualEdit), StepStatus::InProgress);
}

#[tokio::test]
async fn launch_failure_halts_like_a_failed_exit() {
    let fixture = Fixture::new(ScriptedJava {
        unlaunchable: Some("d"),
        ..ScriptedJava::default()
    });
    let mut events = fixture.pipeline.subscribe();
    let apk = fixture.sample_apk();
    fixture.pipeline.start().await.expect("start");

    let halt = fixture.pipeline.select_input(&apk).await.expect("select input");
    assert!(matches!(halt, Halt::Failed { step: StepId::Unpack, .. }), "halt: {halt:?}");
    assert_eq!(fixture.status(StepId::Unpack), StepStatus::Failed);
    assert_eq!(fixture.status(StepId::ManualEdit), StepStatus::Pending);
    assert_eq!(fixture.pipeline.current_step(), StepId::Unpack);
    assert!(!fixture.pipeline.is_busy());
    assert!(fixture.pipeline.status_message().contains("failed to launch"));
    assert_eq!(fixture.runner.verbs(), vec!["-version", "d"]);

    let mut halted = false;
    while let Ok(event) = events.try_recv() {
        halted |= matches!(event, PipelineEvent::Halted { .. });
    }
    assert!(halted);
}

#[tokio::test]
async fn rebuild_without_artifact_fails() {
    let fixture = Fixture::new(ScriptedJava {
        skip_build_output: true,
        ..ScriptedJava::default()
    });
    let apk = fixture.sample_apk();
    fixture.pipeline.start().await.expect("start");
    fixture.pipeline.select_input(&apk).await.expect("select input");

    let halt = fixture.pipeline.finish_editing().await.expect("finish editing");
    assert!(matches!(halt, Halt::Failed { step: StepId::Repack, .. }), "halt: {halt:?}");
    assert_eq!(fixture.status(StepId::ManualEdit), StepStatus::Completed);
    assert_eq!(fixture.status(StepId::Repack), StepStatus::Failed);
    assert_eq!(fixture.status(StepId::Sign), StepStatus::Pending);
    assert!(fixture.pipeline.step(StepId::Repack).message().contains("was not produced"));
}

#[tokio::test]
async fn signing_failure_keeps_rebuilt_apk() {
    let fixture = Fixture::new(ScriptedJava::failing("--apks", 2));
    let apk = fixture.sample_apk();
    fixture.pipeline.start().await.expect("start");
    fixture.pipeline.select_input(&apk).await.expect("select input");

    let halt = fixture.pipeline.finish_editing().await.expect("finish editing");
    assert!(matches!(halt, Halt::Failed { step: StepId::Sign, .. }));
    assert_eq!(fixture.status(StepId::Repack), StepStatus::Completed);
    assert_eq!(fixture.status(StepId::Done), StepStatus::Pending);
    assert!(fixture.base().join("output").join("sample_recompiled.apk").is_file());

    let halt = fixture.pipeline.retry().await.expect("retry");
    assert!(matches!(halt, Halt::Completed { .. }));
    assert_eq!(fixture.status(StepId::Sign), StepStatus::Completed);
}

#[tokio::test]
async fn unpack_replaces_previous_project() {
    let fixture = Fixture::new(ScriptedJava::default());
    let project_dir = fixture.base().join("workspace").join("sample");
    fs::create_dir_all(project_dir.join("res")).expect("stale project");
    fs::write(project_dir.join("stale.txt"), "from an earlier run").expect("stale file");

    let apk = fixture.sample_apk();
    fixture.pipeline.start().await.expect("start");
    fixture.pipeline.select_input(&apk).await.expect("select input");

    assert!(!project_dir.join("stale.txt").exists());
    assert!(!project_dir.join("res").exists());
    assert!(project_dir.join("AndroidManifest.xml").is_file());
}

#[test]
fn empty_workspace_has_no_projects() {
    let home = tempfile::tempdir().expect("temp home");
    let workspace = WorkspaceManager::new(home.path());
    assert!(workspace.list_completed_projects().is_empty());
    workspace.workspace_dir().expect("create workspace");
    assert!(workspace.list_completed_projects().is_empty());
}
