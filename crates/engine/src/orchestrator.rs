//! Sequential pipeline driver.
//!
//! [`PipelineOrchestrator`] owns the eight [`PipelineStep`]s and the run
//! context. Automatic steps chain on success; user-gated steps
//! (`InputSelection`, `ManualEdit`) stop the chain until the matching trigger
//! is called. Any failure halts the run until [`PipelineOrchestrator::retry`].
//!
//! State lives behind a synchronous mutex that is never held across an
//! `.await`, so readers always see a consistent snapshot while a step runs.
//! Every mutation is published to subscribers as a [`PipelineEvent`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use apkflow_api::ToolSource;
use apkflow_types::{
    IN_FLIGHT_PROGRESS_CEILING, OutputStream, PipelineEvent, PipelineStep, StepId, StepKind, StepStatus, ToolId,
};
use apkflow_util::AppConfig;
use chrono::Utc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, StepError};
use crate::toolchain::ApkToolchain;
use crate::workspace::project_name_for;

/// Progress added per output line while decompiling or rebuilding.
const PACKAGE_LINE_INCREMENT: u8 = 5;
/// Progress added per output line while signing.
const SIGN_LINE_INCREMENT: u8 = 10;
/// Share of the provisioning step given to each tool download.
const TOOL_PROGRESS_SPAN: u8 = 50;

const READY_MESSAGE: &str = "Ready";

/// Facts gathered while a run advances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunContext {
    /// Absolute path of the chosen APK. Fixed once input selection completes.
    pub selected_input: Option<PathBuf>,
    /// File stem of the input; names the workspace project.
    pub project_name: Option<String>,
    pub project_dir: Option<PathBuf>,
    pub recompiled_apk: Option<PathBuf>,
    pub signed_apk: Option<PathBuf>,
    /// Final package of a finished run.
    pub artifact: Option<PathBuf>,
}

/// Where a trigger left the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Halt {
    AwaitingInput,
    AwaitingEdit { project_dir: PathBuf },
    Failed { step: StepId, message: String },
    Completed { artifact: PathBuf },
}

enum StepOutcome {
    Completed(String),
    Skipped(String),
}

struct PipelineState {
    steps: Vec<PipelineStep>,
    current: StepId,
    busy: bool,
    status_message: String,
    context: RunContext,
    subscribers: Vec<UnboundedSender<PipelineEvent>>,
}

impl PipelineState {
    fn new() -> Self {
        Self {
            steps: StepId::ALL.iter().copied().map(PipelineStep::new).collect(),
            current: StepId::ToolCheck,
            busy: false,
            status_message: READY_MESSAGE.to_string(),
            context: RunContext::default(),
            subscribers: Vec::new(),
        }
    }

    fn step(&self, id: StepId) -> &PipelineStep {
        &self.steps[id.index()]
    }

    fn step_mut(&mut self, id: StepId) -> &mut PipelineStep {
        &mut self.steps[id.index()]
    }

    fn publish(&mut self, event: PipelineEvent) {
        self.subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn publish_step(&mut self, id: StepId) {
        let step = self.step(id).clone();
        self.publish(PipelineEvent::StepChanged { step, at: Utc::now() });
    }
}

/// Clears the busy flag when a trigger finishes, however it exits.
struct BusyGuard<'a> {
    state: &'a Mutex<PipelineState>,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).busy = false;
    }
}

/// Runs the decompile, edit, rebuild and sign pipeline one step at a time.
pub struct PipelineOrchestrator {
    state: Mutex<PipelineState>,
    toolchain: ApkToolchain,
    tools: Arc<dyn ToolSource>,
    sign_output: bool,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("toolchain", &self.toolchain)
            .field("sign_output", &self.sign_output)
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    pub fn new(toolchain: ApkToolchain, tools: Arc<dyn ToolSource>) -> Self {
        Self {
            state: Mutex::new(PipelineState::new()),
            toolchain,
            tools,
            sign_output: true,
        }
    }

    pub fn from_config(config: &AppConfig, toolchain: ApkToolchain, tools: Arc<dyn ToolSource>) -> Self {
        Self::new(toolchain, tools).with_signing(config.sign_output)
    }

    /// When disabled, `Sign` is skipped and the rebuilt APK is the final artifact.
    pub fn with_signing(mut self, enabled: bool) -> Self {
        self.sign_output = enabled;
        self
    }

    // ----- observation -----

    /// Registers a new event stream. Dropped receivers are pruned on the next publish.
    pub fn subscribe(&self) -> UnboundedReceiver<PipelineEvent> {
        let (sender, receiver) = unbounded_channel();
        self.lock().subscribers.push(sender);
        receiver
    }

    pub fn steps(&self) -> Vec<PipelineStep> {
        self.lock().steps.clone()
    }

    pub fn step(&self, id: StepId) -> PipelineStep {
        self.lock().step(id).clone()
    }

    pub fn current_step(&self) -> StepId {
        self.lock().current
    }

    pub fn is_busy(&self) -> bool {
        self.lock().busy
    }

    pub fn status_message(&self) -> String {
        self.lock().status_message.clone()
    }

    pub fn run_context(&self) -> RunContext {
        self.lock().context.clone()
    }

    // ----- triggers -----

    /// Checks Java, provisions the tools and stops at input selection.
    pub async fn start(&self) -> Result<Halt, PipelineError> {
        let _busy = self.acquire("start", |state| {
            state.steps.iter().all(|step| step.status() == StepStatus::Pending)
        })?;
        info!("pipeline started");
        self.toolchain.log().info("Pipeline started");
        Ok(self.run_chain(StepId::ToolCheck).await)
    }

    /// Records the input APK and decompiles it, stopping at the edit phase.
    pub async fn select_input(&self, path: impl AsRef<Path>) -> Result<Halt, PipelineError> {
        let path = path.as_ref();
        let missing = || PipelineError::InputMissing { path: path.to_path_buf() };
        if !path.is_file() {
            return Err(missing());
        }
        let input = std::path::absolute(path).map_err(|_| missing())?;

        let _busy = self.acquire("select an input", |state| awaiting(state, StepId::InputSelection))?;
        let file_name = input
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        {
            let mut state = self.lock();
            state
                .step_mut(StepId::InputSelection)
                .complete(format!("Selected APK file: {file_name}"))?;
            state.context.project_name = Some(project_name_for(&input));
            state.context.selected_input = Some(input);
            state.status_message = format!("APK selected: {file_name}");
            state.publish_step(StepId::InputSelection);
        }
        info!(input = %file_name, "input selected");
        Ok(self.run_chain(StepId::Unpack).await)
    }

    /// Ends the edit phase and runs rebuild, sign and completion.
    pub async fn finish_editing(&self) -> Result<Halt, PipelineError> {
        let _busy = self.acquire("finish editing", |state| awaiting(state, StepId::ManualEdit))?;
        {
            let mut state = self.lock();
            state.step_mut(StepId::ManualEdit).complete("Editing completed")?;
            state.publish_step(StepId::ManualEdit);
        }
        Ok(self.run_chain(StepId::Repack).await)
    }

    /// Re-runs the failed step with a fresh attempt and continues the chain.
    pub async fn retry(&self) -> Result<Halt, PipelineError> {
        let _busy = self.acquire("retry", |state| state.step(state.current).status() == StepStatus::Failed)?;
        let id = {
            let mut state = self.lock();
            let id = state.current;
            state.step_mut(id).reset();
            state.publish_step(id);
            id
        };
        info!(step = %id, "retrying step");
        self.toolchain.log().info(format!("Retrying step: {id}"));
        Ok(self.run_chain(id).await)
    }

    /// Returns every step to `Pending` and forgets the run context.
    pub fn reset(&self) -> Result<(), PipelineError> {
        let mut state = self.lock();
        if state.busy {
            return Err(PipelineError::Busy);
        }
        for step in &mut state.steps {
            step.reset();
        }
        state.current = StepId::ToolCheck;
        state.context = RunContext::default();
        state.status_message = READY_MESSAGE.to_string();
        for id in StepId::ALL {
            state.publish_step(id);
        }
        debug!("pipeline reset");
        Ok(())
    }

    // ----- chaining -----

    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(
        &self,
        action: &'static str,
        ready: impl FnOnce(&PipelineState) -> bool,
    ) -> Result<BusyGuard<'_>, PipelineError> {
        let mut state = self.lock();
        if state.busy {
            return Err(PipelineError::Busy);
        }
        if !ready(&state) {
            return Err(PipelineError::NotReady {
                action,
                current: state.current,
            });
        }
        state.busy = true;
        Ok(BusyGuard { state: &self.state })
    }

    async fn run_chain(&self, from: StepId) -> Halt {
        let mut id = from;
        loop {
            if id.kind() == StepKind::UserGated {
                return self.open_gate(id);
            }
            if let Err(halt) = self.execute(id).await {
                return halt;
            }
            match id.next() {
                Some(next) => id = next,
                None => return self.finish_run(),
            }
        }
    }

    fn open_gate(&self, id: StepId) -> Halt {
        let mut state = self.lock();
        let (step_message, status_message, halt) = match id {
            StepId::ManualEdit => {
                let project_dir = state.context.project_dir.clone().unwrap_or_default();
                (
                    format!("Ready for editing: {}", project_dir.display()),
                    "APK decompiled successfully".to_string(),
                    Halt::AwaitingEdit { project_dir },
                )
            }
            _ => (
                "Ready to select APK file".to_string(),
                "All tools are ready".to_string(),
                Halt::AwaitingInput,
            ),
        };

        state.current = id;
        let step = state.step_mut(id);
        if step.begin(step_message.clone()).is_err() {
            step.set_message(step_message);
        }
        state.status_message = status_message;
        state.publish_step(id);
        let event = match &halt {
            Halt::AwaitingEdit { project_dir } => PipelineEvent::AwaitingEdit {
                project_dir: project_dir.clone(),
            },
            _ => PipelineEvent::AwaitingInput,
        };
        state.publish(event);
        debug!(step = %id, "waiting for user");
        halt
    }

    async fn execute(&self, id: StepId) -> Result<(), Halt> {
        {
            let mut state = self.lock();
            state.current = id;
            let message = starting_message(id);
            if let Err(error) = state.step_mut(id).begin(message) {
                drop(state);
                return Err(self.halt(id, error.to_string()));
            }
            state.status_message = message.to_string();
            state.publish_step(id);
        }
        info!(step = %id, "step started");

        let result = match id {
            StepId::ToolCheck => self.check_java().await,
            StepId::ToolProvision => self.provision_tools().await,
            StepId::Unpack => self.unpack().await,
            StepId::Repack => self.repack().await,
            StepId::Sign => self.sign().await,
            StepId::Done => self.done(),
            StepId::InputSelection | StepId::ManualEdit => Ok(StepOutcome::Completed(String::new())),
        };

        let mut state = self.lock();
        let outcome = match result {
            Ok(StepOutcome::Completed(message)) => state.step_mut(id).complete(message.clone()).map(|_| message),
            Ok(StepOutcome::Skipped(message)) => state.step_mut(id).skip(message.clone()).map(|_| message),
            Err(error) => {
                drop(state);
                return Err(self.halt(id, error.to_string()));
            }
        };
        match outcome {
            Ok(message) => {
                state.status_message = message;
                state.publish_step(id);
                info!(step = %id, status = %state.step(id).status(), "step finished");
                Ok(())
            }
            Err(error) => {
                drop(state);
                Err(self.halt(id, error.to_string()))
            }
        }
    }

    fn halt(&self, id: StepId, message: String) -> Halt {
        warn!(step = %id, error = %message, "step failed");
        self.toolchain.log().error(format!("{id} failed: {message}"));

        let mut state = self.lock();
        let step = state.step_mut(id);
        if step.fail(message.clone()).is_err() {
            step.set_message(message.clone());
        }
        state.status_message = format!("{id} failed: {message}");
        state.publish_step(id);
        state.publish(PipelineEvent::Halted {
            step: id,
            message: message.clone(),
        });
        Halt::Failed { step: id, message }
    }

    fn finish_run(&self) -> Halt {
        let mut state = self.lock();
        let artifact = state.context.artifact.clone().unwrap_or_default();
        state.status_message = "APK processing completed".to_string();
        state.publish(PipelineEvent::Completed {
            artifact: artifact.clone(),
        });
        drop(state);

        info!(artifact = %artifact.display(), "pipeline completed");
        self.toolchain
            .log()
            .info(format!("Pipeline completed: {}", artifact.display()));
        Halt::Completed { artifact }
    }

    // ----- step bodies -----

    async fn check_java(&self) -> Result<StepOutcome, StepError> {
        let version = self.toolchain.check_java().await?;
        Ok(StepOutcome::Completed(format!("Java found: {version}")))
    }

    async fn provision_tools(&self) -> Result<StepOutcome, StepError> {
        for (index, tool) in ToolId::ALL.into_iter().enumerate() {
            let base = TOOL_PROGRESS_SPAN.saturating_mul(index as u8);
            self.set_step_message(StepId::ToolProvision, format!("Checking {tool}..."));

            let descriptor = self.tools.ensure(tool).await;
            if !descriptor.is_present_locally {
                self.set_step_message(
                    StepId::ToolProvision,
                    format!("Downloading {tool} {}...", descriptor.resolved_version),
                );
                let mut on_progress = |percent: u8| {
                    let mapped = base.saturating_add(percent.min(100) / 2);
                    self.raise_progress(StepId::ToolProvision, mapped);
                };
                if !self.tools.download(&descriptor, &mut on_progress).await {
                    return Err(StepError::Network(format!(
                        "failed to download {tool} from {}",
                        descriptor.download_url
                    )));
                }
            }
            self.raise_progress(StepId::ToolProvision, base.saturating_add(TOOL_PROGRESS_SPAN));
        }
        Ok(StepOutcome::Completed("All tools are ready".to_string()))
    }

    async fn unpack(&self) -> Result<StepOutcome, StepError> {
        let input = self
            .lock()
            .context
            .selected_input
            .clone()
            .ok_or(StepError::InputNotSelected)?;
        let mut sink = |stream: OutputStream, line: &str| {
            self.record_line(StepId::Unpack, PACKAGE_LINE_INCREMENT, stream, line);
        };
        let project_dir = self.toolchain.unpack(&input, &mut sink).await?;
        self.lock().context.project_dir = Some(project_dir);
        Ok(StepOutcome::Completed("Decompilation completed".to_string()))
    }

    async fn repack(&self) -> Result<StepOutcome, StepError> {
        // Set by `select_input`; the ManualEdit gate only opens after Unpack.
        let project = self
            .lock()
            .context
            .project_name
            .clone()
            .ok_or(StepError::ProjectMissing)?;

        let mut sink = |stream: OutputStream, line: &str| {
            self.record_line(StepId::Repack, PACKAGE_LINE_INCREMENT, stream, line);
        };
        let apk = self.toolchain.repack(&project, &mut sink).await?;
        self.lock().context.recompiled_apk = Some(apk);
        Ok(StepOutcome::Completed("Recompilation completed".to_string()))
    }

    async fn sign(&self) -> Result<StepOutcome, StepError> {
        if !self.sign_output {
            return Ok(StepOutcome::Skipped("Signing disabled; keeping the unsigned APK".to_string()));
        }

        let apk = self
            .lock()
            .context
            .recompiled_apk
            .clone()
            .ok_or(StepError::ProjectMissing)?;

        let mut sink = |stream: OutputStream, line: &str| {
            self.record_line(StepId::Sign, SIGN_LINE_INCREMENT, stream, line);
        };
        let signed = self.toolchain.sign(&apk, &mut sink).await?;
        self.lock().context.signed_apk = Some(signed);
        Ok(StepOutcome::Completed("APK signed successfully".to_string()))
    }

    fn done(&self) -> Result<StepOutcome, StepError> {
        let mut state = self.lock();
        let artifact = state
            .context
            .signed_apk
            .clone()
            .or_else(|| state.context.recompiled_apk.clone())
            .ok_or(StepError::ProjectMissing)?;
        state.context.artifact = Some(artifact);
        Ok(StepOutcome::Completed("Process completed successfully".to_string()))
    }

    // ----- progress plumbing -----

    fn record_line(&self, id: StepId, increment: u8, stream: OutputStream, line: &str) {
        let mut state = self.lock();
        let step = state.step_mut(id);
        step.bump_progress(increment, IN_FLIGHT_PROGRESS_CEILING);
        step.set_message(line);
        state.status_message = line.to_string();
        state.publish_step(id);
        state.publish(PipelineEvent::ToolOutput {
            step: id,
            stream,
            line: line.to_string(),
        });
    }

    fn raise_progress(&self, id: StepId, value: u8) {
        let mut state = self.lock();
        let step = state.step_mut(id);
        let capped = value.min(IN_FLIGHT_PROGRESS_CEILING);
        if capped <= step.progress() {
            return;
        }
        step.set_progress(i64::from(capped));
        state.publish_step(id);
    }

    fn set_step_message(&self, id: StepId, message: String) {
        let mut state = self.lock();
        state.step_mut(id).set_message(message.clone());
        state.status_message = message;
        state.publish_step(id);
    }
}

/// True when `id` is the current step and waits for its trigger.
fn awaiting(state: &PipelineState, id: StepId) -> bool {
    state.current == id && state.step(id).status() == StepStatus::InProgress
}

fn starting_message(id: StepId) -> &'static str {
    match id {
        StepId::ToolCheck => "Checking Java installation...",
        StepId::ToolProvision => "Checking tools...",
        StepId::InputSelection => "Waiting for APK selection",
        StepId::Unpack => "Decompiling APK...",
        StepId::ManualEdit => "Waiting for edits",
        StepId::Repack => "Recompiling APK...",
        StepId::Sign => "Signing APK...",
        StepId::Done => "Finishing...",
    }
}
