use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use apkflow_api::{ToolProvisioner, ToolSource};
use apkflow_engine::{ApkToolchain, Halt, PipelineOrchestrator, ProcessRunner};
use apkflow_types::{OutputStream, PipelineEvent, StepId, StepStatus, ToolId};
use apkflow_util::config::CONFIG_FILE_NAME;
use apkflow_util::{AppConfig, LogSink, expand_tilde};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{Level, debug};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let matches = build_cli().get_matches();
    let config = load_config(&matches)?;
    debug!(base = %config.base_dir.display(), "configuration loaded");
    let log = Arc::new(LogSink::new(config.log_file_path()));

    match matches.subcommand() {
        Some(("run", sub)) => run_pipeline(&config, log, sub).await,
        Some(("tools", _)) => run_tools(&config, log).await,
        Some(("decompile", sub)) => run_decompile(&config, log, sub).await,
        Some(("rebuild", sub)) => run_rebuild(&config, log, sub).await,
        Some(("sign", sub)) => run_sign(&config, log, sub).await,
        Some(("projects", _)) => run_projects(&config, log),
        Some(("paths", _)) => run_paths(&config, &log),
        Some(("logs", sub)) => run_logs(&log, sub),
        _ => {
            build_cli().print_help()?;
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_cli() -> Command {
    let apk_arg = |help: &'static str| {
        Arg::new("apk")
            .value_name("APK")
            .required(true)
            .value_parser(value_parser!(PathBuf))
            .help(help)
    };

    Command::new("apkflow")
        .about("Decompile, edit, rebuild and sign Android packages")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("home")
                .long("home")
                .global(true)
                .action(ArgAction::Set)
                .help("Base directory for tools, workspace, output and logs"),
        )
        .arg(
            Arg::new("java")
                .long("java")
                .global(true)
                .action(ArgAction::Set)
                .help("Java executable used to run the tools"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .global(true)
                .value_parser(value_parser!(u64))
                .help("Kill a tool after this many seconds (0 waits forever)"),
        )
        .arg(
            Arg::new("no-sign")
                .long("no-sign")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Skip signing; the rebuilt APK is the final output"),
        )
        .subcommand(
            Command::new("run")
                .about("Run the full pipeline on an APK")
                .arg(apk_arg("APK to decompile"))
                .arg(
                    Arg::new("no-edit-pause")
                        .long("no-edit-pause")
                        .action(ArgAction::SetTrue)
                        .help("Rebuild immediately instead of waiting for edits"),
                ),
        )
        .subcommand(Command::new("tools").about("Check Java and download missing tools"))
        .subcommand(Command::new("decompile").about("Decompile an APK into the workspace").arg(apk_arg("APK to decompile")))
        .subcommand(
            Command::new("rebuild")
                .about("Rebuild a decompiled project")
                .arg(Arg::new("project").value_name("PROJECT").help("Project name (defaults to the first listed)")),
        )
        .subcommand(Command::new("sign").about("Sign an APK").arg(apk_arg("APK to sign")))
        .subcommand(Command::new("projects").about("List decompiled projects"))
        .subcommand(Command::new("paths").about("Show the directories apkflow uses"))
        .subcommand(
            Command::new("logs").about("Show or clear the log file").arg(
                Arg::new("clear")
                    .long("clear")
                    .action(ArgAction::SetTrue)
                    .help("Delete the log file"),
            ),
        )
}

fn load_config(matches: &ArgMatches) -> Result<AppConfig> {
    let mut config = match matches.get_one::<String>("home") {
        Some(home) => {
            let base = expand_tilde(home);
            let file = base.join(CONFIG_FILE_NAME);
            AppConfig::load_from(base, &file)
        }
        None => AppConfig::load(),
    }
    .context("failed to load configuration")?;

    if let Some(java) = matches.get_one::<String>("java") {
        config.java_executable = java.clone();
    }
    if let Some(timeout) = matches.get_one::<u64>("timeout") {
        config.process_timeout_secs = Some(*timeout);
    }
    if matches.get_flag("no-sign") {
        config.sign_output = false;
    }
    Ok(config)
}

fn build_toolchain(config: &AppConfig, log: Arc<LogSink>) -> ApkToolchain {
    ApkToolchain::from_config(config, Arc::new(ProcessRunner::new()), log)
}

fn build_provisioner(config: &AppConfig, log: Arc<LogSink>) -> Result<ToolProvisioner> {
    ToolProvisioner::from_config(config, log).context("failed to create the release client")
}

async fn run_pipeline(config: &AppConfig, log: Arc<LogSink>, sub: &ArgMatches) -> Result<()> {
    let apk = sub.get_one::<PathBuf>("apk").context("missing APK argument")?.clone();
    let pause = !sub.get_flag("no-edit-pause");

    let tools: Arc<dyn ToolSource> = Arc::new(build_provisioner(config, log.clone())?);
    let pipeline = PipelineOrchestrator::from_config(config, build_toolchain(config, log), tools);
    let printer = tokio::spawn(render_events(pipeline.subscribe(), pause));

    let outcome = drive_pipeline(&pipeline, apk, pause).await;
    drop(pipeline);
    let _ = printer.await;
    outcome
}

async fn drive_pipeline(pipeline: &PipelineOrchestrator, apk: PathBuf, pause: bool) -> Result<()> {
    let halt = pipeline.start().await?;
    if halt != Halt::AwaitingInput {
        return report(halt);
    }

    let halt = pipeline.select_input(&apk).await?;
    if !matches!(halt, Halt::AwaitingEdit { .. }) {
        return report(halt);
    }
    if pause {
        wait_for_enter().await?;
    }

    report(pipeline.finish_editing().await?)
}

fn report(halt: Halt) -> Result<()> {
    match halt {
        Halt::Completed { artifact } => {
            println!("Output: {}", artifact.display());
            Ok(())
        }
        Halt::Failed { step, message } => bail!("{step} failed: {message}"),
        Halt::AwaitingInput | Halt::AwaitingEdit { .. } => Ok(()),
    }
}

async fn wait_for_enter() -> Result<()> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| ())
    })
    .await
    .context("stdin reader stopped")?
    .context("failed to read from stdin")
}

/// Prints one line per step status change plus the tools' own output.
async fn render_events(mut events: UnboundedReceiver<PipelineEvent>, pause: bool) {
    let mut seen: HashMap<StepId, StepStatus> = HashMap::new();
    while let Some(event) = events.recv().await {
        match event {
            PipelineEvent::StepChanged { step, .. } => {
                if seen.insert(step.id(), step.status()) != Some(step.status()) {
                    println!(
                        "[{:>3}%] {:<14} {:<11} {}",
                        step.progress(),
                        step.title(),
                        step.status(),
                        step.message()
                    );
                }
            }
            PipelineEvent::ToolOutput { line, .. } => println!("       {line}"),
            PipelineEvent::AwaitingEdit { project_dir } if pause => {
                println!("Edit the files under {}", project_dir.display());
                print!("Press Enter to rebuild and sign... ");
                let _ = std::io::stdout().flush();
            }
            _ => {}
        }
    }
}

fn print_tool_line(stream: OutputStream, line: &str) {
    match stream {
        OutputStream::Stdout => println!("  {line}"),
        OutputStream::Stderr => eprintln!("  {line}"),
    }
}

/// Makes sure both jars exist, downloading what is missing.
async fn provision(provisioner: &ToolProvisioner) -> Result<()> {
    for tool in ToolId::ALL {
        let descriptor = provisioner.ensure(tool).await;
        if descriptor.is_present_locally {
            println!("{tool}: installed at {}", descriptor.local_path.display());
            continue;
        }

        println!("{tool}: downloading {}", descriptor.resolved_version);
        let mut on_progress = |percent: u8| {
            print!("\r  {percent:>3}%");
            let _ = std::io::stdout().flush();
        };
        if !provisioner.download(&descriptor, &mut on_progress).await {
            println!();
            bail!("failed to download {tool} from {}", descriptor.download_url);
        }
        println!("\r{tool}: saved to {}", descriptor.local_path.display());
    }
    Ok(())
}

async fn run_tools(config: &AppConfig, log: Arc<LogSink>) -> Result<()> {
    let toolchain = build_toolchain(config, log.clone());
    match toolchain.check_java().await {
        Ok(version) => println!("Java: {version}"),
        Err(error) => bail!("{error}. Install a Java runtime and try again"),
    }
    provision(&build_provisioner(config, log)?).await
}

async fn run_decompile(config: &AppConfig, log: Arc<LogSink>, sub: &ArgMatches) -> Result<()> {
    let apk = sub.get_one::<PathBuf>("apk").context("missing APK argument")?;
    if !apk.is_file() {
        bail!("{} does not exist", apk.display());
    }
    provision(&build_provisioner(config, log.clone())?).await?;

    let project_dir = build_toolchain(config, log)
        .unpack(apk, &mut print_tool_line)
        .await
        .context("decompilation failed")?;
    println!("Decompiled to {}", project_dir.display());
    Ok(())
}

async fn run_rebuild(config: &AppConfig, log: Arc<LogSink>, sub: &ArgMatches) -> Result<()> {
    let toolchain = build_toolchain(config, log.clone());
    let project = match sub.get_one::<String>("project") {
        Some(project) => project.clone(),
        None => {
            let mut projects = toolchain.workspace().list_completed_projects();
            projects.sort();
            projects.into_iter().next().context("no decompiled projects in the workspace")?
        }
    };
    provision(&build_provisioner(config, log)?).await?;

    let apk = toolchain
        .repack(&project, &mut print_tool_line)
        .await
        .with_context(|| format!("rebuilding '{project}' failed"))?;
    println!("Rebuilt {}", apk.display());
    Ok(())
}

async fn run_sign(config: &AppConfig, log: Arc<LogSink>, sub: &ArgMatches) -> Result<()> {
    let apk = sub.get_one::<PathBuf>("apk").context("missing APK argument")?;
    provision(&build_provisioner(config, log.clone())?).await?;

    let signed = build_toolchain(config, log)
        .sign(apk, &mut print_tool_line)
        .await
        .context("signing failed")?;
    println!("Signed {}", signed.display());
    Ok(())
}

fn run_projects(config: &AppConfig, log: Arc<LogSink>) -> Result<()> {
    let mut projects = build_toolchain(config, log).workspace().list_completed_projects();
    if projects.is_empty() {
        println!("No decompiled projects");
        return Ok(());
    }
    projects.sort();
    for project in projects {
        println!("{project}");
    }
    Ok(())
}

fn run_paths(config: &AppConfig, log: &LogSink) -> Result<()> {
    println!("base:      {}", config.base_dir.display());
    println!("tools:     {}", config.tools_dir().display());
    println!("workspace: {}", config.workspace_dir().display());
    println!("output:    {}", config.output_dir().display());
    if let Some(path) = log.path() {
        println!("log:       {}", path.display());
    }
    Ok(())
}

fn run_logs(log: &LogSink, sub: &ArgMatches) -> Result<()> {
    let path = log.path().context("logging is disabled")?;
    if sub.get_flag("clear") {
        log.clear();
        println!("Cleared {}", path.display());
    } else if path.exists() {
        println!("{}", path.display());
    } else {
        println!("No log file yet ({})", path.display());
    }
    Ok(())
}
