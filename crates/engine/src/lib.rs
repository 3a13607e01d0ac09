//! # apkflow engine
//!
//! Drives the decompile → edit → rebuild → sign pipeline by shelling out to
//! apktool and uber-apk-signer.
//!
//! ## Architecture
//!
//! - **`runner`**: spawns external processes and streams their output lines
//! - **`java`**: detects the Java runtime the tools need
//! - **`workspace`**: maps projects and artifacts onto the on-disk layout
//! - **`toolchain`**: builds and runs the apktool / signer command lines
//! - **`orchestrator`**: owns the step state machine and publishes events
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use apkflow_api::ToolProvisioner;
//! use apkflow_engine::{ApkToolchain, Halt, PipelineOrchestrator, ProcessRunner};
//! use apkflow_util::{AppConfig, LogSink};
//!
//! async fn run(apk: &std::path::Path) -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let log = Arc::new(LogSink::new(config.log_file_path()));
//!     let tools = Arc::new(ToolProvisioner::from_config(&config, log.clone())?);
//!     let toolchain = ApkToolchain::from_config(&config, Arc::new(ProcessRunner::new()), log);
//!     let pipeline = PipelineOrchestrator::from_config(&config, toolchain, tools);
//!
//!     pipeline.start().await?;
//!     pipeline.select_input(apk).await?;
//!     if let Halt::Completed { artifact } = pipeline.finish_editing().await? {
//!         println!("{}", artifact.display());
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod java;
pub mod orchestrator;
pub mod runner;
pub mod toolchain;
pub mod workspace;

pub use error::{PipelineError, StepError};
pub use java::{parse_java_version, probe_java};
pub use orchestrator::{Halt, PipelineOrchestrator, RunContext};
pub use runner::{ExitOutcome, LineSink, ProcessRunner, ToolInvocation, ToolRunner};
pub use toolchain::ApkToolchain;
pub use workspace::{WorkspaceManager, project_name_for, signed_apk_path};
