//! Release lookup and tool download for apkflow.
//!
//! This crate resolves the two Java tools the pipeline depends on (apktool and
//! uber-apk-signer). It focuses on:
//!
//! - Querying the GitHub release API for the newest published jar
//! - Falling back to pinned versions when the API is unreachable
//! - Streaming jar downloads to disk with percentage callbacks
//! - Validating the release API base URL for safety
//!
//! The primary entry point is [`ToolProvisioner`], usually consumed through
//! the [`ToolSource`] trait.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use apkflow_api::{ToolProvisioner, ToolSource};
//! use apkflow_types::ToolId;
//! use apkflow_util::{AppConfig, LogSink};
//!
//! async fn fetch() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let log = Arc::new(LogSink::new(config.log_file_path()));
//!     let provisioner = ToolProvisioner::from_config(&config, log)?;
//!     let descriptor = provisioner.ensure(ToolId::ApkTool).await;
//!     if !descriptor.is_present_locally {
//!         provisioner.download(&descriptor, &mut |percent| println!("{percent}%")).await;
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod provisioner;
pub mod release;

pub use client::ReleaseClient;
pub use error::ProvisionError;
pub use provisioner::{ToolProvisioner, ToolSource};
pub use release::{GitHubAsset, GitHubRelease};
