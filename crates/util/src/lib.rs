//! Configuration and logging helpers shared by the apkflow crates.

pub mod config;
pub mod log_sink;

pub use config::{AppConfig, ConfigError, expand_tilde};
pub use log_sink::{LogLevel, LogSink};
