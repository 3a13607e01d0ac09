//! Application configuration.
//!
//! Everything the pipeline needs to know about its environment lives in a
//! single [`AppConfig`] value that the binary builds once and hands to each
//! component. The base directory comes from `APKFLOW_HOME` when set, else the
//! platform data directory (`~/.local/share/apkflow` on Linux). An optional
//! `config.json` inside the base directory (or at `APKFLOW_CONFIG_PATH`)
//! overrides individual fields.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dirs_next::{data_dir, home_dir};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Environment variable overriding the base directory.
pub const HOME_ENV: &str = "APKFLOW_HOME";

/// Environment variable pointing at an explicit configuration file.
pub const CONFIG_PATH_ENV: &str = "APKFLOW_CONFIG_PATH";

/// Default configuration file name inside the base directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// GitHub REST API root used for release lookups.
pub const DEFAULT_RELEASE_API_BASE: &str = "https://api.github.com";

pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

const TOOLS_DIR_NAME: &str = "tools";
const WORKSPACE_DIR_NAME: &str = "workspace";
const OUTPUT_DIR_NAME: &str = "output";
const LOGS_DIR_NAME: &str = "logs";
const LOG_FILE_NAME: &str = "app.log";

/// Error surfaced when the configuration file cannot be read.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolved runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root holding `tools/`, `workspace/`, `output/` and `logs/`.
    pub base_dir: PathBuf,
    /// Executable used to launch the tool jars.
    pub java_executable: String,
    /// Optional limit for a single external process. `None` waits forever.
    pub process_timeout_secs: Option<u64>,
    /// Timeout applied to each HTTP request made by the provisioner.
    pub http_timeout_secs: u64,
    /// User-Agent sent to the release API.
    pub user_agent: String,
    /// Base URL of the GitHub-compatible release API.
    pub release_api_base: String,
    /// When false the sign step is skipped and the rebuilt APK is the final artifact.
    pub sign_output: bool,
}

/// Partial configuration as stored on disk; absent fields keep their defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    base_dir: Option<String>,
    java_executable: Option<String>,
    process_timeout_secs: Option<u64>,
    http_timeout_secs: Option<u64>,
    user_agent: Option<String>,
    release_api_base: Option<String>,
    sign_output: Option<bool>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::with_base_dir(default_base_dir())
    }
}

impl AppConfig {
    /// Defaults rooted at `base_dir`.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            java_executable: "java".to_string(),
            process_timeout_secs: None,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            user_agent: format!("apkflow/{}", env!("CARGO_PKG_VERSION")),
            release_api_base: DEFAULT_RELEASE_API_BASE.to_string(),
            sign_output: true,
        }
    }

    /// Resolve the base directory from the environment and apply the config file, if any.
    ///
    /// A malformed file is reported with a warning and ignored.
    pub fn load() -> Result<Self, ConfigError> {
        let base_dir = default_base_dir();
        let config_path = env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| expand_tilde(&value))
            .unwrap_or_else(|| base_dir.join(CONFIG_FILE_NAME));
        Self::load_from(base_dir, &config_path)
    }

    /// Apply the file at `config_path` on top of defaults rooted at `base_dir`.
    pub fn load_from(base_dir: PathBuf, config_path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::with_base_dir(base_dir);
        let data = match fs::read_to_string(config_path) {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %config_path.display(), "no config file; using defaults");
                return Ok(config);
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: config_path.to_path_buf(),
                    source,
                });
            }
        };

        match serde_json::from_str::<ConfigFile>(&data) {
            Ok(file) => config.apply(file),
            Err(error) => {
                warn!(
                    path = %config_path.display(),
                    error = %error,
                    "Failed to parse config file; using defaults"
                );
            }
        }
        Ok(config)
    }

    fn apply(&mut self, file: ConfigFile) {
        if let Some(base_dir) = file.base_dir.filter(|value| !value.trim().is_empty()) {
            self.base_dir = expand_tilde(&base_dir);
        }
        if let Some(java) = file.java_executable.filter(|value| !value.trim().is_empty()) {
            self.java_executable = java;
        }
        if file.process_timeout_secs.is_some() {
            self.process_timeout_secs = file.process_timeout_secs;
        }
        if let Some(secs) = file.http_timeout_secs {
            self.http_timeout_secs = secs;
        }
        if let Some(agent) = file.user_agent.filter(|value| !value.trim().is_empty()) {
            self.user_agent = agent;
        }
        if let Some(base) = file.release_api_base.filter(|value| !value.trim().is_empty()) {
            self.release_api_base = base;
        }
        if let Some(sign) = file.sign_output {
            self.sign_output = sign;
        }
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.base_dir.join(TOOLS_DIR_NAME)
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.base_dir.join(WORKSPACE_DIR_NAME)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.base_dir.join(OUTPUT_DIR_NAME)
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.base_dir.join(LOGS_DIR_NAME).join(LOG_FILE_NAME)
    }

    /// Per-process limit; zero is treated as "no limit".
    pub fn process_timeout(&self) -> Option<Duration> {
        self.process_timeout_secs.filter(|secs| *secs > 0).map(Duration::from_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }
}

fn default_base_dir() -> PathBuf {
    if let Ok(path) = env::var(HOME_ENV) {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return expand_tilde(trimmed);
        }
    }

    data_dir().unwrap_or_else(|| PathBuf::from(".")).join("apkflow")
}

/// Expands a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    let trimmed = path.trim();
    let home = || home_dir().unwrap_or_else(|| PathBuf::from("~"));
    if trimmed == "~" {
        return home();
    }
    if let Some(rest) = trimmed.strip_prefix("~/").or_else(|| trimmed.strip_prefix("~\\")) {
        return home().join(rest);
    }
    PathBuf::from(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn home_env_sets_base_dir() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("home");
        temp_env::with_vars(
            [
                (HOME_ENV, Some(base.to_string_lossy().to_string())),
                (CONFIG_PATH_ENV, None),
            ],
            || {
                let config = AppConfig::load().unwrap();
                assert_eq!(config.base_dir, base);
                assert_eq!(config.tools_dir(), base.join("tools"));
                assert_eq!(config.workspace_dir(), base.join("workspace"));
                assert_eq!(config.output_dir(), base.join("output"));
                assert_eq!(config.log_file_path(), base.join("logs").join("app.log"));
                assert_eq!(config.java_executable, "java");
                assert!(config.process_timeout().is_none());
                assert!(config.sign_output);
            },
        );
    }

    #[test]
    fn config_file_overrides_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"{ "java_executable": "/opt/jdk/bin/java", "process_timeout_secs": 300, "sign_output": false }"#,
        )
        .unwrap();

        let config = AppConfig::load_from(dir.path().to_path_buf(), &path).unwrap();
        assert_eq!(config.base_dir, dir.path());
        assert_eq!(config.java_executable, "/opt/jdk/bin/java");
        assert_eq!(config.process_timeout(), Some(Duration::from_secs(300)));
        assert!(!config.sign_output);
        assert_eq!(config.release_api_base, DEFAULT_RELEASE_API_BASE);
    }

    #[test]
    fn malformed_config_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "{ not json").unwrap();

        let config = AppConfig::load_from(dir.path().to_path_buf(), &path).unwrap();
        assert_eq!(config, AppConfig::with_base_dir(dir.path()));
    }

    #[test]
    fn zero_timeout_means_unlimited() {
        let mut config = AppConfig::with_base_dir("/tmp/apkflow");
        config.process_timeout_secs = Some(0);
        assert!(config.process_timeout().is_none());
    }

    #[test]
    fn expand_tilde_leaves_plain_paths() {
        assert_eq!(expand_tilde("/var/data"), PathBuf::from("/var/data"));
        assert_eq!(expand_tilde("  relative/dir "), PathBuf::from("relative/dir"));
    }
}
