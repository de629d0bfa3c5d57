//! Configuration loading and schema definitions for scatter.
//!
//! Configuration lives in a TOML file (`scatter.toml` by default) with four
//! sections: `[scatter]` for the scheduling core, `[build]` and
//! `[enumerate]` for producing the test universe, `[devices]` for slot
//! provisioning, and `[executor]` for how a batch is actually run.
//!
//! # Example
//!
//! ```toml
//! [scatter]
//! partition = "1/1"
//! retry_ceiling = 5
//! max_batch_size = 10
//!
//! [build]
//! command = "xcodebuild build-for-testing -scheme App"
//!
//! [enumerate]
//! command = "testctl list --json"
//!
//! [devices.families]
//! "iPhone 6" = 2
//!
//! [executor]
//! command = "testctl run --device {device_id} --only {tests} --result-log {result_log}"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Scheduling core settings.
    #[serde(default)]
    pub scatter: ScatterConfig,

    /// Build step settings.
    #[serde(default)]
    pub build: BuildConfig,

    /// Test enumeration settings.
    #[serde(default)]
    pub enumerate: EnumerateConfig,

    /// Device provisioning settings.
    #[serde(default)]
    pub devices: DevicesConfig,

    /// Batch execution settings.
    #[serde(default)]
    pub executor: ExecutorConfig,
}

/// Settings for the scheduling and retry core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScatterConfig {
    /// Which slice of the enumerated tests this run executes, as
    /// `"index/total"` (1-based).
    #[serde(default = "default_partition")]
    pub partition: String,

    /// Per-test failure count that aborts the whole run.
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,

    /// Largest batch handed to one worker when plenty of work remains.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// How many already-attempted tests to hand an idle worker when no
    /// fresh work remains.
    #[serde(default = "default_top_up_size")]
    pub top_up_size: usize,

    /// How long a worker may go without a readiness signal before the
    /// launch gate releases on its behalf.
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,

    /// How long a running batch may go without producing output before
    /// its process is killed.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Sleep between batch-selection attempts while waiting for work to
    /// free up.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Identifiers matching this pattern are slot failures, not tests;
    /// they are never scheduled and never counted against a test.
    #[serde(default = "default_env_failure_pattern")]
    pub env_failure_pattern: String,

    /// Directory for result logs and enumeration artifacts.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl ScatterConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ScatterConfig {
    fn default() -> Self {
        Self {
            partition: default_partition(),
            retry_ceiling: default_retry_ceiling(),
            max_batch_size: default_max_batch_size(),
            top_up_size: default_top_up_size(),
            launch_timeout_secs: default_launch_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            env_failure_pattern: default_env_failure_pattern(),
            output_dir: default_output_dir(),
        }
    }
}

/// Settings for the build step run before scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Whether to build test artifacts before running.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Shell command that builds the test artifacts.
    #[serde(default)]
    pub command: Option<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            command: None,
        }
    }
}

/// Settings for enumerating the available tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumerateConfig {
    /// Shell command that emits JSON-lines test records.
    #[serde(default)]
    pub command: Option<String>,

    /// How many times to retry enumeration before giving up.
    #[serde(default = "default_enumerate_retries")]
    pub retries: u32,
}

impl Default for EnumerateConfig {
    fn default() -> Self {
        Self {
            command: None,
            retries: default_enumerate_retries(),
        }
    }
}

/// Settings for device provisioning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevicesConfig {
    /// Device families and how many slots to provision for each.
    #[serde(default)]
    pub families: BTreeMap<String, usize>,
}

impl DevicesConfig {
    /// Total number of slots across all families.
    pub fn slot_count(&self) -> usize {
        self.families.values().sum()
    }
}

/// Settings for how one batch is executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Shell command template; `{device_id}`, `{tests}` and `{result_log}`
    /// are substituted per launch.
    #[serde(default)]
    pub command: Option<String>,

    /// Shell used to run the command.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Working directory for the command.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables for the command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: None,
            shell: default_shell(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }
}

fn default_partition() -> String {
    "1/1".to_string()
}

fn default_retry_ceiling() -> u32 {
    5
}

fn default_max_batch_size() -> usize {
    10
}

fn default_top_up_size() -> usize {
    5
}

fn default_launch_timeout_secs() -> u64 {
    60
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_env_failure_pattern() -> String {
    r"(?i)failed to (boot|launch|load)".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("scatter-logs")
}

fn default_true() -> bool {
    true
}

fn default_enumerate_retries() -> u32 {
    20
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

impl Config {
    /// Checks that the configuration is complete enough to run tests.
    pub fn validate(&self) -> Result<()> {
        if self.devices.families.is_empty() {
            bail!("[devices.families] must list at least one device family");
        }
        if self.devices.slot_count() == 0 {
            bail!("[devices.families] must provision at least one slot");
        }
        if self.executor.command.is_none() {
            bail!("[executor] command is required");
        }
        if self.enumerate.command.is_none() {
            bail!("[enumerate] command is required");
        }
        if self.build.enabled && self.build.command.is_none() {
            bail!("[build] command is required when the build step is enabled");
        }
        if self.scatter.max_batch_size == 0 {
            bail!("[scatter] max_batch_size must be at least 1");
        }
        if self.scatter.retry_ceiling == 0 {
            bail!("[scatter] retry_ceiling must be at least 1");
        }
        crate::discovery::parse_partition(&self.scatter.partition)
            .with_context(|| format!("[scatter] partition '{}'", self.scatter.partition))?;
        regex::Regex::new(&self.scatter.env_failure_pattern)
            .context("[scatter] env_failure_pattern is not a valid regex")?;
        Ok(())
    }
}

/// Loads configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, contains invalid TOML, or
/// doesn't match the expected schema.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
///
/// Useful for testing and for generating configuration programmatically.
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> Config {
        load_config_str(
            r#"
            [build]
            command = "make build-tests"

            [enumerate]
            command = "testctl list --json"

            [devices.families]
            "iPhone 6" = 2

            [executor]
            command = "testctl run --device {device_id} --only {tests}"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_applied_to_empty_config() {
        let config = load_config_str("").unwrap();
        assert_eq!(config.scatter.partition, "1/1");
        assert_eq!(config.scatter.retry_ceiling, 5);
        assert_eq!(config.scatter.max_batch_size, 10);
        assert_eq!(config.scatter.top_up_size, 5);
        assert_eq!(config.enumerate.retries, 20);
        assert_eq!(config.executor.shell, "/bin/sh");
        assert!(config.build.enabled);
    }

    #[test]
    fn full_config_round_trips() {
        let config = load_config_str(
            r#"
            [scatter]
            partition = "2/4"
            retry_ceiling = 3
            max_batch_size = 8
            idle_timeout_secs = 30

            [devices.families]
            "iPhone 6" = 2
            "iPad Air" = 1

            [executor]
            command = "run {tests}"
            shell = "/bin/bash"

            [executor.env]
            KIF_SCREENSHOTS = "/tmp/screens"
            "#,
        )
        .unwrap();

        assert_eq!(config.scatter.partition, "2/4");
        assert_eq!(config.scatter.retry_ceiling, 3);
        assert_eq!(config.scatter.idle_timeout_secs, 30);
        assert_eq!(config.devices.slot_count(), 3);
        assert_eq!(config.executor.shell, "/bin/bash");
        assert_eq!(
            config.executor.env.get("KIF_SCREENSHOTS"),
            Some(&"/tmp/screens".to_string())
        );
    }

    #[test]
    fn validate_accepts_complete_config() {
        assert!(complete().validate().is_ok());
    }

    #[test]
    fn validate_requires_executor_command() {
        let mut config = complete();
        config.executor.command = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_requires_device_families() {
        let mut config = complete();
        config.devices.families.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_partition() {
        let mut config = complete();
        config.scatter.partition = "0/0".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_marker_pattern() {
        let mut config = complete();
        config.scatter.env_failure_pattern = "(unclosed".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn build_command_optional_when_build_disabled() {
        let mut config = complete();
        config.build.enabled = false;
        config.build.command = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn timeouts_convert_to_durations() {
        let config = ScatterConfig::default();
        assert_eq!(config.launch_timeout(), Duration::from_secs(60));
        assert_eq!(config.idle_timeout(), Duration::from_secs(120));
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
    }
}
