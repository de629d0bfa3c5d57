//! Building test artifacts and enumerating the test universe.
//!
//! Before any scheduling happens the run needs a fixed pool of tests to
//! distribute. This module runs the configured build command, enumerates
//! the available tests (retrying a bounded number of times, since listing
//! requires booting the same flaky environment the tests run in), and
//! slices the enumeration into the partition this run is responsible for.
//!
//! # Enumeration format
//!
//! The enumeration command emits JSON lines. A record carrying
//! `bundleName` switches the current bundle; records carrying `className`
//! and `methodName` append a test to it:
//!
//! ```text
//! {"bundleName": "AppTests.xctest"}
//! {"className": "LoginTests", "methodName": "testLogin"}
//! {"className": "LoginTests", "methodName": "testLogout"}
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::{BuildConfig, EnumerateConfig, ExecutorConfig};
use crate::exec::{OutputLine, spawn_shell};
use crate::results::test_id;
use crate::sink::SinkHandle;

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors that can occur while producing the test universe.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The build command exited non-zero. Fatal; carries the captured log
    /// tail for diagnosis.
    #[error("Build failed:\n{log}")]
    BuildFailed { log: String },

    /// Enumeration kept failing until its retry budget ran out. Fatal.
    #[error("Failed to enumerate tests after {attempts} attempts")]
    EnumerationFailed { attempts: u32 },

    /// The partition spec could not be parsed or is out of range.
    #[error("Invalid partition '{0}' (expected \"index/total\", 1-based)")]
    InvalidPartition(String),

    /// A required command is missing from the configuration.
    #[error("No {0} command configured")]
    MissingCommand(&'static str),

    /// The external command could not be run.
    #[error(transparent)]
    Exec(#[from] crate::exec::ExecError),
}

/// How many trailing log lines a build failure carries.
const BUILD_LOG_TAIL: usize = 200;

/// Runs the configured build command, streaming its output to the sink.
///
/// # Errors
///
/// [`DiscoveryError::BuildFailed`] with the captured log tail if the
/// command exits non-zero.
pub async fn build(
    config: &BuildConfig,
    executor: &ExecutorConfig,
    sink: &SinkHandle,
) -> DiscoveryResult<()> {
    let command = config
        .command
        .as_deref()
        .ok_or(DiscoveryError::MissingCommand("build"))?;

    info!("Building test artifacts");
    let env: Vec<(String, String)> = executor
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let mut spawned = spawn_shell(
        &executor.shell,
        command,
        executor.working_dir.as_deref(),
        &env,
    )?;

    let mut tail: Vec<String> = Vec::new();
    while let Some(line) = spawned.output.next().await {
        sink.line(None, line.text());
        tail.push(line.text().to_string());
        if tail.len() > BUILD_LOG_TAIL {
            tail.remove(0);
        }
    }

    let status = spawned.child.wait().await.map_err(crate::exec::ExecError::Io)?;
    if status.success() {
        Ok(())
    } else {
        Err(DiscoveryError::BuildFailed {
            log: tail.join("\n"),
        })
    }
}

/// One record from the enumeration output.
#[derive(Debug, Deserialize)]
struct ListRecord {
    #[serde(rename = "bundleName")]
    bundle_name: Option<String>,
    #[serde(rename = "className")]
    class_name: Option<String>,
    #[serde(rename = "methodName")]
    method_name: Option<String>,
}

/// Enumerates the available tests, grouped by bundle.
///
/// Retries up to `config.retries` times; enumeration boots the same
/// environment the tests need, so transient failures are expected.
///
/// # Errors
///
/// [`DiscoveryError::EnumerationFailed`] once the retry budget is spent.
pub async fn list_tests(
    config: &EnumerateConfig,
    executor: &ExecutorConfig,
    sink: &SinkHandle,
) -> DiscoveryResult<BTreeMap<String, Vec<String>>> {
    let command = config
        .command
        .as_deref()
        .ok_or(DiscoveryError::MissingCommand("enumerate"))?;

    let attempts = config.retries.max(1);
    for attempt in 1..=attempts {
        match list_tests_once(command, executor, sink).await {
            Ok(bundles) if !bundles.is_empty() => return Ok(bundles),
            Ok(_) => warn!("Enumeration produced no tests (attempt {attempt}/{attempts})"),
            Err(e) => warn!("Enumeration failed (attempt {attempt}/{attempts}): {e}"),
        }
    }

    Err(DiscoveryError::EnumerationFailed { attempts })
}

async fn list_tests_once(
    command: &str,
    executor: &ExecutorConfig,
    sink: &SinkHandle,
) -> DiscoveryResult<BTreeMap<String, Vec<String>>> {
    let env: Vec<(String, String)> = executor
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let mut spawned = spawn_shell(
        &executor.shell,
        command,
        executor.working_dir.as_deref(),
        &env,
    )?;

    let mut bundles: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut current_bundle = String::new();

    while let Some(line) = spawned.output.next().await {
        let text = match &line {
            OutputLine::Stdout(s) => s,
            OutputLine::Stderr(s) => {
                sink.line(None, s.as_str());
                continue;
            }
        };
        let Ok(record) = serde_json::from_str::<ListRecord>(text) else {
            continue;
        };
        if let Some(name) = record.bundle_name {
            current_bundle = name.trim_end_matches(".xctest").to_string();
            bundles.entry(current_bundle.clone()).or_default();
        }
        if let (Some(class_name), Some(method_name)) = (record.class_name, record.method_name) {
            let id = test_id(&class_name, &method_name);
            let tests = bundles.entry(current_bundle.clone()).or_default();
            if !tests.contains(&id) {
                tests.push(id);
            }
        }
    }

    let status = spawned.child.wait().await.map_err(crate::exec::ExecError::Io)?;
    if !status.success() {
        return Err(DiscoveryError::EnumerationFailed { attempts: 1 });
    }

    Ok(bundles)
}

/// Writes the enumeration to `tests_by_bundle.json` under `output_dir`.
pub fn write_enumeration(
    bundles: &BTreeMap<String, Vec<String>>,
    output_dir: &Path,
) -> std::io::Result<PathBuf> {
    let path = output_dir.join("tests_by_bundle.json");
    let json = serde_json::to_string_pretty(bundles)?;
    std::fs::write(&path, json)?;
    Ok(path)
}

/// Parses an `"index/total"` partition spec (1-based).
pub fn parse_partition(spec: &str) -> DiscoveryResult<(usize, usize)> {
    let invalid = || DiscoveryError::InvalidPartition(spec.to_string());

    let (index, total) = spec.split_once('/').ok_or_else(invalid)?;
    let index: usize = index.trim().parse().map_err(|_| invalid())?;
    let total: usize = total.trim().parse().map_err(|_| invalid())?;

    if total == 0 || index == 0 || index > total {
        return Err(invalid());
    }
    Ok((index, total))
}

/// Returns the slice of the universe this run is responsible for.
///
/// Tests from every bundle are flattened, sorted and deduplicated, then
/// split into `total` contiguous chunks of near-equal size; partition
/// `index` gets the `index`-th chunk. The split is deterministic, so the
/// `total` partitions of one enumeration cover every test exactly once.
pub fn load_tests_for_partition(
    bundles: &BTreeMap<String, Vec<String>>,
    spec: &str,
) -> DiscoveryResult<Vec<String>> {
    let (index, total) = parse_partition(spec)?;

    let mut all: Vec<String> = bundles.values().flatten().cloned().collect();
    all.sort();
    all.dedup();

    let len = all.len();
    let base = len / total;
    let remainder = len % total;

    // The first `remainder` chunks carry one extra test.
    let start = (index - 1) * base + (index - 1).min(remainder);
    let size = base + if index <= remainder { 1 } else { 0 };

    Ok(all[start..(start + size).min(len)].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildConfig, EnumerateConfig, ExecutorConfig};

    fn shell_executor() -> ExecutorConfig {
        ExecutorConfig::default()
    }

    fn bundles_of(tests: &[&str]) -> BTreeMap<String, Vec<String>> {
        let mut bundles = BTreeMap::new();
        bundles.insert(
            "AppTests".to_string(),
            tests.iter().map(|t| t.to_string()).collect(),
        );
        bundles
    }

    #[tokio::test]
    async fn build_succeeds_on_zero_exit() {
        let config = BuildConfig {
            enabled: true,
            command: Some("echo compiling && true".to_string()),
        };
        let result = build(&config, &shell_executor(), &SinkHandle::discard()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn build_failure_captures_log() {
        let config = BuildConfig {
            enabled: true,
            command: Some("echo ld: symbol not found; exit 65".to_string()),
        };
        let err = build(&config, &shell_executor(), &SinkHandle::discard())
            .await
            .unwrap_err();
        match err {
            DiscoveryError::BuildFailed { log } => {
                assert!(log.contains("symbol not found"));
            }
            other => panic!("expected BuildFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn enumeration_parses_bundle_switches() {
        let config = EnumerateConfig {
            command: Some(
                r#"printf '%s\n' \
                '{"bundleName": "AppTests.xctest"}' \
                '{"className": "LoginTests", "methodName": "testLogin"}' \
                '{"className": "LoginTests", "methodName": "testLogin"}' \
                '{"bundleName": "UITests.xctest"}' \
                '{"className": "CartTests", "methodName": "testAdd"}'"#
                    .to_string(),
            ),
            retries: 1,
        };

        let bundles = list_tests(&config, &shell_executor(), &SinkHandle::discard())
            .await
            .unwrap();

        assert_eq!(
            bundles["AppTests"],
            vec!["LoginTests/testLogin".to_string()]
        );
        assert_eq!(bundles["UITests"], vec!["CartTests/testAdd".to_string()]);
    }

    #[tokio::test]
    async fn enumeration_exhausts_retries() {
        let config = EnumerateConfig {
            command: Some("exit 1".to_string()),
            retries: 3,
        };
        let err = list_tests(&config, &shell_executor(), &SinkHandle::discard())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::EnumerationFailed { attempts: 3 }
        ));
    }

    #[test]
    fn partition_spec_parsing() {
        assert_eq!(parse_partition("1/1").unwrap(), (1, 1));
        assert_eq!(parse_partition("2/4").unwrap(), (2, 4));
        assert!(parse_partition("0/4").is_err());
        assert!(parse_partition("5/4").is_err());
        assert!(parse_partition("1/0").is_err());
        assert!(parse_partition("nope").is_err());
        assert!(parse_partition("1-4").is_err());
    }

    #[test]
    fn partitions_cover_universe_exactly_once() {
        let bundles = bundles_of(&["A/a", "B/b", "C/c", "D/d", "E/e", "F/f", "G/g"]);

        let mut seen = Vec::new();
        for index in 1..=3 {
            let spec = format!("{}/3", index);
            seen.extend(load_tests_for_partition(&bundles, &spec).unwrap());
        }

        seen.sort();
        assert_eq!(seen, vec!["A/a", "B/b", "C/c", "D/d", "E/e", "F/f", "G/g"]);
    }

    #[test]
    fn partitioning_is_deterministic() {
        let bundles = bundles_of(&["C/c", "A/a", "B/b"]);
        let first = load_tests_for_partition(&bundles, "1/2").unwrap();
        let second = load_tests_for_partition(&bundles, "1/2").unwrap();
        assert_eq!(first, second);
        assert_eq!(first, vec!["A/a", "B/b"]);
    }

    #[test]
    fn single_partition_gets_everything_sorted() {
        let bundles = bundles_of(&["B/b", "A/a", "B/b"]);
        let tests = load_tests_for_partition(&bundles, "1/1").unwrap();
        assert_eq!(tests, vec!["A/a", "B/b"]);
    }

    #[test]
    fn write_enumeration_produces_json_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let bundles = bundles_of(&["A/a"]);
        let path = write_enumeration(&bundles, dir.path()).unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("AppTests"));
        assert!(content.contains("A/a"));
    }
}
