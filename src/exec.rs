//! Test execution: launching an external test run against a device slot.
//!
//! This module defines the execution seam between the scheduling core and
//! the process that actually runs a batch of tests. The core never talks to
//! a process directly; it goes through the [`TestExecutor`] and
//! [`TestProcess`] traits so that real runs (a spawned child process) and
//! scripted runs (in tests) look identical to a worker unit.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TestExecutor                            │
//! │  (launches one batch on one device slot)                    │
//! │                                                              │
//! │  launch(slot, tests, attempt) ─────► TestProcess            │
//! └────────────────────────────────────────┼────────────────────┘
//!                                          │
//!                                          ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       TestProcess                            │
//! │  (one running batch)                                        │
//! │                                                              │
//! │  next_output() ───► OutputLine (stdout/stderr, merged)      │
//! │  kill()                                                      │
//! │  wait() ───► exit code                                      │
//! │  result_log() ───► path to the structured result log        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The built-in [`ProcessExecutor`] renders a configured command template
//! (`{device_id}`, `{tests}`, `{result_log}` placeholders) and spawns it
//! through the configured shell, streaming merged stdout/stderr lines.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use async_trait::async_trait;
use futures::Stream;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;

use crate::config::ExecutorConfig;
use crate::device::DeviceSlot;

/// Result type for execution operations.
pub type ExecResult<T> = Result<T, ExecError>;

/// Errors that can occur while launching or supervising a test run.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The external process could not be started.
    ///
    /// Note: a process that starts but exits non-zero is NOT an error.
    /// This error means the command never ran at all.
    #[error("Failed to launch test run: {0}")]
    LaunchFailed(String),

    /// No executor command is configured.
    #[error("No executor command configured")]
    MissingCommand,

    /// I/O error while supervising the process.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Executor-specific error not covered by other variants.
    #[error("Executor error: {0}")]
    Other(#[from] anyhow::Error),
}

/// A line of output from a streaming test run.
#[derive(Debug, Clone)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    /// Returns the text of the line regardless of which stream it came from.
    pub fn text(&self) -> &str {
        match self {
            OutputLine::Stdout(s) | OutputLine::Stderr(s) => s,
        }
    }
}

/// A boxed stream of output lines.
pub type OutputStream = Pin<Box<dyn Stream<Item = OutputLine> + Send>>;

/// One running test batch.
///
/// A worker unit owns exactly one `TestProcess` at a time, pumps its output
/// through [`next_output`](Self::next_output), and may kill it when the
/// idle-output watchdog fires or the run is cancelled. Killing is always
/// followed by [`wait`](Self::wait) so the child is reaped.
#[async_trait]
pub trait TestProcess: Send {
    /// Returns the next line of merged stdout/stderr output, or `None`
    /// once the process has closed both streams.
    async fn next_output(&mut self) -> Option<OutputLine>;

    /// Forcibly terminates the process. Idempotent.
    async fn kill(&mut self);

    /// Waits for the process to exit and returns its exit code.
    ///
    /// A process terminated by a signal reports `-1`.
    async fn wait(&mut self) -> ExecResult<i32>;

    /// Path to the structured result log this run writes.
    fn result_log(&self) -> &Path;
}

/// Launches test batches on device slots.
#[async_trait]
pub trait TestExecutor: Send + Sync {
    /// Launches one batch of tests against the given slot.
    ///
    /// `attempt` is the per-slot attempt ordinal, used to keep result logs
    /// from successive retries on the same slot from clobbering each other.
    async fn launch(
        &self,
        slot: &DeviceSlot,
        tests: &[String],
        attempt: u32,
    ) -> ExecResult<Box<dyn TestProcess>>;
}

/// A spawned child process with its merged line stream.
pub struct StreamingChild {
    pub child: Child,
    pub output: OutputStream,
}

/// Spawns `command` through `shell -c` and wires up merged stdout/stderr
/// line streaming.
pub fn spawn_shell(
    shell: &str,
    command: &str,
    working_dir: Option<&Path>,
    env: &[(String, String)],
) -> ExecResult<StreamingChild> {
    let mut process = tokio::process::Command::new(shell);
    process.arg("-c").arg(command);

    if let Some(dir) = working_dir {
        process.current_dir(dir);
    }
    for (key, value) in env {
        process.env(key, value);
    }

    process.stdout(Stdio::piped());
    process.stderr(Stdio::piped());
    process.kill_on_drop(true);

    let mut child = process
        .spawn()
        .map_err(|e| ExecError::LaunchFailed(e.to_string()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::LaunchFailed("stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecError::LaunchFailed("stderr not captured".to_string()))?;

    let stdout_stream = tokio_stream::wrappers::LinesStream::new(BufReader::new(stdout).lines())
        .map(|line: Result<String, std::io::Error>| OutputLine::Stdout(line.unwrap_or_default()));
    let stderr_stream = tokio_stream::wrappers::LinesStream::new(BufReader::new(stderr).lines())
        .map(|line: Result<String, std::io::Error>| OutputLine::Stderr(line.unwrap_or_default()));

    // Merge stdout and stderr streams
    let combined = stream::select(stdout_stream, stderr_stream);

    Ok(StreamingChild {
        child,
        output: Box::pin(combined),
    })
}

/// Executor that spawns the configured test command as a child process.
///
/// The command is a template; `{device_id}`, `{tests}` and `{result_log}`
/// are substituted per launch. Tests are passed as a comma-separated list
/// of `Class/method` identifiers, matching what the external test harness
/// expects for its `-only` style filters.
pub struct ProcessExecutor {
    config: ExecutorConfig,
    output_dir: PathBuf,
}

impl ProcessExecutor {
    /// Creates a new executor from configuration.
    ///
    /// Result logs for each attempt are written under `output_dir`.
    pub fn new(config: ExecutorConfig, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            output_dir: output_dir.into(),
        }
    }

    fn result_log_path(&self, slot: &DeviceSlot, attempt: u32) -> PathBuf {
        let filename = if attempt > 0 {
            format!("{} ({}).json", slot.name, attempt + 1)
        } else {
            format!("{}.json", slot.name)
        };
        self.output_dir.join(filename)
    }
}

#[async_trait]
impl TestExecutor for ProcessExecutor {
    async fn launch(
        &self,
        slot: &DeviceSlot,
        tests: &[String],
        attempt: u32,
    ) -> ExecResult<Box<dyn TestProcess>> {
        let template = self
            .config
            .command
            .as_deref()
            .ok_or(ExecError::MissingCommand)?;

        let result_log = self.result_log_path(slot, attempt);
        let rendered = template
            .replace("{device_id}", &slot.instance_id)
            .replace("{tests}", &tests.join(","))
            .replace("{result_log}", &result_log.to_string_lossy());

        let env: Vec<(String, String)> = self
            .config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let spawned = spawn_shell(
            &self.config.shell,
            &rendered,
            self.config.working_dir.as_deref(),
            &env,
        )?;

        Ok(Box::new(BatchProcess {
            child: spawned.child,
            output: spawned.output,
            result_log,
        }))
    }
}

/// A running batch backed by a real child process.
struct BatchProcess {
    child: Child,
    output: OutputStream,
    result_log: PathBuf,
}

#[async_trait]
impl TestProcess for BatchProcess {
    async fn next_output(&mut self) -> Option<OutputLine> {
        self.output.next().await
    }

    async fn kill(&mut self) {
        // start_kill fails if the process already exited; that is fine.
        let _ = self.child.start_kill();
    }

    async fn wait(&mut self) -> ExecResult<i32> {
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }

    fn result_log(&self) -> &Path {
        &self.result_log
    }
}
