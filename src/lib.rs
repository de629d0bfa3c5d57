//! scatter: a parallel test runner for provisioned device slots.
//!
//! This crate distributes a fixed pool of tests across concurrently
//! running device slots (simulators, devices, or local pseudo-devices),
//! retries failures with bounded patience, and aggregates everything into
//! a single pass/fail verdict.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Devices**: Provision and recycle execution slots ([`device`])
//! - **Discovery**: Build artifacts and enumerate the test universe ([`discovery`])
//! - **Scheduler**: Batch selection, retry policy, shared run state ([`scheduler`])
//! - **Workers**: One run attempt per slot, with launch and stall watchdogs ([`worker`])
//! - **Driver**: Seeds the queue and recycles slots until a verdict ([`run`])
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use scatter::config::load_config;
//! use scatter::device::LocalDeviceProvider;
//! use scatter::exec::ProcessExecutor;
//! use scatter::run::TestRun;
//! use scatter::sink::OutputSink;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("scatter.toml"))?;
//!
//!     let provider = LocalDeviceProvider::from_config(&config.devices);
//!     let executor = Arc::new(ProcessExecutor::new(
//!         config.executor.clone(),
//!         config.scatter.output_dir.clone(),
//!     ));
//!     let sink = OutputSink::stdout();
//!
//!     let universe = vec!["LoginTests/testLogin".to_string()];
//!     let run = TestRun::new(config, provider, executor, sink.handle());
//!     let tally = run.run(&universe).await?;
//!     drop(run);
//!     sink.close().await;
//!
//!     std::process::exit(tally.exit_code());
//! }
//! ```

pub mod config;
pub mod device;
pub mod discovery;
pub mod exec;
pub mod gate;
pub mod queue;
pub mod report;
pub mod results;
pub mod run;
pub mod scheduler;
pub mod sink;
pub mod worker;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use device::{DeviceProvider, DeviceSlot, LocalDeviceProvider};
pub use exec::{ProcessExecutor, TestExecutor};
pub use run::TestRun;
pub use scheduler::{AbortReason, Decision, Scheduler, Tally};
pub use sink::{OutputSink, SinkHandle};
pub use worker::{WorkerReport, WorkerStatus, WorkerUnit};
