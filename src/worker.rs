//! Worker units: one test-run attempt on one device slot.
//!
//! A worker unit is ephemeral; it lives for a single attempt. It pulls its
//! batch lazily from the scheduler at the moment it starts (so the batch
//! reflects the freshest state), passes through the launch gate, runs the
//! batch via the executor while watching for output stalls, classifies
//! the outcome from the structured result log, and reports exactly once.
//! Retrying means the driver constructs a brand-new unit; units are never
//! reused.
//!
//! # State machine
//!
//! ```text
//! Pending ──► Started ──► Running ──► Terminated(Success | Failure)
//!                │
//!                └──► Finished-Empty   (no assignable work: run settled)
//! ```
//!
//! Cancellation can interrupt `Running` at any await point; the unit then
//! kills its process and reports `Stopped`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::device::DeviceSlot;
use crate::exec::TestExecutor;
use crate::gate::LaunchGate;
use crate::results::parse_result_log;
use crate::scheduler::Scheduler;
use crate::sink::SinkHandle;

/// Terminal status of one worker unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// The unit was cancelled or finished empty; nothing to aggregate.
    Stopped,
    /// Clean exit and every attempted test confirmed passed.
    Success,
    /// Anything else: dirty exit, stall, or a partial set of passes.
    Failed,
}

/// One unit's completion, delivered exactly once over the report channel.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub status: WorkerStatus,
    pub slot: DeviceSlot,
    /// The batch this unit attempted.
    pub attempted: Vec<String>,
    /// Attempted tests confirmed passed by this run.
    pub succeeded: HashSet<String>,
    /// Attempted tests that did not pass. Empty for slot-attributed
    /// failures (e.g. the process never launched).
    pub failed: Vec<String>,
}

/// Collaborators shared by every worker unit of a run.
#[derive(Clone)]
pub struct WorkerContext {
    pub scheduler: Arc<Scheduler>,
    pub executor: Arc<dyn TestExecutor>,
    pub gate: Arc<LaunchGate>,
    pub sink: SinkHandle,
    pub idle_timeout: Duration,
    pub token: CancellationToken,
}

/// A single test-run attempt bound to one provisioned slot.
pub struct WorkerUnit {
    slot: DeviceSlot,
    /// Per-slot attempt ordinal; keeps successive result logs apart.
    attempt: u32,
    ctx: WorkerContext,
}

impl WorkerUnit {
    pub fn new(slot: DeviceSlot, attempt: u32, ctx: WorkerContext) -> Self {
        Self { slot, attempt, ctx }
    }

    /// Runs the unit to completion, sending exactly one report.
    pub async fn run(self, reports: mpsc::UnboundedSender<WorkerReport>) {
        let slot_name = self.slot.name.clone();

        // Started: pull the batch now, not at enqueue time.
        let Some(batch) = self.ctx.scheduler.next_batch().await else {
            // Finished-Empty: the run settled while we waited.
            let _ = reports.send(self.report(
                WorkerStatus::Stopped,
                Vec::new(),
                HashSet::new(),
                Vec::new(),
            ));
            return;
        };

        // The startup phase is resource-contended; wait our turn.
        let ready = self.ctx.gate.admit(&slot_name).await;

        self.ctx.sink.line(
            Some(&slot_name),
            format!("Running the following tests:\n\t{}\n", batch.join("\n\t")),
        );

        let mut process = match self
            .ctx
            .executor
            .launch(&self.slot, &batch, self.attempt)
            .await
        {
            Ok(process) => process,
            Err(e) => {
                ready.signal_ready();
                warn!(slot = %slot_name, "failed to launch test run: {e}");
                // Slot-attributed failure: nothing gets a failure count,
                // the whole batch goes back to the pool.
                let _ = reports.send(self.report(
                    WorkerStatus::Failed,
                    batch,
                    HashSet::new(),
                    Vec::new(),
                ));
                return;
            }
        };

        // Running: pump output, arm the idle watchdog, watch for cancel.
        // The watchdog re-arms on every output line.
        enum Event {
            Cancelled,
            Stalled,
            Output(Option<crate::exec::OutputLine>),
        }

        let mut timed_out = false;
        loop {
            let event = select! {
                _ = self.ctx.token.cancelled() => Event::Cancelled,
                _ = tokio::time::sleep(self.ctx.idle_timeout) => Event::Stalled,
                line = process.next_output() => Event::Output(line),
            };
            match event {
                Event::Cancelled => {
                    process.kill().await;
                    let _ = process.wait().await;
                    debug!(slot = %slot_name, "unit cancelled");
                    ready.signal_ready();
                    let _ = reports.send(self.report(
                        WorkerStatus::Stopped,
                        batch,
                        HashSet::new(),
                        Vec::new(),
                    ));
                    return;
                }
                Event::Stalled => {
                    self.ctx.sink.line(
                        Some(&slot_name),
                        format!(
                            "TIMED OUT: no output for {:?}, killing this run",
                            self.ctx.idle_timeout
                        ),
                    );
                    warn!(slot = %slot_name, "idle-output timeout; killing process");
                    process.kill().await;
                    timed_out = true;
                    break;
                }
                Event::Output(Some(line)) => {
                    // First real output means the environment is up.
                    ready.signal_ready();
                    self.ctx.sink.line(Some(&slot_name), line.text());
                }
                Event::Output(None) => break,
            }
        }

        let exit_code = process.wait().await.ok();
        // Release the gate even if the process never produced output.
        ready.signal_ready();

        let results = parse_result_log(process.result_log());
        let succeeded: HashSet<String> = batch
            .iter()
            .filter(|t| results.succeeded.contains(*t))
            .cloned()
            .collect();

        let status = if timed_out {
            WorkerStatus::Failed
        } else {
            classify(exit_code, &batch, &succeeded)
        };

        let failed: Vec<String> = batch
            .iter()
            .filter(|t| !succeeded.contains(*t))
            .cloned()
            .collect();

        match status {
            WorkerStatus::Success => {
                self.ctx.sink.line(Some(&slot_name), "Tests PASSED");
            }
            _ => {
                self.ctx.sink.line(
                    Some(&slot_name),
                    format!("\nTests FAILED ({:?}) on {}\n", failed, slot_name),
                );
            }
        }

        let _ = reports.send(self.report(status, batch, succeeded, failed));
    }

    fn report(
        &self,
        status: WorkerStatus,
        attempted: Vec<String>,
        succeeded: HashSet<String>,
        failed: Vec<String>,
    ) -> WorkerReport {
        WorkerReport {
            status,
            slot: self.slot.clone(),
            attempted,
            succeeded,
            failed,
        }
    }
}

/// Classifies a finished run.
///
/// Success requires a clean exit **and** every attempted test confirmed
/// passed; a clean exit with a strict subset of passes still fails, since
/// the remainder must be retried.
fn classify(exit_code: Option<i32>, attempted: &[String], succeeded: &HashSet<String>) -> WorkerStatus {
    let clean_exit = exit_code == Some(0);
    let all_passed = attempted.iter().all(|t| succeeded.contains(t));
    if clean_exit && all_passed {
        WorkerStatus::Success
    } else {
        WorkerStatus::Failed
    }
}
