//! Run driver: wires the collaborators together and drives a run to a
//! verdict.
//!
//! The driver seeds the work queue with one worker unit per provisioned
//! slot, then consumes completion reports. Each report is folded into the
//! scheduler inside its critical section; the resulting decision tells the
//! driver whether to stop (all tests passed, or the retry ceiling fired)
//! or to recycle the slot: re-provision its device and enqueue a brand-new
//! unit on it.
//!
//! ```text
//!   seed: one WorkerUnit per slot ──► WorkQueue
//!                                        │ reports (mpsc)
//!                                        ▼
//!              ┌──────────── run driver loop ─────────────┐
//!              │ Decision::Continue  → reset device,      │
//!              │                       enqueue fresh unit │
//!              │ Decision::Finished  → cancel queue       │
//!              │ Decision::Abort     → cancel queue       │
//!              └───────────────────────────────────────────┘
//!                                        │
//!                         queue drained → Tally
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::device::{DeviceProvider, DeviceSlot};
use crate::exec::TestExecutor;
use crate::gate::LaunchGate;
use crate::queue::WorkQueue;
use crate::scheduler::{Decision, Scheduler, Tally};
use crate::sink::SinkHandle;
use crate::worker::{WorkerContext, WorkerUnit};

/// Drives one complete test run.
pub struct TestRun<P> {
    config: Config,
    provider: P,
    executor: Arc<dyn TestExecutor>,
    sink: SinkHandle,
}

impl<P: DeviceProvider> TestRun<P> {
    /// Creates a run over the given collaborators.
    pub fn new(
        config: Config,
        provider: P,
        executor: Arc<dyn TestExecutor>,
        sink: SinkHandle,
    ) -> Self {
        Self {
            config,
            provider,
            executor,
            sink,
        }
    }

    /// Runs `universe` to completion and returns the final tally.
    ///
    /// # Errors
    ///
    /// Only infrastructure failures (no devices could be provisioned, bad
    /// configuration) surface as errors; test failures are data in the
    /// returned [`Tally`].
    pub async fn run(&self, universe: &[String]) -> Result<Tally> {
        let start = Instant::now();

        if universe.is_empty() {
            warn!("No tests to run");
            let scheduler = self.scheduler(Vec::new(), 1)?;
            return Ok(scheduler.tally(start.elapsed()));
        }

        // Clear leftovers from a previous run before provisioning.
        if let Err(e) = self.provider.kill_and_delete_all().await {
            warn!("Pre-run device cleanup failed: {e}");
        }

        let devices = self
            .provider
            .reset_and_create_devices()
            .await
            .context("Failed to provision devices")?;

        let mut slots: Vec<DeviceSlot> = Vec::new();
        for (family, instances) in &devices {
            for device in instances {
                info!(
                    "Created {} : {} ( {} )",
                    family, device.name, device.instance_id
                );
                slots.push(DeviceSlot {
                    family: family.clone(),
                    name: device.name.clone(),
                    instance_id: device.instance_id.clone(),
                });
            }
        }
        if slots.is_empty() {
            bail!("No devices available");
        }

        info!(
            "Distributing {} tests across {} slots",
            universe.len(),
            slots.len()
        );

        let queue = WorkQueue::new();
        let token = queue.cancellation_token();
        let scheduler = Arc::new(
            Scheduler::new(
                universe.to_vec(),
                slots.len(),
                &self.config.scatter,
                token.clone(),
                self.sink.clone(),
            )
            .context("Failed to build scheduler")?,
        );

        let ctx = WorkerContext {
            scheduler: scheduler.clone(),
            executor: self.executor.clone(),
            gate: Arc::new(LaunchGate::new(self.config.scatter.launch_timeout())),
            sink: self.sink.clone(),
            idle_timeout: self.config.scatter.idle_timeout(),
            token: token.clone(),
        };

        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
        let mut attempts: HashMap<String, u32> = HashMap::new();
        let mut live_units = 0usize;

        for slot in &slots {
            queue.spawn(WorkerUnit::new(slot.clone(), 0, ctx.clone()).run(reports_tx.clone()));
            live_units += 1;
        }

        // Every unit sends exactly one report; the loop ends when the last
        // live unit has reported and no retry was enqueued for it.
        while live_units > 0 {
            let Some(report) = reports_rx.recv().await else {
                break;
            };
            live_units -= 1;

            match scheduler.record_completion(&report) {
                Decision::Finished => {
                    let (done, total) = scheduler.progress();
                    info!("All {} of {} tests confirmed; stopping", done, total);
                    queue.cancel();
                }
                Decision::Abort(reason) => {
                    error!("Aborting run: {}", reason);
                    queue.cancel();
                }
                Decision::Ignored => {}
                Decision::Continue => {
                    if token.is_cancelled() {
                        continue;
                    }
                    let (done, total) = scheduler.progress();
                    info!(slot = %report.slot.name, "{}/{} tests confirmed", done, total);

                    // Exchange the slot's device for a fresh instance, then
                    // keep the slot busy with a new unit.
                    let instance_id = match self.provider.reset_device(&report.slot).await {
                        Ok(Some(id)) => id,
                        Ok(None) => report.slot.instance_id.clone(),
                        Err(e) => {
                            warn!(slot = %report.slot.name, "device reset failed: {e}");
                            report.slot.instance_id.clone()
                        }
                    };
                    let slot = report.slot.with_instance(instance_id);
                    let attempt = attempts.entry(slot.name.clone()).or_insert(0);
                    *attempt += 1;
                    queue.spawn(
                        WorkerUnit::new(slot, *attempt, ctx.clone()).run(reports_tx.clone()),
                    );
                    live_units += 1;
                }
            }
        }

        queue.wait().await;

        // Shut down and delete every provisioned device.
        if let Err(e) = self.provider.kill_and_delete_all().await {
            warn!("Post-run device teardown failed: {e}");
        }

        Ok(scheduler.tally(start.elapsed()))
    }

    fn scheduler(&self, universe: Vec<String>, slot_count: usize) -> Result<Scheduler> {
        Scheduler::new(
            universe,
            slot_count,
            &self.config.scatter,
            tokio_util::sync::CancellationToken::new(),
            self.sink.clone(),
        )
        .context("Failed to build scheduler")
    }
}
