//! Scheduling and retry core.
//!
//! The [`Scheduler`] owns all shared mutable state of a run: which tests
//! are still pending, which are in flight, which are confirmed passed, and
//! how often each has failed. Every read and write of that state happens
//! inside a single critical section, so the final tally reflects a total
//! order over worker completions even though the completions themselves
//! are concurrent.
//!
//! # Batch selection
//!
//! A worker unit asks for its batch at the moment it starts, so the batch
//! reflects the freshest state:
//!
//! 1. Pending is cleaned of anything already succeeded or in flight.
//! 2. The batch size adapts: full-size batches while plenty of work
//!    remains, shrinking toward one test as the pool drains so several
//!    idle workers can share the tail instead of one worker hoarding it.
//! 3. Tests move from `pending` into `running` and form the batch.
//! 4. If pending is exhausted, the worker is topped up with tests that
//!    already failed elsewhere; this intentionally duplicates in-flight
//!    work so a straggling worker cannot block completion on its own.
//! 5. Failing that, a random sample of anything not yet confirmed passed.
//! 6. Identifiers matching the environment-failure marker are never
//!    selected; those name broken slots, not tests.
//! 7. An empty selection makes the worker idle briefly and retry, until
//!    the run settles or a generous spin bound gives up on the worker.
//!
//! # Retry policy
//!
//! Failed tests go back to the pool and their failure counts grow. A test
//! reaching the retry ceiling without ever passing aborts the entire run;
//! one permanently broken test means the verdict is already known, so
//! burning more device time is pointless.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use rand::seq::SliceRandom;
use rand::thread_rng;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ScatterConfig;
use crate::sink::SinkHandle;
use crate::worker::{WorkerReport, WorkerStatus};

/// Hard bound on consecutive empty selections before a worker gives up.
/// Only reachable when every remaining candidate is excluded by the
/// environment-failure marker; guarantees termination in that case.
const MAX_SELECTION_SPINS: u32 = 20_000;

/// Why a run was aborted before completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// A test reached the retry ceiling without ever passing.
    RetryCeiling { test: String, failures: u32 },
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::RetryCeiling { test, failures } => {
                write!(f, "test {} failed {} times", test, failures)
            }
        }
    }
}

/// What the run driver should do after folding one worker completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Every test has passed; cancel outstanding work and stop.
    Finished,
    /// The run is aborted; cancel outstanding work and stop.
    Abort(AbortReason),
    /// Re-provision the slot and enqueue a fresh unit on it.
    Continue,
    /// The report carried no schedulable outcome (cancelled or empty unit).
    Ignored,
}

/// Final accounting of a run.
#[derive(Debug, Clone)]
pub struct Tally {
    /// Size of the test universe.
    pub total: usize,

    /// Number of tests confirmed passed.
    pub succeeded: usize,

    /// Tests never confirmed passed, in universe order.
    pub missing: Vec<String>,

    /// Observed failure counts, most-failed first.
    pub failures: Vec<(String, u32)>,

    /// Set when the run was aborted rather than drained.
    pub aborted: Option<AbortReason>,

    /// Wall-clock duration of the run.
    pub duration: Duration,
}

impl Tally {
    /// Returns `true` iff every test in the universe passed.
    pub fn passed(&self) -> bool {
        self.missing.is_empty()
    }

    /// Process exit code: 0 iff passed, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.passed() { 0 } else { 1 }
    }
}

/// Shared mutable state, only ever touched under the lock.
struct SchedState {
    pending: VecDeque<String>,
    running: HashSet<String>,
    succeeded: HashSet<String>,
    failure_counts: HashMap<String, u32>,
    aborted: Option<AbortReason>,
}

/// The scheduling and retry engine.
pub struct Scheduler {
    universe: Vec<String>,
    universe_set: HashSet<String>,
    slot_count: usize,
    max_batch_size: usize,
    top_up_size: usize,
    retry_ceiling: u32,
    poll_interval: Duration,
    marker: Regex,
    token: CancellationToken,
    sink: SinkHandle,
    state: Mutex<SchedState>,
}

impl Scheduler {
    /// Creates a scheduler over the given test universe.
    ///
    /// The universe is deduplicated preserving order; `pending` starts as
    /// the full universe.
    pub fn new(
        universe: Vec<String>,
        slot_count: usize,
        config: &ScatterConfig,
        token: CancellationToken,
        sink: SinkHandle,
    ) -> anyhow::Result<Self> {
        let marker =
            Regex::new(&config.env_failure_pattern).context("invalid env_failure_pattern")?;

        let mut seen = HashSet::new();
        let universe: Vec<String> = universe.into_iter().filter(|t| seen.insert(t.clone())).collect();
        let universe_set: HashSet<String> = universe.iter().cloned().collect();
        let pending: VecDeque<String> = universe.iter().cloned().collect();

        Ok(Self {
            universe,
            universe_set,
            slot_count: slot_count.max(1),
            max_batch_size: config.max_batch_size.max(1),
            top_up_size: config.top_up_size.max(1),
            retry_ceiling: config.retry_ceiling.max(1),
            poll_interval: config.poll_interval(),
            marker,
            token,
            sink,
            state: Mutex::new(SchedState {
                pending,
                running: HashSet::new(),
                succeeded: HashSet::new(),
                failure_counts: HashMap::new(),
                aborted: None,
            }),
        })
    }

    /// Returns `(confirmed passed, universe size)`.
    pub fn progress(&self) -> (usize, usize) {
        let s = self.lock();
        (s.succeeded.len(), self.universe.len())
    }

    /// Hands out the next batch for a starting worker unit.
    ///
    /// Idles and retries while no work is assignable; returns `None` once
    /// the run has settled (fully succeeded, aborted, or cancelled), which
    /// tells the unit to finish empty.
    pub async fn next_batch(&self) -> Option<Vec<String>> {
        let mut spins: u32 = 0;
        loop {
            if self.token.is_cancelled() {
                return None;
            }
            {
                let mut s = self.lock();
                if s.aborted.is_some() || self.fully_succeeded(&s.succeeded) {
                    return None;
                }
                let batch = self.select_locked(&mut s);
                if !batch.is_empty() {
                    debug!(size = batch.len(), "selected batch");
                    return Some(batch);
                }
            }
            spins += 1;
            if spins >= MAX_SELECTION_SPINS {
                warn!("no assignable work after {} selection attempts; giving up on this worker", spins);
                return None;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Folds one worker completion into the shared state and decides what
    /// the driver does next.
    pub fn record_completion(&self, report: &WorkerReport) -> Decision {
        let mut s = self.lock();

        let attempted: Vec<&String> = report
            .attempted
            .iter()
            .filter(|t| !self.marker.is_match(t))
            .collect();

        for test in &attempted {
            s.running.remove(*test);
        }

        for test in &report.succeeded {
            if self.universe_set.contains(test) && !self.marker.is_match(test) {
                s.succeeded.insert(test.clone());
            }
        }

        // Anything attempted but still unconfirmed goes back to the pool.
        for test in &attempted {
            if !s.succeeded.contains(*test)
                && !s.running.contains(*test)
                && !s.pending.contains(*test)
            {
                s.pending.push_back((*test).clone());
            }
        }

        match report.status {
            WorkerStatus::Stopped => return Decision::Ignored,
            WorkerStatus::Success => {}
            WorkerStatus::Failed => {
                for test in report.failed.iter().filter(|t| !self.marker.is_match(t)) {
                    if s.succeeded.contains(test) {
                        continue;
                    }
                    let count = {
                        let entry = s.failure_counts.entry(test.clone()).or_insert(0);
                        *entry += 1;
                        *entry
                    };
                    self.sink.line(
                        Some(&report.slot.name),
                        format!("Test {} failure number {}", test, count),
                    );
                    if count >= self.retry_ceiling && s.aborted.is_none() {
                        self.sink.line(
                            Some(&report.slot.name),
                            format!(
                                "\n***************Test {} failed too many times. Aborting remaining tests.***************\n",
                                test
                            ),
                        );
                        s.aborted = Some(AbortReason::RetryCeiling {
                            test: test.clone(),
                            failures: count,
                        });
                    }
                }
            }
        }

        if self.fully_succeeded(&s.succeeded) {
            Decision::Finished
        } else if let Some(reason) = &s.aborted {
            Decision::Abort(reason.clone())
        } else {
            Decision::Continue
        }
    }

    /// Computes the final accounting once the work queue has drained.
    pub fn tally(&self, duration: Duration) -> Tally {
        let s = self.lock();

        let missing: Vec<String> = self
            .universe
            .iter()
            .filter(|t| !s.succeeded.contains(*t))
            .cloned()
            .collect();

        let mut failures: Vec<(String, u32)> = s
            .failure_counts
            .iter()
            .map(|(test, count)| (test.clone(), *count))
            .collect();
        failures.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        Tally {
            total: self.universe.len(),
            succeeded: self.universe.len() - missing.len(),
            missing,
            failures,
            aborted: s.aborted.clone(),
            duration,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn fully_succeeded(&self, succeeded: &HashSet<String>) -> bool {
        self.universe_set.iter().all(|t| succeeded.contains(t))
    }

    /// Full-size batches while at least a full batch remains; below that
    /// the tail is split across slots so idle workers share it.
    fn batch_size(&self, pending_len: usize) -> usize {
        if pending_len >= self.max_batch_size {
            self.max_batch_size
        } else {
            pending_len
                .div_ceil(self.slot_count)
                .clamp(1, self.max_batch_size)
        }
    }

    fn select_locked(&self, s: &mut SchedState) -> Vec<String> {
        // Defensive cleanup: drop duplicates and anything already
        // succeeded or in flight.
        {
            let SchedState {
                pending,
                running,
                succeeded,
                ..
            } = s;
            let mut seen = HashSet::new();
            pending.retain(|t| {
                seen.insert(t.clone()) && !succeeded.contains(t) && !running.contains(t)
            });
        }

        let size = self.batch_size(s.pending.len());
        let mut batch: Vec<String> = Vec::new();
        while batch.len() < size {
            let Some(test) = s.pending.pop_front() else {
                break;
            };
            if self.marker.is_match(&test) {
                continue;
            }
            s.running.insert(test.clone());
            batch.push(test);
        }

        // Top up from previously failed tests. This may hand out tests
        // that are in flight elsewhere; duplicating stragglers is what
        // keeps idle workers useful at the tail of a run.
        if batch.is_empty() {
            let mut candidates: Vec<String> = s
                .failure_counts
                .keys()
                .filter(|t| !s.succeeded.contains(*t) && !self.marker.is_match(t))
                .cloned()
                .collect();
            candidates.shuffle(&mut thread_rng());
            for test in candidates.into_iter().take(self.top_up_size) {
                s.running.insert(test.clone());
                batch.push(test);
            }
        }

        // Last resort: sample anything not yet confirmed passed.
        if batch.is_empty() {
            let mut candidates: Vec<String> = self
                .universe
                .iter()
                .filter(|t| !s.succeeded.contains(*t) && !self.marker.is_match(t))
                .cloned()
                .collect();
            candidates.shuffle(&mut thread_rng());
            for test in candidates.into_iter().take(self.top_up_size) {
                s.running.insert(test.clone());
                batch.push(test);
            }
        }

        let mut unique = HashSet::new();
        batch.retain(|t| unique.insert(t.clone()));
        batch
    }
}
