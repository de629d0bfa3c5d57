//! Launch gate: serialized device startup.
//!
//! Booting a device is resource-contended; launching several at once is
//! slower than launching them one after another. The gate admits one worker
//! unit into its startup phase at a time. The unit releases the gate by
//! signalling readiness (first sign of real test output); if it never does,
//! a watchdog releases the gate on its behalf after the launch timeout and
//! the unit keeps running.
//!
//! The gate is advisory concurrency control, not a correctness boundary:
//! if every unit times out the run degrades to fully parallel launches
//! rather than deadlocking.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Admits one worker unit at a time into its startup phase.
pub struct LaunchGate {
    sem: Arc<Semaphore>,
    launch_timeout: Duration,
}

impl LaunchGate {
    /// Creates a gate with the given launch timeout.
    pub fn new(launch_timeout: Duration) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(1)),
            launch_timeout,
        }
    }

    /// Waits for admission and returns the unit's ready signal.
    ///
    /// The returned [`ReadySignal`] holds the gate until
    /// [`signal_ready`](ReadySignal::signal_ready) is called or the launch
    /// timeout elapses, whichever comes first.
    pub async fn admit(&self, slot_name: &str) -> ReadySignal {
        let permit = match self.sem.clone().acquire_owned().await {
            Ok(permit) => Some(permit),
            // The semaphore is never closed; if it somehow is, fail open.
            Err(_) => None,
        };
        debug!(slot = slot_name, "admitted into launch phase");

        let signal = ReadySignal {
            inner: Arc::new(Mutex::new(permit)),
        };

        let watchdog = signal.clone();
        let slot = slot_name.to_string();
        let timeout = self.launch_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if watchdog.signal_ready() {
                warn!(
                    slot = %slot,
                    "no readiness signal within {:?}; releasing launch gate",
                    timeout
                );
            }
        });

        signal
    }
}

/// Releases the launch gate once the unit's environment is ready.
///
/// Cloneable so the gate's watchdog and the worker can race to release;
/// only the first caller actually releases.
#[derive(Clone)]
pub struct ReadySignal {
    inner: Arc<Mutex<Option<OwnedSemaphorePermit>>>,
}

impl ReadySignal {
    /// Signals that the environment is ready, releasing the gate.
    ///
    /// Idempotent; returns `true` only for the call that performed the
    /// release.
    pub fn signal_ready(&self) -> bool {
        let mut permit = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        permit.take().is_some()
    }
}
