//! Per-session serialiser for user-visible audio operations.
//!
//! Skip, previous, select, pause-toggle, shuffle, and mixer restarts all
//! pass through here: strict FIFO, one executing at a time, a minimum
//! spacing between completions, and a per-operation timeout that fails
//! the operation without poisoning the barrier.

use crate::error::{ControlError, ControlResult};
use parking_lot::Mutex;
use std::{
    future::Future,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

#[derive(Debug)]
pub(crate) struct OperationBarrier {
    // Tokio's mutex hands the gate out in FIFO order, which is exactly
    // the queueing discipline wanted here.
    gate: tokio::sync::Mutex<()>,
    last_completion: Mutex<Option<Instant>>,
    min_throttle: Duration,
    timeout: Duration,
}

impl OperationBarrier {
    pub(crate) fn new(min_throttle: Duration, timeout: Duration) -> Self {
        Self {
            gate: tokio::sync::Mutex::new(()),
            last_completion: Mutex::new(None),
            min_throttle,
            timeout,
        }
    }

    /// Runs one named operation through the barrier.
    ///
    /// Submissions inside the throttle window are rejected synchronously
    /// as [`ControlError::Throttled`] without being queued.
    pub(crate) async fn run<T, F>(&self, name: &'static str, body: F) -> ControlResult<T>
    where
        F: Future<Output = ControlResult<T>>,
    {
        {
            let last = self.last_completion.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.min_throttle {
                    debug!("Operation {} throttled.", name);
                    return Err(ControlError::Throttled);
                }
            }
        }

        let _guard = self.gate.lock().await;

        let res = match tokio::time::timeout(self.timeout, body).await {
            Ok(res) => res,
            Err(_) => {
                warn!("Operation {} exceeded the barrier timeout.", name);
                Err(ControlError::OperationTimeout)
            },
        };

        *self.last_completion.lock() = Some(Instant::now());

        if let Err(e) = &res {
            debug!("Operation {} failed: {}.", name, e);
        }

        res
    }
}
