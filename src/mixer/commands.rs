//! Per-session FIFO serialiser for sidecar commands.
//!
//! This queue protects against concurrent *sidecar commands*; the
//! operation barrier in the session protects against concurrent user
//! *intents*. Commands execute one at a time in submission order, except
//! that high-priority submissions move to the front of the pending list
//! (never past the command currently on the wire).

use super::{MixerCommand, MixerError, MixerResult, MixerSlot};
use crate::constants::CMD_TIMEOUT_MS;
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{spawn, time::timeout};
use tracing::{debug, trace, warn};

/// Scheduling class for one submission.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Priority {
    /// Appended to the back of the pending list.
    Normal,
    /// Enqueued at the front of the pending list.
    High,
}

/// Per-submission options.
#[derive(Clone, Copy, Debug)]
pub struct CommandOptions {
    /// Scheduling class.
    pub priority: Priority,
    /// Upper bound on this command's execution.
    pub timeout: Duration,
    /// Times a timed-out command is re-queued at the front before its
    /// submitter sees the failure.
    pub retries: u8,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            timeout: Duration::from_millis(CMD_TIMEOUT_MS),
            retries: 0,
        }
    }
}

impl CommandOptions {
    /// Options for the final switch command of a transition.
    #[must_use]
    pub fn high() -> Self {
        Self {
            priority: Priority::High,
            ..Default::default()
        }
    }

    /// Sets this submission's timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets this submission's retry budget.
    #[must_use]
    pub fn retries(mut self, retries: u8) -> Self {
        self.retries = retries;
        self
    }
}

/// Live counters for observability.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueStats {
    /// Commands accepted into the queue.
    pub submitted: u64,
    /// Commands acknowledged by the sidecar pipe.
    pub succeeded: u64,
    /// Commands rejected (dead mixer, timeout after retries, teardown).
    pub failed: u64,
    total_wait: Duration,
}

impl QueueStats {
    /// Mean time submissions spent queued before executing.
    #[must_use]
    pub fn average_wait(&self) -> Duration {
        let completed = self.succeeded + self.failed;
        if completed == 0 {
            Duration::ZERO
        } else {
            self.total_wait / completed as u32
        }
    }
}

struct Submission {
    cmd: MixerCommand,
    opts: CommandOptions,
    submitted_at: Instant,
    done: Sender<MixerResult<()>>,
}

enum QueueMessage {
    Run(Submission),
    Poison,
}

/// FIFO command queue bound to a session's mixer slot.
#[derive(Clone)]
pub struct CommandQueue {
    tx: Sender<QueueMessage>,
    stats: Arc<Mutex<QueueStats>>,
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue").field("stats", &self.stats()).finish()
    }
}

impl CommandQueue {
    /// Creates the queue and its worker task over the given mixer slot.
    pub(crate) fn new(slot: MixerSlot) -> Self {
        let (tx, rx) = flume::unbounded();
        let stats = Arc::new(Mutex::new(QueueStats::default()));

        let worker_stats = Arc::clone(&stats);
        spawn(async move {
            trace!("Command queue worker started.");
            runner(rx, slot, worker_stats).await;
            trace!("Command queue worker finished.");
        });

        Self { tx, stats }
    }

    /// Submits one command and waits for its completion.
    ///
    /// Fails fast with [`MixerError::Dead`] when no live sidecar exists at
    /// execution time.
    pub async fn submit(&self, cmd: MixerCommand, opts: CommandOptions) -> MixerResult<()> {
        self.stats.lock().submitted += 1;

        let (done, done_rx) = flume::bounded(1);
        let submission = Submission {
            cmd,
            opts,
            submitted_at: Instant::now(),
            done,
        };

        self.tx
            .send(QueueMessage::Run(submission))
            .map_err(|_| MixerError::Terminated)?;

        done_rx.recv_async().await.map_err(|_| MixerError::Terminated)?
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        *self.stats.lock()
    }

    /// Tears the queue down, rejecting everything still pending.
    pub(crate) fn close(&self) {
        drop(self.tx.send(QueueMessage::Poison));
    }
}

async fn runner(rx: Receiver<QueueMessage>, slot: MixerSlot, stats: Arc<Mutex<QueueStats>>) {
    let mut pending: VecDeque<Submission> = VecDeque::new();
    let mut poisoned = false;

    'outer: loop {
        // Pull in every submission that arrived while the previous
        // command was on the wire, so priority ordering sees them all.
        loop {
            match rx.try_recv() {
                Ok(QueueMessage::Run(sub)) => enqueue(&mut pending, sub),
                Ok(QueueMessage::Poison) => {
                    poisoned = true;
                    break 'outer;
                },
                Err(_) => break,
            }
        }

        let mut sub = match pending.pop_front() {
            Some(sub) => sub,
            None => match rx.recv_async().await {
                Ok(QueueMessage::Run(sub)) => {
                    enqueue(&mut pending, sub);
                    continue;
                },
                Ok(QueueMessage::Poison) => {
                    poisoned = true;
                    break;
                },
                Err(_) => break,
            },
        };

        let mixer = slot.lock().as_ref().map(Arc::clone);
        let mixer = match mixer {
            Some(m) if m.is_alive() => m,
            _ => {
                debug!("Rejecting {:?}: no live mixer.", sub.cmd);
                finish(&stats, &sub, Err(MixerError::Dead));
                continue;
            },
        };

        match timeout(sub.opts.timeout, mixer.write(&sub.cmd)).await {
            Ok(res) => finish(&stats, &sub, res),
            Err(_) if sub.opts.retries > 0 => {
                warn!("Command {:?} timed out, re-queuing at front.", sub.cmd);
                sub.opts.retries -= 1;
                pending.push_front(sub);
            },
            Err(_) => {
                warn!("Command {:?} timed out.", sub.cmd);
                finish(&stats, &sub, Err(MixerError::CommandTimeout));
            },
        }
    }

    if poisoned {
        // Session teardown: drain the channel so late submitters also see
        // the rejection rather than hanging.
        while let Ok(msg) = rx.try_recv() {
            if let QueueMessage::Run(sub) = msg {
                pending.push_back(sub);
            }
        }
    }

    for sub in pending.drain(..) {
        finish(&stats, &sub, Err(MixerError::Terminated));
    }
}

fn enqueue(pending: &mut VecDeque<Submission>, sub: Submission) {
    match sub.opts.priority {
        Priority::High => pending.push_front(sub),
        Priority::Normal => pending.push_back(sub),
    }
}

fn finish(stats: &Mutex<QueueStats>, sub: &Submission, res: MixerResult<()>) {
    {
        let mut stats = stats.lock();
        match &res {
            Ok(()) => stats.succeeded += 1,
            Err(_) => stats.failed += 1,
        }
        stats.total_wait += sub.submitted_at.elapsed();
    }

    drop(sub.done.send(res));
}
