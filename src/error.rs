//! Playback-core error handling.
//!
//! Errors here are *values surfaced to callers*, not panics: user-recoverable
//! rejections (throttles, concurrency gates) come back on the operation that
//! hit them, while infrastructure failures (mixer death, persistence) are
//! logged with session context and escalate to crash recovery or rollback.

use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
    io::Error as IoError,
    sync::Arc,
};

pub use crate::{mixer::MixerError, voice::GatewayError};

/// Error returned when a playback control operation cannot proceed.
///
/// Unless otherwise stated, these don't invalidate the session; they
/// advise on why this particular operation was refused.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ControlError {
    /// The operation arrived inside the barrier's minimum spacing window
    /// and was rejected without being queued.
    Throttled,
    /// The operation's body exceeded the barrier timeout. The barrier
    /// itself remains healthy.
    OperationTimeout,
    /// A crossfade is running (or finished too recently); transitions and
    /// preloads must not start yet.
    CrossfadeInProgress,
    /// Another skip transition holds the per-guild skip lock.
    SkipInProgress,
    /// A cold-loaded deck did not signal readiness in time. Tolerable:
    /// the sidecar completes the pending switch once data arrives.
    BufferTimeout,
    /// The mixer sidecar is absent or no longer alive.
    MixerDead,
    /// The queue holds no playable song for this operation.
    EmptyQueue,
    /// The queue is at its configured size cap.
    QueueFull,
    /// The supplied queue index is out of range.
    InvalidIndex(usize),
    /// The session was torn down while this operation was pending.
    Finished,
    /// A mixer lifecycle failure (spawn, cooldown, command I/O).
    Mixer(MixerError),
    /// The backing store rejected the mutation; state was rolled back.
    Persist(PersistError),
    /// The voice gateway collaborator refused the request.
    Gateway(GatewayError),
}

impl Display for ControlError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "playback operation failed: ")?;
        match self {
            ControlError::Throttled => write!(f, "submitted too soon after the previous operation"),
            ControlError::OperationTimeout => write!(f, "operation timed out"),
            ControlError::CrossfadeInProgress => write!(f, "a crossfade is in progress"),
            ControlError::SkipInProgress => write!(f, "another skip is in progress"),
            ControlError::BufferTimeout => write!(f, "target deck did not buffer in time"),
            ControlError::MixerDead => write!(f, "mixer sidecar is not running"),
            ControlError::EmptyQueue => write!(f, "queue is empty"),
            ControlError::QueueFull => write!(f, "queue is full"),
            ControlError::InvalidIndex(i) => write!(f, "queue index {} is out of range", i),
            ControlError::Finished => write!(f, "session was torn down"),
            ControlError::Mixer(e) => write!(f, "mixer failure: {}", e),
            ControlError::Persist(e) => write!(f, "persistence failure: {}", e),
            ControlError::Gateway(e) => write!(f, "gateway failure: {}", e),
        }
    }
}

impl Error for ControlError {}

impl From<MixerError> for ControlError {
    fn from(e: MixerError) -> Self {
        // A dead sidecar surfaces uniformly so callers have one branch
        // leading into crash recovery.
        match e {
            MixerError::Dead => ControlError::MixerDead,
            other => ControlError::Mixer(other),
        }
    }
}

impl From<PersistError> for ControlError {
    fn from(e: PersistError) -> Self {
        ControlError::Persist(e)
    }
}

impl From<GatewayError> for ControlError {
    fn from(e: GatewayError) -> Self {
        ControlError::Gateway(e)
    }
}

/// Convenience type for playback control results.
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors raised by the queue-backup and stats stores.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum PersistError {
    /// Reading or writing the backing file failed.
    Io(Arc<IoError>),
    /// The backing file held (or a snapshot produced) invalid JSON.
    Json(Arc<serde_json::Error>),
}

impl Display for PersistError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "store failure: ")?;
        match self {
            PersistError::Io(e) => write!(f, "i/o [{}]", e),
            PersistError::Json(e) => write!(f, "json [{}]", e),
        }
    }
}

impl Error for PersistError {}

impl From<IoError> for PersistError {
    fn from(e: IoError) -> Self {
        PersistError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(e: serde_json::Error) -> Self {
        PersistError::Json(Arc::new(e))
    }
}

/// Convenience type for store results.
pub type PersistResult<T> = Result<T, PersistError>;
