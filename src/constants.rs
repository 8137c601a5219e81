//! Constants affecting playback-core timing and the mixer wire format.

use std::time::Duration;

/// Length of a deck-to-deck crossfade.
pub const CROSSFADE_MS: u64 = 6_000;

/// Type-converted length of a deck-to-deck crossfade.
pub const CROSSFADE: Duration = Duration::from_millis(CROSSFADE_MS);

/// Smallest crossfade duration the sidecar will accept; shorter requests
/// are clamped up before being written to the wire.
pub const MIN_CROSSFADE_MS: u64 = 6_000;

/// How far before a track's end the sidecar announces `approaching_end`.
pub const CROSSFADE_BUFFER_MS: u64 = 3_000;

/// Grace period before leaving a voice channel with no human listeners.
pub const DISCONNECT_TIMEOUT_MS: u64 = 60_000;

/// Debounce window for repeated voice-membership reconciliation.
pub const RECONCILE_WINDOW_MS: u64 = 5_000;

/// Minimum delay between consecutive mixer sidecar spawns.
pub const RESTART_COOLDOWN_MS: u64 = 5_000;

/// Play time below which a finished song is not recorded into history.
pub const MIN_SONG_PLAY_TIME_MS: u64 = 30_000;

/// Delay after a song starts before the next song is preloaded onto
/// the idle deck.
pub const PRELOAD_DELAY_MS: u64 = 5_000;

/// Millisecond-scale duplicate-trigger guard on skip entry points.
///
/// This is deliberately far below the barrier throttle: it exists to
/// absorb double-fired UI events and racing sidecar end signals.
pub const SKIP_THROTTLE_MS: u64 = 250;

/// Minimum spacing between user-visible audio operations.
pub const BARRIER_MIN_THROTTLE_MS: u64 = 2_000;

/// Upper bound on a single user-visible audio operation.
pub const BARRIER_TIMEOUT_MS: u64 = 15_000;

/// Default timeout for one queued sidecar command.
pub const CMD_TIMEOUT_MS: u64 = 10_000;

/// Upper bound on waiting for a cold-loaded deck to buffer.
pub const BUFFER_WAIT_MS: u64 = 8_000;

/// Polling period while waiting for a deck to buffer.
pub const BUFFER_POLL_MS: u64 = 50;

/// Repeated `buffer_ready` signals for one deck inside this window are
/// discarded.
pub const BUFFER_READY_DEDUPE_MS: u64 = 100;

/// Gap between the first `load` and its `play` so the sidecar can buffer
/// an initial chunk.
pub const INITIAL_LOAD_GAP_MS: u64 = 150;

/// Polling period while waiting for a freshly spawned sidecar to come up.
pub const MIXER_START_POLL_MS: u64 = 50;

/// Upper bound on waiting for a freshly spawned sidecar to come up.
pub const MIXER_START_WAIT_MS: u64 = 5_000;

/// Hard expiry on the per-guild skip lock, so a crashed holder cannot
/// wedge the session.
pub const SKIP_LOCK_EXPIRY_MS: u64 = 30_000;

/// Recovery attempts after a mixer crash before the session gives up and
/// schedules a disconnect.
pub const CRASH_ATTEMPT_CAP: u32 = 2;

/// Stream/Opus errors tolerated for one URL before it is marked
/// unplayable and skipped.
pub const STREAM_ERROR_LIMIT: u32 = 3;

/// Hard cap on queued songs per guild.
pub const MAX_QUEUE_SIZE: usize = 1_000;

/// Bounded length of the per-guild play history.
pub const HISTORY_LIMIT: usize = 50;

/// Number of state-version entries retained for debugging.
pub const VERSION_LOG_LIMIT: usize = 50;

/// Sample rate of the PCM stream produced by the mixer sidecar.
pub const SAMPLE_RATE_RAW: usize = 48_000;

/// Number of audio frames the voice sender consumes per second.
pub const AUDIO_FRAME_RATE: usize = 50;

/// Bytes in one 20 ms frame of interleaved stereo signed-16-bit PCM.
pub const STEREO_FRAME_BYTE_SIZE: usize = SAMPLE_RATE_RAW / AUDIO_FRAME_RATE * 2 * 2;

/// Frames of mixed audio buffered between sidecar stdout and the voice
/// sender. Kept at two frames (40 ms) so deck switches reach listeners
/// with minimal perceptual latency.
pub const STDOUT_BUFFER_FRAMES: usize = 2;
