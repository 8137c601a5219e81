use crate::constants::*;
use std::{path::PathBuf, time::Duration};

/// Configuration for sessions and their mixer sidecars.
///
/// Defaults mirror the constants in [`constants`]; builder methods exist
/// mainly so embedding bots (and tests) can tighten the timing envelope.
///
/// [`constants`]: crate::constants
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Config {
    /// Program spawned as the per-guild audio mixer sidecar.
    pub mixer_command: String,
    /// Extra arguments handed to the sidecar on spawn.
    pub mixer_args: Vec<String>,
    /// Length of a deck-to-deck crossfade.
    ///
    /// Values below the sidecar minimum are clamped on the wire.
    pub crossfade: Duration,
    /// Delay after a song starts before the idle deck is preloaded.
    pub preload_delay: Duration,
    /// Duplicate-trigger guard on skip entry points.
    pub skip_throttle: Duration,
    /// Minimum spacing between user-visible audio operations.
    pub barrier_throttle: Duration,
    /// Upper bound on one user-visible audio operation.
    pub barrier_timeout: Duration,
    /// Default timeout for one queued sidecar command.
    pub command_timeout: Duration,
    /// Upper bound on waiting for a cold-loaded deck to buffer.
    pub buffer_wait: Duration,
    /// Polling period while waiting for a deck to buffer.
    pub buffer_poll: Duration,
    /// Minimum delay between consecutive sidecar spawns.
    pub restart_cooldown: Duration,
    /// Gap between the initial `load` and its `play`.
    pub initial_load_gap: Duration,
    /// Upper bound on waiting for a freshly spawned sidecar.
    pub mixer_start_wait: Duration,
    /// Hard expiry on the per-guild skip lock.
    pub skip_lock_expiry: Duration,
    /// Grace period before disconnecting from an empty voice channel.
    pub disconnect_timeout: Duration,
    /// Recovery attempts after a mixer crash before giving up.
    pub crash_attempt_cap: u32,
    /// Hard cap on queued songs per guild.
    pub max_queue_size: usize,
    /// Location of the queue-backup JSON file, if persistence is wanted.
    pub queue_backup_path: Option<PathBuf>,
    /// Location of the listening-stats JSON file, if persistence is wanted.
    pub stats_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mixer_command: "lyrebird-mixer".into(),
            mixer_args: Vec::new(),
            crossfade: CROSSFADE,
            preload_delay: Duration::from_millis(PRELOAD_DELAY_MS),
            skip_throttle: Duration::from_millis(SKIP_THROTTLE_MS),
            barrier_throttle: Duration::from_millis(BARRIER_MIN_THROTTLE_MS),
            barrier_timeout: Duration::from_millis(BARRIER_TIMEOUT_MS),
            command_timeout: Duration::from_millis(CMD_TIMEOUT_MS),
            buffer_wait: Duration::from_millis(BUFFER_WAIT_MS),
            buffer_poll: Duration::from_millis(BUFFER_POLL_MS),
            restart_cooldown: Duration::from_millis(RESTART_COOLDOWN_MS),
            initial_load_gap: Duration::from_millis(INITIAL_LOAD_GAP_MS),
            mixer_start_wait: Duration::from_millis(MIXER_START_WAIT_MS),
            skip_lock_expiry: Duration::from_millis(SKIP_LOCK_EXPIRY_MS),
            disconnect_timeout: Duration::from_millis(DISCONNECT_TIMEOUT_MS),
            crash_attempt_cap: CRASH_ATTEMPT_CAP,
            max_queue_size: MAX_QUEUE_SIZE,
            queue_backup_path: None,
            stats_path: None,
        }
    }
}

impl Config {
    /// Sets the program spawned as the mixer sidecar.
    #[must_use]
    pub fn mixer_command(mut self, mixer_command: impl Into<String>) -> Self {
        self.mixer_command = mixer_command.into();
        self
    }

    /// Sets the extra arguments handed to the sidecar on spawn.
    #[must_use]
    pub fn mixer_args(mut self, mixer_args: Vec<String>) -> Self {
        self.mixer_args = mixer_args;
        self
    }

    /// Sets this `Config`'s crossfade length.
    #[must_use]
    pub fn crossfade(mut self, crossfade: Duration) -> Self {
        self.crossfade = crossfade;
        self
    }

    /// Sets the delay before the idle deck is preloaded.
    #[must_use]
    pub fn preload_delay(mut self, preload_delay: Duration) -> Self {
        self.preload_delay = preload_delay;
        self
    }

    /// Sets the duplicate-trigger guard on skip entry points.
    #[must_use]
    pub fn skip_throttle(mut self, skip_throttle: Duration) -> Self {
        self.skip_throttle = skip_throttle;
        self
    }

    /// Sets the minimum spacing between user-visible operations.
    #[must_use]
    pub fn barrier_throttle(mut self, barrier_throttle: Duration) -> Self {
        self.barrier_throttle = barrier_throttle;
        self
    }

    /// Sets the upper bound on one user-visible operation.
    #[must_use]
    pub fn barrier_timeout(mut self, barrier_timeout: Duration) -> Self {
        self.barrier_timeout = barrier_timeout;
        self
    }

    /// Sets the default timeout for one queued sidecar command.
    #[must_use]
    pub fn command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    /// Sets the upper bound on waiting for a cold-loaded deck.
    #[must_use]
    pub fn buffer_wait(mut self, buffer_wait: Duration) -> Self {
        self.buffer_wait = buffer_wait;
        self
    }

    /// Sets the polling period while waiting for a deck to buffer.
    #[must_use]
    pub fn buffer_poll(mut self, buffer_poll: Duration) -> Self {
        self.buffer_poll = buffer_poll;
        self
    }

    /// Sets the minimum delay between consecutive sidecar spawns.
    #[must_use]
    pub fn restart_cooldown(mut self, restart_cooldown: Duration) -> Self {
        self.restart_cooldown = restart_cooldown;
        self
    }

    /// Sets the gap between the initial `load` and its `play`.
    #[must_use]
    pub fn initial_load_gap(mut self, initial_load_gap: Duration) -> Self {
        self.initial_load_gap = initial_load_gap;
        self
    }

    /// Sets the hard expiry on the per-guild skip lock.
    #[must_use]
    pub fn skip_lock_expiry(mut self, skip_lock_expiry: Duration) -> Self {
        self.skip_lock_expiry = skip_lock_expiry;
        self
    }

    /// Sets the grace period before leaving an empty voice channel.
    #[must_use]
    pub fn disconnect_timeout(mut self, disconnect_timeout: Duration) -> Self {
        self.disconnect_timeout = disconnect_timeout;
        self
    }

    /// Sets the recovery attempt cap after a mixer crash.
    #[must_use]
    pub fn crash_attempt_cap(mut self, crash_attempt_cap: u32) -> Self {
        self.crash_attempt_cap = crash_attempt_cap;
        self
    }

    /// Sets the hard cap on queued songs per guild.
    #[must_use]
    pub fn max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Sets the location of the queue-backup JSON file.
    #[must_use]
    pub fn queue_backup_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.queue_backup_path = Some(path.into());
        self
    }

    /// Sets the location of the listening-stats JSON file.
    #[must_use]
    pub fn stats_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.stats_path = Some(path.into());
        self
    }
}
