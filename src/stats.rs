//! Listening-time statistics bound to playback transitions.
//!
//! Per-user listening milliseconds accumulate in memory and are flushed
//! to disk on disconnect and shutdown. Global song counters bump at
//! transition commits.

use crate::{
    error::PersistResult,
    id::UserId,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::PathBuf,
    time::{Instant, SystemTime, UNIX_EPOCH},
};
use tokio::fs;
use tracing::{debug, trace};

/// Per-user counters.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    /// Total audible milliseconds while present in the voice channel.
    #[serde(default)]
    pub listening_time_ms: u64,
    /// Tracks this user added to the shared server playlist.
    #[serde(default)]
    pub server_playlist_adds: u64,
    /// Tracks this user added to a personal playlist.
    #[serde(default)]
    pub personal_playlist_adds: u64,
}

/// Global counters.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    /// Transition commits.
    #[serde(default)]
    pub songs_started: u64,
    /// Tracks that reached (or were skipped past) their end.
    #[serde(default)]
    pub songs_completed: u64,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsFile {
    users: HashMap<String, UserStats>,
    global: GlobalStats,
    last_updated: Option<u64>,
}

/// Process-wide statistics registry.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    inner: Mutex<StatsFile>,
    path: Option<PathBuf>,
}

impl StatsRegistry {
    /// Creates a registry, file-backed when a path is configured.
    #[must_use]
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(StatsFile::default()),
            path,
        }
    }

    /// Loads previously flushed counters, if the backing file exists.
    pub async fn load(&self) -> PersistResult<()> {
        let path = match &self.path {
            Some(path) => path.clone(),
            None => return Ok(()),
        };

        match fs::read(&path).await {
            Ok(bytes) => {
                let file: StatsFile = serde_json::from_slice(&bytes)?;
                *self.inner.lock() = file;
                Ok(())
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn song_started(&self) {
        self.inner.lock().global.songs_started += 1;
    }

    pub(crate) fn song_completed(&self) {
        self.inner.lock().global.songs_completed += 1;
    }

    /// Credits a playlist addition to `user`.
    pub fn playlist_add(&self, user: UserId, personal: bool) {
        let mut inner = self.inner.lock();
        let entry = inner.users.entry(user.to_string()).or_default();
        if personal {
            entry.personal_playlist_adds += 1;
        } else {
            entry.server_playlist_adds += 1;
        }
    }

    pub(crate) fn add_listening(&self, users: &[UserId], ms: u64) {
        if ms == 0 || users.is_empty() {
            return;
        }

        let mut inner = self.inner.lock();
        for user in users {
            inner.users.entry(user.to_string()).or_default().listening_time_ms += ms;
        }
        trace!("Credited {} ms to {} listener(s).", ms, users.len());
    }

    /// Current global counters.
    #[must_use]
    pub fn global(&self) -> GlobalStats {
        self.inner.lock().global
    }

    /// Counters for one user, if any were recorded.
    #[must_use]
    pub fn user(&self, user: UserId) -> Option<UserStats> {
        self.inner.lock().users.get(&user.to_string()).cloned()
    }

    /// Writes the registry to its backing file, if one is configured.
    pub async fn flush(&self) -> PersistResult<()> {
        let path = match &self.path {
            Some(path) => path.clone(),
            None => return Ok(()),
        };

        let json = {
            let mut inner = self.inner.lock();
            inner.last_updated = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .ok()
                .map(|d| d.as_secs());
            serde_json::to_vec_pretty(&*inner)?
        };

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        debug!("Stats flushed.");
        Ok(())
    }
}

/// Per-session clock crediting listening time to whoever is present.
///
/// The clock runs from song start, pauses with playback, and drains its
/// accumulated segment into the registry on flush (transition, crash,
/// disconnect, shutdown).
#[derive(Debug, Default)]
pub(crate) struct ListenerClock {
    inner: Mutex<ClockInner>,
}

#[derive(Debug, Default)]
struct ClockInner {
    running_since: Option<Instant>,
    listeners: Vec<UserId>,
}

impl ListenerClock {
    /// Starts (or restarts) the clock for the given listeners.
    pub(crate) fn start(&self, registry: &StatsRegistry, listeners: Vec<UserId>) {
        let mut inner = self.inner.lock();
        drain(&mut inner, registry);
        inner.listeners = listeners;
        inner.running_since = Some(Instant::now());
    }

    /// Stops the clock without crediting anything new afterwards.
    pub(crate) fn pause(&self, registry: &StatsRegistry) {
        let mut inner = self.inner.lock();
        drain(&mut inner, registry);
        inner.running_since = None;
    }

    /// Resumes a paused clock with the same listener set.
    pub(crate) fn resume(&self) {
        let mut inner = self.inner.lock();
        if inner.running_since.is_none() {
            inner.running_since = Some(Instant::now());
        }
    }

    /// Swaps the listener set, crediting the elapsed segment to the old
    /// one first.
    pub(crate) fn update_listeners(&self, registry: &StatsRegistry, listeners: Vec<UserId>) {
        let mut inner = self.inner.lock();
        let was_running = inner.running_since.is_some();
        drain(&mut inner, registry);
        inner.listeners = listeners;
        if was_running {
            inner.running_since = Some(Instant::now());
        }
    }

    /// Credits the current segment and stops the clock.
    pub(crate) fn flush(&self, registry: &StatsRegistry) {
        self.pause(registry);
    }
}

fn drain(inner: &mut ClockInner, registry: &StatsRegistry) {
    if let Some(since) = inner.running_since.take() {
        let ms = since.elapsed().as_millis() as u64;
        registry.add_listening(&inner.listeners, ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU64;
    use std::time::Duration;

    fn user(n: u64) -> UserId {
        UserId(NonZeroU64::new(n).unwrap())
    }

    #[test]
    fn playlist_adds_split_by_kind() {
        let registry = StatsRegistry::new(None);

        registry.playlist_add(user(1), false);
        registry.playlist_add(user(1), false);
        registry.playlist_add(user(1), true);

        let stats = registry.user(user(1)).unwrap();
        assert_eq!(stats.server_playlist_adds, 2);
        assert_eq!(stats.personal_playlist_adds, 1);
    }

    #[tokio::test]
    #[ntest::timeout(10_000)]
    async fn listener_clock_credits_elapsed_segments() {
        let registry = StatsRegistry::new(None);
        let clock = ListenerClock::default();

        clock.start(&registry, vec![user(1), user(2)]);
        tokio::time::sleep(Duration::from_millis(30)).await;
        clock.flush(&registry);

        let a = registry.user(user(1)).unwrap().listening_time_ms;
        let b = registry.user(user(2)).unwrap().listening_time_ms;
        assert!(a >= 20, "a = {}", a);
        assert_eq!(a, b);

        // A second flush with no running clock credits nothing further.
        clock.flush(&registry);
        assert_eq!(registry.user(user(1)).unwrap().listening_time_ms, a);
    }

    #[tokio::test]
    #[ntest::timeout(10_000)]
    async fn flush_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");

        let registry = StatsRegistry::new(Some(path.clone()));
        registry.song_started();
        registry.song_started();
        registry.song_completed();
        registry.add_listening(&[user(5)], 1234);
        registry.flush().await.unwrap();

        let reloaded = StatsRegistry::new(Some(path));
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.global().songs_started, 2);
        assert_eq!(reloaded.global().songs_completed, 1);
        assert_eq!(reloaded.user(user(5)).unwrap().listening_time_ms, 1234);

        let raw = std::fs::read_to_string(dir.path().join("stats.json")).unwrap();
        assert!(raw.contains("\"listeningTimeMs\""));
        assert!(raw.contains("\"songsStarted\""));
        assert!(raw.contains("\"lastUpdated\""));
    }
}
