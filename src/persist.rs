//! Queue backup: JSON round-trip for resume-after-restart.
//!
//! One file holds every guild's backup, keyed by guild ID. A restored
//! entry never marks a deck as loaded; `currentDeckLoaded` survives only
//! so the "last played" history entry can be reconstructed.

use crate::{
    error::PersistResult,
    id::GuildId,
    session::Song,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Snapshot of one guild's restorable playback state.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBackup {
    /// The queue.
    pub songs: Vec<Song>,
    /// Play history, most recent first.
    pub history: Vec<Song>,
    /// Index of the current song.
    pub play_index: usize,
    /// User toggles.
    pub is_paused: bool,
    /// User toggles.
    pub loop_enabled: bool,
    /// User toggles.
    pub fade_enabled: bool,
    /// URL that was audible at snapshot time. Informational only after a
    /// restart: nothing is "loaded" until playback begins again.
    pub current_deck_loaded: Option<String>,
    /// Opaque dashboard anchor.
    pub dashboard_message_id: Option<String>,
    /// Opaque dashboard anchor.
    pub text_channel_id: Option<String>,
}

impl SessionBackup {
    /// Whether this entry carries nothing worth keeping on disk.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.songs.is_empty() && self.history.is_empty()
    }
}

/// File-backed store for [`SessionBackup`]s.
#[derive(Debug)]
pub struct QueueStore {
    path: PathBuf,
    // Whole-file read-modify-write; one writer at a time.
    guard: tokio::sync::Mutex<()>,
}

impl QueueStore {
    /// Creates a store over the given file path. The file is created on
    /// first save.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            guard: tokio::sync::Mutex::new(()),
        }
    }

    /// Writes (or, for empty/`None` snapshots, deletes) one guild's
    /// entry.
    pub async fn save(&self, guild_id: GuildId, backup: Option<SessionBackup>) -> PersistResult<()> {
        let _guard = self.guard.lock().await;

        let mut all = self.read_file().await?;
        let key = guild_id.to_string();

        match backup {
            Some(backup) if !backup.is_empty() => {
                all.insert(key, backup);
            },
            _ => {
                all.remove(&key);
            },
        }

        let json = serde_json::to_vec_pretty(&all)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;

        debug!("Queue backup written ({} entries).", all.len());
        Ok(())
    }

    /// Loads every stored entry.
    pub async fn load_all(&self) -> PersistResult<HashMap<GuildId, SessionBackup>> {
        let _guard = self.guard.lock().await;
        let raw = self.read_file().await?;

        let mut out = HashMap::with_capacity(raw.len());
        for (key, backup) in raw {
            match GuildId::from_str_key(&key) {
                Some(id) => {
                    out.insert(id, backup);
                },
                None => warn!("Skipping backup entry with bad guild key {:?}.", key),
            }
        }

        Ok(out)
    }

    /// Loads one guild's entry, if present.
    pub async fn load(&self, guild_id: GuildId) -> PersistResult<Option<SessionBackup>> {
        let _guard = self.guard.lock().await;
        let mut raw = self.read_file().await?;
        Ok(raw.remove(&guild_id.to_string()))
    }

    async fn read_file(&self) -> PersistResult<HashMap<String, SessionBackup>> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU64;

    fn guild(n: u64) -> GuildId {
        GuildId(NonZeroU64::new(n).unwrap())
    }

    fn song(url: &str) -> Song {
        Song {
            title: format!("title {}", url),
            url: url.to_string(),
            thumbnail: Some(format!("{}/thumb", url)),
            is_live: false,
            duration: 240,
            requester: "77".into(),
        }
    }

    fn backup() -> SessionBackup {
        SessionBackup {
            songs: vec![song("a"), song("b")],
            history: vec![song("z")],
            play_index: 1,
            is_paused: true,
            loop_enabled: false,
            fade_enabled: true,
            current_deck_loaded: Some("b".into()),
            dashboard_message_id: Some("123".into()),
            text_channel_id: Some("456".into()),
        }
    }

    #[tokio::test]
    #[ntest::timeout(10_000)]
    async fn round_trip_preserves_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path().join("queues.json"));

        store.save(guild(1), Some(backup())).await.unwrap();
        let loaded = store.load(guild(1)).await.unwrap().unwrap();

        assert_eq!(loaded, backup());
    }

    #[tokio::test]
    #[ntest::timeout(10_000)]
    async fn empty_entries_are_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path().join("queues.json"));

        store.save(guild(1), Some(backup())).await.unwrap();

        let empty = SessionBackup {
            songs: Vec::new(),
            history: Vec::new(),
            play_index: 0,
            is_paused: false,
            loop_enabled: false,
            fade_enabled: false,
            current_deck_loaded: None,
            dashboard_message_id: None,
            text_channel_id: None,
        };
        store.save(guild(1), Some(empty)).await.unwrap();

        assert!(store.load(guild(1)).await.unwrap().is_none());
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ntest::timeout(10_000)]
    async fn entries_use_the_documented_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queues.json");
        let store = QueueStore::new(path.clone());

        store.save(guild(9), Some(backup())).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        for field in [
            "\"songs\"",
            "\"history\"",
            "\"playIndex\"",
            "\"isPaused\"",
            "\"loopEnabled\"",
            "\"fadeEnabled\"",
            "\"currentDeckLoaded\"",
            "\"dashboardMessageId\"",
            "\"textChannelId\"",
            "\"isLive\"",
            "\"requester\"",
            "\"duration\"",
        ] {
            assert!(raw.contains(field), "missing {} in {}", field, raw);
        }
    }

    #[tokio::test]
    #[ntest::timeout(10_000)]
    async fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path().join("nope.json"));

        assert!(store.load_all().await.unwrap().is_empty());
    }
}
