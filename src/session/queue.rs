//! The song model and queue operations.
//!
//! Every mutation here takes the session's queue guard, persists
//! synchronously before reporting success, and rolls back to a
//! pre-mutation snapshot if the store refuses the write.

use super::{PlaybackState, Session};
use crate::{
    error::ControlResult,
    events::SessionEvent,
    mixer::Deck,
};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};
use url::Url;

/// One resolved, queueable track.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Song {
    /// Display title.
    pub title: String,
    /// Resolved media URL.
    pub url: String,
    /// Thumbnail URL, when the resolver provided one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    /// Whether this is a live stream without a fixed duration.
    #[serde(default)]
    pub is_live: bool,
    /// Track length in seconds (zero for live streams).
    pub duration: u32,
    /// ID of the user who requested the track.
    pub requester: String,
}

impl Song {
    /// Stable identity key: the extracted video ID where the URL has
    /// one, otherwise the exact URL.
    #[must_use]
    pub fn track_key(&self) -> String {
        if let Ok(parsed) = Url::parse(&self.url) {
            match parsed.host_str() {
                Some(host) if host.ends_with("youtube.com") => {
                    if let Some((_, id)) = parsed.query_pairs().find(|(k, _)| k == "v") {
                        return id.into_owned();
                    }
                },
                Some(host) if host.ends_with("youtu.be") => {
                    if let Some(id) = parsed.path_segments().and_then(|mut segs| segs.next()) {
                        if !id.is_empty() {
                            return id.to_string();
                        }
                    }
                },
                _ => {},
            }
        }

        self.url.clone()
    }

    /// Whether two entries refer to the same underlying track.
    #[must_use]
    pub fn same_track(&self, other: &Song) -> bool {
        self.track_key() == other.track_key()
    }
}

/// Pre-mutation snapshot used for rollback on persistence failure.
pub(crate) struct QueueSnapshot {
    songs: Vec<Song>,
    play_index: usize,
    history: VecDeque<Song>,
    next_deck_loaded: Option<String>,
    next_deck_target: Option<Deck>,
}

impl PlaybackState {
    pub(crate) fn queue_snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            songs: self.songs.clone(),
            play_index: self.play_index,
            history: self.history.clone(),
            next_deck_loaded: self.next_deck_loaded.clone(),
            next_deck_target: self.next_deck_target,
        }
    }

    pub(crate) fn restore_queue(&mut self, snap: QueueSnapshot) {
        self.songs = snap.songs;
        self.play_index = snap.play_index;
        self.history = snap.history;
        self.next_deck_loaded = snap.next_deck_loaded;
        self.next_deck_target = snap.next_deck_target;
    }
}

impl Session {
    /// Appends songs to the queue.
    ///
    /// A queue sitting in its finished state is cleared first. Appending
    /// stops at the configured queue cap; the number actually added is
    /// returned.
    pub async fn enqueue(&self, songs: Vec<Song>) -> ControlResult<usize> {
        let _guard = self.inner.queue_guard.lock().await;

        let (snap, added) = {
            let mut state = self.state();
            let snap = state.queue_snapshot();

            if state.queue_finished() {
                debug!("Clearing finished queue before enqueue.");
                state.songs.clear();
                state.play_index = 0;
            }

            let room = self.inner.config.max_queue_size.saturating_sub(state.songs.len());
            let added = songs.len().min(room);
            if added < songs.len() {
                warn!("Queue cap reached, dropping {} song(s).", songs.len() - added);
            }

            state.songs.extend(songs.into_iter().take(added));
            (snap, added)
        };

        if let Err(e) = self.persist_queue().await {
            self.state().restore_queue(snap);
            return Err(e.into());
        }

        self.inner.version.bump("enqueue", format!("added={}", added));
        self.emit(SessionEvent::QueueUpdated {
            guild_id: self.inner.guild_id,
        });

        Ok(added)
    }

    /// Inserts a song at `index`, shifting the playing index when the
    /// insertion lands at or before it.
    pub async fn insert_at(&self, song: Song, index: usize) -> ControlResult<()> {
        let _guard = self.inner.queue_guard.lock().await;

        let snap = {
            let mut state = self.state();
            if index > state.songs.len() {
                return Err(crate::error::ControlError::InvalidIndex(index));
            }
            if state.songs.len() >= self.inner.config.max_queue_size {
                warn!("Queue cap reached, refusing insert.");
                return Err(crate::error::ControlError::QueueFull);
            }

            let snap = state.queue_snapshot();
            let was_empty = state.songs.is_empty();
            state.songs.insert(index, song);
            if !was_empty && index <= state.play_index {
                state.play_index += 1;
            }
            snap
        };

        if let Err(e) = self.persist_queue().await {
            self.state().restore_queue(snap);
            return Err(e.into());
        }

        self.inner.version.bump("insert", format!("index={}", index));
        self.emit(SessionEvent::QueueUpdated {
            guild_id: self.inner.guild_id,
        });

        Ok(())
    }

    /// Removes the song at `index`, adjusting the playing index and
    /// invalidating the preload when it pointed at the removed URL.
    pub async fn remove_at(&self, index: usize) -> ControlResult<Song> {
        let _guard = self.inner.queue_guard.lock().await;

        let (snap, removed) = {
            let mut state = self.state();
            if index >= state.songs.len() {
                return Err(crate::error::ControlError::InvalidIndex(index));
            }

            let snap = state.queue_snapshot();
            let removed = state.songs.remove(index);

            if index < state.play_index {
                state.play_index -= 1;
            } else if index == state.play_index && !state.songs.is_empty() {
                state.play_index = state.play_index.min(state.songs.len() - 1);
            } else if state.songs.is_empty() {
                state.play_index = 0;
            }

            if state.next_deck_loaded.as_deref() == Some(removed.url.as_str()) {
                if let Some(deck) = state.next_deck_target {
                    self.inner.deck_flags.clear(deck);
                }
                state.invalidate_preload();
            }

            (snap, removed)
        };

        if let Err(e) = self.persist_queue().await {
            self.state().restore_queue(snap);
            return Err(e.into());
        }

        self.inner.version.bump("remove", format!("index={}", index));
        self.emit(SessionEvent::QueueUpdated {
            guild_id: self.inner.guild_id,
        });

        Ok(removed)
    }

    /// Shuffles everything after the current song (Fisher–Yates) and
    /// invalidates the preload.
    pub(crate) async fn shuffle_upcoming(&self) -> ControlResult<()> {
        let _guard = self.inner.queue_guard.lock().await;

        let snap = {
            let mut state = self.state();
            let snap = state.queue_snapshot();

            let start = state.play_index + 1;
            if start < state.songs.len() {
                state.songs[start..].shuffle(&mut rand::thread_rng());
            }

            if let Some(deck) = state.next_deck_target {
                self.inner.deck_flags.clear(deck);
            }
            state.invalidate_preload();
            snap
        };

        if let Err(e) = self.persist_queue().await {
            self.state().restore_queue(snap);
            return Err(e.into());
        }

        self.inner.version.bump("shuffle", "upcoming");
        self.emit(SessionEvent::QueueUpdated {
            guild_id: self.inner.guild_id,
        });

        Ok(())
    }

    /// Drops every queued song except the current one.
    pub async fn clear_queue_except_current(&self) -> ControlResult<()> {
        let _guard = self.inner.queue_guard.lock().await;

        let snap = {
            let mut state = self.state();
            let snap = state.queue_snapshot();

            if !state.songs.is_empty() {
                let current = state.songs[state.play_index.min(state.songs.len() - 1)].clone();
                state.songs = vec![current];
                state.play_index = 0;
            }

            if let Some(deck) = state.next_deck_target {
                self.inner.deck_flags.clear(deck);
            }
            state.invalidate_preload();
            snap
        };

        if let Err(e) = self.persist_queue().await {
            self.state().restore_queue(snap);
            return Err(e.into());
        }

        self.inner.version.bump("clear", "kept current");
        self.emit(SessionEvent::QueueUpdated {
            guild_id: self.inner.guild_id,
        });

        Ok(())
    }
}
