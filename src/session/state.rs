//! Mutable per-guild playback state.

use super::queue::Song;
use crate::{
    constants::{HISTORY_LIMIT, MIN_SONG_PLAY_TIME_MS},
    mixer::Deck,
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::{Duration, Instant},
};

/// The single mutable record behind a session.
///
/// Mutations happen either on the session's own event-loop task or under
/// the skip lock / operation barrier; readers snapshot the fields they
/// need and re-verify before committing decisions made on them.
#[derive(Debug)]
pub(crate) struct PlaybackState {
    /// Ordered queue. Never mutated while a skip transition is in flight.
    pub songs: Vec<Song>,
    /// Index of the currently playing song. Mutated only at commit.
    pub play_index: usize,
    /// Most-recent-first record of completed songs.
    pub history: VecDeque<Song>,
    /// The audible deck.
    pub current_deck: Deck,
    /// URL playing on the current deck, if any.
    pub current_deck_loaded: Option<String>,
    /// URL preloaded onto the idle deck, if any.
    pub next_deck_loaded: Option<String>,
    /// Which deck holds the preload. Always the complement of
    /// `current_deck` when `next_deck_loaded` is some.
    pub next_deck_target: Option<Deck>,
    pub is_paused: bool,
    pub loop_enabled: bool,
    pub fade_enabled: bool,
    /// Set while a crossfade command is believed active; gates
    /// conflicting operations together with `crossfade_start`.
    pub is_crossfading: bool,
    pub crossfade_start: Option<Instant>,
    pub song_start: Option<Instant>,
    pub pause_start: Option<Instant>,
    pub last_transition: Option<Instant>,
    /// True when this state came from the backup file and no mixer has
    /// been spawned yet.
    pub session_restored: bool,
    /// Suppresses crash recovery when the core itself kills the mixer.
    pub intentional_kill: bool,
    /// Generation of the current mixer instance; events tagged with an
    /// older generation are stale.
    pub mixer_generation: u64,
    pub crash_attempts: u32,
    pub last_mixer_start: Option<Instant>,
    /// URLs that exceeded the stream-error budget.
    pub failed_urls: HashSet<String>,
    /// Stream-error counts per URL.
    pub stream_errors: HashMap<String, u32>,
    /// Opaque dashboard anchors carried for the UI layer.
    pub dashboard_message_id: Option<String>,
    pub text_channel_id: Option<String>,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            songs: Vec::new(),
            play_index: 0,
            history: VecDeque::new(),
            current_deck: Deck::A,
            current_deck_loaded: None,
            next_deck_loaded: None,
            next_deck_target: None,
            is_paused: false,
            loop_enabled: false,
            fade_enabled: false,
            is_crossfading: false,
            crossfade_start: None,
            song_start: None,
            pause_start: None,
            last_transition: None,
            session_restored: false,
            intentional_kill: false,
            mixer_generation: 0,
            crash_attempts: 0,
            last_mixer_start: None,
            failed_urls: HashSet::new(),
            stream_errors: HashMap::new(),
            dashboard_message_id: None,
            text_channel_id: None,
        }
    }
}

impl PlaybackState {
    pub(crate) fn current_song(&self) -> Option<&Song> {
        self.songs.get(self.play_index)
    }

    pub(crate) fn next_song(&self) -> Option<&Song> {
        self.songs.get(self.play_index + 1)
    }

    /// Whether a crossfade blocks transitions and preloads right now:
    /// either the flag is still set, or one started inside `window`.
    pub(crate) fn crossfade_active(&self, window: Duration) -> bool {
        self.is_crossfading
            || self
                .crossfade_start
                .map_or(false, |start| start.elapsed() < window)
    }

    /// Whether the queue sits in its finished state: nothing loaded and
    /// only the historical last track retained.
    pub(crate) fn queue_finished(&self) -> bool {
        self.current_deck_loaded.is_none()
            && self.songs.len() == 1
            && self
                .history
                .front()
                .map_or(false, |last| last.same_track(&self.songs[0]))
    }

    /// Drops any record of a preloaded deck.
    pub(crate) fn invalidate_preload(&mut self) {
        self.next_deck_loaded = None;
        self.next_deck_target = None;
    }

    /// Whether the current song has been audible long enough to be
    /// worth recording in history.
    pub(crate) fn played_long_enough(&self) -> bool {
        self.song_start
            .map_or(false, |at| at.elapsed() >= Duration::from_millis(MIN_SONG_PLAY_TIME_MS))
    }

    /// Pushes a completed song onto the bounded history.
    pub(crate) fn remember(&mut self, song: Song) {
        self.history.retain(|s| !s.same_track(&song));
        self.history.push_front(song);
        self.history.truncate(HISTORY_LIMIT);
    }

    /// Records a stream failure for `url`; returns `true` once the URL
    /// crosses the unplayable threshold for the first time.
    pub(crate) fn note_stream_error(&mut self, url: &str, limit: u32) -> bool {
        let count = self.stream_errors.entry(url.to_string()).or_insert(0);
        *count += 1;

        if *count >= limit && !self.failed_urls.contains(url) {
            self.failed_urls.insert(url.to_string());
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::queue::Song;

    fn song(url: &str) -> Song {
        Song {
            title: url.to_string(),
            url: url.to_string(),
            thumbnail: None,
            is_live: false,
            duration: 180,
            requester: "tester".into(),
        }
    }

    #[test]
    fn crossfade_window_gates_after_flag_clears() {
        let mut state = PlaybackState::default();
        state.crossfade_start = Some(Instant::now());
        state.is_crossfading = false;

        assert!(state.crossfade_active(Duration::from_secs(6)));
        assert!(!state.crossfade_active(Duration::ZERO));
    }

    #[test]
    fn finished_state_requires_history_match() {
        let mut state = PlaybackState::default();
        state.songs = vec![song("a")];

        assert!(!state.queue_finished());

        state.remember(song("a"));
        assert!(state.queue_finished());

        state.current_deck_loaded = Some("a".into());
        assert!(!state.queue_finished());
    }

    #[test]
    fn history_is_bounded_and_deduplicated() {
        let mut state = PlaybackState::default();
        for i in 0..(HISTORY_LIMIT + 10) {
            state.remember(song(&format!("u{}", i)));
        }
        state.remember(song("u5"));

        assert_eq!(state.history.len(), HISTORY_LIMIT);
        assert_eq!(state.history.front().unwrap().url, "u5");
        assert_eq!(
            state.history.iter().filter(|s| s.url == "u5").count(),
            1
        );
    }

    #[test]
    fn stream_errors_trip_once_at_the_limit() {
        let mut state = PlaybackState::default();

        assert!(!state.note_stream_error("u", 3));
        assert!(!state.note_stream_error("u", 3));
        assert!(state.note_stream_error("u", 3));
        assert!(!state.note_stream_error("u", 3));
        assert!(state.failed_urls.contains("u"));
    }
}
