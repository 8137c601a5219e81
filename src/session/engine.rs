//! Preload timers and sidecar event routing.
//!
//! Every sidecar event lands here (already tagged with its mixer
//! generation by the reader task) and becomes one match arm. Stale
//! generations are discarded before any arm runs.

use super::{Session, SessionMessage};
use crate::{
    constants::STREAM_ERROR_LIMIT,
    events::SessionEvent,
    mixer::{CommandOptions, MixerCommand, MixerEvent},
};
use std::time::Instant;
use tracing::{debug, trace, warn};

impl Session {
    /// Called at every transition commit: the new song is definitively
    /// running.
    pub(crate) fn on_song_start(&self) {
        {
            let mut state = self.state();
            state.is_crossfading = false;
        }

        self.arm_preload_timer();
    }

    /// (Re)schedules the single preload timer.
    pub(crate) fn arm_preload_timer(&self) {
        let mut timer = self.inner.preload.lock();

        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }
        timer.generation += 1;

        let generation = timer.generation;
        let delay = self.inner.config.preload_delay;
        let tx = self.inner.msg_tx.clone();
        timer.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            drop(tx.send(SessionMessage::Preload(generation)));
        }));
    }

    /// Cancels any pending preload timer.
    pub(crate) fn clear_preload_timer(&self) {
        let mut timer = self.inner.preload.lock();
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }
        timer.generation += 1;
    }

    pub(crate) async fn preload_fire(&self, generation: u64) {
        if self.inner.preload.lock().generation != generation {
            trace!("Stale preload timer fired, ignoring.");
            return;
        }

        self.preload_next_song().await;
    }

    /// Loads the next song onto the idle deck without playing it.
    pub(crate) async fn preload_next_song(&self) {
        let snapshot = {
            let state = self.state();

            if state.is_paused {
                return;
            }
            let next = match state.next_song() {
                Some(next) => next.clone(),
                None => return,
            };
            if state
                .current_song()
                .map_or(false, |current| current.same_track(&next))
            {
                return;
            }
            if state.next_deck_loaded.as_deref() == Some(next.url.as_str()) {
                return;
            }
            if state.crossfade_active(self.inner.config.crossfade) {
                debug!("Preload suppressed inside the crossfade window.");
                return;
            }

            (
                state.play_index,
                state.songs.len(),
                next.url.clone(),
                state.current_deck.other(),
            )
        };
        let (play_index, queue_len, next_url, target_deck) = snapshot;

        debug!("Preloading {} onto deck {}.", next_url, target_deck);
        self.inner.deck_flags.clear(target_deck);

        let load = MixerCommand::Load {
            url: next_url.clone(),
            deck: target_deck,
            autoplay: false,
        };
        let opts = CommandOptions::default()
            .timeout(self.inner.config.buffer_wait)
            .retries(1);
        if let Err(e) = self.inner.commands.submit(load, opts).await {
            warn!("Preload load command failed: {}.", e);
            return;
        }

        {
            let mut state = self.state();

            // The queue may have shifted while the command was in
            // flight; a stale preload is worse than none.
            let still_valid = state.play_index == play_index
                && state.songs.len() == queue_len
                && state.next_song().map(|s| s.url.as_str()) == Some(next_url.as_str());
            if !still_valid {
                debug!("Queue changed during preload, discarding.");
                state.invalidate_preload();
                return;
            }

            state.next_deck_loaded = Some(next_url);
            state.next_deck_target = Some(target_deck);
        }

        self.inner.version.bump("preload", format!("deck={}", target_deck));
    }

    /// Routes one sidecar event, discarding those from prior mixer
    /// generations.
    pub(crate) async fn handle_mixer_event(&self, generation: u64, event: MixerEvent) {
        {
            let state = self.state();
            if state.mixer_generation != generation {
                trace!(
                    "Dropping event from mixer generation {} (current {}): {:?}.",
                    generation,
                    state.mixer_generation,
                    event
                );
                return;
            }
        }

        match event {
            MixerEvent::BufferReady(deck) => {
                // The readiness flag was already set by the reader task.
                self.inner.version.bump("buffer_ready", format!("deck={}", deck));
            },
            MixerEvent::CrossfadeStarted => {
                trace!("Sidecar confirmed crossfade start.");
            },
            MixerEvent::ApproachingEnd => self.handle_approaching_end().await,
            MixerEvent::End => self.handle_end().await,
            MixerEvent::AutoEndSwitch(deck) => self.handle_auto_end_switch(deck).await,
            MixerEvent::AutoLoopRestart(deck) => {
                debug!("Sidecar restarted deck {} for loop mode.", deck);
                {
                    let mut state = self.state();
                    state.song_start = Some(Instant::now());
                }
                self.inner.stats.song_completed();
                self.inner.stats.song_started();
                self.inner.clock.start(&self.inner.stats, self.listeners());
                self.inner.version.bump("auto_loop_restart", format!("deck={}", deck));
                self.on_song_start();
            },
            MixerEvent::DeckChanged(deck) => {
                trace!("Audible deck is now {}.", deck);
            },
            MixerEvent::StreamError(message) => self.handle_stream_error(&message).await,
            MixerEvent::YtError(message) => {
                warn!("Extractor failure from sidecar: {}.", message);
            },
            MixerEvent::Error(message) => {
                warn!("Sidecar error: {}.", message);
            },
            MixerEvent::Chatter { .. } => {},
        }
    }

    /// 3 s before natural end: crossfade into the next song when fade is
    /// on, or clone the current URL to the idle deck when the queue is
    /// out, so the sidecar switches to the clone rather than cutting
    /// the tail off. Fade off with a next song queued: rely on `end`.
    async fn handle_approaching_end(&self) {
        let (fade_enabled, has_next, current_url, idle_deck) = {
            let state = self.state();
            (
                state.fade_enabled,
                state.next_song().is_some(),
                state.current_deck_loaded.clone(),
                state.current_deck.other(),
            )
        };

        if fade_enabled && has_next {
            if let Err(e) = self.auto_skip().await {
                warn!("Automatic crossfade near track end failed: {}.", e);
            }
            return;
        }

        if !has_next {
            if let Some(url) = current_url {
                debug!("No next song; cloning current track onto deck {}.", idle_deck);
                self.inner.deck_flags.clear(idle_deck);
                let load = MixerCommand::Load {
                    url,
                    deck: idle_deck,
                    autoplay: false,
                };
                if let Err(e) = self.inner.commands.submit(load, Default::default()).await {
                    warn!("Fallback clone load failed: {}.", e);
                }
            }
        }
    }

    async fn handle_end(&self) {
        if self.inner.locks.has_active_lock(&self.skip_lock_name()) {
            trace!("Track end during an active transition, ignoring.");
            return;
        }
        if self.state().current_deck_loaded.is_none() {
            trace!("Track end with nothing loaded, ignoring.");
            return;
        }

        if let Err(e) = self.auto_skip().await {
            warn!("Advancing after track end failed: {}.", e);
        }
    }

    /// The sidecar switched decks on its own; reconcile without
    /// commanding it.
    async fn handle_auto_end_switch(&self, new_deck: crate::mixer::Deck) {
        debug!("Sidecar auto-switched to deck {}.", new_deck);
        self.inner.stats.song_completed();

        let finished = {
            let state = self.state();
            state.play_index + 1 >= state.songs.len()
        };
        if finished {
            if let Err(e) = self.end_queue().await {
                warn!("Ending queue after auto switch failed: {}.", e);
            }
            return;
        }

        let (index, song) = {
            let mut state = self.state();

            if let Some(outgoing) = state.current_song().cloned() {
                if state.played_long_enough() {
                    state.remember(outgoing);
                }
            }

            state.play_index += 1;
            state.current_deck = new_deck;
            let song = state.songs[state.play_index].clone();
            state.current_deck_loaded = Some(song.url.clone());
            state.invalidate_preload();
            state.song_start = Some(Instant::now());

            (state.play_index, song)
        };

        self.inner.stats.song_started();
        self.inner.clock.start(&self.inner.stats, self.listeners());

        if let Err(e) = self.persist_queue().await {
            warn!("Persisting after auto switch failed: {}.", e);
        }

        self.inner.version.bump(
            "auto_end_switch",
            format!("index={} deck={}", index, new_deck),
        );
        self.emit(SessionEvent::QueueUpdated {
            guild_id: self.inner.guild_id,
        });
        self.emit(SessionEvent::TrackStarted {
            guild_id: self.inner.guild_id,
            index,
            song,
        });

        self.on_song_start();
    }

    /// Opus/stream failures: three strikes and the URL is remembered as
    /// unplayable, then skipped.
    async fn handle_stream_error(&self, message: &str) {
        if !message.to_ascii_lowercase().contains("opus") {
            warn!("Stream error from sidecar: {}.", message);
            return;
        }

        let tripped = {
            let mut state = self.state();
            match state.current_deck_loaded.clone() {
                Some(url) => {
                    let tripped = state.note_stream_error(&url, STREAM_ERROR_LIMIT);
                    tripped.then(|| url)
                },
                None => None,
            }
        };

        if let Some(url) = tripped {
            warn!("{} failed {} times; marking unplayable and skipping.", url, STREAM_ERROR_LIMIT);
            self.inner.version.bump("unplayable", url);

            if let Err(e) = self.auto_skip().await {
                warn!("Skipping an unplayable track failed: {}.", e);
            }
        }
    }
}
