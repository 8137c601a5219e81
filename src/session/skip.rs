//! The skip/crossfade transition state machine.
//!
//! A transition moves playback from the current deck to its complement:
//! preload check, (cold) load, buffer wait, `skip_to`/`crossfade`, then an
//! atomic commit of queue indices and deck assignment. The per-guild skip
//! lock makes the whole sequence exclusive across its suspension points;
//! the lock guard releases on every exit path.

use super::Session;
use crate::{
    error::{ControlError, ControlResult},
    events::SessionEvent,
    mixer::{CommandOptions, Deck, MixerCommand},
    session::queue::Song,
};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Why a transition was requested.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SkipReason {
    Manual,
    ManualPrev,
    ManualSelect,
    Auto,
}

impl SkipReason {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            SkipReason::Manual => "manual",
            SkipReason::ManualPrev => "manual-prev",
            SkipReason::ManualSelect => "manual-select",
            SkipReason::Auto => "auto",
        }
    }
}

impl Session {
    pub(crate) fn skip_lock_name(&self) -> String {
        format!("skip_{}", self.inner.guild_id)
    }

    /// Millisecond-scale duplicate-trigger guard, independent of the
    /// barrier's spacing throttle.
    pub(crate) fn check_skip_throttle(&self) -> ControlResult<()> {
        let mut last = self.inner.skip_throttle.lock();
        if let Some(at) = *last {
            if at.elapsed() < self.inner.config.skip_throttle {
                return Err(ControlError::Throttled);
            }
        }
        *last = Some(Instant::now());
        Ok(())
    }

    /// Drives one transition to `target_index`.
    #[instrument(skip(self), fields(guild = %self.inner.guild_id))]
    pub(crate) async fn transition_to(&self, target_index: usize, reason: SkipReason) -> ControlResult<()> {
        self.live_mixer()?;

        {
            let state = self.state();
            if state.crossfade_active(self.inner.config.crossfade) {
                return Err(ControlError::CrossfadeInProgress);
            }
        }

        let _skip = self
            .inner
            .locks
            .acquire(&self.skip_lock_name(), self.inner.config.skip_lock_expiry)
            .ok_or(ControlError::SkipInProgress)?;

        let (target, target_deck, fade, preloaded) = {
            let state = self.state();
            let target = state
                .songs
                .get(target_index)
                .cloned()
                .ok_or(ControlError::InvalidIndex(target_index))?;
            let target_deck = state.current_deck.other();
            let preloaded = state.next_deck_loaded.as_deref() == Some(target.url.as_str())
                && state.next_deck_target == Some(target_deck)
                && self.inner.deck_flags.is_ready(target_deck);

            (target, target_deck, state.fade_enabled, preloaded)
        };

        if preloaded {
            debug!("Fast path: {} already buffered on deck {}.", target.url, target_deck);
        } else {
            debug!("Cold load of {} onto deck {}.", target.url, target_deck);
            self.inner
                .commands
                .submit(MixerCommand::StopDeck { deck: target_deck }, Default::default())
                .await?;
            self.inner.deck_flags.clear(target_deck);
            self.inner
                .commands
                .submit(
                    MixerCommand::Load {
                        url: target.url.clone(),
                        deck: target_deck,
                        autoplay: false,
                    },
                    Default::default(),
                )
                .await?;

            self.wait_for_buffer(target_deck).await?;
        }

        if fade {
            {
                let mut state = self.state();
                state.is_crossfading = true;
                state.crossfade_start = Some(Instant::now());
            }

            let cmd = MixerCommand::crossfade(target_deck, self.inner.config.crossfade);
            if let Err(e) = self.inner.commands.submit(cmd, CommandOptions::high()).await {
                let mut state = self.state();
                state.is_crossfading = false;
                state.crossfade_start = None;
                return Err(e.into());
            }
        } else {
            self.inner
                .commands
                .submit(MixerCommand::SkipTo { target_deck }, CommandOptions::high())
                .await?;
        }

        self.commit_transition(target_index, target_deck, target, reason).await;
        Ok(())
    }

    /// Polls deck readiness after a cold load.
    async fn wait_for_buffer(&self, deck: Deck) -> ControlResult<()> {
        let started = Instant::now();

        loop {
            if self.inner.deck_flags.is_ready(deck) {
                return Ok(());
            }

            if started.elapsed() >= self.inner.config.buffer_wait {
                if self.live_mixer().is_err() {
                    return Err(ControlError::MixerDead);
                }

                // The sidecar holds the load as a pending switch and will
                // announce `auto_end_switch` once data arrives.
                warn!("Deck {} did not buffer in time; leaving the switch to the sidecar.", deck);
                return Err(ControlError::BufferTimeout);
            }

            tokio::time::sleep(self.inner.config.buffer_poll).await;
        }
    }

    /// The atomic commit shared by fast and cold paths. Runs under the
    /// skip lock.
    async fn commit_transition(&self, target_index: usize, target_deck: Deck, target: Song, reason: SkipReason) {
        let was_paused = {
            let mut state = self.state();

            if let Some(outgoing) = state.current_song().cloned() {
                if state.played_long_enough() {
                    state.remember(outgoing);
                }
            }

            state.play_index = target_index;
            state.current_deck = target_deck;
            state.current_deck_loaded = Some(target.url.clone());
            state.invalidate_preload();
            state.song_start = Some(Instant::now());
            state.last_transition = Some(Instant::now());

            state.is_paused
        };

        self.inner.stats.song_started();
        self.inner.clock.start(&self.inner.stats, self.listeners());

        if let Err(e) = self.persist_queue().await {
            // The transition is already audible; rolling back state here
            // would desync it from the mixer.
            warn!("Persisting after a transition failed: {}.", e);
        }

        self.inner.version.bump(
            "skip_complete",
            format!("index={} deck={} reason={}", target_index, target_deck, reason.as_str()),
        );

        self.emit(SessionEvent::QueueUpdated {
            guild_id: self.inner.guild_id,
        });
        self.emit(SessionEvent::TrackStarted {
            guild_id: self.inner.guild_id,
            index: target_index,
            song: target,
        });

        self.on_song_start();

        if was_paused {
            if let Err(e) = self.resume_if_paused().await {
                warn!("Unpausing after a transition failed: {}.", e);
            }
        }
    }

    /// Skip forward: loop restarts the current song, otherwise advance
    /// past known-unplayable URLs or end the queue.
    pub(crate) async fn skip_next_inner(&self, reason: SkipReason) -> ControlResult<()> {
        self.check_skip_throttle()?;

        let (loop_enabled, next_index) = {
            let state = self.state();
            let next = (state.play_index + 1..state.songs.len())
                .find(|&i| !state.failed_urls.contains(&state.songs[i].url));
            (state.loop_enabled, next)
        };

        if loop_enabled {
            return self.restart_current_song().await;
        }

        match next_index {
            Some(index) => self.transition_to(index, reason).await,
            None => self.end_queue().await,
        }
    }

    pub(crate) async fn skip_prev_inner(&self) -> ControlResult<()> {
        self.check_skip_throttle()?;

        let prev = {
            let state = self.state();
            state.play_index.checked_sub(1)
        };

        match prev {
            Some(index) => self.transition_to(index, SkipReason::ManualPrev).await,
            None => Ok(()),
        }
    }

    pub(crate) async fn skip_to_index_inner(&self, index: usize) -> ControlResult<()> {
        self.check_skip_throttle()?;

        {
            let state = self.state();
            if index >= state.songs.len() {
                return Err(ControlError::InvalidIndex(index));
            }
        }

        self.transition_to(index, SkipReason::ManualSelect).await
    }

    /// Automatic advance at (or near) a track's natural end.
    pub(crate) async fn auto_skip(&self) -> ControlResult<()> {
        self.inner.stats.song_completed();
        self.skip_next_inner(SkipReason::Auto).await
    }

    /// Ends playback, keeping only the last played song in the queue.
    #[instrument(skip(self), fields(guild = %self.inner.guild_id))]
    pub(crate) async fn end_queue(&self) -> ControlResult<()> {
        info!("Queue finished.");

        self.clear_preload_timer();
        self.inner.clock.flush(&self.inner.stats);

        {
            let mut state = self.state();

            if let Some(last) = state.current_song().cloned() {
                state.remember(last.clone());
                state.songs = vec![last];
            } else {
                state.songs.clear();
            }
            state.play_index = 0;
            state.current_deck_loaded = None;
            state.invalidate_preload();
            state.is_crossfading = false;
            state.crossfade_start = None;
            state.song_start = None;
            state.intentional_kill = true;
        }
        self.inner.deck_flags.clear_all();

        self.stop_mixer();

        if let Err(e) = self.persist_queue().await {
            warn!("Persisting the finished queue failed: {}.", e);
        }

        self.inner.version.bump("queue_end", "");
        self.emit(SessionEvent::QueueFinished {
            guild_id: self.inner.guild_id,
        });

        Ok(())
    }
}
