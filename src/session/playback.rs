//! The playback facade: starting songs, replaying, pause/resume, and
//! mixer crash recovery.

use super::{Session, SessionMessage};
use crate::{
    error::{ControlError, ControlResult},
    events::SessionEvent,
    mixer::{CommandOptions, CrashReason, MixerCommand, MixerController, MixerError},
    voice::ConnectionState,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, trace, warn};

/// What [`Session::toggle_pause`] ended up doing.
///
/// [`Session::toggle_pause`]: crate::Session::toggle_pause
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PauseAction {
    /// Playback had to be (re)started from scratch.
    Started,
    /// Playback was paused.
    Paused,
    /// Playback resumed.
    Resumed,
}

impl Session {
    pub(crate) fn live_mixer(&self) -> ControlResult<Arc<MixerController>> {
        self.inner
            .mixer
            .lock()
            .as_ref()
            .filter(|mixer| mixer.is_alive())
            .map(Arc::clone)
            .ok_or(ControlError::MixerDead)
    }

    /// Kills the current sidecar, if any. Whether the resulting crash
    /// signal triggers recovery is decided by `intentional_kill`.
    pub(crate) fn stop_mixer(&self) {
        let mixer = self.inner.mixer.lock().take();
        if let Some(mixer) = mixer {
            debug!("Stopping mixer generation {}.", mixer.generation());
            mixer.kill();
        }
    }

    /// A restored or restarted session has nothing loaded until a mixer
    /// exists again; stale "loaded" markers would corrupt transitions.
    fn clear_loaded_without_mixer(&self) {
        if self.live_mixer().is_ok() {
            return;
        }

        let mut state = self.state();
        if state.current_deck_loaded.is_some() || state.next_deck_loaded.is_some() {
            trace!("Clearing loaded-deck markers: no live mixer.");
            state.current_deck_loaded = None;
            state.invalidate_preload();
        }
        drop(state);
        self.inner.deck_flags.clear_all();
    }

    /// Spawns a fresh sidecar instance, subject to the restart cooldown.
    async fn start_mixer(&self) -> ControlResult<Arc<MixerController>> {
        {
            let state = self.state();
            if let Some(at) = state.last_mixer_start {
                if at.elapsed() < self.inner.config.restart_cooldown {
                    return Err(MixerError::Cooldown.into());
                }
            }
        }

        let generation = {
            let mut state = self.state();
            state.mixer_generation += 1;
            state.last_mixer_start = Some(Instant::now());
            state.intentional_kill = false;
            state.mixer_generation
        };

        let controller = MixerController::start(
            &self.inner.config,
            generation,
            Arc::clone(&self.inner.deck_flags),
            self.inner.signal_tx.clone(),
        )?;

        *self.inner.mixer.lock() = Some(Arc::clone(&controller));
        info!("Mixer generation {} started.", generation);

        Ok(controller)
    }

    async fn wait_mixer_ready(&self, mixer: &MixerController) -> ControlResult<()> {
        let started = Instant::now();
        let poll = Duration::from_millis(crate::constants::MIXER_START_POLL_MS);

        while !mixer.is_alive() {
            if started.elapsed() >= self.inner.config.mixer_start_wait {
                return Err(ControlError::MixerDead);
            }
            tokio::time::sleep(poll).await;
        }

        Ok(())
    }

    /// Begins playback of the current song from scratch: ensure a mixer,
    /// configure it, load, wait out the initial buffer gap, play, and
    /// attach the PCM stream to the voice gateway.
    #[instrument(skip(self), fields(guild = %self.inner.guild_id))]
    pub(crate) async fn play_song(&self) -> ControlResult<()> {
        self.clear_loaded_without_mixer();

        let song = self
            .state()
            .current_song()
            .cloned()
            .ok_or(ControlError::EmptyQueue)?;

        let mixer = match self.live_mixer() {
            Ok(mixer) => mixer,
            Err(_) => self.start_mixer().await?,
        };
        self.wait_mixer_ready(&mixer).await?;

        let (deck, loop_enabled) = {
            let state = self.state();
            (state.current_deck, state.loop_enabled)
        };

        self.inner
            .commands
            .submit(MixerCommand::SetProactiveCrossfade { enabled: false }, Default::default())
            .await?;
        self.inner
            .commands
            .submit(MixerCommand::SetLoop { enabled: loop_enabled }, Default::default())
            .await?;

        self.inner.deck_flags.clear(deck);
        self.inner
            .commands
            .submit(
                MixerCommand::Load {
                    url: song.url.clone(),
                    deck,
                    autoplay: false,
                },
                Default::default(),
            )
            .await?;

        // Initial load needs a moment of buffering before play; replays
        // via restart_deck do not.
        tokio::time::sleep(self.inner.config.initial_load_gap).await;

        self.inner
            .commands
            .submit(MixerCommand::Play { deck }, Default::default())
            .await?;

        if let Some(stream) = mixer.take_stream() {
            self.inner.gateway.set_source(self.inner.guild_id, stream).await;
        }

        let index = {
            let mut state = self.state();
            state.current_deck_loaded = Some(song.url.clone());
            state.song_start = Some(Instant::now());
            state.is_paused = false;
            state.pause_start = None;
            state.session_restored = false;
            state.crash_attempts = 0;
            state.play_index
        };

        self.inner.stats.song_started();
        self.inner.clock.start(&self.inner.stats, self.listeners());

        if let Err(e) = self.persist_queue().await {
            warn!("Persisting after play failed: {}.", e);
        }

        self.inner.version.bump("play", format!("index={}", index));
        self.emit(SessionEvent::QueueUpdated {
            guild_id: self.inner.guild_id,
        });
        self.emit(SessionEvent::TrackStarted {
            guild_id: self.inner.guild_id,
            index,
            song,
        });

        self.on_song_start();
        Ok(())
    }

    /// Replays the current song from the top.
    pub(crate) async fn restart_current_song(&self) -> ControlResult<()> {
        if self.live_mixer().is_err() {
            debug!("Replay requested with a dead mixer; doing a full restart.");
            return self.play_song().await;
        }

        let deck = self.state().current_deck;
        self.inner
            .commands
            .submit(MixerCommand::RestartDeck { deck }, CommandOptions::high())
            .await?;

        {
            let mut state = self.state();
            state.song_start = Some(Instant::now());
        }

        self.inner.stats.song_started();
        self.inner.clock.start(&self.inner.stats, self.listeners());
        self.inner.version.bump("replay", format!("deck={}", deck));

        self.resume_if_paused().await?;
        self.on_song_start();

        Ok(())
    }

    /// The pause-toggle state machine.
    pub(crate) async fn toggle_pause_resume_inner(&self) -> ControlResult<PauseAction> {
        let (restored, have_songs, paused) = {
            let state = self.state();
            (state.session_restored, !state.songs.is_empty(), state.is_paused)
        };
        let have_mixer = self.live_mixer().is_ok();
        let (channel, connected) = {
            let membership = self.inner.membership.lock();
            (membership.channel_id, membership.connection == ConnectionState::Ready)
        };

        if !have_songs {
            return Err(ControlError::EmptyQueue);
        }

        if !have_mixer || !connected {
            if restored {
                self.state().session_restored = false;
            }
            if let Some(channel) = channel {
                self.inner.gateway.connect(self.inner.guild_id, channel).await?;
                self.inner.membership.lock().connection = ConnectionState::Ready;
            }

            self.play_song().await?;
            self.inner.version.bump("pause_toggle", "started");
            return Ok(PauseAction::Started);
        }

        if !paused {
            {
                let mut state = self.state();
                state.is_paused = true;
                state.pause_start = Some(Instant::now());
            }

            self.inner.gateway.pause(self.inner.guild_id).await;
            self.inner
                .commands
                .submit(MixerCommand::PauseAll, Default::default())
                .await?;
            self.inner.clock.pause(&self.inner.stats);

            self.inner.version.bump("pause_toggle", "paused");
            self.emit(SessionEvent::Paused {
                guild_id: self.inner.guild_id,
            });

            Ok(PauseAction::Paused)
        } else {
            self.apply_resume().await?;
            self.arm_preload_timer();
            self.inner.version.bump("pause_toggle", "resumed");

            Ok(PauseAction::Resumed)
        }
    }

    /// The common unpause path, also used after a skip that happened
    /// while paused.
    pub(crate) async fn resume_if_paused(&self) -> ControlResult<()> {
        if !self.state().is_paused {
            return Ok(());
        }

        self.apply_resume().await?;
        self.inner.version.bump("resume", "after transition");
        Ok(())
    }

    async fn apply_resume(&self) -> ControlResult<()> {
        {
            let mut state = self.state();
            // Shift the start marker forward so elapsed-time views do
            // not count the pause.
            if let (Some(song_start), Some(pause_start)) = (state.song_start, state.pause_start) {
                state.song_start = Some(song_start + pause_start.elapsed());
            }
            state.is_paused = false;
            state.pause_start = None;
        }

        self.inner
            .commands
            .submit(MixerCommand::ResumeAll, Default::default())
            .await?;
        self.inner.gateway.resume(self.inner.guild_id).await;
        self.inner.clock.resume();

        self.emit(SessionEvent::Resumed {
            guild_id: self.inner.guild_id,
        });

        Ok(())
    }

    /// Handles the single crash signal of a mixer instance.
    #[instrument(skip(self), fields(guild = %self.inner.guild_id))]
    pub(crate) async fn handle_mixer_crash(&self, generation: u64, reason: CrashReason) {
        {
            let state = self.state();
            if state.mixer_generation != generation {
                trace!("Stale crash signal from generation {}, ignoring.", generation);
                return;
            }
        }

        self.inner.clock.flush(&self.inner.stats);
        self.spawn_stats_flush();

        let intentional = {
            let state = self.state();
            warn!(
                play_index = state.play_index,
                deck = %state.current_deck,
                loaded = ?state.current_deck_loaded,
                last_mutation = ?self.inner.version.last_entry().map(|e| e.tag),
                "Mixer generation {} crashed: {}.",
                generation,
                reason
            );
            state.intentional_kill
        };

        self.clear_preload_timer();
        *self.inner.mixer.lock() = None;
        {
            let mut state = self.state();
            state.current_deck_loaded = None;
            state.invalidate_preload();
            state.is_crossfading = false;
            state.crossfade_start = None;
        }
        self.inner.deck_flags.clear_all();

        if intentional {
            self.state().intentional_kill = false;
            trace!("Intentional mixer stop; no recovery.");
            return;
        }

        let attempts = {
            let mut state = self.state();
            state.crash_attempts += 1;
            state.crash_attempts
        };

        self.emit(SessionEvent::MixerCrashed {
            guild_id: self.inner.guild_id,
            reason,
            attempts,
        });

        if attempts > self.inner.config.crash_attempt_cap {
            warn!("Crash recovery attempt cap reached; scheduling disconnect.");
            self.schedule_disconnect(Duration::ZERO, true);
            return;
        }

        if self.alone_in_channel() {
            debug!("Alone in the voice channel after a crash; disconnecting.");
            self.schedule_disconnect(Duration::ZERO, true);
            return;
        }

        let (ready, has_channel) = {
            let membership = self.inner.membership.lock();
            (
                membership.connection == ConnectionState::Ready,
                membership.channel_id.is_some(),
            )
        };

        if ready && has_channel {
            let delay = Duration::from_millis(500 + 500 * u64::from(attempts));
            debug!("Scheduling playback restart in {:?}.", delay);
            let tx = self.inner.msg_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                drop(tx.send(SessionMessage::PlayRetry));
            });
        }
    }

    /// A scheduled crash-recovery restart firing.
    pub(crate) async fn recovery_play(&self) {
        match self.play_song().await {
            Ok(()) => info!("Playback recovered after mixer crash."),
            Err(e) => {
                warn!("Crash-recovery restart failed: {}.", e);

                let attempts = {
                    let mut state = self.state();
                    state.crash_attempts += 1;
                    state.crash_attempts
                };

                if attempts > self.inner.config.crash_attempt_cap {
                    self.schedule_disconnect(Duration::ZERO, true);
                } else {
                    let delay = Duration::from_millis(500 + 500 * u64::from(attempts));
                    let tx = self.inner.msg_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        drop(tx.send(SessionMessage::PlayRetry));
                    });
                }
            },
        }
    }

    pub(crate) fn spawn_stats_flush(&self) {
        let stats = Arc::clone(&self.inner.stats);
        tokio::spawn(async move {
            if let Err(e) = stats.flush().await {
                warn!("Stats flush failed: {}.", e);
            }
        });
    }
}
