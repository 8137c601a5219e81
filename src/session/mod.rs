//! Per-guild playback sessions.
//!
//! A [`Session`] owns one guild's queue, deck assignment, mixer sidecar,
//! and coordinators (operation barrier, command queue, skip lock, state
//! version). Handles are cheap to clone; all state lives behind the inner
//! `Arc`. Automatic behaviour (preload timers, sidecar events, crash
//! recovery, disconnect timers) is driven by a single per-session
//! event-loop task, so those paths never race each other.

mod barrier;
mod engine;
mod playback;
mod queue;
mod skip;
mod state;
mod version;

pub use playback::PauseAction;
pub use queue::Song;
pub use version::VersionEntry;

use crate::{
    config::Config,
    error::{ControlResult, PersistResult},
    events::{EventBus, SessionEvent},
    id::GuildId,
    mixer::{CommandQueue, DeckFlags, MixerCommand, MixerSignal, MixerSlot, QueueStats},
    persist::{QueueStore, SessionBackup},
    stats::{ListenerClock, StatsRegistry},
    voice::{Membership, VoiceGateway},
};
use barrier::OperationBarrier;
use flume::{Receiver, Sender};
use parking_lot::{Mutex, MutexGuard};
use skip::SkipReason;
pub(crate) use state::PlaybackState;
use std::{sync::Arc, time::Instant};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};
use version::{LockSet, StateVersion};

/// Internal triggers delivered to a session's event loop.
#[derive(Debug)]
pub(crate) enum SessionMessage {
    /// The preload timer with this generation fired.
    Preload(u64),
    /// A scheduled crash-recovery restart is due.
    PlayRetry,
    /// A disconnect timer fired.
    Disconnect {
        /// Timer generation at arming time.
        generation: u64,
        /// Fire even if listeners are present.
        forced: bool,
    },
    /// Session teardown.
    Poison,
}

#[derive(Debug, Default)]
pub(crate) struct PreloadTimer {
    pub(crate) generation: u64,
    pub(crate) handle: Option<JoinHandle<()>>,
}

/// Handle to one guild's playback core.
#[derive(Clone, Debug)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    pub(crate) guild_id: GuildId,
    pub(crate) config: Config,
    pub(crate) state: Mutex<PlaybackState>,
    pub(crate) version: StateVersion,
    pub(crate) locks: Arc<LockSet>,
    pub(crate) barrier: OperationBarrier,
    pub(crate) skip_throttle: Mutex<Option<Instant>>,
    pub(crate) mixer: MixerSlot,
    pub(crate) deck_flags: Arc<DeckFlags>,
    pub(crate) commands: CommandQueue,
    pub(crate) queue_guard: tokio::sync::Mutex<()>,
    pub(crate) msg_tx: Sender<SessionMessage>,
    pub(crate) signal_tx: Sender<MixerSignal>,
    pub(crate) preload: Mutex<PreloadTimer>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) stats: Arc<StatsRegistry>,
    pub(crate) clock: ListenerClock,
    pub(crate) store: Option<Arc<QueueStore>>,
    pub(crate) gateway: Arc<dyn VoiceGateway>,
    pub(crate) membership: Mutex<Membership>,
}

impl std::fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInner")
            .field("guild_id", &self.guild_id)
            .field("version", &self.version.current())
            .finish()
    }
}

/// Read-only snapshot of a session's queue for dashboards.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct QueueView {
    /// The queue, in play order.
    pub songs: Vec<Song>,
    /// Index of the current song.
    pub play_index: usize,
    /// URL currently audible, if any.
    pub now_playing: Option<String>,
    /// User toggles.
    pub is_paused: bool,
    /// User toggles.
    pub loop_enabled: bool,
    /// User toggles.
    pub fade_enabled: bool,
    /// Whether the queue sits in its finished state.
    pub finished: bool,
}

impl Session {
    /// Creates a session and starts its event-loop task.
    pub(crate) fn new(
        guild_id: GuildId,
        config: Config,
        gateway: Arc<dyn VoiceGateway>,
        events: Arc<EventBus>,
        store: Option<Arc<QueueStore>>,
        stats: Arc<StatsRegistry>,
    ) -> Self {
        let (msg_tx, msg_rx) = flume::unbounded();
        let (signal_tx, signal_rx) = flume::unbounded();

        let mixer: MixerSlot = Arc::new(Mutex::new(None));
        let commands = CommandQueue::new(Arc::clone(&mixer));

        let barrier = OperationBarrier::new(config.barrier_throttle, config.barrier_timeout);

        let session = Session {
            inner: Arc::new(SessionInner {
                guild_id,
                config,
                state: Mutex::new(PlaybackState::default()),
                version: StateVersion::default(),
                locks: Arc::new(LockSet::default()),
                barrier,
                skip_throttle: Mutex::new(None),
                mixer,
                deck_flags: Arc::new(DeckFlags::default()),
                commands,
                queue_guard: tokio::sync::Mutex::new(()),
                msg_tx,
                signal_tx,
                preload: Mutex::new(PreloadTimer::default()),
                events,
                stats,
                clock: ListenerClock::default(),
                store,
                gateway,
                membership: Mutex::new(Membership::default()),
            }),
        };

        let looped = session.clone();
        tokio::spawn(async move {
            trace!("Session loop for {} started.", looped.inner.guild_id);
            runner(looped, msg_rx, signal_rx).await;
        });

        session
    }

    /// The guild this session belongs to.
    #[must_use]
    pub fn guild_id(&self) -> GuildId {
        self.inner.guild_id
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, PlaybackState> {
        self.inner.state.lock()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        self.inner.events.emit(event);
    }

    /// Current state version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version.current()
    }

    /// Recent version-log entries, oldest first.
    #[must_use]
    pub fn version_log(&self) -> Vec<VersionEntry> {
        self.inner.version.log()
    }

    /// Command-queue counters for observability.
    #[must_use]
    pub fn command_stats(&self) -> QueueStats {
        self.inner.commands.stats()
    }

    /// Snapshot of the queue for display.
    #[must_use]
    pub fn queue_view(&self) -> QueueView {
        let state = self.state();
        QueueView {
            songs: state.songs.clone(),
            play_index: state.play_index,
            now_playing: state.current_deck_loaded.clone(),
            is_paused: state.is_paused,
            loop_enabled: state.loop_enabled,
            fade_enabled: state.fade_enabled,
            finished: state.queue_finished(),
        }
    }

    /// Begins playback of the current song.
    pub async fn play(&self) -> ControlResult<()> {
        self.play_song().await
    }

    /// Skips to the next song (or restarts it in loop mode).
    #[instrument(skip(self), fields(guild = %self.inner.guild_id))]
    pub async fn skip(&self) -> ControlResult<()> {
        self.inner
            .barrier
            .run("skip", self.skip_next_inner(SkipReason::Manual))
            .await
    }

    /// Returns to the previous song; a no-op at the head of the queue.
    #[instrument(skip(self), fields(guild = %self.inner.guild_id))]
    pub async fn previous(&self) -> ControlResult<()> {
        self.inner.barrier.run("prev", self.skip_prev_inner()).await
    }

    /// Jumps to an arbitrary queue index.
    #[instrument(skip(self), fields(guild = %self.inner.guild_id))]
    pub async fn skip_to(&self, index: usize) -> ControlResult<()> {
        self.inner
            .barrier
            .run("skip_to_index", self.skip_to_index_inner(index))
            .await
    }

    /// Toggles pause, (re)starting playback when nothing is running.
    #[instrument(skip(self), fields(guild = %self.inner.guild_id))]
    pub async fn toggle_pause(&self) -> ControlResult<PauseAction> {
        self.inner
            .barrier
            .run("pause_toggle", self.toggle_pause_resume_inner())
            .await
    }

    /// Shuffles the not-yet-played remainder of the queue.
    #[instrument(skip(self), fields(guild = %self.inner.guild_id))]
    pub async fn shuffle(&self) -> ControlResult<()> {
        self.inner.barrier.run("shuffle", self.shuffle_upcoming()).await
    }

    /// Kills and respawns the mixer, restarting the current song.
    #[instrument(skip(self), fields(guild = %self.inner.guild_id))]
    pub async fn restart_mixer(&self) -> ControlResult<()> {
        self.inner
            .barrier
            .run("mixer_restart", async {
                {
                    let mut state = self.state();
                    state.intentional_kill = true;
                }
                self.stop_mixer();
                self.play_song().await
            })
            .await
    }

    /// Ends playback and retains only the last played song.
    pub async fn stop(&self) -> ControlResult<()> {
        self.end_queue().await
    }

    /// Current loop toggle.
    #[must_use]
    pub fn loop_enabled(&self) -> bool {
        self.state().loop_enabled
    }

    /// Current fade toggle.
    #[must_use]
    pub fn fade_enabled(&self) -> bool {
        self.state().fade_enabled
    }

    /// Whether playback is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state().is_paused
    }

    /// Sets the loop toggle, mirroring it into the sidecar.
    pub async fn set_loop(&self, enabled: bool) -> ControlResult<()> {
        {
            let mut state = self.state();
            state.loop_enabled = enabled;
        }

        if self.live_mixer().is_ok() {
            if let Err(e) = self
                .inner
                .commands
                .submit(MixerCommand::SetLoop { enabled }, Default::default())
                .await
            {
                warn!("Forwarding the loop toggle failed: {}.", e);
            }
        }

        if let Err(e) = self.persist_queue().await {
            warn!("Persisting the loop toggle failed: {}.", e);
        }
        self.inner.version.bump("set_loop", format!("enabled={}", enabled));
        self.emit(SessionEvent::QueueUpdated {
            guild_id: self.inner.guild_id,
        });

        Ok(())
    }

    /// Sets the fade toggle.
    pub async fn set_fade(&self, enabled: bool) -> ControlResult<()> {
        {
            let mut state = self.state();
            state.fade_enabled = enabled;
        }

        if let Err(e) = self.persist_queue().await {
            warn!("Persisting the fade toggle failed: {}.", e);
        }
        self.inner.version.bump("set_fade", format!("enabled={}", enabled));
        self.emit(SessionEvent::QueueUpdated {
            guild_id: self.inner.guild_id,
        });

        Ok(())
    }

    /// Records the dashboard anchors carried through persistence.
    pub async fn set_dashboard_anchor(
        &self,
        message_id: Option<String>,
        channel_id: Option<String>,
    ) -> ControlResult<()> {
        {
            let mut state = self.state();
            state.dashboard_message_id = message_id;
            state.text_channel_id = channel_id;
        }

        self.persist_queue().await?;
        Ok(())
    }

    pub(crate) fn backup_snapshot(&self) -> SessionBackup {
        let state = self.state();
        SessionBackup {
            songs: state.songs.clone(),
            history: state.history.iter().cloned().collect(),
            play_index: state.play_index,
            is_paused: state.is_paused,
            loop_enabled: state.loop_enabled,
            fade_enabled: state.fade_enabled,
            current_deck_loaded: state.current_deck_loaded.clone(),
            dashboard_message_id: state.dashboard_message_id.clone(),
            text_channel_id: state.text_channel_id.clone(),
        }
    }

    pub(crate) async fn persist_queue(&self) -> PersistResult<()> {
        let store = match &self.inner.store {
            Some(store) => store,
            None => return Ok(()),
        };

        let snapshot = self.backup_snapshot();
        store.save(self.inner.guild_id, Some(snapshot)).await
    }

    /// Applies a restored backup. Nothing is marked loaded; the stored
    /// `currentDeckLoaded` only seeds the "last played" history entry.
    pub(crate) fn apply_backup(&self, backup: SessionBackup) {
        {
            let mut state = self.state();

            state.songs = backup.songs;
            state.history = backup.history.into_iter().collect();
            state.play_index = backup
                .play_index
                .min(state.songs.len().saturating_sub(1));
            state.is_paused = backup.is_paused;
            state.loop_enabled = backup.loop_enabled;
            state.fade_enabled = backup.fade_enabled;
            state.dashboard_message_id = backup.dashboard_message_id;
            state.text_channel_id = backup.text_channel_id;
            state.current_deck_loaded = None;
            state.invalidate_preload();

            if let Some(url) = backup.current_deck_loaded {
                let already = state.history.front().map_or(false, |s| s.url == url);
                if !already {
                    if let Some(song) = state.songs.iter().find(|s| s.url == url).cloned() {
                        state.remember(song);
                    }
                }
            }

            state.session_restored = true;
        }

        self.inner.version.bump("restore", "from backup");
        debug!("Session {} restored from backup.", self.inner.guild_id);
    }

    /// Tears the session down: intentional mixer stop, coordinator
    /// shutdown, final snapshot.
    pub(crate) async fn destroy(&self) {
        debug!("Destroying session {}.", self.inner.guild_id);

        self.clear_preload_timer();
        {
            let mut state = self.state();
            state.intentional_kill = true;
        }
        self.stop_mixer();

        self.inner.commands.close();
        self.inner.clock.flush(&self.inner.stats);
        self.inner.locks.clear();

        if let Err(e) = self.persist_queue().await {
            warn!("Final queue snapshot failed: {}.", e);
        }

        drop(self.inner.msg_tx.send(SessionMessage::Poison));
    }

    #[cfg(test)]
    pub(crate) fn install_test_mixer(&self) -> crate::mixer::harness::MixerTestHandle {
        let generation = {
            let mut state = self.state();
            state.mixer_generation += 1;
            state.last_mixer_start = Some(Instant::now());
            state.intentional_kill = false;
            state.mixer_generation
        };

        let (controller, handle) = crate::mixer::harness::test_pair(
            generation,
            Arc::clone(&self.inner.deck_flags),
            self.inner.signal_tx.clone(),
        );
        *self.inner.mixer.lock() = Some(controller);

        handle
    }
}

/// The per-session event loop: mixer signals on one channel, internal
/// timers and teardown on the other.
async fn runner(session: Session, msg_rx: Receiver<SessionMessage>, signal_rx: Receiver<MixerSignal>) {
    loop {
        tokio::select! {
            signal = signal_rx.recv_async() => match signal {
                Ok(MixerSignal::Event(generation, event)) => {
                    session.handle_mixer_event(generation, event).await;
                },
                Ok(MixerSignal::Crash(generation, reason)) => {
                    session.handle_mixer_crash(generation, reason).await;
                },
                // The session keeps a sender; this only closes at drop.
                Err(_) => break,
            },
            msg = msg_rx.recv_async() => match msg {
                Ok(SessionMessage::Preload(generation)) => session.preload_fire(generation).await,
                Ok(SessionMessage::PlayRetry) => session.recovery_play().await,
                Ok(SessionMessage::Disconnect { generation, forced }) => {
                    session.disconnect_fired(generation, forced).await;
                },
                Ok(SessionMessage::Poison) | Err(_) => break,
            },
        }
    }

    trace!("Session loop for {} exited.", session.inner.guild_id);
}

#[cfg(test)]
mod tests {
    use super::skip::SkipReason;
    use crate::{
        error::ControlError,
        mixer::{Deck, MixerCommand},
        session::PauseAction,
        test_utils::{channel, sandbox, sandbox_with, song, user, wait_until},
        voice::ConnectionState,
    };
    use std::time::{Duration, Instant};

    #[tokio::test]
    #[ntest::timeout(15_000)]
    async fn preloaded_crossfade_at_natural_end() {
        let sb = sandbox().await;
        let s = sb.session.clone();

        s.enqueue(vec![song("x"), song("y")]).await.unwrap();
        s.set_fade(true).await.unwrap();
        let mut mixer = sb.install_mixer();
        {
            let mut state = s.state();
            state.current_deck_loaded = Some("x".into());
            state.song_start = Some(Instant::now());
        }

        // Preload lands Y on the idle deck.
        s.preload_next_song().await;
        match mixer.recv_command().await {
            MixerCommand::Load { url, deck, autoplay } => {
                assert_eq!(url, "y");
                assert_eq!(deck, Deck::B);
                assert!(!autoplay);
            },
            other => panic!("expected a preload, got {:?}", other),
        }
        mixer.buffer_ready(Deck::B).await;
        wait_until(|| s.inner.deck_flags.is_ready(Deck::B)).await;

        // 3 s before the end the sidecar announces; fade is on, so the
        // core crossfades into the preloaded deck.
        mixer.send_line(r#"{"event":"approaching_end"}"#).await;

        match mixer.recv_command().await {
            MixerCommand::Crossfade { to_deck, duration_ms } => {
                assert_eq!(to_deck, Deck::B);
                assert!(duration_ms >= 6_000);
            },
            other => panic!("expected a crossfade, got {:?}", other),
        }

        wait_until(|| s.state().play_index == 1).await;
        {
            let state = s.state();
            assert_eq!(state.current_deck, Deck::B);
            assert_eq!(state.current_deck_loaded.as_deref(), Some("y"));
            assert_eq!(state.next_deck_loaded, None);
            assert!(!state.is_crossfading);
        }
        assert_eq!(sb.stats.global().songs_started, 1);
        assert_eq!(sb.stats.global().songs_completed, 1);

        // Fast path: no load after the preload.
        assert!(mixer.recv_command_within(Duration::from_millis(150)).await.is_none());
    }

    #[tokio::test]
    #[ntest::timeout(15_000)]
    async fn cold_skip_without_fade_uses_skip_to() {
        let sb = sandbox().await;
        let s = sb.session.clone();

        s.enqueue(vec![song("x"), song("y")]).await.unwrap();
        let mut mixer = sb.install_mixer();
        {
            let mut state = s.state();
            state.current_deck_loaded = Some("x".into());
            state.song_start = Some(Instant::now());
        }

        let task = {
            let s = s.clone();
            tokio::spawn(async move { s.skip().await })
        };

        assert_eq!(mixer.recv_command().await, MixerCommand::StopDeck { deck: Deck::B });
        assert_eq!(
            mixer.recv_command().await,
            MixerCommand::Load {
                url: "y".into(),
                deck: Deck::B,
                autoplay: false,
            }
        );
        mixer.buffer_ready(Deck::B).await;
        assert_eq!(
            mixer.recv_command().await,
            MixerCommand::SkipTo { target_deck: Deck::B }
        );

        task.await.unwrap().unwrap();

        let state = s.state();
        assert_eq!(state.play_index, 1);
        assert_eq!(state.current_deck, Deck::B);
        assert!(!state.is_crossfading);
        assert_eq!(state.crossfade_start, None);
    }

    #[tokio::test]
    #[ntest::timeout(15_000)]
    async fn concurrent_transition_is_rejected() {
        let sb = sandbox().await;
        let s = sb.session.clone();

        s.enqueue(vec![song("x"), song("y"), song("z")]).await.unwrap();
        let mut mixer = sb.install_mixer();
        {
            let mut state = s.state();
            state.current_deck_loaded = Some("x".into());
            state.song_start = Some(Instant::now());
        }

        // First transition cold-loads and parks on the buffer wait.
        let first = {
            let s = s.clone();
            tokio::spawn(async move { s.transition_to(1, SkipReason::Manual).await })
        };
        wait_until(|| s.inner.locks.has_active_lock(&s.skip_lock_name())).await;

        let second = s.transition_to(2, SkipReason::Manual).await;
        assert!(matches!(second, Err(ControlError::SkipInProgress)));

        // Release the first one.
        assert!(matches!(mixer.recv_command().await, MixerCommand::StopDeck { .. }));
        assert!(matches!(mixer.recv_command().await, MixerCommand::Load { .. }));
        mixer.buffer_ready(Deck::B).await;
        assert!(matches!(mixer.recv_command().await, MixerCommand::SkipTo { .. }));
        first.await.unwrap().unwrap();

        // Exactly one transition committed.
        assert_eq!(s.state().play_index, 1);
    }

    #[tokio::test]
    #[ntest::timeout(15_000)]
    async fn duplicate_triggers_inside_the_skip_throttle_are_rejected() {
        let sb = sandbox_with(|c| c.skip_throttle(Duration::from_secs(10))).await;
        let s = sb.session.clone();

        s.enqueue(vec![song("x"), song("y"), song("z")]).await.unwrap();
        let mut mixer = sb.install_mixer();
        {
            let mut state = s.state();
            state.current_deck_loaded = Some("x".into());
            state.song_start = Some(Instant::now());
        }

        let first = {
            let s = s.clone();
            tokio::spawn(async move { s.skip_next_inner(SkipReason::Manual).await })
        };
        assert!(matches!(mixer.recv_command().await, MixerCommand::StopDeck { .. }));
        assert!(matches!(mixer.recv_command().await, MixerCommand::Load { .. }));
        mixer.buffer_ready(Deck::B).await;
        assert!(matches!(mixer.recv_command().await, MixerCommand::SkipTo { .. }));
        first.await.unwrap().unwrap();

        let second = s.skip_next_inner(SkipReason::Manual).await;
        assert!(matches!(second, Err(ControlError::Throttled)));
        assert_eq!(s.state().play_index, 1);
    }

    #[tokio::test]
    #[ntest::timeout(15_000)]
    async fn skip_during_the_crossfade_window_is_rejected() {
        let sb = sandbox_with(|c| c.crossfade(Duration::from_millis(400))).await;
        let s = sb.session.clone();

        s.enqueue(vec![song("x"), song("y"), song("z")]).await.unwrap();
        s.set_fade(true).await.unwrap();
        let mut mixer = sb.install_mixer();
        {
            let mut state = s.state();
            state.current_deck_loaded = Some("x".into());
            state.song_start = Some(Instant::now());
        }

        // Preloaded fast-path crossfade into Y.
        s.preload_next_song().await;
        assert!(matches!(mixer.recv_command().await, MixerCommand::Load { .. }));
        mixer.buffer_ready(Deck::B).await;
        wait_until(|| s.inner.deck_flags.is_ready(Deck::B)).await;
        s.transition_to(1, SkipReason::Manual).await.unwrap();
        assert!(matches!(mixer.recv_command().await, MixerCommand::Crossfade { .. }));

        // Inside the 400 ms window a new transition is refused.
        let during = s.transition_to(2, SkipReason::Manual).await;
        assert!(matches!(during, Err(ControlError::CrossfadeInProgress)));

        // After the window it succeeds: a cold load, then (fade is still
        // on) another crossfade.
        tokio::time::sleep(Duration::from_millis(450)).await;
        let after = {
            let s = s.clone();
            tokio::spawn(async move { s.transition_to(2, SkipReason::Manual).await })
        };
        assert!(matches!(mixer.recv_command().await, MixerCommand::StopDeck { .. }));
        assert!(matches!(mixer.recv_command().await, MixerCommand::Load { .. }));
        mixer.buffer_ready(Deck::A).await;
        assert!(matches!(mixer.recv_command().await, MixerCommand::Crossfade { .. }));
        after.await.unwrap().unwrap();

        assert_eq!(s.state().play_index, 2);
        assert_eq!(s.state().current_deck, Deck::A);
    }

    #[tokio::test]
    #[ntest::timeout(15_000)]
    async fn approaching_end_with_no_next_clones_the_current_track() {
        let sb = sandbox().await;
        let s = sb.session.clone();

        s.enqueue(vec![song("x")]).await.unwrap();
        s.set_fade(true).await.unwrap();
        let mut mixer = sb.install_mixer();
        {
            let mut state = s.state();
            state.current_deck_loaded = Some("x".into());
            state.song_start = Some(Instant::now());
        }

        mixer.send_line(r#"{"event":"approaching_end"}"#).await;

        // The fallback clone, not a skip.
        match mixer.recv_command().await {
            MixerCommand::Load { url, deck, autoplay } => {
                assert_eq!(url, "x");
                assert_eq!(deck, Deck::B);
                assert!(!autoplay);
            },
            other => panic!("expected the clone load, got {:?}", other),
        }
        assert_eq!(sb.stats.global().songs_completed, 0);
        assert_eq!(s.state().play_index, 0);

        // Natural end finishes the queue, retaining the last track.
        mixer.send_line(r#"{"event":"end"}"#).await;
        wait_until(|| s.state().current_deck_loaded.is_none()).await;

        let view = s.queue_view();
        assert_eq!(view.songs.len(), 1);
        assert_eq!(view.songs[0].url, "x");
        assert_eq!(view.play_index, 0);
        assert!(view.finished);
        assert_eq!(sb.stats.global().songs_completed, 1);
        assert!(s.version_log().iter().any(|e| e.tag == "queue_end"));
    }

    #[tokio::test]
    #[ntest::timeout(20_000)]
    async fn crash_recovery_caps_attempts_then_disconnects() {
        let sb = sandbox().await;
        let s = sb.session.clone();

        s.enqueue(vec![song("x")]).await.unwrap();
        let mut mixer = sb.install_mixer();
        {
            let mut state = s.state();
            state.current_deck_loaded = Some("x".into());
            state.song_start = Some(Instant::now());
        }
        s.set_voice_channel(Some(channel(5)));
        s.voice_connection_changed(ConnectionState::Ready);
        s.reconcile_members(vec![user(2)]);

        let generation_before = s.state().mixer_generation;
        mixer.close_stdout();

        // Recovery restarts hit the unspawnable test mixer command until
        // the attempt cap trips and a disconnect is scheduled.
        wait_until(|| sb.gateway.saw("disconnect")).await;

        let state = s.state();
        assert!(state.crash_attempts > 2, "attempts = {}", state.crash_attempts);
        assert!(state.mixer_generation > generation_before);
        assert_eq!(state.current_deck_loaded, None);
    }

    #[tokio::test]
    #[ntest::timeout(15_000)]
    async fn intentional_kill_does_not_trigger_recovery() {
        let sb = sandbox().await;
        let s = sb.session.clone();

        s.enqueue(vec![song("x")]).await.unwrap();
        let _mixer = sb.install_mixer();
        {
            let mut state = s.state();
            state.current_deck_loaded = Some("x".into());
        }
        s.set_voice_channel(Some(channel(5)));
        s.voice_connection_changed(ConnectionState::Ready);

        s.stop().await.unwrap();
        wait_until(|| !s.state().intentional_kill).await;

        // Give any (wrong) recovery schedule a chance to fire.
        tokio::time::sleep(Duration::from_millis(1_300)).await;
        assert_eq!(s.state().crash_attempts, 0);
        assert!(!sb.gateway.saw("disconnect"));
    }

    #[tokio::test]
    #[ntest::timeout(15_000)]
    async fn pause_toggle_flips_both_ways() {
        let sb = sandbox().await;
        let s = sb.session.clone();

        s.enqueue(vec![song("x")]).await.unwrap();
        let mut mixer = sb.install_mixer();
        {
            let mut state = s.state();
            state.current_deck_loaded = Some("x".into());
            state.song_start = Some(Instant::now());
        }
        s.set_voice_channel(Some(channel(5)));
        s.voice_connection_changed(ConnectionState::Ready);

        let action = s.toggle_pause().await.unwrap();
        assert_eq!(action, PauseAction::Paused);
        assert_eq!(mixer.recv_command().await, MixerCommand::PauseAll);
        assert!(s.is_paused());
        assert!(sb.gateway.saw("pause"));

        tokio::time::sleep(Duration::from_millis(30)).await;

        let action = s.toggle_pause().await.unwrap();
        assert_eq!(action, PauseAction::Resumed);
        assert_eq!(mixer.recv_command().await, MixerCommand::ResumeAll);
        assert!(!s.is_paused());
        assert!(sb.gateway.saw("resume"));
    }

    #[tokio::test]
    #[ntest::timeout(15_000)]
    async fn pause_toggle_restarts_a_restored_session() {
        let sb = sandbox().await;
        let s = sb.session.clone();

        s.enqueue(vec![song("x")]).await.unwrap();
        s.set_voice_channel(Some(channel(9)));
        let mut mixer = sb.install_mixer();
        {
            let mut state = s.state();
            state.session_restored = true;
        }

        let action = s.toggle_pause().await.unwrap();
        assert_eq!(action, PauseAction::Started);

        assert_eq!(
            mixer.recv_command().await,
            MixerCommand::SetProactiveCrossfade { enabled: false }
        );
        assert_eq!(mixer.recv_command().await, MixerCommand::SetLoop { enabled: false });
        assert!(matches!(mixer.recv_command().await, MixerCommand::Load { .. }));
        assert!(matches!(mixer.recv_command().await, MixerCommand::Play { .. }));

        assert!(sb.gateway.saw("connect"));
        assert!(sb.gateway.saw("set_source"));
        let state = s.state();
        assert!(!state.session_restored);
        assert_eq!(state.current_deck_loaded.as_deref(), Some("x"));
        assert_eq!(sb.stats.global().songs_started, 1);
    }

    #[tokio::test]
    #[ntest::timeout(15_000)]
    async fn toggle_pause_on_an_empty_queue_errors() {
        let sb = sandbox().await;

        let res = sb.session.toggle_pause().await;
        assert!(matches!(res, Err(ControlError::EmptyQueue)));
    }

    #[tokio::test]
    #[ntest::timeout(15_000)]
    async fn events_from_a_previous_mixer_generation_are_dropped() {
        let sb = sandbox().await;
        let s = sb.session.clone();

        s.enqueue(vec![song("x"), song("y")]).await.unwrap();
        let mut old_mixer = sb.install_mixer();
        {
            let mut state = s.state();
            state.current_deck_loaded = Some("x".into());
            state.song_start = Some(Instant::now());
        }

        // A newer instance supersedes the old one.
        let _new_mixer = sb.install_mixer();
        let version_before = s.version();

        old_mixer.send_line(r#"{"event":"end"}"#).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(s.state().play_index, 0);
        assert_eq!(s.version(), version_before);
    }

    #[tokio::test]
    #[ntest::timeout(15_000)]
    async fn sidecar_auto_end_switch_reconciles_without_commands() {
        let sb = sandbox().await;
        let s = sb.session.clone();

        s.enqueue(vec![song("x"), song("y")]).await.unwrap();
        let mut mixer = sb.install_mixer();
        {
            let mut state = s.state();
            state.current_deck_loaded = Some("x".into());
            state.song_start = Some(Instant::now());
            state.next_deck_loaded = Some("y".into());
            state.next_deck_target = Some(Deck::B);
        }

        mixer.send_line(r#"{"event":"auto_end_switch","data":"B"}"#).await;
        wait_until(|| s.state().play_index == 1).await;

        {
            let state = s.state();
            assert_eq!(state.current_deck, Deck::B);
            assert_eq!(state.current_deck_loaded.as_deref(), Some("y"));
            assert_eq!(state.next_deck_loaded, None);
        }
        assert_eq!(sb.stats.global().songs_completed, 1);
        assert_eq!(sb.stats.global().songs_started, 1);

        // Reconciliation only: nothing was sent to the sidecar.
        assert!(mixer.recv_command_within(Duration::from_millis(150)).await.is_none());
    }

    #[tokio::test]
    #[ntest::timeout(15_000)]
    async fn repeated_stream_errors_mark_unplayable_and_skip() {
        let sb = sandbox().await;
        let s = sb.session.clone();

        s.enqueue(vec![song("x"), song("y")]).await.unwrap();
        let mut mixer = sb.install_mixer();
        {
            let mut state = s.state();
            state.current_deck_loaded = Some("x".into());
            state.song_start = Some(Instant::now());
        }

        for _ in 0..3 {
            mixer
                .send_line(r#"{"event":"stream_error","data":"Opus decode failed"}"#)
                .await;
        }

        // The third strike triggers an automatic cold skip to Y.
        assert!(matches!(mixer.recv_command().await, MixerCommand::StopDeck { .. }));
        assert!(matches!(mixer.recv_command().await, MixerCommand::Load { .. }));
        mixer.buffer_ready(Deck::B).await;
        assert!(matches!(mixer.recv_command().await, MixerCommand::SkipTo { .. }));

        wait_until(|| s.state().play_index == 1).await;
        assert!(s.state().failed_urls.contains("x"));
    }

    #[tokio::test]
    #[ntest::timeout(15_000)]
    async fn emptied_voice_channel_disconnects_after_grace() {
        let sb = sandbox().await;
        let s = sb.session.clone();

        s.enqueue(vec![song("x")]).await.unwrap();
        let _mixer = sb.install_mixer();
        s.set_voice_channel(Some(channel(4)));
        s.voice_connection_changed(ConnectionState::Ready);

        s.reconcile_members(vec![user(10)]);
        s.reconcile_members(Vec::new());

        wait_until(|| sb.gateway.saw("disconnect")).await;
        assert!(s.version_log().iter().any(|e| e.tag == "disconnect"));
    }

    #[tokio::test]
    #[ntest::timeout(15_000)]
    async fn returning_listeners_cancel_the_disconnect_timer() {
        let sb = sandbox_with(|c| c.disconnect_timeout(Duration::from_millis(120))).await;
        let s = sb.session.clone();

        s.set_voice_channel(Some(channel(4)));
        s.reconcile_members(vec![user(10)]);
        s.reconcile_members(Vec::new());
        tokio::time::sleep(Duration::from_millis(40)).await;
        s.reconcile_members(vec![user(11)]);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!sb.gateway.saw("disconnect"));
    }
}
