//! The seam to the voice/gateway collaborator, plus voice-channel
//! membership reconciliation and the empty-channel disconnect scheduler.
//!
//! The crate never talks to a chat platform itself: an embedding bot
//! implements [`VoiceGateway`] and feeds membership/connection events in
//! through the session methods below.

use crate::{
    id::{ChannelId, GuildId, UserId},
    mixer::PcmStream,
    session::{Session, SessionMessage},
};
use async_trait::async_trait;
use std::{
    collections::HashSet,
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
    time::{Duration, Instant},
};
use tracing::{debug, trace, warn};

/// Error returned when the gateway collaborator cannot carry out a
/// request.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    /// No voice connection exists for the guild.
    NotConnected,
    /// The target voice channel is gone or unjoinable.
    ChannelUnavailable,
    /// Backend-specific failure, stringified at the seam.
    Backend(String),
}

impl Display for GatewayError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "voice gateway: ")?;
        match self {
            GatewayError::NotConnected => write!(f, "not connected"),
            GatewayError::ChannelUnavailable => write!(f, "channel unavailable"),
            GatewayError::Backend(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error for GatewayError {}

/// Convenience type for gateway results.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// The voice-side collaborator: joins channels, carries PCM to
/// listeners, and forwards pause state to the platform's player.
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    /// Joins (or switches to) the given voice channel.
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> GatewayResult<()>;

    /// Leaves the guild's voice channel.
    async fn disconnect(&self, guild_id: GuildId);

    /// Attaches a mixer's PCM stream as the guild's audio source.
    async fn set_source(&self, guild_id: GuildId, source: PcmStream);

    /// Pauses the platform-side player.
    async fn pause(&self, guild_id: GuildId);

    /// Resumes the platform-side player.
    async fn resume(&self, guild_id: GuildId);
}

/// Voice connection lifecycle, as reported by the gateway.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// Connected and able to carry audio.
    Ready,
    /// Temporarily disconnected.
    Disconnected,
    /// Torn down for good.
    Destroyed,
}

/// Per-session view of who shares the voice channel.
#[derive(Debug)]
pub(crate) struct Membership {
    pub(crate) channel_id: Option<ChannelId>,
    pub(crate) connection: ConnectionState,
    pub(crate) humans: HashSet<UserId>,
    /// Bumped on every arm/cancel; a fired timer with an older value is
    /// stale.
    pub(crate) disconnect_generation: u64,
    pub(crate) last_reconcile: Option<Instant>,
}

impl Default for Membership {
    fn default() -> Self {
        Self {
            channel_id: None,
            connection: ConnectionState::Disconnected,
            humans: HashSet::new(),
            disconnect_generation: 0,
            last_reconcile: None,
        }
    }
}

impl Session {
    /// Records which voice channel this session should play into.
    pub fn set_voice_channel(&self, channel_id: Option<ChannelId>) {
        self.inner.membership.lock().channel_id = channel_id;
    }

    /// The channel this session plays into, if one is set.
    #[must_use]
    pub fn voice_channel(&self) -> Option<ChannelId> {
        self.inner.membership.lock().channel_id
    }

    /// Feeds a gateway connection transition in.
    pub fn voice_connection_changed(&self, connection: ConnectionState) {
        debug!("Voice connection for {} is now {:?}.", self.inner.guild_id, connection);
        self.inner.membership.lock().connection = connection;
    }

    /// Replaces the known set of human listeners.
    ///
    /// Listening-time credit moves to the new set; an emptied channel
    /// arms the disconnect timer, company cancels it. Identical updates
    /// inside the reconcile window are dropped.
    pub fn reconcile_members(&self, humans: Vec<UserId>) {
        let incoming: HashSet<UserId> = humans.into_iter().collect();
        let window = Duration::from_millis(crate::constants::RECONCILE_WINDOW_MS);

        {
            let mut membership = self.inner.membership.lock();

            let unchanged = membership.humans == incoming;
            let recent = membership
                .last_reconcile
                .map_or(false, |at| at.elapsed() < window);
            if unchanged && recent {
                trace!("Duplicate membership reconcile inside the window, ignoring.");
                return;
            }

            membership.humans = incoming;
            membership.last_reconcile = Some(Instant::now());
        }

        let listeners = self.listeners();
        self.inner
            .clock
            .update_listeners(&self.inner.stats, listeners);

        if self.alone_in_channel() {
            debug!("Voice channel emptied; arming disconnect timer.");
            self.schedule_disconnect(self.inner.config.disconnect_timeout, false);
        } else {
            self.cancel_disconnect();
        }
    }

    /// Delta form of [`reconcile_members`]: one human joined.
    ///
    /// [`reconcile_members`]: Session::reconcile_members
    pub fn member_joined(&self, user_id: UserId) {
        let mut humans: Vec<UserId> = {
            let membership = self.inner.membership.lock();
            membership.humans.iter().copied().collect()
        };
        humans.push(user_id);
        // A join is never a duplicate event worth debouncing.
        self.inner.membership.lock().last_reconcile = None;
        self.reconcile_members(humans);
    }

    /// Delta form of [`reconcile_members`]: one human left.
    ///
    /// [`reconcile_members`]: Session::reconcile_members
    pub fn member_left(&self, user_id: UserId) {
        let humans: Vec<UserId> = {
            let membership = self.inner.membership.lock();
            membership.humans.iter().copied().filter(|u| *u != user_id).collect()
        };
        self.inner.membership.lock().last_reconcile = None;
        self.reconcile_members(humans);
    }

    pub(crate) fn listeners(&self) -> Vec<UserId> {
        self.inner.membership.lock().humans.iter().copied().collect()
    }

    pub(crate) fn alone_in_channel(&self) -> bool {
        self.inner.membership.lock().humans.is_empty()
    }

    /// Arms the disconnect timer. `forced` timers fire regardless of who
    /// is present (crash-cap path); unforced ones re-check emptiness.
    pub(crate) fn schedule_disconnect(&self, delay: Duration, forced: bool) {
        let generation = {
            let mut membership = self.inner.membership.lock();
            membership.disconnect_generation += 1;
            membership.disconnect_generation
        };

        let tx = self.inner.msg_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            drop(tx.send(SessionMessage::Disconnect { generation, forced }));
        });
    }

    pub(crate) fn cancel_disconnect(&self) {
        self.inner.membership.lock().disconnect_generation += 1;
    }

    /// A disconnect timer firing.
    pub(crate) async fn disconnect_fired(&self, generation: u64, forced: bool) {
        {
            let membership = self.inner.membership.lock();
            if membership.disconnect_generation != generation {
                trace!("Stale disconnect timer, ignoring.");
                return;
            }
        }

        if !forced && !self.alone_in_channel() {
            trace!("Listeners returned before the disconnect timer fired.");
            return;
        }

        debug!("Disconnecting from voice in {}.", self.inner.guild_id);

        self.clear_preload_timer();
        self.inner.clock.flush(&self.inner.stats);
        self.spawn_stats_flush();

        {
            let mut state = self.state();
            state.intentional_kill = true;
        }
        self.stop_mixer();

        self.inner.gateway.disconnect(self.inner.guild_id).await;
        self.inner.membership.lock().connection = ConnectionState::Disconnected;

        if let Err(e) = self.persist_queue().await {
            warn!("Persisting on disconnect failed: {}.", e);
        }
        self.inner.version.bump("disconnect", if forced { "forced" } else { "idle" });
    }
}
