//! The session registry.

use crate::{
    config::Config,
    error::{ControlError, ControlResult, PersistResult},
    events::{EventBus, EventHandler},
    id::GuildId,
    persist::QueueStore,
    session::Session,
    stats::StatsRegistry,
    voice::VoiceGateway,
};
use dashmap::DashMap;
use parking_lot::RwLock as PRwLock;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// The manager owning every guild's [`Session`].
///
/// It maps guild IDs to sessions on demand, shares the queue-backup and
/// stats stores between them, and handles whole-process lifecycle
/// (restore after restart, graceful shutdown).
pub struct Lyrebird {
    sessions: DashMap<GuildId, Session>,
    config: PRwLock<Config>,
    gateway: Arc<dyn VoiceGateway>,
    events: Arc<EventBus>,
    store: Option<Arc<QueueStore>>,
    stats: Arc<StatsRegistry>,
}

impl std::fmt::Debug for Lyrebird {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lyrebird")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl Lyrebird {
    /// Creates a new manager over the given voice gateway.
    #[must_use]
    pub fn new(config: Config, gateway: Arc<dyn VoiceGateway>) -> Arc<Self> {
        let store = config
            .queue_backup_path
            .clone()
            .map(|path| Arc::new(QueueStore::new(path)));
        let stats = Arc::new(StatsRegistry::new(config.stats_path.clone()));

        Arc::new(Self {
            sessions: DashMap::new(),
            config: PRwLock::new(config),
            gateway,
            events: Arc::new(EventBus::default()),
            store,
            stats,
        })
    }

    /// Retrieves the [`Session`] for the given guild, if one exists.
    #[must_use]
    pub fn get<G: Into<GuildId>>(&self, guild_id: G) -> Option<Session> {
        self.sessions.get(&guild_id.into()).map(|s| s.value().clone())
    }

    /// Retrieves the [`Session`] for the given guild, creating one if
    /// none is found.
    #[inline]
    pub fn get_or_insert<G>(&self, guild_id: G) -> Session
    where
        G: Into<GuildId>,
    {
        self._get_or_insert(guild_id.into())
    }

    fn _get_or_insert(&self, guild_id: GuildId) -> Session {
        self.get(guild_id).unwrap_or_else(|| {
            self.sessions
                .entry(guild_id)
                .or_insert_with(|| {
                    debug!("Creating session for {}.", guild_id);
                    Session::new(
                        guild_id,
                        self.config.read().clone(),
                        Arc::clone(&self.gateway),
                        Arc::clone(&self.events),
                        self.store.clone(),
                        Arc::clone(&self.stats),
                    )
                })
                .clone()
        })
    }

    /// Guilds with live sessions.
    #[must_use]
    pub fn guilds(&self) -> Vec<GuildId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Registers a handler receiving every session's events.
    pub fn add_event_handler<H: EventHandler + 'static>(&self, handler: H) {
        self.events.add(Arc::new(handler));
    }

    /// Shared statistics registry.
    #[must_use]
    pub fn stats(&self) -> Arc<StatsRegistry> {
        Arc::clone(&self.stats)
    }

    /// Sets the configuration used for sessions created after this call.
    pub fn set_config(&self, new_config: Config) {
        *self.config.write() = new_config;
    }

    /// Removes a guild entirely: session teardown plus deletion of its
    /// persisted entry. Used when the bot is removed from the guild.
    #[instrument(skip(self))]
    pub async fn remove<G: Into<GuildId> + std::fmt::Debug>(&self, guild_id: G) -> ControlResult<()> {
        let guild_id = guild_id.into();

        let (_, session) = self
            .sessions
            .remove(&guild_id)
            .ok_or(ControlError::Finished)?;
        session.destroy().await;

        if let Some(store) = &self.store {
            store.save(guild_id, None).await?;
        }

        info!("Guild {} cleaned up.", guild_id);
        Ok(())
    }

    /// Recreates sessions from the queue-backup file after a restart.
    ///
    /// Restored sessions hold their queue and toggles but no mixer; the
    /// next pause-toggle (or play) brings playback back.
    pub async fn restore(&self) -> PersistResult<usize> {
        if let Err(e) = self.stats.load().await {
            warn!("Loading the stats file failed: {}.", e);
        }

        let store = match &self.store {
            Some(store) => store,
            None => return Ok(0),
        };

        let backups = store.load_all().await?;
        let count = backups.len();

        for (guild_id, backup) in backups {
            let session = self.get_or_insert(guild_id);
            session.apply_backup(backup);
        }

        info!("Restored {} session(s) from backup.", count);
        Ok(count)
    }

    /// Graceful shutdown: snapshot every queue, stop every mixer with
    /// the intentional-kill marker, flush stats.
    pub async fn shutdown(&self) {
        info!("Shutting down {} session(s).", self.sessions.len());

        let sessions: Vec<Session> = self.sessions.iter().map(|entry| entry.value().clone()).collect();
        self.sessions.clear();

        for session in sessions {
            session.destroy().await;
        }

        if let Err(e) = self.stats.flush().await {
            warn!("Final stats flush failed: {}.", e);
        }
    }
}
