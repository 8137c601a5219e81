//! Events emitted by sessions for dashboards and embedding bots.

use crate::{
    id::GuildId,
    mixer::CrashReason,
    session::Song,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::trace;

/// Trait to handle session events.
///
/// Handlers are shared across every guild managed by one [`Lyrebird`]
/// instance and may be feasibly reused between several of them.
///
/// [`Lyrebird`]: crate::Lyrebird
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Respond to one received event.
    async fn act(&self, ctx: &SessionEvent);
}

/// State changes a dashboard must be able to reflect.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum SessionEvent {
    /// A new song became the current one.
    TrackStarted {
        /// Originating guild.
        guild_id: GuildId,
        /// Index of the song within the queue.
        index: usize,
        /// The song itself.
        song: Song,
    },
    /// Queue contents, order, or toggles changed.
    QueueUpdated {
        /// Originating guild.
        guild_id: GuildId,
    },
    /// The queue ran out; only the last played song is retained.
    QueueFinished {
        /// Originating guild.
        guild_id: GuildId,
    },
    /// Playback was paused.
    Paused {
        /// Originating guild.
        guild_id: GuildId,
    },
    /// Playback resumed.
    Resumed {
        /// Originating guild.
        guild_id: GuildId,
    },
    /// The mixer sidecar died unexpectedly.
    MixerCrashed {
        /// Originating guild.
        guild_id: GuildId,
        /// Why the instance was declared dead.
        reason: CrashReason,
        /// Recovery attempts consumed so far.
        attempts: u32,
    },
}

/// Fan-out point for [`SessionEvent`]s.
#[derive(Default)]
pub(crate) struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

impl EventBus {
    pub(crate) fn add(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().push(handler);
    }

    /// Dispatches on a fresh task so emitters never block on handlers.
    pub(crate) fn emit(&self, event: SessionEvent) {
        let handlers = self.handlers.read().clone();
        if handlers.is_empty() {
            trace!("No handlers for {:?}.", event);
            return;
        }

        tokio::spawn(async move {
            for handler in &handlers {
                handler.act(&event).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::num::NonZeroU64;

    struct Recorder {
        seen: Mutex<Vec<String>>,
        notify: tokio::sync::Notify,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn act(&self, ctx: &SessionEvent) {
            self.seen.lock().push(format!("{:?}", ctx));
            self.notify.notify_one();
        }
    }

    #[tokio::test]
    #[ntest::timeout(10_000)]
    async fn events_reach_registered_handlers() {
        let bus = EventBus::default();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            notify: tokio::sync::Notify::new(),
        });
        bus.add(Arc::clone(&recorder) as Arc<dyn EventHandler>);

        bus.emit(SessionEvent::QueueFinished {
            guild_id: GuildId(NonZeroU64::new(1).unwrap()),
        });

        recorder.notify.notified().await;
        assert_eq!(recorder.seen.lock().len(), 1);
    }
}
