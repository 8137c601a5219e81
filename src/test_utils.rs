//! Shared fixtures for the crate's tests.

use crate::{
    config::Config,
    events::EventBus,
    id::{ChannelId, GuildId, UserId},
    manager::Lyrebird,
    mixer::PcmStream,
    persist::QueueStore,
    session::{Session, Song},
    stats::StatsRegistry,
    voice::{GatewayResult, VoiceGateway},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{num::NonZeroU64, sync::Arc, time::Duration};

pub(crate) fn guild(n: u64) -> GuildId {
    GuildId(NonZeroU64::new(n).unwrap())
}

pub(crate) fn user(n: u64) -> UserId {
    UserId(NonZeroU64::new(n).unwrap())
}

pub(crate) fn channel(n: u64) -> ChannelId {
    ChannelId(NonZeroU64::new(n).unwrap())
}

pub(crate) fn song(url: &str) -> Song {
    Song {
        title: url.to_string(),
        url: url.to_string(),
        thumbnail: None,
        is_live: false,
        duration: 180,
        requester: "1".into(),
    }
}

/// Gateway double that records calls and keeps attached PCM streams
/// alive (dropping them would read as a sidecar stdout close).
#[derive(Default)]
pub(crate) struct FakeGateway {
    pub(crate) calls: Mutex<Vec<String>>,
    sources: Mutex<Vec<PcmStream>>,
}

impl FakeGateway {
    pub(crate) fn saw(&self, needle: &str) -> bool {
        self.calls.lock().iter().any(|c| c.starts_with(needle))
    }
}

#[async_trait]
impl VoiceGateway for FakeGateway {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> GatewayResult<()> {
        self.calls.lock().push(format!("connect:{}:{}", guild_id, channel_id));
        Ok(())
    }

    async fn disconnect(&self, guild_id: GuildId) {
        self.calls.lock().push(format!("disconnect:{}", guild_id));
    }

    async fn set_source(&self, guild_id: GuildId, source: PcmStream) {
        self.calls.lock().push(format!("set_source:{}", guild_id));
        self.sources.lock().push(source);
    }

    async fn pause(&self, guild_id: GuildId) {
        self.calls.lock().push(format!("pause:{}", guild_id));
    }

    async fn resume(&self, guild_id: GuildId) {
        self.calls.lock().push(format!("resume:{}", guild_id));
    }
}

/// A tight timing envelope so scenario tests finish quickly. The mixer
/// command points at nothing on purpose: tests either install the
/// in-memory harness or exercise the spawn-failure path.
pub(crate) fn test_config(dir: &tempfile::TempDir) -> Config {
    Config::default()
        .mixer_command("./definitely-not-a-mixer-binary")
        .crossfade(Duration::from_millis(150))
        .preload_delay(Duration::from_millis(40))
        .skip_throttle(Duration::ZERO)
        .barrier_throttle(Duration::ZERO)
        .barrier_timeout(Duration::from_secs(5))
        .command_timeout(Duration::from_secs(1))
        .buffer_wait(Duration::from_millis(400))
        .buffer_poll(Duration::from_millis(10))
        .restart_cooldown(Duration::ZERO)
        .initial_load_gap(Duration::from_millis(10))
        .skip_lock_expiry(Duration::from_secs(5))
        .disconnect_timeout(Duration::from_millis(60))
        .queue_backup_path(dir.path().join("queues.json"))
        .stats_path(dir.path().join("stats.json"))
}

pub(crate) struct Sandbox {
    pub(crate) session: Session,
    pub(crate) gateway: Arc<FakeGateway>,
    pub(crate) stats: Arc<StatsRegistry>,
    _dir: tempfile::TempDir,
}

impl Sandbox {
    pub(crate) fn install_mixer(&self) -> crate::mixer::harness::MixerTestHandle {
        self.session.install_test_mixer()
    }
}

pub(crate) async fn sandbox() -> Sandbox {
    sandbox_with(|config| config).await
}

pub(crate) async fn sandbox_with(tweak: impl FnOnce(Config) -> Config) -> Sandbox {
    let dir = tempfile::tempdir().unwrap();
    let config = tweak(test_config(&dir));

    let gateway = Arc::new(FakeGateway::default());
    let events = Arc::new(EventBus::default());
    let store = config
        .queue_backup_path
        .clone()
        .map(|path| Arc::new(QueueStore::new(path)));
    let stats = Arc::new(StatsRegistry::new(config.stats_path.clone()));

    let session = Session::new(
        guild(1),
        config,
        Arc::clone(&gateway) as Arc<dyn VoiceGateway>,
        events,
        store,
        Arc::clone(&stats),
    );

    Sandbox {
        session,
        gateway,
        stats,
        _dir: dir,
    }
}

pub(crate) async fn manager_sandbox() -> (Arc<Lyrebird>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_at(&dir);
    (manager, dir)
}

pub(crate) async fn manager_sandbox_at(dir: tempfile::TempDir) -> (Arc<Lyrebird>, tempfile::TempDir) {
    let manager = manager_at(&dir);
    (manager, dir)
}

fn manager_at(dir: &tempfile::TempDir) -> Arc<Lyrebird> {
    let gateway = Arc::new(FakeGateway::default());
    Lyrebird::new(test_config(dir), gateway as Arc<dyn VoiceGateway>)
}

/// Polls `cond` until it holds, panicking after ~5 s.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
