//! Controller for the external audio mixer sidecar.
//!
//! The sidecar owns decoding, resampling, and the dual-deck mix; this side
//! owns its lifecycle and the line protocol. Each spawned instance carries a
//! monotonic *generation* so that events surfacing after a crash-restart can
//! be recognised as stale and discarded.

mod commands;
mod message;
mod stdout;

pub use commands::{CommandOptions, CommandQueue, Priority, QueueStats};
pub use message::{ChatterLevel, Deck, MixerCommand, MixerEvent};
pub use stdout::PcmStream;

use crate::{config::Config, constants::BUFFER_READY_DEDUPE_MS};
use flume::Sender;
use parking_lot::Mutex;
use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
    io::Error as IoError,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    process::Command,
    spawn,
};
use tracing::{debug, trace, warn};

/// Errors raised while managing the sidecar process.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum MixerError {
    /// The sidecar process could not be spawned or wired up.
    StartFailed(Arc<IoError>),
    /// A spawn was requested inside the restart cooldown window.
    Cooldown,
    /// The sidecar is absent or no longer alive.
    Dead,
    /// A queued command did not complete within its timeout.
    CommandTimeout,
    /// The command queue was torn down with the session.
    Terminated,
    /// Writing a command line to the sidecar failed.
    Io(Arc<IoError>),
}

impl Display for MixerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "mixer sidecar: ")?;
        match self {
            MixerError::StartFailed(e) => write!(f, "failed to start [{}]", e),
            MixerError::Cooldown => write!(f, "start refused inside restart cooldown"),
            MixerError::Dead => write!(f, "process is not alive"),
            MixerError::CommandTimeout => write!(f, "command timed out"),
            MixerError::Terminated => write!(f, "guild cleanup"),
            MixerError::Io(e) => write!(f, "stdin write failed [{}]", e),
        }
    }
}

impl Error for MixerError {}

/// Convenience type for mixer lifecycle results.
pub type MixerResult<T> = Result<T, MixerError>;

/// Why a sidecar instance was declared dead.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CrashReason {
    /// Its stdout reached EOF while the session still wanted audio.
    StdoutClosed,
    /// Reading its stdout failed.
    StdoutError,
    /// Writing a command to its stdin failed.
    StdinError,
    /// The process exited, with the given status code if one exists.
    Exited(Option<i32>),
}

impl Display for CrashReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            CrashReason::StdoutClosed => f.write_str("stdout_closed"),
            CrashReason::StdoutError => f.write_str("stdout_error"),
            CrashReason::StdinError => f.write_str("stdin_error"),
            CrashReason::Exited(code) => write!(f, "exited({:?})", code),
        }
    }
}

/// Signals a controller instance sends back to its owning session.
#[derive(Debug)]
pub(crate) enum MixerSignal {
    /// A protocol event, tagged with the emitting instance's generation.
    Event(u64, MixerEvent),
    /// The instance died. Fired at most once per instance.
    Crash(u64, CrashReason),
}

/// Shared slot holding the session's live controller, if any.
pub(crate) type MixerSlot = Arc<Mutex<Option<Arc<MixerController>>>>;

/// Per-deck buffer-readiness flags.
///
/// Written by the sidecar reader task (with the repeat-signal dedupe)
/// and polled by transitions, so a waiter never depends on the session
/// event loop being idle.
#[derive(Debug, Default)]
pub(crate) struct DeckFlags {
    inner: Mutex<[DeckFlag; 2]>,
}

#[derive(Clone, Copy, Debug, Default)]
struct DeckFlag {
    ready: bool,
    set_at: Option<Instant>,
}

impl DeckFlags {
    /// Marks a deck ready. Returns `false` when the signal is a repeat
    /// inside the dedupe window and should not be forwarded.
    pub(crate) fn set_ready(&self, deck: Deck) -> bool {
        let mut inner = self.inner.lock();
        let slot = &mut inner[deck.index()];

        let dedupe = Duration::from_millis(BUFFER_READY_DEDUPE_MS);
        if slot.ready && slot.set_at.map_or(false, |at| at.elapsed() < dedupe) {
            return false;
        }

        slot.ready = true;
        slot.set_at = Some(Instant::now());
        true
    }

    pub(crate) fn clear(&self, deck: Deck) {
        self.inner.lock()[deck.index()] = DeckFlag::default();
    }

    pub(crate) fn clear_all(&self) {
        *self.inner.lock() = Default::default();
    }

    pub(crate) fn is_ready(&self, deck: Deck) -> bool {
        self.inner.lock()[deck.index()].ready
    }
}

/// Handle to one spawned sidecar instance.
///
/// All command writes go through [`CommandQueue`]; the controller itself
/// only exposes liveness, the PCM stream, and teardown.
pub struct MixerController {
    generation: u64,
    stdin: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    alive: Arc<AtomicBool>,
    stdout_open: Arc<AtomicBool>,
    crash_fired: Arc<AtomicBool>,
    signals: Sender<MixerSignal>,
    kill_tx: Option<Sender<()>>,
    pcm: Mutex<Option<PcmStream>>,
}

impl std::fmt::Debug for MixerController {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("MixerController")
            .field("generation", &self.generation)
            .field("alive", &self.alive.load(Ordering::SeqCst))
            .field("stdout_open", &self.stdout_open.load(Ordering::SeqCst))
            .field("stdin", &"<PIPE>")
            .finish()
    }
}

impl MixerController {
    /// Spawns the configured sidecar program and wires up its pipes.
    pub(crate) fn start(
        config: &Config,
        generation: u64,
        flags: Arc<DeckFlags>,
        signals: Sender<MixerSignal>,
    ) -> MixerResult<Arc<Self>> {
        let mut child = Command::new(&config.mixer_command)
            .args(&config.mixer_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MixerError::StartFailed(Arc::new(e)))?;

        let missing_pipe =
            || MixerError::StartFailed(Arc::new(IoError::new(std::io::ErrorKind::BrokenPipe, "sidecar pipe missing")));

        let stdin = child.stdin.take().ok_or_else(missing_pipe)?;
        let stdout = child.stdout.take().ok_or_else(missing_pipe)?;
        let stderr = child.stderr.take().ok_or_else(missing_pipe)?;

        let (kill_tx, kill_rx) = flume::bounded(1);
        let controller = Self::from_io(generation, Box::new(stdin), stdout, stderr, flags, signals, Some(kill_tx));

        // Watch for process exit; a deliberate kill routes through the
        // same path so every instance reports exactly one terminal state.
        let alive = Arc::clone(&controller.alive);
        let crash_fired = Arc::clone(&controller.crash_fired);
        let crash_signals = controller.signals.clone();
        spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status.ok(),
                _ = kill_rx.recv_async() => None,
            };

            // A requested kill falls through with no status yet.
            let status = match status {
                Some(status) => Some(status),
                None => {
                    drop(child.start_kill());
                    child.wait().await.ok()
                },
            };

            let code = status.and_then(|s| s.code());
            alive.store(false, Ordering::SeqCst);
            fire_crash(&crash_fired, &crash_signals, generation, CrashReason::Exited(code));
        });

        debug!("Mixer generation {} spawned.", generation);

        Ok(controller)
    }

    fn from_io(
        generation: u64,
        stdin: Box<dyn AsyncWrite + Send + Unpin>,
        stdout: impl AsyncRead + Send + Unpin + 'static,
        stderr: impl AsyncRead + Send + Unpin + 'static,
        flags: Arc<DeckFlags>,
        signals: Sender<MixerSignal>,
        kill_tx: Option<Sender<()>>,
    ) -> Arc<Self> {
        let alive = Arc::new(AtomicBool::new(true));
        let stdout_open = Arc::new(AtomicBool::new(true));
        let crash_fired = Arc::new(AtomicBool::new(false));

        let (stream, pump) = stdout::frame_reader(stdout);

        {
            let stdout_open = Arc::clone(&stdout_open);
            let crash_fired = Arc::clone(&crash_fired);
            let signals = signals.clone();
            spawn(async move {
                let clean = pump.await;
                stdout_open.store(false, Ordering::SeqCst);

                let reason = if clean {
                    CrashReason::StdoutClosed
                } else {
                    CrashReason::StdoutError
                };
                fire_crash(&crash_fired, &signals, generation, reason);
            });
        }

        {
            let signals = signals.clone();
            spawn(async move {
                event_reader(stderr, generation, flags, signals).await;
            });
        }

        Arc::new(Self {
            generation,
            stdin: tokio::sync::Mutex::new(stdin),
            alive,
            stdout_open,
            crash_fired,
            signals,
            kill_tx,
            pcm: Mutex::new(Some(stream)),
        })
    }

    /// This instance's monotonic generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the process is believed alive *and* still producing audio.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && self.stdout_open.load(Ordering::SeqCst)
    }

    /// Takes the framed PCM stream, if it has not been claimed yet.
    #[must_use]
    pub fn take_stream(&self) -> Option<PcmStream> {
        self.pcm.lock().take()
    }

    /// Serialises one command onto the sidecar's stdin.
    pub(crate) async fn write(&self, cmd: &MixerCommand) -> MixerResult<()> {
        let mut line = cmd.to_line();
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        let res = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        match res {
            Ok(()) => Ok(()),
            Err(e) => {
                self.alive.store(false, Ordering::SeqCst);
                fire_crash(
                    &self.crash_fired,
                    &self.signals,
                    self.generation,
                    CrashReason::StdinError,
                );
                Err(MixerError::Io(Arc::new(e)))
            },
        }
    }

    /// Terminates the sidecar process.
    ///
    /// The terminal `Crash` signal still fires; owners that intend the
    /// kill mark the session first so recovery ignores it.
    pub(crate) fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);

        if let Some(kill_tx) = &self.kill_tx {
            drop(kill_tx.try_send(()));
        } else {
            fire_crash(
                &self.crash_fired,
                &self.signals,
                self.generation,
                CrashReason::Exited(None),
            );
        }
    }
}

fn fire_crash(crash_fired: &AtomicBool, signals: &Sender<MixerSignal>, generation: u64, reason: CrashReason) {
    // One terminal signal per instance; later causes are echoes.
    if crash_fired
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        warn!("Mixer generation {} down: {}.", generation, reason);
        drop(signals.send(MixerSignal::Crash(generation, reason)));
    }
}

async fn event_reader(
    stderr: impl AsyncRead + Send + Unpin + 'static,
    generation: u64,
    flags: Arc<DeckFlags>,
    signals: Sender<MixerSignal>,
) {
    let mut lines = BufReader::new(stderr).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let evt = match MixerEvent::parse(&line) {
            Some(evt) => evt,
            None => continue,
        };

        match &evt {
            MixerEvent::BufferReady(deck) => {
                // Readiness lands in shared flags immediately so waiters
                // polling mid-transition are never stuck behind the
                // session loop; the forwarded event only version-bumps.
                if !flags.set_ready(*deck) {
                    trace!("Deduplicated buffer_ready for deck {}.", deck);
                    continue;
                }
            },
            MixerEvent::Chatter { level, message } => {
                match level {
                    ChatterLevel::Info => debug!("sidecar[{}]: {}", generation, message),
                    ChatterLevel::Debug | ChatterLevel::Latency => {
                        trace!("sidecar[{}]: {}", generation, message);
                    },
                }
                continue;
            },
            _ => {},
        }

        if signals.send(MixerSignal::Event(generation, evt)).is_err() {
            break;
        }
    }

    trace!("Mixer generation {} stderr closed.", generation);
}


#[cfg(test)]
mod tests {
    use super::*;

    fn signal_channel() -> (Sender<MixerSignal>, flume::Receiver<MixerSignal>) {
        flume::unbounded()
    }

    #[tokio::test]
    #[ntest::timeout(10_000)]
    async fn events_are_tagged_and_forwarded() {
        let (tx, rx) = signal_channel();
        let flags = Arc::new(DeckFlags::default());
        let (controller, mut handle) = harness::test_pair(3, Arc::clone(&flags), tx);

        handle.buffer_ready(Deck::B).await;

        match rx.recv_async().await.unwrap() {
            MixerSignal::Event(3, MixerEvent::BufferReady(Deck::B)) => {},
            other => panic!("unexpected signal: {:?}", other),
        }
        assert!(flags.is_ready(Deck::B));
        assert!(controller.is_alive());
    }

    #[tokio::test]
    #[ntest::timeout(10_000)]
    async fn repeated_buffer_ready_is_deduplicated() {
        let (tx, rx) = signal_channel();
        let flags = Arc::new(DeckFlags::default());
        let (_controller, mut handle) = harness::test_pair(1, flags, tx);

        handle.buffer_ready(Deck::A).await;
        handle.buffer_ready(Deck::A).await;
        handle.send_line(r#"{"event":"end"}"#).await;

        match rx.recv_async().await.unwrap() {
            MixerSignal::Event(_, MixerEvent::BufferReady(Deck::A)) => {},
            other => panic!("unexpected signal: {:?}", other),
        }
        // The duplicate was swallowed; the next signal is already `end`.
        match rx.recv_async().await.unwrap() {
            MixerSignal::Event(_, MixerEvent::End) => {},
            other => panic!("unexpected signal: {:?}", other),
        }
    }

    #[tokio::test]
    #[ntest::timeout(10_000)]
    async fn stdout_close_fires_a_single_crash() {
        let (tx, rx) = signal_channel();
        let flags = Arc::new(DeckFlags::default());
        let (controller, mut handle) = harness::test_pair(7, flags, tx);

        handle.close_stdout();

        match rx.recv_async().await.unwrap() {
            MixerSignal::Crash(7, CrashReason::StdoutClosed) => {},
            other => panic!("unexpected signal: {:?}", other),
        }
        assert!(!controller.is_alive());

        // A later kill produces no second crash signal.
        controller.kill();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    #[ntest::timeout(10_000)]
    async fn mixed_audio_flows_through_the_framed_stream() {
        let (tx, _rx) = signal_channel();
        let flags = Arc::new(DeckFlags::default());
        let (controller, mut handle) = harness::test_pair(1, flags, tx);

        let stream = controller.take_stream().expect("stream unclaimed");
        assert!(controller.take_stream().is_none());

        handle
            .feed_pcm(&vec![9u8; crate::constants::STEREO_FRAME_BYTE_SIZE])
            .await;

        let frame = stream.next_frame().await.expect("one frame");
        assert_eq!(frame.len(), crate::constants::STEREO_FRAME_BYTE_SIZE);
        assert!(frame.iter().all(|b| *b == 9));
    }

    #[tokio::test]
    #[ntest::timeout(10_000)]
    async fn commands_reach_the_wire_in_order() {
        let (tx, _rx) = signal_channel();
        let flags = Arc::new(DeckFlags::default());
        let (controller, mut handle) = harness::test_pair(1, flags, tx);

        controller.write(&MixerCommand::PauseAll).await.unwrap();
        controller
            .write(&MixerCommand::Play { deck: Deck::A })
            .await
            .unwrap();

        assert_eq!(handle.recv_command().await, MixerCommand::PauseAll);
        assert_eq!(handle.recv_command().await, MixerCommand::Play { deck: Deck::A });
    }
}
