#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
//! Lyrebird is an async dual-deck playback core for voice-chat music
//! bots, written in Rust. The library offers:
//!  * Per-guild sessions holding a queue, play history, and two mixer
//!  decks, with preloading so skips and track changes are gapless or
//!  crossfaded.
//!  * A control plane that keeps rapid concurrent inputs safe: a FIFO
//!  barrier for user-visible operations, a serialised command queue to
//!  the mixer sidecar, a named skip lock, and monotonic state versions.
//!  * Lifecycle management for the external mixer process: spawn,
//!  line-delimited JSON protocol, low-latency PCM hand-off, and capped
//!  crash recovery with stale-generation event filtering.
//!  * Queue persistence for resume-after-restart, plus listening-time
//!  statistics bound to playback transitions.
//!
//! ## Collaborators
//! Lyrebird does not speak to any chat platform itself. An embedding bot
//! implements [`VoiceGateway`] (channel joins, PCM delivery, player
//! pause state) and feeds voice-membership events into each [`Session`].
//! Media resolution (turning user queries into playable URLs) also
//! lives outside; sessions consume resolved [`Song`] records.
//!
//! ## The mixer sidecar
//! Decoding, resampling, and the actual cross-mix run in a separate
//! mixer process per guild. Commands go to its stdin and events come
//! back on its stderr as newline-delimited JSON; its stdout carries raw
//! interleaved stereo PCM (48 kHz, s16le) which the voice gateway sends
//! on to listeners. See [`constants`] for the wire geometry and the
//! timing envelope.

#![warn(clippy::pedantic, rust_2018_idioms)]
#![allow(
    // Allowed as they are too pedantic
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::too_many_lines,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod id;
mod manager;
pub mod mixer;
pub mod persist;
pub mod session;
pub mod stats;
#[cfg(test)]
pub(crate) mod test_utils;
pub mod voice;

pub use crate::{
    config::Config,
    error::{ControlError, ControlResult},
    events::{EventHandler, SessionEvent},
    id::{ChannelId, GuildId, UserId},
    manager::Lyrebird,
    mixer::{Deck, PcmStream},
    session::{PauseAction, QueueView, Session, Song},
    voice::{ConnectionState, VoiceGateway},
};
