//! Line-delimited JSON messages exchanged with the mixer sidecar.
//!
//! Requests travel over the sidecar's stdin, events come back over its
//! stderr; both are newline-terminated UTF-8 JSON. The sidecar's stdout is
//! reserved for raw PCM and never carries protocol data.

use crate::constants::MIN_CROSSFADE_MS;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    time::Duration,
};
use tracing::trace;

/// One of the two independent playback slots inside the mixer.
///
/// At any moment one deck is *current*; the other may hold a preloaded
/// song so a skip or crossfade is instantaneous.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Deck {
    /// Deck "A".
    A,
    /// Deck "B".
    B,
}

impl Deck {
    /// Returns the complement of this deck.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Deck::A => Deck::B,
            Deck::B => Deck::A,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Deck::A => 0,
            Deck::B => 1,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "A" => Some(Deck::A),
            "B" => Some(Deck::B),
            _ => None,
        }
    }
}

impl Display for Deck {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Deck::A => f.write_str("A"),
            Deck::B => f.write_str("B"),
        }
    }
}

/// A request written to the sidecar's stdin.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MixerCommand {
    /// Begin fetching and decoding `url` into `deck`'s ring buffer.
    Load {
        /// Resolved media URL.
        url: String,
        /// Target deck.
        deck: Deck,
        /// Whether the sidecar should start the deck on its own once
        /// buffered. The core always sends `false` and owns switching.
        autoplay: bool,
    },
    /// Start a loaded deck.
    Play {
        /// Deck to start.
        deck: Deck,
    },
    /// Pause both decks.
    PauseAll,
    /// Resume both decks.
    ResumeAll,
    /// Stop and unload one deck.
    StopDeck {
        /// Deck to stop.
        deck: Deck,
    },
    /// Cross-mix from the current deck into `to_deck`.
    Crossfade {
        /// Deck to fade into.
        to_deck: Deck,
        /// Fade length in milliseconds.
        duration_ms: u32,
    },
    /// Hard-switch playback to `target_deck`.
    SkipTo {
        /// Deck to switch to.
        target_deck: Deck,
    },
    /// Restart one deck from the top of its stream.
    RestartDeck {
        /// Deck to restart.
        deck: Deck,
    },
    /// Enable/disable the sidecar's own end-of-track crossfade. The core
    /// sends `false`: crossfade policy lives on this side.
    SetProactiveCrossfade {
        /// New setting.
        enabled: bool,
    },
    /// Mirror the session's loop toggle into the sidecar.
    SetLoop {
        /// New setting.
        enabled: bool,
    },
}

impl MixerCommand {
    /// Builds a crossfade command, clamping the duration up to the
    /// sidecar minimum.
    #[must_use]
    pub fn crossfade(to_deck: Deck, duration: Duration) -> Self {
        let duration_ms = (duration.as_millis() as u64).max(MIN_CROSSFADE_MS) as u32;
        MixerCommand::Crossfade { to_deck, duration_ms }
    }

    /// Renders this command as one wire line (without the trailing
    /// newline).
    pub(crate) fn to_line(&self) -> String {
        // The command enums hold no map keys or non-string data which
        // could fail serialisation.
        serde_json::to_string(self).expect("mixer command serialisation cannot fail")
    }
}

/// An event read from the sidecar's stderr.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum MixerEvent {
    /// A deck holds enough audio to begin immediately.
    BufferReady(Deck),
    /// A crossfade began mixing.
    CrossfadeStarted,
    /// The current deck is 3 s from its natural end.
    ApproachingEnd,
    /// The current deck reached its natural end.
    End,
    /// The audible deck changed (informational).
    DeckChanged(Deck),
    /// The sidecar auto-switched to a preloaded deck at natural end; the
    /// core reconciles state without issuing commands.
    AutoEndSwitch(Deck),
    /// The sidecar restarted the current deck because loop mode is on.
    AutoLoopRestart(Deck),
    /// A stream-level decode/transport failure on the active deck.
    StreamError(String),
    /// The media extractor failed for the requested URL.
    YtError(String),
    /// An unclassified sidecar error.
    Error(String),
    /// Informational chatter (`info`/`debug`/`latency`).
    Chatter {
        /// Which channel the line arrived on.
        level: ChatterLevel,
        /// The raw payload.
        message: String,
    },
}

/// Informational event channels the sidecar may use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChatterLevel {
    /// `info` events.
    Info,
    /// `debug` events.
    Debug,
    /// `latency` measurements.
    Latency,
}

#[derive(Deserialize)]
struct RawEvent {
    event: String,
    #[serde(default)]
    data: Option<String>,
}

impl MixerEvent {
    /// Parses one stderr line into an event, if it is well-formed and
    /// known.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let raw: RawEvent = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(e) => {
                trace!("Discarding malformed sidecar line {:?}: {}", line, e);
                return None;
            },
        };

        let data = raw.data.unwrap_or_default();

        let evt = match raw.event.as_str() {
            "buffer_ready" => MixerEvent::BufferReady(Deck::parse(&data)?),
            "crossfade_started" => MixerEvent::CrossfadeStarted,
            "approaching_end" => MixerEvent::ApproachingEnd,
            "end" => MixerEvent::End,
            // deck_changed reports `deck=X` rather than a bare deck name.
            "deck_changed" => {
                let name = data.strip_prefix("deck=").unwrap_or(&data);
                MixerEvent::DeckChanged(Deck::parse(name)?)
            },
            "auto_end_switch" => MixerEvent::AutoEndSwitch(Deck::parse(&data)?),
            "auto_loop_restart" => MixerEvent::AutoLoopRestart(Deck::parse(&data)?),
            "stream_error" => MixerEvent::StreamError(data),
            "yt_error" => MixerEvent::YtError(data),
            "error" => MixerEvent::Error(data),
            "info" => MixerEvent::Chatter {
                level: ChatterLevel::Info,
                message: data,
            },
            "debug" => MixerEvent::Chatter {
                level: ChatterLevel::Debug,
                message: data,
            },
            "latency" => MixerEvent::Chatter {
                level: ChatterLevel::Latency,
                message: data,
            },
            other => {
                trace!("Discarding unknown sidecar event {:?}.", other);
                return None;
            },
        };

        Some(evt)
    }
}
