//! Typed change events.
//!
//! Each event carries only the changed value, plus the previous value where
//! a consumer needs the delta. Events are serializable so they can be
//! forwarded verbatim (the `mpd-remote` binary prints them as JSON).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::client::connection::ConnectionState;
use crate::client::idle::IdleSubsystem;
use crate::client::status::{Output, PlayerState, ReplayMode};

/// Events raised by the connection manager, the idle monitor and status refreshes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum MpdEvent {
    // Connection
    ConnectionStateChanged {
        state: ConnectionState,
        previous: ConnectionState,
    },
    /// An established connection died (I/O error, EOF, protocol violation).
    ConnectionLost { reason: String },
    /// A connection attempt failed before reaching `Connected`.
    ConnectionFailed { reason: String },
    /// The idle monitor gave up while the connection stayed up, e.g. the
    /// server rejected the `idle` command.
    MonitorStopped { reason: String },

    // Player
    StateChanged {
        state: PlayerState,
        previous: PlayerState,
    },
    TrackChanged {
        song_id: Option<u32>,
        song_pos: Option<u32>,
        previous_song_id: Option<u32>,
    },
    TrackPositionChanged {
        elapsed: Option<f64>,
        duration: Option<f64>,
    },

    // Mixer
    VolumeChanged {
        volume: Option<u8>,
        previous: Option<u8>,
    },

    // Options
    RandomChanged { random: bool },
    RepeatChanged { repeat: bool },
    SingleChanged { single: ReplayMode },
    ConsumeChanged { consume: ReplayMode },

    // Output
    OutputsChanged { outputs: Vec<Output> },

    // Queue and stored playlists
    PlaylistChanged {
        version: Option<u32>,
        previous_version: Option<u32>,
        length: Option<u32>,
    },
    StoredPlaylistChanged,

    StickerChanged,

    // Database
    LibraryStateChanged { updating: bool, db_changed: bool },

    /// A subsystem without a dedicated event (subscription, message, ...).
    SubsystemChanged { subsystem: IdleSubsystem },
}

/// Discriminant of [`MpdEvent`], used for listener filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    ConnectionStateChanged,
    ConnectionLost,
    ConnectionFailed,
    MonitorStopped,
    StateChanged,
    TrackChanged,
    TrackPositionChanged,
    VolumeChanged,
    RandomChanged,
    RepeatChanged,
    SingleChanged,
    ConsumeChanged,
    OutputsChanged,
    PlaylistChanged,
    StoredPlaylistChanged,
    StickerChanged,
    LibraryStateChanged,
    SubsystemChanged,
}

impl MpdEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ConnectionStateChanged { .. } => EventKind::ConnectionStateChanged,
            Self::ConnectionLost { .. } => EventKind::ConnectionLost,
            Self::ConnectionFailed { .. } => EventKind::ConnectionFailed,
            Self::MonitorStopped { .. } => EventKind::MonitorStopped,
            Self::StateChanged { .. } => EventKind::StateChanged,
            Self::TrackChanged { .. } => EventKind::TrackChanged,
            Self::TrackPositionChanged { .. } => EventKind::TrackPositionChanged,
            Self::VolumeChanged { .. } => EventKind::VolumeChanged,
            Self::RandomChanged { .. } => EventKind::RandomChanged,
            Self::RepeatChanged { .. } => EventKind::RepeatChanged,
            Self::SingleChanged { .. } => EventKind::SingleChanged,
            Self::ConsumeChanged { .. } => EventKind::ConsumeChanged,
            Self::OutputsChanged { .. } => EventKind::OutputsChanged,
            Self::PlaylistChanged { .. } => EventKind::PlaylistChanged,
            Self::StoredPlaylistChanged => EventKind::StoredPlaylistChanged,
            Self::StickerChanged => EventKind::StickerChanged,
            Self::LibraryStateChanged { .. } => EventKind::LibraryStateChanged,
            Self::SubsystemChanged { .. } => EventKind::SubsystemChanged,
        }
    }

    /// Delivery rank within one batch.
    ///
    /// Connection events go first, then player, mixer, options, output,
    /// playlist, sticker and database, so narrower events never reference a
    /// status the listener has not seen yet.
    pub fn dispatch_rank(&self) -> u8 {
        match self.kind() {
            EventKind::ConnectionStateChanged
            | EventKind::ConnectionLost
            | EventKind::ConnectionFailed
            | EventKind::MonitorStopped => 0,
            EventKind::StateChanged | EventKind::TrackChanged | EventKind::TrackPositionChanged => 1,
            EventKind::VolumeChanged => 2,
            EventKind::RandomChanged
            | EventKind::RepeatChanged
            | EventKind::SingleChanged
            | EventKind::ConsumeChanged => 3,
            EventKind::OutputsChanged => 4,
            EventKind::PlaylistChanged | EventKind::StoredPlaylistChanged => 5,
            EventKind::StickerChanged => 6,
            EventKind::LibraryStateChanged => 7,
            EventKind::SubsystemChanged => 8,
        }
    }
}

/// Stable sort of a batch into dispatch order.
pub fn sort_for_dispatch(events: &mut [MpdEvent]) {
    events.sort_by_key(MpdEvent::dispatch_rank);
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
