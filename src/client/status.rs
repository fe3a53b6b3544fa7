//! Status and statistics cache.
//!
//! The server omits `status` fields whenever they do not apply (no `song`
//! while stopped, no `volume` without a mixer, no `updating_db` unless a
//! job runs), so every field is optional. A value that is present but does
//! not parse is treated as absent rather than failing the refresh.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, trace};

use super::executor::Session;
use crate::bus::MpdEvent;
use crate::error::Result;
use crate::protocol::{Command, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    Play,
    Pause,
    #[default]
    Stop,
}

impl FromStr for PlayerState {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "play" => Ok(Self::Play),
            "pause" => Ok(Self::Pause),
            "stop" => Ok(Self::Stop),
            _ => Err(()),
        }
    }
}

/// Value of the `single` and `consume` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayMode {
    #[default]
    Off,
    On,
    /// Applies to the current song only, then reverts to `Off`.
    Oneshot,
}

impl FromStr for ReplayMode {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "0" => Ok(Self::Off),
            "1" => Ok(Self::On),
            "oneshot" => Ok(Self::Oneshot),
            _ => Err(()),
        }
    }
}

/// Decoder output format, `audio: <rate>:<bits>:<channels>`.
///
/// Bits may be `f` (float) or `dsd`, so the pieces stay individually optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: Option<u32>,
    pub bits: Option<u8>,
    pub channels: Option<u8>,
    pub raw: String,
}

impl AudioFormat {
    fn parse(raw: &str) -> Self {
        let mut parts = raw.split(':');
        let sample_rate = parts.next().and_then(|s| s.parse().ok());
        let bits = parts.next().and_then(|s| s.parse().ok());
        let channels = parts.next().and_then(|s| s.parse().ok());
        Self {
            sample_rate,
            bits,
            channels,
            raw: raw.to_string(),
        }
    }
}

/// Snapshot of the `status` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MpdStatus {
    pub state: PlayerState,
    pub song_id: Option<u32>,
    pub song_pos: Option<u32>,
    pub next_song_id: Option<u32>,
    pub next_song_pos: Option<u32>,
    /// Seconds into the current song.
    pub elapsed: Option<f64>,
    /// Length of the current song in seconds.
    pub duration: Option<f64>,
    /// kbit/s
    pub bitrate: Option<u32>,
    pub audio: Option<AudioFormat>,
    /// `None` when the server has no usable mixer (`volume: -1`).
    pub volume: Option<u8>,
    pub random: bool,
    pub repeat: bool,
    pub single: ReplayMode,
    pub consume: ReplayMode,
    pub playlist_version: Option<u32>,
    pub playlist_length: Option<u32>,
    pub crossfade: Option<u32>,
    /// Job id of a running database update.
    pub updating_db: Option<u32>,
    pub error: Option<String>,
}

fn parse_field<T: FromStr>(response: &Response, key: &str) -> Option<T> {
    let raw = response.get(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            debug!("Ignoring unparseable status field {}: {:?}", key, raw);
            None
        }
    }
}

fn parse_flag(response: &Response, key: &str) -> bool {
    response.get(key) == Some("1")
}

impl MpdStatus {
    pub fn from_response(response: &Response) -> Self {
        // Servers before 0.20 only send `time: <elapsed>:<total>` in whole seconds.
        let legacy_time = response.get("time").and_then(|t| t.split_once(':'));
        let elapsed = parse_field(response, "elapsed")
            .or_else(|| legacy_time.and_then(|(e, _)| e.parse().ok()));
        let duration = parse_field(response, "duration")
            .or_else(|| legacy_time.and_then(|(_, d)| d.parse().ok()));

        let volume = parse_field::<i32>(response, "volume")
            .and_then(|v| u8::try_from(v).ok())
            .filter(|v| *v <= 100);

        Self {
            state: parse_field(response, "state").unwrap_or_default(),
            song_id: parse_field(response, "songid"),
            song_pos: parse_field(response, "song"),
            next_song_id: parse_field(response, "nextsongid"),
            next_song_pos: parse_field(response, "nextsong"),
            elapsed,
            duration,
            bitrate: parse_field(response, "bitrate"),
            audio: response.get("audio").map(AudioFormat::parse),
            volume,
            random: parse_flag(response, "random"),
            repeat: parse_flag(response, "repeat"),
            single: parse_field(response, "single").unwrap_or_default(),
            consume: parse_field(response, "consume").unwrap_or_default(),
            playlist_version: parse_field(response, "playlist"),
            playlist_length: parse_field(response, "playlistlength"),
            crossfade: parse_field(response, "xfade"),
            updating_db: parse_field(response, "updating_db"),
            error: response.get("error").map(str::to_string),
        }
    }

    pub fn is_updating(&self) -> bool {
        self.updating_db.is_some()
    }
}

/// Database counters from the `stats` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub artists: Option<u64>,
    pub albums: Option<u64>,
    pub songs: Option<u64>,
    /// Daemon uptime in seconds.
    pub uptime: Option<u64>,
    /// Seconds of music played since startup.
    pub playtime: Option<u64>,
    /// Sum of all song durations in the database, seconds.
    pub db_playtime: Option<u64>,
    pub db_update: Option<DateTime<Utc>>,
}

impl Statistics {
    pub fn from_response(response: &Response) -> Self {
        Self {
            artists: parse_field(response, "artists"),
            albums: parse_field(response, "albums"),
            songs: parse_field(response, "songs"),
            uptime: parse_field(response, "uptime"),
            playtime: parse_field(response, "playtime"),
            db_playtime: parse_field(response, "db_playtime"),
            db_update: parse_field::<i64>(response, "db_update")
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
        }
    }
}

fn record_field<'a>(record: &[(&'a str, &'a str)], key: &str) -> Option<&'a str> {
    record.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// One audio output from the `outputs` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub id: u32,
    pub name: String,
    pub plugin: Option<String>,
    pub enabled: bool,
}

impl Output {
    pub fn list_from_response(response: &Response) -> Vec<Self> {
        response
            .records("outputid")
            .into_iter()
            .filter_map(|record| {
                Some(Self {
                    id: record_field(&record, "outputid")?.parse().ok()?,
                    name: record_field(&record, "outputname")
                        .unwrap_or_default()
                        .to_string(),
                    plugin: record_field(&record, "plugin").map(str::to_string),
                    enabled: record_field(&record, "outputenabled") == Some("1"),
                })
            })
            .collect()
    }
}

/// A category of status fields that differs between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusChange {
    State,
    Track,
    TrackPosition,
    Volume,
    Random,
    Repeat,
    Single,
    Consume,
    Playlist,
    Library,
}

/// Changed categories between two snapshots, in dispatch order.
pub fn diff(previous: &MpdStatus, current: &MpdStatus) -> Vec<StatusChange> {
    let mut changes = Vec::new();
    if previous.state != current.state {
        changes.push(StatusChange::State);
    }
    if previous.song_id != current.song_id || previous.song_pos != current.song_pos {
        changes.push(StatusChange::Track);
    }
    if previous.elapsed != current.elapsed || previous.duration != current.duration {
        changes.push(StatusChange::TrackPosition);
    }
    if previous.volume != current.volume {
        changes.push(StatusChange::Volume);
    }
    if previous.random != current.random {
        changes.push(StatusChange::Random);
    }
    if previous.repeat != current.repeat {
        changes.push(StatusChange::Repeat);
    }
    if previous.single != current.single {
        changes.push(StatusChange::Single);
    }
    if previous.consume != current.consume {
        changes.push(StatusChange::Consume);
    }
    if previous.playlist_version != current.playlist_version {
        changes.push(StatusChange::Playlist);
    }
    if previous.updating_db != current.updating_db {
        changes.push(StatusChange::Library);
    }
    changes
}

/// Result of replacing the cached status.
#[derive(Debug, Clone)]
pub struct StatusDiff {
    pub previous: Arc<MpdStatus>,
    pub current: Arc<MpdStatus>,
    pub changes: Vec<StatusChange>,
}

impl StatusDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn contains(&self, change: StatusChange) -> bool {
        self.changes.contains(&change)
    }

    /// One event per changed category.
    pub fn events(&self) -> Vec<MpdEvent> {
        let (prev, cur) = (&self.previous, &self.current);
        self.changes
            .iter()
            .map(|change| match change {
                StatusChange::State => MpdEvent::StateChanged {
                    state: cur.state,
                    previous: prev.state,
                },
                StatusChange::Track => MpdEvent::TrackChanged {
                    song_id: cur.song_id,
                    song_pos: cur.song_pos,
                    previous_song_id: prev.song_id,
                },
                StatusChange::TrackPosition => MpdEvent::TrackPositionChanged {
                    elapsed: cur.elapsed,
                    duration: cur.duration,
                },
                StatusChange::Volume => MpdEvent::VolumeChanged {
                    volume: cur.volume,
                    previous: prev.volume,
                },
                StatusChange::Random => MpdEvent::RandomChanged { random: cur.random },
                StatusChange::Repeat => MpdEvent::RepeatChanged { repeat: cur.repeat },
                StatusChange::Single => MpdEvent::SingleChanged { single: cur.single },
                StatusChange::Consume => MpdEvent::ConsumeChanged {
                    consume: cur.consume,
                },
                StatusChange::Playlist => MpdEvent::PlaylistChanged {
                    version: cur.playlist_version,
                    previous_version: prev.playlist_version,
                    length: cur.playlist_length,
                },
                StatusChange::Library => MpdEvent::LibraryStateChanged {
                    updating: cur.is_updating(),
                    db_changed: false,
                },
            })
            .collect()
    }
}

#[derive(Default)]
struct CacheInner {
    /// `None` until the first refresh after connect.
    status: Option<Arc<MpdStatus>>,
    statistics: Option<Arc<Statistics>>,
    outputs: Arc<Vec<Output>>,
}

/// Last known server state.
///
/// Written only by the holder of the connection (inside a [`Session`]);
/// readers get cheap `Arc` snapshots and may lag one refresh behind.
#[derive(Default)]
pub struct StatusCache {
    inner: RwLock<CacheInner>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest status, or the empty default before the first refresh.
    pub fn status(&self) -> Arc<MpdStatus> {
        self.inner.read().status.clone().unwrap_or_default()
    }

    pub fn is_primed(&self) -> bool {
        self.inner.read().status.is_some()
    }

    pub fn statistics(&self) -> Option<Arc<Statistics>> {
        self.inner.read().statistics.clone()
    }

    pub fn outputs(&self) -> Arc<Vec<Output>> {
        self.inner.read().outputs.clone()
    }

    /// Forget everything (on connect and disconnect).
    pub fn reset(&self) {
        *self.inner.write() = CacheInner::default();
    }

    /// Replace the status wholesale and report what changed.
    ///
    /// The first snapshot after a reset is the baseline and reports no changes.
    pub fn apply(&self, status: MpdStatus) -> StatusDiff {
        let current = Arc::new(status);
        let mut inner = self.inner.write();
        let previous = inner.status.replace(current.clone());
        drop(inner);

        match previous {
            Some(previous) => {
                let changes = diff(&previous, &current);
                trace!("Status changes: {:?}", changes);
                StatusDiff {
                    previous,
                    current,
                    changes,
                }
            }
            None => StatusDiff {
                previous: current.clone(),
                current,
                changes: Vec::new(),
            },
        }
    }

    pub fn set_statistics(&self, statistics: Statistics) -> Arc<Statistics> {
        let statistics = Arc::new(statistics);
        self.inner.write().statistics = Some(statistics.clone());
        statistics
    }

    pub fn set_outputs(&self, outputs: Vec<Output>) -> Arc<Vec<Output>> {
        let outputs = Arc::new(outputs);
        self.inner.write().outputs = outputs.clone();
        outputs
    }

    /// Run `status` on the held connection and fold the result in.
    pub async fn refresh_status(&self, session: &mut Session<'_>) -> Result<StatusDiff> {
        let response = session.execute(&Command::new("status")).await?;
        Ok(self.apply(MpdStatus::from_response(&response)))
    }

    pub async fn refresh_statistics(&self, session: &mut Session<'_>) -> Result<Arc<Statistics>> {
        let response = session.execute(&Command::new("stats")).await?;
        Ok(self.set_statistics(Statistics::from_response(&response)))
    }

    pub async fn refresh_outputs(&self, session: &mut Session<'_>) -> Result<Arc<Vec<Output>>> {
        let response = session.execute(&Command::new("outputs")).await?;
        Ok(self.set_outputs(Output::list_from_response(&response)))
    }
}
