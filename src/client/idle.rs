//! Idle monitor.
//!
//! A background task that parks the connection in `idle` and turns the
//! server's `changed:` notifications into typed events. Whenever a
//! foreground caller queues for the connection, the monitor sends
//! `noidle`, drains the response and steps aside; it goes back to idling
//! as soon as the caller is done.
//!
//! Any transport failure stops the monitor for good. Restarting it after a
//! reconnect is up to the owner (see [`crate::client::supervisor`]). A
//! server that rejects `idle` itself (e.g. an unknown subsystem) also stops
//! it, reported as [`MpdEvent::MonitorStopped`] since the connection is fine.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::connection::{ConnectionState, Link};
use super::executor::Session;
use super::status::StatusChange;
use crate::bus::{EventKind, MpdEvent};
use crate::error::{MpdError, Result};
use crate::protocol::{Command, Response};

/// Server subsystems reported by `idle`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum IdleSubsystem {
    Database,
    Update,
    StoredPlaylist,
    Playlist,
    Player,
    Mixer,
    Output,
    Options,
    Sticker,
    Subscription,
    Message,
    Partition,
    Neighbor,
    Mount,
}

impl IdleSubsystem {
    pub const ALL: [IdleSubsystem; 14] = [
        Self::Database,
        Self::Update,
        Self::StoredPlaylist,
        Self::Playlist,
        Self::Player,
        Self::Mixer,
        Self::Output,
        Self::Options,
        Self::Sticker,
        Self::Subscription,
        Self::Message,
        Self::Partition,
        Self::Neighbor,
        Self::Mount,
    ];

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Update => "update",
            Self::StoredPlaylist => "stored_playlist",
            Self::Playlist => "playlist",
            Self::Player => "player",
            Self::Mixer => "mixer",
            Self::Output => "output",
            Self::Options => "options",
            Self::Sticker => "sticker",
            Self::Subscription => "subscription",
            Self::Message => "message",
            Self::Partition => "partition",
            Self::Neighbor => "neighbor",
            Self::Mount => "mount",
        }
    }

    /// Whether a change here can show up in `status`.
    fn affects_status(&self) -> bool {
        matches!(
            self,
            Self::Player
                | Self::Mixer
                | Self::Options
                | Self::Playlist
                | Self::Database
                | Self::Update
        )
    }

    fn affects_library(&self) -> bool {
        matches!(self, Self::Database | Self::Update)
    }
}

impl fmt::Display for IdleSubsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdleSubsystem {
    type Err = MpdError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|sub| sub.as_str() == s)
            .ok_or_else(|| MpdError::InvalidArgument(format!("unknown idle subsystem {:?}", s)))
    }
}

/// Parse the `changed:` lines of an idle response, in server order.
///
/// Unknown names (from servers newer than this client) are skipped.
pub fn parse_changed(response: &Response) -> Vec<IdleSubsystem> {
    let mut changed = Vec::new();
    for name in response.get_all("changed") {
        match name.parse::<IdleSubsystem>() {
            Ok(sub) if !changed.contains(&sub) => changed.push(sub),
            Ok(_) => {}
            Err(_) => debug!("Ignoring unknown idle subsystem {:?}", name),
        }
    }
    changed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Stopped,
    IdleWaiting,
    Processing,
}

/// Refresh whatever the changed subsystems touch and collect the events.
///
/// Runs with the connection held. A command error during a refresh is
/// logged and skipped; a fatal error has already been recorded on the
/// session and ends the refresh.
pub(crate) async fn process_changes(
    session: &mut Session<'_>,
    changed: &[IdleSubsystem],
) -> Result<Vec<MpdEvent>> {
    let link = session.link();
    let mut events = Vec::new();
    let set: BTreeSet<IdleSubsystem> = changed.iter().copied().collect();
    debug!("Processing changes: {:?}", set);

    let mut playlist_reported = false;
    if set.iter().any(IdleSubsystem::affects_status) {
        match link.cache.refresh_status(session).await {
            Ok(diff) => {
                playlist_reported = diff.contains(StatusChange::Playlist);
                events.extend(diff.events());
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!("Status refresh failed: {}", e),
        }
    }

    if set.iter().any(IdleSubsystem::affects_library) {
        match link.cache.refresh_statistics(session).await {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!("Statistics refresh failed: {}", e),
        }
        events.retain(|e| e.kind() != EventKind::LibraryStateChanged);
        events.push(MpdEvent::LibraryStateChanged {
            updating: link.cache.status().is_updating(),
            db_changed: set.contains(&IdleSubsystem::Database),
        });
    }

    for sub in &set {
        match sub {
            IdleSubsystem::Output => match link.cache.refresh_outputs(session).await {
                Ok(outputs) => events.push(MpdEvent::OutputsChanged {
                    outputs: outputs.as_ref().clone(),
                }),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Output refresh failed: {}", e),
            },
            // Queue edits that keep the version (e.g. priority changes)
            // still deserve one event.
            IdleSubsystem::Playlist if !playlist_reported => {
                let status = link.cache.status();
                events.push(MpdEvent::PlaylistChanged {
                    version: status.playlist_version,
                    previous_version: status.playlist_version,
                    length: status.playlist_length,
                });
            }
            IdleSubsystem::StoredPlaylist => events.push(MpdEvent::StoredPlaylistChanged),
            IdleSubsystem::Sticker => events.push(MpdEvent::StickerChanged),
            IdleSubsystem::Subscription
            | IdleSubsystem::Message
            | IdleSubsystem::Partition
            | IdleSubsystem::Neighbor
            | IdleSubsystem::Mount => events.push(MpdEvent::SubsystemChanged { subsystem: *sub }),
            _ => {}
        }
    }
    Ok(events)
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owner of the background idle task.
pub struct IdleMonitor {
    link: Arc<Link>,
    subsystems: Vec<IdleSubsystem>,
    state: Arc<watch::Sender<MonitorState>>,
    running: Mutex<Option<Running>>,
}

impl IdleMonitor {
    pub(crate) fn new(link: Arc<Link>, subsystems: Vec<IdleSubsystem>) -> Self {
        let (state, _) = watch::channel(MonitorState::Stopped);
        Self {
            link,
            subsystems,
            state: Arc::new(state),
            running: Mutex::new(None),
        }
    }

    /// Subsystems passed to `idle`; empty means all.
    pub fn subsystems(&self) -> &[IdleSubsystem] {
        &self.subsystems
    }

    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<MonitorState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Spawn the idle task. A no-op while it is already running.
    pub fn start(&self) -> Result<()> {
        if self.link.state() != ConnectionState::Connected {
            return Err(MpdError::NotConnected);
        }

        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Ok(());
        }

        let idle_line = Command::new("idle")
            .args(self.subsystems.iter().map(IdleSubsystem::as_str))
            .encode()?;
        let token = CancellationToken::new();
        self.state.send_replace(MonitorState::IdleWaiting);
        let handle = tokio::spawn(run(
            self.link.clone(),
            idle_line,
            token.clone(),
            self.state.clone(),
        ));
        *running = Some(Running { token, handle });
        info!("Idle monitor started");
        Ok(())
    }

    /// Stop the task and wait for it to leave the connection idle-free.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(Running { token, handle }) = running {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Idle monitor task ended abnormally: {}", e);
            }
            info!("Idle monitor stopped");
        }
    }

    /// Resolve once the monitor reaches [`MonitorState::Stopped`].
    pub async fn wait_stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == MonitorState::Stopped).await;
    }
}

impl Drop for IdleMonitor {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.token.cancel();
        }
    }
}

enum Wake {
    Server(Result<()>),
    Interrupt,
    Cancel,
}

async fn run(
    link: Arc<Link>,
    idle_line: String,
    token: CancellationToken,
    state: Arc<watch::Sender<MonitorState>>,
) {
    match idle_loop(&link, &idle_line, &token, &state).await {
        Ok(()) => {}
        // Already reported as a lost connection
        Err(e) if e.is_fatal() || matches!(e, MpdError::NotConnected) => {
            debug!("Idle loop ended: {}", e);
        }
        Err(e) => {
            warn!("Idle monitor stopped: {}", e);
            link.dispatcher.dispatch(&MpdEvent::MonitorStopped {
                reason: e.to_string(),
            });
        }
    }
    state.send_replace(MonitorState::Stopped);
}

async fn idle_loop(
    link: &Link,
    idle_line: &str,
    token: &CancellationToken,
    state: &watch::Sender<MonitorState>,
) -> Result<()> {
    // Changes reported in answer to `noidle`, handled on the next turn.
    let mut pending: Vec<IdleSubsystem> = Vec::new();

    loop {
        let mut session = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            session = Session::idle(link) => session,
        };
        if !session.is_connected() {
            return Err(MpdError::NotConnected);
        }

        if !link.cache.is_primed() {
            if let Err(e) = link.cache.refresh_status(&mut session).await {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!("Initial status refresh failed: {}", e);
            }
        }

        if !pending.is_empty() {
            state.send_replace(MonitorState::Processing);
            let changed = std::mem::take(&mut pending);
            let events = process_changes(&mut session, &changed).await?;
            session.defer(events);
            continue;
        }

        if link.has_waiters() {
            continue;
        }

        state.send_replace(MonitorState::IdleWaiting);
        session.write_line(idle_line).await?;
        trace!("Idling");

        let mut waiters = link.waiters();
        let wake = tokio::select! {
            biased;
            result = session.wait_readable() => Wake::Server(result),
            _ = waiters.wait_for(|n| *n > 0) => Wake::Interrupt,
            _ = token.cancelled() => Wake::Cancel,
        };

        match wake {
            Wake::Server(result) => {
                result?;
                let response = session.read_response(None).await?;
                let changed = parse_changed(&response);
                trace!("Woken by {:?}", changed);
                state.send_replace(MonitorState::Processing);
                let events = process_changes(&mut session, &changed).await?;
                session.defer(events);
            }
            Wake::Interrupt => {
                pending.extend(interrupt(&mut session).await?);
                trace!("Handing connection to foreground caller");
            }
            Wake::Cancel => {
                interrupt(&mut session).await?;
                return Ok(());
            }
        }
    }
}

/// Leave idle mode. The server answers `noidle` with whatever changed so far.
async fn interrupt(session: &mut Session<'_>) -> Result<Vec<IdleSubsystem>> {
    session.write_line("noidle").await?;
    let limit = session.link().response_timeout();
    let response = session.read_response(limit).await?;
    Ok(parse_changed(&response))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::bus::{create_bus, Dispatcher};
    use crate::protocol::LineTransport;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn rejected_idle_stops_monitor_with_event() {
        let mock = Builder::new()
            .write(b"status\n")
            .read(b"volume: 40\nstate: stop\nOK\n")
            .write(b"idle \"mount\"\n")
            .read(b"ACK [2@0] {idle} Unrecognized idle event: mount\n")
            .build();
        let dispatcher = Arc::new(Dispatcher::new(create_bus()));
        let mut rx = dispatcher.bus().subscribe();
        let link = Arc::new(Link::connected(
            dispatcher,
            LineTransport::from_stream(mock, "test"),
        ));
        let monitor = IdleMonitor::new(link.clone(), vec![IdleSubsystem::Mount]);

        monitor.start().unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), monitor.wait_stopped())
            .await
            .expect("monitor should stop");

        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert_eq!(link.state(), ConnectionState::Connected);
        match rx.try_recv().unwrap() {
            MpdEvent::MonitorStopped { reason } => assert!(reason.contains("mount")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn subsystem_names_round_trip() {
        for sub in IdleSubsystem::ALL {
            assert_eq!(sub.as_str().parse::<IdleSubsystem>().unwrap(), sub);
        }
        assert!("bogus".parse::<IdleSubsystem>().is_err());
    }

    #[test]
    fn parses_changed_lines_in_order() {
        let response = Response::new(vec![
            ("changed".to_string(), "mixer".to_string()),
            ("changed".to_string(), "player".to_string()),
            ("changed".to_string(), "foo".to_string()),
            ("changed".to_string(), "mixer".to_string()),
        ]);
        assert_eq!(
            parse_changed(&response),
            vec![IdleSubsystem::Mixer, IdleSubsystem::Player]
        );
    }

    #[test]
    fn serializes_wire_names() {
        let json = serde_json::to_string(&IdleSubsystem::StoredPlaylist).unwrap();
        assert_eq!(json, "\"stored_playlist\"");
    }
}
