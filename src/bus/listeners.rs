//! Listener registry and synchronous dispatcher.
//!
//! Registrations live in a copy-on-write list: dispatch clones the current
//! `Arc<Vec<_>>` and releases the lock before invoking any callback, so a
//! listener may add or remove registrations (including itself) from inside
//! its own callback.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use super::events::{sort_for_dispatch, EventKind, MpdEvent};
use super::SharedBus;
use crate::client::connection::ConnectionState;
use crate::client::idle::IdleSubsystem;
use crate::client::status::{Output, PlayerState, ReplayMode};

/// Typed callbacks for status changes. Every method defaults to a no-op.
///
/// Callbacks run on the dispatching task (the idle monitor, or the caller
/// of an explicit refresh). They must not block; hop to another task or
/// thread for anything slow.
pub trait StatusChangeListener: Send + Sync {
    fn connection_state_changed(&self, _state: ConnectionState, _previous: ConnectionState) {}
    fn connection_lost(&self, _reason: &str) {}
    fn connection_failed(&self, _reason: &str) {}
    fn monitor_stopped(&self, _reason: &str) {}
    fn state_changed(&self, _state: PlayerState, _previous: PlayerState) {}
    fn track_changed(
        &self,
        _song_id: Option<u32>,
        _song_pos: Option<u32>,
        _previous_song_id: Option<u32>,
    ) {
    }
    fn track_position_changed(&self, _elapsed: Option<f64>, _duration: Option<f64>) {}
    fn volume_changed(&self, _volume: Option<u8>, _previous: Option<u8>) {}
    fn random_changed(&self, _random: bool) {}
    fn repeat_changed(&self, _repeat: bool) {}
    fn single_changed(&self, _single: ReplayMode) {}
    fn consume_changed(&self, _consume: ReplayMode) {}
    fn outputs_changed(&self, _outputs: &[Output]) {}
    fn playlist_changed(&self, _version: Option<u32>, _previous_version: Option<u32>) {}
    fn stored_playlist_changed(&self) {}
    fn sticker_changed(&self) {}
    fn library_state_changed(&self, _updating: bool, _db_changed: bool) {}
    fn subsystem_changed(&self, _subsystem: IdleSubsystem) {}
}

/// Route one event to the matching callback.
fn deliver(listener: &dyn StatusChangeListener, event: &MpdEvent) {
    match event {
        MpdEvent::ConnectionStateChanged { state, previous } => {
            listener.connection_state_changed(*state, *previous)
        }
        MpdEvent::ConnectionLost { reason } => listener.connection_lost(reason),
        MpdEvent::ConnectionFailed { reason } => listener.connection_failed(reason),
        MpdEvent::MonitorStopped { reason } => listener.monitor_stopped(reason),
        MpdEvent::StateChanged { state, previous } => listener.state_changed(*state, *previous),
        MpdEvent::TrackChanged {
            song_id,
            song_pos,
            previous_song_id,
        } => listener.track_changed(*song_id, *song_pos, *previous_song_id),
        MpdEvent::TrackPositionChanged { elapsed, duration } => {
            listener.track_position_changed(*elapsed, *duration)
        }
        MpdEvent::VolumeChanged { volume, previous } => listener.volume_changed(*volume, *previous),
        MpdEvent::RandomChanged { random } => listener.random_changed(*random),
        MpdEvent::RepeatChanged { repeat } => listener.repeat_changed(*repeat),
        MpdEvent::SingleChanged { single } => listener.single_changed(*single),
        MpdEvent::ConsumeChanged { consume } => listener.consume_changed(*consume),
        MpdEvent::OutputsChanged { outputs } => listener.outputs_changed(outputs),
        MpdEvent::PlaylistChanged {
            version,
            previous_version,
            ..
        } => listener.playlist_changed(*version, *previous_version),
        MpdEvent::StoredPlaylistChanged => listener.stored_playlist_changed(),
        MpdEvent::StickerChanged => listener.sticker_changed(),
        MpdEvent::LibraryStateChanged {
            updating,
            db_changed,
        } => listener.library_state_changed(*updating, *db_changed),
        MpdEvent::SubsystemChanged { subsystem } => listener.subsystem_changed(*subsystem),
    }
}

/// Which event kinds a registration wants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    kinds: Option<HashSet<EventKind>>,
}

impl EventFilter {
    /// Accept every event.
    pub fn all() -> Self {
        Self { kinds: None }
    }

    /// Accept only the listed kinds.
    pub fn only(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
        }
    }

    pub fn accepts(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().map_or(true, |kinds| kinds.contains(&kind))
    }
}

/// Handle returned by [`Dispatcher::add_listener`], used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
struct Registration {
    id: ListenerId,
    listener: Arc<dyn StatusChangeListener>,
    filter: EventFilter,
}

/// Thread-safe listener registry that also mirrors every event onto the bus.
pub struct Dispatcher {
    registrations: RwLock<Arc<Vec<Registration>>>,
    next_id: AtomicU64,
    bus: SharedBus,
}

impl Dispatcher {
    pub fn new(bus: SharedBus) -> Self {
        Self {
            registrations: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
            bus,
        }
    }

    pub fn bus(&self) -> &SharedBus {
        &self.bus
    }

    pub fn add_listener(&self, listener: Arc<dyn StatusChangeListener>) -> ListenerId {
        self.add_listener_filtered(listener, EventFilter::all())
    }

    pub fn add_listener_filtered(
        &self,
        listener: Arc<dyn StatusChangeListener>,
        filter: EventFilter,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut registrations = self.registrations.write();
        let mut updated: Vec<Registration> = registrations.iter().cloned().collect();
        updated.push(Registration {
            id,
            listener,
            filter,
        });
        *registrations = Arc::new(updated);
        id
    }

    /// Returns `false` if the id was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut registrations = self.registrations.write();
        if !registrations.iter().any(|r| r.id == id) {
            return false;
        }
        let updated: Vec<Registration> = registrations
            .iter()
            .filter(|r| r.id != id)
            .cloned()
            .collect();
        *registrations = Arc::new(updated);
        true
    }

    pub fn listener_count(&self) -> usize {
        self.registrations.read().len()
    }

    /// Deliver one event to every listener registered at call time.
    pub fn dispatch(&self, event: &MpdEvent) {
        let snapshot = self.registrations.read().clone();
        let kind = event.kind();
        trace!("Dispatching {} to {} listeners", kind, snapshot.len());

        for registration in snapshot.iter() {
            if registration.filter.accepts(kind) {
                deliver(registration.listener.as_ref(), event);
            }
        }
        self.bus.publish(event.clone());
    }

    /// Sort a batch into dispatch order and deliver it.
    pub fn dispatch_all(&self, mut events: Vec<MpdEvent>) {
        sort_for_dispatch(&mut events);
        for event in &events {
            self.dispatch(event);
        }
    }
}
