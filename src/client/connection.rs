//! Connection lifecycle: open, greet, authenticate, tear down.
//!
//! The socket lives in a [`Link`], the state shared by the connection
//! manager, the command executor and the idle monitor. Ownership of the
//! socket is a baton: a FIFO-fair async mutex around the transport plus a
//! watch counter of foreground callers queued for it, which the idle
//! monitor observes to know when to give the baton back.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard};

use super::executor::Session;
use super::status::StatusCache;
use crate::bus::{Dispatcher, MpdEvent};
use crate::error::{MpdError, Result};
use crate::protocol::{read_response, Command, LineTransport};

pub const DEFAULT_PORT: u16 = 6600;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const GREETING_PREFIX: &str = "OK MPD ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Where and how to connect.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    /// Per-line read limit for command responses. `None` waits forever.
    pub response_timeout: Option<Duration>,
}

impl ConnectionSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_PORT)
    }
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("connect_timeout", &self.connect_timeout)
            .field("response_timeout", &self.response_timeout)
            .finish()
    }
}

/// Supplies connection parameters on every (re)connect request.
pub trait ConnectionSettingsProvider: Send + Sync {
    fn connection_settings(&self) -> ConnectionSettings;
}

impl ConnectionSettingsProvider for ConnectionSettings {
    fn connection_settings(&self) -> ConnectionSettings {
        self.clone()
    }
}

/// Protocol version announced in the greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether the server speaks at least `major.minor`.
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Parse `OK MPD <major>.<minor>[.<patch>]`.
pub fn parse_greeting(line: &str) -> Result<ProtocolVersion> {
    let version = line
        .strip_prefix(GREETING_PREFIX)
        .ok_or_else(|| MpdError::protocol(format!("unexpected greeting {:?}", line)))?;

    let mut parts = version.trim().split('.');
    let mut next = |required: bool| -> Result<u32> {
        match parts.next() {
            Some(part) => part
                .parse()
                .map_err(|_| MpdError::protocol(format!("bad version in greeting {:?}", line))),
            None if required => Err(MpdError::protocol(format!(
                "incomplete version in greeting {:?}",
                line
            ))),
            None => Ok(0),
        }
    };
    let major = next(true)?;
    let minor = next(true)?;
    let patch = next(false)?;
    Ok(ProtocolVersion::new(major, minor, patch))
}

/// Read the greeting and authenticate on a freshly opened transport.
///
/// A rejected password is reported as [`MpdError::Auth`]; every other
/// failure is fatal to the transport.
pub async fn handshake(
    transport: &mut LineTransport,
    settings: &ConnectionSettings,
) -> Result<ProtocolVersion> {
    let greeting = transport
        .read_line_timeout(Some(settings.connect_timeout))
        .await?;
    let version = parse_greeting(&greeting)?;
    tracing::debug!("Server {} speaks protocol {}", transport.peer(), version);

    if let Some(password) = settings.password.as_deref() {
        let command = Command::new("password").arg(password);
        transport.write_line(&command.encode()?).await?;
        match read_response(transport, Some(settings.connect_timeout)).await {
            Ok(_) => {}
            Err(MpdError::Ack(ack)) => return Err(MpdError::Auth(ack)),
            Err(e) => return Err(e),
        }
    }
    Ok(version)
}

#[derive(Debug, Default)]
struct LinkInfo {
    state: ConnectionState,
    version: Option<ProtocolVersion>,
    /// Parameters of the last successful connect, reused by `ensure_connected`.
    settings: Option<ConnectionSettings>,
}

/// Announces a foreground caller queued for the transport until dropped.
struct WaitTicket<'a>(&'a watch::Sender<usize>);

impl<'a> WaitTicket<'a> {
    fn new(waiting: &'a watch::Sender<usize>) -> Self {
        waiting.send_modify(|n| *n += 1);
        Self(waiting)
    }
}

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Shared connection state.
pub(crate) struct Link {
    transport: Mutex<Option<LineTransport>>,
    waiting: watch::Sender<usize>,
    info: RwLock<LinkInfo>,
    pub(crate) cache: StatusCache,
    pub(crate) dispatcher: Arc<Dispatcher>,
}

impl Link {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let (waiting, _) = watch::channel(0);
        Self {
            transport: Mutex::new(None),
            waiting,
            info: RwLock::new(LinkInfo::default()),
            cache: StatusCache::new(),
            dispatcher,
        }
    }

    /// A link that is already connected over `transport`.
    #[cfg(test)]
    pub(crate) fn connected(dispatcher: Arc<Dispatcher>, transport: LineTransport) -> Self {
        let link = Self::new(dispatcher);
        *link.transport.try_lock().expect("fresh mutex") = Some(transport);
        link.set_connected(ProtocolVersion::new(0, 23, 5), ConnectionSettings::default());
        link
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.info.read().state
    }

    pub(crate) fn version(&self) -> Option<ProtocolVersion> {
        self.info.read().version
    }

    pub(crate) fn response_timeout(&self) -> Option<Duration> {
        self.info
            .read()
            .settings
            .as_ref()
            .and_then(|s| s.response_timeout)
    }

    fn last_settings(&self) -> Option<ConnectionSettings> {
        self.info.read().settings.clone()
    }

    /// Take the transport as a foreground caller.
    ///
    /// While queued, the waiting counter is raised so an idling monitor
    /// interrupts itself and hands the transport over.
    pub(crate) async fn lock_foreground(&self) -> MutexGuard<'_, Option<LineTransport>> {
        let _ticket = WaitTicket::new(&self.waiting);
        self.transport.lock().await
    }

    /// Take the transport for the idle monitor, once nobody else is queued.
    pub(crate) async fn lock_idle(&self) -> MutexGuard<'_, Option<LineTransport>> {
        let mut waiting = self.waiting.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = waiting.wait_for(|n| *n == 0).await;
        self.transport.lock().await
    }

    pub(crate) fn has_waiters(&self) -> bool {
        *self.waiting.borrow() > 0
    }

    /// Receiver for the waiting counter, used by the idle loop.
    pub(crate) fn waiters(&self) -> watch::Receiver<usize> {
        self.waiting.subscribe()
    }

    /// Record a state transition; returns the event to dispatch, if any.
    pub(crate) fn set_state(&self, state: ConnectionState) -> Option<MpdEvent> {
        let mut info = self.info.write();
        let previous = info.state;
        if previous == state {
            return None;
        }
        info.state = state;
        if state != ConnectionState::Connected {
            info.version = None;
        }
        drop(info);

        tracing::info!("MPD connection {} -> {}", previous, state);
        Some(MpdEvent::ConnectionStateChanged { state, previous })
    }

    /// An established connection died. Only the first report after a
    /// successful connect yields events.
    pub(crate) fn mark_lost(&self, reason: &str) -> Vec<MpdEvent> {
        if self.state() != ConnectionState::Connected {
            return Vec::new();
        }
        self.cache.reset();
        let mut events = vec![MpdEvent::ConnectionLost {
            reason: reason.to_string(),
        }];
        events.extend(self.set_state(ConnectionState::Disconnected));
        tracing::warn!("MPD connection lost: {}", reason);
        events
    }

    fn set_connected(&self, version: ProtocolVersion, settings: ConnectionSettings) -> Option<MpdEvent> {
        {
            let mut info = self.info.write();
            info.settings = Some(settings);
        }
        let event = self.set_state(ConnectionState::Connected);
        self.info.write().version = Some(version);
        event
    }
}

/// Owns connect / disconnect and exposes connectivity state.
pub struct ConnectionManager {
    link: Arc<Link>,
    provider: Arc<dyn ConnectionSettingsProvider>,
}

impl ConnectionManager {
    pub(crate) fn new(link: Arc<Link>, provider: Arc<dyn ConnectionSettingsProvider>) -> Self {
        Self { link, provider }
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Version from the greeting of the current connection.
    pub fn server_version(&self) -> Option<ProtocolVersion> {
        self.link.version()
    }

    /// Connect with fresh settings from the provider.
    ///
    /// A no-op when already connected: no second handshake is performed.
    pub async fn connect(&self) -> Result<ConnectionState> {
        if self.is_connected() {
            return Ok(ConnectionState::Connected);
        }
        self.connect_with(self.provider.connection_settings()).await
    }

    /// Reconnect with the parameters of the last successful connect,
    /// falling back to the provider.
    pub async fn ensure_connected(&self) -> Result<ConnectionState> {
        if self.is_connected() {
            return Ok(ConnectionState::Connected);
        }
        let settings = self
            .link
            .last_settings()
            .unwrap_or_else(|| self.provider.connection_settings());
        self.connect_with(settings).await
    }

    pub async fn connect_with(&self, settings: ConnectionSettings) -> Result<ConnectionState> {
        let mut session = Session::foreground(&self.link).await;
        if session.has_transport() {
            return Ok(ConnectionState::Connected);
        }

        session.defer(self.link.set_state(ConnectionState::Connecting));
        tracing::info!("Connecting to MPD at {}:{}", settings.host, settings.port);

        match open_and_greet(&settings).await {
            Ok((transport, version)) => {
                tracing::info!("Connected to MPD {} at {}", version, transport.peer());
                self.link.cache.reset();
                session.install(transport);
                session.defer(self.link.set_connected(version, settings));
                Ok(ConnectionState::Connected)
            }
            Err(e) => {
                tracing::warn!("MPD connection to {}:{} failed: {}", settings.host, settings.port, e);
                session.defer(Some(MpdEvent::ConnectionFailed {
                    reason: e.to_string(),
                }));
                session.defer(self.link.set_state(ConnectionState::Disconnected));
                Err(e)
            }
        }
    }

    /// Close the connection politely. Emits a state change but no
    /// `ConnectionLost`: the caller asked for it.
    pub async fn disconnect(&self) {
        let mut session = Session::foreground(&self.link).await;
        if let Some(mut transport) = session.take_transport() {
            let _ = transport.write_line("close").await;
            transport.close().await;
        }
        self.link.cache.reset();
        session.defer(self.link.set_state(ConnectionState::Disconnected));
    }
}

async fn open_and_greet(settings: &ConnectionSettings) -> Result<(LineTransport, ProtocolVersion)> {
    let mut transport =
        LineTransport::open(&settings.host, settings.port, settings.connect_timeout).await?;
    match handshake(&mut transport, settings).await {
        Ok(version) => Ok((transport, version)),
        Err(e) => {
            transport.close().await;
            Err(e)
        }
    }
}
