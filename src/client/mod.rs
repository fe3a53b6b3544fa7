//! MPD client: connection manager, command executor, idle monitor and
//! status cache wired around one shared connection.
//!
//! [`MpdClient`] is an explicitly constructed value; create one per server
//! and pass it (usually in an `Arc`) to whoever needs it.

pub mod connection;
pub mod executor;
pub mod idle;
pub mod status;
pub mod supervisor;

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

pub use connection::{
    ConnectionManager, ConnectionSettings, ConnectionSettingsProvider, ConnectionState,
    ProtocolVersion,
};
pub use executor::{CommandExecutor, Session};
pub use idle::{IdleMonitor, IdleSubsystem, MonitorState};
pub use status::{MpdStatus, Output, PlayerState, ReplayMode, Statistics, StatusChange};
pub use supervisor::{MonitorTask, RetryConfig, Supervised, Supervisor, SupervisorContext};

use crate::bus::{
    create_bus, Dispatcher, EventFilter, ListenerId, MpdEvent, SharedBus, StatusChangeListener,
};
use crate::error::{MpdError, Result};
use crate::protocol::{Command, CommandList, ListResponse, Response, MAX_BINARY_SIZE};
use connection::Link;

/// Client for one MPD server.
pub struct MpdClient {
    link: Arc<Link>,
    connection: ConnectionManager,
    executor: CommandExecutor,
    monitor: IdleMonitor,
}

impl MpdClient {
    pub fn new(provider: Arc<dyn ConnectionSettingsProvider>) -> Self {
        Self::with_options(provider, create_bus(), Vec::new())
    }

    /// Full constructor: a shared bus and the subsystems the idle monitor
    /// watches (empty means all).
    pub fn with_options(
        provider: Arc<dyn ConnectionSettingsProvider>,
        bus: SharedBus,
        subsystems: Vec<IdleSubsystem>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(bus));
        let link = Arc::new(Link::new(dispatcher));
        Self {
            connection: ConnectionManager::new(link.clone(), provider),
            executor: CommandExecutor::new(link.clone()),
            monitor: IdleMonitor::new(link.clone(), subsystems),
            link,
        }
    }

    // Connection

    pub async fn connect(&self) -> Result<ConnectionState> {
        self.connection.connect().await
    }

    pub async fn connect_with(&self, settings: ConnectionSettings) -> Result<ConnectionState> {
        self.connection.connect_with(settings).await
    }

    pub async fn ensure_connected(&self) -> Result<ConnectionState> {
        self.connection.ensure_connected().await
    }

    /// Stop the idle monitor, then close the connection.
    pub async fn disconnect(&self) {
        self.monitor.stop().await;
        self.connection.disconnect().await;
        info!("Disconnected from MPD");
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn server_version(&self) -> Option<ProtocolVersion> {
        self.connection.server_version()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    // Commands

    pub async fn execute(&self, command: &Command) -> Result<Response> {
        self.executor.execute(command).await
    }

    pub async fn execute_list(&self, list: &CommandList) -> Result<ListResponse> {
        self.executor.execute_list(list).await
    }

    /// Hold the connection for several commands in a row.
    pub async fn session(&self) -> Result<Session<'_>> {
        let session = self.executor.session().await;
        if !session.is_connected() {
            return Err(MpdError::NotConnected);
        }
        Ok(session)
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Fetch a binary resource in chunks (`albumart`, `readpicture`).
    ///
    /// Repeats `<command> <uri> <offset>` until `size` bytes have arrived.
    /// The connection is held for the whole transfer.
    pub async fn fetch_binary(&self, command: &str, uri: &str) -> Result<Vec<u8>> {
        let mut session = self.session().await?;
        let mut data = Vec::new();
        loop {
            let request = Command::new(command).arg(uri).arg(data.len().to_string());
            let response = session.execute(&request).await?;

            let size: usize = response
                .get("size")
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| MpdError::protocol(format!("{} response without size", command)))?;
            if size > MAX_BINARY_SIZE {
                return Err(MpdError::protocol(format!(
                    "{} announced {} bytes",
                    command, size
                )));
            }

            let chunk = response.binary().unwrap_or_default();
            if chunk.is_empty() {
                break;
            }
            data.extend_from_slice(chunk);
            debug!("{} {}: {}/{} bytes", command, uri, data.len(), size);
            if data.len() >= size {
                break;
            }
        }
        Ok(data)
    }

    // Idle monitor

    pub fn start_idle_monitor(&self) -> Result<()> {
        self.monitor.start()
    }

    pub async fn stop_idle_monitor(&self) {
        self.monitor.stop().await
    }

    pub fn monitor_state(&self) -> MonitorState {
        self.monitor.state()
    }

    pub async fn wait_idle_monitor_stopped(&self) {
        self.monitor.wait_stopped().await
    }

    pub fn idle_monitor(&self) -> &IdleMonitor {
        &self.monitor
    }

    // Status cache

    /// Run `status` now and dispatch whatever changed.
    pub async fn refresh_status(&self) -> Result<Arc<MpdStatus>> {
        let mut session = self.session().await?;
        let diff = self.link.cache.refresh_status(&mut session).await?;
        session.defer(diff.events());
        Ok(diff.current)
    }

    pub async fn refresh_statistics(&self) -> Result<Arc<Statistics>> {
        let mut session = self.session().await?;
        self.link.cache.refresh_statistics(&mut session).await
    }

    /// Last known status. Empty until the first refresh after connect.
    pub fn status(&self) -> Arc<MpdStatus> {
        self.link.cache.status()
    }

    pub fn statistics(&self) -> Option<Arc<Statistics>> {
        self.link.cache.statistics()
    }

    /// Outputs as of the last `output` notification.
    pub fn outputs(&self) -> Arc<Vec<Output>> {
        self.link.cache.outputs()
    }

    // Listeners

    pub fn add_listener(&self, listener: Arc<dyn StatusChangeListener>) -> ListenerId {
        self.link.dispatcher.add_listener(listener)
    }

    pub fn add_listener_filtered(
        &self,
        listener: Arc<dyn StatusChangeListener>,
        filter: EventFilter,
    ) -> ListenerId {
        self.link.dispatcher.add_listener_filtered(listener, filter)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.link.dispatcher.remove_listener(id)
    }

    /// Stream of every dispatched event.
    pub fn subscribe(&self) -> broadcast::Receiver<MpdEvent> {
        self.link.dispatcher.bus().subscribe()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.link.dispatcher
    }
}
