//! Command executor.
//!
//! All traffic goes through a [`Session`], which holds the transport for
//! its whole lifetime. Sessions are exclusive, so commands from concurrent
//! callers run strictly one after the other in the order they got the
//! transport. A foreground session request interrupts the idle monitor.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::MutexGuard;
use tracing::{debug, trace};

use super::connection::{ConnectionState, Link};
use crate::bus::MpdEvent;
use crate::error::{MpdError, Result};
use crate::protocol::{
    read_list_response, read_response, Command, CommandList, LineTransport, ListResponse, Response,
};

/// Exclusive use of the connection.
///
/// Events raised while the session is open (a lost connection, a status
/// diff) are queued and dispatched when the session is dropped, after the
/// transport has been released, so listener callbacks never run while the
/// connection is held.
pub struct Session<'a> {
    link: &'a Link,
    guard: Option<MutexGuard<'a, Option<LineTransport>>>,
    pending: Vec<MpdEvent>,
}

impl<'a> Session<'a> {
    pub(crate) async fn foreground(link: &'a Link) -> Session<'a> {
        let guard = link.lock_foreground().await;
        Self::with_guard(link, guard)
    }

    pub(crate) async fn idle(link: &'a Link) -> Session<'a> {
        let guard = link.lock_idle().await;
        Self::with_guard(link, guard)
    }

    fn with_guard(link: &'a Link, guard: MutexGuard<'a, Option<LineTransport>>) -> Self {
        Self {
            link,
            guard: Some(guard),
            pending: Vec::new(),
        }
    }

    /// Whether a live transport is held.
    pub fn is_connected(&self) -> bool {
        self.guard
            .as_ref()
            .and_then(|g| g.as_ref())
            .is_some_and(|t| !t.is_dead())
    }

    pub(crate) fn has_transport(&self) -> bool {
        self.guard.as_ref().is_some_and(|g| g.is_some())
    }

    pub(crate) fn install(&mut self, transport: LineTransport) {
        if let Some(guard) = self.guard.as_mut() {
            **guard = Some(transport);
        }
    }

    pub(crate) fn take_transport(&mut self) -> Option<LineTransport> {
        self.guard.as_mut().and_then(|g| g.take())
    }

    /// Queue events for dispatch once the transport is released.
    pub(crate) fn defer(&mut self, events: impl IntoIterator<Item = MpdEvent>) {
        self.pending.extend(events);
    }

    pub(crate) fn link(&self) -> &'a Link {
        self.link
    }

    fn transport(&mut self) -> Result<&mut LineTransport> {
        match self.guard.as_mut().and_then(|g| g.as_mut()) {
            Some(transport) if !transport.is_dead() => Ok(transport),
            _ => Err(MpdError::NotConnected),
        }
    }

    /// Drop the transport after a fatal error and queue the loss events.
    pub(crate) fn fail(&mut self, err: MpdError) -> MpdError {
        if err.is_fatal() {
            if let Some(transport) = self.take_transport() {
                debug!("Dropping connection to {}: {}", transport.peer(), err);
            }
            let events = self.link.mark_lost(&err.to_string());
            self.pending.extend(events);
        }
        err
    }

    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|e| self.fail(e))
    }

    pub(crate) async fn write_line(&mut self, line: &str) -> Result<()> {
        let result = self.transport()?.write_line(line).await;
        self.check(result)
    }

    pub(crate) async fn read_response(&mut self, limit: Option<Duration>) -> Result<Response> {
        let result = read_response(self.transport()?, limit).await;
        self.check(result)
    }

    /// Wait for the server to start answering. Cancel safe.
    pub(crate) async fn wait_readable(&mut self) -> Result<()> {
        let result = self.transport()?.wait_readable().await;
        self.check(result)
    }

    /// Send one command and read its complete response.
    ///
    /// A server `ACK` is returned as [`MpdError::Ack`] and leaves the
    /// connection usable. Transport and framing errors drop the connection.
    pub async fn execute(&mut self, command: &Command) -> Result<Response> {
        let line = command.encode()?;
        trace!(">> {}", command);
        self.write_line(&line).await?;
        let limit = self.link.response_timeout();
        let response = self.read_response(limit).await;
        if let Err(MpdError::Ack(ack)) = &response {
            debug!("{} rejected: {}", command, ack);
        }
        response
    }

    /// Send a command list in one round trip.
    ///
    /// A failing sub-command is reported in [`ListResponse::error`] together
    /// with the output of the sub-commands that ran before it.
    pub async fn execute_list(&mut self, list: &CommandList) -> Result<ListResponse> {
        let block = list.encode()?;
        trace!(">> {}", list);
        self.write_line(&block).await?;
        let limit = self.link.response_timeout();
        let result = read_list_response(self.transport()?, list.uses_ok_markers(), limit).await;
        self.check(result)
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        // Release the transport before any callback runs.
        self.guard.take();
        if !self.pending.is_empty() {
            let events = std::mem::take(&mut self.pending);
            self.link.dispatcher.dispatch_all(events);
        }
    }
}

/// Serializes callers onto the single connection.
#[derive(Clone)]
pub struct CommandExecutor {
    link: Arc<Link>,
}

impl CommandExecutor {
    pub(crate) fn new(link: Arc<Link>) -> Self {
        Self { link }
    }

    /// Take the connection for a sequence of commands.
    pub async fn session(&self) -> Session<'_> {
        Session::foreground(&self.link).await
    }

    pub async fn execute(&self, command: &Command) -> Result<Response> {
        if self.link.state() != ConnectionState::Connected {
            return Err(MpdError::NotConnected);
        }
        self.session().await.execute(command).await
    }

    pub async fn execute_list(&self, list: &CommandList) -> Result<ListResponse> {
        if self.link.state() != ConnectionState::Connected {
            return Err(MpdError::NotConnected);
        }
        self.session().await.execute_list(list).await
    }
}
