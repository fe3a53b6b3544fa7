//! Line transport over a single bidirectional byte stream.
//!
//! Owns the socket, frames newline-terminated lines and exposes raw reads
//! for `binary:` payloads. It never reconnects on its own: after the first
//! EOF or I/O failure it is marked dead and every later call fails fast.

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::{MpdError, Result};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A framed connection to one MPD server.
pub struct LineTransport {
    reader: BufReader<BoxedReader>,
    writer: BoxedWriter,
    peer: String,
    dead: bool,
}

impl std::fmt::Debug for LineTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineTransport")
            .field("peer", &self.peer)
            .field("dead", &self.dead)
            .finish()
    }
}

impl LineTransport {
    /// Resolve `host` and open a TCP connection within `connect_timeout`.
    pub async fn open(host: &str, port: u16, connect_timeout: Duration) -> Result<Self> {
        let peer = format!("{}:{}", host, port);

        let addrs: Vec<_> = timeout(connect_timeout, lookup_host(peer.as_str()))
            .await
            .map_err(|_| MpdError::ConnectTimeout(connect_timeout))?
            .map_err(|_| MpdError::Dns(host.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(MpdError::Dns(host.to_string()));
        }

        let stream = timeout(connect_timeout, TcpStream::connect(addrs.as_slice()))
            .await
            .map_err(|_| MpdError::ConnectTimeout(connect_timeout))?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => MpdError::ConnectRefused(peer.clone()),
                _ => MpdError::Io(e),
            })?;
        stream.set_nodelay(true)?;

        debug!("TCP connection open to {}", peer);
        Ok(Self::from_stream(stream, peer))
    }

    /// Wrap any async byte stream (used for TCP and for scripted test streams).
    pub fn from_stream<S>(stream: S, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(Box::new(read_half) as BoxedReader),
            writer: Box::new(write_half),
            peer: peer.into(),
            dead: false,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether a previous read or write failed. A dead transport must be discarded.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Write one line; the terminating `\n` is appended here.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.check_alive()?;
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');

        let result = async {
            self.writer.write_all(&bytes).await?;
            self.writer.flush().await
        }
        .await;
        result.map_err(|e| self.kill(MpdError::Io(e)))
    }

    /// Read one line without its terminator.
    pub async fn read_line(&mut self) -> Result<String> {
        self.check_alive()?;
        let mut buf = Vec::new();
        let read = match self.reader.read_until(b'\n', &mut buf).await {
            Ok(n) => n,
            Err(e) => return Err(self.kill(MpdError::Io(e))),
        };
        if read == 0 || buf.last() != Some(&b'\n') {
            return Err(self.kill(MpdError::Eof));
        }
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }

        let line = match String::from_utf8(buf) {
            Ok(line) => line,
            Err(e) => {
                warn!("Non UTF-8 line from {}, decoding lossily", self.peer);
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        };
        trace!("<< {}", line);
        Ok(line)
    }

    /// Read one line, failing with [`MpdError::ReadTimeout`] after `limit`.
    ///
    /// A timeout leaves the stream position unknown, so it kills the transport.
    pub async fn read_line_timeout(&mut self, limit: Option<Duration>) -> Result<String> {
        match limit {
            None => self.read_line().await,
            Some(limit) => match timeout(limit, self.read_line()).await {
                Ok(result) => result,
                Err(_) => Err(self.kill(MpdError::ReadTimeout(limit))),
            },
        }
    }

    /// Read exactly `len` raw bytes (a `binary:` payload).
    pub async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        self.check_alive()?;
        let mut payload = vec![0u8; len];
        match self.reader.read_exact(&mut payload).await {
            Ok(_) => Ok(payload),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(self.kill(MpdError::Eof)),
            Err(e) => Err(self.kill(MpdError::Io(e))),
        }
    }

    /// Wait until at least one byte can be read, without consuming it.
    ///
    /// Cancel safe: dropping the future loses no data, which lets the idle
    /// loop race the socket against an interrupt request.
    pub async fn wait_readable(&mut self) -> Result<()> {
        self.check_alive()?;
        let available = match self.reader.fill_buf().await {
            Ok(buf) => buf.len(),
            Err(e) => return Err(self.kill(MpdError::Io(e))),
        };
        if available == 0 {
            return Err(self.kill(MpdError::Eof));
        }
        Ok(())
    }

    /// Shut down the write side. Errors are irrelevant at this point.
    pub async fn close(mut self) {
        self.dead = true;
        let _ = self.writer.shutdown().await;
        debug!("Closed connection to {}", self.peer);
    }

    fn check_alive(&self) -> Result<()> {
        if self.dead {
            Err(MpdError::NotConnected)
        } else {
            Ok(())
        }
    }

    fn kill(&mut self, err: MpdError) -> MpdError {
        self.dead = true;
        debug!("Transport to {} failed: {}", self.peer, err);
        err
    }
}
