#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Mock MPD server for testing
//!
//! Speaks enough of the MPD text protocol to exercise the client: greeting,
//! password, status/stats/outputs, command lists, idle/noidle, chunked
//! album art. Every received line is recorded so tests can assert the
//! exact wire sequence.
//!
//! Idle follows the real server: changes are queued per connection and
//! reported by the next `idle` (immediately if some are already queued),
//! `noidle` outside of idle is silently ignored, and any other command
//! sent while idling is a protocol violation that closes the connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;

use mpd_remote::client::ConnectionSettings;

pub const GREETING: &str = "OK MPD 0.23.5\n";
const ART_CHUNK: usize = 4096;

/// Mock MPD state
#[derive(Debug, Clone)]
pub struct MockMpdState {
    pub status: Vec<(String, String)>,
    pub stats: Vec<(String, String)>,
    /// (id, name, enabled)
    pub outputs: Vec<(u32, String, bool)>,
    pub password: Option<String>,
    pub album_art: Vec<u8>,
    pub songs: Vec<String>,
}

impl Default for MockMpdState {
    fn default() -> Self {
        let pairs = |items: &[(&str, &str)]| {
            items
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<Vec<_>>()
        };
        Self {
            status: pairs(&[
                ("volume", "40"),
                ("repeat", "0"),
                ("random", "0"),
                ("single", "0"),
                ("consume", "0"),
                ("playlist", "3"),
                ("playlistlength", "2"),
                ("state", "stop"),
                ("song", "0"),
                ("songid", "1"),
            ]),
            stats: pairs(&[
                ("artists", "2"),
                ("albums", "2"),
                ("songs", "2"),
                ("uptime", "100"),
                ("playtime", "0"),
                ("db_playtime", "500"),
                ("db_update", "1700000000"),
            ]),
            outputs: vec![(0, "ALSA".to_string(), true), (1, "Stream".to_string(), false)],
            password: None,
            album_art: Vec::new(),
            songs: vec!["a/one.flac".to_string(), "b/two.flac".to_string()],
        }
    }
}

struct Shared {
    state: RwLock<MockMpdState>,
    log: Mutex<Vec<String>>,
    notify: broadcast::Sender<String>,
    kill: broadcast::Sender<()>,
    connections: AtomicUsize,
    violations: AtomicUsize,
    idling: watch::Sender<usize>,
}

impl Shared {
    fn record(&self, line: &str) {
        self.log.lock().unwrap().push(line.to_string());
    }

    fn notify(&self, subsystem: &str) {
        let _ = self.notify.send(subsystem.to_string());
    }
}

/// Mock MPD server
pub struct MockMpdServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
}

impl MockMpdServer {
    /// Start a mock MPD server on a random port
    pub async fn start() -> Self {
        Self::start_with(MockMpdState::default()).await
    }

    pub async fn start_with(state: MockMpdState) -> Self {
        let (notify, _) = broadcast::channel(64);
        let (kill, _) = broadcast::channel(4);
        let (idling, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            state: RwLock::new(state),
            log: Mutex::new(Vec::new()),
            notify,
            kill,
            connections: AtomicUsize::new(0),
            violations: AtomicUsize::new(0),
            idling,
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let shared_clone = shared.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let shared = shared_clone.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, shared).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            addr,
            shared,
            handle,
        }
    }

    /// Get the server address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connection settings pointing at this server
    pub fn settings(&self) -> ConnectionSettings {
        ConnectionSettings::new("127.0.0.1", self.addr.port())
    }

    /// Replace (or add) one `status` field
    pub async fn set_status(&self, key: &str, value: &str) {
        let mut state = self.shared.state.write().await;
        match state.status.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => state.status.push((key.to_string(), value.to_string())),
        }
    }

    pub async fn set_password(&self, password: &str) {
        self.shared.state.write().await.password = Some(password.to_string());
    }

    pub async fn set_album_art(&self, data: Vec<u8>) {
        self.shared.state.write().await.album_art = data;
    }

    /// Raise an idle notification on every connection
    pub fn notify(&self, subsystem: &str) {
        self.shared.notify(subsystem);
    }

    /// Every line received so far, across all connections
    pub fn received(&self) -> Vec<String> {
        self.shared.log.lock().unwrap().clone()
    }

    pub fn clear_received(&self) {
        self.shared.log.lock().unwrap().clear();
    }

    /// Number of accepted connections (greetings sent)
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Commands received while a connection was idling
    pub fn violations(&self) -> usize {
        self.shared.violations.load(Ordering::SeqCst)
    }

    pub fn idling_count(&self) -> usize {
        *self.shared.idling.borrow()
    }

    /// Wait until some connection is parked in `idle`
    pub async fn wait_idling(&self) {
        let mut rx = self.shared.idling.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|n| *n > 0))
            .await
            .expect("client never entered idle")
            .unwrap();
    }

    /// Drop every open connection without a word
    pub fn kill_connections(&self) {
        let _ = self.shared.kill.send(());
    }

    /// Stop the mock server
    pub async fn stop(self) {
        self.handle.abort();
    }
}

/// Per-connection protocol state
#[derive(Default)]
struct Conn {
    authenticated: bool,
    /// Changes not yet reported to this connection
    pending: Vec<String>,
    /// `Some(filter)` while idling; an empty filter matches everything
    idle: Option<Vec<String>>,
    /// `Some((ok_markers, commands))` while inside a command list
    list: Option<(bool, Vec<String>)>,
}

enum Reply {
    Write(Vec<u8>),
    Nothing,
    Close,
}

/// Handle a single TCP connection
async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) {
    shared.connections.fetch_add(1, Ordering::SeqCst);
    let (read_half, mut writer) = stream.into_split();

    // Lines arrive through a channel so the main loop can select on them safely
    let (line_tx, mut lines) = mpsc::channel::<String>(64);
    let reader_task = tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = line.trim_end_matches(['\r', '\n']).to_string();
                    if line_tx.send(line).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut notifications = shared.notify.subscribe();
    let mut kill = shared.kill.subscribe();
    let mut conn = Conn {
        authenticated: shared.state.read().await.password.is_none(),
        ..Conn::default()
    };

    if writer.write_all(GREETING.as_bytes()).await.is_err() {
        reader_task.abort();
        return;
    }

    loop {
        let reply = tokio::select! {
            line = lines.recv() => match line {
                Some(line) => {
                    shared.record(&line);
                    conn.handle_line(&line, &shared).await
                }
                None => Reply::Close,
            },
            Ok(subsystem) = notifications.recv() => conn.changed(subsystem, &shared),
            _ = kill.recv() => Reply::Close,
        };

        match reply {
            Reply::Write(bytes) => {
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            Reply::Nothing => {}
            Reply::Close => break,
        }
    }

    if conn.idle.is_some() {
        shared.idling.send_modify(|n| *n -= 1);
    }
    reader_task.abort();
}

impl Conn {
    fn matches(filter: &[String], subsystem: &str) -> bool {
        filter.is_empty() || filter.iter().any(|s| s == subsystem)
    }

    /// Report (and forget) pending changes that match the idle filter
    fn drain_changes(&mut self, filter: &[String]) -> Vec<u8> {
        let mut out = String::new();
        self.pending.retain(|sub| {
            if Self::matches(filter, sub) {
                out.push_str(&format!("changed: {}\n", sub));
                false
            } else {
                true
            }
        });
        out.push_str("OK\n");
        out.into_bytes()
    }

    fn leave_idle(&mut self, shared: &Shared) -> Vec<String> {
        shared.idling.send_modify(|n| *n -= 1);
        self.idle.take().unwrap_or_default()
    }

    fn changed(&mut self, subsystem: String, shared: &Shared) -> Reply {
        if !self.pending.contains(&subsystem) {
            self.pending.push(subsystem.clone());
        }
        let wakes = self
            .idle
            .as_ref()
            .is_some_and(|filter| Self::matches(filter, &subsystem));
        if !wakes {
            return Reply::Nothing;
        }
        let filter = self.leave_idle(shared);
        Reply::Write(self.drain_changes(&filter))
    }

    async fn handle_line(&mut self, line: &str, shared: &Shared) -> Reply {
        let (name, args) = tokenize(line);

        if self.idle.is_some() {
            if name == "noidle" {
                let filter = self.leave_idle(shared);
                return Reply::Write(self.drain_changes(&filter));
            }
            shared.violations.fetch_add(1, Ordering::SeqCst);
            return Reply::Close;
        }

        if let Some((ok_markers, commands)) = self.list.as_mut() {
            if name == "command_list_end" {
                let ok_markers = *ok_markers;
                let commands = std::mem::take(commands);
                self.list = None;
                return Reply::Write(self.run_list(ok_markers, &commands, shared).await);
            }
            commands.push(line.to_string());
            return Reply::Nothing;
        }

        match name.as_str() {
            "command_list_begin" => {
                self.list = Some((false, Vec::new()));
                Reply::Nothing
            }
            "command_list_ok_begin" => {
                self.list = Some((true, Vec::new()));
                Reply::Nothing
            }
            // Outside of idle the real server ignores it too
            "noidle" => Reply::Nothing,
            "idle" => {
                let has_match = self.pending.iter().any(|s| Self::matches(&args, s));
                if has_match {
                    Reply::Write(self.drain_changes(&args))
                } else {
                    self.idle = Some(args);
                    shared.idling.send_modify(|n| *n += 1);
                    Reply::Nothing
                }
            }
            "close" => Reply::Close,
            _ => {
                let mut out = Vec::new();
                match self.run_command(&name, &args, shared).await {
                    Ok(body) => {
                        out.extend_from_slice(&body);
                        out.extend_from_slice(b"OK\n");
                    }
                    Err((code, message)) => {
                        out.extend_from_slice(ack(code, 0, &name, &message).as_bytes());
                    }
                }
                Reply::Write(out)
            }
        }
    }

    async fn run_list(&mut self, ok_markers: bool, commands: &[String], shared: &Shared) -> Vec<u8> {
        let mut out = Vec::new();
        for (index, line) in commands.iter().enumerate() {
            let (name, args) = tokenize(line);
            match self.run_command(&name, &args, shared).await {
                Ok(body) => {
                    out.extend_from_slice(&body);
                    if ok_markers {
                        out.extend_from_slice(b"list_OK\n");
                    }
                }
                Err((code, message)) => {
                    out.extend_from_slice(ack(code, index, &name, &message).as_bytes());
                    return out;
                }
            }
        }
        out.extend_from_slice(b"OK\n");
        out
    }

    async fn run_command(
        &mut self,
        name: &str,
        args: &[String],
        shared: &Shared,
    ) -> Result<Vec<u8>, (u32, String)> {
        if name == "password" {
            let state = shared.state.read().await;
            return match (&state.password, args.first()) {
                (Some(expected), Some(given)) if expected == given => {
                    self.authenticated = true;
                    Ok(Vec::new())
                }
                (None, Some(_)) => Ok(Vec::new()),
                _ => Err((3, "incorrect password".to_string())),
            };
        }
        if !self.authenticated {
            return Err((4, format!("you don't have permission for \"{}\"", name)));
        }

        let pairs = |pairs: &[(String, String)]| -> Vec<u8> {
            pairs
                .iter()
                .map(|(k, v)| format!("{}: {}\n", k, v))
                .collect::<String>()
                .into_bytes()
        };

        match name {
            "ping" => Ok(Vec::new()),
            "status" => Ok(pairs(&shared.state.read().await.status)),
            "stats" => Ok(pairs(&shared.state.read().await.stats)),
            "outputs" => {
                let state = shared.state.read().await;
                let mut out = String::new();
                for (id, name, enabled) in &state.outputs {
                    out.push_str(&format!(
                        "outputid: {}\noutputname: {}\nplugin: mock\noutputenabled: {}\n",
                        id,
                        name,
                        u8::from(*enabled)
                    ));
                }
                Ok(out.into_bytes())
            }
            "lsinfo" => {
                let state = shared.state.read().await;
                let out: String = state
                    .songs
                    .iter()
                    .map(|song| format!("file: {}\nTime: 180\n", song))
                    .collect();
                Ok(out.into_bytes())
            }
            // Echoes each parsed argument back as a key/value pair
            "echoargs" => Ok(args
                .iter()
                .map(|arg| format!("arg: {}\n", arg))
                .collect::<String>()
                .into_bytes()),
            "setvol" => {
                let volume = args
                    .first()
                    .and_then(|v| v.parse::<u8>().ok())
                    .filter(|v| *v <= 100)
                    .ok_or((2, "Integer expected".to_string()))?;
                set_field(&mut shared.state.write().await.status, "volume", &volume.to_string());
                shared.notify("mixer");
                Ok(Vec::new())
            }
            "play" => {
                let mut state = shared.state.write().await;
                let length: usize = state
                    .status
                    .iter()
                    .find(|(k, _)| k == "playlistlength")
                    .and_then(|(_, v)| v.parse().ok())
                    .unwrap_or(0);
                if let Some(pos) = args.first() {
                    match pos.parse::<usize>() {
                        Ok(pos) if pos < length => set_field(&mut state.status, "song", &pos.to_string()),
                        _ => return Err((50, "song doesn't exist".to_string())),
                    }
                }
                set_field(&mut state.status, "state", "play");
                drop(state);
                shared.notify("player");
                Ok(Vec::new())
            }
            "albumart" => {
                let state = shared.state.read().await;
                if state.album_art.is_empty() {
                    return Err((50, "No file exists".to_string()));
                }
                let offset: usize = args.get(1).and_then(|o| o.parse().ok()).unwrap_or(0);
                let total = state.album_art.len();
                let start = offset.min(total);
                let end = (start + ART_CHUNK).min(total);
                let chunk = &state.album_art[start..end];

                let mut out = format!("size: {}\nbinary: {}\n", total, chunk.len()).into_bytes();
                out.extend_from_slice(chunk);
                out.push(b'\n');
                Ok(out)
            }
            _ => Err((5, format!("unknown command \"{}\"", name))),
        }
    }
}

fn set_field(fields: &mut Vec<(String, String)>, key: &str, value: &str) {
    match fields.iter_mut().find(|(k, _)| k == key) {
        Some(entry) => entry.1 = value.to_string(),
        None => fields.push((key.to_string(), value.to_string())),
    }
}

fn ack(code: u32, index: usize, command: &str, message: &str) -> String {
    format!("ACK [{}@{}] {{{}}} {}\n", code, index, command, message)
}

/// Split a command line into name and arguments, honouring double quotes
/// and backslash escapes the way the real server does.
fn tokenize(line: &str) -> (String, Vec<String>) {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else { break };
        let mut token = String::new();
        if first == '"' {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            token.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => token.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }

    let mut tokens = tokens.into_iter();
    let name = tokens.next().unwrap_or_default();
    (name, tokens.collect())
}
