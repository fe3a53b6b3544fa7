//! Response parsing.
//!
//! A response is the sequence of `key: value` lines a command produces,
//! closed by `OK` (success) or `ACK ...` (failure). Order is preserved:
//! repeated keys such as `file:` delimit records.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

use super::transport::LineTransport;
use crate::error::{MpdError, Result};

/// Key announcing a raw byte payload of the given length.
const BINARY_KEY: &str = "binary";

/// Largest `binary:` payload accepted. A bigger announcement breaks framing.
pub const MAX_BINARY_SIZE: usize = 64 * 1024 * 1024;

static ACK_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^ACK \[(\d+)@(\d+)\] \{([^}]*)\} ?(.*)$").ok());

/// Server error classes, as numbered in MPD's `ack.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckCode {
    NotList,
    Arg,
    Password,
    Permission,
    Unknown,
    NoExist,
    PlaylistMax,
    System,
    PlaylistLoad,
    UpdateAlready,
    PlayerSync,
    Exist,
    Other(u32),
}

impl AckCode {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::NotList => 1,
            Self::Arg => 2,
            Self::Password => 3,
            Self::Permission => 4,
            Self::Unknown => 5,
            Self::NoExist => 50,
            Self::PlaylistMax => 51,
            Self::System => 52,
            Self::PlaylistLoad => 53,
            Self::UpdateAlready => 54,
            Self::PlayerSync => 55,
            Self::Exist => 56,
            Self::Other(code) => code,
        }
    }
}

impl From<u32> for AckCode {
    fn from(code: u32) -> Self {
        match code {
            1 => Self::NotList,
            2 => Self::Arg,
            3 => Self::Password,
            4 => Self::Permission,
            5 => Self::Unknown,
            50 => Self::NoExist,
            51 => Self::PlaylistMax,
            52 => Self::System,
            53 => Self::PlaylistLoad,
            54 => Self::UpdateAlready,
            55 => Self::PlayerSync,
            56 => Self::Exist,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// A parsed `ACK [code@index] {command} message` line.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("ACK [{code}@{index}] {{{command}}} {message}")]
pub struct AckError {
    pub code: AckCode,
    /// Position of the failing command inside a command list (0 otherwise).
    pub index: u32,
    /// Name of the offending command (may be empty).
    pub command: String,
    pub message: String,
}

impl AckError {
    /// Parse an `ACK` line. Returns `None` if the line does not follow the format.
    pub fn parse(line: &str) -> Option<Self> {
        let caps = ACK_RE.as_ref()?.captures(line)?;
        Some(Self {
            code: caps[1].parse::<u32>().ok()?.into(),
            index: caps[2].parse().ok()?,
            command: caps[3].to_string(),
            message: caps[4].to_string(),
        })
    }

    pub fn is_password(&self) -> bool {
        matches!(self.code, AckCode::Password | AckCode::Permission)
    }
}

/// Successful output of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pairs: Vec<(String, String)>,
    binary: Option<Vec<u8>>,
}

impl Response {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self {
            pairs,
            binary: None,
        }
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn into_pairs(self) -> Vec<(String, String)> {
        self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty() && self.binary.is_none()
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `key`, in arrival order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.pairs
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Raw payload delivered through a `binary:` line, if any.
    pub fn binary(&self) -> Option<&[u8]> {
        self.binary.as_deref()
    }

    /// Split into records, each starting at a line whose key is `first_key`.
    ///
    /// Lines before the first occurrence are dropped.
    pub fn records(&self, first_key: &str) -> Vec<Vec<(&str, &str)>> {
        let mut records: Vec<Vec<(&str, &str)>> = Vec::new();
        for (k, v) in &self.pairs {
            if k == first_key {
                records.push(Vec::new());
            }
            if let Some(current) = records.last_mut() {
                current.push((k.as_str(), v.as_str()));
            }
        }
        records
    }
}

/// Output of a command list.
///
/// Without OK markers all tuples land in a single [`Response`]; with markers
/// there is one response per sub-command that succeeded. `error` holds the
/// `ACK` of the sub-command that stopped the list, if any; nothing after it ran.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListResponse {
    pub responses: Vec<Response>,
    pub error: Option<AckError>,
}

impl ListResponse {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Convert into a plain result, discarding partial output on failure.
    pub fn into_result(self) -> Result<Vec<Response>> {
        match self.error {
            Some(ack) => Err(MpdError::Ack(ack)),
            None => Ok(self.responses),
        }
    }
}

/// One classified response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Line {
    Ok,
    ListOk,
    Ack(AckError),
    Pair(String, String),
}

pub(crate) fn parse_line(line: &str) -> Result<Line> {
    if line == "OK" {
        return Ok(Line::Ok);
    }
    if line == "list_OK" {
        return Ok(Line::ListOk);
    }
    if line.starts_with("ACK ") {
        return AckError::parse(line)
            .map(Line::Ack)
            .ok_or_else(|| MpdError::protocol(format!("malformed ACK line: {}", line)));
    }
    match line.split_once(": ") {
        Some((key, value)) if !key.is_empty() => Ok(Line::Pair(key.to_string(), value.to_string())),
        _ => Err(MpdError::protocol(format!("unexpected line: {:?}", line))),
    }
}

/// Read the `binary: <len>` payload and its trailing newline.
async fn read_binary(transport: &mut LineTransport, len: &str) -> Result<Vec<u8>> {
    let len: usize = len
        .parse()
        .map_err(|_| MpdError::protocol(format!("bad binary length {:?}", len)))?;
    if len > MAX_BINARY_SIZE {
        return Err(MpdError::protocol(format!(
            "binary length {} exceeds {} bytes",
            len, MAX_BINARY_SIZE
        )));
    }
    let payload = transport.read_exact(len).await?;
    let terminator = transport.read_line().await?;
    if !terminator.is_empty() {
        return Err(MpdError::protocol(format!(
            "binary payload longer than announced {} bytes",
            len
        )));
    }
    Ok(payload)
}

/// Read the response to a single command.
///
/// `ACK` is returned as [`MpdError::Ack`]; partial output before it is discarded.
pub async fn read_response(
    transport: &mut LineTransport,
    limit: Option<Duration>,
) -> Result<Response> {
    let mut response = Response::default();
    loop {
        let line = transport.read_line_timeout(limit).await?;
        match parse_line(&line)? {
            Line::Ok => return Ok(response),
            Line::Ack(ack) => return Err(MpdError::Ack(ack)),
            Line::ListOk => {
                return Err(MpdError::protocol("list_OK outside of a command list"));
            }
            Line::Pair(key, value) if key == BINARY_KEY => {
                let payload = read_binary(transport, &value).await?;
                response.binary = Some(payload);
            }
            Line::Pair(key, value) => response.pairs.push((key, value)),
        }
    }
}

/// Read the response to a command list.
pub async fn read_list_response(
    transport: &mut LineTransport,
    ok_markers: bool,
    limit: Option<Duration>,
) -> Result<ListResponse> {
    let mut result = ListResponse::default();
    let mut current = Response::default();
    loop {
        let line = transport.read_line_timeout(limit).await?;
        match parse_line(&line)? {
            Line::Ok => {
                if !ok_markers || !current.is_empty() {
                    result.responses.push(current);
                }
                return Ok(result);
            }
            Line::ListOk if ok_markers => {
                result.responses.push(std::mem::take(&mut current));
            }
            Line::ListOk => {
                return Err(MpdError::protocol("list_OK in a list without OK markers"));
            }
            Line::Ack(ack) => {
                if !ok_markers {
                    result.responses.push(current);
                }
                result.error = Some(ack);
                return Ok(result);
            }
            Line::Pair(key, value) if key == BINARY_KEY => {
                let payload = read_binary(transport, &value).await?;
                current.binary = Some(payload);
            }
            Line::Pair(key, value) => current.pairs.push((key, value)),
        }
    }
}
