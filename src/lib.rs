//! mpd-remote - MPD protocol client
//!
//! A client for the Music Player Daemon text protocol that keeps one
//! persistent connection, shares it between foreground commands and a
//! background `idle` monitor, and fans server-side changes out to typed
//! listeners.
//!
//! This library provides:
//! - Line transport, command encoding and response parsing (`protocol`)
//! - Connection management, command execution and idle monitoring (`client`)
//! - Status/statistics cache with field-level change detection
//! - Listener registry and broadcast event bus (`bus`)
//! - Layered configuration (`config`)

pub mod bus;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;

pub use client::MpdClient;
pub use error::{MpdError, Result};
