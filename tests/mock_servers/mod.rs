//! Mock servers for client integration testing
//!
//! These mock servers simulate a real MPD instance, allowing full
//! integration testing without a running daemon.

pub mod mpd;

pub use mpd::MockMpdServer;
