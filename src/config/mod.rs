//! Configuration management
//!
//! Layers, lowest priority first: built-in defaults, the optional file
//! `<config dir>/config.{toml,json,yaml}`, `MPDR_*` environment variables
//! (`MPDR_MPD__HOST`, `MPDR_RETRY__MAX_DELAY_MS`, ...), and finally the
//! conventional `MPD_HOST` / `MPD_PORT` variables shared with other clients.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::client::{ConnectionSettings, ConnectionSettingsProvider, IdleSubsystem, RetryConfig};

const APP_DIR_NAME: &str = "mpd-remote";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mpd: MpdConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Clone, Deserialize)]
pub struct MpdConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub password: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// No per-command read limit when unset.
    pub response_timeout_ms: Option<u64>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6600
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for MpdConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            password: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: None,
        }
    }
}

impl fmt::Debug for MpdConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpdConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("response_timeout_ms", &self.response_timeout_ms)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonitorConfig {
    /// Subsystem names passed to `idle`; empty watches everything.
    #[serde(default)]
    pub subsystems: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_stable_run_ms")]
    pub stable_run_ms: u64,
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_stable_run_ms() -> u64 {
    30_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            stable_run_ms: default_stable_run_ms(),
        }
    }
}

impl Config {
    /// Parsed idle subsystem list. Unknown names are a configuration error.
    pub fn subsystems(&self) -> Result<Vec<IdleSubsystem>> {
        self.monitor
            .subsystems
            .iter()
            .map(|name| {
                name.trim()
                    .parse::<IdleSubsystem>()
                    .with_context(|| format!("invalid monitor.subsystems entry {:?}", name))
            })
            .collect()
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            stable_run_threshold: Duration::from_millis(self.retry.stable_run_ms),
        }
    }
}

impl ConnectionSettingsProvider for Config {
    fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            host: self.mpd.host.clone(),
            port: self.mpd.port,
            password: self.mpd.password.clone(),
            connect_timeout: Duration::from_millis(self.mpd.connect_timeout_ms),
            response_timeout: self.mpd.response_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Get config directory (MPDR_CONFIG_DIR, XDG_CONFIG_HOME or ~/.config)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("MPDR_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join(APP_DIR_NAME);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join(APP_DIR_NAME);
    }

    // Fallback to current directory
    PathBuf::from(".")
}

/// Split `MPD_HOST` into password and host (`password@host`).
pub fn split_mpd_host(value: &str) -> (Option<String>, String) {
    match value.rsplit_once('@') {
        Some((password, host)) if !password.is_empty() && !host.is_empty() => {
            (Some(password.to_string()), host.to_string())
        }
        _ => (None, value.to_string()),
    }
}

/// Load configuration from defaults, config file and environment
pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let mut builder = ::config::Config::builder()
        .set_default("mpd.host", default_host())?
        .set_default("mpd.port", default_port() as i64)?
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        .add_source(
            ::config::Environment::with_prefix("MPDR")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("monitor.subsystems")
                .try_parsing(true),
        );

    // Conventional variables understood by every MPD client
    if let Ok(value) = std::env::var("MPD_HOST") {
        let (password, host) = split_mpd_host(&value);
        builder = builder.set_override("mpd.host", host)?;
        if let Some(password) = password {
            builder = builder.set_override("mpd.password", password)?;
        }
    }
    if let Ok(port) = std::env::var("MPD_PORT") {
        if let Ok(port_num) = port.parse::<u16>() {
            builder = builder.set_override("mpd.port", port_num as i64)?;
        } else {
            tracing::warn!("Ignoring invalid MPD_PORT {:?}", port);
        }
    }

    let config = builder.build()?;

    Ok(config.try_deserialize()?)
}
