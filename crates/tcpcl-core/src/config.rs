//! Configuration for the TCP convergence layer.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TCPCL_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tcpcl/config.toml
//!   3. ~/.config/tcpcl/config.toml

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{
    BACKOFF_TIMER_LIMIT, BACKOFF_TIMER_START, DEFAULT_KEEPALIVE_SECS, DEFAULT_PORT,
    TRANSFER_BUFFER_SIZE,
};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpclConfig {
    pub node: NodeConfig,
    pub induct: InductConfig,
    pub session: SessionConfig,
    pub backoff: BackoffConfig,
    pub outducts: Vec<OutductConfig>,
    pub spool: SpoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Endpoint identifier sent in contact headers. Empty = derive from hostname.
    pub local_eid: String,
}

/// How bundles are framed on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Contact header exchange, then typed segments.
    #[default]
    Tcpcl,
    /// 4-byte length prefix per bundle, no handshake.
    Simple,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InductConfig {
    pub enabled: bool,
    pub listen: SocketAddr,
    pub framing: Framing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keepalive interval requested in our contact header. 0 = none.
    pub keepalive_secs: u16,
    /// Keepalive ticker granularity.
    pub keepalive_tick_ms: u64,
    pub transfer_buffer_size: usize,
    /// Max payload bytes per data segment. 0 = whole bundle in one segment.
    pub max_segment_length: u64,
    /// Close an outbound session after this long without a bundle. 0 = never.
    pub idle_shutdown_secs: u64,
    /// Receive delay per bundle byte, simple framing only. 0 = off.
    pub rx_delay_nsec_per_byte: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub start_secs: u64,
    pub limit_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutductConfig {
    pub name: String,
    /// "host:port" of the receiving node.
    pub peer: String,
    #[serde(default)]
    pub framing: Framing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    pub inbound_dir: PathBuf,
    pub outbound_dir: PathBuf,
    pub poll_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TcpclConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            induct: InductConfig::default(),
            session: SessionConfig::default(),
            backoff: BackoffConfig::default(),
            outducts: Vec::new(),
            spool: SpoolConfig::default(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            local_eid: String::new(),
        }
    }
}

impl Default for InductConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            framing: Framing::Tcpcl,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
            keepalive_tick_ms: 1000,
            transfer_buffer_size: TRANSFER_BUFFER_SIZE,
            max_segment_length: 0,
            idle_shutdown_secs: 0,
            rx_delay_nsec_per_byte: 0,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            start_secs: BACKOFF_TIMER_START,
            limit_secs: BACKOFF_TIMER_LIMIT,
        }
    }
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            inbound_dir: data_dir().join("inbound"),
            outbound_dir: data_dir().join("outbound"),
            poll_ms: 500,
        }
    }
}

impl SessionConfig {
    pub fn keepalive_tick(&self) -> Duration {
        Duration::from_millis(self.keepalive_tick_ms.max(1))
    }

    pub fn idle_shutdown(&self) -> Option<Duration> {
        (self.idle_shutdown_secs > 0).then(|| Duration::from_secs(self.idle_shutdown_secs))
    }
}

impl BackoffConfig {
    pub fn start(&self) -> Duration {
        Duration::from_secs(self.start_secs)
    }

    pub fn limit(&self) -> Duration {
        Duration::from_secs(self.limit_secs.max(self.start_secs))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("tcpcl")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("tcpcl")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TcpclConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TcpclConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TCPCL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TcpclConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply TCPCL_* overrides. Unparseable values are ignored.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("TCPCL_NODE__LOCAL_EID") {
            self.node.local_eid = v;
        }
        if let Some(v) = var("TCPCL_INDUCT__LISTEN") {
            if let Ok(addr) = v.parse() {
                self.induct.listen = addr;
            }
        }
        if let Some(v) = var("TCPCL_SESSION__KEEPALIVE_SECS") {
            if let Ok(secs) = v.parse() {
                self.session.keepalive_secs = secs;
            }
        }
        if let Some(v) = var("TCPCL_BACKOFF__START_SECS") {
            if let Ok(secs) = v.parse() {
                self.backoff.start_secs = secs;
            }
        }
        if let Some(v) = var("TCPCL_BACKOFF__LIMIT_SECS") {
            if let Ok(secs) = v.parse() {
                self.backoff.limit_secs = secs;
            }
        }
    }
}
