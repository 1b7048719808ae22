//! Centralized configuration for peerdrop.
//!
//! Tunable defaults live here as constants so they can be reviewed in one
//! place. The serde-backed [`Settings`] tree lets a TOML file override any of
//! them; every field falls back to its constant when absent.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ── Chunking / Framing ───────────────────────────────────────────────────────

/// Default chunk size in bytes (512 KiB).
///
/// A chunk is the unit of persistence and resume. It is fixed for the
/// lifetime of a file once its metadata has been authored.
pub const CHUNK_SIZE: u32 = 512 * 1024;

/// Default block size in bytes (16 KiB).
///
/// A block is one on-wire message. 16 KiB stays below every data channel
/// message limit seen in browsers and in webrtc-rs' 64 KiB receive buffer,
/// including the 9-byte block header.
pub const BLOCK_SIZE: usize = 16 * 1024;

/// Default brotli quality used for chunk compression (0..=11).
pub const COMPRESSION_LEVEL: u32 = 4;

/// Brotli window size (log2).
pub const COMPRESSION_WINDOW: u32 = 22;

/// Number of chunks the sender may compress ahead of transmission.
pub const COMPRESS_AHEAD_CHUNKS: usize = 4;

/// Default number of parallel transfer channels per transfer.
pub const TRANSFER_CHANNELS: usize = 4;

// ── Flow control ─────────────────────────────────────────────────────────────

/// Low-water threshold for a data channel's send buffer (bytes).
///
/// A channel is available for another block once `buffered_amount` is at or
/// below this level.
pub const LOW_WATER_MARK: usize = 1024 * 1024;

/// Fallback re-check interval while waiting for a buffered-amount-low signal.
pub const BUFFER_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ── Resume ───────────────────────────────────────────────────────────────────

/// Interval of the receiver's periodic resume check.
pub const RESUME_CHECK_INTERVAL: Duration = Duration::from_secs(3);

// ── Cache ────────────────────────────────────────────────────────────────────

/// Chunks held in the in-memory write buffer before a durable flush.
pub const CACHE_WRITE_BUFFER_CHUNKS: usize = 16;

/// Capacity of every broadcast event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ── Connection / Network ─────────────────────────────────────────────────────

/// Explicit SCTP max message size (1 MiB), as advertised in our SDP.
pub const SCTP_MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Time allowed for `connect()` to reach the connected state.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed for a freshly created data channel to open.
pub const DATA_CHANNEL_TIMEOUT: Duration = Duration::from_secs(15);

/// Protocol tag of the session's control channel.
pub const MESSAGE_PROTOCOL: &str = "message";

/// Protocol tag of transfer channels.
pub const TRANSFER_PROTOCOL: &str = "transfer";

/// Default STUN server used when no ICE servers are configured.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

// ── Settings tree ────────────────────────────────────────────────────────────

/// Top-level settings, loadable from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub session: SessionConfig,
    pub transfer: TransferConfig,
    pub cache: CacheConfig,
}

impl Settings {
    /// Parse settings from a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

/// Peer session tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// STUN/TURN URLs. Empty means host candidates only.
    pub ice_servers: Vec<String>,
    /// Advertise loopback candidates (same-machine transfers).
    pub include_loopback: bool,
    pub connect_timeout_ms: u64,
    pub channel_open_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            include_loopback: false,
            connect_timeout_ms: CONNECTION_TIMEOUT.as_millis() as u64,
            channel_open_timeout_ms: DATA_CHANNEL_TIMEOUT.as_millis() as u64,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn channel_open_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_open_timeout_ms)
    }
}

/// File transfer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: u32,
    pub block_size: usize,
    pub compression_level: u32,
    pub compress_ahead: usize,
    pub channel_count: usize,
    pub low_water_mark: usize,
    pub resume_interval_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            block_size: BLOCK_SIZE,
            compression_level: COMPRESSION_LEVEL,
            compress_ahead: COMPRESS_AHEAD_CHUNKS,
            channel_count: TRANSFER_CHANNELS,
            low_water_mark: LOW_WATER_MARK,
            resume_interval_ms: RESUME_CHECK_INTERVAL.as_millis() as u64,
        }
    }
}

impl TransferConfig {
    pub fn resume_interval(&self) -> Duration {
        Duration::from_millis(self.resume_interval_ms)
    }
}

/// Chunk cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root; defaults to `<data_dir>/cache`.
    pub root: Option<PathBuf>,
    pub write_buffer_chunks: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: None,
            write_buffer_chunks: CACHE_WRITE_BUFFER_CHUNKS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let s = Settings::from_toml("").unwrap();
        assert_eq!(s.transfer.chunk_size, CHUNK_SIZE);
        assert_eq!(s.cache.write_buffer_chunks, CACHE_WRITE_BUFFER_CHUNKS);
        assert_eq!(s.session.connect_timeout(), CONNECTION_TIMEOUT);
    }

    #[test]
    fn partial_toml_overrides_only_given_fields() {
        let s = Settings::from_toml(
            r#"
            [transfer]
            channel_count = 2
            resume_interval_ms = 500

            [session]
            ice_servers = []
            include_loopback = true
            "#,
        )
        .unwrap();
        assert_eq!(s.transfer.channel_count, 2);
        assert_eq!(s.transfer.resume_interval(), Duration::from_millis(500));
        assert_eq!(s.transfer.block_size, BLOCK_SIZE);
        assert!(s.session.ice_servers.is_empty());
        assert!(s.session.include_loopback);
    }
}
