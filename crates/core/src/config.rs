//! Engine configuration.
//!
//! A [`ServerConfig`] is built once (defaults, a JSON file or CLI flags) and
//! shared by `Arc` with the listener, every session and the relay client.
//! The only value that changes at runtime is the auto-pull switch, which
//! the server keeps in an atomic flag seeded from [`ServerConfig::auto_pull`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Placeholder substituted with the stream path in remote URL templates.
pub const STREAM_PATH_PLACEHOLDER: &str = "${streamPath}";

/// What to do with a session when one track's SETUP fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupFailurePolicy {
    /// Answer the failed SETUP with an error; other tracks may still be set up.
    #[default]
    RejectTrack,
    /// Answer the failed SETUP with an error and tear the session down.
    TeardownSession,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listening address for inbound RTSP connections.
    pub listen_addr: String,
    /// Pull from [`remote_addr`](Self::remote_addr) when a stream is
    /// subscribed without a publisher.
    pub auto_pull: bool,
    /// Remote URL template for automatic pulls.
    pub remote_addr: String,
    /// Per-read/write deadline in milliseconds. `0` disables deadlines.
    pub timeout_ms: u64,
    /// Retry the client handshake after a pull/push connection fails.
    pub reconnect: bool,
    /// Handshake attempts per reconnect cycle.
    pub reconnect_attempts: u32,
    /// Delay before each reconnect attempt, in milliseconds.
    pub reconnect_interval_ms: u64,
    /// Push every newly published stream to [`push_addr`](Self::push_addr).
    pub auto_push: bool,
    /// Remote URL template for automatic pushes.
    pub push_addr: String,
    /// Realm advertised in authentication challenges.
    pub realm: String,
    /// Consecutive protocol violations tolerated before teardown. `0` = unlimited.
    pub max_protocol_violations: u32,
    pub setup_failure: SetupFailurePolicy,
    /// Capacity of each connection's read buffer.
    pub read_buffer_size: usize,
    /// Lowest local UDP port handed out for RTP.
    pub udp_port_min: u16,
    /// Highest local UDP port handed out for RTCP.
    pub udp_port_max: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:554".to_string(),
            auto_pull: false,
            remote_addr: format!("rtsp://localhost/{STREAM_PATH_PLACEHOLDER}"),
            timeout_ms: 0,
            reconnect: false,
            reconnect_attempts: 5,
            reconnect_interval_ms: 1000,
            auto_push: false,
            push_addr: format!("rtsp://localhost/{STREAM_PATH_PLACEHOLDER}"),
            realm: "rtsp".to_string(),
            max_protocol_violations: 5,
            setup_failure: SetupFailurePolicy::RejectTrack,
            read_buffer_size: 204_800,
            udp_port_min: 5000,
            udp_port_max: 65534,
        }
    }
}

impl ServerConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Read/write deadline, or `None` when deadlines are disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Pull target for `stream_path`.
    pub fn remote_url(&self, stream_path: &str) -> String {
        expand_template(&self.remote_addr, stream_path)
    }

    /// Push target for `stream_path`.
    pub fn push_url(&self, stream_path: &str) -> String {
        expand_template(&self.push_addr, stream_path)
    }
}

/// Replace every `${streamPath}` in `template` with `stream_path`.
pub fn expand_template(template: &str, stream_path: &str) -> String {
    template.replace(STREAM_PATH_PLACEHOLDER, stream_path)
}
