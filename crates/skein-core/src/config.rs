//! Session configuration.

use crate::error::SkeinError;
use crate::flow_control::{DEFAULT_WINDOW_SIZE, DEFAULT_WINDOW_UPDATE_RATIO, MAX_WINDOW_SIZE};
use crate::frame::{MAX_MAX_FRAME_SIZE, MIN_MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default connection idle timeout (milliseconds)
pub const DEFAULT_IDLE_TIMEOUT_MS: i64 = 30_000;

/// Configuration for one multiplexed session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Receive window advertised for each stream
    pub initial_stream_recv_window: u32,
    /// Connection-level receive window
    pub initial_session_recv_window: u32,
    /// Peer's per-stream window until its SETTINGS say otherwise
    pub initial_stream_send_window: u32,
    /// Peer's connection-level window
    pub initial_session_send_window: u32,
    /// Frame size limit we advertise; larger inbound DATA is
    /// connection-fatal. Until the peer's SETTINGS arrive, outbound DATA is
    /// split at the protocol minimum
    pub max_frame_size: u32,
    /// Limit on concurrently open remote-initiated streams
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_streams: Option<u32>,
    /// Connection idle timeout (milliseconds); zero or negative disables
    pub idle_timeout_ms: i64,
    /// Default stream idle timeout (milliseconds); zero or negative disables
    pub stream_idle_timeout_ms: i64,
    /// Fraction of a receive window consumed before credit is returned
    pub window_update_ratio: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_stream_recv_window: DEFAULT_WINDOW_SIZE,
            initial_session_recv_window: DEFAULT_WINDOW_SIZE,
            initial_stream_send_window: DEFAULT_WINDOW_SIZE,
            initial_session_send_window: DEFAULT_WINDOW_SIZE,
            max_frame_size: MIN_MAX_FRAME_SIZE,
            max_concurrent_streams: None,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            stream_idle_timeout_ms: 0,
            window_update_ratio: DEFAULT_WINDOW_UPDATE_RATIO,
        }
    }
}

impl SessionConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set both receive windows
    pub fn recv_window(mut self, stream: u32, session: u32) -> Self {
        self.initial_stream_recv_window = stream;
        self.initial_session_recv_window = session;
        self
    }

    /// Set the peer's initial send windows
    pub fn send_window(mut self, stream: u32, session: u32) -> Self {
        self.initial_stream_send_window = stream;
        self.initial_session_send_window = session;
        self
    }

    /// Set maximum outbound DATA frame size
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Limit concurrently open remote-initiated streams
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.max_concurrent_streams = Some(max);
        self
    }

    /// Set connection idle timeout in milliseconds (<= 0 disables)
    pub fn idle_timeout_ms(mut self, millis: i64) -> Self {
        self.idle_timeout_ms = millis;
        self
    }

    /// Set default stream idle timeout in milliseconds (<= 0 disables)
    pub fn stream_idle_timeout_ms(mut self, millis: i64) -> Self {
        self.stream_idle_timeout_ms = millis;
        self
    }

    /// Set the window update ratio
    pub fn window_update_ratio(mut self, ratio: f32) -> Self {
        self.window_update_ratio = ratio;
        self
    }

    /// Connection idle timeout; `Duration::ZERO` when disabled
    pub fn idle_timeout(&self) -> Duration {
        timeout_from_millis(self.idle_timeout_ms)
    }

    /// Default stream idle timeout; `Duration::ZERO` when disabled
    pub fn stream_idle_timeout(&self) -> Duration {
        timeout_from_millis(self.stream_idle_timeout_ms)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), SkeinError> {
        for (name, value) in [
            ("initial_stream_recv_window", self.initial_stream_recv_window),
            ("initial_session_recv_window", self.initial_session_recv_window),
            ("initial_stream_send_window", self.initial_stream_send_window),
            ("initial_session_send_window", self.initial_session_send_window),
        ] {
            if value as i64 > MAX_WINDOW_SIZE {
                return Err(SkeinError::Config(format!(
                    "{} = {} exceeds {}",
                    name, value, MAX_WINDOW_SIZE
                )));
            }
        }

        if !(MIN_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&self.max_frame_size) {
            return Err(SkeinError::Config(format!(
                "max_frame_size = {} outside [{}, {}]",
                self.max_frame_size, MIN_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE
            )));
        }

        if !(self.window_update_ratio > 0.0 && self.window_update_ratio <= 1.0) {
            return Err(SkeinError::Config(format!(
                "window_update_ratio = {} outside (0, 1]",
                self.window_update_ratio
            )));
        }

        Ok(())
    }

    /// Parse from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, SkeinError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SkeinError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Convert to pretty-printed JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Map a millisecond setting to a timeout; zero or negative disables
pub fn timeout_from_millis(millis: i64) -> Duration {
    if millis <= 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(millis as u64)
    }
}
