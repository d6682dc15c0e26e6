//! Frame values exchanged between the session engine and its transport.
//!
//! The engine never encodes or decodes frames on the wire. A codec sitting
//! behind the transport turns bytes into these values and back; the session
//! consumes already-parsed frames and emits frames to be serialized.

use crate::error::ErrorCode;
use bytes::Bytes;
use http::HeaderMap;
use std::fmt;

/// Stream identifier. Zero addresses the connection itself.
pub type StreamId = u32;

/// Largest stream identifier that may be allocated (31 bits).
pub const MAX_STREAM_ID: StreamId = 0x7fff_ffff;

/// Smallest legal value for a peer's maximum frame size.
pub const MIN_MAX_FRAME_SIZE: u32 = 16_384;

/// Largest legal value for a peer's maximum frame size (2^24 - 1).
pub const MAX_MAX_FRAME_SIZE: u32 = 0x00ff_ffff;

/// Largest padding a DATA frame can carry (one pad-length octet).
pub const MAX_PADDING: u32 = 255;

/// Frame kinds understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Headers,
    Data,
    ResetStream,
    WindowUpdate,
    GoAway,
    Settings,
    Ping,
}

impl FrameKind {
    /// Get the kind name as used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Headers => "HEADERS",
            Self::Data => "DATA",
            Self::ResetStream => "RST_STREAM",
            Self::WindowUpdate => "WINDOW_UPDATE",
            Self::GoAway => "GOAWAY",
            Self::Settings => "SETTINGS",
            Self::Ping => "PING",
        }
    }

    /// Whether frames of this kind always target stream 0
    pub fn is_connection_scoped(&self) -> bool {
        matches!(self, Self::GoAway | Self::Settings | Self::Ping)
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HEADERS: opens a stream or carries response headers/trailers
#[derive(Debug, Clone)]
pub struct HeadersFrame {
    pub stream_id: StreamId,
    /// Already-decompressed header block; opaque to the engine.
    pub metadata: HeaderMap,
    pub end_stream: bool,
}

impl HeadersFrame {
    /// Create a headers frame for the given stream
    pub fn new(stream_id: StreamId, metadata: HeaderMap, end_stream: bool) -> Self {
        Self {
            stream_id,
            metadata,
            end_stream,
        }
    }

    /// Create a headers frame for a stream that does not exist yet.
    ///
    /// The session assigns the id when the stream is created.
    pub fn request(metadata: HeaderMap, end_stream: bool) -> Self {
        Self::new(0, metadata, end_stream)
    }
}

/// DATA: flow-controlled payload bytes
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub stream_id: StreamId,
    pub data: Bytes,
    /// Padding octets; they count against flow control but carry nothing.
    pub padding: u32,
    pub end_stream: bool,
}

impl DataFrame {
    /// Create a data frame without padding
    pub fn new(stream_id: StreamId, data: Bytes, end_stream: bool) -> Self {
        Self {
            stream_id,
            data,
            padding: 0,
            end_stream,
        }
    }

    /// Set the padding length
    pub fn with_padding(mut self, padding: u32) -> Self {
        self.padding = padding;
        self
    }

    /// Number of bytes this frame consumes from a flow control window.
    ///
    /// Saturates at `u32::MAX`, which no window can hold.
    pub fn flow_controlled_len(&self) -> u32 {
        u32::try_from(self.frame_len()).unwrap_or(u32::MAX)
    }

    /// Payload plus padding, without truncation
    pub fn frame_len(&self) -> u64 {
        self.data.len() as u64 + self.padding as u64
    }
}

/// RST_STREAM: abrupt termination of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetFrame {
    pub stream_id: StreamId,
    pub error: ErrorCode,
}

impl ResetFrame {
    pub fn new(stream_id: StreamId, error: ErrorCode) -> Self {
        Self { stream_id, error }
    }
}

/// WINDOW_UPDATE: returns send credit to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    /// Zero for the connection window.
    pub stream_id: StreamId,
    pub increment: u32,
}

impl WindowUpdateFrame {
    pub fn new(stream_id: StreamId, increment: u32) -> Self {
        Self {
            stream_id,
            increment,
        }
    }
}

/// GOAWAY: no new streams above `last_stream_id` will be processed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAwayFrame {
    pub last_stream_id: StreamId,
    pub error: ErrorCode,
    pub reason: Option<String>,
}

impl GoAwayFrame {
    pub fn new(last_stream_id: StreamId, error: ErrorCode, reason: Option<String>) -> Self {
        Self {
            last_stream_id,
            error,
            reason,
        }
    }
}

/// SETTINGS: the subset of parameters the engine acts on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsFrame {
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_concurrent_streams: Option<u32>,
    pub ack: bool,
}

impl SettingsFrame {
    /// Create a settings acknowledgement
    pub fn ack() -> Self {
        Self {
            ack: true,
            ..Self::default()
        }
    }
}

/// PING: liveness probe, answered with an ack carrying the same payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingFrame {
    pub payload: u64,
    pub ack: bool,
}

impl PingFrame {
    pub fn new(payload: u64) -> Self {
        Self {
            payload,
            ack: false,
        }
    }

    /// Build the acknowledgement for this ping
    pub fn to_ack(&self) -> Self {
        Self {
            payload: self.payload,
            ack: true,
        }
    }
}

/// A decoded frame
#[derive(Debug, Clone)]
pub enum Frame {
    Headers(HeadersFrame),
    Data(DataFrame),
    Reset(ResetFrame),
    WindowUpdate(WindowUpdateFrame),
    GoAway(GoAwayFrame),
    Settings(SettingsFrame),
    Ping(PingFrame),
}

impl Frame {
    /// Get the frame kind
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Headers(_) => FrameKind::Headers,
            Self::Data(_) => FrameKind::Data,
            Self::Reset(_) => FrameKind::ResetStream,
            Self::WindowUpdate(_) => FrameKind::WindowUpdate,
            Self::GoAway(_) => FrameKind::GoAway,
            Self::Settings(_) => FrameKind::Settings,
            Self::Ping(_) => FrameKind::Ping,
        }
    }

    /// Target stream id; 0 for connection-scoped frames
    pub fn stream_id(&self) -> StreamId {
        match self {
            Self::Headers(f) => f.stream_id,
            Self::Data(f) => f.stream_id,
            Self::Reset(f) => f.stream_id,
            Self::WindowUpdate(f) => f.stream_id,
            Self::GoAway(_) | Self::Settings(_) | Self::Ping(_) => 0,
        }
    }

    /// End-of-stream marker; only meaningful for HEADERS and DATA
    pub fn is_end_stream(&self) -> bool {
        match self {
            Self::Headers(f) => f.end_stream,
            Self::Data(f) => f.end_stream,
            _ => false,
        }
    }

    /// Flow-controlled payload length (non-zero only for DATA)
    pub fn payload_len(&self) -> u32 {
        match self {
            Self::Data(f) => f.flow_controlled_len(),
            _ => 0,
        }
    }

    /// Error code carried by RST_STREAM and GOAWAY
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Reset(f) => Some(f.error),
            Self::GoAway(f) => Some(f.error),
            _ => None,
        }
    }
}

impl From<HeadersFrame> for Frame {
    fn from(frame: HeadersFrame) -> Self {
        Self::Headers(frame)
    }
}

impl From<DataFrame> for Frame {
    fn from(frame: DataFrame) -> Self {
        Self::Data(frame)
    }
}

impl From<ResetFrame> for Frame {
    fn from(frame: ResetFrame) -> Self {
        Self::Reset(frame)
    }
}

impl From<WindowUpdateFrame> for Frame {
    fn from(frame: WindowUpdateFrame) -> Self {
        Self::WindowUpdate(frame)
    }
}

impl From<GoAwayFrame> for Frame {
    fn from(frame: GoAwayFrame) -> Self {
        Self::GoAway(frame)
    }
}

impl From<SettingsFrame> for Frame {
    fn from(frame: SettingsFrame) -> Self {
        Self::Settings(frame)
    }
}

impl From<PingFrame> for Frame {
    fn from(frame: PingFrame) -> Self {
        Self::Ping(frame)
    }
}
