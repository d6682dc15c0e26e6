//! Error types, wire error codes and close/reset causes.

use crate::frame::{GoAwayFrame, StreamId};
use std::fmt;
use std::time::Duration;

/// Skein error type
#[derive(Debug, Clone, thiserror::Error)]
pub enum SkeinError {
    #[error("Flow control window overflow: {available} + {increment} exceeds {max}")]
    WindowOverflow {
        available: i64,
        increment: u32,
        max: i64,
    },

    #[error("Flow control violation on stream {stream_id}: received {received} bytes with {available} available")]
    FlowControlViolation {
        stream_id: StreamId,
        received: u32,
        available: i64,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame on stream {stream_id} is {size} bytes, limit {max}")]
    FrameTooLarge {
        stream_id: StreamId,
        size: u64,
        max: u32,
    },

    #[error("Stream {0} is closed")]
    StreamClosed(StreamId),

    #[error("Stream {stream_id} reset: {cause}")]
    StreamReset { stream_id: StreamId, cause: ResetCause },

    #[error("Session is closing, no new streams accepted")]
    SessionClosing,

    #[error("Session closed")]
    SessionClosed,

    #[error("Stream id space exhausted")]
    StreamIdsExhausted,

    #[error("Peer allows at most {0} concurrent streams")]
    TooManyStreams(u32),

    #[error("Idle timeout expired after {0:?}")]
    IdleTimeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SkeinError {
    /// Wire error code to report in GOAWAY or RST_STREAM
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::WindowOverflow { .. } | Self::FlowControlViolation { .. } => {
                ErrorCode::FlowControlError
            }
            Self::Protocol(_) => ErrorCode::ProtocolError,
            Self::FrameTooLarge { .. } => ErrorCode::FrameSizeError,
            Self::StreamClosed(_) => ErrorCode::StreamClosed,
            Self::StreamReset { cause, .. } => cause.error_code(),
            Self::SessionClosing | Self::SessionClosed => ErrorCode::NoError,
            Self::StreamIdsExhausted | Self::TooManyStreams(_) => ErrorCode::RefusedStream,
            Self::IdleTimeout(_) => ErrorCode::Cancel,
            Self::Transport(_) | Self::Config(_) => ErrorCode::InternalError,
        }
    }

    /// Whether this error tears down the whole connection
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::WindowOverflow { .. }
                | Self::FlowControlViolation { .. }
                | Self::Protocol(_)
                | Self::FrameTooLarge { .. }
                | Self::Transport(_)
        )
    }
}

/// Wire-level error codes (HTTP/2 numbering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
    Unknown(u32),
}

impl ErrorCode {
    /// Numeric value on the wire
    pub fn as_u32(&self) -> u32 {
        match self {
            Self::NoError => 0x0,
            Self::ProtocolError => 0x1,
            Self::InternalError => 0x2,
            Self::FlowControlError => 0x3,
            Self::SettingsTimeout => 0x4,
            Self::StreamClosed => 0x5,
            Self::FrameSizeError => 0x6,
            Self::RefusedStream => 0x7,
            Self::Cancel => 0x8,
            Self::CompressionError => 0x9,
            Self::ConnectError => 0xa,
            Self::EnhanceYourCalm => 0xb,
            Self::InadequateSecurity => 0xc,
            Self::Http11Required => 0xd,
            Self::Unknown(code) => *code,
        }
    }

    /// Get the code name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoError => "NO_ERROR",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
            Self::FlowControlError => "FLOW_CONTROL_ERROR",
            Self::SettingsTimeout => "SETTINGS_TIMEOUT",
            Self::StreamClosed => "STREAM_CLOSED",
            Self::FrameSizeError => "FRAME_SIZE_ERROR",
            Self::RefusedStream => "REFUSED_STREAM",
            Self::Cancel => "CANCEL",
            Self::CompressionError => "COMPRESSION_ERROR",
            Self::ConnectError => "CONNECT_ERROR",
            Self::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            Self::InadequateSecurity => "INADEQUATE_SECURITY",
            Self::Http11Required => "HTTP_1_1_REQUIRED",
            Self::Unknown(_) => "UNKNOWN",
        }
    }
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        match code {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "UNKNOWN(0x{:x})", code),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Why a stream ended in the RESET state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetCause {
    /// Reset by the local application or by a stream-local protocol error.
    Local(ErrorCode),
    /// RST_STREAM received from the peer.
    Remote(ErrorCode),
    /// The stream idle timeout expired and the listener agreed to close.
    IdleTimeout,
    /// The owning session closed while the stream was still live.
    SessionClosing(ErrorCode),
}

impl ResetCause {
    /// Error code sent (or received) on the wire for this cause
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Local(code) | Self::Remote(code) | Self::SessionClosing(code) => *code,
            Self::IdleTimeout => ErrorCode::Cancel,
        }
    }

    /// Whether the reset originated at the peer
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

impl fmt::Display for ResetCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(code) => write!(f, "local reset ({})", code),
            Self::Remote(code) => write!(f, "remote reset ({})", code),
            Self::IdleTimeout => f.write_str("idle timeout"),
            Self::SessionClosing(code) => write!(f, "session closing ({})", code),
        }
    }
}

/// Why a session reached the CLOSED state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// Closed by the local application.
    Local { error: ErrorCode, reason: String },
    /// The peer sent GOAWAY and the session drained.
    Remote(GoAwayFrame),
    /// The connection idle timeout expired and the listener agreed to close.
    IdleTimeout(Duration),
    /// A connection-fatal protocol or transport error.
    Failure(String),
    /// The transport reached end of stream.
    Disconnected,
}

impl CloseCause {
    /// Error code to advertise in our own GOAWAY
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Local { error, .. } => *error,
            Self::Remote(frame) => frame.error,
            Self::IdleTimeout(_) | Self::Disconnected => ErrorCode::NoError,
            Self::Failure(_) => ErrorCode::InternalError,
        }
    }
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { error, reason } => write!(f, "closed locally ({}): {}", error, reason),
            Self::Remote(frame) => write!(f, "closed by peer ({})", frame.error),
            Self::IdleTimeout(elapsed) => write!(f, "idle for {:?}", elapsed),
            Self::Failure(detail) => write!(f, "failed: {}", detail),
            Self::Disconnected => f.write_str("disconnected"),
        }
    }
}
