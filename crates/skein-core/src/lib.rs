//! Core types for the skein stream multiplexer.
//!
//! This crate provides the leaves the session engine is built from:
//! - Frame values (already decoded; the wire codec lives elsewhere)
//! - Error codes, errors and close/reset causes
//! - Flow control windows
//! - Idle timeouts and the timer seam
//! - Session configuration
//! - Transport traits

pub mod config;
pub mod error;
pub mod flow_control;
pub mod frame;
pub mod idle;
pub mod io;

pub use config::{timeout_from_millis, SessionConfig};
pub use error::{CloseCause, ErrorCode, ResetCause, SkeinError};
pub use flow_control::{
    CreditAccumulator, FlowControlWindow, DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE,
};
pub use frame::{
    DataFrame, Frame, FrameKind, GoAwayFrame, HeadersFrame, PingFrame, ResetFrame,
    SettingsFrame, StreamId, WindowUpdateFrame, MAX_STREAM_ID,
};
pub use idle::{BoxFuture, IdleTimeout, Scheduler, TimerHandle, TokioScheduler};
pub use io::{FrameSink, FrameSource};
