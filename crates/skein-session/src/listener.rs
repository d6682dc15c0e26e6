//! Application callbacks.
//!
//! Stream callbacks run on the stream's own event task, one at a time and
//! in frame order. Callbacks of different streams run concurrently.

use crate::session::Session;
use crate::stream::Stream;
use async_trait::async_trait;
use skein_core::{CloseCause, DataFrame, HeadersFrame, ResetCause};
use std::sync::Arc;
use std::time::Duration;

/// Session-level callbacks
#[async_trait]
pub trait SessionListener: Send + Sync + 'static {
    /// A peer opened a stream.
    ///
    /// Returning `None` leaves the stream without a listener; its frames are
    /// still consumed and credited.
    async fn on_new_stream(
        &self,
        _stream: &Stream,
        _frame: &HeadersFrame,
    ) -> Option<Arc<dyn StreamListener>> {
        None
    }

    /// The connection has been idle for `idle`.
    ///
    /// Return `true` to close the session, `false` to keep it open and
    /// re-arm the timer.
    async fn on_idle_timeout(&self, _session: &Session, _idle: Duration) -> bool {
        true
    }

    /// The session reached CLOSED; called exactly once.
    async fn on_close(&self, _session: &Session, _cause: &CloseCause) {}
}

/// Stream-level callbacks
#[async_trait]
pub trait StreamListener: Send + Sync + 'static {
    /// HEADERS received after the stream was opened (responses, trailers)
    async fn on_headers(&self, _stream: &Stream, _frame: &HeadersFrame) {}

    /// DATA received; the bytes count as consumed once this returns
    async fn on_data(&self, _stream: &Stream, _frame: &DataFrame) {}

    /// The stream was reset
    async fn on_reset(&self, _stream: &Stream, _cause: ResetCause) {}

    /// The stream was removed from its session; always the last callback
    async fn on_close(&self, _stream: &Stream) {}

    /// The stream has been idle for `idle`.
    ///
    /// Return `true` to reset the stream, `false` to re-arm the timer.
    async fn on_idle_timeout(&self, _stream: &Stream, _idle: Duration) -> bool {
        true
    }
}

/// Session listener that accepts every stream without a stream listener
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSessionListener;

impl SessionListener for NoopSessionListener {}

/// Stream listener that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStreamListener;

impl StreamListener for NoopStreamListener {}
