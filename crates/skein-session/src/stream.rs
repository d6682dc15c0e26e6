//! Stream state machine and application handle.

use crate::events::StreamEvent;
use crate::session::{Session, SessionInner};
use skein_core::idle::lock;
use skein_core::{
    BoxFuture, CreditAccumulator, DataFrame, FlowControlWindow, HeadersFrame, IdleTimeout,
    ResetCause, SkeinError, StreamId,
};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Stream lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
    Reset,
}

impl StreamState {
    /// CLOSED or RESET
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Reset)
    }

    /// Whether the peer may still send frames on this stream
    pub fn can_recv(&self) -> bool {
        matches!(self, Self::Idle | Self::Open | Self::HalfClosedLocal)
    }

    /// Whether we may still send frames on this stream
    pub fn can_send(&self) -> bool {
        matches!(self, Self::Idle | Self::Open | Self::HalfClosedRemote)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Open => "OPEN",
            Self::HalfClosedLocal => "HALF_CLOSED_LOCAL",
            Self::HalfClosedRemote => "HALF_CLOSED_REMOTE",
            Self::Closed => "CLOSED",
            Self::Reset => "RESET",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transition table for one stream
#[derive(Debug)]
pub(crate) struct Lifecycle {
    pub(crate) state: StreamState,
    pub(crate) reset_cause: Option<ResetCause>,
    /// An end-of-stream frame has been submitted; further sends are refused.
    pub(crate) local_end_queued: bool,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: StreamState::Idle,
            reset_cause: None,
            local_end_queued: false,
        }
    }

    /// HEADERS seen in either direction
    pub(crate) fn activate(&mut self) {
        if self.state == StreamState::Idle {
            self.state = StreamState::Open;
        }
    }

    /// Our end-of-stream flag was written
    pub(crate) fn local_end(&mut self) {
        self.state = match self.state {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    /// The peer's end-of-stream flag was received
    pub(crate) fn remote_end(&mut self) {
        self.state = match self.state {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    /// Move to RESET; returns `false` if the stream had already ended
    pub(crate) fn reset(&mut self, cause: ResetCause) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = StreamState::Reset;
        self.reset_cause = Some(cause);
        true
    }
}

/// Shared per-stream state, owned by the session's stream table
pub(crate) struct StreamCore {
    pub(crate) id: StreamId,
    pub(crate) session: Weak<SessionInner>,
    pub(crate) lifecycle: Mutex<Lifecycle>,
    pub(crate) send_window: FlowControlWindow,
    pub(crate) recv_window: FlowControlWindow,
    pub(crate) recv_credit: CreditAccumulator,
    pub(crate) idle: IdleTimeout,
    pub(crate) events: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamCore {
    pub(crate) fn state(&self) -> StreamState {
        lock(&self.lifecycle).state
    }

    /// Queue an event for the stream's callback task.
    ///
    /// Fails silently once the task has delivered `on_close`.
    pub(crate) fn emit(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }
}

/// Idle expiry for one stream: ask the listener, then reset on `true`
pub(crate) fn on_stream_idle(core: Weak<StreamCore>, idle: Duration) -> BoxFuture<bool> {
    Box::pin(async move {
        let Some(core) = core.upgrade() else {
            return true;
        };
        if core.state().is_terminal() {
            return true;
        }

        let (reply, answer) = oneshot::channel();
        if core.events.send(StreamEvent::IdleTimeout { reply }).is_err() {
            return true;
        }
        let close = answer.await.unwrap_or(true);
        if !close {
            debug!(stream_id = core.id, ?idle, "stream idle timeout declined");
            return false;
        }

        debug!(stream_id = core.id, ?idle, "stream idle timeout expired");
        match core.session.upgrade() {
            Some(session) => session.reset_stream(&core, ResetCause::IdleTimeout),
            None => {
                lock(&core.lifecycle).reset(ResetCause::IdleTimeout);
            }
        }
        true
    })
}

/// Handle to one stream of a session
///
/// Cheap to clone; all clones refer to the same stream.
#[derive(Clone)]
pub struct Stream {
    pub(crate) core: Arc<StreamCore>,
}

impl Stream {
    pub(crate) fn new(core: Arc<StreamCore>) -> Self {
        Self { core }
    }

    pub fn id(&self) -> StreamId {
        self.core.id
    }

    pub fn state(&self) -> StreamState {
        self.core.state()
    }

    /// Why the stream was reset, if it was
    pub fn reset_cause(&self) -> Option<ResetCause> {
        lock(&self.core.lifecycle).reset_cause
    }

    pub fn is_reset(&self) -> bool {
        self.state() == StreamState::Reset
    }

    /// CLOSED or RESET
    pub fn is_closed(&self) -> bool {
        self.state().is_terminal()
    }

    /// Queue DATA for sending.
    ///
    /// The frame waits until both the stream and session send windows can
    /// cover it; frames of one stream are written in submission order. The
    /// returned [`Completion`] resolves once the frame (or its last chunk)
    /// has been handed to the transport.
    pub fn data(&self, frame: DataFrame) -> Completion {
        match self.core.session.upgrade() {
            Some(session) => session.submit_data(&self.core, frame),
            None => Completion::failed(SkeinError::SessionClosed),
        }
    }

    /// Queue HEADERS (a response or trailers) for sending
    pub fn headers(&self, frame: HeadersFrame) -> Completion {
        match self.core.session.upgrade() {
            Some(session) => session.submit_headers(&self.core, frame),
            None => Completion::failed(SkeinError::SessionClosed),
        }
    }

    /// Reset the stream; a no-op once it has ended
    pub fn reset(&self, error: skein_core::ErrorCode) {
        let cause = ResetCause::Local(error);
        match self.core.session.upgrade() {
            Some(session) => session.reset_stream(&self.core, cause),
            None => {
                lock(&self.core.lifecycle).reset(cause);
            }
        }
    }

    /// Reconfigure this stream's idle timeout; `Duration::ZERO` disables it
    /// without affecting the connection timeout
    pub fn set_idle_timeout(&self, timeout: Duration) {
        self.core.idle.set_timeout(timeout);
    }

    /// Current idle timeout; zero when disabled
    pub fn idle_timeout(&self) -> Duration {
        self.core.idle.timeout()
    }

    /// Available send credit
    pub fn send_window(&self) -> i64 {
        self.core.send_window.available()
    }

    /// Available receive credit
    pub fn recv_window(&self) -> i64 {
        self.core.recv_window.available()
    }

    /// Owning session, if it still exists
    pub fn session(&self) -> Option<Session> {
        self.core.session.upgrade().map(Session::from_inner)
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.core.id)
            .field("state", &self.state())
            .field("send_window", &self.send_window())
            .field("recv_window", &self.recv_window())
            .finish()
    }
}

pub(crate) type Completer = oneshot::Sender<Result<(), SkeinError>>;

/// Resolves when a submitted frame has been written, or why it never was
#[must_use = "completions do nothing unless awaited"]
pub struct Completion {
    rx: oneshot::Receiver<Result<(), SkeinError>>,
}

impl Completion {
    pub(crate) fn pending() -> (Completer, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    pub(crate) fn failed(err: SkeinError) -> Self {
        let (tx, completion) = Self::pending();
        let _ = tx.send(Err(err));
        completion
    }
}

impl Future for Completion {
    type Output = Result<(), SkeinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(SkeinError::SessionClosed)))
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}
