//! Multiplexed session: stream table, frame dispatch, outbound writer and
//! the single close path.
//!
//! Locking: the session state mutex is always taken before a stream's
//! lifecycle mutex, and neither is held while a listener callback runs.
//! Listener callbacks are queued to per-stream event tasks.

use crate::events::{spawn_event_task, CallbackGuard, StreamEvent};
use crate::listener::{NoopSessionListener, SessionListener, StreamListener};
use crate::outbound::{OutboundQueue, WriteItem};
use crate::stream::{on_stream_idle, Completion, Lifecycle, Stream, StreamCore, StreamState};
use indexmap::IndexMap;
use skein_core::frame::{MAX_MAX_FRAME_SIZE, MAX_PADDING, MIN_MAX_FRAME_SIZE};
use skein_core::idle::lock;
use skein_core::{
    BoxFuture, CloseCause, CreditAccumulator, DataFrame, ErrorCode, FlowControlWindow, Frame,
    FrameKind, FrameSink, GoAwayFrame, HeadersFrame, IdleTimeout, PingFrame, ResetCause,
    ResetFrame, Scheduler, SessionConfig, SettingsFrame, SkeinError, StreamId, TokioScheduler,
    WindowUpdateFrame, MAX_STREAM_ID, MAX_WINDOW_SIZE,
};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, trace, warn};

/// Which end of the connection this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection; creates odd-numbered streams.
    Initiator,
    /// Accepted the connection; creates even-numbered streams.
    Acceptor,
}

impl Role {
    fn first_local_id(&self) -> StreamId {
        match self {
            Self::Initiator => 1,
            Self::Acceptor => 2,
        }
    }

    /// Whether `id` belongs to streams this side creates
    pub fn is_local(&self, id: StreamId) -> bool {
        let odd = id % 2 == 1;
        match self {
            Self::Initiator => odd,
            Self::Acceptor => !odd,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiator => "initiator",
            Self::Acceptor => "acceptor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session close state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseState {
    Open,
    /// We sent GOAWAY; existing streams drain.
    GoAwaySent,
    /// The peer sent GOAWAY; no new local streams.
    GoAwayReceived,
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct PeerSettings {
    initial_window_size: u32,
    max_frame_size: u32,
    max_concurrent_streams: Option<u32>,
}

pub(crate) struct SessionState {
    close_state: CloseState,
    close_cause: Option<CloseCause>,
    remote_goaway: Option<GoAwayFrame>,
    /// Live streams in creation order.
    streams: IndexMap<StreamId, Arc<StreamCore>>,
    next_local_id: StreamId,
    last_remote_id: StreamId,
    peer: PeerSettings,
    /// Ceiling the connection send window was last sized to.
    send_window_max: u32,
    outbound: OutboundQueue,
    goaway_sent: bool,
    /// The transport failed or ended; nothing more can be written.
    write_closed: bool,
}

pub(crate) struct SessionInner {
    role: Role,
    config: SessionConfig,
    pub(crate) listener: Arc<dyn SessionListener>,
    scheduler: Arc<dyn Scheduler>,
    pub(crate) runtime: Handle,
    send_window: FlowControlWindow,
    recv_window: FlowControlWindow,
    recv_credit: CreditAccumulator,
    idle: IdleTimeout,
    state: Mutex<SessionState>,
    writer_wake: Notify,
    pub(crate) callbacks_in_flight: AtomicUsize,
    closed: watch::Sender<bool>,
}

/// One multiplexed connection
///
/// Cheap to clone; all clones drive the same session. A session stays alive
/// until it is closed, whether explicitly, by the peer, by a fatal error or
/// by its idle timeout.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session writing to `sink`.
    ///
    /// Must be called inside a tokio runtime; the outbound writer and the
    /// stream callback tasks are spawned onto it. The session's SETTINGS
    /// are queued as the first outbound frame.
    pub fn new<S: FrameSink>(
        role: Role,
        config: SessionConfig,
        listener: Arc<dyn SessionListener>,
        scheduler: Arc<dyn Scheduler>,
        sink: S,
    ) -> Result<Self, SkeinError> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| SkeinError::Config("session requires a tokio runtime".to_string()))?;

        let (closed, _) = watch::channel(false);
        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let weak = weak.clone();
            let idle = IdleTimeout::new(scheduler.clone(), config.idle_timeout(), move |idle| {
                on_session_idle(weak.clone(), idle)
            });
            SessionInner {
                role,
                send_window: FlowControlWindow::new(config.initial_session_send_window),
                recv_window: FlowControlWindow::new(config.initial_session_recv_window),
                recv_credit: CreditAccumulator::new(
                    config.initial_session_recv_window,
                    config.window_update_ratio,
                ),
                state: Mutex::new(SessionState {
                    close_state: CloseState::Open,
                    close_cause: None,
                    remote_goaway: None,
                    streams: IndexMap::new(),
                    next_local_id: role.first_local_id(),
                    last_remote_id: 0,
                    peer: PeerSettings {
                        initial_window_size: config.initial_stream_send_window,
                        max_frame_size: MIN_MAX_FRAME_SIZE,
                        max_concurrent_streams: None,
                    },
                    send_window_max: config.initial_session_send_window,
                    outbound: OutboundQueue::default(),
                    goaway_sent: false,
                    write_closed: false,
                }),
                config,
                listener,
                scheduler,
                runtime: runtime.clone(),
                idle,
                writer_wake: Notify::new(),
                callbacks_in_flight: AtomicUsize::new(0),
                closed,
            }
        });

        {
            let mut state = lock(&inner.state);
            let settings = inner.settings_frame();
            inner.enqueue_control(&mut state, settings);
        }
        runtime.spawn(run_writer(inner.clone(), Box::new(sink)));
        debug!("New {} session", role);

        Ok(Self { inner })
    }

    /// Start building a session for the given role
    pub fn builder(role: Role) -> SessionBuilder {
        SessionBuilder::new(role)
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn close_state(&self) -> CloseState {
        lock(&self.inner.state).close_state
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Why the session closed; `None` while it is still open
    pub fn close_cause(&self) -> Option<CloseCause> {
        lock(&self.inner.state).close_cause.clone()
    }

    /// Resolves once the session reaches CLOSED
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        loop {
            let closed = *rx.borrow_and_update();
            if closed || rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Open a local stream by sending `frame`.
    ///
    /// Resolves once the HEADERS frame has been written. Fails if the
    /// session is closing or closed, if the stream id space is exhausted or
    /// if the peer's concurrency limit is reached.
    pub async fn new_stream(
        &self,
        frame: HeadersFrame,
        listener: Arc<dyn StreamListener>,
    ) -> Result<Stream, SkeinError> {
        let (stream, written) = self.inner.open_local_stream(frame, listener)?;
        written.await?;
        Ok(stream)
    }

    /// Feed one inbound frame.
    ///
    /// Stream-local problems reset the stream and return `Ok`. An `Err` is
    /// connection-fatal and has already closed the session, or reports
    /// that the session was closed before the frame arrived.
    pub fn on_frame(&self, frame: Frame) -> Result<(), SkeinError> {
        let inner = &self.inner;
        if inner.is_closed() {
            trace!("Ignoring {} frame after close", frame.kind());
            return Err(SkeinError::SessionClosed);
        }
        inner.idle.notify_activity();
        trace!("Received {} frame on stream {}", frame.kind(), frame.stream_id());

        let result = match frame {
            Frame::Headers(frame) => inner.on_headers(frame),
            Frame::Data(frame) => inner.on_data(frame),
            Frame::Reset(frame) => inner.on_reset(frame),
            Frame::WindowUpdate(frame) => inner.on_window_update(frame),
            Frame::Settings(frame) => inner.on_settings(frame),
            Frame::Ping(frame) => inner.on_ping(frame),
            Frame::GoAway(frame) => inner.on_goaway(frame),
        };
        if let Err(err) = &result {
            inner.fail(err.clone());
        }
        result
    }

    /// Close now: send GOAWAY (once), reset every remaining stream and
    /// discard unsent stream frames
    pub fn close(&self, error: ErrorCode, reason: impl Into<String>) {
        let reason = reason.into();
        let mut state = lock(&self.inner.state);
        let goaway = Some((error, Some(reason.clone())));
        self.inner
            .close_locked(&mut state, CloseCause::Local { error, reason }, goaway);
    }

    /// Stop accepting streams and close once the live ones have finished
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let mut state = lock(&inner.state);
        if state.close_state != CloseState::Open {
            return;
        }
        let goaway = GoAwayFrame::new(
            state.last_remote_id,
            ErrorCode::NoError,
            Some("shutdown".to_string()),
        );
        inner.enqueue_control(&mut state, goaway);
        state.goaway_sent = true;
        state.close_state = CloseState::GoAwaySent;
        info!("Session shutting down with {} live streams", state.streams.len());
        inner.finish_drain(&mut state);
    }

    /// Close with a connection-fatal error
    pub fn fail(&self, err: SkeinError) {
        self.inner.fail(err);
    }

    /// The transport reached end of stream
    pub fn disconnected(&self) {
        let mut state = lock(&self.inner.state);
        state.write_closed = true;
        self.inner
            .close_locked(&mut state, CloseCause::Disconnected, None);
    }

    /// Send a PING; the peer's ack counts as connection activity
    pub fn ping(&self, payload: u64) -> Result<(), SkeinError> {
        let mut state = lock(&self.inner.state);
        if state.close_state == CloseState::Closed {
            return Err(SkeinError::SessionClosed);
        }
        self.inner.enqueue_control(&mut state, PingFrame::new(payload));
        Ok(())
    }

    /// Reconfigure the connection idle timeout; `Duration::ZERO` disables it
    pub fn set_idle_timeout(&self, timeout: Duration) {
        self.inner.idle.set_timeout(timeout);
    }

    /// Current connection idle timeout; zero when disabled
    pub fn idle_timeout(&self) -> Duration {
        self.inner.idle.timeout()
    }

    /// Snapshot of live streams in creation order
    pub fn streams(&self) -> Vec<Stream> {
        lock(&self.inner.state)
            .streams
            .values()
            .map(|core| Stream::new(core.clone()))
            .collect()
    }

    /// Look up a live stream
    pub fn stream(&self, id: StreamId) -> Option<Stream> {
        lock(&self.inner.state)
            .streams
            .get(&id)
            .map(|core| Stream::new(core.clone()))
    }

    /// Connection send credit
    pub fn send_window(&self) -> i64 {
        self.inner.send_window.available()
    }

    /// Connection receive credit
    pub fn recv_window(&self) -> i64 {
        self.inner.recv_window.available()
    }

    /// Renegotiate the connection send window ceiling.
    ///
    /// Credit may go negative; queued DATA then waits for WINDOW_UPDATEs.
    /// Returns the new available credit.
    pub fn resize_send_window(&self, new_max: u32) -> i64 {
        let inner = &self.inner;
        let mut state = lock(&inner.state);
        let old_max = state.send_window_max;
        state.send_window_max = new_max;
        let available = inner.send_window.resize(old_max, new_max);
        debug!(
            "Connection send window resized {} -> {}, {} available",
            old_max, new_max, available
        );
        inner.writer_wake.notify_one();
        available
    }

    /// SETTINGS advertising this session's receive configuration
    pub fn settings_frame(&self) -> SettingsFrame {
        self.inner.settings_frame()
    }

    /// Number of listener callbacks currently running
    pub fn callbacks_in_flight(&self) -> usize {
        self.inner.callbacks_in_flight.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("Session")
            .field("role", &self.inner.role)
            .field("close_state", &state.close_state)
            .field("streams", &state.streams.len())
            .field("send_window", &self.inner.send_window.available())
            .field("recv_window", &self.inner.recv_window.available())
            .finish()
    }
}

/// Builder for [`Session`]
pub struct SessionBuilder {
    role: Role,
    config: SessionConfig,
    listener: Option<Arc<dyn SessionListener>>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl SessionBuilder {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            config: SessionConfig::default(),
            listener: None,
            scheduler: None,
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Timer facility; defaults to the current tokio runtime's timer
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn build<S: FrameSink>(self, sink: S) -> Result<Session, SkeinError> {
        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioScheduler::current().ok_or_else(|| {
                SkeinError::Config("session requires a tokio runtime".to_string())
            })?),
        };
        let listener = self
            .listener
            .unwrap_or_else(|| Arc::new(NoopSessionListener));
        Session::new(self.role, self.config, listener, scheduler, sink)
    }
}

impl SessionInner {
    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.state).close_state == CloseState::Closed
    }

    fn settings_frame(&self) -> SettingsFrame {
        SettingsFrame {
            initial_window_size: Some(self.config.initial_stream_recv_window),
            max_frame_size: Some(self.config.max_frame_size),
            max_concurrent_streams: self.config.max_concurrent_streams,
            ack: false,
        }
    }

    fn enqueue_control(&self, state: &mut SessionState, frame: impl Into<Frame>) {
        state.outbound.push_control(WriteItem::control(frame));
        self.writer_wake.notify_one();
    }

    /// Whether `id` was in use at some point
    fn was_opened(&self, state: &SessionState, id: StreamId) -> bool {
        if self.role.is_local(id) {
            id < state.next_local_id
        } else {
            id <= state.last_remote_id
        }
    }

    fn count_streams(&self, state: &SessionState, local: bool) -> usize {
        state
            .streams
            .keys()
            .filter(|id| self.role.is_local(**id) == local)
            .count()
    }

    fn create_stream(
        self: &Arc<Self>,
        state: &SessionState,
        id: StreamId,
        listener: Option<Arc<dyn StreamListener>>,
    ) -> Arc<StreamCore> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let config = &self.config;
        let scheduler = self.scheduler.clone();
        let core = Arc::new_cyclic(|weak: &Weak<StreamCore>| {
            let weak = weak.clone();
            StreamCore {
                id,
                session: Arc::downgrade(self),
                lifecycle: Mutex::new(Lifecycle::new()),
                send_window: FlowControlWindow::new(state.peer.initial_window_size),
                recv_window: FlowControlWindow::new(config.initial_stream_recv_window),
                recv_credit: CreditAccumulator::new(
                    config.initial_stream_recv_window,
                    config.window_update_ratio,
                ),
                idle: IdleTimeout::new(scheduler, config.stream_idle_timeout(), move |idle| {
                    on_stream_idle(weak.clone(), idle)
                }),
                events,
            }
        });
        spawn_event_task(self, Stream::new(core.clone()), listener, events_rx);
        core
    }

    fn open_local_stream(
        self: &Arc<Self>,
        mut frame: HeadersFrame,
        listener: Arc<dyn StreamListener>,
    ) -> Result<(Stream, Completion), SkeinError> {
        let mut state = lock(&self.state);
        match state.close_state {
            CloseState::Open => {}
            CloseState::GoAwaySent | CloseState::GoAwayReceived => {
                return Err(SkeinError::SessionClosing)
            }
            CloseState::Closed => return Err(SkeinError::SessionClosed),
        }

        let id = state.next_local_id;
        if id > MAX_STREAM_ID {
            return Err(SkeinError::StreamIdsExhausted);
        }
        if let Some(max) = state.peer.max_concurrent_streams {
            if self.count_streams(&state, true) >= max as usize {
                return Err(SkeinError::TooManyStreams(max));
            }
        }
        state.next_local_id = id + 2;

        let core = self.create_stream(&state, id, Some(listener));
        frame.stream_id = id;
        if frame.end_stream {
            lock(&core.lifecycle).local_end_queued = true;
        }
        state.streams.insert(id, core.clone());

        let (done, written) = Completion::pending();
        state.outbound.push_control(WriteItem {
            frame: frame.into(),
            stream: Some(core.clone()),
            done: Some(done),
        });
        self.writer_wake.notify_one();
        debug!("Opened local stream {}", id);

        Ok((Stream::new(core), written))
    }

    /// Check that `core` may still send; claims the local end if `end_stream`
    fn claim_send(
        &self,
        state: &SessionState,
        core: &StreamCore,
        end_stream: bool,
    ) -> Result<(), SkeinError> {
        if state.close_state == CloseState::Closed {
            return Err(SkeinError::SessionClosed);
        }
        let mut lc = lock(&core.lifecycle);
        if let Some(cause) = lc.reset_cause {
            return Err(SkeinError::StreamReset {
                stream_id: core.id,
                cause,
            });
        }
        if lc.local_end_queued || !lc.state.can_send() {
            return Err(SkeinError::StreamClosed(core.id));
        }
        if end_stream {
            lc.local_end_queued = true;
        }
        Ok(())
    }

    pub(crate) fn submit_data(&self, core: &Arc<StreamCore>, frame: DataFrame) -> Completion {
        if frame.padding > MAX_PADDING {
            return Completion::failed(SkeinError::Protocol(format!(
                "padding {} exceeds {}",
                frame.padding, MAX_PADDING
            )));
        }
        let mut state = lock(&self.state);
        if let Err(err) = self.claim_send(&state, core, frame.end_stream) {
            return Completion::failed(err);
        }

        let limit = state.peer.max_frame_size as usize;
        let (done, written) = Completion::pending();
        let items = split_data(core, frame, limit, done);
        state.outbound.push_stream(core, items);
        self.writer_wake.notify_one();
        written
    }

    pub(crate) fn submit_headers(&self, core: &Arc<StreamCore>, mut frame: HeadersFrame) -> Completion {
        let mut state = lock(&self.state);
        if let Err(err) = self.claim_send(&state, core, frame.end_stream) {
            return Completion::failed(err);
        }

        frame.stream_id = core.id;
        let (done, written) = Completion::pending();
        let item = WriteItem {
            frame: frame.into(),
            stream: Some(core.clone()),
            done: Some(done),
        };
        state.outbound.push_stream(core, vec![item]);
        self.writer_wake.notify_one();
        written
    }

    pub(crate) fn reset_stream(self: &Arc<Self>, core: &Arc<StreamCore>, cause: ResetCause) {
        let mut state = lock(&self.state);
        self.reset_stream_locked(&mut state, core, cause);
    }

    fn reset_stream_locked(
        self: &Arc<Self>,
        state: &mut SessionState,
        core: &Arc<StreamCore>,
        cause: ResetCause,
    ) {
        if !lock(&core.lifecycle).reset(cause) {
            return;
        }
        let id = core.id;
        if matches!(cause, ResetCause::Local(_) | ResetCause::IdleTimeout) {
            self.enqueue_control(state, ResetFrame::new(id, cause.error_code()));
        }
        for item in state.outbound.remove_stream(id) {
            item.complete(Err(SkeinError::StreamReset {
                stream_id: id,
                cause,
            }));
        }
        core.emit(StreamEvent::Reset(cause));
        debug!("Stream {} reset: {}", id, cause);
        self.remove_stream_locked(state, id);
    }

    /// Drop a stream from the table; only the first call for an id has any
    /// effect
    fn remove_stream_locked(self: &Arc<Self>, state: &mut SessionState, id: StreamId) {
        let Some(core) = state.streams.shift_remove(&id) else {
            return;
        };
        core.idle.close();
        for item in state.outbound.remove_stream(id) {
            item.complete(Err(SkeinError::StreamClosed(id)));
        }
        core.emit(StreamEvent::Closed);
        trace!("Removed stream {} in state {}", id, core.state());
        self.finish_drain(state);
    }

    /// Close a draining session once its last stream is gone
    fn finish_drain(self: &Arc<Self>, state: &mut SessionState) {
        if !state.streams.is_empty() {
            return;
        }
        match state.close_state {
            CloseState::GoAwaySent | CloseState::GoAwayReceived => {
                let cause = match state.remote_goaway.clone() {
                    Some(goaway) => CloseCause::Remote(goaway),
                    None => CloseCause::Local {
                        error: ErrorCode::NoError,
                        reason: "shutdown".to_string(),
                    },
                };
                let goaway = Some((ErrorCode::NoError, None));
                self.close_locked(state, cause, goaway);
            }
            CloseState::Open | CloseState::Closed => {}
        }
    }

    /// The single close path. Returns `false` if already closed.
    fn close_locked(
        self: &Arc<Self>,
        state: &mut SessionState,
        cause: CloseCause,
        goaway: Option<(ErrorCode, Option<String>)>,
    ) -> bool {
        if state.close_state == CloseState::Closed {
            return false;
        }
        if let Some((error, reason)) = goaway {
            if !state.goaway_sent && !state.write_closed {
                let frame = GoAwayFrame::new(state.last_remote_id, error, reason);
                state.outbound.push_control(WriteItem::control(frame));
                state.goaway_sent = true;
            }
        }
        state.close_state = CloseState::Closed;
        state.close_cause = Some(cause.clone());

        for item in state.outbound.clear_streams() {
            item.complete(Err(SkeinError::SessionClosed));
        }
        let reset = ResetCause::SessionClosing(cause.error_code());
        for (_, core) in state.streams.drain(..) {
            if lock(&core.lifecycle).reset(reset) {
                core.emit(StreamEvent::Reset(reset));
            }
            core.idle.close();
            core.emit(StreamEvent::Closed);
        }
        self.idle.close();
        self.writer_wake.notify_one();
        self.closed.send_replace(true);
        info!("{} session closed: {}", self.role, cause);

        let session = Session::from_inner(self.clone());
        let listener = self.listener.clone();
        self.runtime.spawn(async move {
            listener.on_close(&session, &cause).await;
        });
        true
    }

    pub(crate) fn fail(self: &Arc<Self>, err: SkeinError) {
        let mut state = lock(&self.state);
        if state.close_state == CloseState::Closed {
            return;
        }
        error!("Session failure: {}", err);
        let goaway = match err {
            SkeinError::Transport(_) => {
                state.write_closed = true;
                None
            }
            _ => Some((err.error_code(), Some(err.to_string()))),
        };
        self.close_locked(&mut state, CloseCause::Failure(err.to_string()), goaway);
    }

    fn on_headers(self: &Arc<Self>, frame: HeadersFrame) -> Result<(), SkeinError> {
        let id = frame.stream_id;
        if id == 0 {
            return Err(SkeinError::Protocol("HEADERS on stream 0".to_string()));
        }
        let mut state = lock(&self.state);

        if let Some(core) = state.streams.get(&id).cloned() {
            let accepted = {
                let mut lc = lock(&core.lifecycle);
                if lc.state.can_recv() {
                    lc.activate();
                    if frame.end_stream {
                        lc.remote_end();
                    }
                    Some(lc.state == StreamState::Closed)
                } else {
                    None
                }
            };
            match accepted {
                Some(closed) => {
                    core.idle.notify_activity();
                    core.emit(StreamEvent::Headers(frame));
                    if closed {
                        self.remove_stream_locked(&mut state, id);
                    }
                }
                None => {
                    debug!("HEADERS on stream {} after remote end", id);
                    let cause = ResetCause::Local(ErrorCode::StreamClosed);
                    self.reset_stream_locked(&mut state, &core, cause);
                }
            }
            return Ok(());
        }

        if self.was_opened(&state, id) {
            trace!("Late HEADERS on closed stream {}", id);
            self.enqueue_control(&mut state, ResetFrame::new(id, ErrorCode::StreamClosed));
            return Ok(());
        }
        if self.role.is_local(id) {
            return Err(SkeinError::Protocol(format!(
                "HEADERS on unopened local stream {}",
                id
            )));
        }
        if id > MAX_STREAM_ID {
            return Err(SkeinError::Protocol(format!("stream id {} out of range", id)));
        }
        state.last_remote_id = id;

        if state.close_state == CloseState::GoAwaySent {
            debug!("Refusing stream {} while shutting down", id);
            self.enqueue_control(&mut state, ResetFrame::new(id, ErrorCode::RefusedStream));
            return Ok(());
        }
        if let Some(max) = self.config.max_concurrent_streams {
            if self.count_streams(&state, false) >= max as usize {
                debug!("Refusing stream {}: {} streams already open", id, max);
                self.enqueue_control(&mut state, ResetFrame::new(id, ErrorCode::RefusedStream));
                return Ok(());
            }
        }

        let core = self.create_stream(&state, id, None);
        {
            let mut lc = lock(&core.lifecycle);
            lc.activate();
            if frame.end_stream {
                lc.remote_end();
            }
        }
        state.streams.insert(id, core.clone());
        core.emit(StreamEvent::Opened(frame));
        debug!("Opened remote stream {}", id);
        Ok(())
    }

    fn on_data(self: &Arc<Self>, frame: DataFrame) -> Result<(), SkeinError> {
        let id = frame.stream_id;
        if id == 0 {
            return Err(SkeinError::Protocol("DATA on stream 0".to_string()));
        }
        if frame.padding > MAX_PADDING {
            return Err(SkeinError::Protocol(format!(
                "DATA padding {} on stream {}",
                frame.padding, id
            )));
        }
        let size = frame.frame_len();
        if size > self.config.max_frame_size as u64 {
            return Err(SkeinError::FrameTooLarge {
                stream_id: id,
                size,
                max: self.config.max_frame_size,
            });
        }
        let len = frame.flow_controlled_len();

        let available = self.recv_window.consume(len);
        if available < 0 {
            return Err(SkeinError::FlowControlViolation {
                stream_id: 0,
                received: len,
                available: available + len as i64,
            });
        }

        let mut state = lock(&self.state);
        let Some(core) = state.streams.get(&id).cloned() else {
            if self.was_opened(&state, id) {
                trace!("Late DATA on closed stream {}", id);
                self.return_session_credit(&mut state, len);
                self.enqueue_control(&mut state, ResetFrame::new(id, ErrorCode::StreamClosed));
                return Ok(());
            }
            return Err(SkeinError::Protocol(format!("DATA on unopened stream {}", id)));
        };

        let available = core.recv_window.consume(len);
        if available < 0 {
            return Err(SkeinError::FlowControlViolation {
                stream_id: id,
                received: len,
                available: available + len as i64,
            });
        }

        let accepted = {
            let mut lc = lock(&core.lifecycle);
            if lc.state.can_recv() {
                if frame.end_stream {
                    lc.remote_end();
                }
                Some(lc.state == StreamState::Closed)
            } else {
                None
            }
        };
        match accepted {
            Some(closed) => {
                core.idle.notify_activity();
                core.emit(StreamEvent::Data(frame));
                if closed {
                    self.remove_stream_locked(&mut state, id);
                }
            }
            None => {
                debug!("DATA on stream {} after remote end", id);
                self.return_session_credit(&mut state, len);
                let cause = ResetCause::Local(ErrorCode::StreamClosed);
                self.reset_stream_locked(&mut state, &core, cause);
            }
        }
        Ok(())
    }

    /// The application finished with `len` received bytes of `core`
    pub(crate) fn data_consumed(&self, core: &StreamCore, len: u32) {
        if len == 0 {
            return;
        }
        core.idle.notify_activity();
        let mut state = lock(&self.state);
        if state.close_state == CloseState::Closed {
            return;
        }
        self.return_session_credit(&mut state, len);

        let receiving =
            state.streams.contains_key(&core.id) && lock(&core.lifecycle).state.can_recv();
        if !receiving {
            return;
        }
        if let Some(batch) = core.recv_credit.consumed(len) {
            match core.recv_window.credit(batch) {
                Ok(_) => {
                    self.enqueue_control(&mut state, WindowUpdateFrame::new(core.id, batch))
                }
                Err(err) => warn!("Stream {} receive credit not returned: {}", core.id, err),
            }
        }
    }

    fn return_session_credit(&self, state: &mut SessionState, len: u32) {
        let Some(batch) = self.recv_credit.consumed(len) else {
            return;
        };
        match self.recv_window.credit(batch) {
            Ok(_) => self.enqueue_control(state, WindowUpdateFrame::new(0, batch)),
            Err(err) => warn!("Connection receive credit not returned: {}", err),
        }
    }

    fn on_reset(self: &Arc<Self>, frame: ResetFrame) -> Result<(), SkeinError> {
        let id = frame.stream_id;
        if id == 0 {
            return Err(SkeinError::Protocol("RST_STREAM on stream 0".to_string()));
        }
        let mut state = lock(&self.state);
        match state.streams.get(&id).cloned() {
            Some(core) => {
                self.reset_stream_locked(&mut state, &core, ResetCause::Remote(frame.error));
                Ok(())
            }
            None if self.was_opened(&state, id) => Ok(()),
            None => Err(SkeinError::Protocol(format!(
                "RST_STREAM on unopened stream {}",
                id
            ))),
        }
    }

    fn on_window_update(self: &Arc<Self>, frame: WindowUpdateFrame) -> Result<(), SkeinError> {
        let id = frame.stream_id;
        if id == 0 {
            if frame.increment == 0 {
                return Err(SkeinError::Protocol(
                    "zero connection WINDOW_UPDATE increment".to_string(),
                ));
            }
            let available = self.send_window.credit(frame.increment)?;
            trace!("Connection send window credited to {}", available);
            self.writer_wake.notify_one();
            return Ok(());
        }

        let mut state = lock(&self.state);
        let Some(core) = state.streams.get(&id).cloned() else {
            if self.was_opened(&state, id) {
                return Ok(());
            }
            return Err(SkeinError::Protocol(format!(
                "WINDOW_UPDATE on unopened stream {}",
                id
            )));
        };
        if frame.increment == 0 {
            let cause = ResetCause::Local(ErrorCode::ProtocolError);
            self.reset_stream_locked(&mut state, &core, cause);
            return Ok(());
        }
        core.send_window.credit(frame.increment)?;
        self.writer_wake.notify_one();
        Ok(())
    }

    fn on_settings(&self, frame: SettingsFrame) -> Result<(), SkeinError> {
        if frame.ack {
            trace!("SETTINGS acknowledged");
            return Ok(());
        }
        let mut state = lock(&self.state);

        if let Some(size) = frame.initial_window_size {
            if size as i64 > MAX_WINDOW_SIZE {
                return Err(SkeinError::WindowOverflow {
                    available: size as i64,
                    increment: 0,
                    max: MAX_WINDOW_SIZE,
                });
            }
            let old = state.peer.initial_window_size;
            for core in state.streams.values() {
                core.send_window.resize(old, size);
            }
            state.peer.initial_window_size = size;
            debug!("Peer initial stream window {} -> {}", old, size);
        }
        if let Some(size) = frame.max_frame_size {
            if !(MIN_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&size) {
                return Err(SkeinError::Protocol(format!(
                    "SETTINGS max frame size {} out of range",
                    size
                )));
            }
            state.peer.max_frame_size = size;
        }
        if let Some(max) = frame.max_concurrent_streams {
            state.peer.max_concurrent_streams = Some(max);
        }

        self.enqueue_control(&mut state, SettingsFrame::ack());
        Ok(())
    }

    fn on_ping(&self, frame: PingFrame) -> Result<(), SkeinError> {
        if frame.ack {
            trace!("PING {} acknowledged", frame.payload);
            return Ok(());
        }
        let mut state = lock(&self.state);
        self.enqueue_control(&mut state, frame.to_ack());
        Ok(())
    }

    fn on_goaway(self: &Arc<Self>, frame: GoAwayFrame) -> Result<(), SkeinError> {
        let mut state = lock(&self.state);
        info!(
            "GOAWAY received: last stream {}, {}",
            frame.last_stream_id, frame.error
        );
        let last = frame.last_stream_id;
        state.remote_goaway = Some(frame);
        if state.close_state == CloseState::Open {
            state.close_state = CloseState::GoAwayReceived;
        }

        let refused: Vec<_> = state
            .streams
            .values()
            .filter(|core| self.role.is_local(core.id) && core.id > last)
            .cloned()
            .collect();
        for core in refused {
            let cause = ResetCause::Remote(ErrorCode::RefusedStream);
            self.reset_stream_locked(&mut state, &core, cause);
        }
        self.finish_drain(&mut state);
        Ok(())
    }

    fn next_write(&self) -> NextWrite {
        let mut state = lock(&self.state);
        if state.write_closed {
            return NextWrite::Stop;
        }
        if let Some(item) = state.outbound.pop_control() {
            return NextWrite::Write(item);
        }
        if state.close_state == CloseState::Closed {
            return NextWrite::Stop;
        }
        match state.outbound.pop_stream(&self.send_window) {
            Some(item) => NextWrite::Write(item),
            None => {
                let queued = state.outbound.queued_frames();
                if queued > 0 {
                    trace!(
                        "{} frames stalled on flow control, connection window {}",
                        queued,
                        self.send_window.available()
                    );
                }
                NextWrite::Wait
            }
        }
    }

    /// Fail whatever the writer will never send
    fn abandon_writes(&self) {
        let dropped = lock(&self.state).outbound.clear();
        for item in dropped {
            item.complete(Err(SkeinError::SessionClosed));
        }
    }

    /// Bookkeeping after a frame reached the transport
    fn on_written(self: &Arc<Self>, stream: Option<&Arc<StreamCore>>, kind: FrameKind, end: bool) {
        self.idle.notify_activity();
        let Some(core) = stream else {
            return;
        };
        core.idle.notify_activity();
        if !matches!(kind, FrameKind::Headers | FrameKind::Data) {
            return;
        }

        let mut state = lock(&self.state);
        let closed = {
            let mut lc = lock(&core.lifecycle);
            if lc.state.is_terminal() {
                return;
            }
            if kind == FrameKind::Headers {
                lc.activate();
            }
            if end {
                lc.local_end();
            }
            lc.state == StreamState::Closed
        };
        if closed {
            self.remove_stream_locked(&mut state, core.id);
        }
    }
}

enum NextWrite {
    Write(WriteItem),
    Wait,
    Stop,
}

/// Split DATA into chunks of at most `limit` bytes; only the last chunk
/// carries end-of-stream, padding and the completion
fn split_data(
    core: &Arc<StreamCore>,
    frame: DataFrame,
    limit: usize,
    done: crate::stream::Completer,
) -> Vec<WriteItem> {
    let DataFrame {
        mut data,
        padding,
        end_stream,
        ..
    } = frame;
    let id = core.id;
    let mut items = Vec::new();
    while data.len() > limit {
        let chunk = data.split_to(limit);
        items.push(WriteItem {
            frame: DataFrame::new(id, chunk, false).into(),
            stream: Some(core.clone()),
            done: None,
        });
    }
    items.push(WriteItem {
        frame: DataFrame::new(id, data, end_stream)
            .with_padding(padding)
            .into(),
        stream: Some(core.clone()),
        done: Some(done),
    });
    items
}

/// The single writer: at most one frame is in flight on the transport
async fn run_writer(inner: Arc<SessionInner>, mut sink: Box<dyn FrameSink>) {
    loop {
        let item = match inner.next_write() {
            NextWrite::Write(item) => item,
            NextWrite::Wait => {
                inner.writer_wake.notified().await;
                continue;
            }
            NextWrite::Stop => break,
        };

        let WriteItem {
            frame,
            stream,
            done,
        } = item;
        let kind = frame.kind();
        let end = frame.is_end_stream();
        trace!("Writing {} frame on stream {}", kind, frame.stream_id());

        match sink.send(frame).await {
            Ok(()) => {
                inner.on_written(stream.as_ref(), kind, end);
                if let Some(done) = done {
                    let _ = done.send(Ok(()));
                }
            }
            Err(err) => {
                if let Some(done) = done {
                    let _ = done.send(Err(err.clone()));
                }
                let err = match err {
                    SkeinError::Transport(_) => err,
                    other => SkeinError::Transport(other.to_string()),
                };
                inner.fail(err);
                break;
            }
        }
    }

    inner.abandon_writes();
    if let Err(err) = sink.close().await {
        debug!("Error closing transport: {}", err);
    }
    trace!("{} session writer finished", inner.role);
}

/// Connection idle expiry: never while a listener callback is running
fn on_session_idle(inner: Weak<SessionInner>, idle: Duration) -> BoxFuture<bool> {
    Box::pin(async move {
        let Some(inner) = inner.upgrade() else {
            return true;
        };
        if inner.is_closed() {
            return true;
        }
        let busy = inner.callbacks_in_flight.load(Ordering::Acquire);
        if busy > 0 {
            debug!("Connection idle for {:?} but {} callbacks running", idle, busy);
            return false;
        }

        let session = Session::from_inner(inner.clone());
        let close = {
            let _busy = CallbackGuard::enter(&inner.callbacks_in_flight);
            inner.listener.on_idle_timeout(&session, idle).await
        };
        if !close {
            debug!("Connection idle timeout ignored by listener");
            return false;
        }

        info!("Connection idle timeout expired after {:?}", idle);
        let mut state = lock(&inner.state);
        let goaway = Some((ErrorCode::NoError, Some("idle_timeout".to_string())));
        inner.close_locked(&mut state, CloseCause::IdleTimeout(idle), goaway);
        true
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::NoopStreamListener;
    use crate::testing::*;
    use bytes::Bytes;
    use http::HeaderMap;

    fn request(end_stream: bool) -> HeadersFrame {
        HeadersFrame::request(HeaderMap::new(), end_stream)
    }

    fn remote_headers(id: StreamId, end_stream: bool) -> Frame {
        HeadersFrame::new(id, HeaderMap::new(), end_stream).into()
    }

    fn remote_data(id: StreamId, len: usize, end_stream: bool) -> Frame {
        DataFrame::new(id, Bytes::from(vec![7u8; len]), end_stream).into()
    }

    fn payload(len: usize) -> DataFrame {
        DataFrame::new(0, Bytes::from(vec![1u8; len]), false)
    }

    fn noop() -> Arc<dyn StreamListener> {
        Arc::new(NoopStreamListener)
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_consumes_both_windows() {
        let (session, mut frames) =
            recording_session(Role::Initiator, quiet_config(), Arc::new(NoopSessionListener));
        let stream = session.new_stream(request(false), noop()).await.unwrap();
        assert_eq!(stream.id(), 1);

        let stream_start = stream.send_window();
        let session_start = session.send_window();
        let mut sent = 0i64;
        let mut previous = (stream_start, session_start);
        for len in [100usize, 2_000, 30] {
            stream.data(payload(len)).await.unwrap();
            sent += len as i64;
            let now = (stream.send_window(), session.send_window());
            assert!(now.0 < previous.0 && now.1 < previous.1);
            assert_eq!(now, (stream_start - sent, session_start - sent));
            previous = now;
        }

        let frames = written(&mut frames).await;
        let kinds: Vec<_> = frames.iter().map(Frame::kind).collect();
        assert_eq!(
            kinds,
            vec![
                FrameKind::Settings,
                FrameKind::Headers,
                FrameKind::Data,
                FrameKind::Data,
                FrameKind::Data
            ]
        );
        assert_eq!(stream.state(), StreamState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_idle_timeout_resets_stream() {
        let streams = Arc::new(RecordingStreamListener::new());
        let log = streams.log.clone();
        let config = quiet_config().stream_idle_timeout_ms(1000);
        let (session, mut frames) = recording_session(
            Role::Initiator,
            config,
            Arc::new(RecordingSessionListener::new(streams.clone())),
        );
        let stream = session.new_stream(request(false), streams).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(log.idle_calls(), 1);
        assert_eq!(stream.state(), StreamState::Reset);
        assert_eq!(stream.reset_cause(), Some(ResetCause::IdleTimeout));
        assert!(session.streams().is_empty());
        assert_eq!(log.resets(), vec![ResetCause::IdleTimeout]);
        assert_eq!(log.closes(), 1);
        assert!(!session.is_closed());

        let frames = written(&mut frames).await;
        assert!(frames.iter().any(|frame| matches!(
            frame,
            Frame::Reset(ResetFrame { stream_id: 1, error: ErrorCode::Cancel })
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_declined_keeps_stream() {
        let mut streams = RecordingStreamListener::new();
        streams.close_on_idle = false;
        let streams = Arc::new(streams);
        let log = streams.log.clone();
        let config = quiet_config().stream_idle_timeout_ms(1000);
        let (session, _frames) =
            recording_session(Role::Initiator, config, Arc::new(NoopSessionListener));
        let stream = session.new_stream(request(false), streams).await.unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;

        assert_eq!(log.idle_calls(), 3);
        assert_eq!(stream.state(), StreamState::Open);
        assert_eq!(session.streams().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_data_defers_stream_idle_timeout() {
        let streams = Arc::new(RecordingStreamListener::new());
        let log = streams.log.clone();
        let config = quiet_config().stream_idle_timeout_ms(1000);
        let (session, _frames) = recording_session(
            Role::Acceptor,
            config,
            Arc::new(RecordingSessionListener::new(streams)),
        );

        session.on_frame(remote_headers(1, false)).unwrap();
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            session.on_frame(remote_data(1, 64, false)).unwrap();
        }
        settle().await;

        assert_eq!(log.idle_calls(), 0);
        assert_eq!(log.data_bytes.load(Ordering::SeqCst), 6 * 64);
        let stream = session.stream(1).unwrap();
        assert_eq!(stream.state(), StreamState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_in_slow_callback_defers_stream_idle() {
        let mut streams = RecordingStreamListener::new();
        streams.data_delay = Duration::from_millis(1500);
        let streams = Arc::new(streams);
        let log = streams.log.clone();
        let config = quiet_config().stream_idle_timeout_ms(1000);
        let (session, _frames) = recording_session(
            Role::Acceptor,
            config,
            Arc::new(RecordingSessionListener::new(streams)),
        );

        session.on_frame(remote_headers(1, false)).unwrap();
        session.on_frame(remote_data(1, 16, false)).unwrap();

        // The check at 1000ms waits behind on_data, which consumes at 1500ms.
        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(log.idle_calls(), 0);
        assert!(log.resets().is_empty());
        assert_eq!(session.stream(1).unwrap().state(), StreamState::Open);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(log.idle_calls(), 1);
        assert_eq!(log.resets(), vec![ResetCause::IdleTimeout]);
        assert!(session.stream(1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_stream_timeout_leaves_connection_timeout() {
        let streams = Arc::new(RecordingStreamListener::new());
        let log = streams.log.clone();
        let listener = Arc::new(RecordingSessionListener::new(streams));
        let config = SessionConfig::new()
            .idle_timeout_ms(1000)
            .stream_idle_timeout_ms(-1);
        let (session, mut frames) =
            recording_session(Role::Acceptor, config, listener.clone());

        session.on_frame(remote_headers(1, false)).unwrap();
        let stream = session.stream(1).unwrap();
        assert_eq!(stream.idle_timeout(), Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(5000)).await;

        assert_eq!(log.idle_calls(), 0);
        assert_eq!(listener.idle_calls(), 1);
        assert!(session.is_closed());
        assert!(matches!(session.close_cause(), Some(CloseCause::IdleTimeout(_))));
        assert_eq!(
            stream.reset_cause(),
            Some(ResetCause::SessionClosing(ErrorCode::NoError))
        );
        assert_eq!(log.closes(), 1);
        assert!(matches!(
            listener.closes().as_slice(),
            [CloseCause::IdleTimeout(_)]
        ));

        let frames = written(&mut frames).await;
        let goaway = frames.iter().find_map(|frame| match frame {
            Frame::GoAway(goaway) => Some(goaway.clone()),
            _ => None,
        });
        let goaway = goaway.unwrap();
        assert_eq!(goaway.error, ErrorCode::NoError);
        assert_eq!(goaway.reason.as_deref(), Some("idle_timeout"));
        assert_eq!(goaway.last_stream_id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_not_idle_while_callback_runs() {
        let mut streams = RecordingStreamListener::new();
        streams.data_delay = Duration::from_millis(2500);
        let listener = Arc::new(RecordingSessionListener::new(Arc::new(streams)));
        let config = SessionConfig::new().idle_timeout_ms(1000);
        let (session, _frames) = recording_session(Role::Acceptor, config, listener.clone());

        session.on_frame(remote_headers(1, false)).unwrap();
        session.on_frame(remote_data(1, 16, false)).unwrap();

        tokio::time::sleep(Duration::from_millis(2600)).await;
        assert!(!session.is_closed());
        assert_eq!(listener.idle_calls(), 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(session.is_closed());
        assert_eq!(listener.idle_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_connection_window_queues_in_order() {
        let (session, mut frames) =
            recording_session(Role::Initiator, quiet_config(), Arc::new(NoopSessionListener));
        let a = session.new_stream(request(false), noop()).await.unwrap();
        let b = session.new_stream(request(false), noop()).await.unwrap();
        a.data(payload(1000)).await.unwrap();
        b.data(payload(1000)).await.unwrap();
        written(&mut frames).await;

        assert_eq!(session.resize_send_window(1000), -1000);

        let a1 = a.data(payload(300));
        let a2 = a.data(payload(300));
        let b1 = b.data(payload(300));
        assert!(data_frames(&written(&mut frames).await).is_empty());

        let update = |increment| Frame::from(WindowUpdateFrame::new(0, increment));
        session.on_frame(update(1000)).unwrap();
        assert_eq!(session.send_window(), 0);
        assert!(data_frames(&written(&mut frames).await).is_empty());

        session.on_frame(update(1200)).unwrap();
        a1.await.unwrap();
        a2.await.unwrap();
        b1.await.unwrap();

        let sent = data_frames(&written(&mut frames).await);
        assert_eq!(sent, vec![(1, 300, false), (3, 300, false), (1, 300, false)]);
        assert_eq!(session.send_window(), 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_ids_strictly_increase() {
        let (initiator, _a) =
            recording_session(Role::Initiator, quiet_config(), Arc::new(NoopSessionListener));
        let (acceptor, _b) =
            recording_session(Role::Acceptor, quiet_config(), Arc::new(NoopSessionListener));

        let mut last = (0, 0);
        for _ in 0..5 {
            let odd = initiator.new_stream(request(false), noop()).await.unwrap();
            let even = acceptor.new_stream(request(false), noop()).await.unwrap();
            assert!(odd.id() > last.0 && odd.id() % 2 == 1);
            assert!(even.id() > last.1 && even.id() % 2 == 0);
            // A closed stream's id is never handed out again.
            odd.reset(ErrorCode::Cancel);
            last = (odd.id(), even.id());
        }
        assert_eq!(last, (9, 10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_ids_exhausted() {
        let (session, _frames) =
            recording_session(Role::Initiator, quiet_config(), Arc::new(NoopSessionListener));
        lock(&session.inner.state).next_local_id = MAX_STREAM_ID - 2;

        let a = session.new_stream(request(false), noop()).await.unwrap();
        let b = session.new_stream(request(false), noop()).await.unwrap();
        assert_eq!((a.id(), b.id()), (MAX_STREAM_ID - 2, MAX_STREAM_ID));

        for _ in 0..2 {
            assert!(matches!(
                session.new_stream(request(false), noop()).await,
                Err(SkeinError::StreamIdsExhausted)
            ));
        }
        let ids: Vec<_> = session.streams().iter().map(Stream::id).collect();
        assert_eq!(ids, vec![MAX_STREAM_ID - 2, MAX_STREAM_ID]);
        assert!(!session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_removed_exactly_once() {
        let streams = Arc::new(RecordingStreamListener::new());
        let log = streams.log.clone();
        let (session, mut frames) =
            recording_session(Role::Initiator, quiet_config(), Arc::new(NoopSessionListener));
        let stream = session.new_stream(request(false), streams).await.unwrap();

        stream.reset(ErrorCode::Cancel);
        stream.reset(ErrorCode::InternalError);
        session
            .on_frame(ResetFrame::new(1, ErrorCode::StreamClosed).into())
            .unwrap();
        session.close(ErrorCode::NoError, "done");
        settle().await;

        assert_eq!(log.closes(), 1);
        assert_eq!(log.resets(), vec![ResetCause::Local(ErrorCode::Cancel)]);
        let resets = written(&mut frames)
            .await
            .into_iter()
            .filter(|frame| frame.kind() == FrameKind::ResetStream)
            .count();
        assert_eq!(resets, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_end_flags_close_stream() {
        let streams = Arc::new(RecordingStreamListener::new());
        let log = streams.log.clone();
        let (session, _frames) =
            recording_session(Role::Initiator, quiet_config(), Arc::new(NoopSessionListener));
        let stream = session.new_stream(request(true), streams).await.unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
        assert!(matches!(
            stream.data(payload(1)).await,
            Err(SkeinError::StreamClosed(1))
        ));

        session.on_frame(remote_headers(1, false)).unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
        session.on_frame(remote_data(1, 10, true)).unwrap();
        settle().await;

        assert_eq!(stream.state(), StreamState::Closed);
        assert!(session.stream(1).is_none());
        assert_eq!(log.headers.load(Ordering::SeqCst), 1);
        assert_eq!(log.closes(), 1);
        assert!(log.resets().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumed_data_returns_credit() {
        let (session, mut frames) =
            recording_session(Role::Acceptor, quiet_config(), Arc::new(NoopSessionListener));
        session.on_frame(remote_headers(1, false)).unwrap();
        session.on_frame(remote_data(1, 20_000, false)).unwrap();
        assert_eq!(session.recv_window(), 65_535 - 20_000);
        session.on_frame(remote_data(1, 20_000, false)).unwrap();

        let frames = written(&mut frames).await;
        let updates: Vec<_> = frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::WindowUpdate(update) => Some((update.stream_id, update.increment)),
                _ => None,
            })
            .collect();
        assert!(updates.contains(&(0, 40_000)));
        assert!(updates.contains(&(1, 40_000)));
        assert_eq!(session.recv_window(), 65_535);
        assert_eq!(session.stream(1).unwrap().recv_window(), 65_535);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_overrun_is_fatal() {
        let listener = Arc::new(RecordingSessionListener::new(Arc::new(
            RecordingStreamListener::new(),
        )));
        let config = quiet_config().recv_window(1000, 65_535);
        let (session, mut frames) = recording_session(Role::Acceptor, config, listener.clone());
        session.on_frame(remote_headers(1, false)).unwrap();

        let err = session.on_frame(remote_data(1, 1001, false)).unwrap_err();
        assert!(matches!(
            err,
            SkeinError::FlowControlViolation { stream_id: 1, .. }
        ));
        assert!(session.is_closed());
        assert!(matches!(
            session.on_frame(remote_data(1, 1, false)),
            Err(SkeinError::SessionClosed)
        ));

        let frames = written(&mut frames).await;
        assert!(frames.iter().any(|frame| matches!(
            frame,
            Frame::GoAway(GoAwayFrame { error: ErrorCode::FlowControlError, .. })
        )));
        assert!(matches!(listener.closes().as_slice(), [CloseCause::Failure(_)]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_update_overflow_is_fatal() {
        let (session, _frames) =
            recording_session(Role::Initiator, quiet_config(), Arc::new(NoopSessionListener));
        let err = session
            .on_frame(WindowUpdateFrame::new(0, 0x7fff_ffff).into())
            .unwrap_err();
        assert!(matches!(err, SkeinError::WindowOverflow { .. }));
        assert!(session.is_closed());
        assert_eq!(session.send_window(), 65_535);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_and_unknown_frames() {
        let (session, mut frames) =
            recording_session(Role::Acceptor, quiet_config(), Arc::new(NoopSessionListener));
        session.on_frame(remote_headers(1, false)).unwrap();
        session
            .on_frame(ResetFrame::new(1, ErrorCode::Cancel).into())
            .unwrap();
        assert!(session.stream(1).is_none());

        // Late frames on a used id are answered, not fatal.
        session.on_frame(remote_data(1, 100, false)).unwrap();
        session
            .on_frame(WindowUpdateFrame::new(1, 10).into())
            .unwrap();
        session
            .on_frame(ResetFrame::new(1, ErrorCode::Cancel).into())
            .unwrap();
        assert!(!session.is_closed());
        let frames_now = written(&mut frames).await;
        assert!(frames_now.iter().any(|frame| matches!(
            frame,
            Frame::Reset(ResetFrame { stream_id: 1, error: ErrorCode::StreamClosed })
        )));

        // DATA on an id that was never opened is a protocol error.
        let err = session.on_frame(remote_data(7, 1, false)).unwrap_err();
        assert!(matches!(err, SkeinError::Protocol(_)));
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_after_remote_end_resets_stream_only() {
        let streams = Arc::new(RecordingStreamListener::new());
        let log = streams.log.clone();
        let (session, mut frames) = recording_session(
            Role::Acceptor,
            quiet_config(),
            Arc::new(RecordingSessionListener::new(streams)),
        );
        session.on_frame(remote_headers(1, true)).unwrap();
        let stream = session.stream(1).unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);

        session.on_frame(remote_data(1, 5, false)).unwrap();
        settle().await;
        assert!(!session.is_closed());
        assert_eq!(
            stream.reset_cause(),
            Some(ResetCause::Local(ErrorCode::StreamClosed))
        );
        assert_eq!(log.closes(), 1);
        let frames = written(&mut frames).await;
        assert!(frames.iter().any(|frame| matches!(
            frame,
            Frame::Reset(ResetFrame { stream_id: 1, error: ErrorCode::StreamClosed })
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_resize_and_ack() {
        let (session, mut frames) =
            recording_session(Role::Initiator, quiet_config(), Arc::new(NoopSessionListener));
        let stream = session.new_stream(request(false), noop()).await.unwrap();
        stream.data(payload(5_000)).await.unwrap();
        assert_eq!(stream.send_window(), 60_535);

        let settings = SettingsFrame {
            initial_window_size: Some(1_000),
            max_frame_size: None,
            max_concurrent_streams: Some(1),
            ack: false,
        };
        session.on_frame(settings.into()).unwrap();
        assert_eq!(stream.send_window(), 1_000 - 5_000);

        // The peer's concurrency limit applies to new local streams.
        assert!(matches!(
            session.new_stream(request(false), noop()).await,
            Err(SkeinError::TooManyStreams(1))
        ));

        session.on_frame(PingFrame::new(42).into()).unwrap();
        let frames = written(&mut frames).await;
        assert!(frames.iter().any(|frame| matches!(
            frame,
            Frame::Settings(SettingsFrame { ack: true, .. })
        )));
        assert!(frames.iter().any(|frame| matches!(
            frame,
            Frame::Ping(PingFrame { payload: 42, ack: true })
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_data_is_split() {
        let (session, mut frames) =
            recording_session(Role::Initiator, quiet_config(), Arc::new(NoopSessionListener));
        let stream = session.new_stream(request(false), noop()).await.unwrap();
        let mut frame = payload(40_000);
        frame.end_stream = true;
        stream.data(frame).await.unwrap();

        let sent = data_frames(&written(&mut frames).await);
        assert_eq!(
            sent,
            vec![(1, 16_384, false), (1, 16_384, false), (1, 7_232, true)]
        );
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_credit_splits_queued_data() {
        let config = quiet_config().send_window(65_535, 1_000);
        let (session, mut frames) =
            recording_session(Role::Initiator, config, Arc::new(NoopSessionListener));
        let stream = session.new_stream(request(false), noop()).await.unwrap();
        let mut frame = payload(2_500);
        frame.end_stream = true;
        let done = stream.data(frame);

        assert_eq!(data_frames(&written(&mut frames).await), vec![(1, 1_000, false)]);
        assert_eq!(session.send_window(), 0);

        let update = |increment| Frame::from(WindowUpdateFrame::new(0, increment));
        session.on_frame(update(1_000)).unwrap();
        assert_eq!(data_frames(&written(&mut frames).await), vec![(1, 1_000, false)]);

        session.on_frame(update(1_000)).unwrap();
        done.await.unwrap();
        assert_eq!(data_frames(&written(&mut frames).await), vec![(1, 500, true)]);
        assert_eq!(session.send_window(), 500);
        assert_eq!(stream.send_window(), 65_535 - 2_500);
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_data_is_fatal() {
        let (session, mut frames) =
            recording_session(Role::Acceptor, quiet_config(), Arc::new(NoopSessionListener));
        session.on_frame(remote_headers(1, false)).unwrap();

        let err = session.on_frame(remote_data(1, 16_385, false)).unwrap_err();
        assert!(matches!(
            err,
            SkeinError::FrameTooLarge { stream_id: 1, size: 16_385, max: 16_384 }
        ));
        assert!(session.is_closed());
        assert_eq!(session.recv_window(), 65_535);
        let frames = written(&mut frames).await;
        assert!(frames.iter().any(|frame| matches!(
            frame,
            Frame::GoAway(GoAwayFrame { error: ErrorCode::FrameSizeError, .. })
        )));

        let (session, _frames) =
            recording_session(Role::Acceptor, quiet_config(), Arc::new(NoopSessionListener));
        session.on_frame(remote_headers(1, false)).unwrap();
        let padded = DataFrame::new(1, Bytes::from_static(b"hi"), false).with_padding(u32::MAX);
        assert!(matches!(
            session.on_frame(padded.into()),
            Err(SkeinError::Protocol(_))
        ));
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_padding_is_bounded() {
        let (session, mut frames) =
            recording_session(Role::Initiator, quiet_config(), Arc::new(NoopSessionListener));
        let stream = session.new_stream(request(false), noop()).await.unwrap();

        let result = stream.data(payload(10).with_padding(256)).await;
        assert!(matches!(result, Err(SkeinError::Protocol(_))));
        assert_eq!(stream.state(), StreamState::Open);

        stream.data(payload(10).with_padding(255)).await.unwrap();
        let frames = written(&mut frames).await;
        let padded = frames.iter().find_map(|frame| match frame {
            Frame::Data(data) => Some(data.padding),
            _ => None,
        });
        assert_eq!(padded, Some(255));
        assert_eq!(stream.send_window(), 65_535 - 265);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_goaway_drains() {
        let streams = Arc::new(RecordingStreamListener::new());
        let log = streams.log.clone();
        let listener = Arc::new(RecordingSessionListener::new(streams.clone()));
        let (session, _frames) =
            recording_session(Role::Initiator, quiet_config(), listener.clone());
        let kept = session.new_stream(request(true), streams.clone()).await.unwrap();
        let refused = session.new_stream(request(false), streams).await.unwrap();

        session
            .on_frame(GoAwayFrame::new(1, ErrorCode::NoError, None).into())
            .unwrap();
        assert_eq!(session.close_state(), CloseState::GoAwayReceived);
        assert_eq!(
            refused.reset_cause(),
            Some(ResetCause::Remote(ErrorCode::RefusedStream))
        );
        assert!(matches!(
            session.new_stream(request(false), noop()).await,
            Err(SkeinError::SessionClosing)
        ));

        session.on_frame(remote_headers(1, true)).unwrap();
        settle().await;
        assert_eq!(kept.state(), StreamState::Closed);
        assert!(session.is_closed());
        assert!(matches!(listener.closes().as_slice(), [CloseCause::Remote(_)]));
        assert_eq!(log.closes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_refuses_new_streams_and_drains() {
        let listener = Arc::new(RecordingSessionListener::new(Arc::new(
            RecordingStreamListener::new(),
        )));
        let (session, mut frames) =
            recording_session(Role::Acceptor, quiet_config(), listener.clone());
        session.on_frame(remote_headers(1, true)).unwrap();
        session.shutdown();
        assert_eq!(session.close_state(), CloseState::GoAwaySent);

        session.on_frame(remote_headers(3, false)).unwrap();
        assert!(session.stream(3).is_none());

        let stream = session.stream(1).unwrap();
        let mut last = payload(3);
        last.end_stream = true;
        stream.data(last).await.unwrap();
        settle().await;

        assert!(session.is_closed());
        let frames = written(&mut frames).await;
        let goaways = frames
            .iter()
            .filter(|frame| frame.kind() == FrameKind::GoAway)
            .count();
        assert_eq!(goaways, 1);
        assert!(frames.iter().any(|frame| matches!(
            frame,
            Frame::Reset(ResetFrame { stream_id: 3, error: ErrorCode::RefusedStream })
        )));
        assert!(matches!(
            listener.closes().as_slice(),
            [CloseCause::Local { error: ErrorCode::NoError, .. }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_discards_queued_frames() {
        let (session, _frames) =
            recording_session(Role::Initiator, quiet_config(), Arc::new(NoopSessionListener));
        let stream = session.new_stream(request(false), noop()).await.unwrap();
        session.resize_send_window(0);
        let queued = stream.data(payload(10));

        session.close(ErrorCode::Cancel, "bye");
        session.closed().await;

        assert!(matches!(queued.await, Err(SkeinError::SessionClosed)));
        assert_eq!(
            stream.reset_cause(),
            Some(ResetCause::SessionClosing(ErrorCode::Cancel))
        );
        assert!(session.streams().is_empty());
        assert!(matches!(
            session.new_stream(request(false), noop()).await,
            Err(SkeinError::SessionClosed)
        ));
        assert!(matches!(
            session.close_cause(),
            Some(CloseCause::Local { error: ErrorCode::Cancel, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_concurrency_limit_refuses() {
        let config = quiet_config().max_concurrent_streams(1);
        let (session, mut frames) =
            recording_session(Role::Acceptor, config, Arc::new(NoopSessionListener));
        session.on_frame(remote_headers(1, false)).unwrap();
        session.on_frame(remote_headers(3, false)).unwrap();
        assert_eq!(session.streams().len(), 1);

        let frames = written(&mut frames).await;
        assert!(frames.iter().any(|frame| matches!(
            frame,
            Frame::Reset(ResetFrame { stream_id: 3, error: ErrorCode::RefusedStream })
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_closes_session() {
        let session = Session::builder(Role::Initiator)
            .config(quiet_config())
            .build(FailingSink)
            .unwrap();
        let result = session.new_stream(request(false), noop()).await;
        assert!(result.is_err());
        session.closed().await;
        assert!(matches!(session.close_cause(), Some(CloseCause::Failure(_))));
    }
}
