//! Test doubles: frame sinks and recording listeners.

use crate::listener::{SessionListener, StreamListener};
use crate::session::{Role, Session};
use crate::stream::Stream;
use async_trait::async_trait;
use skein_core::idle::lock;
use skein_core::{
    CloseCause, DataFrame, Frame, FrameSink, HeadersFrame, ResetCause, SessionConfig, SkeinError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Sink that hands every written frame to the test
pub(crate) struct RecordingSink {
    frames: mpsc::UnboundedSender<Frame>,
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send(&mut self, frame: Frame) -> Result<(), SkeinError> {
        self.frames
            .send(frame)
            .map_err(|_| SkeinError::Transport("recorder dropped".to_string()))
    }
}

/// Sink whose every write fails
pub(crate) struct FailingSink;

#[async_trait]
impl FrameSink for FailingSink {
    async fn send(&mut self, _frame: Frame) -> Result<(), SkeinError> {
        Err(SkeinError::Transport("broken pipe".to_string()))
    }
}

/// Config with the connection idle timeout off
pub(crate) fn quiet_config() -> SessionConfig {
    SessionConfig::new().idle_timeout_ms(0)
}

pub(crate) fn recording_session(
    role: Role,
    config: SessionConfig,
    listener: Arc<dyn SessionListener>,
) -> (Session, mpsc::UnboundedReceiver<Frame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = Session::builder(role)
        .config(config)
        .listener(listener)
        .build(RecordingSink { frames: tx })
        .unwrap();
    (session, rx)
}

/// Let spawned tasks run until they are all waiting
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Everything written so far
pub(crate) async fn written(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
    settle().await;
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

/// Written DATA frames as `(stream id, length, end_stream)`
pub(crate) fn data_frames(frames: &[Frame]) -> Vec<(u32, usize, bool)> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            Frame::Data(data) => Some((data.stream_id, data.data.len(), data.end_stream)),
            _ => None,
        })
        .collect()
}

#[derive(Default)]
pub(crate) struct StreamLog {
    pub(crate) headers: AtomicUsize,
    pub(crate) data_bytes: AtomicUsize,
    pub(crate) resets: Mutex<Vec<ResetCause>>,
    pub(crate) closes: AtomicUsize,
    pub(crate) idle_calls: AtomicUsize,
}

impl StreamLog {
    pub(crate) fn idle_calls(&self) -> usize {
        self.idle_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn resets(&self) -> Vec<ResetCause> {
        lock(&self.resets).clone()
    }
}

pub(crate) struct RecordingStreamListener {
    pub(crate) log: Arc<StreamLog>,
    pub(crate) close_on_idle: bool,
    /// Simulated processing time per DATA frame.
    pub(crate) data_delay: Duration,
}

impl RecordingStreamListener {
    pub(crate) fn new() -> Self {
        Self {
            log: Arc::new(StreamLog::default()),
            close_on_idle: true,
            data_delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl StreamListener for RecordingStreamListener {
    async fn on_headers(&self, _stream: &Stream, _frame: &HeadersFrame) {
        self.log.headers.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_data(&self, _stream: &Stream, frame: &DataFrame) {
        if !self.data_delay.is_zero() {
            tokio::time::sleep(self.data_delay).await;
        }
        self.log
            .data_bytes
            .fetch_add(frame.data.len(), Ordering::SeqCst);
    }

    async fn on_reset(&self, _stream: &Stream, cause: ResetCause) {
        lock(&self.log.resets).push(cause);
    }

    async fn on_close(&self, _stream: &Stream) {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_idle_timeout(&self, _stream: &Stream, _idle: Duration) -> bool {
        self.log.idle_calls.fetch_add(1, Ordering::SeqCst);
        self.close_on_idle
    }
}

/// Session listener handing one shared stream listener to every remote stream
pub(crate) struct RecordingSessionListener {
    pub(crate) streams: Arc<RecordingStreamListener>,
    pub(crate) close_on_idle: bool,
    pub(crate) idle_calls: AtomicUsize,
    pub(crate) new_streams: AtomicUsize,
    pub(crate) closes: Mutex<Vec<CloseCause>>,
}

impl RecordingSessionListener {
    pub(crate) fn new(streams: Arc<RecordingStreamListener>) -> Self {
        Self {
            streams,
            close_on_idle: true,
            idle_calls: AtomicUsize::new(0),
            new_streams: AtomicUsize::new(0),
            closes: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn idle_calls(&self) -> usize {
        self.idle_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> Vec<CloseCause> {
        lock(&self.closes).clone()
    }
}

#[async_trait]
impl SessionListener for RecordingSessionListener {
    async fn on_new_stream(
        &self,
        _stream: &Stream,
        _frame: &HeadersFrame,
    ) -> Option<Arc<dyn StreamListener>> {
        self.new_streams.fetch_add(1, Ordering::SeqCst);
        Some(self.streams.clone())
    }

    async fn on_idle_timeout(&self, _session: &Session, _idle: Duration) -> bool {
        self.idle_calls.fetch_add(1, Ordering::SeqCst);
        self.close_on_idle
    }

    async fn on_close(&self, _session: &Session, cause: &CloseCause) {
        lock(&self.closes).push(cause.clone());
    }
}
