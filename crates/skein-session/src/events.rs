//! Per-stream callback task.
//!
//! Each stream gets one task that owns its listener and runs callbacks in
//! the order events were queued. The frame-reading path only enqueues, so
//! a slow listener never blocks other streams.

use crate::listener::{NoopStreamListener, StreamListener};
use crate::session::SessionInner;
use crate::stream::Stream;
use skein_core::{DataFrame, HeadersFrame, ResetCause};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

pub(crate) enum StreamEvent {
    /// Peer opened the stream; ask the session listener for a stream listener.
    Opened(HeadersFrame),
    Headers(HeadersFrame),
    Data(DataFrame),
    /// Idle check fired; the reply is `true` if the stream should close.
    IdleTimeout { reply: oneshot::Sender<bool> },
    Reset(ResetCause),
    Closed,
}

/// Marks the session busy while a listener callback runs
pub(crate) struct CallbackGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> CallbackGuard<'a> {
    pub(crate) fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for CallbackGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) fn spawn_event_task(
    session: &Arc<SessionInner>,
    stream: Stream,
    listener: Option<Arc<dyn StreamListener>>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
) {
    let runtime = session.runtime.clone();
    let session = Arc::downgrade(session);
    runtime.spawn(run_events(session, stream, listener, events));
}

async fn run_events(
    session: Weak<SessionInner>,
    stream: Stream,
    listener: Option<Arc<dyn StreamListener>>,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
) {
    let mut listener: Arc<dyn StreamListener> =
        listener.unwrap_or_else(|| Arc::new(NoopStreamListener));

    while let Some(event) = events.recv().await {
        // Callbacks still run after the session is gone; only credit
        // return and the busy counter need it.
        let inner = session.upgrade();
        let _busy = inner
            .as_ref()
            .map(|inner| CallbackGuard::enter(&inner.callbacks_in_flight));

        match event {
            StreamEvent::Opened(frame) => {
                if let Some(inner) = &inner {
                    if let Some(chosen) = inner.listener.on_new_stream(&stream, &frame).await {
                        listener = chosen;
                    }
                }
            }
            StreamEvent::Headers(frame) => listener.on_headers(&stream, &frame).await,
            StreamEvent::Data(frame) => {
                listener.on_data(&stream, &frame).await;
                if let Some(inner) = &inner {
                    inner.data_consumed(&stream.core, frame.flow_controlled_len());
                }
            }
            StreamEvent::IdleTimeout { reply } => {
                // Progress made while earlier callbacks ran cancels expiry.
                let idle = stream.core.idle.idle_for();
                let timeout = stream.core.idle.timeout();
                let close = if timeout.is_zero() || idle < timeout {
                    trace!(stream_id = stream.id(), ?idle, "stream active again");
                    false
                } else {
                    listener.on_idle_timeout(&stream, idle).await
                };
                let _ = reply.send(close);
            }
            StreamEvent::Reset(cause) => listener.on_reset(&stream, cause).await,
            StreamEvent::Closed => {
                listener.on_close(&stream).await;
                trace!(stream_id = stream.id(), "stream events finished");
                break;
            }
        }
    }
}
