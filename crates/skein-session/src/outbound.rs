//! Outbound frame queue.
//!
//! Control frames (SETTINGS, PING acks, WINDOW_UPDATE, RST_STREAM, GOAWAY
//! and the HEADERS that open local streams) go out first, in order. Stream
//! frames wait in per-stream FIFOs; streams with pending frames take turns
//! round-robin, and a DATA frame is only picked once both the stream and
//! the session send windows cover its full length. When they cover only
//! part of it, the covered prefix is split off and sent first.

use crate::stream::{Completer, StreamCore};
use skein_core::{DataFrame, FlowControlWindow, Frame, SkeinError, StreamId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// One frame waiting for the writer
pub(crate) struct WriteItem {
    pub(crate) frame: Frame,
    pub(crate) stream: Option<Arc<StreamCore>>,
    pub(crate) done: Option<Completer>,
}

impl WriteItem {
    pub(crate) fn control(frame: impl Into<Frame>) -> Self {
        Self {
            frame: frame.into(),
            stream: None,
            done: None,
        }
    }

    pub(crate) fn complete(self, result: Result<(), SkeinError>) {
        if let Some(done) = self.done {
            let _ = done.send(result);
        }
    }
}

struct StreamQueue {
    core: Arc<StreamCore>,
    items: VecDeque<WriteItem>,
}

impl StreamQueue {
    /// Whether the head frame can be written now.
    ///
    /// Head DATA larger than the credit both windows share is split and the
    /// credited prefix goes first.
    fn head_fits(&mut self, session_window: &FlowControlWindow) -> bool {
        let Some(head) = self.items.front_mut() else {
            return false;
        };
        let Frame::Data(data) = &mut head.frame else {
            return true;
        };
        let len = data.flow_controlled_len() as i64;
        let credit = self
            .core
            .send_window
            .available()
            .min(session_window.available());
        if len == 0 || credit >= len {
            return true;
        }
        if credit <= 0 || credit as usize >= data.data.len() {
            return false;
        }

        let prefix = data.data.split_to(credit as usize);
        let item = WriteItem {
            frame: DataFrame::new(self.core.id, prefix, false).into(),
            stream: Some(self.core.clone()),
            done: None,
        };
        self.items.push_front(item);
        true
    }
}

/// Writer-side queues; guarded by the session state lock
#[derive(Default)]
pub(crate) struct OutboundQueue {
    control: VecDeque<WriteItem>,
    streams: HashMap<StreamId, StreamQueue>,
    /// Streams with queued frames, in turn order.
    ready: VecDeque<StreamId>,
}

impl OutboundQueue {
    pub(crate) fn push_control(&mut self, item: WriteItem) {
        self.control.push_back(item);
    }

    pub(crate) fn pop_control(&mut self) -> Option<WriteItem> {
        self.control.pop_front()
    }

    /// Append frames to a stream's FIFO
    pub(crate) fn push_stream(&mut self, core: &Arc<StreamCore>, items: Vec<WriteItem>) {
        if items.is_empty() {
            return;
        }
        let id = core.id;
        let queue = self.streams.entry(id).or_insert_with(|| StreamQueue {
            core: core.clone(),
            items: VecDeque::new(),
        });
        if queue.items.is_empty() {
            self.ready.push_back(id);
        }
        queue.items.extend(items);
    }

    /// Take the next stream frame that can be written now.
    ///
    /// Consumes stream and session send credit for DATA. Returns `None` if
    /// nothing is queued or every head-of-line DATA frame is out of credit.
    pub(crate) fn pop_stream(&mut self, session_window: &FlowControlWindow) -> Option<WriteItem> {
        for _ in 0..self.ready.len() {
            let id = self.ready.pop_front()?;
            let Some(queue) = self.streams.get_mut(&id) else {
                continue;
            };
            if !queue.head_fits(session_window) {
                self.ready.push_back(id);
                continue;
            }

            let item = queue.items.pop_front()?;
            if let Frame::Data(data) = &item.frame {
                let len = data.flow_controlled_len();
                queue.core.send_window.consume(len);
                session_window.consume(len);
            }
            if queue.items.is_empty() {
                self.streams.remove(&id);
            } else {
                self.ready.push_back(id);
            }
            return Some(item);
        }
        None
    }

    /// Drop a stream's queued frames
    pub(crate) fn remove_stream(&mut self, id: StreamId) -> Vec<WriteItem> {
        self.ready.retain(|queued| *queued != id);
        self.streams
            .remove(&id)
            .map(|queue| queue.items.into())
            .unwrap_or_default()
    }

    /// Drop every stream's queued frames, including HEADERS that would open
    /// a stream; connection-level control frames stay queued
    pub(crate) fn clear_streams(&mut self) -> Vec<WriteItem> {
        self.ready.clear();
        let mut dropped: Vec<WriteItem> = self
            .streams
            .drain()
            .flat_map(|(_, queue)| queue.items)
            .collect();
        let (keep, opening): (VecDeque<_>, VecDeque<_>) = self
            .control
            .drain(..)
            .partition(|item| item.stream.is_none());
        self.control = keep;
        dropped.extend(opening);
        dropped
    }

    /// Drop everything
    pub(crate) fn clear(&mut self) -> Vec<WriteItem> {
        let mut dropped = self.clear_streams();
        dropped.extend(self.control.drain(..));
        dropped
    }

    /// Number of stream frames waiting
    pub(crate) fn queued_frames(&self) -> usize {
        self.streams.values().map(|queue| queue.items.len()).sum()
    }
}
