//! In-memory duplex frame transport.

use async_trait::async_trait;
use skein_core::{Frame, FrameSink, FrameSource, SkeinError};
use tokio::sync::mpsc;

/// Sending half of one pipe end
#[derive(Debug)]
pub struct PipeSink {
    tx: Option<mpsc::Sender<Frame>>,
}

/// Receiving half of one pipe end
#[derive(Debug)]
pub struct PipeSource {
    rx: mpsc::Receiver<Frame>,
}

/// Create two connected ends; frames sent on one end's sink arrive at the
/// other end's source in order.
///
/// `capacity` bounds the frames buffered in each direction (minimum 1).
pub fn pipe(capacity: usize) -> ((PipeSink, PipeSource), (PipeSink, PipeSource)) {
    let capacity = capacity.max(1);
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        (PipeSink { tx: Some(a_tx) }, PipeSource { rx: b_rx }),
        (PipeSink { tx: Some(b_tx) }, PipeSource { rx: a_rx }),
    )
}

#[async_trait]
impl FrameSink for PipeSink {
    async fn send(&mut self, frame: Frame) -> Result<(), SkeinError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| SkeinError::Transport("pipe closed".to_string()))?;
        tx.send(frame)
            .await
            .map_err(|_| SkeinError::Transport("pipe peer dropped".to_string()))
    }

    async fn close(&mut self) -> Result<(), SkeinError> {
        self.tx.take();
        Ok(())
    }
}

#[async_trait]
impl FrameSource for PipeSource {
    async fn recv(&mut self) -> Result<Option<Frame>, SkeinError> {
        Ok(self.rx.recv().await)
    }
}
