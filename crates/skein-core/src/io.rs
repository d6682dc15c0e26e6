//! Transport seams: where decoded frames enter and leave the engine.

use crate::error::SkeinError;
use crate::frame::Frame;
use async_trait::async_trait;

/// Ordered outbound frame sink
///
/// A session owns exactly one writer that calls [`FrameSink::send`]
/// sequentially, so at most one write is in flight at any time. Any error
/// is treated as connection-fatal.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Serialize and transmit one frame
    async fn send(&mut self, frame: Frame) -> Result<(), SkeinError>;

    /// Flush and release the transport
    async fn close(&mut self) -> Result<(), SkeinError> {
        Ok(())
    }
}

/// Ordered inbound frame source
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next decoded frame; `Ok(None)` on orderly end of stream
    async fn recv(&mut self) -> Result<Option<Frame>, SkeinError>;
}

#[async_trait]
impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
    async fn send(&mut self, frame: Frame) -> Result<(), SkeinError> {
        (**self).send(frame).await
    }

    async fn close(&mut self) -> Result<(), SkeinError> {
        (**self).close().await
    }
}

#[async_trait]
impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    async fn recv(&mut self) -> Result<Option<Frame>, SkeinError> {
        (**self).recv().await
    }
}
