//! Inbound frame pump.

use skein_core::{FrameSource, SkeinError};
use skein_session::Session;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Feeds frames from a transport into a session
///
/// Runs until the source reaches end of stream, the source fails, a frame
/// is connection-fatal, or the session closes. End of stream closes the
/// session as disconnected; a source error closes it as failed.
pub struct Dispatcher<R> {
    session: Session,
    source: R,
    frames: u64,
}

impl<R: FrameSource> Dispatcher<R> {
    pub fn new(session: Session, source: R) -> Self {
        Self {
            session,
            source,
            frames: 0,
        }
    }

    /// Frames delivered so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Pump frames until the session or the transport ends; returns the
    /// number of frames delivered
    pub async fn run(mut self) -> Result<u64, SkeinError> {
        let session = self.session.clone();
        loop {
            let next = tokio::select! {
                biased;
                _ = session.closed() => {
                    debug!("Session closed after {} inbound frames", self.frames);
                    return Ok(self.frames);
                }
                next = self.source.recv() => next,
            };

            match next {
                Ok(Some(frame)) => match self.session.on_frame(frame) {
                    Ok(()) => self.frames += 1,
                    Err(SkeinError::SessionClosed) => return Ok(self.frames),
                    Err(err) => return Err(err),
                },
                Ok(None) => {
                    debug!("Transport ended after {} inbound frames", self.frames);
                    self.session.disconnected();
                    return Ok(self.frames);
                }
                Err(err) => {
                    warn!("Transport read failed: {}", err);
                    self.session.fail(err.clone());
                    return Err(err);
                }
            }
        }
    }

    /// Run on the current tokio runtime
    pub fn spawn(self) -> JoinHandle<Result<u64, SkeinError>> {
        tokio::spawn(self.run())
    }
}
