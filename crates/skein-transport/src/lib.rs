//! Transport plumbing for skein sessions.
//!
//! The engine consumes and produces decoded frames. This crate connects a
//! [`Session`] to a frame transport:
//! - [`Dispatcher`]: reads a [`FrameSource`] into `Session::on_frame`
//! - [`pipe`]: an in-memory duplex frame channel for tests and loopback runs

pub mod dispatcher;
pub mod pipe;

pub use dispatcher::Dispatcher;
pub use pipe::{pipe, PipeSink, PipeSource};

use skein_core::{FrameSink, FrameSource, SkeinError};
use skein_session::{Session, SessionBuilder};
use tokio::task::JoinHandle;

/// Build a session over `sink` and spawn a dispatcher reading `source`
pub fn spawn_session<S, R>(
    builder: SessionBuilder,
    sink: S,
    source: R,
) -> Result<(Session, JoinHandle<Result<u64, SkeinError>>), SkeinError>
where
    S: FrameSink,
    R: FrameSource,
{
    let session = builder.build(sink)?;
    let dispatcher = Dispatcher::new(session.clone(), source).spawn();
    Ok((session, dispatcher))
}
