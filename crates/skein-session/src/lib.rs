//! Session engine for skein.
//!
//! A [`Session`] multiplexes many [`Stream`]s over one ordered connection:
//! it dispatches inbound frames, enforces per-stream and per-connection
//! flow control, runs idle timeouts, and serializes outbound frames through
//! a single writer.

mod events;
mod listener;
mod outbound;
mod session;
mod stream;

#[cfg(test)]
mod testing;

pub use listener::{NoopSessionListener, NoopStreamListener, SessionListener, StreamListener};
pub use session::{CloseState, Role, Session, SessionBuilder};
pub use stream::{Completion, Stream, StreamState};
