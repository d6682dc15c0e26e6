//! Byte-credit flow control windows.
//!
//! A window counts how many bytes may still be sent before the receiver
//! acknowledges capacity. Sessions and streams each own one window per
//! direction; an outbound DATA frame needs credit in both the stream and the
//! connection send window.
//!
//! Windows are pure arithmetic. Deciding what to do when credit runs out
//! (queue, split, reset) belongs to the session.

use crate::error::SkeinError;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

/// Largest value a window may hold (2^31 - 1)
pub const MAX_WINDOW_SIZE: i64 = 0x7fff_ffff;

/// Initial window size before any SETTINGS are exchanged
pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;

/// Default fraction of a receive window consumed before credit is returned
pub const DEFAULT_WINDOW_UPDATE_RATIO: f32 = 0.5;

/// Signed credit counter
///
/// `available` may legally go negative: a peer can shrink the initial window
/// while data is already in flight, leaving the sender in debt until enough
/// credit is returned. Only increments are bounded.
///
/// Clones share the same counter.
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    available: Arc<AtomicI64>,
}

impl FlowControlWindow {
    /// Create a window holding `initial` bytes of credit
    pub fn new(initial: u32) -> Self {
        Self {
            available: Arc::new(AtomicI64::new(initial as i64)),
        }
    }

    /// Create a window with the default initial size
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }

    /// Current credit, possibly negative
    pub fn available(&self) -> i64 {
        self.available.load(Ordering::Acquire)
    }

    /// Take `n` bytes of credit.
    ///
    /// Never fails and never blocks; the window may go negative. Returns the
    /// new value.
    pub fn consume(&self, n: u32) -> i64 {
        self.available.fetch_sub(n as i64, Ordering::AcqRel) - n as i64
    }

    /// Return `n` bytes of credit.
    ///
    /// Fails with [`SkeinError::WindowOverflow`] if the result would exceed
    /// [`MAX_WINDOW_SIZE`]; the window is left untouched in that case.
    pub fn credit(&self, n: u32) -> Result<i64, SkeinError> {
        let mut current = self.available.load(Ordering::Acquire);
        loop {
            let next = current + n as i64;
            if next > MAX_WINDOW_SIZE {
                return Err(SkeinError::WindowOverflow {
                    available: current,
                    increment: n,
                    max: MAX_WINDOW_SIZE,
                });
            }
            match self.available.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(next),
                Err(actual) => current = actual,
            }
        }
    }

    /// Apply a change of the negotiated window size.
    ///
    /// Shifts `available` by `new_max - old_max`; shrinking may drive the
    /// window negative without error. Returns the new value.
    pub fn resize(&self, old_max: u32, new_max: u32) -> i64 {
        let delta = new_max as i64 - old_max as i64;
        self.available.fetch_add(delta, Ordering::AcqRel) + delta
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Receive-side bookkeeping for returning credit in batches
///
/// Bytes consumed by the application accumulate here; once they reach the
/// threshold the whole batch is handed back so the caller can credit its
/// receive window and emit a single WINDOW_UPDATE.
#[derive(Debug)]
pub struct CreditAccumulator {
    pending: AtomicU32,
    threshold: u32,
}

impl CreditAccumulator {
    /// Create an accumulator that releases after `ratio` of `window_size`
    pub fn new(window_size: u32, ratio: f32) -> Self {
        let threshold = ((window_size as f64) * ratio as f64) as u32;
        Self {
            pending: AtomicU32::new(0),
            threshold: threshold.max(1),
        }
    }

    /// Record `n` consumed bytes.
    ///
    /// Returns the batch to credit back once the threshold is reached.
    pub fn consumed(&self, n: u32) -> Option<u32> {
        if n == 0 {
            return None;
        }
        let mut current = self.pending.load(Ordering::Acquire);
        loop {
            let total = current.saturating_add(n);
            let next = if total >= self.threshold { 0 } else { total };
            match self.pending.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return (next == 0).then_some(total),
                Err(actual) => current = actual,
            }
        }
    }

    /// Bytes consumed but not yet released
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}
