//! Inactivity detection for sessions and streams.
//!
//! An [`IdleTimeout`] records when its owner last made progress and keeps a
//! single check scheduled on a [`Scheduler`]. A check that runs before the
//! owner has been idle for the full timeout simply re-arms for the
//! remainder; only a check that observes the threshold crossed asks the
//! owner, through its expiry callback, whether to close. A `false` answer
//! re-arms the timer without side effects.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::trace;

/// Boxed future used at the timer and listener seams
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Callback invoked when an idle timeout expires.
///
/// Receives how long the owner has been idle and resolves to `true` if the
/// owner was closed as a result.
pub type ExpiryCallback = Arc<dyn Fn(Duration) -> BoxFuture<bool> + Send + Sync>;

/// Timer facility shared by a session and its streams
pub trait Scheduler: Send + Sync + 'static {
    /// Current time on this scheduler's clock
    fn now(&self) -> Instant;

    /// Run `task` once `delay` has elapsed
    fn schedule(&self, delay: Duration, task: BoxFuture<()>) -> TimerHandle;
}

/// Handle to a scheduled task
///
/// Dropping the handle leaves the task scheduled; call [`TimerHandle::cancel`]
/// to prevent it from running.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerHandle {
    /// Create a handle that runs `cancel` when cancelled
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Create a handle for a task that cannot be cancelled
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    /// Cancel the task if it has not run yet
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// [`Scheduler`] backed by the tokio timer
///
/// Uses `tokio::time`, so a paused test clock drives it deterministically.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Create a scheduler that spawns onto the given runtime
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Create a scheduler for the runtime of the calling task
    ///
    /// Returns `None` outside a tokio runtime.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn schedule(&self, delay: Duration, task: BoxFuture<()>) -> TimerHandle {
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        let abort = join.abort_handle();
        TimerHandle::new(move || abort.abort())
    }
}

/// Reusable inactivity detector
///
/// Clones share the same timer.
#[derive(Clone)]
pub struct IdleTimeout {
    inner: Arc<IdleInner>,
}

struct IdleInner {
    scheduler: Arc<dyn Scheduler>,
    on_expired: ExpiryCallback,
    epoch: Instant,
    /// Nanoseconds since `epoch` of the last observed progress.
    last_activity: AtomicU64,
    state: Mutex<IdleState>,
}

struct IdleState {
    /// Zero disables enforcement.
    timeout: Duration,
    timer: Option<TimerHandle>,
    /// Bumped on every arm/disarm so stale checks become no-ops.
    generation: u64,
    closed: bool,
}

impl IdleTimeout {
    /// Create an idle timeout and arm it if `timeout` is non-zero
    pub fn new<F>(scheduler: Arc<dyn Scheduler>, timeout: Duration, on_expired: F) -> Self
    where
        F: Fn(Duration) -> BoxFuture<bool> + Send + Sync + 'static,
    {
        let epoch = scheduler.now();
        let idle = Self {
            inner: Arc::new(IdleInner {
                scheduler,
                on_expired: Arc::new(on_expired),
                epoch,
                last_activity: AtomicU64::new(0),
                state: Mutex::new(IdleState {
                    timeout: Duration::ZERO,
                    timer: None,
                    generation: 0,
                    closed: false,
                }),
            }),
        };
        idle.set_timeout(timeout);
        idle
    }

    /// Configured timeout; zero when disabled
    pub fn timeout(&self) -> Duration {
        lock(&self.inner.state).timeout
    }

    /// Whether expiry is currently enforced
    pub fn is_enabled(&self) -> bool {
        let state = lock(&self.inner.state);
        !state.closed && !state.timeout.is_zero()
    }

    /// Whether a check is currently scheduled
    pub fn is_armed(&self) -> bool {
        lock(&self.inner.state).timer.is_some()
    }

    /// Record progress; defers expiry by a full timeout
    pub fn notify_activity(&self) {
        self.inner.touch();
    }

    /// Time since the last recorded progress
    pub fn idle_for(&self) -> Duration {
        self.inner.idle_for()
    }

    /// Reconfigure the timeout; `Duration::ZERO` disables enforcement.
    ///
    /// The next check is scheduled relative to the last recorded activity,
    /// not to the time of this call.
    pub fn set_timeout(&self, timeout: Duration) {
        let mut state = lock(&self.inner.state);
        state.timeout = timeout;
        if state.closed {
            return;
        }
        if timeout.is_zero() {
            IdleInner::disarm(&mut state);
            return;
        }
        let delay = timeout.saturating_sub(self.inner.idle_for());
        IdleInner::arm(&self.inner, &mut state, delay);
    }

    /// Permanently stop enforcing; pending checks are cancelled
    pub fn close(&self) {
        let mut state = lock(&self.inner.state);
        state.closed = true;
        IdleInner::disarm(&mut state);
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }
}

impl fmt::Debug for IdleTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("IdleTimeout")
            .field("timeout", &state.timeout)
            .field("armed", &state.timer.is_some())
            .field("closed", &state.closed)
            .finish()
    }
}

impl IdleInner {
    fn touch(&self) {
        let nanos = self
            .scheduler
            .now()
            .saturating_duration_since(self.epoch)
            .as_nanos() as u64;
        self.last_activity.fetch_max(nanos, Ordering::AcqRel);
    }

    fn idle_for(&self) -> Duration {
        let now = self.scheduler.now().saturating_duration_since(self.epoch);
        let last = Duration::from_nanos(self.last_activity.load(Ordering::Acquire));
        now.saturating_sub(last)
    }

    fn arm(inner: &Arc<IdleInner>, state: &mut IdleState, delay: Duration) {
        Self::disarm(state);
        let generation = state.generation;
        let weak = Arc::downgrade(inner);
        let task: BoxFuture<()> = Box::pin(async move {
            if let Some(inner) = weak.upgrade() {
                IdleInner::check(inner, generation).await;
            }
        });
        state.timer = Some(inner.scheduler.schedule(delay, task));
    }

    fn disarm(state: &mut IdleState) {
        state.generation = state.generation.wrapping_add(1);
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
    }

    async fn check(inner: Arc<IdleInner>, generation: u64) {
        {
            let mut state = lock(&inner.state);
            if state.closed || state.generation != generation || state.timeout.is_zero() {
                return;
            }
            // This task is the scheduled check; nothing left to cancel.
            state.timer = None;

            let idle = inner.idle_for();
            if idle < state.timeout {
                let remaining = state.timeout - idle;
                trace!("idle check early by {:?}, re-arming", remaining);
                Self::arm(&inner, &mut state, remaining);
                return;
            }
        }

        let idle = inner.idle_for();
        let closed = (inner.on_expired)(idle).await;

        let mut state = lock(&inner.state);
        if closed || state.closed || state.generation != generation {
            return;
        }
        inner.touch();
        let timeout = state.timeout;
        Self::arm(&inner, &mut state, timeout);
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
