//! Lock-serialized one-shot and repeating timers
//!
//! A [`Timeout`] owns one lightweight tokio task. Each firing acquires the
//! caller supplied [`SessionLock`] (when one is given), runs the callback and
//! releases the lock before the next sleep, so timer callbacks interleave
//! safely with network input and application calls touching the same call leg.
//!
//! Cancellation is best-effort: a firing that already passed its sleep may
//! still run. Callbacks that must not act late should hold weak references and
//! re-check their owner's state.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{error, trace};

use crate::sync::SessionLock;

type TimeoutCallback = Box<dyn FnMut() + Send + 'static>;

/// Timer handle. Cloning yields another handle to the same timer.
#[derive(Clone)]
pub struct Timeout {
    inner: Arc<TimeoutInner>,
}

struct TimeoutInner {
    callback: Mutex<Option<TimeoutCallback>>,
    interval: Duration,
    /// Number of firings, negative for unlimited
    nticks: i64,
    /// Fractional jitter applied to every interval
    spread: f64,
    lock: Option<SessionLock>,
    started: AtomicBool,
    cancelled: AtomicBool,
    cancel_notify: Notify,
}

impl TimeoutInner {
    fn next_delay(&self) -> Duration {
        if self.spread <= 0.0 {
            return self.interval;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.spread..=self.spread);
        self.interval.mul_f64(factor.max(0.0))
    }
}

impl Timeout {
    /// Create a timer that fires `nticks` times (forever when negative) every
    /// `interval`. Nothing happens until [`Timeout::start`].
    pub fn new<F>(callback: F, interval: Duration, nticks: i64, lock: Option<SessionLock>) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::with_spread(callback, interval, nticks, lock, 0.0)
    }

    /// Like [`Timeout::new`] with every interval jittered by up to `±spread`
    /// (a fraction of the interval)
    pub fn with_spread<F>(
        callback: F,
        interval: Duration,
        nticks: i64,
        lock: Option<SessionLock>,
        spread: f64,
    ) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Timeout {
            inner: Arc::new(TimeoutInner {
                callback: Mutex::new(Some(Box::new(callback))),
                interval,
                nticks,
                spread: spread.abs(),
                lock,
                started: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                cancel_notify: Notify::new(),
            }),
        }
    }

    /// Create and immediately start a timer
    pub fn start_new<F>(callback: F, lock: Option<SessionLock>, interval: Duration, nticks: i64) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let timeout = Self::new(callback, interval, nticks, lock);
        timeout.start();
        timeout
    }

    /// Arm the timer. Calling it again, or after [`Timeout::cancel`], is a no-op.
    pub fn start(&self) {
        if self.inner.nticks == 0 || self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(mut callback) = self.inner.callback.lock().take() else {
            return;
        };
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!("Cannot start timer outside of a tokio runtime: {}", e);
                return;
            }
        };

        let inner = self.inner.clone();
        handle.spawn(async move {
            let mut remaining = inner.nticks;
            loop {
                let delay = inner.next_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = inner.cancel_notify.notified() => break,
                }
                if inner.cancelled.load(Ordering::Acquire) {
                    break;
                }
                match &inner.lock {
                    Some(lock) => {
                        let _guard = lock.lock();
                        callback();
                    }
                    None => callback(),
                }
                if remaining > 0 {
                    remaining -= 1;
                    if remaining == 0 {
                        break;
                    }
                }
            }
            trace!("timer task finished");
        });
    }

    /// Stop future firings
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.callback.lock().take();
        self.inner.cancel_notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("interval", &self.inner.interval)
            .field("nticks", &self.inner.nticks)
            .field("started", &self.inner.started.load(Ordering::Relaxed))
            .field("cancelled", &self.inner.cancelled.load(Ordering::Relaxed))
            .finish()
    }
}
