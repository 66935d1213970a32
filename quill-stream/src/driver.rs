//! Drivers: who runs the consumer, and when.
//!
//! The stream does not own a scheduling policy. It signals
//! [`Driver::work_available`] after every enqueue and exposes
//! [`run_once`](crate::AsyncStream::run_once); everything else, polling
//! timers, parked threads, event loops, is the driver's business.
//!
//! Three drivers ship with the crate:
//!
//! - [`IdleDriver`]: no background thread at all. Work drains when the
//!   caller flushes, or at the latest in the stream's `Drop`. Deterministic;
//!   the right choice for tests.
//! - [`PollingDriver`]: a background thread that wakes on a fixed period.
//!   Enqueue notifications are suppressed, so the producer pays nothing
//!   beyond the insert itself: the lowest enqueue latency.
//! - [`WaitingDriver`]: a background thread that parks until notified.
//!   The notification is conditional: an atomic load in the common case, a
//!   wake syscall only when the worker has actually gone to sleep: the
//!   lowest idle cost.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_utils::sync::{Parker, Unparker};
use crossbeam_utils::CachePadded;

use crate::AsyncStream;

/// Scheduler of the consumer side of one or more streams.
pub trait Driver: Send + Sync {
    /// Called by a stream immediately after every successful enqueue.
    ///
    /// Implementations may treat this as a no-op (polling drivers do); it
    /// must be cheap, because it runs on the producer's hot path.
    fn work_available(&self);

    /// Registers a stream for background pumping.
    ///
    /// Drivers that do not pump streams themselves keep the default no-op.
    /// Drivers hold only weak references; a dropped stream unregisters
    /// itself by failing to upgrade.
    fn attach(&self, stream: Weak<AsyncStream>) {
        let _ = stream;
    }
}

/// A driver that does nothing.
///
/// All draining happens on the foreground thread: explicit
/// [`flush`](crate::AsyncStream::flush)/[`try_drain`](crate::AsyncStream::try_drain)
/// calls, or the blocking drain in the stream's `Drop`. Deterministic, which
/// makes it the driver of choice for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleDriver;

impl Driver for IdleDriver {
    fn work_available(&self) {}
}

/// State shared between a background driver handle and its worker thread.
struct Core {
    streams: Mutex<Vec<Weak<AsyncStream>>>,
    /// True while the worker is (about to be) parked. Padded so the
    /// producer-side load in `work_available` never false-shares with the
    /// flags below.
    parked: CachePadded<AtomicBool>,
    shutdown: AtomicBool,
    stopped: AtomicBool,
    unparker: Unparker,
}

impl Core {
    fn new(unparker: Unparker) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(Vec::new()),
            parked: CachePadded::new(AtomicBool::new(false)),
            shutdown: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            unparker,
        })
    }

    fn lock_streams(&self) -> MutexGuard<'_, Vec<Weak<AsyncStream>>> {
        match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Drains every attached stream once, pruning the dead ones.
    /// Returns `true` if any stream had work.
    fn run_all(&self) -> bool {
        let mut streams = self.lock_streams();
        let mut any = false;
        streams.retain(|weak| match weak.upgrade() {
            Some(stream) => {
                if stream.run_once() {
                    any = true;
                }
                true
            }
            None => false,
        });
        any
    }

    fn attach(&self, stream: Weak<AsyncStream>) {
        self.lock_streams().push(stream);
    }

    fn request_stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.unparker.unpark();
    }
}

fn join_worker(handle: &Mutex<Option<JoinHandle<()>>>) {
    let taken = match handle.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(handle) = taken {
        if handle.join().is_err() {
            tracing::error!(target: "quill", "driver thread panicked");
        }
    }
}

/// Background thread waking on a fixed period.
///
/// Enqueue notifications are suppressed: the worker finds new work on its
/// next tick regardless, so producers pay nothing past the insert. Latency
/// from enqueue to sink is bounded by the polling period.
pub struct PollingDriver {
    core: Arc<Core>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PollingDriver {
    /// Spawns the worker with the default 10 ms polling period.
    pub fn new() -> Self {
        Self::with_period(Duration::from_millis(10))
    }

    /// Spawns the worker with the given polling period.
    pub fn with_period(period: Duration) -> Self {
        let parker = Parker::new();
        let core = Core::new(parker.unparker().clone());
        let worker = Arc::clone(&core);

        let handle = std::thread::spawn(move || {
            tracing::debug!(target: "quill", ?period, "polling driver started");
            while !worker.shutdown.load(Ordering::SeqCst) {
                if !worker.run_all() {
                    worker.parked.store(true, Ordering::SeqCst);
                    if !worker.shutdown.load(Ordering::SeqCst) {
                        parker.park_timeout(period);
                    }
                    worker.parked.store(false, Ordering::SeqCst);
                }
            }
            // Stop may arrive with work still queued; finish it.
            worker.run_all();
            worker.stopped.store(true, Ordering::SeqCst);
            tracing::debug!(target: "quill", "polling driver stopped");
        });

        Self {
            core,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Asks the worker to finish its current pass and exit.
    pub fn stop(&self) {
        self.core.request_stop();
    }

    /// Blocks until the worker thread has exited. Idempotent.
    pub fn join(&self) {
        join_worker(&self.handle);
    }

    /// Returns `true` once the worker has fully exited.
    pub fn stopped(&self) -> bool {
        self.core.stopped.load(Ordering::SeqCst)
    }
}

impl Driver for PollingDriver {
    fn work_available(&self) {
        // Suppressed: the polling tick will find the work.
    }

    fn attach(&self, stream: Weak<AsyncStream>) {
        self.core.attach(stream);
    }
}

impl Default for PollingDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PollingDriver {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

impl fmt::Debug for PollingDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingDriver")
            .field("stopped", &self.stopped())
            .finish_non_exhaustive()
    }
}

/// Background thread parking until notified.
///
/// The wake protocol is the conditional-unpark pattern: the worker sets its
/// parked flag, re-checks for work, and only then parks; the producer side
/// loads the flag and issues the unpark syscall only when it reads true.
/// The `SeqCst` pairing prevents the missed-wakeup race where the worker
/// parks just after the producer's check.
pub struct WaitingDriver {
    core: Arc<Core>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WaitingDriver {
    /// Spawns the worker.
    pub fn new() -> Self {
        let parker = Parker::new();
        let core = Core::new(parker.unparker().clone());
        let worker = Arc::clone(&core);

        let handle = std::thread::spawn(move || {
            tracing::debug!(target: "quill", "waiting driver started");
            while !worker.shutdown.load(Ordering::SeqCst) {
                if !worker.run_all() {
                    worker.parked.store(true, Ordering::SeqCst);
                    // Check again after signaling; a producer that missed
                    // the flag has enqueued before our store became
                    // visible, and we would sleep on its work.
                    if !worker.run_all() && !worker.shutdown.load(Ordering::SeqCst) {
                        parker.park();
                    }
                    worker.parked.store(false, Ordering::SeqCst);
                }
            }
            worker.run_all();
            worker.stopped.store(true, Ordering::SeqCst);
            tracing::debug!(target: "quill", "waiting driver stopped");
        });

        Self {
            core,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Asks the worker to finish its current pass and exit.
    pub fn stop(&self) {
        self.core.request_stop();
    }

    /// Blocks until the worker thread has exited. Idempotent.
    pub fn join(&self) {
        join_worker(&self.handle);
    }

    /// Returns `true` once the worker has fully exited.
    pub fn stopped(&self) -> bool {
        self.core.stopped.load(Ordering::SeqCst)
    }
}

impl Driver for WaitingDriver {
    fn work_available(&self) {
        if self.core.parked.load(Ordering::SeqCst) {
            self.core.unparker.unpark();
        }
    }

    fn attach(&self, stream: Weak<AsyncStream>) {
        self.core.attach(stream);
        // The worker may already be parked with this stream's work queued.
        self.work_available();
    }
}

impl Default for WaitingDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaitingDriver {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

impl fmt::Debug for WaitingDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitingDriver")
            .field("stopped", &self.stopped())
            .finish_non_exhaustive()
    }
}
