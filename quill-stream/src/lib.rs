//! Asynchronous formatted-output stream.
//!
//! An [`AsyncStream`] lets a latency-sensitive thread hand off output work
//! (formatted writes, raw bytes, manipulators, input parses, completion
//! callbacks) in near-constant time, while a background worker applies the
//! work against a synchronous byte sink ([`std::io::Write`]) and/or source
//! ([`std::io::BufRead`]).
//!
//! Under the hood sits a two-page disruptor ([`quill_queue`]) carrying
//! bump-allocated pages of type-erased work items ([`quill_arena`]): a
//! submission is a spinlock acquire, a placement construction into an
//! already-allocated page, and a spinlock release. No heap allocation, no
//! syscall, no waiting on the sink.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use quill_stream::{AsyncStream, IdleDriver};
//!
//! let stream = AsyncStream::writer(Vec::<u8>::new(), Arc::new(IdleDriver));
//!
//! stream.submit_bytes(b"answer: ");
//! stream.submit_formatted(42);
//! stream.submit_bytes(b"\n");
//! assert!(!stream.is_empty());
//!
//! // With IdleDriver, draining is explicit and runs on this thread.
//! stream.flush();
//! assert!(stream.is_empty());
//! ```
//!
//! With a background driver, submissions drain on the driver's thread:
//!
//! ```no_run
//! use std::sync::Arc;
//! use quill_stream::{AsyncStream, WaitingDriver};
//!
//! let driver = Arc::new(WaitingDriver::new());
//! let stream = AsyncStream::writer(std::io::stdout(), driver);
//! stream.submit_formatted("hello from the background\n");
//! // The stream drains fully before its drop returns.
//! ```
//!
//! # Ordering and delivery
//!
//! Items submitted by one thread reach the sink in submission order; items
//! from concurrent submitters are ordered by their producer-lock
//! acquisition. Each item is applied exactly once. A failing item does not
//! stop the stream: the failure goes to the stream's [`ErrorPolicy`] and
//! draining continues with the next item.
//!
//! At most one thread should drain a given stream at a time (one driver, or
//! one foreground flusher). Extra drainers are safe but bounce off; see the
//! [`quill_queue`] docs.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, missing_debug_implementations)]

use std::fmt::{self, Display};
use std::io::{self, BufRead, Write};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_utils::Backoff;
use quill_arena::WorkPage;
use quill_queue::{TryConsume, TwoPageQueue};

mod driver;
mod work;

pub use driver::{Driver, IdleDriver, PollingDriver, WaitingDriver};
pub use quill_arena::{ApplyError, ErrorPolicy, IgnorePolicy, LogPolicy, Role, Work};
pub use quill_queue::QueueStats;

/// Asynchronous formatted-output stream over a two-page disruptor.
///
/// Create one through [`writer`](Self::writer) / [`reader`](Self::reader) /
/// [`duplex`](Self::duplex) or the [`builder`](Self::builder); all of them
/// return an [`Arc`] and register the stream with its driver.
///
/// Dropping the last handle blocks until every queued item has been applied
/// and the sink flushed; queued work is never lost.
pub struct AsyncStream {
    queue: TwoPageQueue<WorkPage>,
    /// The mutexes below see contention only on the flush-vs-drain edge;
    /// the drain path takes them while already holding the consumer role.
    sink: Option<Mutex<Box<dyn Write + Send>>>,
    source: Option<Mutex<Box<dyn BufRead + Send>>>,
    driver: Arc<dyn Driver>,
    policy: Arc<dyn ErrorPolicy>,
}

impl AsyncStream {
    /// Starts building a stream.
    pub fn builder() -> StreamBuilder {
        StreamBuilder::default()
    }

    /// Creates an output-only stream.
    pub fn writer(sink: impl Write + Send + 'static, driver: Arc<dyn Driver>) -> Arc<Self> {
        Self::builder().sink(sink).driver(driver).build()
    }

    /// Creates an input-only stream.
    pub fn reader(source: impl BufRead + Send + 'static, driver: Arc<dyn Driver>) -> Arc<Self> {
        Self::builder().source(source).driver(driver).build()
    }

    /// Creates a stream with both a sink and a source.
    pub fn duplex(
        sink: impl Write + Send + 'static,
        source: impl BufRead + Send + 'static,
        driver: Arc<dyn Driver>,
    ) -> Arc<Self> {
        Self::builder().sink(sink).source(source).driver(driver).build()
    }

    // === Submission surface (producer side) ===

    /// Enqueues a formatted write of `value`.
    ///
    /// The value is copied into the work page; formatting itself runs on
    /// the consumer thread.
    pub fn submit_formatted<T: Display + Send + 'static>(&self, value: T) {
        {
            let mut txn = self.queue.begin_insert();
            txn.page_mut().push(work::FmtValue(value));
        }
        self.driver.work_available();
    }

    /// Enqueues a raw byte write. The bytes are copied.
    pub fn submit_bytes(&self, bytes: &[u8]) {
        {
            let mut txn = self.queue.begin_insert();
            let page = txn.page_mut();
            let item = page.push(work::RawBytes {
                ptr: ptr::null(),
                len: bytes.len(),
            });
            if !bytes.is_empty() {
                let dst = page.alloc(bytes.len());
                // Safety: `dst` is a fresh in-page region of `bytes.len()`
                // bytes; `item` was just pushed into the same page and
                // nothing else aliases it yet.
                unsafe {
                    ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len());
                    (*item.as_ptr()).ptr = dst.as_ptr();
                }
            }
        }
        self.driver.work_available();
    }

    /// Enqueues an arbitrary one-shot operation against the sink.
    pub fn submit_manipulator<F>(&self, f: F)
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()> + Send + 'static,
    {
        {
            let mut txn = self.queue.begin_insert();
            txn.page_mut().push(work::Manipulator(Some(f)));
        }
        self.driver.work_available();
    }

    /// Enqueues an input parse.
    ///
    /// `parser` runs against the source on the consumer thread and returns
    /// the number of bytes it consumed; the outcome (count or error,
    /// including "stream has no source") is delivered to `completion`.
    /// Parse failures go to the completion, not to the error policy.
    pub fn submit_reader<P, C>(&self, parser: P, completion: C)
    where
        P: FnOnce(&mut dyn BufRead) -> io::Result<u64> + Send + 'static,
        C: FnOnce(io::Result<u64>) + Send + 'static,
    {
        {
            let mut txn = self.queue.begin_insert();
            txn.page_mut().push(work::ReadParse {
                parser: Some(parser),
                completion: Some(completion),
            });
        }
        self.driver.work_available();
    }

    /// Enqueues a neutral callback, fired after every previously submitted
    /// item of this stream has been applied.
    pub fn submit_callback<F: FnOnce() + Send + 'static>(&self, f: F) {
        {
            let mut txn = self.queue.begin_insert();
            txn.page_mut().push(work::Callback(Some(f)));
        }
        self.driver.work_available();
    }

    /// Pre-pays the cost of the first submission (page reset and cache
    /// warm-up), so a cold `submit_*` call takes less time. Idempotent.
    pub fn warmup(&self) {
        self.queue.warmup();
    }

    // === Drain surface (consumer side) ===

    /// Driver entry point: one drain pass, flushing the sink if anything
    /// was applied. Returns `true` iff at least one page was drained.
    pub fn run_once(&self) -> bool {
        let drained = self.try_drain();
        if drained {
            self.flush_sink();
        }
        drained
    }

    /// Drains whatever is currently consumable, on the caller's thread,
    /// without flushing. Never blocks; returns `true` iff at least one page
    /// was drained.
    pub fn try_drain(&self) -> bool {
        let mut drained = false;
        loop {
            match self.queue.try_consume() {
                TryConsume::Consumed(mut txn) => {
                    self.drain_page(txn.page_mut());
                    drained = true;
                }
                TryConsume::QueueNotEmpty
                | TryConsume::TooManyConsumers
                | TryConsume::NoMoreWork => break,
            }
        }
        drained
    }

    /// Drains on the caller's thread and flushes the sink.
    pub fn flush(&self) {
        self.try_drain();
        self.flush_sink();
    }

    /// Blocks until every submitted item has been applied, then flushes.
    ///
    /// Spins (with backoff) through transient states: a producer
    /// mid-insert, another drainer holding the consumer role. With a
    /// producer submitting forever this never returns; it is meant for
    /// teardown and checkpoints.
    pub fn drain_until_empty(&self) {
        let backoff = Backoff::new();
        let mut drained_any = false;
        loop {
            match self.queue.try_consume() {
                TryConsume::Consumed(mut txn) => {
                    self.drain_page(txn.page_mut());
                    drained_any = true;
                }
                TryConsume::QueueNotEmpty | TryConsume::TooManyConsumers => backoff.snooze(),
                TryConsume::NoMoreWork => {
                    if self.queue.is_empty() {
                        break;
                    }
                    backoff.snooze();
                }
            }
        }
        if drained_any {
            self.flush_sink();
        }
    }

    // === Introspection ===

    /// Returns `true` if every submitted item has been applied.
    /// Dirty read; exact only without concurrent submitters.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Lower-bound estimate of items submitted but not yet applied.
    pub fn len(&self) -> u64 {
        self.queue.len()
    }

    /// Dirty-read snapshot of the underlying channel's counters.
    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    // === Internals ===

    fn drain_page(&self, page: &mut WorkPage) {
        let mut sink = self.sink.as_ref().map(lock_ignore_poison);
        let mut source = self.source.as_ref().map(lock_ignore_poison);
        let sink_ref: Option<&mut dyn Write> = match sink.as_mut() {
            Some(guard) => Some(&mut ***guard),
            None => None,
        };
        let source_ref: Option<&mut dyn BufRead> = match source.as_mut() {
            Some(guard) => Some(&mut ***guard),
            None => None,
        };
        page.drain(sink_ref, source_ref, &*self.policy);
    }

    fn flush_sink(&self) {
        if let Some(sink) = &self.sink {
            if let Err(err) = lock_ignore_poison(sink).flush() {
                self.policy.on_io_error(err);
            }
        }
    }
}

impl Drop for AsyncStream {
    fn drop(&mut self) {
        // Blocks until the queue is empty: queued work must reach the sink
        // before the stream goes away. The driver only holds a weak
        // reference, so no new background drain can start underneath us.
        self.drain_until_empty();
    }
}

impl fmt::Debug for AsyncStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncStream")
            .field("pending", &self.len())
            .field("has_sink", &self.sink.is_some())
            .field("has_source", &self.source.is_some())
            .finish_non_exhaustive()
    }
}

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Configures and builds an [`AsyncStream`].
///
/// ```
/// use std::sync::Arc;
/// use quill_stream::{AsyncStream, IgnorePolicy, IdleDriver};
///
/// let stream = AsyncStream::builder()
///     .sink(std::io::sink())
///     .error_policy(Arc::new(IgnorePolicy))
///     .page_size(64 * 1024)
///     .build();
/// stream.submit_bytes(b"discarded");
/// stream.flush();
/// ```
#[derive(Default)]
pub struct StreamBuilder {
    sink: Option<Box<dyn Write + Send>>,
    source: Option<Box<dyn BufRead + Send>>,
    driver: Option<Arc<dyn Driver>>,
    policy: Option<Arc<dyn ErrorPolicy>>,
    page_bytes: Option<usize>,
}

impl StreamBuilder {
    /// Attaches the byte sink writer items apply against.
    pub fn sink(mut self, sink: impl Write + Send + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Attaches the byte source reader items parse from.
    pub fn source(mut self, source: impl BufRead + Send + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Sets the driver. Defaults to [`IdleDriver`].
    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Sets the failure policy. Defaults to [`LogPolicy`].
    pub fn error_policy(mut self, policy: Arc<dyn ErrorPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Sets the initial storage-page size of each work page, in bytes.
    /// Defaults to 4 KiB.
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_bytes = Some(bytes);
        self
    }

    /// Builds the stream and registers it with its driver.
    pub fn build(self) -> Arc<AsyncStream> {
        let page = |bytes: Option<usize>| match bytes {
            Some(bytes) => WorkPage::with_page_size(bytes),
            None => WorkPage::new(),
        };
        let stream = Arc::new(AsyncStream {
            queue: TwoPageQueue::new(page(self.page_bytes), page(self.page_bytes)),
            sink: self.sink.map(Mutex::new),
            source: self.source.map(Mutex::new),
            driver: self.driver.unwrap_or_else(|| Arc::new(IdleDriver)),
            policy: self.policy.unwrap_or_else(|| Arc::new(LogPolicy)),
        });
        stream.driver.attach(Arc::downgrade(&stream));
        stream
    }
}

impl fmt::Debug for StreamBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBuilder")
            .field("has_sink", &self.sink.is_some())
            .field("has_source", &self.source.is_some())
            .field("page_bytes", &self.page_bytes)
            .finish_non_exhaustive()
    }
}
