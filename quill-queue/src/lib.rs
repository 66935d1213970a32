//! Two-page disruptor: a lock-disciplined producer/consumer page-swap channel.
//!
//! A classic LMAX disruptor hands items across a ring of many buffer slots.
//! This channel keeps exactly **two** pages: the producer fills one while the
//! consumer drains the other, and the full hand-off is a swap of two pointers.
//! Each side pays at most one cache-line bounce per hand-off, and the
//! producer's hot path never allocates: it appends into a page that already
//! exists.
//!
//! The channel is generic over [`Page`]: anything that can be reset and can
//! carry a sequence-number tag. `quill-arena` provides the bump-allocated
//! work page used by `quill-stream`; tests here use trivial stub pages.
//!
//! # Who swaps the pages?
//!
//! Whichever side is idle. The consumer normally swaps when it finds its side
//! drained. If the producer is inserting so hard that the consumer keeps
//! finding the producer lock held, the consumer records a complaint and backs
//! off; the producer compares that complaint counter against its own
//! swaps-performed counter on every commit and takes over the swap exactly
//! when there is a gap. The protocol converges in at most one producer commit
//! per outstanding complaint.
//!
//! # Memory layout
//!
//! The shared state is hand-partitioned into four cache lines so that each
//! role dirties only its own line in steady state:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ line 1: producer lock, last_inserted, pages_switched,       │
//! │         seq_gen                 (written by the producer)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │ line 2: consumer lock, last_consumed                        │
//! │                                 (written by the consumer)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │ line 3: producer page ptr, consumer page ptr, last_enqueued │
//! │                                 (written by the swapper)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │ line 4: consumer_couldnt_switch (written rarely, read from  │
//! │                                  the producer commit path)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Ordering guarantees
//!
//! Items inserted by one producer thread are consumed in insertion order.
//! Concurrent producers are serialized by the producer spinlock, so the
//! cross-producer order is the lock-acquisition order. Counters are read with
//! relaxed ordering everywhere; the spinlocks' acquire/release edges are the
//! fences the protocol depends on, and the estimators ([`TwoPageQueue::len`],
//! [`TwoPageQueue::stats`]) are documented as dirty snapshots.
//!
//! At most one consumer thread should drive a given channel. A second
//! consumer is tolerated (it bounces off with
//! [`TryConsume::TooManyConsumers`]), but FIFO observation is only meaningful
//! for a single consumer.
//!
//! # Example
//!
//! ```
//! use quill_queue::{Page, TryConsume, TwoPageQueue};
//!
//! #[derive(Default)]
//! struct TallyPage {
//!     seq: u64,
//!     items: u32,
//! }
//!
//! impl Page for TallyPage {
//!     fn reset(&mut self) {
//!         self.items = 0;
//!     }
//!     fn sequence_number(&self) -> u64 {
//!         self.seq
//!     }
//!     fn set_sequence_number(&mut self, seq: u64) {
//!         self.seq = seq;
//!     }
//! }
//!
//! let queue = TwoPageQueue::new(TallyPage::default(), TallyPage::default());
//!
//! {
//!     let mut txn = queue.begin_insert();
//!     txn.page_mut().items += 1;
//! } // commit on scope exit
//!
//! match queue.try_consume() {
//!     TryConsume::Consumed(mut txn) => assert_eq!(txn.page_mut().items, 1),
//!     other => panic!("expected work, got {other:?}"),
//! }
//! assert!(queue.is_empty());
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, missing_debug_implementations)]

use std::fmt;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering::Relaxed};

use crossbeam_utils::CachePadded;

mod spin;

use spin::SpinLock;

/// A buffer page that can be handed back and forth through a [`TwoPageQueue`].
///
/// The queue itself never looks inside a page; it only resets stale pages on
/// the producer thread and maintains each page's freshness tag. The tag is
/// the sequence number of the newest insert the page has seen, and a page
/// whose tag lags `last_enqueued` holds data the consumer already drained.
pub trait Page {
    /// Discards the page's contents and rearms it for appending.
    ///
    /// Called on the producer thread when a drained page comes back to the
    /// producer side, which keeps the page's storage owned by the CPU that
    /// is about to write it.
    fn reset(&mut self);

    /// Returns the page's freshness tag.
    fn sequence_number(&self) -> u64;

    /// Stores the page's freshness tag.
    fn set_sequence_number(&mut self, seq: u64);
}

/* cache line 1: what the producer writes */
struct ProducerLine {
    lock: SpinLock,
    /// Highest sequence number written into the producer page. Dirty-read by
    /// anyone.
    last_inserted: AtomicU64,
    /// How many swaps the producer has performed on the consumer's behalf.
    /// Producer-private; only touched under the producer lock.
    pages_switched: AtomicU64,
    /// Next sequence number to hand out. Producer-private.
    seq_gen: AtomicU64,
}

/* cache line 2: what the consumer writes */
struct ConsumerLine {
    lock: SpinLock,
    /// Highest sequence number the consumer has drained. Dirty-read by
    /// anyone.
    last_consumed: AtomicU64,
}

/* cache line 3: what whoever swapped last wrote */
struct SwapLine<P> {
    producer_page: AtomicPtr<P>,
    consumer_page: AtomicPtr<P>,
    /// Highest sequence number that has crossed over to the consumer page.
    last_enqueued: AtomicU64,
}

/// The two-page disruptor.
///
/// Owns exactly two [`Page`]s. One is designated producer-side and one
/// consumer-side at any moment; the designation flips under both spinlocks
/// when the pages are swapped. See the crate docs for the protocol.
pub struct TwoPageQueue<P: Page> {
    producer: CachePadded<ProducerLine>,
    consumer: CachePadded<ConsumerLine>,
    swap: CachePadded<SwapLine<P>>,
    /// Count of consume attempts that found the producer lock held. Isolated
    /// on its own line: written rarely, but read on every producer commit.
    complaints: CachePadded<AtomicU64>,
}

// Safety: the pages are only dereferenced under the role spinlocks, every
// swap of the page pointers holds both locks, and all shared counters are
// atomics. `P: Send` because pages cross threads when the roles run on
// different threads.
unsafe impl<P: Page + Send> Send for TwoPageQueue<P> {}
unsafe impl<P: Page + Send> Sync for TwoPageQueue<P> {}

impl<P: Page> TwoPageQueue<P> {
    /// Creates a queue owning the two given pages.
    ///
    /// Sequence numbers start at 1, so the first insert stamps 2. Both pages
    /// are tagged 0, which marks them fresh relative to `last_enqueued`.
    pub fn new(mut page_a: P, mut page_b: P) -> Self {
        page_a.set_sequence_number(0);
        page_b.set_sequence_number(0);

        Self {
            producer: CachePadded::new(ProducerLine {
                lock: SpinLock::new(),
                last_inserted: AtomicU64::new(1),
                pages_switched: AtomicU64::new(0),
                seq_gen: AtomicU64::new(1),
            }),
            consumer: CachePadded::new(ConsumerLine {
                lock: SpinLock::new(),
                last_consumed: AtomicU64::new(1),
            }),
            swap: CachePadded::new(SwapLine {
                producer_page: AtomicPtr::new(Box::into_raw(Box::new(page_a))),
                consumer_page: AtomicPtr::new(Box::into_raw(Box::new(page_b))),
                last_enqueued: AtomicU64::new(1),
            }),
            complaints: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Opens an insert transaction, spinning on the producer lock.
    ///
    /// Concurrent producers serialize here; the wait is bounded by the other
    /// producer's in-flight insert, which is a handful of stores. If the
    /// producer page still holds data the consumer already drained, it is
    /// reset here, on the producer thread, so its storage does not bounce
    /// between CPU caches.
    ///
    /// The returned transaction holds the producer lock until it is
    /// committed or dropped.
    pub fn begin_insert(&self) -> InsertTransaction<'_, P> {
        self.producer.lock.lock();

        let seq = self.producer.seq_gen.load(Relaxed) + 1;
        self.producer.seq_gen.store(seq, Relaxed);

        let page = self.swap.producer_page.load(Relaxed);
        // Safety: the producer lock is held and every page swap takes it,
        // so `page` stays designated producer-side and unaliased until the
        // transaction releases the lock.
        let fresh = unsafe {
            let tag = (*page).sequence_number();
            let enqueued = self.swap.last_enqueued.load(Relaxed);
            if tag < enqueued {
                (*page).reset();
            }
            (*page).set_sequence_number(seq);
            tag <= enqueued
        };

        self.producer.last_inserted.store(seq, Relaxed);

        InsertTransaction {
            queue: self,
            page,
            fresh,
        }
    }

    /// Attempts to claim the consumer page. Never blocks.
    ///
    /// The consumer side of the cooperative swap lives here: when the
    /// consumer page looks drained, this call tries to pull fresh data over
    /// from the producer page. If the producer lock is held mid-insert, a
    /// complaint is recorded instead and the producer swaps on its next
    /// commit.
    pub fn try_consume(&self) -> TryConsume<'_, P> {
        if self.swap.last_enqueued.load(Relaxed) <= self.consumer.last_consumed.load(Relaxed) {
            // Our side looks drained; switching is our job unless blocked.
            if !self.consumer.lock.try_lock() {
                return TryConsume::TooManyConsumers;
            }
            if !self.producer.lock.try_lock() {
                // Producer is mid-insert, so we cannot prove the queue is
                // empty and we cannot swap. Complain; the producer will
                // swap for us on commit.
                self.complaints.fetch_add(1, Relaxed);
                self.consumer.lock.unlock();
                return TryConsume::QueueNotEmpty;
            }

            if self.producer.last_inserted.load(Relaxed) > self.swap.last_enqueued.load(Relaxed) {
                // Safety: both spinlocks are held.
                unsafe { self.switch_pages() };
                self.producer.lock.unlock();
            } else {
                // Nothing waiting on the producer side either.
                self.producer.lock.unlock();
                self.consumer.lock.unlock();
                return TryConsume::NoMoreWork;
            }

            if self.swap.last_enqueued.load(Relaxed) <= self.consumer.last_consumed.load(Relaxed) {
                self.consumer.lock.unlock();
                return TryConsume::NoMoreWork;
            }

            return TryConsume::Consumed(self.bind_consumer());
        }

        if !self.consumer.lock.try_lock() {
            return TryConsume::TooManyConsumers;
        }
        // Re-check under the lock: between the dirty read above and the
        // acquire, another consumer may have drained the page.
        if self.swap.last_enqueued.load(Relaxed) <= self.consumer.last_consumed.load(Relaxed) {
            self.consumer.lock.unlock();
            return TryConsume::NoMoreWork;
        }

        TryConsume::Consumed(self.bind_consumer())
    }

    /// Binds a consume transaction. The consumer lock must be held.
    fn bind_consumer(&self) -> ConsumeTransaction<'_, P> {
        let page = self.swap.consumer_page.load(Relaxed);
        // Safety: the consumer lock is held; the consumer page cannot be
        // swapped away (all swap sites take this lock) or reset (the
        // producer only resets the producer page).
        let tag = unsafe { (*page).sequence_number() };
        self.consumer.last_consumed.store(tag, Relaxed);
        ConsumeTransaction { queue: self, page }
    }

    /// Pre-pays the cost of the first insert.
    ///
    /// If the producer page is stale it is reset and restamped here, so the
    /// next [`begin_insert`](Self::begin_insert) finds a warm, fresh page.
    /// Idempotent.
    pub fn warmup(&self) {
        self.producer.lock.lock();
        let page = self.swap.producer_page.load(Relaxed);
        let enqueued = self.swap.last_enqueued.load(Relaxed);
        // Safety: producer lock held, as in begin_insert.
        unsafe {
            if (*page).sequence_number() < enqueued {
                (*page).reset();
                (*page).set_sequence_number(enqueued);
            }
        }
        self.producer.lock.unlock();
    }

    /// Returns `true` if every inserted item has been consumed.
    ///
    /// Dirty reads; exact only when no transaction is in flight.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.producer.last_inserted.load(Relaxed) == self.consumer.last_consumed.load(Relaxed)
    }

    /// Returns a lower-bound estimate of the number of unconsumed inserts.
    ///
    /// `last_consumed` is loaded before `last_inserted` so the difference
    /// never goes negative; the result may be stale by the time it returns.
    #[inline]
    pub fn len(&self) -> u64 {
        let consumed = self.consumer.last_consumed.load(Relaxed);
        let inserted = self.producer.last_inserted.load(Relaxed);
        inserted.saturating_sub(consumed)
    }

    /// Returns a dirty-read snapshot of the channel's counters.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            last_inserted: self.producer.last_inserted.load(Relaxed),
            last_enqueued: self.swap.last_enqueued.load(Relaxed),
            last_consumed: self.consumer.last_consumed.load(Relaxed),
            consumer_stalls: self.complaints.load(Relaxed),
            producer_swaps: self.producer.pages_switched.load(Relaxed),
        }
    }

    /// Swaps the producer and consumer pages and publishes the new
    /// `last_enqueued`.
    ///
    /// # Safety
    ///
    /// The caller must hold BOTH spinlocks.
    unsafe fn switch_pages(&self) {
        let producer_page = self.swap.producer_page.load(Relaxed);
        let consumer_page = self.swap.consumer_page.load(Relaxed);
        self.swap.producer_page.store(consumer_page, Relaxed);
        self.swap.consumer_page.store(producer_page, Relaxed);

        // Safety: both locks held per the caller's contract; the old
        // producer page is now the consumer page and nobody else can touch
        // it.
        let tag = unsafe { (*producer_page).sequence_number() };
        debug_assert!(
            tag > self.swap.last_enqueued.load(Relaxed),
            "switched to a page that is not newer than the enqueued watermark"
        );
        self.swap.last_enqueued.store(tag, Relaxed);
    }
}

impl<P: Page> Drop for TwoPageQueue<P> {
    fn drop(&mut self) {
        // Safety: `&mut self` is exclusive; these are the two boxes leaked
        // in `new` and nothing else points at them anymore.
        unsafe {
            drop(Box::from_raw(self.swap.producer_page.load(Relaxed)));
            drop(Box::from_raw(self.swap.consumer_page.load(Relaxed)));
        }
    }
}

impl<P: Page> fmt::Debug for TwoPageQueue<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("TwoPageQueue")
            .field("last_inserted", &stats.last_inserted)
            .field("last_enqueued", &stats.last_enqueued)
            .field("last_consumed", &stats.last_consumed)
            .finish_non_exhaustive()
    }
}

/// Producer-side transaction returned by [`TwoPageQueue::begin_insert`].
///
/// Holds the producer spinlock for its entire lifetime; dropping it commits.
/// Every transaction accounts for exactly one inserted item, whether or not
/// anything was actually written into the page.
pub struct InsertTransaction<'a, P: Page> {
    queue: &'a TwoPageQueue<P>,
    page: *mut P,
    fresh: bool,
}

impl<P: Page> InsertTransaction<'_, P> {
    /// Returns `true` if this is the first insert into the page since it
    /// last came back from the consumer side.
    #[inline]
    pub fn fresh_page(&self) -> bool {
        self.fresh
    }

    /// The producer page, exclusively borrowed for the transaction.
    #[inline]
    pub fn page_mut(&mut self) -> &mut P {
        // Safety: the producer lock is held for the transaction's lifetime;
        // the page cannot be swapped, reset, or otherwise aliased until the
        // lock is released in drop.
        unsafe { &mut *self.page }
    }

    /// Commits the transaction (equivalent to dropping it).
    pub fn commit(self) {}
}

impl<P: Page> Drop for InsertTransaction<'_, P> {
    fn drop(&mut self) {
        let q = self.queue;

        // Normally the consumer swaps pages. If it complained that this
        // producer's lock kept it from swapping, take responsibility here:
        // one swap per outstanding complaint, at most one per commit.
        if q.producer.pages_switched.load(Relaxed) != q.complaints.load(Relaxed)
            && q.consumer.lock.try_lock()
        {
            let enqueued = q.swap.last_enqueued.load(Relaxed);
            let consumed = q.consumer.last_consumed.load(Relaxed);
            if enqueued <= consumed {
                // Safety: both spinlocks are held.
                unsafe { q.switch_pages() };
                // Caught up.
                q.producer
                    .pages_switched
                    .store(q.complaints.load(Relaxed), Relaxed);
            }
            q.consumer.lock.unlock();
        }

        q.producer.lock.unlock();
    }
}

impl<P: Page> fmt::Debug for InsertTransaction<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsertTransaction")
            .field("fresh_page", &self.fresh)
            .finish_non_exhaustive()
    }
}

/// Consumer-side transaction carried inside [`TryConsume::Consumed`].
///
/// Holds the consumer spinlock for its entire lifetime; dropping it commits,
/// which also gives the consumer a chance to pull the next page over while
/// it still owns both roles' attention.
pub struct ConsumeTransaction<'a, P: Page> {
    queue: &'a TwoPageQueue<P>,
    page: *mut P,
}

impl<P: Page> ConsumeTransaction<'_, P> {
    /// The consumer page, exclusively borrowed for the transaction.
    #[inline]
    pub fn page_mut(&mut self) -> &mut P {
        // Safety: the consumer lock is held for the transaction's lifetime;
        // all swap sites take this lock and the producer never touches the
        // consumer page, so the borrow is exclusive.
        unsafe { &mut *self.page }
    }

    /// Commits the transaction (equivalent to dropping it).
    pub fn commit(self) {}
}

impl<P: Page> Drop for ConsumeTransaction<'_, P> {
    fn drop(&mut self) {
        let q = self.queue;

        // If the producer side already has newer data and the producer is
        // idle, swap now so the next try_consume starts hot.
        if q.producer.lock.try_lock() {
            if q.producer.last_inserted.load(Relaxed) > q.swap.last_enqueued.load(Relaxed) {
                // Safety: both spinlocks are held.
                unsafe { q.switch_pages() };
            }
            q.producer.lock.unlock();
        }

        q.consumer.lock.unlock();
    }
}

impl<P: Page> fmt::Debug for ConsumeTransaction<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumeTransaction").finish_non_exhaustive()
    }
}

/// Outcome of [`TwoPageQueue::try_consume`].
#[must_use]
pub enum TryConsume<'a, P: Page> {
    /// The consumer page was claimed; drain it through
    /// [`ConsumeTransaction::page_mut`].
    Consumed(ConsumeTransaction<'a, P>),
    /// The producer held its lock mid-insert, so emptiness could not be
    /// proven and no swap was possible. A complaint was recorded; retry
    /// shortly.
    QueueNotEmpty,
    /// Another consumer currently owns the consumer role.
    TooManyConsumers,
    /// Nothing is waiting on either page.
    NoMoreWork,
}

impl<P: Page> TryConsume<'_, P> {
    /// Returns `true` if work was (or may still be) pending.
    pub fn queue_not_empty(&self) -> bool {
        !matches!(self, Self::NoMoreWork)
    }

    /// Returns `true` if a page was claimed.
    pub fn consumed(&self) -> bool {
        matches!(self, Self::Consumed(_))
    }
}

impl<P: Page> fmt::Debug for TryConsume<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Consumed(_) => f.write_str("Consumed"),
            Self::QueueNotEmpty => f.write_str("QueueNotEmpty"),
            Self::TooManyConsumers => f.write_str("TooManyConsumers"),
            Self::NoMoreWork => f.write_str("NoMoreWork"),
        }
    }
}

/// Dirty-read snapshot of a channel's counters.
///
/// Sequence numbers start at 1, so after N fully consumed inserts
/// `last_consumed == N + 1`. At rest,
/// `last_consumed <= last_enqueued <= last_inserted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Highest sequence number written into the producer page.
    pub last_inserted: u64,
    /// Highest sequence number that has crossed to the consumer page.
    pub last_enqueued: u64,
    /// Highest sequence number the consumer has drained.
    pub last_consumed: u64,
    /// Consume attempts that found the producer lock held.
    pub consumer_stalls: u64,
    /// Swaps the producer performed on the consumer's behalf.
    pub producer_swaps: u64,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;

    use super::*;

    #[derive(Default)]
    struct StubPage {
        seq: u64,
        resets: usize,
    }

    impl Page for StubPage {
        fn reset(&mut self) {
            self.resets += 1;
        }
        fn sequence_number(&self) -> u64 {
            self.seq
        }
        fn set_sequence_number(&mut self, seq: u64) {
            self.seq = seq;
        }
    }

    fn stub_queue() -> TwoPageQueue<StubPage> {
        TwoPageQueue::new(StubPage::default(), StubPage::default())
    }

    #[test]
    fn fresh_queue_has_no_work() {
        let queue = stub_queue();
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
        assert!(matches!(queue.try_consume(), TryConsume::NoMoreWork));
    }

    #[test]
    fn insert_then_consume_round_trip() {
        let queue = stub_queue();

        let txn = queue.begin_insert();
        assert!(txn.fresh_page());
        txn.commit();

        assert!(!queue.is_empty());
        assert_eq!(queue.len(), 1);

        match queue.try_consume() {
            TryConsume::Consumed(mut txn) => {
                // First insert stamps sequence number 2.
                assert_eq!(txn.page_mut().sequence_number(), 2);
            }
            other => panic!("expected Consumed, got {other:?}"),
        }

        assert!(queue.is_empty());
        assert!(matches!(queue.try_consume(), TryConsume::NoMoreWork));
    }

    #[test]
    fn second_insert_reuses_page() {
        let queue = stub_queue();

        queue.begin_insert().commit();
        let txn = queue.begin_insert();
        assert!(!txn.fresh_page(), "page was not drained in between");
        txn.commit();

        assert_eq!(queue.len(), 2);
        // Both inserts landed on one page, so one consume drains both.
        match queue.try_consume() {
            TryConsume::Consumed(_) => {}
            other => panic!("expected Consumed, got {other:?}"),
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn consume_commit_pulls_next_page_over() {
        let queue = stub_queue();
        queue.begin_insert().commit();

        let consume = match queue.try_consume() {
            TryConsume::Consumed(txn) => txn,
            other => panic!("expected Consumed, got {other:?}"),
        };

        // Producer keeps going while the consumer holds its page.
        queue.begin_insert().commit();
        assert_eq!(queue.len(), 1);

        // Dropping the consume transaction swaps the fresh page over.
        drop(consume);
        assert_eq!(queue.stats().last_enqueued, 3);

        match queue.try_consume() {
            TryConsume::Consumed(mut txn) => {
                assert_eq!(txn.page_mut().sequence_number(), 3);
            }
            other => panic!("expected Consumed, got {other:?}"),
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn stale_page_is_reset_on_reacquire() {
        let queue = stub_queue();

        queue.begin_insert().commit();
        match queue.try_consume() {
            TryConsume::Consumed(_) => {}
            other => panic!("expected Consumed, got {other:?}"),
        }

        // The old consumer page (tag 0) is now producer-side and stale; the
        // next insert must reset it before reuse.
        let mut txn = queue.begin_insert();
        assert!(txn.fresh_page());
        assert_eq!(txn.page_mut().resets, 1);
    }

    #[test]
    fn warmup_prepays_the_reset() {
        let queue = stub_queue();

        queue.begin_insert().commit();
        match queue.try_consume() {
            TryConsume::Consumed(_) => {}
            other => panic!("expected Consumed, got {other:?}"),
        }

        queue.warmup();
        queue.warmup(); // idempotent

        let mut txn = queue.begin_insert();
        assert!(txn.fresh_page());
        assert_eq!(txn.page_mut().resets, 1, "begin_insert must not reset again");
    }

    #[test]
    fn sequence_invariant_holds_at_rest() {
        let queue = stub_queue();
        for _ in 0..5 {
            queue.begin_insert().commit();
            let stats = queue.stats();
            assert!(stats.last_consumed <= stats.last_enqueued);
            assert!(stats.last_enqueued <= stats.last_inserted);
        }
        while let TryConsume::Consumed(_) = queue.try_consume() {}
        let stats = queue.stats();
        assert_eq!(stats.last_consumed, stats.last_inserted);
    }

    #[test]
    fn blocked_consumer_complains_and_producer_swaps() {
        let queue = stub_queue();
        let (to_consumer, from_producer) = mpsc::channel();
        let (to_producer, from_consumer) = mpsc::channel();

        std::thread::scope(|s| {
            let q = &queue;
            s.spawn(move || {
                let txn = q.begin_insert();
                to_consumer.send(()).unwrap();
                // Hold the producer lock until the consumer has bounced off.
                from_consumer.recv().unwrap();
                drop(txn);
                to_consumer.send(()).unwrap();
            });

            from_producer.recv().unwrap();
            match queue.try_consume() {
                TryConsume::QueueNotEmpty => {}
                other => panic!("expected QueueNotEmpty, got {other:?}"),
            }
            assert_eq!(queue.stats().consumer_stalls, 1);

            to_producer.send(()).unwrap();
            from_producer.recv().unwrap();

            // The producer's commit performed the swap on our behalf.
            assert_eq!(queue.stats().producer_swaps, 1);
            match queue.try_consume() {
                TryConsume::Consumed(mut txn) => {
                    assert_eq!(txn.page_mut().sequence_number(), 2);
                }
                other => panic!("expected Consumed, got {other:?}"),
            }
        });

        assert!(queue.is_empty());
    }

    #[test]
    fn contended_producer_consumer_converges() {
        const INSERTS: u64 = 100_000;

        let queue = stub_queue();
        let done = AtomicBool::new(false);

        std::thread::scope(|s| {
            let q = &queue;
            let done_flag = &done;

            s.spawn(move || {
                for _ in 0..INSERTS {
                    q.begin_insert().commit();
                }
                done_flag.store(true, Relaxed);
            });

            loop {
                match q.try_consume() {
                    TryConsume::Consumed(_) | TryConsume::QueueNotEmpty => {}
                    TryConsume::TooManyConsumers => unreachable!("single consumer"),
                    TryConsume::NoMoreWork => {
                        if done_flag.load(Relaxed) && q.is_empty() {
                            break;
                        }
                        std::hint::spin_loop();
                    }
                }
            }
        });

        let stats = queue.stats();
        assert_eq!(stats.last_inserted, INSERTS + 1);
        assert_eq!(stats.last_consumed, INSERTS + 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn pages_drop_with_queue() {
        struct DropPage<'a> {
            seq: u64,
            drops: &'a AtomicU64,
        }
        impl Page for DropPage<'_> {
            fn reset(&mut self) {}
            fn sequence_number(&self) -> u64 {
                self.seq
            }
            fn set_sequence_number(&mut self, seq: u64) {
                self.seq = seq;
            }
        }
        impl Drop for DropPage<'_> {
            fn drop(&mut self) {
                self.drops.fetch_add(1, Relaxed);
            }
        }

        let drops = AtomicU64::new(0);
        let queue = TwoPageQueue::new(
            DropPage {
                seq: 0,
                drops: &drops,
            },
            DropPage {
                seq: 0,
                drops: &drops,
            },
        );
        drop(queue);
        assert_eq!(drops.load(Relaxed), 2);
    }
}
