//! Bump-allocated work pages with an intrusive list of type-erased items.
//!
//! A [`WorkPage`] is one side of the two-page hand-off: the producer
//! placement-constructs [`Work`] items into it with no heap allocation on
//! the hot path, and the consumer later walks the items in insertion order
//! and applies each one against the stream's sink and source.
//!
//! # Storage layout
//!
//! A page owns a singly linked list of storage pages of pointer-sized
//! words. Items thread through the storage as an intrusive list:
//!
//! ```text
//! ┌──────┬─────────────┬──────────┬──┬──────┬─────────────┬─────┬──┐
//! │ next │ item header │ payload  │..│ next │ item header │ pay │ 0│
//! └──┬───┴─────────────┴──────────┴──┴──▲───┴─────────────┴─────┴──┘
//!    └──────────────────────────────────┘          zero terminator
//! ```
//!
//! Every node is one next-slot word, a fixed item header (apply + drop
//! function pointers, payload pointer, role tag), and a payload region
//! aligned for the payload type. Byte copies attached to the most recent
//! node ([`WorkPage::alloc`]) extend the node's span instead of opening a
//! new one. A node that would straddle a storage-page boundary is replaced
//! by a no-op page-break item whose next-slot word jumps to the new storage
//! page, so traversal never sees a half-constructed slot.
//!
//! Storage grows geometrically (each new page is twice the previous page
//! or twice the request, whichever is larger) and the extra pages are
//! released on [`WorkPage::reset`], not during the drain. The initial page
//! is 4 KiB minus the straddle-patch reserve.
//!
//! # Lifecycle
//!
//! Items are applied exactly once ([`WorkPage::drain`], driven by the
//! channel so a page is never drained twice) and dropped in insertion order
//! by the next [`WorkPage::reset`], which the channel defers until the
//! producer takes the page back, keeping the storage's cache ownership on
//! the thread about to write it.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, missing_debug_implementations)]

use std::alloc::{self, Layout};
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};

mod item;
mod policy;

pub use item::{ApplyError, Role, Work};
pub use policy::{ErrorPolicy, IgnorePolicy, LogPolicy};

use item::{apply_erased, drop_erased, ItemHeader};

const WORD: usize = mem::size_of::<usize>();

fn reborrow_sink<'a>(
    sink: &'a mut Option<&mut dyn std::io::Write>,
) -> Option<&'a mut dyn std::io::Write> {
    match sink {
        Some(s) => Some(&mut **s),
        None => None,
    }
}

fn reborrow_source<'a>(
    source: &'a mut Option<&mut dyn std::io::BufRead>,
) -> Option<&'a mut dyn std::io::BufRead> {
    match source {
        Some(s) => Some(&mut **s),
        None => None,
    }
}

/// Words of an item header, rounded up.
const HEADER_WORDS: usize = mem::size_of::<ItemHeader>().div_ceil(WORD);

/// Every storage page reserves this many words past its usable end so a
/// straddling node can always be patched with a page-break item in place.
const PATCH_RESERVE_WORDS: usize = HEADER_WORDS;

/// Usable words of the initial storage page: 4 KiB minus the patch reserve.
const INITIAL_PAGE_WORDS: usize = 4096 / WORD - PATCH_RESERVE_WORDS;

/// Smallest usable page: room for a few header-only nodes.
const MIN_PAGE_WORDS: usize = 4 * (1 + HEADER_WORDS);

/// One contiguous word buffer in a page's linked list.
struct StoragePage {
    data: NonNull<usize>,
    /// Usable capacity in words; the buffer holds `words +
    /// PATCH_RESERVE_WORDS`.
    words: usize,
    next: Option<NonNull<StoragePage>>,
}

impl StoragePage {
    fn layout(words: usize) -> Layout {
        Layout::array::<usize>(words + PATCH_RESERVE_WORDS).expect("storage page size overflow")
    }

    /// Allocates a page with `words` usable words and a zeroed terminator.
    /// Aborts the process on OOM; producers cannot meaningfully continue
    /// without storage.
    fn boxed(words: usize) -> NonNull<StoragePage> {
        let layout = Self::layout(words);
        // Safety: the layout has non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        let Some(data) = NonNull::new(raw.cast::<usize>()) else {
            alloc::handle_alloc_error(layout)
        };
        // Safety: freshly allocated, first word is in bounds.
        unsafe { data.as_ptr().write(0) };
        NonNull::from(Box::leak(Box::new(StoragePage {
            data,
            words,
            next: None,
        })))
    }

    /// # Safety
    ///
    /// `page` must have come from [`StoragePage::boxed`] and must never be
    /// referenced again.
    unsafe fn free(page: NonNull<StoragePage>) {
        // Safety: reconstructing the box and buffer allocated in `boxed`.
        unsafe {
            let page = Box::from_raw(page.as_ptr());
            let layout = Self::layout(page.words);
            alloc::dealloc(page.data.as_ptr().cast(), layout);
        }
    }
}

/// A growable arena of type-erased work items with intrusive traversal.
///
/// See the crate docs for the storage layout. A `WorkPage` is `Send` (it
/// crosses to the consumer thread inside the channel) but not `Sync`; the
/// channel's spinlocks provide all cross-thread exclusion.
pub struct WorkPage {
    first: NonNull<StoragePage>,
    last: NonNull<StoragePage>,
    /// Next free word. Always holds the zero list terminator.
    cursor: *mut usize,
    /// One past the last usable word of the current storage page.
    end: *mut usize,
    /// Next-slot word of the most recently opened node; null while the page
    /// holds no nodes.
    node: *mut usize,
    /// Start of the most recent allocation (node header or extension).
    last_alloc: *mut u8,
    /// Freshness tag maintained by the channel.
    seq: u64,
}

// Safety: `push` requires `W: Send`, extension regions hold plain bytes,
// and every raw pointer targets storage the page exclusively owns, so the
// whole page may move to the consumer thread.
unsafe impl Send for WorkPage {}

impl WorkPage {
    /// Creates a page with the default 4 KiB initial storage page.
    pub fn new() -> Self {
        Self::with_words(INITIAL_PAGE_WORDS)
    }

    /// Creates a page whose initial storage page is `bytes` large
    /// (including the straddle-patch reserve), clamped to a small minimum.
    pub fn with_page_size(bytes: usize) -> Self {
        let words = (bytes / WORD)
            .saturating_sub(PATCH_RESERVE_WORDS)
            .max(MIN_PAGE_WORDS);
        Self::with_words(words)
    }

    fn with_words(words: usize) -> Self {
        let first = StoragePage::boxed(words);
        // Safety: `first` is freshly allocated and valid.
        let (cursor, end) = unsafe {
            let page = first.as_ref();
            (page.data.as_ptr(), page.data.as_ptr().add(page.words))
        };
        Self {
            first,
            last: first,
            cursor,
            end,
            node: ptr::null_mut(),
            last_alloc: ptr::null_mut(),
            seq: 0,
        }
    }

    /// Returns `true` if the page holds no items.
    pub fn is_empty(&self) -> bool {
        // Safety: the head word always holds either a node link or the
        // terminator.
        unsafe { *self.first.as_ref().data.as_ptr() == 0 }
    }

    /// Placement-constructs `work` as a new intrusive node.
    ///
    /// Grows the storage if needed; a node that would straddle the current
    /// storage page's end leaves a page-break item behind and continues on
    /// the new page. The returned pointer stays valid until the next
    /// [`reset`](Self::reset) and may be used to patch the payload after a
    /// subsequent [`alloc`](Self::alloc).
    pub fn push<W: Work + Send>(&mut self, work: W) -> NonNull<W> {
        let layout = Layout::new::<W>();
        let (header, payload) = self.open_node(layout);
        // Safety: open_node returned in-bounds, unaliased slots, `payload`
        // aligned for `W`.
        unsafe {
            header.write(ItemHeader {
                apply: apply_erased::<W>,
                drop_fn: if mem::needs_drop::<W>() {
                    Some(drop_erased::<W>)
                } else {
                    None
                },
                payload,
                role: W::ROLE,
            });
            payload.cast::<W>().write(work);
            NonNull::new_unchecked(payload.cast::<W>())
        }
    }

    /// Reserves `len` bytes extending the most recently pushed node.
    ///
    /// This is the payload half of a compound item: the raw-bytes writer
    /// pushes its header first and copies its bytes into a region allocated
    /// here, all inside the same intrusive node. The region is word-aligned
    /// and stays valid until the next [`reset`](Self::reset).
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero or if nothing was pushed since the last
    /// reset.
    pub fn alloc(&mut self, len: usize) -> NonNull<u8> {
        assert!(len != 0, "zero-size allocation");
        assert!(
            !self.node.is_null(),
            "alloc extends a node; push an item first"
        );

        let words = len.div_ceil(WORD);
        let start = if self.fits(words) {
            let start = self.cursor;
            // Safety: fits() guaranteed room for the region plus the new
            // terminator; `node` points at the open node's next-slot word.
            unsafe {
                let new_cursor = start.add(words);
                *self.node = new_cursor as usize;
                *new_cursor = 0;
                self.cursor = new_cursor;
            }
            start
        } else {
            // The tail of the old storage page is abandoned; the node's
            // next-slot word jumps straight into the new page.
            let page = self.grow(words);
            // Safety: the fresh page holds at least `2 * words` usable
            // words, so the region and terminator both fit.
            unsafe {
                let base = page.as_ref().data.as_ptr();
                let new_cursor = base.add(words);
                *self.node = new_cursor as usize;
                *new_cursor = 0;
                self.cursor = new_cursor;
                base
            }
        };

        self.last_alloc = start.cast();
        // Safety: `start` points into live storage, never null.
        unsafe { NonNull::new_unchecked(start.cast()) }
    }

    /// Start of the most recent allocation: a node's next-slot word for
    /// [`push`](Self::push), the region start for [`alloc`](Self::alloc).
    ///
    /// Lets a caller interleaving the two distinguish whether the latest
    /// allocation opened a new intrusive node or extended one.
    pub fn last_allocated(&self) -> *mut u8 {
        self.last_alloc
    }

    /// Walks the items in insertion order and applies each one.
    ///
    /// Failures are contained per item: I/O errors, reported errors, and
    /// panics are routed to `policy` and the walk continues. Items are NOT
    /// dropped and extra storage pages are NOT released here; that is
    /// deferred to [`reset`](Self::reset), which the owning channel runs on
    /// the producer side.
    ///
    /// The caller must ensure a page is drained at most once between
    /// resets; the channel's sequence tags enforce this.
    pub fn drain(
        &mut self,
        mut sink: Option<&mut dyn std::io::Write>,
        mut source: Option<&mut dyn std::io::BufRead>,
        policy: &dyn ErrorPolicy,
    ) {
        // Safety: the intrusive list is well-formed by construction; every
        // next-slot word written by open_node/alloc points at a live node
        // or holds the zero terminator.
        unsafe {
            let mut cursor = self.first.as_ref().data.as_ptr();
            while *cursor != 0 {
                let item = cursor.add(1).cast::<ItemHeader>();
                let role = (*item).role;
                debug_assert!(
                    role != Role::Writer || sink.is_some(),
                    "writer item drained without a sink"
                );
                debug_assert!(
                    role != Role::Reader || source.is_some(),
                    "reader item drained without a source"
                );

                let apply = (*item).apply;
                let payload = (*item).payload;
                let sink_ref = reborrow_sink(&mut sink);
                let source_ref = reborrow_source(&mut source);
                let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
                    // Safety: `apply` and `payload` were registered
                    // together by push and the payload is still live.
                    unsafe { apply(payload, sink_ref, source_ref) }
                }));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(ApplyError::Io(err))) => policy.on_io_error(err),
                    Ok(Err(ApplyError::Other(err))) => policy.on_apply_error(err),
                    Err(panic_payload) => policy.on_panic(panic_payload),
                }

                cursor = *cursor as *mut usize;
            }
        }
    }

    /// Drops every item in insertion order, releases every storage page
    /// after the first, and rearms the allocation cursor. Idempotent.
    pub fn reset(&mut self) {
        // Safety: the list is well-formed; each payload pointer was
        // registered together with its drop function by push. Items must be
        // dropped before their storage is released below.
        unsafe {
            let mut cursor = self.first.as_ref().data.as_ptr();
            while *cursor != 0 {
                let item = cursor.add(1).cast::<ItemHeader>();
                if let Some(drop_fn) = (*item).drop_fn {
                    drop_fn((*item).payload);
                }
                cursor = *cursor as *mut usize;
            }
        }

        // Safety: pages after `first` are owned solely by this list and no
        // live item references them anymore.
        unsafe {
            let mut extra = self.first.as_mut().next.take();
            while let Some(page) = extra {
                extra = page.as_ref().next;
                StoragePage::free(page);
            }
        }

        self.last = self.first;
        // Safety: `first` stays valid for the page's lifetime.
        unsafe {
            let first = self.first.as_ref();
            self.cursor = first.data.as_ptr();
            self.end = first.data.as_ptr().add(first.words);
            *self.cursor = 0;
        }
        self.node = ptr::null_mut();
        self.last_alloc = ptr::null_mut();
    }

    /// Returns `true` if a slot of `words` words plus the new terminator
    /// fits in the current storage page.
    #[inline]
    fn fits(&self, words: usize) -> bool {
        (self.cursor as usize) + words * WORD < self.end as usize
    }

    /// Opens a new intrusive node sized for an item header plus a payload
    /// of the given layout. Returns the header slot and the aligned payload
    /// slot; the caller writes both.
    fn open_node(&mut self, payload: Layout) -> (*mut ItemHeader, *mut u8) {
        // Word-aligned slots carry payloads of any alignment by reserving
        // the worst-case pad between header and payload.
        let slack = payload.align().saturating_sub(WORD);
        let body = mem::size_of::<ItemHeader>() + slack + payload.size();
        let body_words = body.div_ceil(WORD).max(1);

        if !self.fits(1 + body_words) {
            self.straddle_to_new_page(1 + body_words);
        }

        let node = self.cursor;
        self.node = node;
        // Safety: fits()/straddle_to_new_page() guaranteed room for the
        // slot plus the new terminator.
        unsafe {
            let new_cursor = node.add(1 + body_words);
            *node = new_cursor as usize;
            *new_cursor = 0;
            self.cursor = new_cursor;

            let header = node.add(1).cast::<ItemHeader>();
            // The header's end is word-aligned, so the pad below never
            // exceeds the `slack` reserved above.
            let header_end = header.add(1).cast::<u8>();
            let misalign = header_end as usize % payload.align();
            let pad = if misalign == 0 {
                0
            } else {
                payload.align() - misalign
            };
            self.last_alloc = node.cast();
            (header, header_end.add(pad))
        }
    }

    /// Fills the slot at the cursor with a page-break item and moves the
    /// cursor to a fresh storage page with room for `words` words.
    #[cold]
    fn straddle_to_new_page(&mut self, words: usize) {
        // The straddling slot becomes a traversal-only filler. The patch
        // reserve past `end` guarantees the filler's header always fits.
        // Safety: `cursor` lies within usable capacity, so cursor + 1 +
        // HEADER_WORDS stays within the buffer including its reserve.
        unsafe {
            self.cursor
                .add(1)
                .cast::<ItemHeader>()
                .write(ItemHeader::page_break());
        }
        let page = self.grow(words);
        // Safety: linking the filler to the new page and planting the new
        // terminator at its base.
        unsafe {
            let base = page.as_ref().data.as_ptr();
            *self.cursor = base as usize;
            *base = 0;
            self.cursor = base;
        }
    }

    /// Appends a storage page holding at least `2 * min_words` usable words.
    fn grow(&mut self, min_words: usize) -> NonNull<StoragePage> {
        // Twice the previous page or twice the request, whichever is larger.
        // Safety: `last` is valid.
        let prev_words = unsafe { self.last.as_ref().words };
        let words = (2 * prev_words).max(2 * min_words);
        let page = StoragePage::boxed(words);
        // Safety: linking the fresh page at the tail; its buffer is valid.
        unsafe {
            self.last.as_mut().next = Some(page);
            self.last = page;
            self.end = page.as_ref().data.as_ptr().add(page.as_ref().words);
        }
        page
    }
}

impl Default for WorkPage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkPage {
    fn drop(&mut self) {
        self.reset();
        // Safety: reset left only the base page and dropped every item.
        unsafe { StoragePage::free(self.first) };
    }
}

impl fmt::Debug for WorkPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkPage")
            .field("sequence_number", &self.seq)
            .field("is_empty", &self.is_empty())
            .finish_non_exhaustive()
    }
}

impl quill_queue::Page for WorkPage {
    fn reset(&mut self) {
        WorkPage::reset(self);
    }

    fn sequence_number(&self) -> u64 {
        self.seq
    }

    fn set_sequence_number(&mut self, seq: u64) {
        self.seq = seq;
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, BufRead, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Default)]
    struct CountPolicy {
        io: AtomicUsize,
        other: AtomicUsize,
        panics: AtomicUsize,
    }

    impl ErrorPolicy for CountPolicy {
        fn on_io_error(&self, _err: io::Error) {
            self.io.fetch_add(1, Ordering::Relaxed);
        }
        fn on_apply_error(&self, _err: Box<dyn std::error::Error + Send + Sync>) {
            self.other.fetch_add(1, Ordering::Relaxed);
        }
        fn on_panic(&self, _payload: Box<dyn std::any::Any + Send>) {
            self.panics.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct EmitU32(u32);

    impl Work for EmitU32 {
        const ROLE: Role = Role::Writer;
        fn apply(
            &mut self,
            sink: Option<&mut dyn Write>,
            _source: Option<&mut dyn BufRead>,
        ) -> Result<(), ApplyError> {
            let sink = sink.ok_or_else(|| io::Error::other("no sink"))?;
            write!(sink, "{},", self.0)?;
            Ok(())
        }
    }

    fn drain_to_string(page: &mut WorkPage, policy: &dyn ErrorPolicy) -> String {
        let mut out = Vec::new();
        page.drain(Some(&mut out), None, policy);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn applies_in_insertion_order() {
        let policy = CountPolicy::default();
        let mut page = WorkPage::new();
        for i in 0..100u32 {
            page.push(EmitU32(i));
        }

        let expected: String = (0..100).map(|i| format!("{i},")).collect();
        assert_eq!(drain_to_string(&mut page, &policy), expected);
        assert_eq!(policy.io.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn growth_preserves_order_across_storage_pages() {
        let policy = CountPolicy::default();
        // Tiny initial page so growth and page breaks actually happen.
        let mut page = WorkPage::with_page_size(256);
        for i in 0..2_000u32 {
            page.push(EmitU32(i));
        }

        let expected: String = (0..2_000).map(|i| format!("{i},")).collect();
        assert_eq!(drain_to_string(&mut page, &policy), expected);
    }

    struct EmitBytes {
        ptr: *const u8,
        len: usize,
    }

    // Safety: the bytes live in the same page as the item.
    unsafe impl Send for EmitBytes {}

    impl Work for EmitBytes {
        const ROLE: Role = Role::Writer;
        fn apply(
            &mut self,
            sink: Option<&mut dyn Write>,
            _source: Option<&mut dyn BufRead>,
        ) -> Result<(), ApplyError> {
            let sink = sink.ok_or_else(|| io::Error::other("no sink"))?;
            // Safety: the region was copied into the page and outlives the
            // drain.
            sink.write_all(unsafe { std::slice::from_raw_parts(self.ptr, self.len) })?;
            Ok(())
        }
    }

    fn push_bytes(page: &mut WorkPage, bytes: &[u8]) {
        let item = page.push(EmitBytes {
            ptr: std::ptr::null(),
            len: bytes.len(),
        });
        let dst = page.alloc(bytes.len());
        // Safety: `dst` is a fresh in-page region of `bytes.len()` bytes;
        // `item` was just pushed and nothing else aliases it.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len());
            (*item.as_ptr()).ptr = dst.as_ptr();
        }
    }

    #[test]
    fn compound_item_extends_the_node() {
        let policy = CountPolicy::default();
        let mut page = WorkPage::new();
        push_bytes(&mut page, b"hello ");
        push_bytes(&mut page, b"world");

        let mut out = Vec::new();
        page.drain(Some(&mut out), None, &policy);
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn large_extension_spills_to_a_new_storage_page() {
        let policy = CountPolicy::default();
        let mut page = WorkPage::with_page_size(256);
        let big: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        push_bytes(&mut page, &big);
        push_bytes(&mut page, b"tail");

        let mut out = Vec::new();
        page.drain(Some(&mut out), None, &policy);
        assert_eq!(&out[..big.len()], &big[..]);
        assert_eq!(&out[big.len()..], b"tail");
    }

    #[test]
    fn last_allocated_tracks_extensions() {
        let mut page = WorkPage::new();
        let node_start = {
            page.push(EmitBytes {
                ptr: std::ptr::null(),
                len: 0,
            });
            page.last_allocated()
        };
        let ext = page.alloc(16);
        assert_eq!(page.last_allocated(), ext.as_ptr());
        assert_ne!(page.last_allocated(), node_start);
    }

    #[test]
    #[should_panic(expected = "push an item first")]
    fn alloc_without_a_node_panics() {
        let mut page = WorkPage::new();
        let _ = page.alloc(8);
    }

    struct DropProbe(Arc<AtomicUsize>);

    impl Drop for DropProbe {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    impl Work for DropProbe {
        fn apply(
            &mut self,
            _sink: Option<&mut dyn Write>,
            _source: Option<&mut dyn BufRead>,
        ) -> Result<(), ApplyError> {
            Ok(())
        }
    }

    #[test]
    fn reset_drops_items_exactly_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let policy = CountPolicy::default();
        let mut page = WorkPage::new();
        for _ in 0..3 {
            page.push(DropProbe(Arc::clone(&drops)));
        }

        // Draining applies but never drops.
        page.drain(None, None, &policy);
        assert_eq!(drops.load(Ordering::Relaxed), 0);

        page.reset();
        assert_eq!(drops.load(Ordering::Relaxed), 3);
        assert!(page.is_empty());

        page.reset(); // idempotent
        assert_eq!(drops.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn page_drop_drops_pending_items() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let mut page = WorkPage::new();
            page.push(DropProbe(Arc::clone(&drops)));
            page.push(DropProbe(Arc::clone(&drops)));
        }
        assert_eq!(drops.load(Ordering::Relaxed), 2);
    }

    struct Explode;

    impl Work for Explode {
        fn apply(
            &mut self,
            _sink: Option<&mut dyn Write>,
            _source: Option<&mut dyn BufRead>,
        ) -> Result<(), ApplyError> {
            panic!("boom");
        }
    }

    struct Refuse;

    impl Work for Refuse {
        fn apply(
            &mut self,
            _sink: Option<&mut dyn Write>,
            _source: Option<&mut dyn BufRead>,
        ) -> Result<(), ApplyError> {
            Err(ApplyError::Other("refused".into()))
        }
    }

    #[test]
    fn failures_are_contained_per_item() {
        let policy = CountPolicy::default();
        let mut page = WorkPage::new();
        page.push(Explode);
        page.push(Refuse);
        page.push(EmitU32(7));

        let out = drain_to_string(&mut page, &policy);
        assert_eq!(out, "7,");
        assert_eq!(policy.panics.load(Ordering::Relaxed), 1);
        assert_eq!(policy.other.load(Ordering::Relaxed), 1);
        assert_eq!(policy.io.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn missing_sink_is_routed_as_io_error() {
        let policy = CountPolicy::default();
        let mut page = WorkPage::new();
        page.push(EmitU32(1));
        // Release builds route the missing side through the policy.
        if cfg!(debug_assertions) {
            return;
        }
        page.drain(None, None, &policy);
        assert_eq!(policy.io.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn high_alignment_payloads_land_aligned() {
        #[repr(align(32))]
        struct Aligned([u8; 32]);

        impl Work for Aligned {
            fn apply(
                &mut self,
                _sink: Option<&mut dyn Write>,
                _source: Option<&mut dyn BufRead>,
            ) -> Result<(), ApplyError> {
                Ok(())
            }
        }

        let mut page = WorkPage::new();
        for _ in 0..64 {
            let item = page.push(Aligned([0; 32]));
            assert_eq!(item.as_ptr() as usize % 32, 0);
        }
    }

    #[test]
    fn sequence_tag_round_trips() {
        use quill_queue::Page as _;

        let mut page = WorkPage::new();
        assert_eq!(page.sequence_number(), 0);
        page.set_sequence_number(17);
        assert_eq!(page.sequence_number(), 17);
    }
}
