//! Type-erased work items.
//!
//! A work item is one deferred operation against the stream's sink or
//! source: a formatted write, a byte write, a manipulator, a parse, a
//! callback. Items are placement-constructed inside a [`WorkPage`] on the
//! producer thread and applied exactly once on the consumer thread.
//!
//! The erasure is deliberately closed: a fixed header of plain function
//! pointers (apply + optional drop) plus a role tag, monomorphized from the
//! [`Work`] trait at the `push` call site. There is no open class hierarchy
//! and no vtable indirection beyond the two pointers.
//!
//! [`WorkPage`]: crate::WorkPage

use std::error::Error;
use std::fmt;
use std::io::{self, BufRead, Write};
use std::ptr;

/// Which side of the stream an item needs present when it runs.
///
/// Used for debug assertions while draining: a writer item drained without
/// an attached sink (or a reader without a source) is a wiring bug in the
/// facade, not a runtime condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Reads the sink, ignores the source.
    Writer,
    /// Reads the source, ignores the sink.
    Reader,
    /// Needs neither (completion callbacks, page breaks).
    Neutral,
}

/// Failure reported by a work item's [`apply`](Work::apply).
///
/// Panics are the third failure kind; they are caught around each item by
/// the drain loop rather than surfaced through this type.
#[derive(Debug)]
pub enum ApplyError {
    /// The sink or source failed, or the side the item needs was not
    /// attached to the stream.
    Io(io::Error),
    /// Any other failure the item chose to report.
    Other(Box<dyn Error + Send + Sync>),
}

impl ApplyError {
    /// Returns `true` for the I/O variant.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<io::Error> for ApplyError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O failure applying work item: {err}"),
            Self::Other(err) => write!(f, "work item failed: {err}"),
        }
    }
}

impl Error for ApplyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Other(err) => Some(err.as_ref()),
        }
    }
}

/// One unit of deferred stream work.
///
/// Implementors capture their payload by value; the sink and source are
/// borrowed per call. `apply` runs exactly once (the page is reset, not
/// re-drained), must complete in bounded time from the consumer's point of
/// view, and may fail or panic; the drain loop contains both and keeps
/// going.
pub trait Work {
    /// Which side must be present when this item runs.
    const ROLE: Role = Role::Neutral;

    /// Applies the item against the borrowed sink and/or source.
    fn apply(
        &mut self,
        sink: Option<&mut dyn Write>,
        source: Option<&mut dyn BufRead>,
    ) -> Result<(), ApplyError>;
}

pub(crate) type ApplyFn =
    unsafe fn(*mut u8, Option<&mut dyn Write>, Option<&mut dyn BufRead>) -> Result<(), ApplyError>;
pub(crate) type DropFn = unsafe fn(*mut u8);

/// Fixed-size header preceding every payload in a work page.
#[repr(C)]
pub(crate) struct ItemHeader {
    pub(crate) apply: ApplyFn,
    pub(crate) drop_fn: Option<DropFn>,
    pub(crate) payload: *mut u8,
    pub(crate) role: Role,
}

impl ItemHeader {
    /// Traversal-only filler planted where a node would have straddled a
    /// storage-page boundary.
    pub(crate) fn page_break() -> Self {
        Self {
            apply: apply_page_break,
            drop_fn: None,
            payload: ptr::null_mut(),
            role: Role::Neutral,
        }
    }
}

/// # Safety
///
/// `payload` must point at a live, exclusively borrowed `W`, the pointer
/// `push` registered this function with.
pub(crate) unsafe fn apply_erased<W: Work>(
    payload: *mut u8,
    sink: Option<&mut dyn Write>,
    source: Option<&mut dyn BufRead>,
) -> Result<(), ApplyError> {
    // Safety: per the function contract.
    let work = unsafe { &mut *payload.cast::<W>() };
    work.apply(sink, source)
}

/// # Safety
///
/// `payload` must point at a live `W` that is never touched again.
pub(crate) unsafe fn drop_erased<W>(payload: *mut u8) {
    // Safety: per the function contract.
    unsafe { payload.cast::<W>().drop_in_place() }
}

unsafe fn apply_page_break(
    _payload: *mut u8,
    _sink: Option<&mut dyn Write>,
    _source: Option<&mut dyn BufRead>,
) -> Result<(), ApplyError> {
    Ok(())
}
