//! The concrete work-item shapes the stream submits.
//!
//! Five shapes cover the whole submission surface; user extensibility goes
//! through `Display` (formatted writes) and closures (manipulators,
//! parsers, callbacks), which monomorphize into these shapes at the submit
//! call site. Nothing here is public: the arena's `Work` trait is the seam.

use std::fmt::Display;
use std::io::{self, BufRead, Write};

use quill_arena::{ApplyError, Role, Work};

fn no_sink() -> io::Error {
    io::Error::other("stream has no sink attached")
}

fn no_source() -> io::Error {
    io::Error::other("stream has no source attached")
}

/// Formatted write. Owns a copy of the value; formatting runs on the
/// consumer thread, so a slow `Display` impl costs the background worker,
/// not the submitter.
pub(crate) struct FmtValue<T: Display>(pub(crate) T);

impl<T: Display + Send> Work for FmtValue<T> {
    const ROLE: Role = Role::Writer;

    fn apply(
        &mut self,
        sink: Option<&mut dyn Write>,
        _source: Option<&mut dyn BufRead>,
    ) -> Result<(), ApplyError> {
        let sink = sink.ok_or_else(no_sink)?;
        write!(sink, "{}", self.0)?;
        Ok(())
    }
}

/// Raw byte write. The bytes live in the same work page, copied there by
/// `submit_bytes` right after this header was pushed.
pub(crate) struct RawBytes {
    pub(crate) ptr: *const u8,
    pub(crate) len: usize,
}

// Safety: the byte region lives in the same page as the item and moves to
// the consumer thread together with it.
unsafe impl Send for RawBytes {}

impl Work for RawBytes {
    const ROLE: Role = Role::Writer;

    fn apply(
        &mut self,
        sink: Option<&mut dyn Write>,
        _source: Option<&mut dyn BufRead>,
    ) -> Result<(), ApplyError> {
        if self.len == 0 {
            return Ok(());
        }
        let sink = sink.ok_or_else(no_sink)?;
        // Safety: `ptr` was patched to an in-page region of `len` bytes
        // that outlives the drain.
        sink.write_all(unsafe { std::slice::from_raw_parts(self.ptr, self.len) })?;
        Ok(())
    }
}

/// Manipulator: an arbitrary one-shot operation against the sink.
pub(crate) struct Manipulator<F>(pub(crate) Option<F>);

impl<F> Work for Manipulator<F>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()> + Send,
{
    const ROLE: Role = Role::Writer;

    fn apply(
        &mut self,
        sink: Option<&mut dyn Write>,
        _source: Option<&mut dyn BufRead>,
    ) -> Result<(), ApplyError> {
        let sink = sink.ok_or_else(no_sink)?;
        if let Some(f) = self.0.take() {
            f(sink)?;
        }
        Ok(())
    }
}

/// Input parse. The parser runs against the source on the consumer thread;
/// its outcome, bytes consumed or the error, is delivered through the
/// completion callback, never through the error policy.
pub(crate) struct ReadParse<P, C> {
    pub(crate) parser: Option<P>,
    pub(crate) completion: Option<C>,
}

impl<P, C> Work for ReadParse<P, C>
where
    P: FnOnce(&mut dyn BufRead) -> io::Result<u64> + Send,
    C: FnOnce(io::Result<u64>) + Send,
{
    const ROLE: Role = Role::Reader;

    fn apply(
        &mut self,
        _sink: Option<&mut dyn Write>,
        source: Option<&mut dyn BufRead>,
    ) -> Result<(), ApplyError> {
        let (Some(parser), Some(completion)) = (self.parser.take(), self.completion.take()) else {
            return Ok(());
        };
        match source {
            Some(source) => completion(parser(source)),
            None => completion(Err(no_source())),
        }
        Ok(())
    }
}

/// Neutral completion callback; fires after all prior items of the stream
/// have been applied.
pub(crate) struct Callback<F>(pub(crate) Option<F>);

impl<F: FnOnce() + Send> Work for Callback<F> {
    fn apply(
        &mut self,
        _sink: Option<&mut dyn Write>,
        _source: Option<&mut dyn BufRead>,
    ) -> Result<(), ApplyError> {
        if let Some(f) = self.0.take() {
            f();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_parse_without_source_reports_through_completion() {
        let mut delivered = None;
        {
            let mut item = ReadParse {
                parser: Some(|_source: &mut dyn BufRead| Ok(0)),
                completion: Some(|outcome: io::Result<u64>| delivered = Some(outcome)),
            };
            item.apply(None, None).unwrap();
        }
        assert!(matches!(delivered, Some(Err(_))));
    }

    #[test]
    fn callback_fires_once() {
        let mut fired = 0;
        let mut item = Callback(Some(|| fired += 1));
        item.apply(None, None).unwrap();
        item.apply(None, None).unwrap();
        assert_eq!(fired, 1);
    }
}
