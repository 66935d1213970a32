//! Failure routing for the consumer thread.
//!
//! A failing work item must not take the drain loop down with it; the loop
//! catches the failure, hands it to the stream's policy, and moves on to the
//! next item in order. Policies run on the consumer thread only and are
//! expected to be quick (log, count, forward), not to retry the item.

use std::any::Any;
use std::error::Error;
use std::io;

/// Per-item failure handler, consulted once per failing apply.
///
/// The three handlers mirror the three ways an item can fail: the sink or
/// source reported an I/O error, the item reported some other error, or the
/// item panicked.
pub trait ErrorPolicy: Send + Sync {
    /// The sink or source failed while the item ran.
    fn on_io_error(&self, err: io::Error);

    /// The item reported a non-I/O failure.
    fn on_apply_error(&self, err: Box<dyn Error + Send + Sync>);

    /// The item panicked; `payload` is what `catch_unwind` recovered.
    fn on_panic(&self, payload: Box<dyn Any + Send>);
}

/// Reports failures through `tracing` at error level. The default policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPolicy;

impl ErrorPolicy for LogPolicy {
    fn on_io_error(&self, err: io::Error) {
        tracing::error!(target: "quill", %err, "work item I/O failure");
    }

    fn on_apply_error(&self, err: Box<dyn Error + Send + Sync>) {
        tracing::error!(target: "quill", %err, "work item failed");
    }

    fn on_panic(&self, payload: Box<dyn Any + Send>) {
        let msg = if let Some(s) = payload.downcast_ref::<&'static str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "non-string panic payload"
        };
        tracing::error!(target: "quill", msg, "work item panicked");
    }
}

/// Swallows every failure. Useful in benchmarks and in sinks where loss is
/// acceptable by construction.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnorePolicy;

impl ErrorPolicy for IgnorePolicy {
    fn on_io_error(&self, _err: io::Error) {}
    fn on_apply_error(&self, _err: Box<dyn Error + Send + Sync>) {}
    fn on_panic(&self, _payload: Box<dyn Any + Send>) {}
}
