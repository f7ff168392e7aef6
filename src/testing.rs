//! Helpers shared by the unit tests.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::span::{Attributes, Id, Record};
use tracing::{Metadata, Subscriber};

#[derive(Debug, Default)]
struct Counts {
    next_id: AtomicU64,
    enters: AtomicUsize,
    exits: AtomicUsize,
}

/// A subscriber that only counts how often spans are entered and exited.
///
/// Install it with [`tracing::subscriber::with_default`], it then sees the
/// spans of the installing thread only.
#[derive(Debug, Clone, Default)]
pub struct SpanCounter {
    counts: Arc<Counts>,
}

impl SpanCounter {
    pub fn enters(&self) -> usize {
        self.counts.enters.load(Ordering::SeqCst)
    }

    pub fn exits(&self) -> usize {
        self.counts.exits.load(Ordering::SeqCst)
    }

    /// Spans currently entered.
    pub fn depth(&self) -> usize {
        self.enters() - self.exits()
    }
}

impl Subscriber for SpanCounter {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        true
    }

    fn new_span(&self, _: &Attributes<'_>) -> Id {
        Id::from_u64(self.counts.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn record(&self, _: &Id, _: &Record<'_>) {}

    fn record_follows_from(&self, _: &Id, _: &Id) {}

    fn event(&self, _: &tracing::Event<'_>) {}

    fn enter(&self, _: &Id) {
        self.counts.enters.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self, _: &Id) {
        self.counts.exits.fetch_add(1, Ordering::SeqCst);
    }
}
