//! Messaging counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Snapshot of messaging statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagingStats {
    /// Envelopes accepted by the broker
    pub events_published: u64,
    /// Raw messages pulled by consumer loops
    pub events_delivered: u64,
    /// Envelopes a handler processed successfully
    pub events_handled: u64,
    /// Envelopes whose handler failed after any retries
    pub handler_failures: u64,
    /// Envelopes with no registered handler
    pub events_unroutable: u64,
    /// Messages that could not be decoded
    pub decode_failures: u64,
    /// Messages settled as dead letters
    pub events_dead_lettered: u64,
    /// Messages settled as requeued
    pub events_requeued: u64,
}

/// Shared, lock-free counters behind [`MessagingStats`].
#[derive(Debug, Clone, Default)]
pub struct StatsRecorder {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    handled: AtomicU64,
    handler_failures: AtomicU64,
    unroutable: AtomicU64,
    decode_failures: AtomicU64,
    dead_lettered: AtomicU64,
    requeued: AtomicU64,
}

impl StatsRecorder {
    /// Create a recorder with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn published(&self) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivered(&self) {
        self.inner.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handled(&self) {
        self.inner.handled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handler_failed(&self) {
        self.inner.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unroutable(&self) {
        self.inner.unroutable.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decode_failed(&self) {
        self.inner.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dead_lettered(&self) {
        self.inner.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn requeued(&self) {
        self.inner.requeued.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent-enough snapshot of all counters.
    pub fn snapshot(&self) -> MessagingStats {
        let c = &self.inner;
        MessagingStats {
            events_published: c.published.load(Ordering::Relaxed),
            events_delivered: c.delivered.load(Ordering::Relaxed),
            events_handled: c.handled.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            events_unroutable: c.unroutable.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            events_dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            events_requeued: c.requeued.load(Ordering::Relaxed),
        }
    }
}
