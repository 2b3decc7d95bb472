//! Keep-alive cache counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of cache metrics at a point in time.
pub struct CacheMetricsSnapshot {
    /// Connections accepted into the idle pool.
    pub idle_puts: u64,
    /// `get_idle` calls that returned a live connection.
    pub idle_hits: u64,
    /// `get_idle` calls that found nothing usable.
    pub idle_misses: u64,
    /// Connections closed because their key's idle stack was full.
    pub overflow_closes: u64,
    /// Idle connections closed after outliving their timeout.
    pub expired_closes: u64,
    /// Explicit `remove` calls.
    pub removals: u64,
    /// Connections registered as active.
    pub active_registrations: u64,
    /// Dead-owner notifications that released a connection.
    pub owners_reclaimed: u64,
    /// Response streams closed by the reclaimer.
    pub streams_closed: u64,
}

/// Thread-safe keep-alive cache metrics collector.
#[derive(Default)]
pub struct CacheMetrics {
    idle_puts: AtomicU64,
    idle_hits: AtomicU64,
    idle_misses: AtomicU64,
    overflow_closes: AtomicU64,
    expired_closes: AtomicU64,
    removals: AtomicU64,
    active_registrations: AtomicU64,
    owners_reclaimed: AtomicU64,
    streams_closed: AtomicU64,
}

impl std::fmt::Debug for CacheMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl CacheMetrics {
    /// Creates a collector with every counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_idle_puts(&self) {
        self.idle_puts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_idle_hits(&self) {
        self.idle_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_idle_misses(&self) {
        self.idle_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_overflow_closes(&self) {
        self.overflow_closes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_expired_closes(&self, count: u64) {
        self.expired_closes.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn inc_removals(&self) {
        self.removals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_active_registrations(&self) {
        self.active_registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_owners_reclaimed(&self) {
        self.owners_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_streams_closed(&self) {
        self.streams_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            idle_puts: self.idle_puts.load(Ordering::Relaxed),
            idle_hits: self.idle_hits.load(Ordering::Relaxed),
            idle_misses: self.idle_misses.load(Ordering::Relaxed),
            overflow_closes: self.overflow_closes.load(Ordering::Relaxed),
            expired_closes: self.expired_closes.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            active_registrations: self.active_registrations.load(Ordering::Relaxed),
            owners_reclaimed: self.owners_reclaimed.load(Ordering::Relaxed),
            streams_closed: self.streams_closed.load(Ordering::Relaxed),
        }
    }
}
