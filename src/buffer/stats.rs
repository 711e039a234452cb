//! Buffer pool statistics tracking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters tracked by the buffer pool.
///
/// All fields are atomics updated with `Ordering::Relaxed`: the
/// counters only need atomicity, not cross-counter ordering, and they
/// are read for diagnostics where eventual consistency is fine.
#[derive(Debug)]
pub struct BufferPoolStats {
    /// Times a page was found already resident.
    pub cache_hits: AtomicU64,
    /// Times a page had to be read from disk.
    pub cache_misses: AtomicU64,
    /// Times a page was evicted to make room.
    pub evictions: AtomicU64,
    /// Pages read from disk.
    pub pages_read: AtomicU64,
    /// Pages written to disk.
    pub pages_written: AtomicU64,
}

impl BufferPoolStats {
    /// Create a new stats tracker with all counters at zero.
    pub fn new() -> Self {
        Self {
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            pages_read: AtomicU64::new(0),
            pages_written: AtomicU64::new(0),
        }
    }

    /// Cache hit rate in `[0.0, 1.0]`.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Take a non-atomic snapshot for display or comparison.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            pages_read: self.pages_read.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.pages_read.store(0, Ordering::Relaxed);
        self.pages_written.store(0, Ordering::Relaxed);
    }
}

impl Default for BufferPoolStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time copy of the buffer pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub pages_read: u64,
    pub pages_written: u64,
}

impl StatsSnapshot {
    /// Cache hit rate in `[0.0, 1.0]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stats {{ hits: {}, misses: {}, evictions: {}, hit_rate: {:.2}% }}",
            self.cache_hits,
            self.cache_misses,
            self.evictions,
            self.hit_rate() * 100.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate() {
        let stats = BufferPoolStats::new();
        assert_eq!(stats.hit_rate(), 0.0);

        stats.cache_hits.fetch_add(7, Ordering::Relaxed);
        stats.cache_misses.fetch_add(3, Ordering::Relaxed);
        assert_eq!(stats.hit_rate(), 0.7);
    }

    #[test]
    fn snapshot_and_reset() {
        let stats = BufferPoolStats::new();
        stats.cache_hits.fetch_add(80, Ordering::Relaxed);
        stats.cache_misses.fetch_add(20, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.cache_hits, 80);
        assert_eq!(snapshot.hit_rate(), 0.8);

        stats.reset();
        assert_eq!(stats.snapshot().cache_hits, 0);
    }

    #[test]
    fn display_format() {
        let stats = BufferPoolStats::new();
        stats.cache_hits.fetch_add(80, Ordering::Relaxed);
        stats.cache_misses.fetch_add(20, Ordering::Relaxed);

        let display = format!("{}", stats.snapshot());
        assert!(display.contains("hits: 80"));
        assert!(display.contains("80.00%"));
    }
}
