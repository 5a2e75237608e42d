//! Connection pool - idle transport handles kept for reuse per host
//!
//! The pool is a bounded deque ordered by the time handles were returned.
//! A handle is either pooled here or owned by exactly one transfer; moving
//! it in and out of the pool is what enforces that.

use std::collections::VecDeque;

/// Statistics for a connection pool
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Handles handed back out of the pool
    pub reused: usize,
    /// Acquisitions that found no handle for the host
    pub misses: usize,
    /// Handles destroyed to make room for a newer one
    pub evictions: usize,
    /// Handles destroyed because the pool holds nothing
    pub discarded: usize,
}

impl PoolStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.reused + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.reused as f64 / total as f64) * 100.0
        }
    }
}

struct PoolEntry<H> {
    handle: H,
    host: String,
}

/// Bounded pool of idle connection handles keyed by host
pub struct ConnectionPool<H> {
    entries: VecDeque<PoolEntry<H>>,
    max_size: usize,
    stats: PoolStats,
}

impl<H> ConnectionPool<H> {
    /// Create a pool holding at most `max_size` handles
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_size),
            max_size,
            stats: PoolStats::default(),
        }
    }

    /// Take the idle handle last used for `host`, if any
    pub fn acquire(&mut self, host: &str) -> Option<H> {
        match self.entries.iter().position(|e| e.host == host) {
            Some(idx) => {
                self.stats.reused += 1;
                self.entries.remove(idx).map(|e| e.handle)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Take the idle handle for `host`, or build a fresh one with `create`
    pub fn acquire_or_else<E>(
        &mut self,
        host: &str,
        create: impl FnOnce() -> Result<H, E>,
    ) -> Result<H, E> {
        match self.acquire(host) {
            Some(handle) => Ok(handle),
            None => create(),
        }
    }

    /// Offer a handle back after a transfer for `host` completed.
    ///
    /// When the pool is full the oldest entry is destroyed and the new
    /// handle takes its place as the newest.
    pub fn release(&mut self, handle: H, host: &str) {
        if self.max_size == 0 {
            self.stats.discarded += 1;
            drop(handle);
            return;
        }

        if self.entries.len() >= self.max_size {
            if let Some(oldest) = self.entries.pop_front() {
                self.stats.evictions += 1;
                log::debug!("evicting pooled handle for {}", oldest.host);
                drop(oldest);
            }
        }

        self.entries.push_back(PoolEntry {
            handle,
            host: host.to_string(),
        });
    }

    /// Destroy every pooled handle
    pub fn flush(&mut self) {
        let count = self.entries.len();
        self.entries.clear();
        if count > 0 {
            log::debug!("flushed {} pooled handles", count);
        }
    }

    /// Number of idle handles
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Hosts of the pooled handles, oldest first
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.host.as_str())
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}
