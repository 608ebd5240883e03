//! NUMA statistics tracking.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::types::{DomainId, MAX_DOMAINS};

// ============================================================================
// LIVE COUNTERS
// ============================================================================

/// Subsystem counters, updated lock-free
#[derive(Debug)]
#[repr(align(64))]
pub struct NumaStats {
    affinity_updates: AtomicU64,
    local_allocations: AtomicU64,
    remote_allocations: AtomicU64,
    allocations: [AtomicU64; MAX_DOMAINS],
    pages_moved: AtomicU64,
    move_failures: AtomicU64,
    migrate_calls: AtomicU64,
}

impl NumaStats {
    /// Zeroed counters
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            affinity_updates: ZERO,
            local_allocations: ZERO,
            remote_allocations: ZERO,
            allocations: [ZERO; MAX_DOMAINS],
            pages_moved: ZERO,
            move_failures: ZERO,
            migrate_calls: ZERO,
        }
    }

    /// Record an affinity record replacement
    #[inline]
    pub fn record_affinity_update(&self) {
        #[cfg(feature = "stats")]
        self.affinity_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a page allocated on `domain`; `local` when it is the
    /// allocating thread's own domain
    #[inline]
    pub fn record_allocation(&self, domain: DomainId, local: bool) {
        #[cfg(feature = "stats")]
        {
            if let Some(slot) = self.allocations.get(domain as usize) {
                slot.fetch_add(1, Ordering::Relaxed);
            }
            if local {
                self.local_allocations.fetch_add(1, Ordering::Relaxed);
            } else {
                self.remote_allocations.fetch_add(1, Ordering::Relaxed);
            }
        }
        #[cfg(not(feature = "stats"))]
        let _ = (domain, local);
    }

    /// Record the outcome of a page batch
    #[inline]
    pub fn record_moves(&self, moved: u64, failed: u64) {
        #[cfg(feature = "stats")]
        {
            self.pages_moved.fetch_add(moved, Ordering::Relaxed);
            self.move_failures.fetch_add(failed, Ordering::Relaxed);
        }
        #[cfg(not(feature = "stats"))]
        let _ = (moved, failed);
    }

    /// Record a `migrate_pages` call
    #[inline(always)]
    pub fn record_migrate_call(&self) {
        #[cfg(feature = "stats")]
        self.migrate_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy of the counters for the first `domain_count` domains
    pub fn snapshot(&self, domain_count: usize) -> NumaStatsSnapshot {
        let mut allocations = [0u64; MAX_DOMAINS];
        for (out, counter) in allocations
            .iter_mut()
            .zip(self.allocations.iter())
            .take(domain_count.min(MAX_DOMAINS))
        {
            *out = counter.load(Ordering::Relaxed);
        }
        NumaStatsSnapshot {
            domain_count: domain_count.min(MAX_DOMAINS),
            affinity_updates: self.affinity_updates.load(Ordering::Relaxed),
            local_allocations: self.local_allocations.load(Ordering::Relaxed),
            remote_allocations: self.remote_allocations.load(Ordering::Relaxed),
            allocations,
            pages_moved: self.pages_moved.load(Ordering::Relaxed),
            move_failures: self.move_failures.load(Ordering::Relaxed),
            migrate_calls: self.migrate_calls.load(Ordering::Relaxed),
        }
    }
}

impl Default for NumaStats {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Point-in-time copy of [`NumaStats`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumaStatsSnapshot {
    domain_count: usize,
    /// Affinity records replaced
    pub affinity_updates: u64,
    /// Pages allocated on the allocating thread's domain
    pub local_allocations: u64,
    /// Pages allocated elsewhere
    pub remote_allocations: u64,
    allocations: [u64; MAX_DOMAINS],
    /// Pages successfully relocated
    pub pages_moved: u64,
    /// Pages that could not be relocated
    pub move_failures: u64,
    /// `migrate_pages` invocations
    pub migrate_calls: u64,
}

impl NumaStatsSnapshot {
    /// Pages allocated per domain
    pub fn allocations(&self) -> &[u64] {
        &self.allocations[..self.domain_count]
    }

    /// Share of allocations that landed locally
    #[inline]
    pub fn local_ratio(&self) -> f64 {
        let total = self.local_allocations + self.remote_allocations;
        if total == 0 {
            1.0
        } else {
            self.local_allocations as f64 / total as f64
        }
    }
}
