//! Allocation counters.
//!
//! Plain atomics; the exporter that scrapes them lives outside the core.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct IpamMetrics {
    allocation_rollback_failures: AtomicU64,
}

impl IpamMetrics {
    /// Records a failed rollback after a partial allocation. The original
    /// allocation error is still what the caller sees.
    pub fn inc_allocation_rollback_failures(&self) {
        self.allocation_rollback_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn allocation_rollback_failures(&self) -> u64 {
        self.allocation_rollback_failures.load(Ordering::Relaxed)
    }
}
