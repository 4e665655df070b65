//! Dispatch loader bootstrap.
//!
//! The driver's dispatch table is process-wide state. A [`DispatchSlot`]
//! records who owns it: a device context claims the slot while it is alive,
//! and any second claim fails with [`GpuError::DoubleInit`] before the
//! driver is touched.

use crate::error::{GpuError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Ownership record for a driver's dispatch table.
#[derive(Debug)]
pub struct DispatchSlot {
    label: &'static str,
    claimed: AtomicBool,
    claims: AtomicU64,
}

impl DispatchSlot {
    /// Create an unclaimed slot.
    pub fn new(label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            label,
            claimed: AtomicBool::new(false),
            claims: AtomicU64::new(0),
        })
    }

    /// Take ownership of the dispatch table.
    pub fn claim(self: &Arc<Self>) -> Result<DispatchGuard> {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::error!("Dispatch table for {} is already claimed", self.label);
            return Err(GpuError::DoubleInit);
        }

        let generation = self.claims.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!("Dispatch table for {} claimed (#{generation})", self.label);

        Ok(DispatchGuard {
            slot: Arc::clone(self),
            generation,
        })
    }

    /// Whether a live guard holds this slot.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Number of successful claims over the slot's lifetime.
    pub fn claim_count(&self) -> u64 {
        self.claims.load(Ordering::Acquire)
    }

    /// Driver label.
    pub fn label(&self) -> &'static str {
        self.label
    }
}

/// Proof of dispatch table ownership. Releases the slot on drop.
#[derive(Debug)]
pub struct DispatchGuard {
    slot: Arc<DispatchSlot>,
    generation: u64,
}

impl DispatchGuard {
    /// Which claim this guard represents (1 for the first in the process).
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        self.slot.claimed.store(false, Ordering::Release);
        tracing::debug!(
            "Dispatch table for {} released (#{})",
            self.slot.label,
            self.generation
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_fails_while_first_is_alive() {
        let slot = DispatchSlot::new("test");
        let first = slot.claim().unwrap();

        assert!(matches!(slot.claim(), Err(GpuError::DoubleInit)));
        assert!(slot.is_claimed());
        assert_eq!(first.generation(), 1);
    }

    #[test]
    fn release_allows_reclaim() {
        let slot = DispatchSlot::new("test");
        drop(slot.claim().unwrap());

        assert!(!slot.is_claimed());
        let second = slot.claim().unwrap();
        assert_eq!(second.generation(), 2);
        assert_eq!(slot.claim_count(), 2);
    }
}
