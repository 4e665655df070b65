//! Deferred resource deletion for multi-frame-in-flight rendering.
//!
//! An allocation retired during frame `n` may still be referenced by that
//! frame's GPU work. It is queued with `n` and freed once the frame pipeline
//! reports frame `n` complete.

use crate::context::DeviceContext;
use crate::driver::Driver;
use crate::error::Result;
use crate::memory::{Allocation, GpuAllocator};
use std::collections::VecDeque;

/// An allocation pending deletion.
#[derive(Debug)]
pub struct PendingDeletion {
    pub allocation: Allocation,
    /// Frame number current when the allocation was retired.
    pub frame_retired: u64,
}

/// Queue for deferred allocation frees.
#[derive(Debug, Default)]
pub struct DeferredDeletionQueue {
    pending: VecDeque<PendingDeletion>,
}

impl DeferredDeletionQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Retire an allocation referenced by work of `frame_number`.
    pub fn retire(&mut self, allocation: Allocation, frame_number: u64) {
        // Keep the queue sorted so only the front can mature
        let index = self
            .pending
            .partition_point(|p| p.frame_retired <= frame_number);
        self.pending.insert(
            index,
            PendingDeletion {
                allocation,
                frame_retired: frame_number,
            },
        );
    }

    /// Free every allocation whose frame is known complete.
    ///
    /// Returns the number freed. Stops at the first error, leaving the rest queued.
    pub fn process<D: Driver>(
        &mut self,
        ctx: &DeviceContext<D>,
        allocator: &mut GpuAllocator<D>,
        completed_frame: Option<u64>,
    ) -> Result<usize> {
        let Some(completed) = completed_frame else {
            return Ok(0);
        };

        let mut freed = 0;
        while matches!(self.pending.front(), Some(p) if p.frame_retired <= completed) {
            let Some(pending) = self.pending.pop_front() else {
                break;
            };
            allocator.free(ctx, pending.allocation)?;
            freed += 1;
        }

        if freed > 0 {
            tracing::trace!("Freed {freed} deferred allocations (completed frame {completed})");
        }
        Ok(freed)
    }

    /// Free everything immediately.
    ///
    /// Only valid once all GPU work has completed, e.g. after draining.
    pub fn flush<D: Driver>(
        &mut self,
        ctx: &DeviceContext<D>,
        allocator: &mut GpuAllocator<D>,
    ) -> Result<()> {
        while let Some(pending) = self.pending.pop_front() {
            allocator.free(ctx, pending.allocation)?;
        }
        Ok(())
    }

    /// Number of allocations waiting.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DeviceContextBuilder;
    use crate::memory::{AllocationDesc, AllocatorConfig};
    use crate::software::{SoftwareDriver, SoftwareSurface};
    use ash::vk;
    use gpu_allocator::MemoryLocation;

    fn buffer(name: &str) -> AllocationDesc<'_> {
        AllocationDesc::buffer(
            name,
            4096,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::GpuOnly,
        )
    }

    #[test]
    fn frees_only_completed_frames_in_order() {
        let driver = SoftwareDriver::default();
        let ctx = DeviceContextBuilder::new()
            .build(driver, &SoftwareSurface::default())
            .unwrap();
        let mut allocator = GpuAllocator::new(&ctx, AllocatorConfig::default()).unwrap();
        let mut queue = DeferredDeletionQueue::new();

        let late = allocator.allocate(&ctx, &buffer("late")).unwrap();
        let early = allocator.allocate(&ctx, &buffer("early")).unwrap();
        queue.retire(late, 3);
        queue.retire(early, 1);

        assert_eq!(queue.process(&ctx, &mut allocator, None).unwrap(), 0);
        assert_eq!(queue.process(&ctx, &mut allocator, Some(2)).unwrap(), 1);
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(allocator.live_count(), 1);

        queue.flush(&ctx, &mut allocator).unwrap();
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(allocator.live_count(), 0);
        allocator.shutdown(&ctx);
    }
}
