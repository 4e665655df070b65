//! Synchronization primitives.

use crate::context::DeviceContext;
use crate::driver::Driver;
use crate::error::{GpuError, Result};
use ash::vk;
use std::time::Duration;

/// Convert a timeout to the nanosecond count the driver expects.
pub fn timeout_ns(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

/// Outcome of a bounded fence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWait {
    Signaled,
    TimedOut,
}

/// Wait for a fence, reporting a timeout as a value rather than an error.
///
/// # Safety
/// The fence must be live and created by the context's driver.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fence<D: Driver>(
    ctx: &DeviceContext<D>,
    fence: vk::Fence,
    timeout: Duration,
) -> Result<FenceWait> {
    // SAFETY: guaranteed live by the caller.
    match unsafe { ctx.driver().wait_for_fence(fence, timeout_ns(timeout)) } {
        Ok(()) => Ok(FenceWait::Signaled),
        Err(vk::Result::TIMEOUT) => Ok(FenceWait::TimedOut),
        Err(e) => Err(GpuError::from(e)),
    }
}

/// Frame synchronization resources.
#[derive(Debug)]
pub struct FrameSync {
    /// Semaphore signaled when the swapchain image is available
    pub image_available: vk::Semaphore,
    /// Fence signaled when the slot may be reused
    pub in_flight: vk::Fence,
}

impl FrameSync {
    /// Create frame synchronization resources. The fence starts signaled so
    /// the first wait returns immediately.
    pub fn new<D: Driver>(ctx: &DeviceContext<D>) -> Result<Self> {
        let driver = ctx.driver();
        let image_available = driver.create_semaphore()?;
        let in_flight = match driver.create_fence(true) {
            Ok(fence) => fence,
            Err(e) => {
                // SAFETY: created above and never used.
                unsafe { driver.destroy_semaphore(image_available) };
                return Err(e.into());
            }
        };

        Ok(Self {
            image_available,
            in_flight,
        })
    }

    /// Replace the fence with a fresh signaled one and the image-available
    /// semaphore with a fresh unsignaled one.
    ///
    /// Used when a submission that was meant to signal the fence and consume
    /// the acquire signal never reached the queue.
    ///
    /// # Safety
    /// The current fence must not be pending and no pending work may wait on
    /// the current image-available semaphore.
    pub unsafe fn rearm<D: Driver>(&mut self, ctx: &DeviceContext<D>) -> Result<()> {
        let driver = ctx.driver();
        let fence = driver.create_fence(true)?;
        let image_available = match driver.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(e) => {
                // SAFETY: created above and never used.
                unsafe { driver.destroy_fence(fence) };
                return Err(e.into());
            }
        };
        // SAFETY: neither object is referenced by pending work, per the caller.
        unsafe {
            driver.destroy_fence(self.in_flight);
            driver.destroy_semaphore(self.image_available);
        }
        self.in_flight = fence;
        self.image_available = image_available;
        Ok(())
    }

    /// Destroy synchronization resources.
    ///
    /// # Safety
    /// No pending work may reference the resources.
    pub unsafe fn destroy<D: Driver>(&self, ctx: &DeviceContext<D>) {
        let driver = ctx.driver();
        // SAFETY: idle, per the caller.
        unsafe {
            driver.destroy_semaphore(self.image_available);
            driver.destroy_fence(self.in_flight);
        }
    }
}
