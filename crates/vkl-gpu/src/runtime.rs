//! Ownership chain for the GPU core.
//!
//! [`GpuRuntime`] owns the device context, allocator, deferred deletion
//! queue, swapchain and frame pipeline, and is the only place that knows the
//! order they are torn down in.

use crate::context::{DeviceContext, DeviceContextBuilder};
use crate::deferred::DeferredDeletionQueue;
use crate::driver::Driver;
use crate::error::Result;
use crate::frame::{ActiveFrame, FramePipeline, FramePipelineConfig};
use crate::memory::{
    Allocation, AllocationDesc, AllocatorConfig, AllocatorStats, GpuAllocator, PoolStats,
};
use crate::swapchain::{SwapchainConfig, SwapchainManager};
use ash::vk;
use parking_lot::{Mutex, MutexGuard};

/// Configuration of every component the runtime builds.
#[derive(Debug, Clone, Copy, Default)]
pub struct GpuRuntimeConfig {
    pub allocator: AllocatorConfig,
    pub swapchain: SwapchainConfig,
    pub frames: FramePipelineConfig,
}

impl GpuRuntimeConfig {
    pub fn with_allocator(mut self, config: AllocatorConfig) -> Self {
        self.allocator = config;
        self
    }

    pub fn with_swapchain(mut self, config: SwapchainConfig) -> Self {
        self.swapchain = config;
        self
    }

    pub fn with_frames(mut self, config: FramePipelineConfig) -> Self {
        self.frames = config;
        self
    }
}

/// The GPU core, torn down in strict reverse creation order.
pub struct GpuRuntime<D: Driver> {
    frames: FramePipeline,
    swapchain: SwapchainManager,
    deferred: DeferredDeletionQueue,
    allocator: Mutex<GpuAllocator<D>>,
    torn_down: bool,
    // Declared last so it drops after everything built from it
    ctx: DeviceContext<D>,
}

impl<D: Driver> GpuRuntime<D> {
    /// Build the context and every component on top of it.
    ///
    /// A failure at any stage releases what was already built.
    pub fn new(
        driver: D,
        target: &D::SurfaceTarget,
        context: DeviceContextBuilder,
        config: GpuRuntimeConfig,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let ctx = context.build(driver, target)?;
        let mut allocator = GpuAllocator::new(&ctx, config.allocator)?;

        let mut swapchain = match SwapchainManager::create(&ctx, config.swapchain, extent) {
            Ok(swapchain) => swapchain,
            Err(e) => {
                allocator.shutdown(&ctx);
                return Err(e);
            }
        };

        let frames = match FramePipeline::new(&ctx, config.frames) {
            Ok(frames) => frames,
            Err(e) => {
                // SAFETY: no work was submitted yet.
                unsafe { swapchain.destroy(&ctx) };
                allocator.shutdown(&ctx);
                return Err(e);
            }
        };

        tracing::info!("GPU runtime ready on {}", ctx.adapter().name);

        Ok(Self {
            frames,
            swapchain,
            deferred: DeferredDeletionQueue::new(),
            allocator: Mutex::new(allocator),
            torn_down: false,
            ctx,
        })
    }

    pub fn context(&self) -> &DeviceContext<D> {
        &self.ctx
    }

    pub fn swapchain(&self) -> &SwapchainManager {
        &self.swapchain
    }

    pub fn frames(&self) -> &FramePipeline {
        &self.frames
    }

    /// Lock the allocator for direct use.
    pub fn allocator(&self) -> MutexGuard<'_, GpuAllocator<D>> {
        self.allocator.lock()
    }

    /// Start a frame and free deferred allocations whose frames completed.
    pub fn begin_frame(&mut self) -> Result<ActiveFrame> {
        let frame = self.frames.begin_frame(&self.ctx, &self.swapchain)?;
        self.process_deferred()?;
        Ok(frame)
    }

    /// Record into the open frame.
    pub fn record<R>(
        &mut self,
        recorder: impl FnOnce(&DeviceContext<D>, &ActiveFrame) -> R,
    ) -> Result<R> {
        self.frames.record(&self.ctx, recorder)
    }

    /// Submit and present the open frame.
    pub fn end_frame(&mut self) -> Result<()> {
        self.frames.end_frame(&self.ctx, &self.swapchain)
    }

    /// Retire the open frame without presenting it.
    pub fn cancel_frame(&mut self) -> Result<()> {
        self.frames.cancel_frame(&self.ctx)
    }

    /// Drain in-flight frames and rebuild the swapchain at `extent`.
    pub fn rebuild(&mut self, extent: vk::Extent2D) -> Result<()> {
        self.drain()?;
        self.swapchain.rebuild(&self.ctx, extent)
    }

    /// Wait for all in-flight frames, then free what they retired.
    pub fn drain(&mut self) -> Result<()> {
        let timeout = self.frames.config().frame_timeout;
        self.frames.drain(&self.ctx, timeout)?;
        self.process_deferred()
    }

    /// Allocate a resource.
    pub fn allocate(&self, desc: &AllocationDesc<'_>) -> Result<Allocation> {
        self.allocator.lock().allocate(&self.ctx, desc)
    }

    /// Free an allocation no pending work references.
    pub fn free(&self, allocation: Allocation) -> Result<()> {
        self.allocator.lock().free(&self.ctx, allocation)
    }

    /// Free an allocation once every frame up to the current one has completed.
    pub fn retire(&mut self, allocation: Allocation) {
        self.deferred.retire(allocation, self.frames.frame_number());
    }

    pub fn allocator_stats(&self) -> AllocatorStats {
        self.allocator.lock().stats()
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.allocator.lock().pool_stats()
    }

    /// Allocations waiting in the deferred deletion queue.
    pub fn deferred_pending(&self) -> usize {
        self.deferred.pending_count()
    }

    /// Tear everything down, destroying the device context last.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn process_deferred(&mut self) -> Result<()> {
        let completed = self.frames.completed_frame();
        self.deferred
            .process(&self.ctx, self.allocator.get_mut(), completed)?;
        Ok(())
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        tracing::info!("Shutting down GPU runtime");

        let timeout = self.frames.config().frame_timeout;
        if let Err(e) = self.frames.drain(&self.ctx, timeout) {
            tracing::warn!("Frame drain failed during shutdown: {e}");
        }
        // Also covers presentations, which no slot fence tracks
        if let Err(e) = self.ctx.wait_idle() {
            tracing::warn!("Device wait idle failed during shutdown: {e}");
        }

        // SAFETY: all frame work has completed or the device is lost.
        unsafe { self.frames.destroy(&self.ctx) };

        let allocator = self.allocator.get_mut();
        if let Err(e) = self.deferred.flush(&self.ctx, allocator) {
            tracing::warn!("Deferred deletion flush failed during shutdown: {e}");
        }

        // SAFETY: no frame references the swapchain images any more.
        unsafe { self.swapchain.destroy(&self.ctx) };

        allocator.shutdown(&self.ctx);
        tracing::debug!("GPU runtime components released");
    }
}

impl<D: Driver> Drop for GpuRuntime<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<D: Driver> std::fmt::Debug for GpuRuntime<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuRuntime")
            .field("ctx", &self.ctx)
            .field("swapchain_generation", &self.swapchain.generation())
            .field("frame", &self.frames.frame_number())
            .finish_non_exhaustive()
    }
}
