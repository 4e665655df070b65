//! Command buffer management.

use crate::context::DeviceContext;
use crate::driver::Driver;
use crate::error::Result;
use ash::vk;

/// Command pool for allocating command buffers.
#[derive(Debug)]
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    pub fn new<D: Driver>(ctx: &DeviceContext<D>, queue_family: u32) -> Result<Self> {
        let pool = ctx.driver().create_command_pool(queue_family)?;
        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate primary command buffers.
    pub fn allocate<D: Driver>(
        &self,
        ctx: &DeviceContext<D>,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        // SAFETY: the pool belongs to the context's driver.
        let buffers = unsafe { ctx.driver().allocate_command_buffers(self.pool, count)? };
        Ok(buffers)
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// No command buffer from this pool may be pending.
    pub unsafe fn destroy<D: Driver>(&self, ctx: &DeviceContext<D>) {
        // SAFETY: nothing from the pool is pending, per the caller.
        unsafe { ctx.driver().destroy_command_pool(self.pool) };
    }
}
