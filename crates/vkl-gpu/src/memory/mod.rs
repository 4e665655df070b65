//! GPU memory management.
//!
//! [`GpuAllocator`] turns "N bytes of usage class U for this kind of
//! resource" into a buffer or image bound to device memory. Usage classes
//! are [`MemoryLocation`]s: `GpuOnly` is device-local, `CpuToGpu`
//! host-visible and `GpuToCpu` host-cached.
//!
//! Where the memory comes from is up to the driver's [`MemoryBackend`]:
//! the Vulkan driver hands placement to `gpu_allocator`, the software
//! driver sub-allocates its own blocks.

mod managed;
mod pool;

pub use managed::ManagedBackend;
pub use pool::{find_memory_type, PoolBackend};

use crate::capabilities::AdapterInfo;
use crate::context::DeviceContext;
use crate::driver::{Driver, ImageDesc};
use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::{AllocatorDebugSettings, MemoryLocation};
use hashbrown::HashMap;
use std::backtrace::Backtrace;
use std::ptr::NonNull;

const MIB: u64 = 1024 * 1024;

/// Allocator tuning.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorConfig {
    /// Block size for device-local pools.
    pub device_block_size: u64,
    /// Block size for host-visible pools.
    pub host_block_size: u64,
    /// Requests at or above this size get their own block.
    pub dedicated_threshold: u64,
    pub debug_settings: AllocatorDebugSettings,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            device_block_size: 256 * MIB,
            host_block_size: 64 * MIB,
            dedicated_threshold: 32 * MIB,
            debug_settings: AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
        }
    }
}

impl AllocatorConfig {
    /// Set both block sizes.
    pub fn with_block_sizes(mut self, device: u64, host: u64) -> Self {
        self.device_block_size = device;
        self.host_block_size = host;
        self
    }

    /// Set the dedicated-block threshold.
    pub fn with_dedicated_threshold(mut self, bytes: u64) -> Self {
        self.dedicated_threshold = bytes;
        self
    }

    /// Replace the debug settings.
    pub fn with_debug_settings(mut self, settings: AllocatorDebugSettings) -> Self {
        self.debug_settings = settings;
        self
    }
}

/// What to create and bind.
#[derive(Debug, Clone, Copy)]
pub enum ResourceKind {
    Buffer { usage: vk::BufferUsageFlags },
    Image(ImageDesc),
}

/// An allocation request.
#[derive(Debug, Clone)]
pub struct AllocationDesc<'a> {
    pub name: &'a str,
    /// Buffer size in bytes; images take their size from the driver.
    pub size: u64,
    pub location: MemoryLocation,
    pub kind: ResourceKind,
}

impl<'a> AllocationDesc<'a> {
    /// A buffer of `size` bytes.
    pub fn buffer(
        name: &'a str,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Self {
        Self {
            name,
            size,
            location,
            kind: ResourceKind::Buffer { usage },
        }
    }

    /// An image described by `desc`.
    pub fn image(name: &'a str, desc: ImageDesc, location: MemoryLocation) -> Self {
        Self {
            name,
            size: 0,
            location,
            kind: ResourceKind::Image(desc),
        }
    }
}

/// The resource an allocation backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundResource {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

/// A buffer or image bound to a region of pooled memory.
///
/// Must be returned with [`GpuAllocator::free`] (or retired through the
/// deferred deletion queue) once no GPU work references it.
#[must_use = "allocations must be freed through the allocator"]
#[derive(Debug)]
pub struct Allocation {
    id: u64,
    resource: BoundResource,
    memory: vk::DeviceMemory,
    offset: u64,
    size: u64,
    location: MemoryLocation,
    mapped: Option<NonNull<u8>>,
}

// SAFETY: the mapped pointer refers to device memory owned by the backend,
// not to thread-local data.
unsafe impl Send for Allocation {}

impl Allocation {
    /// Unique id within the allocator.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The bound resource.
    pub fn resource(&self) -> BoundResource {
        self.resource
    }

    /// The buffer handle, if this backs a buffer.
    pub fn buffer(&self) -> Option<vk::Buffer> {
        match self.resource {
            BoundResource::Buffer(buffer) => Some(buffer),
            BoundResource::Image(_) => None,
        }
    }

    /// The image handle, if this backs an image.
    pub fn image(&self) -> Option<vk::Image> {
        match self.resource {
            BoundResource::Image(image) => Some(image),
            BoundResource::Buffer(_) => None,
        }
    }

    /// Device memory the resource is bound to.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Offset inside that memory.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Requested size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Usage class.
    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    /// Host pointer to the start of the allocation, for host-visible memory.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped
    }

    /// Write data to the allocation (must be host-visible).
    pub fn write<T: Copy>(&self, data: &[T]) -> Result<()> {
        let bytes = std::mem::size_of_val(data);
        // SAFETY: `T: Copy` has no drop glue and the slice covers `bytes` bytes.
        let raw = unsafe { std::slice::from_raw_parts(data.as_ptr().cast::<u8>(), bytes) };
        self.write_bytes(0, raw)
    }

    /// Write raw bytes at `offset` (must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped
            .ok_or_else(|| GpuError::InvalidState("Allocation is not host-visible".to_string()))?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(format!(
                "Write of {} bytes at {offset} exceeds allocation of {} bytes",
                data.len(),
                self.size
            )));
        }

        // SAFETY: the mapping covers `size` bytes from `ptr` and the range was checked.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                ptr.as_ptr().add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }
}

/// Accounting for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub memory_type: u32,
    pub linear: bool,
    pub blocks: usize,
    pub reserved_bytes: u64,
    pub used_bytes: u64,
    pub allocations: u32,
    pub largest_free_range: u64,
}

/// Accounting across all pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocatorStats {
    pub blocks: usize,
    pub reserved_bytes: u64,
    pub used_bytes: u64,
    pub allocations: usize,
}

/// Memory needed for one freshly created resource.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRequest<'a> {
    /// Allocation id, used again to free the memory.
    pub id: u64,
    pub name: &'a str,
    pub requirements: vk::MemoryRequirements,
    pub location: MemoryLocation,
    /// Buffers and linear images; optimal-tiling images are not linear.
    pub linear: bool,
    /// The unbound resource, for dedicated allocations.
    pub resource: BoundResource,
}

/// Where a request landed.
#[derive(Debug, Clone, Copy)]
pub struct MemoryPlacement {
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    /// Host pointer to `offset`, for host-visible memory.
    pub mapped: Option<NonNull<u8>>,
}

/// Source of device memory for a [`GpuAllocator`].
///
/// Each driver names its backend through [`Driver::Memory`]. The allocator
/// creates and binds resources; the backend only places memory.
pub trait MemoryBackend<D>: Send + std::fmt::Debug {
    /// Create the backend once the device exists.
    fn create(driver: &D, adapter: &AdapterInfo, config: &AllocatorConfig) -> Result<Self>
    where
        Self: Sized;

    /// Place memory for `request`.
    fn allocate(&mut self, driver: &D, request: &MemoryRequest<'_>) -> Result<MemoryPlacement>;

    /// Release the memory placed for allocation `id`.
    ///
    /// Nothing bound to it may be referenced by pending work.
    fn free(&mut self, driver: &D, id: u64) -> Result<()>;

    /// Accounting across everything the backend holds.
    fn stats(&self) -> AllocatorStats;

    /// Accounting per pool, where the backend pools memory itself.
    fn pool_stats(&self) -> Vec<PoolStats> {
        Vec::new()
    }

    /// Release all memory. Must run before the device is destroyed.
    fn shutdown(&mut self, driver: &D);
}

#[derive(Debug)]
struct LiveAllocation {
    name: String,
    size: u64,
    location: MemoryLocation,
    resource: BoundResource,
    backtrace: Option<Backtrace>,
}

/// GPU memory allocator.
///
/// Mutation takes `&mut self`; sharing across threads goes through a lock
/// held by the owner.
pub struct GpuAllocator<D: Driver> {
    config: AllocatorConfig,
    backend: D::Memory,
    live: HashMap<u64, LiveAllocation>,
    next_id: u64,
    shut_down: bool,
}

impl<D: Driver> GpuAllocator<D> {
    /// Create a new allocator for the context's device.
    pub fn new(ctx: &DeviceContext<D>, config: AllocatorConfig) -> Result<Self> {
        let backend =
            <D::Memory as MemoryBackend<D>>::create(ctx.driver(), ctx.adapter(), &config)?;

        Ok(Self {
            config,
            backend,
            live: HashMap::new(),
            next_id: 1,
            shut_down: false,
        })
    }

    /// Create a resource and bind it to memory of the requested usage class.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn allocate(
        &mut self,
        ctx: &DeviceContext<D>,
        desc: &AllocationDesc<'_>,
    ) -> Result<Allocation> {
        if self.shut_down {
            return Err(GpuError::InvalidState("Allocator has been shut down".to_string()));
        }

        let driver = ctx.driver();

        let (resource, requirements, linear) = match desc.kind {
            ResourceKind::Buffer { usage } => {
                if desc.size == 0 {
                    return Err(GpuError::InvalidState(format!(
                        "Zero-sized buffer '{}'",
                        desc.name
                    )));
                }
                let buffer = driver.create_buffer(desc.size, usage)?;
                // SAFETY: created above.
                let requirements = unsafe { driver.buffer_requirements(buffer) };
                (BoundResource::Buffer(buffer), requirements, true)
            }
            ResourceKind::Image(image_desc) => {
                let image = driver.create_image(&image_desc)?;
                // SAFETY: created above.
                let requirements = unsafe { driver.image_requirements(image) };
                let linear = image_desc.tiling == vk::ImageTiling::LINEAR;
                (BoundResource::Image(image), requirements, linear)
            }
        };

        let size = match desc.kind {
            ResourceKind::Buffer { .. } => desc.size,
            ResourceKind::Image(_) => requirements.size,
        };

        let id = self.next_id;
        self.next_id += 1;

        let request = MemoryRequest {
            id,
            name: desc.name,
            requirements,
            location: desc.location,
            linear,
            resource,
        };
        let placement = match self.backend.allocate(driver, &request) {
            Ok(placement) => placement,
            Err(e) => {
                // SAFETY: the resource is unbound and unused.
                unsafe { destroy_resource(driver, resource) };
                return Err(e);
            }
        };

        // SAFETY: the resource and the memory were both created by this driver,
        // and the backend placed the range for exactly these requirements.
        let bound = unsafe {
            match resource {
                BoundResource::Buffer(buffer) => {
                    driver.bind_buffer_memory(buffer, placement.memory, placement.offset)
                }
                BoundResource::Image(image) => {
                    driver.bind_image_memory(image, placement.memory, placement.offset)
                }
            }
        };
        if let Err(e) = bound {
            // SAFETY: binding failed, so nothing uses the resource or the range.
            unsafe { destroy_resource(driver, resource) };
            if let Err(free_error) = self.backend.free(driver, id) {
                tracing::warn!("Releasing memory of unbound '{}' failed: {free_error}", desc.name);
            }
            return Err(e.into());
        }

        if self.config.debug_settings.log_allocations {
            tracing::debug!(
                "Allocated '{}' #{id}: {size} bytes ({:?}) @ {:?}+{}",
                desc.name,
                desc.location,
                placement.memory,
                placement.offset
            );
        }

        let backtrace = self
            .config
            .debug_settings
            .store_stack_traces
            .then(Backtrace::force_capture);
        self.live.insert(
            id,
            LiveAllocation {
                name: desc.name.to_string(),
                size,
                location: desc.location,
                resource,
                backtrace,
            },
        );

        Ok(Allocation {
            id,
            resource,
            memory: placement.memory,
            offset: placement.offset,
            size,
            location: desc.location,
            mapped: placement.mapped,
        })
    }

    /// Destroy the resource and return its memory to the backend.
    ///
    /// The caller guarantees no pending GPU work references the resource.
    pub fn free(&mut self, ctx: &DeviceContext<D>, allocation: Allocation) -> Result<()> {
        let Some(live) = self.live.remove(&allocation.id) else {
            return Err(GpuError::InvalidState(format!(
                "Allocation #{} is not live",
                allocation.id
            )));
        };

        if self.config.debug_settings.log_frees {
            tracing::debug!("Freeing '{}' #{}", live.name, allocation.id);
        }

        // SAFETY: the caller guarantees the resource is idle; it was created by this driver.
        unsafe { destroy_resource(ctx.driver(), allocation.resource) };

        self.backend.free(ctx.driver(), allocation.id)
    }

    /// Accounting across all memory held.
    pub fn stats(&self) -> AllocatorStats {
        self.backend.stats()
    }

    /// Accounting per pool; empty when the backend does not expose pools.
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.backend.pool_stats()
    }

    /// Number of allocations not yet freed.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Release all memory, reporting allocations that were never freed.
    ///
    /// Must run before the device is destroyed, after all GPU work completed.
    pub fn shutdown(&mut self, ctx: &DeviceContext<D>) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        let debug = self.config.debug_settings;
        for (id, live) in self.live.drain() {
            if debug.log_leaks_on_shutdown {
                tracing::warn!(
                    "Leaked allocation '{}' #{id}: {} bytes ({:?})",
                    live.name,
                    live.size,
                    live.location
                );
                if debug.log_stack_traces {
                    if let Some(backtrace) = &live.backtrace {
                        tracing::warn!("Allocated at:\n{backtrace}");
                    }
                }
            }
            // SAFETY: all GPU work has completed; the resource came from this driver.
            unsafe { destroy_resource(ctx.driver(), live.resource) };
        }

        self.backend.shutdown(ctx.driver());
        tracing::debug!("GPU allocator shut down");
    }
}

impl<D: Driver> Drop for GpuAllocator<D> {
    fn drop(&mut self) {
        if !self.shut_down && (!self.live.is_empty() || self.backend.stats().blocks > 0) {
            tracing::error!(
                "GpuAllocator dropped without shutdown; {} allocations and {} blocks leaked",
                self.live.len(),
                self.backend.stats().blocks
            );
        }
    }
}

impl<D: Driver> std::fmt::Debug for GpuAllocator<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuAllocator")
            .field("backend", &self.backend)
            .field("live", &self.live.len())
            .field("shut_down", &self.shut_down)
            .finish_non_exhaustive()
    }
}

/// # Safety
/// The resource must be idle and created by `driver`.
unsafe fn destroy_resource<D: Driver>(driver: &D, resource: BoundResource) {
    // SAFETY: guaranteed by the caller.
    unsafe {
        match resource {
            BoundResource::Buffer(buffer) => driver.destroy_buffer(buffer),
            BoundResource::Image(image) => driver.destroy_image(image),
        }
    }
}
