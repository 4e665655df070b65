//! Driver seam.
//!
//! [`Driver`] is the set of graphics-API calls the core is built on. The
//! Vulkan implementation lives in [`crate::vulkan`]; [`crate::software`]
//! provides a deterministic software adapter for tests and headless tools.
//!
//! Handles crossing the seam are plain `ash::vk` handles. Methods that take a
//! handle are `unsafe`: the handle must have been created by the same driver
//! and not yet destroyed.
//!
//! Each driver also names the [`MemoryBackend`] that places device memory
//! for it.

use crate::capabilities::{AdapterInfo, QueuePlan};
use crate::dispatch::DispatchSlot;
use crate::error::Result;
use crate::memory::MemoryBackend;
use ash::vk;
use std::ptr::NonNull;
use std::sync::Arc;

/// Raw driver result, with `vk::Result` codes left unclassified.
pub type VkResult<T> = std::result::Result<T, vk::Result>;

/// Instance creation parameters.
#[derive(Debug, Clone)]
pub struct InstanceDesc {
    pub app_name: String,
    pub engine_name: String,
    pub api_version: u32,
    pub validation: bool,
}

impl Default for InstanceDesc {
    fn default() -> Self {
        Self {
            app_name: "vkl".to_string(),
            engine_name: "vkl".to_string(),
            api_version: vk::API_VERSION_1_3,
            validation: cfg!(debug_assertions),
        }
    }
}

/// Surface properties relevant to swapchain creation.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Swapchain creation parameters.
#[derive(Debug, Clone)]
pub struct SwapchainDesc {
    pub surface: vk::SurfaceKHR,
    pub min_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    /// Queue families sharing the images; more than one means concurrent sharing.
    pub queue_families: Vec<u32>,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
    pub old_swapchain: vk::SwapchainKHR,
}

/// A single queue submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitDesc {
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub signal_semaphores: Vec<vk::Semaphore>,
}

/// Image creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub tiling: vk::ImageTiling,
}

impl ImageDesc {
    /// A single-mip 2D image.
    pub fn new_2d(width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            format,
            usage,
            mip_levels: 1,
            array_layers: 1,
            tiling: vk::ImageTiling::OPTIMAL,
        }
    }
}

/// Graphics driver used by the core.
pub trait Driver: Sized {
    /// What the platform hands over to create a presentation surface.
    type SurfaceTarget;

    /// Where allocations made on this driver get their memory.
    type Memory: MemoryBackend<Self>;

    /// Driver name for logs.
    fn name(&self) -> &'static str;

    /// The slot recording ownership of this driver's dispatch table.
    fn dispatch_slot(&self) -> Arc<DispatchSlot>;

    /// Populate the dispatch table and create the API instance.
    fn bootstrap(&mut self, desc: &InstanceDesc, target: &Self::SurfaceTarget) -> Result<()>;

    /// Create a presentation surface for `target`.
    fn create_surface(&mut self, target: &Self::SurfaceTarget) -> Result<vk::SurfaceKHR>;

    /// Describe every adapter, with present support evaluated against `surface`.
    ///
    /// # Safety
    /// `surface` must be live.
    unsafe fn enumerate_adapters(&self, surface: vk::SurfaceKHR) -> Result<Vec<AdapterInfo>>;

    /// Create the logical device with one queue per family in `plan`.
    fn create_device(
        &mut self,
        adapter: &AdapterInfo,
        plan: &QueuePlan,
        extensions: &[String],
    ) -> Result<()>;

    /// Get a queue of a family the device was created with.
    fn queue(&self, family: u32, index: u32) -> Result<vk::Queue>;

    /// Block until all submitted work has completed.
    fn device_wait_idle(&self) -> VkResult<()>;

    /// Destroy a surface.
    ///
    /// # Safety
    /// No swapchain may still reference the surface.
    unsafe fn destroy_surface(&mut self, surface: vk::SurfaceKHR);

    /// Destroy the logical device and the instance. Idempotent.
    ///
    /// # Safety
    /// Every object created from the device must already be destroyed.
    unsafe fn destroy(&mut self);

    /// Query surface capabilities for an adapter.
    ///
    /// # Safety
    /// Both handles must be live.
    unsafe fn surface_support(
        &self,
        adapter: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> VkResult<SurfaceSupport>;

    /// Create a swapchain.
    ///
    /// # Safety
    /// The surface and, if set, the old swapchain must be live.
    unsafe fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR>;

    /// Images owned by a swapchain, in index order.
    ///
    /// # Safety
    /// The swapchain must be live.
    unsafe fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;

    /// # Safety
    /// The swapchain must not be in use by pending work.
    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    /// Create a color view of a 2D image.
    ///
    /// # Safety
    /// The image must be live.
    unsafe fn create_image_view(&self, image: vk::Image, format: vk::Format)
        -> VkResult<vk::ImageView>;

    /// # Safety
    /// The view must not be in use by pending work.
    unsafe fn destroy_image_view(&self, view: vk::ImageView);

    /// Acquire the next presentable image, signalling `semaphore` when it is ready.
    /// Returns the image index and whether the swapchain is suboptimal.
    ///
    /// # Safety
    /// Both handles must be live and the semaphore unsignaled with no pending signal.
    unsafe fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;

    /// Queue an image for presentation after `wait_semaphores`. Returns whether
    /// the swapchain is suboptimal.
    ///
    /// # Safety
    /// All handles must be live and the image acquired.
    unsafe fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool>;

    /// Create a binary semaphore.
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;

    /// # Safety
    /// No pending work may wait on or signal the semaphore.
    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Create a fence, optionally already signaled.
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;

    /// # Safety
    /// The fence must not be pending.
    unsafe fn destroy_fence(&self, fence: vk::Fence);

    /// Wait for a fence. Returns `Err(vk::Result::TIMEOUT)` on timeout.
    ///
    /// # Safety
    /// The fence must be live.
    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;

    /// Whether the fence is signaled, without blocking.
    ///
    /// # Safety
    /// The fence must be live.
    unsafe fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;

    /// # Safety
    /// The fence must be live and not pending.
    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    /// Create a command pool whose buffers can be reset individually.
    fn create_command_pool(&self, queue_family: u32) -> VkResult<vk::CommandPool>;

    /// # Safety
    /// No buffer from the pool may be pending.
    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);

    /// Allocate primary command buffers.
    ///
    /// # Safety
    /// The pool must be live.
    unsafe fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>>;

    /// Reset and begin a one-time-submit recording.
    ///
    /// # Safety
    /// The buffer must be live and not pending.
    unsafe fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    /// # Safety
    /// The buffer must be recording.
    unsafe fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    /// Submit work, signalling `fence` on completion unless it is null.
    ///
    /// # Safety
    /// All handles must be live, command buffers executable and a non-null fence unsignaled.
    unsafe fn queue_submit(&self, queue: vk::Queue, submit: &SubmitDesc, fence: vk::Fence)
        -> VkResult<()>;

    /// Allocate a raw block of device memory.
    fn allocate_memory(&self, memory_type: u32, size: u64) -> VkResult<vk::DeviceMemory>;

    /// # Safety
    /// Nothing may still be bound to or mapped from the memory.
    unsafe fn free_memory(&self, memory: vk::DeviceMemory);

    /// Map the whole block for host access.
    ///
    /// # Safety
    /// The memory must be live, host-visible and not already mapped.
    unsafe fn map_memory(&self, memory: vk::DeviceMemory, size: u64) -> VkResult<NonNull<u8>>;

    /// Create an unbound buffer.
    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer>;

    /// # Safety
    /// The buffer must be live.
    unsafe fn buffer_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;

    /// # Safety
    /// Both handles must be live and the range inside the memory block.
    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()>;

    /// # Safety
    /// The buffer must not be in use by pending work.
    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);

    /// Create an unbound image.
    fn create_image(&self, desc: &ImageDesc) -> VkResult<vk::Image>;

    /// # Safety
    /// The image must be live.
    unsafe fn image_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;

    /// # Safety
    /// Both handles must be live and the range inside the memory block.
    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()>;

    /// # Safety
    /// The image must not be in use by pending work.
    unsafe fn destroy_image(&self, image: vk::Image);
}
