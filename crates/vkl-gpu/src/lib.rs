//! GPU context and frame-execution core.
//!
//! This crate provides:
//! - Dispatch loader bootstrap guarded against double initialization
//! - Adapter selection and device context management
//! - Memory allocation behind a per-driver backend, with deferred deletion
//! - Swapchain creation and rebuild
//! - A frames-in-flight pipeline with bounded waits
//! - A Vulkan driver and a deterministic software driver behind one seam

pub mod capabilities;
pub mod command;
pub mod context;
pub mod deferred;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod frame;
pub mod memory;
pub mod runtime;
pub mod software;
pub mod swapchain;
pub mod sync;
pub mod vulkan;

pub use capabilities::{
    select_adapter, AdapterInfo, DeviceFeatures, DevicePreference, DeviceRequirements, GpuVendor,
    QueuePlan, TransferQueuePolicy,
};
pub use context::{DeviceContext, DeviceContextBuilder, QueueHandle, QueueRole};
pub use deferred::DeferredDeletionQueue;
pub use dispatch::{DispatchGuard, DispatchSlot};
pub use driver::{Driver, ImageDesc, InstanceDesc, SubmitDesc, VkResult};
pub use error::{ErrorClass, GpuError, Result};
pub use frame::{ActiveFrame, FramePipeline, FramePipelineConfig, SlotState};
pub use gpu_allocator::MemoryLocation;
pub use memory::{
    Allocation, AllocationDesc, AllocatorConfig, AllocatorStats, BoundResource, GpuAllocator,
    ManagedBackend, MemoryBackend, MemoryPlacement, MemoryRequest, PoolBackend, PoolStats,
};
pub use runtime::{GpuRuntime, GpuRuntimeConfig};
pub use software::{SoftwareAdapterDesc, SoftwareDriver, SoftwareProbe, SoftwareSurface};
pub use swapchain::{AcquiredImage, SwapchainConfig, SwapchainManager};
pub use sync::{FenceWait, FrameSync};
pub use vulkan::{VulkanDriver, WindowTarget};
