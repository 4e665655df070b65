//! Deterministic software adapter.
//!
//! [`SoftwareDriver`] implements the driver seam without a GPU. Submitted
//! work completes in submission order, and only when the CPU waits for it,
//! so "in flight" is directly observable. Misuse that a validation layer
//! would flag is recorded as a violation instead of crashing. A
//! [`SoftwareProbe`] shares the driver state for fault injection and
//! inspection.

use crate::capabilities::{
    AdapterInfo, DeviceFeatures, GpuVendor, MemoryHeapInfo, MemoryTypeInfo, QueueFamilyInfo,
    QueuePlan,
};
use crate::dispatch::DispatchSlot;
use crate::driver::{
    Driver, ImageDesc, InstanceDesc, SubmitDesc, SurfaceSupport, SwapchainDesc, VkResult,
};
use crate::error::{GpuError, Result};
use crate::memory::PoolBackend;
use ash::vk::{self, Handle};
use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Arc;

const MIB: u64 = 1024 * 1024;
const BUFFER_ALIGNMENT: u64 = 256;
const IMAGE_ALIGNMENT: u64 = 4096;
const ADAPTER_HANDLE_BASE: u64 = 0x1_0000;
const OBJECT_HANDLE_BASE: u64 = 0x10_0000;

/// A queue family of a software adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftwareQueueFamily {
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    pub supports_present: bool,
}

/// Description of one software adapter.
#[derive(Debug, Clone)]
pub struct SoftwareAdapterDesc {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub vendor_id: u32,
    pub api_version: u32,
    pub extensions: Vec<String>,
    pub features: DeviceFeatures,
    pub queue_families: Vec<SoftwareQueueFamily>,
    pub memory_heaps: Vec<MemoryHeapInfo>,
    pub memory_types: Vec<MemoryTypeInfo>,
}

impl Default for SoftwareAdapterDesc {
    /// One graphics+present+transfer family, a 256 MiB device-local heap and a
    /// 128 MiB host heap.
    fn default() -> Self {
        use vk::MemoryPropertyFlags as F;
        Self {
            name: "Software Adapter".to_string(),
            device_type: vk::PhysicalDeviceType::CPU,
            vendor_id: 0x10005,
            api_version: vk::API_VERSION_1_3,
            extensions: vec!["VK_KHR_swapchain".to_string()],
            features: DeviceFeatures::DYNAMIC_RENDERING
                | DeviceFeatures::SYNCHRONIZATION_2
                | DeviceFeatures::TIMELINE_SEMAPHORE,
            queue_families: vec![SoftwareQueueFamily {
                flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                queue_count: 1,
                supports_present: true,
            }],
            memory_heaps: vec![
                MemoryHeapInfo {
                    size: 256 * MIB,
                    device_local: true,
                },
                MemoryHeapInfo {
                    size: 128 * MIB,
                    device_local: false,
                },
            ],
            memory_types: vec![
                MemoryTypeInfo {
                    heap_index: 0,
                    flags: F::DEVICE_LOCAL,
                },
                MemoryTypeInfo {
                    heap_index: 1,
                    flags: F::HOST_VISIBLE | F::HOST_COHERENT,
                },
                MemoryTypeInfo {
                    heap_index: 1,
                    flags: F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED,
                },
            ],
        }
    }
}

impl SoftwareAdapterDesc {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_device_type(mut self, device_type: vk::PhysicalDeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn with_api_version(mut self, version: u32) -> Self {
        self.api_version = version;
        self
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn with_features(mut self, features: DeviceFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn with_queue_families(mut self, families: Vec<SoftwareQueueFamily>) -> Self {
        self.queue_families = families;
        self
    }

    /// Resize the device-local and host heaps.
    pub fn with_heap_sizes(mut self, device: u64, host: u64) -> Self {
        for heap in &mut self.memory_heaps {
            heap.size = if heap.device_local { device } else { host };
        }
        self
    }
}

/// The window a software surface stands in for.
#[derive(Debug, Clone)]
pub struct SoftwareSurface {
    pub extent: vk::Extent2D,
    pub min_image_count: u32,
    pub max_image_count: u32,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl Default for SoftwareSurface {
    fn default() -> Self {
        Self::new(800, 600)
    }
}

impl SoftwareSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            extent: vk::Extent2D { width, height },
            min_image_count: 2,
            max_image_count: 3,
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        }
    }

    pub fn with_image_counts(mut self, min: u32, max: u32) -> Self {
        self.min_image_count = min;
        self.max_image_count = max;
        self
    }

    pub fn with_formats(mut self, formats: Vec<vk::SurfaceFormatKHR>) -> Self {
        self.formats = formats;
        self
    }

    pub fn with_present_modes(mut self, modes: Vec<vk::PresentModeKHR>) -> Self {
        self.present_modes = modes;
        self
    }
}

/// An image handed out by an acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireRecord {
    pub swapchain: vk::SwapchainKHR,
    /// Creation order of the swapchain, starting at 1.
    pub generation: u64,
    pub image_index: u32,
    pub image: vk::Image,
}

/// An image queued for presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentRecord {
    pub swapchain: vk::SwapchainKHR,
    pub generation: u64,
    pub image_index: u32,
    pub image: vk::Image,
}

#[derive(Debug)]
struct SurfaceState {
    target: SoftwareSurface,
}

#[derive(Debug)]
struct SwapchainState {
    surface: u64,
    extent: vk::Extent2D,
    images: Vec<u64>,
    acquired: Vec<bool>,
    next_image: usize,
    generation: u64,
    retired: bool,
}

#[derive(Debug)]
struct ImageState {
    swapchain: Option<u64>,
    size: u64,
    linear: bool,
    bound: Option<u64>,
}

#[derive(Debug)]
struct BufferState {
    size: u64,
    bound: Option<u64>,
}

#[derive(Debug)]
struct MemoryState {
    size: u64,
    heap: usize,
    host_visible: bool,
    mapping: Option<Box<[u8]>>,
    bindings: u32,
}

#[derive(Debug, Default)]
struct FenceState {
    signaled: bool,
    pending: bool,
}

#[derive(Debug, Default)]
struct CommandBufferState {
    pool: u64,
    recording: bool,
    executable: bool,
    pending: bool,
}

#[derive(Debug)]
struct Submission {
    fence: Option<u64>,
    command_buffers: Vec<u64>,
}

#[derive(Debug)]
struct DeviceState {
    adapter: usize,
    queues: HashMap<u32, u64>,
}

#[derive(Debug, Default)]
struct State {
    adapters: Vec<SoftwareAdapterDesc>,
    instance: bool,
    device: Option<DeviceState>,
    next_handle: u64,

    surfaces: HashMap<u64, SurfaceState>,
    swapchains: HashMap<u64, SwapchainState>,
    images: HashMap<u64, ImageState>,
    image_views: HashMap<u64, u64>,
    semaphores: HashMap<u64, bool>,
    // Semaphores a presentation waited on, until its image is acquired again
    presenting: HashMap<u64, (u64, usize)>,
    fences: HashMap<u64, FenceState>,
    command_pools: HashMap<u64, u32>,
    command_buffers: HashMap<u64, CommandBufferState>,
    memory: HashMap<u64, MemoryState>,
    buffers: HashMap<u64, BufferState>,
    heap_used: Vec<u64>,

    submissions: VecDeque<Submission>,
    swapchain_generation: u64,

    // Faults
    fail_bootstrap: Option<String>,
    acquire_faults: VecDeque<vk::Result>,
    submit_faults: VecDeque<vk::Result>,
    fence_reset_faults: VecDeque<vk::Result>,
    suboptimal: bool,
    hung: bool,
    lost: bool,

    // Observations
    bootstraps: u32,
    acquires: Vec<AcquireRecord>,
    presents: Vec<PresentRecord>,
    violations: Vec<String>,
    submit_count: u64,
    max_in_flight: usize,
}

impl State {
    fn handle<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(OBJECT_HANDLE_BASE + self.next_handle)
    }

    fn violation(&mut self, message: String) {
        tracing::warn!(target: "vkl_gpu::software", "{message}");
        self.violations.push(message);
    }

    fn adapter(&self) -> Option<&SoftwareAdapterDesc> {
        self.device.as_ref().and_then(|d| self.adapters.get(d.adapter))
    }

    fn check_device(&self) -> VkResult<()> {
        if self.device.is_none() {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        if self.lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        Ok(())
    }

    /// Retire every submission up to and including `index`.
    fn complete_through(&mut self, index: usize) {
        for submission in self.submissions.drain(..=index) {
            if let Some(fence) = submission.fence.and_then(|f| self.fences.get_mut(&f)) {
                fence.signaled = true;
                fence.pending = false;
            }
            for cmd in submission.command_buffers {
                if let Some(state) = self.command_buffers.get_mut(&cmd) {
                    state.pending = false;
                }
            }
        }
    }

    fn complete_all(&mut self) {
        if !self.submissions.is_empty() {
            self.complete_through(self.submissions.len() - 1);
        }
    }

    /// Consume a binary semaphore's signal.
    fn wait_semaphore(&mut self, semaphore: u64, by: &str) {
        match self.semaphores.get_mut(&semaphore) {
            Some(signaled) if *signaled => *signaled = false,
            Some(_) => self.violation(format!(
                "{by} waits on semaphore {semaphore:#x} with no pending signal"
            )),
            None => self.violation(format!("{by} waits on unknown semaphore {semaphore:#x}")),
        }
    }

    fn signal_semaphore(&mut self, semaphore: u64, by: &str) {
        if let Some((swapchain, image)) = self.presenting.get(&semaphore).copied() {
            self.violation(format!(
                "{by} signals semaphore {semaphore:#x} still awaited by the presentation of image {image} of swapchain {swapchain:#x}"
            ));
        }
        match self.semaphores.get_mut(&semaphore) {
            Some(signaled) if !*signaled => *signaled = true,
            Some(_) => self.violation(format!(
                "{by} signals semaphore {semaphore:#x} that already has a pending signal"
            )),
            None => self.violation(format!("{by} signals unknown semaphore {semaphore:#x}")),
        }
    }

    fn surface_extent(&self, surface: u64) -> Option<vk::Extent2D> {
        self.surfaces.get(&surface).map(|s| s.target.extent)
    }

    fn live_objects(&self) -> usize {
        self.swapchains.len()
            + self.images.values().filter(|i| i.swapchain.is_none()).count()
            + self.image_views.len()
            + self.semaphores.len()
            + self.fences.len()
            + self.command_pools.len()
            + self.memory.len()
            + self.buffers.len()
    }

    fn memory_type_bits(&self, filter: impl Fn(&MemoryTypeInfo) -> bool) -> u32 {
        self.adapter()
            .map(|a| {
                a.memory_types
                    .iter()
                    .enumerate()
                    .filter(|(_, ty)| filter(ty))
                    .fold(0, |bits, (i, _)| bits | (1 << i))
            })
            .unwrap_or(0)
    }

    fn bind(&mut self, what: &str, memory: u64, offset: u64, size: u64, alignment: u64) -> VkResult<()> {
        let Some(state) = self.memory.get_mut(&memory) else {
            self.violation(format!("{what} bound to unknown memory {memory:#x}"));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        };
        if offset % alignment != 0 || offset + size > state.size {
            let block = state.size;
            self.violation(format!(
                "{what} bound at {offset}+{size} in a block of {block} bytes (alignment {alignment})"
            ));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        state.bindings += 1;
        Ok(())
    }

    fn unbind(&mut self, memory: u64) {
        if let Some(state) = self.memory.get_mut(&memory) {
            state.bindings = state.bindings.saturating_sub(1);
        }
    }
}

/// Software implementation of the driver seam.
///
/// Clones share the same simulated process, including its dispatch slot.
#[derive(Clone)]
pub struct SoftwareDriver {
    state: Arc<Mutex<State>>,
    dispatch: Arc<DispatchSlot>,
}

impl Default for SoftwareDriver {
    fn default() -> Self {
        Self::new(vec![SoftwareAdapterDesc::default()])
    }
}

impl SoftwareDriver {
    /// A driver exposing `adapters` in order.
    pub fn new(adapters: Vec<SoftwareAdapterDesc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                adapters,
                ..State::default()
            })),
            dispatch: DispatchSlot::new("software"),
        }
    }

    /// A probe sharing this driver's state.
    pub fn probe(&self) -> SoftwareProbe {
        SoftwareProbe {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock()
    }
}

impl std::fmt::Debug for SoftwareDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareDriver")
            .field("dispatch", &self.dispatch)
            .finish_non_exhaustive()
    }
}

impl Driver for SoftwareDriver {
    type SurfaceTarget = SoftwareSurface;
    type Memory = PoolBackend;

    fn name(&self) -> &'static str {
        "software"
    }

    fn dispatch_slot(&self) -> Arc<DispatchSlot> {
        Arc::clone(&self.dispatch)
    }

    fn bootstrap(&mut self, desc: &InstanceDesc, _target: &SoftwareSurface) -> Result<()> {
        let mut s = self.lock();
        if let Some(reason) = s.fail_bootstrap.take() {
            return Err(GpuError::DriverInit(reason));
        }
        if s.instance {
            return Err(GpuError::InvalidState("Driver already bootstrapped".to_string()));
        }
        s.instance = true;
        s.bootstraps += 1;
        tracing::debug!("Software instance created for {}", desc.app_name);
        Ok(())
    }

    fn create_surface(&mut self, target: &SoftwareSurface) -> Result<vk::SurfaceKHR> {
        let mut s = self.lock();
        if !s.instance {
            return Err(GpuError::InvalidState("Instance not created".to_string()));
        }
        let surface: vk::SurfaceKHR = s.handle();
        s.surfaces.insert(
            surface.as_raw(),
            SurfaceState {
                target: target.clone(),
            },
        );
        Ok(surface)
    }

    unsafe fn enumerate_adapters(&self, _surface: vk::SurfaceKHR) -> Result<Vec<AdapterInfo>> {
        let s = self.lock();
        let adapters = s
            .adapters
            .iter()
            .enumerate()
            .map(|(index, desc)| AdapterInfo {
                handle: vk::PhysicalDevice::from_raw(ADAPTER_HANDLE_BASE + index as u64),
                name: desc.name.clone(),
                vendor: GpuVendor::from_vendor_id(desc.vendor_id),
                device_type: desc.device_type,
                api_version: desc.api_version,
                driver_version: 1,
                extensions: desc.extensions.iter().cloned().collect(),
                features: desc.features,
                queue_families: desc
                    .queue_families
                    .iter()
                    .enumerate()
                    .map(|(i, f)| QueueFamilyInfo {
                        index: i as u32,
                        flags: f.flags,
                        queue_count: f.queue_count,
                        supports_present: f.supports_present,
                    })
                    .collect(),
                memory_heaps: desc.memory_heaps.clone(),
                memory_types: desc.memory_types.clone(),
                buffer_image_granularity: 1,
            })
            .collect();
        Ok(adapters)
    }

    fn create_device(
        &mut self,
        adapter: &AdapterInfo,
        plan: &QueuePlan,
        extensions: &[String],
    ) -> Result<()> {
        let mut s = self.lock();
        let index = (adapter.handle.as_raw())
            .checked_sub(ADAPTER_HANDLE_BASE)
            .map(|i| i as usize)
            .filter(|&i| i < s.adapters.len())
            .ok_or(GpuError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED))?;

        let desc = &s.adapters[index];
        if let Some(missing) = extensions.iter().find(|e| !desc.extensions.contains(e)) {
            return Err(GpuError::DriverInit(format!("extension {missing} not present")));
        }
        let family_count = desc.queue_families.len() as u32;
        let heaps = desc.memory_heaps.len();

        let mut queues = HashMap::new();
        for family in plan.unique_families() {
            if family >= family_count {
                return Err(GpuError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED));
            }
            let queue: vk::Queue = s.handle();
            queues.insert(family, queue.as_raw());
        }

        s.device = Some(DeviceState {
            adapter: index,
            queues,
        });
        s.heap_used = vec![0; heaps];
        tracing::debug!("Software device created on adapter {index}");
        Ok(())
    }

    fn queue(&self, family: u32, index: u32) -> Result<vk::Queue> {
        let s = self.lock();
        let queue = s
            .device
            .as_ref()
            .and_then(|d| d.queues.get(&family))
            .filter(|_| index == 0)
            .ok_or_else(|| GpuError::InvalidState(format!("No queue {index} in family {family}")))?;
        Ok(vk::Queue::from_raw(*queue))
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        let mut s = self.lock();
        if s.device.is_none() {
            return Ok(());
        }
        if s.lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        if s.hung && !s.submissions.is_empty() {
            return Err(vk::Result::TIMEOUT);
        }
        s.complete_all();
        s.presenting.clear();
        Ok(())
    }

    unsafe fn destroy_surface(&mut self, surface: vk::SurfaceKHR) {
        let mut s = self.lock();
        let raw = surface.as_raw();
        if s.swapchains.values().any(|sc| sc.surface == raw) {
            s.violation(format!("surface {raw:#x} destroyed while a swapchain uses it"));
        }
        s.surfaces.remove(&raw);
    }

    unsafe fn destroy(&mut self) {
        let mut s = self.lock();
        if s.device.take().is_some() {
            let live = s.live_objects();
            if live > 0 {
                s.violation(format!("device destroyed with {live} live objects"));
            }
            s.submissions.clear();
            tracing::debug!("Software device destroyed");
        }
        s.instance = false;
        s.lost = false;
        s.hung = false;
    }

    unsafe fn surface_support(
        &self,
        _adapter: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> VkResult<SurfaceSupport> {
        let s = self.lock();
        let target = &s
            .surfaces
            .get(&surface.as_raw())
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?
            .target;

        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: target.min_image_count,
            max_image_count: target.max_image_count,
            current_extent: target.extent,
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 16384,
                height: 16384,
            },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::TRANSFER_SRC,
        };

        Ok(SurfaceSupport {
            capabilities,
            formats: target.formats.clone(),
            present_modes: target.present_modes.clone(),
        })
    }

    unsafe fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        let mut s = self.lock();
        s.check_device()?;
        let surface = desc.surface.as_raw();
        let Some(target) = s.surfaces.get(&surface).map(|t| t.target.clone()) else {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        };

        if desc.extent != target.extent {
            s.violation(format!(
                "swapchain extent {}x{} does not match surface extent {}x{}",
                desc.extent.width, desc.extent.height, target.extent.width, target.extent.height
            ));
        }

        let old = desc.old_swapchain.as_raw();
        if old != 0 {
            match s.swapchains.get_mut(&old) {
                Some(previous) => previous.retired = true,
                None => s.violation(format!("old swapchain {old:#x} is unknown")),
            }
        }

        let count = desc
            .min_image_count
            .clamp(target.min_image_count, target.max_image_count.max(target.min_image_count));
        let swapchain: vk::SwapchainKHR = s.handle();
        let images: Vec<u64> = (0..count)
            .map(|_| s.handle::<vk::Image>().as_raw())
            .collect();
        for &image in &images {
            s.images.insert(
                image,
                ImageState {
                    swapchain: Some(swapchain.as_raw()),
                    size: 0,
                    linear: false,
                    bound: None,
                },
            );
        }

        s.swapchain_generation += 1;
        let generation = s.swapchain_generation;
        s.swapchains.insert(
            swapchain.as_raw(),
            SwapchainState {
                surface,
                extent: desc.extent,
                acquired: vec![false; images.len()],
                images,
                next_image: 0,
                generation,
                retired: false,
            },
        );
        s.suboptimal = false;
        Ok(swapchain)
    }

    unsafe fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        let s = self.lock();
        let state = s
            .swapchains
            .get(&swapchain.as_raw())
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        Ok(state.images.iter().map(|&i| vk::Image::from_raw(i)).collect())
    }

    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut s = self.lock();
        let raw = swapchain.as_raw();
        let Some(state) = s.swapchains.remove(&raw) else {
            s.violation(format!("destroying unknown swapchain {raw:#x}"));
            return;
        };
        let views = s
            .image_views
            .values()
            .filter(|image| state.images.contains(image))
            .count();
        if views > 0 {
            s.violation(format!("swapchain {raw:#x} destroyed with {views} live image views"));
        }
        for image in &state.images {
            s.images.remove(image);
        }
        s.presenting.retain(|_, (owner, _)| *owner != raw);
    }

    unsafe fn create_image_view(
        &self,
        image: vk::Image,
        _format: vk::Format,
    ) -> VkResult<vk::ImageView> {
        let mut s = self.lock();
        if !s.images.contains_key(&image.as_raw()) {
            s.violation(format!("view of unknown image {:#x}", image.as_raw()));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        let view: vk::ImageView = s.handle();
        s.image_views.insert(view.as_raw(), image.as_raw());
        Ok(view)
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        let mut s = self.lock();
        if s.image_views.remove(&view.as_raw()).is_none() {
            s.violation(format!("destroying unknown image view {:#x}", view.as_raw()));
        }
    }

    unsafe fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut s = self.lock();
        s.check_device()?;
        let raw = swapchain.as_raw();

        let Some(state) = s.swapchains.get(&raw) else {
            s.violation(format!("acquire from unknown swapchain {raw:#x}"));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        };
        if state.retired {
            s.violation(format!("acquire from retired swapchain {raw:#x}"));
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        let extent = state.extent;
        let surface = state.surface;

        if let Some(fault) = s.acquire_faults.pop_front() {
            return Err(fault);
        }
        if s.surface_extent(surface) != Some(extent) {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }

        let Some(state) = s.swapchains.get(&raw) else {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        };
        let count = state.images.len();
        let free = (0..count)
            .map(|k| (state.next_image + k) % count)
            .find(|&i| !state.acquired[i]);
        let Some(index) = free else {
            return Err(if timeout_ns == 0 {
                vk::Result::NOT_READY
            } else {
                vk::Result::TIMEOUT
            });
        };

        s.presenting.retain(|_, presented| *presented != (raw, index));
        s.signal_semaphore(semaphore.as_raw(), "acquire");

        let suboptimal = s.suboptimal;
        let Some(state) = s.swapchains.get_mut(&raw) else {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        };
        state.acquired[index] = true;
        state.next_image = (index + 1) % count;
        let record = AcquireRecord {
            swapchain,
            generation: state.generation,
            image_index: index as u32,
            image: vk::Image::from_raw(state.images[index]),
        };
        s.acquires.push(record);

        Ok((index as u32, suboptimal))
    }

    unsafe fn queue_present(
        &self,
        _queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let mut s = self.lock();
        s.check_device()?;
        let raw = swapchain.as_raw();

        let Some(state) = s.swapchains.get(&raw) else {
            s.violation(format!("present to unknown swapchain {raw:#x}"));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        };
        if state.retired {
            s.violation(format!("present to retired swapchain {raw:#x}"));
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        let index = image_index as usize;
        let acquired = state.acquired.get(index).copied().unwrap_or(false);
        let extent = state.extent;
        let surface = state.surface;
        if !acquired {
            s.violation(format!("presenting image {image_index} that was not acquired"));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }

        for semaphore in wait_semaphores {
            s.wait_semaphore(semaphore.as_raw(), "present");
            s.presenting.insert(semaphore.as_raw(), (raw, index));
        }

        let Some(state) = s.swapchains.get_mut(&raw) else {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        };
        state.acquired[index] = false;
        let record = PresentRecord {
            swapchain,
            generation: state.generation,
            image_index,
            image: vk::Image::from_raw(state.images[index]),
        };
        s.presents.push(record);

        if s.surface_extent(surface) != Some(extent) {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        Ok(s.suboptimal)
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut s = self.lock();
        let semaphore: vk::Semaphore = s.handle();
        s.semaphores.insert(semaphore.as_raw(), false);
        Ok(semaphore)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut s = self.lock();
        if s.presenting.contains_key(&semaphore.as_raw()) {
            s.violation(format!(
                "destroying semaphore {:#x} still awaited by a presentation",
                semaphore.as_raw()
            ));
        }
        if s.semaphores.remove(&semaphore.as_raw()).is_none() {
            s.violation(format!("destroying unknown semaphore {:#x}", semaphore.as_raw()));
        }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut s = self.lock();
        let fence: vk::Fence = s.handle();
        s.fences.insert(
            fence.as_raw(),
            FenceState {
                signaled,
                pending: false,
            },
        );
        Ok(fence)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        let mut s = self.lock();
        match s.fences.remove(&fence.as_raw()) {
            Some(state) if state.pending && !s.lost => {
                s.violation(format!("fence {:#x} destroyed while pending", fence.as_raw()));
            }
            Some(_) => {}
            None => s.violation(format!("destroying unknown fence {:#x}", fence.as_raw())),
        }
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        let mut s = self.lock();
        s.check_device()?;
        let raw = fence.as_raw();

        let Some(state) = s.fences.get(&raw) else {
            s.violation(format!("wait on unknown fence {raw:#x}"));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        };
        if state.signaled {
            return Ok(());
        }

        match s.submissions.iter().position(|sub| sub.fence == Some(raw)) {
            None => {
                s.violation(format!("wait on fence {raw:#x} that no submission will signal"));
                Err(vk::Result::TIMEOUT)
            }
            Some(_) if s.hung || timeout_ns == 0 => Err(vk::Result::TIMEOUT),
            Some(index) => {
                s.complete_through(index);
                Ok(())
            }
        }
    }

    unsafe fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        let s = self.lock();
        s.check_device()?;
        s.fences
            .get(&fence.as_raw())
            .map(|f| f.signaled)
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut s = self.lock();
        s.check_device()?;
        if let Some(fault) = s.fence_reset_faults.pop_front() {
            return Err(fault);
        }
        let raw = fence.as_raw();
        let pending = match s.fences.get_mut(&raw) {
            Some(state) => {
                let pending = state.pending;
                state.signaled = false;
                pending
            }
            None => return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT),
        };
        if pending {
            s.violation(format!("fence {raw:#x} reset while pending"));
        }
        Ok(())
    }

    fn create_command_pool(&self, queue_family: u32) -> VkResult<vk::CommandPool> {
        let mut s = self.lock();
        let known = s
            .device
            .as_ref()
            .is_some_and(|d| d.queues.contains_key(&queue_family));
        if !known {
            s.violation(format!("command pool for family {queue_family} without a queue"));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        let pool: vk::CommandPool = s.handle();
        s.command_pools.insert(pool.as_raw(), queue_family);
        Ok(pool)
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut s = self.lock();
        let raw = pool.as_raw();
        if s.command_pools.remove(&raw).is_none() {
            s.violation(format!("destroying unknown command pool {raw:#x}"));
            return;
        }
        let pending = s
            .command_buffers
            .values()
            .filter(|c| c.pool == raw && c.pending)
            .count();
        if pending > 0 && !s.lost {
            s.violation(format!("command pool {raw:#x} destroyed with {pending} pending buffers"));
        }
        s.command_buffers.retain(|_, c| c.pool != raw);
    }

    unsafe fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut s = self.lock();
        if !s.command_pools.contains_key(&pool.as_raw()) {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        let buffers: Vec<vk::CommandBuffer> = (0..count).map(|_| s.handle()).collect();
        for buffer in &buffers {
            s.command_buffers.insert(
                buffer.as_raw(),
                CommandBufferState {
                    pool: pool.as_raw(),
                    ..CommandBufferState::default()
                },
            );
        }
        Ok(buffers)
    }

    unsafe fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut s = self.lock();
        s.check_device()?;
        let raw = command_buffer.as_raw();
        let Some(state) = s.command_buffers.get_mut(&raw) else {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        };
        let pending = state.pending;
        state.recording = true;
        state.executable = false;
        if pending {
            s.violation(format!("command buffer {raw:#x} reset while pending"));
        }
        Ok(())
    }

    unsafe fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut s = self.lock();
        let raw = command_buffer.as_raw();
        let Some(state) = s.command_buffers.get_mut(&raw) else {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        };
        if !state.recording {
            s.violation(format!("ending command buffer {raw:#x} that is not recording"));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        state.recording = false;
        state.executable = true;
        Ok(())
    }

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submit: &SubmitDesc,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut s = self.lock();
        s.check_device()?;
        if let Some(fault) = s.submit_faults.pop_front() {
            return Err(fault);
        }

        let known_queue = s
            .device
            .as_ref()
            .is_some_and(|d| d.queues.values().any(|&q| q == queue.as_raw()));
        if !known_queue {
            s.violation(format!("submit to unknown queue {:#x}", queue.as_raw()));
        }
        if submit.wait_semaphores.len() != submit.wait_stages.len() {
            s.violation("wait semaphores and wait stages differ in length".to_string());
        }

        for semaphore in &submit.wait_semaphores {
            s.wait_semaphore(semaphore.as_raw(), "submit");
        }

        for cmd in &submit.command_buffers {
            let raw = cmd.as_raw();
            let problem = match s.command_buffers.get_mut(&raw) {
                Some(state) if state.executable && !state.pending => {
                    // One-time submit: invalid again once executed
                    state.executable = false;
                    state.pending = true;
                    None
                }
                Some(state) if state.pending => Some("is still pending"),
                Some(_) => Some("is not executable"),
                None => Some("is unknown"),
            };
            if let Some(problem) = problem {
                s.violation(format!("submitted command buffer {raw:#x} {problem}"));
            }
        }

        for semaphore in &submit.signal_semaphores {
            s.signal_semaphore(semaphore.as_raw(), "submit");
        }

        let fence_raw = (fence != vk::Fence::null()).then(|| fence.as_raw());
        if let Some(raw) = fence_raw {
            let problem = match s.fences.get_mut(&raw) {
                Some(state) if !state.signaled && !state.pending => {
                    state.pending = true;
                    None
                }
                Some(state) if state.pending => Some("is already pending"),
                Some(_) => Some("is still signaled"),
                None => Some("is unknown"),
            };
            if let Some(problem) = problem {
                s.violation(format!("submitted with fence {raw:#x} that {problem}"));
            }
        }

        s.submissions.push_back(Submission {
            fence: fence_raw,
            command_buffers: submit.command_buffers.iter().map(|c| c.as_raw()).collect(),
        });
        s.submit_count += 1;
        s.max_in_flight = s.max_in_flight.max(s.submissions.len());
        Ok(())
    }

    fn allocate_memory(&self, memory_type: u32, size: u64) -> VkResult<vk::DeviceMemory> {
        let mut s = self.lock();
        let Some(adapter) = s.adapter() else {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        };
        let Some(ty) = adapter.memory_types.get(memory_type as usize) else {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        };
        let heap = ty.heap_index as usize;
        let host_visible = ty.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        let Some(heap_info) = adapter.memory_heaps.get(heap).copied() else {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        };

        if s.heap_used[heap] + size > heap_info.size {
            return Err(if heap_info.device_local {
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            } else {
                vk::Result::ERROR_OUT_OF_HOST_MEMORY
            });
        }

        s.heap_used[heap] += size;
        let memory: vk::DeviceMemory = s.handle();
        s.memory.insert(
            memory.as_raw(),
            MemoryState {
                size,
                heap,
                host_visible,
                mapping: None,
                bindings: 0,
            },
        );
        Ok(memory)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut s = self.lock();
        let raw = memory.as_raw();
        let Some(state) = s.memory.remove(&raw) else {
            s.violation(format!("freeing unknown memory {raw:#x}"));
            return;
        };
        if state.bindings > 0 {
            s.violation(format!(
                "memory {raw:#x} freed with {} resources still bound",
                state.bindings
            ));
        }
        if let Some(used) = s.heap_used.get_mut(state.heap) {
            *used = used.saturating_sub(state.size);
        }
    }

    unsafe fn map_memory(&self, memory: vk::DeviceMemory, size: u64) -> VkResult<NonNull<u8>> {
        let mut s = self.lock();
        let raw = memory.as_raw();
        let Some(state) = s.memory.get_mut(&raw) else {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        };
        if !state.host_visible || state.mapping.is_some() || size > state.size {
            s.violation(format!("invalid map of memory {raw:#x}"));
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let mapping = state
            .mapping
            .insert(vec![0u8; state.size as usize].into_boxed_slice());
        NonNull::new(mapping.as_mut_ptr()).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)
    }

    fn create_buffer(&self, size: u64, _usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer> {
        let mut s = self.lock();
        s.check_device()?;
        let buffer: vk::Buffer = s.handle();
        s.buffers
            .insert(buffer.as_raw(), BufferState { size, bound: None });
        Ok(buffer)
    }

    unsafe fn buffer_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let s = self.lock();
        let size = s.buffers.get(&buffer.as_raw()).map_or(0, |b| b.size);
        vk::MemoryRequirements {
            size: size.div_ceil(BUFFER_ALIGNMENT) * BUFFER_ALIGNMENT,
            alignment: BUFFER_ALIGNMENT,
            memory_type_bits: s.memory_type_bits(|_| true),
        }
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()> {
        let mut s = self.lock();
        let raw = buffer.as_raw();
        let (size, bound) = match s.buffers.get(&raw) {
            Some(b) => (b.size, b.bound.is_some()),
            None => return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT),
        };
        if bound {
            s.violation(format!("buffer {raw:#x} bound twice"));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        s.bind("buffer", memory.as_raw(), offset, size, BUFFER_ALIGNMENT)?;
        if let Some(b) = s.buffers.get_mut(&raw) {
            b.bound = Some(memory.as_raw());
        }
        Ok(())
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut s = self.lock();
        match s.buffers.remove(&buffer.as_raw()) {
            Some(state) => {
                if let Some(memory) = state.bound {
                    s.unbind(memory);
                }
            }
            None => s.violation(format!("destroying unknown buffer {:#x}", buffer.as_raw())),
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> VkResult<vk::Image> {
        let mut s = self.lock();
        s.check_device()?;
        let texels = u64::from(desc.extent.width)
            * u64::from(desc.extent.height)
            * u64::from(desc.extent.depth)
            * u64::from(desc.array_layers);
        // Four bytes per texel, a full mip chain adds at most a third
        let base = texels * 4;
        let size = if desc.mip_levels > 1 { base + base / 3 } else { base };

        let image: vk::Image = s.handle();
        s.images.insert(
            image.as_raw(),
            ImageState {
                swapchain: None,
                size,
                linear: desc.tiling == vk::ImageTiling::LINEAR,
                bound: None,
            },
        );
        Ok(image)
    }

    unsafe fn image_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let s = self.lock();
        let (size, linear) = s
            .images
            .get(&image.as_raw())
            .map_or((0, false), |i| (i.size, i.linear));
        let memory_type_bits = if linear {
            s.memory_type_bits(|_| true)
        } else {
            s.memory_type_bits(|ty| ty.flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL))
        };
        vk::MemoryRequirements {
            size: size.div_ceil(IMAGE_ALIGNMENT).max(1) * IMAGE_ALIGNMENT,
            alignment: IMAGE_ALIGNMENT,
            memory_type_bits,
        }
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()> {
        let mut s = self.lock();
        let raw = image.as_raw();
        let (size, bound, swapchain) = match s.images.get(&raw) {
            Some(i) => (i.size, i.bound.is_some(), i.swapchain.is_some()),
            None => return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT),
        };
        if bound || swapchain {
            s.violation(format!("image {raw:#x} cannot be bound"));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        s.bind("image", memory.as_raw(), offset, size, IMAGE_ALIGNMENT)?;
        if let Some(i) = s.images.get_mut(&raw) {
            i.bound = Some(memory.as_raw());
        }
        Ok(())
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        let mut s = self.lock();
        let raw = image.as_raw();
        match s.images.get(&raw) {
            Some(state) if state.swapchain.is_some() => {
                s.violation(format!("destroying swapchain-owned image {raw:#x}"));
            }
            Some(_) => {
                if let Some(memory) = s.images.remove(&raw).and_then(|i| i.bound) {
                    s.unbind(memory);
                }
            }
            None => s.violation(format!("destroying unknown image {raw:#x}")),
        }
    }
}

/// Fault injection and inspection for a [`SoftwareDriver`].
#[derive(Clone)]
pub struct SoftwareProbe {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for SoftwareProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareProbe").finish_non_exhaustive()
    }
}

impl SoftwareProbe {
    /// Make the next bootstrap fail with `reason`.
    pub fn fail_next_bootstrap(&self, reason: impl Into<String>) {
        self.state.lock().fail_bootstrap = Some(reason.into());
    }

    /// Make the next acquire fail with `result` (e.g. `ERROR_OUT_OF_DATE_KHR`).
    pub fn inject_acquire_error(&self, result: vk::Result) {
        self.state.lock().acquire_faults.push_back(result);
    }

    /// Make the next submission fail with `result`.
    pub fn inject_submit_error(&self, result: vk::Result) {
        self.state.lock().submit_faults.push_back(result);
    }

    /// Make the next fence reset fail with `result`.
    pub fn inject_fence_reset_error(&self, result: vk::Result) {
        self.state.lock().fence_reset_faults.push_back(result);
    }

    /// Change the extent of every surface, as a window resize would.
    pub fn resize(&self, width: u32, height: u32) {
        let mut s = self.state.lock();
        for surface in s.surfaces.values_mut() {
            surface.target.extent = vk::Extent2D { width, height };
        }
    }

    /// Report acquires and presents as suboptimal until the next swapchain.
    pub fn set_suboptimal(&self, suboptimal: bool) {
        self.state.lock().suboptimal = suboptimal;
    }

    /// Stop (or resume) completing submitted work.
    pub fn set_hung(&self, hung: bool) {
        self.state.lock().hung = hung;
    }

    /// Lose the device; every later device call reports it.
    pub fn lose_device(&self) {
        self.state.lock().lost = true;
    }

    /// Let the GPU finish everything submitted so far.
    pub fn complete_all(&self) {
        self.state.lock().complete_all();
    }

    pub fn bootstrap_count(&self) -> u32 {
        self.state.lock().bootstraps
    }

    pub fn acquires(&self) -> Vec<AcquireRecord> {
        self.state.lock().acquires.clone()
    }

    pub fn presents(&self) -> Vec<PresentRecord> {
        self.state.lock().presents.clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn submit_count(&self) -> u64 {
        self.state.lock().submit_count
    }

    /// Submissions not yet completed.
    pub fn in_flight(&self) -> usize {
        self.state.lock().submissions.len()
    }

    /// Highest number of submissions ever in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }

    /// Device objects (swapchains, memory, resources, sync objects, pools) alive.
    pub fn live_objects(&self) -> usize {
        self.state.lock().live_objects()
    }

    /// Whether a logical device exists.
    pub fn has_device(&self) -> bool {
        self.state.lock().device.is_some()
    }

    /// Bytes of raw memory allocated from `heap`.
    pub fn heap_usage(&self, heap: usize) -> u64 {
        self.state.lock().heap_used.get(heap).copied().unwrap_or(0)
    }

    /// Raw memory blocks alive.
    pub fn memory_blocks(&self) -> usize {
        self.state.lock().memory.len()
    }

    /// Images owned by the swapchain created `generation`-th, if it still exists.
    pub fn swapchain_images(&self, generation: u64) -> Option<Vec<vk::Image>> {
        let s = self.state.lock();
        s.swapchains
            .values()
            .find(|sc| sc.generation == generation)
            .map(|sc| sc.images.iter().map(|&i| vk::Image::from_raw(i)).collect())
    }

    /// Copy bytes out of a mapped memory block.
    pub fn read_memory(&self, memory: vk::DeviceMemory, offset: u64, len: usize) -> Option<Vec<u8>> {
        let s = self.state.lock();
        let mapping = s.memory.get(&memory.as_raw())?.mapping.as_ref()?;
        let start = usize::try_from(offset).ok()?;
        mapping.get(start..start.checked_add(len)?).map(<[u8]>::to_vec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::DeviceRequirements;
    use crate::context::DeviceContextBuilder;
    use crate::swapchain::{SwapchainConfig, SwapchainManager};

    fn context(driver: &SoftwareDriver) -> crate::context::DeviceContext<SoftwareDriver> {
        DeviceContextBuilder::new()
            .requirements(DeviceRequirements::default())
            .build(driver.clone(), &SoftwareSurface::default())
            .unwrap()
    }

    #[test]
    fn fences_complete_in_submission_order() {
        let driver = SoftwareDriver::default();
        let probe = driver.probe();
        let ctx = context(&driver);
        let d = ctx.driver();

        let a = d.create_fence(false).unwrap();
        let b = d.create_fence(false).unwrap();
        unsafe {
            d.queue_submit(ctx.graphics_queue(), &SubmitDesc::default(), a).unwrap();
            d.queue_submit(ctx.graphics_queue(), &SubmitDesc::default(), b).unwrap();
            assert_eq!(probe.in_flight(), 2);

            d.wait_for_fence(b, u64::MAX).unwrap();
            assert!(d.fence_status(a).unwrap());
            assert_eq!(probe.in_flight(), 0);

            d.destroy_fence(a);
            d.destroy_fence(b);
        }
        assert!(probe.violations().is_empty());
    }

    #[test]
    fn hung_gpu_times_out() {
        let driver = SoftwareDriver::default();
        let probe = driver.probe();
        let ctx = context(&driver);
        let d = ctx.driver();

        let fence = d.create_fence(false).unwrap();
        unsafe {
            d.queue_submit(ctx.graphics_queue(), &SubmitDesc::default(), fence).unwrap();
            probe.set_hung(true);
            assert_eq!(d.wait_for_fence(fence, 1_000), Err(vk::Result::TIMEOUT));
            probe.set_hung(false);
            d.wait_for_fence(fence, 1_000).unwrap();
            d.destroy_fence(fence);
        }
    }

    #[test]
    fn unsignaled_semaphore_wait_is_a_violation() {
        let driver = SoftwareDriver::default();
        let probe = driver.probe();
        let ctx = context(&driver);
        let d = ctx.driver();

        let semaphore = d.create_semaphore().unwrap();
        let submit = SubmitDesc {
            wait_semaphores: vec![semaphore],
            wait_stages: vec![vk::PipelineStageFlags::TRANSFER],
            ..SubmitDesc::default()
        };
        unsafe {
            d.queue_submit(ctx.graphics_queue(), &submit, vk::Fence::null()).unwrap();
            d.destroy_semaphore(semaphore);
        }
        assert_eq!(probe.violations().len(), 1);
    }

    #[test]
    fn presented_semaphore_is_held_until_its_image_returns() {
        let driver = SoftwareDriver::default();
        let probe = driver.probe();
        let ctx = context(&driver);
        let d = ctx.driver();
        let extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let mut swapchain =
            SwapchainManager::create(&ctx, SwapchainConfig::default().with_image_count(2), extent)
                .unwrap();
        let handle = swapchain.handle();
        let acquire = d.create_semaphore().unwrap();
        let render = d.create_semaphore().unwrap();
        let submit = SubmitDesc {
            wait_semaphores: vec![acquire],
            wait_stages: vec![vk::PipelineStageFlags::TRANSFER],
            signal_semaphores: vec![render],
            ..SubmitDesc::default()
        };

        unsafe {
            let (first, _) = d.acquire_next_image(handle, u64::MAX, acquire).unwrap();
            d.queue_submit(ctx.graphics_queue(), &submit, vk::Fence::null()).unwrap();
            d.queue_present(ctx.present_queue(), handle, first, &[render]).unwrap();
            assert!(probe.violations().is_empty());

            // A different image comes back first; `render` is still awaited
            let (second, _) = d.acquire_next_image(handle, u64::MAX, acquire).unwrap();
            assert_ne!(second, first);
            d.queue_submit(ctx.graphics_queue(), &submit, vk::Fence::null()).unwrap();
            assert_eq!(probe.violations().len(), 1);

            d.queue_present(ctx.present_queue(), handle, second, &[render]).unwrap();
            d.device_wait_idle().unwrap();
            d.destroy_semaphore(acquire);
            d.destroy_semaphore(render);
            swapchain.destroy(&ctx);
        }
        assert_eq!(probe.violations().len(), 1);
    }

    #[test]
    fn heap_budget_enforced() {
        let driver = SoftwareDriver::default();
        let ctx = context(&driver);
        let d = ctx.driver();

        assert_eq!(
            d.allocate_memory(0, 512 * MIB),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        );
        assert_eq!(
            d.allocate_memory(1, 512 * MIB),
            Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        );
        let memory = d.allocate_memory(0, 256 * MIB).unwrap();
        unsafe { d.free_memory(memory) };
    }

    #[test]
    fn device_teardown_reports_leaks() {
        let driver = SoftwareDriver::default();
        let probe = driver.probe();
        let ctx = context(&driver);
        let _leaked = ctx.driver().create_semaphore().unwrap();
        drop(ctx);

        assert_eq!(probe.violations().len(), 1);
        assert!(!probe.has_device());
    }
}
