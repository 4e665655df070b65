//! Vulkan driver on `ash`.

use crate::capabilities::{
    api_at_least, AdapterInfo, DeviceFeatures, GpuVendor, MemoryHeapInfo, MemoryTypeInfo, QueueFamilyInfo,
    QueuePlan,
};
use crate::dispatch::DispatchSlot;
use crate::driver::{Driver, ImageDesc, InstanceDesc, SubmitDesc, SurfaceSupport, SwapchainDesc, VkResult};
use crate::error::{GpuError, Result};
use crate::memory::ManagedBackend;
use ash::vk;
use hashbrown::HashSet;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

static DISPATCH: OnceLock<Arc<DispatchSlot>> = OnceLock::new();
static ENTRY: OnceLock<ash::Entry> = OnceLock::new();

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Load the Vulkan entry points once per process.
fn entry() -> Result<&'static ash::Entry> {
    if let Some(entry) = ENTRY.get() {
        return Ok(entry);
    }
    // SAFETY: loading the system Vulkan library has no other preconditions.
    let loaded = unsafe { ash::Entry::load() }
        .map_err(|e| GpuError::DriverInit(format!("Failed to load Vulkan: {e}")))?;
    tracing::debug!("Vulkan entry points loaded");
    Ok(ENTRY.get_or_init(|| loaded))
}

/// Raw handles of the window a surface is created for.
///
/// The window must outlive the device context.
#[derive(Debug, Clone, Copy)]
pub struct WindowTarget {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
}

impl WindowTarget {
    /// Capture the handles of a window.
    pub fn from_window<W>(window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceIncompatible(format!("Failed to get display handle: {e}")))?;
        let window = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceIncompatible(format!("Failed to get window handle: {e}")))?;

        Ok(Self {
            display: display.as_raw(),
            window: window.as_raw(),
        })
    }
}

struct DeviceState {
    device: ash::Device,
    swapchain_loader: ash::khr::swapchain::Device,
}

/// Driver backed by the system Vulkan loader.
#[derive(Default)]
pub struct VulkanDriver {
    instance: Option<ash::Instance>,
    debug: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    surface_loader: Option<ash::khr::surface::Instance>,
    device: Option<DeviceState>,
}

impl VulkanDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The Vulkan instance, once bootstrapped.
    pub fn instance(&self) -> Option<&ash::Instance> {
        self.instance.as_ref()
    }

    /// The logical device, for recording commands.
    pub fn device(&self) -> Option<&ash::Device> {
        self.device.as_ref().map(|d| &d.device)
    }

    fn state(&self) -> VkResult<&DeviceState> {
        self.device
            .as_ref()
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)
    }

    fn surface_loader(&self) -> VkResult<&ash::khr::surface::Instance> {
        self.surface_loader
            .as_ref()
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)
    }

    fn loaded_instance(&self) -> Result<&ash::Instance> {
        self.instance
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("Vulkan instance not created".to_string()))
    }

    /// # Safety
    /// The instance and physical device must be live.
    unsafe fn describe_adapter(
        &self,
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<AdapterInfo> {
        // SAFETY: guaranteed by the caller.
        unsafe {
            let properties = instance.get_physical_device_properties(physical_device);
            let memory = instance.get_physical_device_memory_properties(physical_device);
            let families = instance.get_physical_device_queue_family_properties(physical_device);

            let extensions: HashSet<String> = instance
                .enumerate_device_extension_properties(physical_device)
                .unwrap_or_default()
                .iter()
                .filter_map(|ext| {
                    ext.extension_name_as_c_str()
                        .ok()
                        .and_then(|name| name.to_str().ok())
                        .map(String::from)
                })
                .collect();

            let name = properties
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "Unknown GPU".to_string());

            let surface_loader = self.surface_loader()?;
            let queue_families = families
                .iter()
                .enumerate()
                .map(|(index, family)| {
                    let index = index as u32;
                    let supports_present = surface_loader
                        .get_physical_device_surface_support(physical_device, index, surface)
                        .unwrap_or(false);
                    QueueFamilyInfo {
                        index,
                        flags: family.queue_flags,
                        queue_count: family.queue_count,
                        supports_present,
                    }
                })
                .collect();

            Ok(AdapterInfo {
                handle: physical_device,
                name,
                vendor: GpuVendor::from_vendor_id(properties.vendor_id),
                device_type: properties.device_type,
                api_version: properties.api_version,
                driver_version: properties.driver_version,
                features: query_features(instance, physical_device, properties.api_version),
                extensions,
                queue_families,
                memory_heaps: memory
                    .memory_heaps
                    .iter()
                    .take(memory.memory_heap_count as usize)
                    .map(|heap| MemoryHeapInfo {
                        size: heap.size,
                        device_local: heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL),
                    })
                    .collect(),
                memory_types: memory
                    .memory_types
                    .iter()
                    .take(memory.memory_type_count as usize)
                    .map(|ty| MemoryTypeInfo {
                        heap_index: ty.heap_index,
                        flags: ty.property_flags,
                    })
                    .collect(),
                buffer_image_granularity: properties.limits.buffer_image_granularity,
            })
        }
    }
}

impl std::fmt::Debug for VulkanDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDriver")
            .field("instance", &self.instance.is_some())
            .field("debug_messenger", &self.debug.is_some())
            .field("device", &self.device.is_some())
            .finish()
    }
}

impl Driver for VulkanDriver {
    type SurfaceTarget = WindowTarget;
    type Memory = ManagedBackend;

    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn dispatch_slot(&self) -> Arc<DispatchSlot> {
        Arc::clone(DISPATCH.get_or_init(|| DispatchSlot::new("vulkan")))
    }

    fn bootstrap(&mut self, desc: &InstanceDesc, target: &WindowTarget) -> Result<()> {
        if self.instance.is_some() {
            return Err(GpuError::InvalidState("Driver already bootstrapped".to_string()));
        }
        let entry = entry()?;

        let app_name = CString::new(desc.app_name.as_str())
            .map_err(|e| GpuError::DriverInit(format!("Invalid application name: {e}")))?;
        let engine_name = CString::new(desc.engine_name.as_str())
            .map_err(|e| GpuError::DriverInit(format!("Invalid engine name: {e}")))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(desc.api_version);

        let mut extension_names: Vec<*const c_char> =
            ash_window::enumerate_required_extensions(target.display)?.to_vec();

        #[cfg(target_os = "macos")]
        extension_names.push(ash::khr::portability_enumeration::NAME.as_ptr());

        // SAFETY: the entry is loaded.
        let (available_extensions, available_layers) = unsafe {
            (
                entry.enumerate_instance_extension_properties(None)?,
                entry.enumerate_instance_layer_properties()?,
            )
        };

        let debug_utils_available = available_extensions
            .iter()
            .any(|ext| ext.extension_name_as_c_str() == Ok(ash::ext::debug_utils::NAME));
        let validation_available = available_layers
            .iter()
            .any(|layer| layer.layer_name_as_c_str() == Ok(VALIDATION_LAYER));

        let mut layer_names: Vec<*const c_char> = Vec::new();
        let validation = desc.validation && debug_utils_available && validation_available;
        if desc.validation && !validation {
            tracing::warn!("Validation layer {VALIDATION_LAYER:?} not available");
        }
        if validation {
            extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
            layer_names.push(VALIDATION_LAYER.as_ptr());
        }

        // Required for MoltenVK on macOS
        #[cfg(target_os = "macos")]
        let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        #[cfg(not(target_os = "macos"))]
        let create_flags = vk::InstanceCreateFlags::empty();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names)
            .flags(create_flags);

        // SAFETY: every pointer in the create info outlives the call.
        let instance = unsafe { entry.create_instance(&create_info, None)? };

        if validation {
            let debug_utils = ash::ext::debug_utils::Instance::new(entry, &instance);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_callback));

            // SAFETY: the instance was created with the debug utils extension.
            match unsafe { debug_utils.create_debug_utils_messenger(&messenger_info, None) } {
                Ok(messenger) => self.debug = Some((debug_utils, messenger)),
                Err(e) => tracing::warn!("Failed to create debug messenger: {e}"),
            }
        }

        self.surface_loader = Some(ash::khr::surface::Instance::new(entry, &instance));
        self.instance = Some(instance);

        tracing::info!(
            "Vulkan instance created (validation: {})",
            if validation { "on" } else { "off" }
        );
        Ok(())
    }

    fn create_surface(&mut self, target: &WindowTarget) -> Result<vk::SurfaceKHR> {
        let entry = entry()?;
        let instance = self.loaded_instance()?;

        // SAFETY: the window handles are live for the context's lifetime.
        let surface = unsafe {
            ash_window::create_surface(entry, instance, target.display, target.window, None)
        }
        .map_err(|e| GpuError::SurfaceIncompatible(format!("Surface creation failed: {e}")))?;

        Ok(surface)
    }

    unsafe fn enumerate_adapters(&self, surface: vk::SurfaceKHR) -> Result<Vec<AdapterInfo>> {
        let instance = self.loaded_instance()?;
        // SAFETY: the instance is live.
        let devices = unsafe { instance.enumerate_physical_devices()? };

        devices
            .into_iter()
            // SAFETY: enumerated from the live instance.
            .map(|device| unsafe { self.describe_adapter(instance, device, surface) })
            .collect()
    }

    fn create_device(
        &mut self,
        adapter: &AdapterInfo,
        plan: &QueuePlan,
        extensions: &[String],
    ) -> Result<()> {
        let instance = self.loaded_instance()?;

        let queue_priority = 1.0_f32;
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = plan
            .unique_families()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(std::slice::from_ref(&queue_priority))
            })
            .collect();

        let extension_names = extensions
            .iter()
            .map(|name| CString::new(name.as_str()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| GpuError::DriverInit(format!("Invalid extension name: {e}")))?;
        let extension_ptrs: Vec<*const c_char> =
            extension_names.iter().map(|name| name.as_ptr()).collect();

        let supported = adapter.features;
        let features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(supported.contains(DeviceFeatures::SAMPLER_ANISOTROPY))
            .geometry_shader(supported.contains(DeviceFeatures::GEOMETRY_SHADER));
        let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(supported.contains(DeviceFeatures::BUFFER_DEVICE_ADDRESS))
            .descriptor_indexing(supported.contains(DeviceFeatures::DESCRIPTOR_INDEXING))
            .timeline_semaphore(supported.contains(DeviceFeatures::TIMELINE_SEMAPHORE));
        let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(supported.contains(DeviceFeatures::DYNAMIC_RENDERING))
            .synchronization2(supported.contains(DeviceFeatures::SYNCHRONIZATION_2));

        let mut features2 = vk::PhysicalDeviceFeatures2::default().features(features);
        if api_at_least(adapter.api_version, vk::API_VERSION_1_3) {
            features2 = features2.push_next(&mut vulkan_1_3_features);
        }
        if api_at_least(adapter.api_version, vk::API_VERSION_1_2) {
            features2 = features2.push_next(&mut vulkan_1_2_features);
        }

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_ptrs)
            .push_next(&mut features2);

        // SAFETY: the adapter was enumerated from this instance.
        let device = unsafe { instance.create_device(adapter.handle, &create_info, None)? };
        let swapchain_loader = ash::khr::swapchain::Device::new(instance, &device);

        tracing::debug!("Logical device created with {} queue families", queue_create_infos.len());
        self.device = Some(DeviceState {
            device,
            swapchain_loader,
        });
        Ok(())
    }

    fn queue(&self, family: u32, index: u32) -> Result<vk::Queue> {
        let state = self.state()?;
        // SAFETY: the device was created with one queue per planned family.
        Ok(unsafe { state.device.get_device_queue(family, index) })
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        match &self.device {
            // SAFETY: the device is live.
            Some(state) => unsafe { state.device.device_wait_idle() },
            None => Ok(()),
        }
    }

    unsafe fn destroy_surface(&mut self, surface: vk::SurfaceKHR) {
        if let Some(loader) = &self.surface_loader {
            // SAFETY: guaranteed by the caller.
            unsafe { loader.destroy_surface(surface, None) };
        }
    }

    unsafe fn destroy(&mut self) {
        if let Some(state) = self.device.take() {
            // SAFETY: every device object has been destroyed by the caller.
            unsafe { state.device.destroy_device(None) };
            tracing::debug!("Logical device destroyed");
        }
        if let Some((debug_utils, messenger)) = self.debug.take() {
            // SAFETY: last use of the messenger, created from this instance.
            unsafe { debug_utils.destroy_debug_utils_messenger(messenger, None) };
        }
        self.surface_loader = None;
        if let Some(instance) = self.instance.take() {
            // SAFETY: every child object is gone.
            unsafe { instance.destroy_instance(None) };
            tracing::debug!("Vulkan instance destroyed");
        }
    }

    unsafe fn surface_support(
        &self,
        adapter: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> VkResult<SurfaceSupport> {
        let loader = self.surface_loader()?;
        // SAFETY: guaranteed by the caller.
        unsafe {
            Ok(SurfaceSupport {
                capabilities: loader.get_physical_device_surface_capabilities(adapter, surface)?,
                formats: loader.get_physical_device_surface_formats(adapter, surface)?,
                present_modes: loader.get_physical_device_surface_present_modes(adapter, surface)?,
            })
        }
    }

    unsafe fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        let state = self.state()?;
        let sharing_mode = if desc.queue_families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(desc.surface)
            .min_image_count(desc.min_image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(desc.usage)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&desc.queue_families)
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(desc.old_swapchain);

        // SAFETY: guaranteed by the caller.
        unsafe { state.swapchain_loader.create_swapchain(&create_info, None) }
    }

    unsafe fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        // SAFETY: guaranteed by the caller.
        unsafe { self.state()?.swapchain_loader.get_swapchain_images(swapchain) }
    }

    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if let Ok(state) = self.state() {
            // SAFETY: guaranteed by the caller.
            unsafe { state.swapchain_loader.destroy_swapchain(swapchain, None) };
        }
    }

    unsafe fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
    ) -> VkResult<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(color_subresource_range());

        // SAFETY: guaranteed by the caller.
        unsafe { self.state()?.device.create_image_view(&view_info, None) }
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        if let Ok(state) = self.state() {
            // SAFETY: guaranteed by the caller.
            unsafe { state.device.destroy_image_view(view, None) };
        }
    }

    unsafe fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        // SAFETY: guaranteed by the caller.
        unsafe {
            self.state()?.swapchain_loader.acquire_next_image(
                swapchain,
                timeout_ns,
                semaphore,
                vk::Fence::null(),
            )
        }
    }

    unsafe fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        // SAFETY: guaranteed by the caller.
        unsafe { self.state()?.swapchain_loader.queue_present(queue, &present_info) }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        // SAFETY: the device is live.
        unsafe { self.state()?.device.create_semaphore(&info, None) }
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        if let Ok(state) = self.state() {
            // SAFETY: guaranteed by the caller.
            unsafe { state.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        // SAFETY: the device is live.
        unsafe { self.state()?.device.create_fence(&info, None) }
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        if let Ok(state) = self.state() {
            // SAFETY: guaranteed by the caller.
            unsafe { state.device.destroy_fence(fence, None) };
        }
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        // SAFETY: guaranteed by the caller.
        unsafe { self.state()?.device.wait_for_fences(&[fence], true, timeout_ns) }
    }

    unsafe fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        // SAFETY: guaranteed by the caller.
        unsafe { self.state()?.device.get_fence_status(fence) }
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        // SAFETY: guaranteed by the caller.
        unsafe { self.state()?.device.reset_fences(&[fence]) }
    }

    fn create_command_pool(&self, queue_family: u32) -> VkResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);
        // SAFETY: the device is live.
        unsafe { self.state()?.device.create_command_pool(&info, None) }
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        if let Ok(state) = self.state() {
            // SAFETY: guaranteed by the caller.
            unsafe { state.device.destroy_command_pool(pool, None) };
        }
    }

    unsafe fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        // SAFETY: guaranteed by the caller.
        unsafe { self.state()?.device.allocate_command_buffers(&info) }
    }

    unsafe fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let device = &self.state()?.device;
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        // SAFETY: guaranteed by the caller.
        unsafe {
            device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(command_buffer, &begin_info)
        }
    }

    unsafe fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        // SAFETY: guaranteed by the caller.
        unsafe { self.state()?.device.end_command_buffer(command_buffer) }
    }

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submit: &SubmitDesc,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&submit.wait_semaphores)
            .wait_dst_stage_mask(&submit.wait_stages)
            .command_buffers(&submit.command_buffers)
            .signal_semaphores(&submit.signal_semaphores);
        // SAFETY: guaranteed by the caller.
        unsafe { self.state()?.device.queue_submit(queue, &[submit_info], fence) }
    }

    fn allocate_memory(&self, memory_type: u32, size: u64) -> VkResult<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type);
        // SAFETY: the device is live.
        unsafe { self.state()?.device.allocate_memory(&info, None) }
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        if let Ok(state) = self.state() {
            // SAFETY: guaranteed by the caller; freeing implicitly unmaps.
            unsafe { state.device.free_memory(memory, None) };
        }
    }

    unsafe fn map_memory(&self, memory: vk::DeviceMemory, size: u64) -> VkResult<NonNull<u8>> {
        // SAFETY: guaranteed by the caller.
        let ptr = unsafe {
            self.state()?
                .device
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())?
        };
        NonNull::new(ptr.cast::<u8>()).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)
    }

    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // SAFETY: the device is live.
        unsafe { self.state()?.device.create_buffer(&info, None) }
    }

    unsafe fn buffer_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        match self.state() {
            // SAFETY: guaranteed by the caller.
            Ok(state) => unsafe { state.device.get_buffer_memory_requirements(buffer) },
            Err(_) => vk::MemoryRequirements::default(),
        }
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()> {
        // SAFETY: guaranteed by the caller.
        unsafe { self.state()?.device.bind_buffer_memory(buffer, memory, offset) }
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        if let Ok(state) = self.state() {
            // SAFETY: guaranteed by the caller.
            unsafe { state.device.destroy_buffer(buffer, None) };
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> VkResult<vk::Image> {
        let info = vk::ImageCreateInfo::default()
            .image_type(if desc.extent.depth > 1 {
                vk::ImageType::TYPE_3D
            } else {
                vk::ImageType::TYPE_2D
            })
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        // SAFETY: the device is live.
        unsafe { self.state()?.device.create_image(&info, None) }
    }

    unsafe fn image_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        match self.state() {
            // SAFETY: guaranteed by the caller.
            Ok(state) => unsafe { state.device.get_image_memory_requirements(image) },
            Err(_) => vk::MemoryRequirements::default(),
        }
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()> {
        // SAFETY: guaranteed by the caller.
        unsafe { self.state()?.device.bind_image_memory(image, memory, offset) }
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        if let Ok(state) = self.state() {
            // SAFETY: guaranteed by the caller.
            unsafe { state.device.destroy_image(image, None) };
        }
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        // SAFETY: the device context destroys its objects before dropping the driver.
        unsafe { self.destroy() };
    }
}

/// Full color subresource range of a single-mip, single-layer image.
pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

/// # Safety
/// The instance and physical device must be live.
unsafe fn query_features(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    api_version: u32,
) -> DeviceFeatures {
    let mut vulkan_1_2 = vk::PhysicalDeviceVulkan12Features::default();
    let mut vulkan_1_3 = vk::PhysicalDeviceVulkan13Features::default();
    let has_1_2 = api_at_least(api_version, vk::API_VERSION_1_2);
    let has_1_3 = api_at_least(api_version, vk::API_VERSION_1_3);

    let mut features2 = vk::PhysicalDeviceFeatures2::default();
    if has_1_2 {
        features2 = features2.push_next(&mut vulkan_1_2);
    }
    if has_1_3 {
        features2 = features2.push_next(&mut vulkan_1_3);
    }
    // SAFETY: guaranteed by the caller.
    unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
    let base = features2.features;

    let mut features = DeviceFeatures::empty();
    features.set(
        DeviceFeatures::SAMPLER_ANISOTROPY,
        base.sampler_anisotropy == vk::TRUE,
    );
    features.set(DeviceFeatures::GEOMETRY_SHADER, base.geometry_shader == vk::TRUE);
    if has_1_2 {
        features.set(
            DeviceFeatures::BUFFER_DEVICE_ADDRESS,
            vulkan_1_2.buffer_device_address == vk::TRUE,
        );
        features.set(
            DeviceFeatures::DESCRIPTOR_INDEXING,
            vulkan_1_2.descriptor_indexing == vk::TRUE,
        );
        features.set(
            DeviceFeatures::TIMELINE_SEMAPHORE,
            vulkan_1_2.timeline_semaphore == vk::TRUE,
        );
    }
    if has_1_3 {
        features.set(
            DeviceFeatures::DYNAMIC_RENDERING,
            vulkan_1_3.dynamic_rendering == vk::TRUE,
        );
        features.set(
            DeviceFeatures::SYNCHRONIZATION_2,
            vulkan_1_3.synchronization2 == vk::TRUE,
        );
    }
    features
}

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    // SAFETY: the loader passes valid callback data for the duration of the call.
    let message = unsafe {
        p_callback_data
            .as_ref()
            .and_then(|data| data.message_as_c_str())
            .map(CStr::to_string_lossy)
            .unwrap_or_default()
    };

    let kind = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "GENERAL",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "VALIDATION",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "PERFORMANCE",
        _ => "UNKNOWN",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(target: "vkl_gpu::validation", "[{kind}] {message}");
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(target: "vkl_gpu::validation", "[{kind}] {message}");
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::info!(target: "vkl_gpu::validation", "[{kind}] {message}");
        }
        _ => {
            tracing::trace!(target: "vkl_gpu::validation", "[{kind}] {message}");
        }
    }

    vk::FALSE
}
