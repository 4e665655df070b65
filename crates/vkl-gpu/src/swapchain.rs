//! Swapchain management.

use crate::context::{DeviceContext, QueueRole};
use crate::driver::{Driver, SurfaceSupport, SwapchainDesc};
use crate::error::{GpuError, Result};
use crate::sync::timeout_ns;
use ash::vk;
use std::time::Duration;

/// Swapchain configuration.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainConfig {
    /// Requested image count, clamped to what the surface allows.
    pub image_count: u32,
    pub vsync: bool,
    pub preferred_format: vk::SurfaceFormatKHR,
    pub usage: vk::ImageUsageFlags,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            image_count: 3,
            vsync: true,
            preferred_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
        }
    }
}

impl SwapchainConfig {
    pub fn with_image_count(mut self, count: u32) -> Self {
        self.image_count = count;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_preferred_format(mut self, format: vk::SurfaceFormatKHR) -> Self {
        self.preferred_format = format;
        self
    }

    pub fn with_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }
}

/// An image handed out by [`SwapchainManager::acquire_next_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    pub image: vk::Image,
    pub view: vk::ImageView,
    /// Swapchain generation the image belongs to.
    pub generation: u64,
    /// The swapchain still works but no longer matches the surface.
    pub suboptimal: bool,
}

/// Owner of the presentable image chain.
///
/// The chain is rebuilt wholesale; every build bumps [`Self::generation`].
/// Each image has its own render-finished semaphore: a presentation may
/// still wait on it until the same image is acquired again.
#[derive(Debug)]
pub struct SwapchainManager {
    config: SwapchainConfig,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    render_finished: Vec<vk::Semaphore>,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    generation: u64,
}

impl SwapchainManager {
    /// Create a swapchain for the context's surface.
    ///
    /// `extent` is used when the surface leaves the size to the swapchain.
    pub fn create<D: Driver>(
        ctx: &DeviceContext<D>,
        config: SwapchainConfig,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let mut manager = Self {
            config,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            views: Vec::new(),
            render_finished: Vec::new(),
            format: config.preferred_format,
            present_mode: vk::PresentModeKHR::FIFO,
            extent,
            generation: 0,
        };
        manager.build(ctx, extent)?;
        Ok(manager)
    }

    /// Destroy and recreate the image chain at `extent`.
    ///
    /// No pending work may reference the current images; the frame pipeline
    /// must be drained first. A zero extent fails with `SurfaceIncompatible`
    /// and leaves the current chain untouched.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn rebuild<D: Driver>(&mut self, ctx: &DeviceContext<D>, extent: vk::Extent2D) -> Result<()> {
        // Presentations may still wait on the old render-finished semaphores
        ctx.wait_idle()?;
        self.build(ctx, extent)
    }

    /// Acquire the next presentable image, signalling `semaphore` when it is ready.
    ///
    /// `OutOfDate` means no image was acquired and the chain must be rebuilt;
    /// `Timeout` may be retried.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn acquire_next_image<D: Driver>(
        &self,
        ctx: &DeviceContext<D>,
        timeout: Duration,
        semaphore: vk::Semaphore,
    ) -> Result<AcquiredImage> {
        if self.swapchain == vk::SwapchainKHR::null() {
            return Err(GpuError::OutOfDate);
        }

        // SAFETY: the swapchain is live and the semaphore belongs to the same driver.
        let (index, suboptimal) = unsafe {
            ctx.driver()
                .acquire_next_image(self.swapchain, timeout_ns(timeout), semaphore)?
        };

        let (Some(&image), Some(&view)) = (
            self.images.get(index as usize),
            self.views.get(index as usize),
        ) else {
            return Err(GpuError::InvalidState(format!(
                "Driver returned image index {index} of {}",
                self.images.len()
            )));
        };

        tracing::trace!("Acquired image {index} (generation {})", self.generation);

        Ok(AcquiredImage {
            index,
            image,
            view,
            generation: self.generation,
            suboptimal,
        })
    }

    /// Queue an acquired image for presentation once `wait_semaphores` signal.
    ///
    /// A suboptimal present has still been queued; it is reported as
    /// [`GpuError::Suboptimal`] so the caller rebuilds.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn present<D: Driver>(
        &self,
        ctx: &DeviceContext<D>,
        queue: vk::Queue,
        image: &AcquiredImage,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<()> {
        if image.generation != self.generation || self.swapchain == vk::SwapchainKHR::null() {
            return Err(GpuError::InvalidState(format!(
                "Image {} belongs to swapchain generation {}, current is {}",
                image.index, image.generation, self.generation
            )));
        }

        // SAFETY: the image was acquired from the live swapchain.
        let result = unsafe {
            ctx.driver()
                .queue_present(queue, self.swapchain, image.index, wait_semaphores)
        };

        match result {
            Ok(false) => Ok(()),
            Ok(true) => {
                tracing::warn!("Swapchain suboptimal after present");
                Err(GpuError::Suboptimal)
            }
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Destroy the image views, the swapchain and its semaphores.
    ///
    /// # Safety
    /// No pending work or presentation may reference the swapchain images.
    pub unsafe fn destroy<D: Driver>(&mut self, ctx: &DeviceContext<D>) {
        let driver = ctx.driver();
        for view in self.views.drain(..) {
            // SAFETY: guaranteed idle by the caller.
            unsafe { driver.destroy_image_view(view) };
        }
        self.images.clear();
        if self.swapchain != vk::SwapchainKHR::null() {
            // SAFETY: guaranteed idle by the caller.
            unsafe { driver.destroy_swapchain(self.swapchain) };
            self.swapchain = vk::SwapchainKHR::null();
            tracing::debug!("Swapchain destroyed (generation {})", self.generation);
        }
        for semaphore in self.render_finished.drain(..) {
            // SAFETY: guaranteed idle by the caller.
            unsafe { driver.destroy_semaphore(semaphore) };
        }
    }

    /// The raw swapchain handle; null after a failed rebuild.
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    /// Semaphore to signal when rendering to image `index` is done, and to
    /// wait on when presenting it.
    pub fn render_finished(&self, index: u32) -> Option<vk::Semaphore> {
        self.render_finished.get(index as usize).copied()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Number of successful builds so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> &SwapchainConfig {
        &self.config
    }

    /// Change vsync; takes effect on the next rebuild.
    pub fn set_vsync(&mut self, vsync: bool) {
        self.config.vsync = vsync;
    }

    fn build<D: Driver>(&mut self, ctx: &DeviceContext<D>, desired: vk::Extent2D) -> Result<()> {
        let driver = ctx.driver();

        // SAFETY: the adapter and surface are owned by the context.
        let support = unsafe { driver.surface_support(ctx.physical_device(), ctx.surface())? };
        let plan = self.plan(&support, desired)?;

        let graphics = ctx.queue_family(QueueRole::Graphics);
        let present = ctx.queue_family(QueueRole::Present);
        let queue_families = if graphics == present {
            vec![graphics]
        } else {
            vec![graphics, present]
        };

        let old = self.swapchain;
        let desc = SwapchainDesc {
            surface: ctx.surface(),
            min_image_count: plan.image_count,
            format: plan.format,
            extent: plan.extent,
            usage: self.config.usage,
            queue_families,
            pre_transform: support.capabilities.current_transform,
            present_mode: plan.present_mode,
            old_swapchain: old,
        };

        // SAFETY: the surface and old swapchain are live.
        let created = unsafe { driver.create_swapchain(&desc) };

        // The old chain is retired by the create call whether or not it succeeded
        // SAFETY: the caller drained all work referencing the old images.
        unsafe { self.destroy(ctx) };

        let swapchain = created.map_err(|e| match e {
            vk::Result::ERROR_SURFACE_LOST_KHR | vk::Result::ERROR_NATIVE_WINDOW_IN_USE_KHR => {
                GpuError::SurfaceIncompatible(format!("swapchain creation: {e}"))
            }
            other => GpuError::from(other),
        })?;

        // SAFETY: created above.
        let images = match unsafe { driver.swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                // SAFETY: nothing references the new swapchain yet.
                unsafe { driver.destroy_swapchain(swapchain) };
                return Err(e.into());
            }
        };

        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            // SAFETY: the image belongs to the new swapchain.
            match unsafe { driver.create_image_view(image, plan.format.format) } {
                Ok(view) => views.push(view),
                Err(e) => {
                    // SAFETY: nothing references the new objects yet.
                    unsafe {
                        for view in views {
                            driver.destroy_image_view(view);
                        }
                        driver.destroy_swapchain(swapchain);
                    }
                    return Err(e.into());
                }
            }
        }

        let mut render_finished = Vec::with_capacity(images.len());
        for _ in &images {
            match driver.create_semaphore() {
                Ok(semaphore) => render_finished.push(semaphore),
                Err(e) => {
                    // SAFETY: nothing references the new objects yet.
                    unsafe {
                        for semaphore in render_finished {
                            driver.destroy_semaphore(semaphore);
                        }
                        for view in views {
                            driver.destroy_image_view(view);
                        }
                        driver.destroy_swapchain(swapchain);
                    }
                    return Err(e.into());
                }
            }
        }

        self.swapchain = swapchain;
        self.images = images;
        self.views = views;
        self.render_finished = render_finished;
        self.format = plan.format;
        self.present_mode = plan.present_mode;
        self.extent = plan.extent;
        self.generation += 1;

        tracing::info!(
            "Swapchain generation {}: {}x{}, {} images, {:?}, {:?}",
            self.generation,
            self.extent.width,
            self.extent.height,
            self.images.len(),
            self.format.format,
            self.present_mode
        );

        Ok(())
    }

    fn plan(&self, support: &SurfaceSupport, desired: vk::Extent2D) -> Result<SwapchainPlan> {
        let caps = &support.capabilities;

        if !caps.supported_usage_flags.contains(self.config.usage) {
            return Err(GpuError::SurfaceIncompatible(format!(
                "surface does not support image usage {:?}",
                self.config.usage
            )));
        }

        let format = select_surface_format(&support.formats, self.config.preferred_format)
            .ok_or_else(|| GpuError::SurfaceIncompatible("surface offers no formats".to_string()))?;
        let present_mode = select_present_mode(&support.present_modes, self.config.vsync);

        let extent = calculate_extent(caps, desired.width, desired.height);
        if extent.width == 0 || extent.height == 0 {
            return Err(GpuError::SurfaceIncompatible(format!(
                "zero surface extent {}x{}",
                extent.width, extent.height
            )));
        }

        Ok(SwapchainPlan {
            format,
            present_mode,
            extent,
            image_count: choose_image_count(caps, self.config.image_count),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct SwapchainPlan {
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    image_count: u32,
}

/// Select the preferred surface format, else the first available one.
pub fn select_surface_format(
    available: &[vk::SurfaceFormatKHR],
    preferred: vk::SurfaceFormatKHR,
) -> Option<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
        .or_else(|| available.first())
        .copied()
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    // Mailbox, then immediate, then FIFO (always supported)
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// Clamp the requested image count to the surface limits (`max == 0` means unbounded).
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let count = requested.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn prefers_srgb_format() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let preferred = SwapchainConfig::default().preferred_format;

        assert_eq!(select_surface_format(&[unorm, preferred], preferred), Some(preferred));
        assert_eq!(select_surface_format(&[unorm], preferred), Some(unorm));
        assert_eq!(select_surface_format(&[], preferred), None);
    }

    #[test]
    fn present_mode_order() {
        use vk::PresentModeKHR as M;
        let all = [M::FIFO, M::IMMEDIATE, M::MAILBOX];

        assert_eq!(select_present_mode(&all, true), M::FIFO);
        assert_eq!(select_present_mode(&all, false), M::MAILBOX);
        assert_eq!(select_present_mode(&[M::FIFO, M::IMMEDIATE], false), M::IMMEDIATE);
        assert_eq!(select_present_mode(&[M::FIFO], false), M::FIFO);
    }

    #[test]
    fn extent_follows_surface_or_clamps() {
        let mut c = caps(2, 3);
        assert_eq!(
            calculate_extent(&c, 8000, 600),
            vk::Extent2D {
                width: 4096,
                height: 600
            }
        );

        c.current_extent = vk::Extent2D {
            width: 640,
            height: 480,
        };
        assert_eq!(calculate_extent(&c, 8000, 600), c.current_extent);
    }

    #[test]
    fn image_count_clamped() {
        assert_eq!(choose_image_count(&caps(2, 3), 2), 2);
        assert_eq!(choose_image_count(&caps(2, 3), 8), 3);
        assert_eq!(choose_image_count(&caps(2, 3), 1), 2);
        assert_eq!(choose_image_count(&caps(2, 0), 8), 8);
    }
}
