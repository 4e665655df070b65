//! Headless rig over the software adapter.

use ash::vk;
use vkl_gpu::{
    ActiveFrame, AllocatorConfig, DeviceContextBuilder, DeviceRequirements, FramePipelineConfig,
    GpuRuntime, GpuRuntimeConfig, SoftwareAdapterDesc, SoftwareDriver, SoftwareProbe,
    SoftwareSurface, SwapchainConfig,
};

use crate::{init_test_logging, Result, TestError};

const MIB: u64 = 1024 * 1024;

/// Rig configuration.
#[derive(Debug, Clone)]
pub struct RigConfig {
    pub adapters: Vec<SoftwareAdapterDesc>,
    pub surface: SoftwareSurface,
    pub requirements: DeviceRequirements,
    pub runtime: GpuRuntimeConfig,
}

impl Default for RigConfig {
    /// One default adapter, a 2-image swapchain, 2 frames in flight and 1 MiB
    /// allocator blocks.
    fn default() -> Self {
        Self {
            adapters: vec![SoftwareAdapterDesc::default()],
            surface: SoftwareSurface::default(),
            requirements: DeviceRequirements::default(),
            runtime: GpuRuntimeConfig::default()
                .with_allocator(AllocatorConfig::default().with_block_sizes(MIB, MIB))
                .with_swapchain(SwapchainConfig::default().with_image_count(2))
                .with_frames(FramePipelineConfig::default()),
        }
    }
}

impl RigConfig {
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.runtime.frames = self.runtime.frames.with_frames_in_flight(frames);
        self
    }

    pub fn with_image_count(mut self, count: u32) -> Self {
        self.runtime.swapchain = self.runtime.swapchain.with_image_count(count);
        self
    }

    pub fn with_allocator(mut self, config: AllocatorConfig) -> Self {
        self.runtime.allocator = config;
        self
    }

    pub fn with_adapters(mut self, adapters: Vec<SoftwareAdapterDesc>) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn with_surface(mut self, surface: SoftwareSurface) -> Self {
        self.surface = surface;
        self
    }

    pub fn with_requirements(mut self, requirements: DeviceRequirements) -> Self {
        self.requirements = requirements;
        self
    }
}

/// A [`GpuRuntime`] on the software driver, plus a probe into the driver.
pub struct SoftwareRig {
    runtime: GpuRuntime<SoftwareDriver>,
    driver: SoftwareDriver,
    probe: SoftwareProbe,
    extent: vk::Extent2D,
}

impl SoftwareRig {
    /// Build the runtime.
    pub fn new(config: RigConfig) -> Result<Self> {
        init_test_logging();

        let driver = SoftwareDriver::new(config.adapters);
        let probe = driver.probe();
        let extent = config.surface.extent;

        let context = DeviceContextBuilder::new()
            .app_name("vkl-test")
            .requirements(config.requirements);
        let runtime = GpuRuntime::new(
            driver.clone(),
            &config.surface,
            context,
            config.runtime,
            extent,
        )?;

        Ok(Self {
            runtime,
            driver,
            probe,
            extent,
        })
    }

    pub fn runtime(&self) -> &GpuRuntime<SoftwareDriver> {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut GpuRuntime<SoftwareDriver> {
        &mut self.runtime
    }

    pub fn probe(&self) -> &SoftwareProbe {
        &self.probe
    }

    /// A handle to the same simulated driver, sharing its dispatch slot.
    pub fn driver(&self) -> SoftwareDriver {
        self.driver.clone()
    }

    /// Run one frame with an empty recording.
    pub fn run_frame(&mut self) -> Result<ActiveFrame> {
        let frame = self.runtime.begin_frame()?;
        self.runtime.record(|_, _| ())?;
        self.runtime.end_frame()?;
        Ok(frame)
    }

    /// Run `count` frames, stopping at the first error.
    pub fn run_frames(&mut self, count: usize) -> Result<Vec<ActiveFrame>> {
        (0..count).map(|_| self.run_frame()).collect()
    }

    /// Resize the simulated window.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.extent = vk::Extent2D { width, height };
        self.probe.resize(width, height);
    }

    /// Rebuild the swapchain at the current window size.
    pub fn rebuild(&mut self) -> Result<()> {
        self.runtime.rebuild(self.extent)?;
        Ok(())
    }

    /// Tear the runtime down and check the driver saw no misuse and no leaks.
    pub fn shutdown(self) -> Result<()> {
        self.runtime.shutdown();

        let violations = self.probe.violations();
        if !violations.is_empty() {
            for violation in &violations {
                tracing::error!("Driver violation: {violation}");
            }
            return Err(TestError::Violations(violations));
        }
        match self.probe.live_objects() {
            0 => Ok(()),
            live => Err(TestError::Leaked(live)),
        }
    }
}

impl std::fmt::Debug for SoftwareRig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareRig")
            .field("runtime", &self.runtime)
            .field("extent", &self.extent)
            .finish_non_exhaustive()
    }
}
