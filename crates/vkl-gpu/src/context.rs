//! Device context: instance, adapter, logical device and queues.

use crate::capabilities::{select_adapter, AdapterInfo, DeviceRequirements, QueuePlan};
use crate::dispatch::DispatchGuard;
use crate::driver::{Driver, InstanceDesc};
use crate::error::{GpuError, Result};
use ash::vk;

/// Role a queue plays for the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Present,
    Transfer,
}

/// A queue handle and the family it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueHandle {
    pub family: u32,
    pub queue: vk::Queue,
}

/// Owner of the driver, its instance and logical device, and the queues.
///
/// Every other component borrows the context on each call and must release
/// its device objects before the context is dropped.
pub struct DeviceContext<D: Driver> {
    driver: D,
    adapter: AdapterInfo,
    surface: vk::SurfaceKHR,
    plan: QueuePlan,
    graphics: QueueHandle,
    present: QueueHandle,
    transfer: QueueHandle,
    // Dropped after the device is destroyed, releasing the dispatch slot last
    _dispatch: DispatchGuard,
}

impl<D: Driver> DeviceContext<D> {
    /// Create a context for `target`, selecting an adapter that meets `requirements`.
    pub fn create(
        driver: D,
        requirements: DeviceRequirements,
        target: &D::SurfaceTarget,
    ) -> Result<Self> {
        DeviceContextBuilder::new()
            .requirements(requirements)
            .build(driver, target)
    }

    /// The driver, for recorders that need the native API.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// The selected adapter.
    pub fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    /// The physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.adapter.handle
    }

    /// The presentation surface.
    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Queue families chosen for each role.
    pub fn queue_plan(&self) -> &QueuePlan {
        &self.plan
    }

    /// The queue serving `role`.
    pub fn queue(&self, role: QueueRole) -> QueueHandle {
        match role {
            QueueRole::Graphics => self.graphics,
            QueueRole::Present => self.present,
            QueueRole::Transfer => self.transfer,
        }
    }

    /// The queue family serving `role`.
    pub fn queue_family(&self, role: QueueRole) -> u32 {
        self.queue(role).family
    }

    /// Get the graphics queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics.queue
    }

    /// Get the present queue.
    pub fn present_queue(&self) -> vk::Queue {
        self.present.queue
    }

    /// Get the transfer queue.
    pub fn transfer_queue(&self) -> vk::Queue {
        self.transfer.queue
    }

    /// Whether transfers run on their own queue family.
    pub fn has_dedicated_transfer(&self) -> bool {
        self.transfer.family != self.graphics.family
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        self.driver.device_wait_idle()?;
        Ok(())
    }
}

impl<D: Driver> Drop for DeviceContext<D> {
    fn drop(&mut self) {
        tracing::debug!("Destroying device context for {}", self.adapter.name);
        if let Err(e) = self.driver.device_wait_idle() {
            tracing::warn!("Device wait idle failed during teardown: {e}");
        }
        // SAFETY: the context is destroyed last; all components created from it
        // have released their device objects.
        unsafe {
            self.driver.destroy_surface(self.surface);
            self.driver.destroy();
        }
    }
}

impl<D: Driver> std::fmt::Debug for DeviceContext<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("driver", &self.driver.name())
            .field("adapter", &self.adapter.name)
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

/// Builder for creating a device context.
#[derive(Debug, Clone)]
pub struct DeviceContextBuilder {
    instance: InstanceDesc,
    requirements: DeviceRequirements,
}

impl Default for DeviceContextBuilder {
    fn default() -> Self {
        Self {
            instance: InstanceDesc::default(),
            requirements: DeviceRequirements::default(),
        }
    }
}

impl DeviceContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.instance.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.instance.validation = enable;
        self
    }

    /// Set the instance API version.
    pub fn api_version(mut self, version: u32) -> Self {
        self.instance.api_version = version;
        self
    }

    /// Replace the device requirements.
    pub fn requirements(mut self, requirements: DeviceRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Build the device context.
    ///
    /// Claims the driver's dispatch slot first; a second live context on the
    /// same driver fails with [`GpuError::DoubleInit`] without touching the
    /// driver. Anything created before a later failure is released when the
    /// driver is dropped.
    pub fn build<D: Driver>(self, mut driver: D, target: &D::SurfaceTarget) -> Result<DeviceContext<D>> {
        let dispatch = driver.dispatch_slot().claim()?;

        if let Err(e) = driver.bootstrap(&self.instance, target) {
            // SAFETY: no device objects exist yet.
            unsafe { driver.destroy() };
            return Err(match e {
                GpuError::DriverInit(_) => e,
                other => GpuError::DriverInit(other.to_string()),
            });
        }

        let surface = match driver.create_surface(target) {
            Ok(surface) => surface,
            Err(e) => {
                // SAFETY: no device objects exist yet.
                unsafe { driver.destroy() };
                return Err(e);
            }
        };

        // SAFETY: the surface was just created by this driver.
        let adapters = match unsafe { driver.enumerate_adapters(surface) } {
            Ok(adapters) => adapters,
            Err(e) => {
                release_partial(&mut driver, surface);
                return Err(e);
            }
        };

        let (index, plan) = match select_adapter(&adapters, &self.requirements) {
            Ok(choice) => choice,
            Err(e) => {
                release_partial(&mut driver, surface);
                return Err(e);
            }
        };
        let adapter = adapters[index].clone();

        tracing::info!("Selected GPU: {}", adapter.summary());
        tracing::debug!(
            "Queue families: graphics={} present={} transfer={}",
            plan.graphics,
            plan.present,
            plan.transfer
        );

        if let Err(e) = driver.create_device(&adapter, &plan, &self.requirements.extensions) {
            release_partial(&mut driver, surface);
            return Err(match e {
                GpuError::Vulkan(code) => GpuError::DriverInit(format!("device creation: {code}")),
                other => other,
            });
        }

        let queues = (|| -> Result<_> {
            Ok((
                QueueHandle {
                    family: plan.graphics,
                    queue: driver.queue(plan.graphics, 0)?,
                },
                QueueHandle {
                    family: plan.present,
                    queue: driver.queue(plan.present, 0)?,
                },
                QueueHandle {
                    family: plan.transfer,
                    queue: driver.queue(plan.transfer, 0)?,
                },
            ))
        })();

        let (graphics, present, transfer) = match queues {
            Ok(queues) => queues,
            Err(e) => {
                release_partial(&mut driver, surface);
                return Err(e);
            }
        };

        Ok(DeviceContext {
            driver,
            adapter,
            surface,
            plan,
            graphics,
            present,
            transfer,
            _dispatch: dispatch,
        })
    }
}

fn release_partial<D: Driver>(driver: &mut D, surface: vk::SurfaceKHR) {
    // SAFETY: nothing was created from the surface or device yet.
    unsafe {
        driver.destroy_surface(surface);
        driver.destroy();
    }
}
