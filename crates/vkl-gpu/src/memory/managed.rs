//! Memory backend for the Vulkan driver, built on `gpu_allocator`.

use super::{AllocatorConfig, AllocatorStats, BoundResource, MemoryBackend, MemoryPlacement, MemoryRequest};
use crate::capabilities::{api_at_least, AdapterInfo, DeviceFeatures};
use crate::error::{GpuError, Result};
use crate::vulkan::VulkanDriver;
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocationError, AllocationSizes, MemoryLocation};
use hashbrown::HashMap;
use std::ptr::NonNull;

/// `gpu_allocator` placement keyed by allocation id.
#[derive(Debug)]
pub struct ManagedBackend {
    allocator: Option<Allocator>,
    allocations: HashMap<u64, Allocation>,
    dedicated_threshold: u64,
}

impl MemoryBackend<VulkanDriver> for ManagedBackend {
    fn create(driver: &VulkanDriver, adapter: &AdapterInfo, config: &AllocatorConfig) -> Result<Self> {
        let (Some(instance), Some(device)) = (driver.instance(), driver.device()) else {
            return Err(GpuError::InvalidState(
                "Allocator needs a live Vulkan device".to_string(),
            ));
        };

        // Must match what the device was created with
        let buffer_device_address = adapter
            .features
            .contains(DeviceFeatures::BUFFER_DEVICE_ADDRESS)
            && api_at_least(adapter.api_version, vk::API_VERSION_1_2);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device: adapter.handle,
            debug_settings: config.debug_settings,
            buffer_device_address,
            allocation_sizes: AllocationSizes::new(config.device_block_size, config.host_block_size),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            allocations: HashMap::new(),
            dedicated_threshold: config.dedicated_threshold,
        })
    }

    fn allocate(
        &mut self,
        _driver: &VulkanDriver,
        request: &MemoryRequest<'_>,
    ) -> Result<MemoryPlacement> {
        let allocator = self
            .allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?;

        let allocation_scheme = if request.requirements.size >= self.dedicated_threshold {
            match request.resource {
                BoundResource::Buffer(buffer) => AllocationScheme::DedicatedBuffer(buffer),
                BoundResource::Image(image) => AllocationScheme::DedicatedImage(image),
            }
        } else {
            AllocationScheme::GpuAllocatorManaged
        };

        let allocation = allocator
            .allocate(&AllocationCreateDesc {
                name: request.name,
                requirements: request.requirements,
                location: request.location,
                linear: request.linear,
                allocation_scheme,
            })
            .map_err(|e| {
                allocation_error(
                    e,
                    request.requirements.size,
                    request.location,
                    request.requirements.memory_type_bits,
                )
            })?;

        let placement = MemoryPlacement {
            // SAFETY: the allocation stays alive until freed through this backend.
            memory: unsafe { allocation.memory() },
            offset: allocation.offset(),
            mapped: allocation.mapped_ptr().map(NonNull::cast),
        };
        self.allocations.insert(request.id, allocation);
        Ok(placement)
    }

    fn free(&mut self, _driver: &VulkanDriver, id: u64) -> Result<()> {
        let allocator = self
            .allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?;
        let allocation = self
            .allocations
            .remove(&id)
            .ok_or_else(|| GpuError::InvalidState(format!("No memory placed for allocation #{id}")))?;

        allocator
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    fn stats(&self) -> AllocatorStats {
        let Some(allocator) = &self.allocator else {
            return AllocatorStats::default();
        };
        let report = allocator.generate_report();
        AllocatorStats {
            blocks: report.blocks.len(),
            reserved_bytes: report.total_reserved_bytes,
            used_bytes: report.total_allocated_bytes,
            allocations: report.allocations.len(),
        }
    }

    fn shutdown(&mut self, _driver: &VulkanDriver) {
        let Some(mut allocator) = self.allocator.take() else {
            return;
        };
        for (id, allocation) in self.allocations.drain() {
            if let Err(e) = allocator.free(allocation) {
                tracing::warn!("Failed to free allocation #{id} during shutdown: {e}");
            }
        }
        // Dropping the allocator frees its memory blocks
        drop(allocator);
    }
}

/// Map a `gpu_allocator` failure onto the allocator's typed errors.
fn allocation_error(
    error: AllocationError,
    size: u64,
    location: MemoryLocation,
    type_bits: u32,
) -> GpuError {
    match error {
        AllocationError::OutOfMemory => match location {
            MemoryLocation::GpuOnly => GpuError::OutOfDeviceMemory { size, location },
            _ => GpuError::OutOfHostMemory { size, location },
        },
        AllocationError::NoCompatibleMemoryTypeFound => {
            GpuError::NoCompatibleMemoryType { location, type_bits }
        }
        other => GpuError::AllocationFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn exhaustion_is_typed_by_usage_class() {
        let device = allocation_error(AllocationError::OutOfMemory, 64, MemoryLocation::GpuOnly, 1);
        assert!(matches!(
            device,
            GpuError::OutOfDeviceMemory {
                size: 64,
                location: MemoryLocation::GpuOnly
            }
        ));
        assert_eq!(device.class(), ErrorClass::ResourceExhaustion);

        let host = allocation_error(AllocationError::OutOfMemory, 64, MemoryLocation::CpuToGpu, 1);
        assert!(matches!(host, GpuError::OutOfHostMemory { .. }));
    }

    #[test]
    fn missing_memory_type_keeps_type_bits() {
        let error = allocation_error(
            AllocationError::NoCompatibleMemoryTypeFound,
            64,
            MemoryLocation::GpuToCpu,
            0b100,
        );
        assert!(matches!(
            error,
            GpuError::NoCompatibleMemoryType {
                location: MemoryLocation::GpuToCpu,
                type_bits: 0b100
            }
        ));
    }

    #[test]
    fn other_failures_keep_their_message() {
        let error = allocation_error(
            AllocationError::FailedToMap("no host access".to_string()),
            64,
            MemoryLocation::CpuToGpu,
            1,
        );
        match error {
            GpuError::AllocationFailed(message) => assert!(message.contains("no host access")),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
