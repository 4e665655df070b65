//! GPU error types.

use ash::vk;
use gpu_allocator::MemoryLocation;
use std::time::Duration;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error without a more specific classification.
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),

    /// Loading the driver or creating the instance/device failed.
    #[error("Driver initialization failed: {0}")]
    DriverInit(String),

    /// The dispatch table is already owned by a live device context.
    #[error("Dispatch loader already initialized by a live device context")]
    DoubleInit,

    /// No adapter satisfies the requested capabilities.
    #[error("No suitable GPU found: {0}")]
    NoSuitableDevice(String),

    /// The surface cannot host a swapchain with the requested settings.
    #[error("Surface incompatible: {0}")]
    SurfaceIncompatible(String),

    /// No memory type matches the resource and usage class.
    #[error("No compatible memory type for {location:?} (type bits {type_bits:#x})")]
    NoCompatibleMemoryType {
        location: MemoryLocation,
        type_bits: u32,
    },

    /// Device-local heap exhausted.
    #[error("Out of device memory: requested {size} bytes ({location:?})")]
    OutOfDeviceMemory { size: u64, location: MemoryLocation },

    /// Host heap exhausted.
    #[error("Out of host memory: requested {size} bytes ({location:?})")]
    OutOfHostMemory { size: u64, location: MemoryLocation },

    /// Enough memory is free in the pool but no contiguous range fits.
    #[error(
        "Allocation of {size} bytes ({location:?}) failed due to fragmentation ({free_bytes} bytes free)"
    )]
    Fragmentation {
        size: u64,
        location: MemoryLocation,
        free_bytes: u64,
    },

    /// The memory backend failed for a reason other than exhaustion.
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// Swapchain no longer matches the surface and must be rebuilt.
    #[error("Swapchain out of date")]
    OutOfDate,

    /// Presentation succeeded but the swapchain should be rebuilt.
    #[error("Swapchain suboptimal")]
    Suboptimal,

    /// Image acquisition timed out; the caller may retry.
    #[error("Timed out acquiring swapchain image")]
    Timeout,

    /// Waiting for a frame slot's previous submission exceeded the bound.
    #[error("Timed out after {timeout:?} waiting for frame slot {slot}")]
    FrameTimeout { slot: usize, timeout: Duration },

    /// The logical device was lost.
    #[error("Device lost")]
    DeviceLost,

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Error class, used by callers to pick a recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Setup cannot continue.
    SetupFatal,
    /// Retry or rebuild, then carry on.
    Transient,
    /// Typed allocation failure; the caller decides how to make room.
    ResourceExhaustion,
    /// Requires full teardown and recreation of the device context.
    RuntimeFatal,
    /// API misuse or an unclassified driver error.
    Usage,
}

impl GpuError {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::DriverInit(_) | Self::DoubleInit | Self::NoSuitableDevice(_) => {
                ErrorClass::SetupFatal
            }
            Self::SurfaceIncompatible(_) => ErrorClass::SetupFatal,
            Self::OutOfDate | Self::Suboptimal | Self::Timeout | Self::FrameTimeout { .. } => {
                ErrorClass::Transient
            }
            Self::OutOfDeviceMemory { .. }
            | Self::OutOfHostMemory { .. }
            | Self::Fragmentation { .. }
            | Self::NoCompatibleMemoryType { .. } => ErrorClass::ResourceExhaustion,
            Self::DeviceLost => ErrorClass::RuntimeFatal,
            Self::Vulkan(_) | Self::AllocationFailed(_) | Self::InvalidState(_) => {
                ErrorClass::Usage
            }
        }
    }

    /// Whether the swapchain must be rebuilt before rendering continues.
    pub fn requires_rebuild(&self) -> bool {
        matches!(self, Self::OutOfDate | Self::Suboptimal)
    }

    /// Whether the application must stop or recreate the device context.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::SetupFatal | ErrorClass::RuntimeFatal
        )
    }
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::OutOfDate,
            vk::Result::SUBOPTIMAL_KHR => Self::Suboptimal,
            vk::Result::TIMEOUT | vk::Result::NOT_READY => Self::Timeout,
            vk::Result::ERROR_SURFACE_LOST_KHR => {
                Self::SurfaceIncompatible("surface lost".to_string())
            }
            other => Self::Vulkan(other),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_codes_map_to_taxonomy() {
        assert!(matches!(
            GpuError::from(vk::Result::ERROR_DEVICE_LOST),
            GpuError::DeviceLost
        ));
        assert!(matches!(
            GpuError::from(vk::Result::ERROR_OUT_OF_DATE_KHR),
            GpuError::OutOfDate
        ));
        assert!(matches!(
            GpuError::from(vk::Result::TIMEOUT),
            GpuError::Timeout
        ));
        assert!(matches!(
            GpuError::from(vk::Result::ERROR_INITIALIZATION_FAILED),
            GpuError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED)
        ));
    }

    #[test]
    fn classes() {
        assert_eq!(GpuError::DoubleInit.class(), ErrorClass::SetupFatal);
        assert_eq!(GpuError::DeviceLost.class(), ErrorClass::RuntimeFatal);
        assert_eq!(
            GpuError::FrameTimeout {
                slot: 0,
                timeout: Duration::from_millis(5)
            }
            .class(),
            ErrorClass::Transient
        );
        assert_eq!(
            GpuError::OutOfDeviceMemory {
                size: 1,
                location: MemoryLocation::GpuOnly
            }
            .class(),
            ErrorClass::ResourceExhaustion
        );
        assert_eq!(
            GpuError::AllocationFailed("map".to_string()).class(),
            ErrorClass::Usage
        );
        assert!(GpuError::OutOfDate.requires_rebuild());
        assert!(!GpuError::Timeout.requires_rebuild());
        assert!(GpuError::DeviceLost.is_fatal());
        assert!(!GpuError::Suboptimal.is_fatal());
    }
}
