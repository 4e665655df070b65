//! Adapter capabilities and device selection.

use crate::error::{GpuError, Result};
use ash::vk;
use bitflags::bitflags;
use hashbrown::HashSet;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

bitflags! {
    /// Optional device features the core knows how to request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceFeatures: u32 {
        const SAMPLER_ANISOTROPY = 1 << 0;
        const GEOMETRY_SHADER = 1 << 1;
        const DYNAMIC_RENDERING = 1 << 2;
        const SYNCHRONIZATION_2 = 1 << 3;
        const BUFFER_DEVICE_ADDRESS = 1 << 4;
        const DESCRIPTOR_INDEXING = 1 << 5;
        const TIMELINE_SEMAPHORE = 1 << 6;
    }
}

/// A queue family exposed by an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub index: u32,
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    /// Whether this family can present to the context's surface.
    pub supports_present: bool,
}

impl QueueFamilyInfo {
    fn is_graphics(&self) -> bool {
        self.queue_count > 0 && self.flags.contains(vk::QueueFlags::GRAPHICS)
    }

    fn is_dedicated_transfer(&self) -> bool {
        self.queue_count > 0
            && self.flags.contains(vk::QueueFlags::TRANSFER)
            && !self.flags.contains(vk::QueueFlags::GRAPHICS)
    }
}

/// A memory heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHeapInfo {
    pub size: u64,
    pub device_local: bool,
}

/// A memory type and the heap it draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTypeInfo {
    pub heap_index: u32,
    pub flags: vk::MemoryPropertyFlags,
}

/// Everything the core needs to know about a physical device.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub vendor: GpuVendor,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub driver_version: u32,
    pub extensions: HashSet<String>,
    pub features: DeviceFeatures,
    pub queue_families: Vec<QueueFamilyInfo>,
    pub memory_heaps: Vec<MemoryHeapInfo>,
    pub memory_types: Vec<MemoryTypeInfo>,
    pub buffer_image_granularity: u64,
}

impl AdapterInfo {
    /// Total device-local memory in bytes.
    pub fn device_local_memory(&self) -> u64 {
        self.memory_heaps
            .iter()
            .filter(|heap| heap.device_local)
            .map(|heap| heap.size)
            .sum()
    }

    /// Get a human-readable summary of the adapter.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{}.{} - {} MB device-local",
            self.name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory() / (1024 * 1024),
        )
    }
}

/// How transfer work gets a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferQueuePolicy {
    /// Use the graphics queue.
    Shared,
    /// Use a transfer-only family when one exists.
    #[default]
    PreferDedicated,
    /// Reject adapters without a transfer-only family.
    RequireDedicated,
}

/// Which device types rank first when several adapters qualify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    #[default]
    HighPerformance,
    LowPower,
}

/// Declarative device requirements.
#[derive(Debug, Clone)]
pub struct DeviceRequirements {
    pub min_api_version: u32,
    pub extensions: Vec<String>,
    pub features: DeviceFeatures,
    pub require_present: bool,
    pub transfer_queue: TransferQueuePolicy,
    pub min_device_local_memory: u64,
    pub preference: DevicePreference,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            min_api_version: vk::API_VERSION_1_2,
            extensions: vec!["VK_KHR_swapchain".to_string()],
            features: DeviceFeatures::empty(),
            require_present: true,
            transfer_queue: TransferQueuePolicy::default(),
            min_device_local_memory: 0,
            preference: DevicePreference::default(),
        }
    }
}

impl DeviceRequirements {
    /// Require an additional device extension.
    pub fn with_extension(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.extensions.contains(&name) {
            self.extensions.push(name);
        }
        self
    }

    /// Require device features.
    pub fn with_features(mut self, features: DeviceFeatures) -> Self {
        self.features |= features;
        self
    }

    /// Set the minimum API version.
    pub fn with_min_api_version(mut self, version: u32) -> Self {
        self.min_api_version = version;
        self
    }

    /// Set the transfer queue policy.
    pub fn with_transfer_queue(mut self, policy: TransferQueuePolicy) -> Self {
        self.transfer_queue = policy;
        self
    }

    /// Set the minimum amount of device-local memory.
    pub fn with_min_device_local_memory(mut self, bytes: u64) -> Self {
        self.min_device_local_memory = bytes;
        self
    }

    /// Set the device-type preference.
    pub fn with_preference(mut self, preference: DevicePreference) -> Self {
        self.preference = preference;
        self
    }

    /// Require or waive presentation support.
    pub fn with_present(mut self, require: bool) -> Self {
        self.require_present = require;
        self
    }
}

/// Queue family chosen for each role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePlan {
    pub graphics: u32,
    pub present: u32,
    pub transfer: u32,
}

impl QueuePlan {
    /// Distinct families, in ascending order.
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families = vec![self.graphics, self.present, self.transfer];
        families.sort_unstable();
        families.dedup();
        families
    }
}

/// Pick the adapter that best satisfies `requirements`.
///
/// Ties go to the lowest index so the choice is stable across runs.
pub fn select_adapter(
    adapters: &[AdapterInfo],
    requirements: &DeviceRequirements,
) -> Result<(usize, QueuePlan)> {
    if adapters.is_empty() {
        return Err(GpuError::NoSuitableDevice("no adapters found".to_string()));
    }

    let mut best: Option<(usize, QueuePlan, u64)> = None;
    let mut rejections = Vec::new();

    for (index, adapter) in adapters.iter().enumerate() {
        match evaluate(adapter, requirements) {
            Ok(plan) => {
                let score = score_adapter(adapter, &plan, requirements);
                tracing::debug!("Adapter {} scored {score}", adapter.name);
                if best.map_or(true, |(_, _, best_score)| score > best_score) {
                    best = Some((index, plan, score));
                }
            }
            Err(reasons) => {
                tracing::debug!("Adapter {} rejected: {}", adapter.name, reasons.join(", "));
                rejections.push(format!("{}: {}", adapter.name, reasons.join(", ")));
            }
        }
    }

    best.map(|(index, plan, _)| (index, plan))
        .ok_or_else(|| GpuError::NoSuitableDevice(rejections.join("; ")))
}

/// Check an adapter against the requirements, returning its queue plan or
/// every reason it was rejected.
fn evaluate(
    adapter: &AdapterInfo,
    requirements: &DeviceRequirements,
) -> std::result::Result<QueuePlan, Vec<String>> {
    let mut reasons = Vec::new();

    if !api_at_least(adapter.api_version, requirements.min_api_version) {
        reasons.push(format!(
            "API {}.{} below required {}.{}",
            vk::api_version_major(adapter.api_version),
            vk::api_version_minor(adapter.api_version),
            vk::api_version_major(requirements.min_api_version),
            vk::api_version_minor(requirements.min_api_version),
        ));
    }

    for extension in &requirements.extensions {
        if !adapter.extensions.contains(extension.as_str()) {
            reasons.push(format!("missing extension {extension}"));
        }
    }

    let missing = requirements.features - adapter.features;
    if !missing.is_empty() {
        reasons.push(format!("missing features {missing:?}"));
    }

    if adapter.device_local_memory() < requirements.min_device_local_memory {
        reasons.push(format!(
            "{} bytes device-local memory, {} required",
            adapter.device_local_memory(),
            requirements.min_device_local_memory
        ));
    }

    let plan = plan_queues(adapter, requirements);
    if let Err(reason) = &plan {
        reasons.push(reason.clone());
    }

    match plan {
        Ok(plan) if reasons.is_empty() => Ok(plan),
        _ => Err(reasons),
    }
}

/// Choose queue families for graphics, present and transfer.
fn plan_queues(
    adapter: &AdapterInfo,
    requirements: &DeviceRequirements,
) -> std::result::Result<QueuePlan, String> {
    let families = &adapter.queue_families;

    // A single family doing both graphics and present avoids ownership transfers
    let combined = families
        .iter()
        .find(|f| f.is_graphics() && f.supports_present);

    let (graphics, present) = match combined {
        Some(family) => (family.index, family.index),
        None => {
            let graphics = families
                .iter()
                .find(|f| f.is_graphics())
                .ok_or_else(|| "no graphics queue family".to_string())?;
            let present = families
                .iter()
                .find(|f| f.queue_count > 0 && f.supports_present)
                .map(|f| f.index);
            match present {
                Some(present) => (graphics.index, present),
                None if !requirements.require_present => (graphics.index, graphics.index),
                None => return Err("no queue family can present".to_string()),
            }
        }
    };

    let dedicated = families
        .iter()
        .filter(|f| f.is_dedicated_transfer())
        .min_by_key(|f| f.flags.contains(vk::QueueFlags::COMPUTE))
        .map(|f| f.index);

    let transfer = match (requirements.transfer_queue, dedicated) {
        (TransferQueuePolicy::Shared, _) | (TransferQueuePolicy::PreferDedicated, None) => graphics,
        (TransferQueuePolicy::PreferDedicated | TransferQueuePolicy::RequireDedicated, Some(f)) => f,
        (TransferQueuePolicy::RequireDedicated, None) => {
            return Err("no dedicated transfer queue family".to_string())
        }
    };

    Ok(QueuePlan {
        graphics,
        present,
        transfer,
    })
}

fn score_adapter(adapter: &AdapterInfo, plan: &QueuePlan, requirements: &DeviceRequirements) -> u64 {
    let mut score = match (requirements.preference, adapter.device_type) {
        (DevicePreference::HighPerformance, vk::PhysicalDeviceType::DISCRETE_GPU)
        | (DevicePreference::LowPower, vk::PhysicalDeviceType::INTEGRATED_GPU) => 1000,
        (DevicePreference::HighPerformance, vk::PhysicalDeviceType::INTEGRATED_GPU)
        | (DevicePreference::LowPower, vk::PhysicalDeviceType::DISCRETE_GPU) => 100,
        (_, vk::PhysicalDeviceType::VIRTUAL_GPU) => 50,
        (_, vk::PhysicalDeviceType::CPU) => 10,
        _ => 0,
    };

    // +1 per GB of device-local memory
    score += adapter.device_local_memory() / (1024 * 1024 * 1024);

    if plan.graphics == plan.present {
        score += 5;
    }

    score
}

pub(crate) fn api_at_least(version: u32, required: u32) -> bool {
    (vk::api_version_major(version), vk::api_version_minor(version))
        >= (vk::api_version_major(required), vk::api_version_minor(required))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(name: &str, device_type: vk::PhysicalDeviceType) -> AdapterInfo {
        AdapterInfo {
            handle: vk::PhysicalDevice::null(),
            name: name.to_string(),
            vendor: GpuVendor::Other(0),
            device_type,
            api_version: vk::API_VERSION_1_3,
            driver_version: 1,
            extensions: ["VK_KHR_swapchain".to_string()].into_iter().collect(),
            features: DeviceFeatures::SAMPLER_ANISOTROPY | DeviceFeatures::DYNAMIC_RENDERING,
            queue_families: vec![QueueFamilyInfo {
                index: 0,
                flags: vk::QueueFlags::GRAPHICS
                    | vk::QueueFlags::COMPUTE
                    | vk::QueueFlags::TRANSFER,
                queue_count: 1,
                supports_present: true,
            }],
            memory_heaps: vec![MemoryHeapInfo {
                size: 2 * 1024 * 1024 * 1024,
                device_local: true,
            }],
            memory_types: vec![MemoryTypeInfo {
                heap_index: 0,
                flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            }],
            buffer_image_granularity: 1,
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
    }

    #[test]
    fn prefers_discrete_gpu() {
        let adapters = [
            adapter("integrated", vk::PhysicalDeviceType::INTEGRATED_GPU),
            adapter("discrete", vk::PhysicalDeviceType::DISCRETE_GPU),
        ];

        let (index, plan) = select_adapter(&adapters, &DeviceRequirements::default()).unwrap();
        assert_eq!(index, 1);
        assert_eq!(plan.graphics, 0);
        assert_eq!(plan.present, 0);
        assert_eq!(plan.transfer, 0);

        let low_power = DeviceRequirements::default().with_preference(DevicePreference::LowPower);
        let (index, _) = select_adapter(&adapters, &low_power).unwrap();
        assert_eq!(index, 0);
    }

    #[test]
    fn ties_pick_lowest_index() {
        let adapters = [
            adapter("a", vk::PhysicalDeviceType::DISCRETE_GPU),
            adapter("b", vk::PhysicalDeviceType::DISCRETE_GPU),
        ];
        let (index, _) = select_adapter(&adapters, &DeviceRequirements::default()).unwrap();
        assert_eq!(index, 0);
    }

    #[test]
    fn missing_extension_and_feature_rejected() {
        let adapters = [adapter("gpu", vk::PhysicalDeviceType::DISCRETE_GPU)];
        let requirements = DeviceRequirements::default()
            .with_extension("VK_KHR_ray_query")
            .with_features(DeviceFeatures::GEOMETRY_SHADER);

        let err = select_adapter(&adapters, &requirements).unwrap_err();
        let GpuError::NoSuitableDevice(message) = err else {
            panic!("unexpected error: {err}");
        };
        assert!(message.contains("VK_KHR_ray_query"));
        assert!(message.contains("GEOMETRY_SHADER"));
    }

    #[test]
    fn old_api_rejected() {
        let mut old = adapter("old", vk::PhysicalDeviceType::DISCRETE_GPU);
        old.api_version = vk::API_VERSION_1_0;
        assert!(matches!(
            select_adapter(&[old], &DeviceRequirements::default()),
            Err(GpuError::NoSuitableDevice(_))
        ));
    }

    #[test]
    fn split_graphics_and_present_families() {
        let mut gpu = adapter("gpu", vk::PhysicalDeviceType::DISCRETE_GPU);
        gpu.queue_families = vec![
            QueueFamilyInfo {
                index: 0,
                flags: vk::QueueFlags::GRAPHICS,
                queue_count: 1,
                supports_present: false,
            },
            QueueFamilyInfo {
                index: 1,
                flags: vk::QueueFlags::TRANSFER,
                queue_count: 1,
                supports_present: true,
            },
        ];

        let (_, plan) = select_adapter(&[gpu], &DeviceRequirements::default()).unwrap();
        assert_eq!(plan.graphics, 0);
        assert_eq!(plan.present, 1);
        assert_eq!(plan.transfer, 1);
        assert_eq!(plan.unique_families(), vec![0, 1]);
    }

    #[test]
    fn dedicated_transfer_policy() {
        let gpu = adapter("gpu", vk::PhysicalDeviceType::DISCRETE_GPU);
        let requirements =
            DeviceRequirements::default().with_transfer_queue(TransferQueuePolicy::RequireDedicated);
        assert!(select_adapter(&[gpu.clone()], &requirements).is_err());

        let shared =
            DeviceRequirements::default().with_transfer_queue(TransferQueuePolicy::Shared);
        let (_, plan) = select_adapter(&[gpu], &shared).unwrap();
        assert_eq!(plan.transfer, plan.graphics);
    }

    #[test]
    fn no_present_family_fails_when_required() {
        let mut gpu = adapter("gpu", vk::PhysicalDeviceType::DISCRETE_GPU);
        gpu.queue_families[0].supports_present = false;

        assert!(select_adapter(&[gpu.clone()], &DeviceRequirements::default()).is_err());

        let headless = DeviceRequirements::default().with_present(false);
        let (_, plan) = select_adapter(&[gpu], &headless).unwrap();
        assert_eq!(plan.present, plan.graphics);
    }
}
