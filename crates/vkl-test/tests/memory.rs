//! Allocator scenarios on the software adapter.

use ash::vk;
use vkl_gpu::{
    AllocationDesc, AllocatorConfig, GpuError, ImageDesc, MemoryLocation, SoftwareAdapterDesc,
};
use vkl_test::{RigConfig, SoftwareRig};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

fn storage(name: &str, size: u64, location: MemoryLocation) -> AllocationDesc<'_> {
    AllocationDesc::buffer(name, size, vk::BufferUsageFlags::STORAGE_BUFFER, location)
}

#[test]
fn allocation_larger_than_device_heap_is_out_of_device_memory() {
    let rig = SoftwareRig::new(RigConfig::default()).unwrap();
    let live_before = rig.probe().live_objects();

    let err = rig
        .runtime()
        .allocate(&storage("huge", 512 * MIB, MemoryLocation::GpuOnly))
        .unwrap_err();
    assert!(matches!(
        err,
        GpuError::OutOfDeviceMemory {
            size,
            location: MemoryLocation::GpuOnly
        } if size == 512 * MIB
    ));

    // Nothing half-created survives the failure
    assert_eq!(rig.probe().live_objects(), live_before);
    assert_eq!(rig.probe().heap_usage(0), 0);
    rig.shutdown().unwrap();
}

#[test]
fn upload_larger_than_host_heap_is_out_of_host_memory() {
    let rig = SoftwareRig::new(RigConfig::default()).unwrap();

    let err = rig
        .runtime()
        .allocate(&storage("staging", 200 * MIB, MemoryLocation::CpuToGpu))
        .unwrap_err();
    assert!(matches!(err, GpuError::OutOfHostMemory { .. }));
    rig.shutdown().unwrap();
}

#[test]
fn allocate_then_free_restores_pool_accounting() {
    let rig = SoftwareRig::new(RigConfig::default()).unwrap();
    let runtime = rig.runtime();

    // Cold: nothing allocated yet
    let pools_before = runtime.pool_stats();
    let stats_before = runtime.allocator_stats();
    let heap_before = rig.probe().heap_usage(0);

    let allocation = runtime
        .allocate(&storage("round-trip", 96 * KIB, MemoryLocation::GpuOnly))
        .unwrap();
    assert_ne!(runtime.allocator_stats(), stats_before);
    runtime.free(allocation).unwrap();

    assert_eq!(runtime.pool_stats(), pools_before);
    assert_eq!(runtime.allocator_stats(), stats_before);
    assert_eq!(rig.probe().heap_usage(0), heap_before);

    // Warm: a neighbour keeps the block alive
    let neighbour = runtime
        .allocate(&storage("neighbour", 4 * KIB, MemoryLocation::GpuOnly))
        .unwrap();
    let pools_warm = runtime.pool_stats();
    let stats_warm = runtime.allocator_stats();

    let allocation = runtime
        .allocate(&storage("round-trip", 96 * KIB, MemoryLocation::GpuOnly))
        .unwrap();
    runtime.free(allocation).unwrap();
    assert_eq!(runtime.pool_stats(), pools_warm);
    assert_eq!(runtime.allocator_stats(), stats_warm);

    runtime.free(neighbour).unwrap();
    assert_eq!(runtime.allocator_stats(), stats_before);
    rig.shutdown().unwrap();
}

#[test]
fn small_allocations_share_a_block() {
    let rig = SoftwareRig::new(RigConfig::default()).unwrap();
    let runtime = rig.runtime();

    let allocations: Vec<_> = (0..8)
        .map(|i| {
            runtime
                .allocate(&storage(&format!("chunk-{i}"), 64 * KIB, MemoryLocation::GpuOnly))
                .unwrap()
        })
        .collect();
    let memory = allocations[0].memory();
    assert!(allocations.iter().all(|a| a.memory() == memory));
    assert_eq!(runtime.allocator_stats().blocks, 1);
    assert_eq!(runtime.allocator_stats().allocations, 8);

    for allocation in allocations {
        runtime.free(allocation).unwrap();
    }
    rig.shutdown().unwrap();
}

#[test]
fn large_allocation_gets_a_dedicated_block() {
    let rig = SoftwareRig::new(
        RigConfig::default().with_allocator(
            AllocatorConfig::default()
                .with_block_sizes(MIB, MIB)
                .with_dedicated_threshold(2 * MIB),
        ),
    )
    .unwrap();
    let runtime = rig.runtime();

    let allocation = runtime
        .allocate(&storage("big", 3 * MIB, MemoryLocation::GpuOnly))
        .unwrap();
    assert_eq!(allocation.offset(), 0);
    assert_eq!(rig.probe().heap_usage(0), 3 * MIB);

    // Dedicated blocks go back to the driver as soon as they empty
    runtime.free(allocation).unwrap();
    assert_eq!(rig.probe().heap_usage(0), 0);
    assert_eq!(runtime.allocator_stats().blocks, 0);
    rig.shutdown().unwrap();
}

#[test]
fn scattered_free_space_is_reported_as_fragmentation() {
    let adapter = SoftwareAdapterDesc::default().with_heap_sizes(MIB, 16 * MIB);
    let rig = SoftwareRig::new(RigConfig::default().with_adapters(vec![adapter])).unwrap();
    let runtime = rig.runtime();

    let mut quarters: Vec<_> = (0..4)
        .map(|i| {
            runtime
                .allocate(&storage(&format!("quarter-{i}"), 256 * KIB, MemoryLocation::GpuOnly))
                .map(Some)
                .unwrap()
        })
        .collect();
    for index in [0, 2] {
        if let Some(allocation) = quarters[index].take() {
            runtime.free(allocation).unwrap();
        }
    }

    let err = runtime
        .allocate(&storage("half", 512 * KIB, MemoryLocation::GpuOnly))
        .unwrap_err();
    assert!(matches!(
        err,
        GpuError::Fragmentation { free_bytes, .. } if free_bytes == 512 * KIB
    ));

    for allocation in quarters.into_iter().flatten() {
        runtime.free(allocation).unwrap();
    }
    rig.shutdown().unwrap();
}

#[test]
fn host_visible_allocation_is_writable() {
    let rig = SoftwareRig::new(RigConfig::default()).unwrap();
    let runtime = rig.runtime();

    let upload = runtime
        .allocate(&storage("upload", 64, MemoryLocation::CpuToGpu))
        .unwrap();
    let data = [1u32, 2, 3, 0xdead_beef];
    upload.write(&data).unwrap();

    let expected: Vec<u8> = data.iter().flat_map(|v| v.to_ne_bytes()).collect();
    let written = rig
        .probe()
        .read_memory(upload.memory(), upload.offset(), expected.len())
        .unwrap();
    assert_eq!(written, expected);

    assert!(upload.write_bytes(60, &[0; 8]).is_err());

    let device_only = runtime
        .allocate(&storage("device", 64, MemoryLocation::GpuOnly))
        .unwrap();
    assert!(device_only.mapped_ptr().is_none());
    assert!(matches!(
        device_only.write(&data),
        Err(GpuError::InvalidState(_))
    ));

    runtime.free(upload).unwrap();
    runtime.free(device_only).unwrap();
    rig.shutdown().unwrap();
}

#[test]
fn images_land_in_device_local_memory() {
    let rig = SoftwareRig::new(RigConfig::default()).unwrap();
    let runtime = rig.runtime();

    let desc = ImageDesc::new_2d(
        256,
        256,
        vk::Format::R8G8B8A8_UNORM,
        vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
    );
    let texture = runtime
        .allocate(&AllocationDesc::image("texture", desc, MemoryLocation::GpuOnly))
        .unwrap();
    assert!(texture.image().is_some());
    assert!(texture.buffer().is_none());
    assert!(texture.size() >= 256 * 256 * 4);
    assert!(rig.probe().heap_usage(0) > 0);

    runtime.free(texture).unwrap();
    rig.shutdown().unwrap();
}

#[test]
fn allocation_ids_are_not_reused() {
    let rig = SoftwareRig::new(RigConfig::default()).unwrap();
    let runtime = rig.runtime();

    let allocation = runtime
        .allocate(&storage("once", 4 * KIB, MemoryLocation::GpuOnly))
        .unwrap();
    let id = allocation.id();
    runtime.free(allocation).unwrap();
    assert_eq!(runtime.allocator().live_count(), 0);

    let again = runtime
        .allocate(&storage("twice", 4 * KIB, MemoryLocation::GpuOnly))
        .unwrap();
    assert_ne!(again.id(), id);
    runtime.free(again).unwrap();
    rig.shutdown().unwrap();
}

#[test]
fn retired_allocations_are_freed_once_their_frame_completes() {
    let mut rig = SoftwareRig::new(RigConfig::default()).unwrap();
    rig.run_frame().unwrap();

    let buffer = rig
        .runtime()
        .allocate(&storage("per-frame", 4 * KIB, MemoryLocation::CpuToGpu))
        .unwrap();
    // Retired while frame 1 is next: frame 1 may still use it
    rig.runtime_mut().retire(buffer);
    assert_eq!(rig.runtime().deferred_pending(), 1);

    rig.run_frames(2).unwrap();
    assert_eq!(rig.runtime().deferred_pending(), 1);

    // Frame 3 waits on slot 1, observing frame 1 complete
    rig.run_frame().unwrap();
    assert_eq!(rig.runtime().deferred_pending(), 0);
    assert_eq!(rig.runtime().allocator().live_count(), 0);

    rig.shutdown().unwrap();
}

#[test]
fn leaked_allocations_are_released_at_shutdown() {
    let rig = SoftwareRig::new(RigConfig::default()).unwrap();
    let leaked = rig
        .runtime()
        .allocate(&storage("leaked", 4 * KIB, MemoryLocation::GpuOnly))
        .unwrap();
    std::mem::forget(leaked);

    // The allocator frees the resource and its block, so the driver sees no leak
    rig.shutdown().unwrap();
}
