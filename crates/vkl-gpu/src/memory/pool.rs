//! Block sub-allocation.
//!
//! A pool owns device memory blocks of one memory type and tiling class and
//! hands out aligned ranges from them first-fit. Freed ranges are merged
//! with their neighbours, and a block is returned to the driver as soon as
//! its last range is freed.

use super::{AllocatorConfig, AllocatorStats, MemoryBackend, MemoryPlacement, MemoryRequest, PoolStats};
use crate::capabilities::{AdapterInfo, MemoryTypeInfo};
use crate::driver::Driver;
use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;
use std::ptr::NonNull;

const MIB: u64 = 1024 * 1024;

/// Pools never mix linear and optimal resources, so buffer/image
/// granularity never has to be considered inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PoolKey {
    pub memory_type: u32,
    pub linear: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRange {
    offset: u64,
    size: u64,
}

/// One `vk::DeviceMemory` block.
#[derive(Debug)]
pub(crate) struct MemoryBlock {
    pub id: u64,
    pub memory: vk::DeviceMemory,
    pub size: u64,
    pub dedicated: bool,
    pub mapped: Option<NonNull<u8>>,
    // Sorted by offset, never adjacent
    free: Vec<FreeRange>,
    used: u64,
    allocations: u32,
}

impl MemoryBlock {
    pub fn new(
        id: u64,
        memory: vk::DeviceMemory,
        size: u64,
        dedicated: bool,
        mapped: Option<NonNull<u8>>,
    ) -> Self {
        Self {
            id,
            memory,
            size,
            dedicated,
            mapped,
            free: vec![FreeRange { offset: 0, size }],
            used: 0,
            allocations: 0,
        }
    }

    /// Carve `size` bytes aligned to `alignment` out of the first range that fits.
    pub fn try_allocate(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let (index, aligned) = self.free.iter().enumerate().find_map(|(i, range)| {
            let aligned = align_up(range.offset, alignment);
            let padding = aligned - range.offset;
            (padding.checked_add(size)? <= range.size).then_some((i, aligned))
        })?;

        let range = self.free.remove(index);
        let end = range.offset + range.size;
        let mut insert_at = index;

        if aligned > range.offset {
            self.free.insert(
                insert_at,
                FreeRange {
                    offset: range.offset,
                    size: aligned - range.offset,
                },
            );
            insert_at += 1;
        }
        if aligned + size < end {
            self.free.insert(
                insert_at,
                FreeRange {
                    offset: aligned + size,
                    size: end - aligned - size,
                },
            );
        }

        self.used += size;
        self.allocations += 1;
        Some(aligned)
    }

    /// Return a range previously handed out by [`Self::try_allocate`].
    pub fn release(&mut self, offset: u64, size: u64) {
        let index = self.free.partition_point(|r| r.offset < offset);
        self.free.insert(index, FreeRange { offset, size });

        // Merge with the following range
        if index + 1 < self.free.len() && offset + size == self.free[index + 1].offset {
            self.free[index].size += self.free[index + 1].size;
            self.free.remove(index + 1);
        }
        // Merge with the preceding range
        if index > 0 {
            let prev = self.free[index - 1];
            if prev.offset + prev.size == self.free[index].offset {
                self.free[index - 1].size += self.free[index].size;
                self.free.remove(index);
            }
        }

        self.used -= size;
        self.allocations -= 1;
    }

    pub fn is_empty(&self) -> bool {
        self.allocations == 0
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn allocation_count(&self) -> u32 {
        self.allocations
    }

    pub fn free_bytes(&self) -> u64 {
        self.size - self.used
    }

    pub fn largest_free_range(&self) -> u64 {
        self.free.iter().map(|r| r.size).max().unwrap_or(0)
    }

    pub fn free_range_count(&self) -> usize {
        self.free.len()
    }
}

/// Blocks of one memory type and tiling class.
#[derive(Debug)]
pub(crate) struct MemoryPool {
    pub key: PoolKey,
    pub heap_index: u32,
    pub blocks: Vec<MemoryBlock>,
}

impl MemoryPool {
    pub fn new(key: PoolKey, heap_index: u32) -> Self {
        Self {
            key,
            heap_index,
            blocks: Vec::new(),
        }
    }

    /// Sub-allocate from an existing shared block.
    pub fn try_allocate(&mut self, size: u64, alignment: u64) -> Option<(u64, u64)> {
        self.blocks
            .iter_mut()
            .filter(|b| !b.dedicated)
            .find_map(|b| b.try_allocate(size, alignment).map(|offset| (b.id, offset)))
    }

    pub fn block_mut(&mut self, id: u64) -> Option<&mut MemoryBlock> {
        self.blocks.iter_mut().find(|b| b.id == id)
    }

    /// Free bytes across shared blocks.
    pub fn shared_free_bytes(&self) -> u64 {
        self.blocks
            .iter()
            .filter(|b| !b.dedicated)
            .map(MemoryBlock::free_bytes)
            .sum()
    }

    /// Remove and return the block once nothing is placed in it.
    pub fn take_if_empty(&mut self, id: u64) -> Option<MemoryBlock> {
        let index = self.blocks.iter().position(|b| b.id == id)?;
        self.blocks[index]
            .is_empty()
            .then(|| self.blocks.remove(index))
    }
}

#[derive(Debug, Clone, Copy)]
struct PlacedRange {
    pool: PoolKey,
    block_id: u64,
    offset: u64,
    size: u64,
}

/// Memory backend that sub-allocates driver memory blocks itself.
///
/// Used by the software driver, whose heaps are plain counters.
#[derive(Debug)]
pub struct PoolBackend {
    config: AllocatorConfig,
    memory_types: Vec<MemoryTypeInfo>,
    heap_sizes: Vec<u64>,
    heap_device_local: Vec<bool>,
    heap_reserved: Vec<u64>,
    pools: Vec<MemoryPool>,
    placements: HashMap<u64, PlacedRange>,
    next_block_id: u64,
}

// SAFETY: mapped block pointers are only dereferenced through allocations
// that own disjoint ranges.
unsafe impl Send for PoolBackend {}

impl<D: Driver> MemoryBackend<D> for PoolBackend {
    fn create(_driver: &D, adapter: &AdapterInfo, config: &AllocatorConfig) -> Result<Self> {
        if config.debug_settings.log_memory_information {
            for (index, heap) in adapter.memory_heaps.iter().enumerate() {
                tracing::info!(
                    "Memory heap {index}: {} MB{}",
                    heap.size / MIB,
                    if heap.device_local { " (device-local)" } else { "" }
                );
            }
            for (index, ty) in adapter.memory_types.iter().enumerate() {
                tracing::info!("Memory type {index}: heap {} {:?}", ty.heap_index, ty.flags);
            }
        }

        Ok(Self {
            config: *config,
            memory_types: adapter.memory_types.clone(),
            heap_sizes: adapter.memory_heaps.iter().map(|h| h.size).collect(),
            heap_device_local: adapter.memory_heaps.iter().map(|h| h.device_local).collect(),
            heap_reserved: vec![0; adapter.memory_heaps.len()],
            pools: Vec::new(),
            placements: HashMap::new(),
            next_block_id: 1,
        })
    }

    fn allocate(&mut self, driver: &D, request: &MemoryRequest<'_>) -> Result<MemoryPlacement> {
        let (range, placement) = self.place(driver, request)?;
        self.placements.insert(request.id, range);
        Ok(placement)
    }

    fn free(&mut self, driver: &D, id: u64) -> Result<()> {
        let range = self
            .placements
            .remove(&id)
            .ok_or_else(|| GpuError::InvalidState(format!("No memory placed for allocation #{id}")))?;
        self.release_range(driver, range);
        Ok(())
    }

    fn stats(&self) -> AllocatorStats {
        self.pools
            .iter()
            .flat_map(|pool| pool.blocks.iter())
            .fold(AllocatorStats::default(), |mut stats, block| {
                stats.blocks += 1;
                stats.reserved_bytes += block.size;
                stats.used_bytes += block.used();
                stats.allocations += block.allocation_count() as usize;
                stats
            })
    }

    fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools
            .iter()
            .filter(|pool| !pool.blocks.is_empty())
            .map(|pool| PoolStats {
                memory_type: pool.key.memory_type,
                linear: pool.key.linear,
                blocks: pool.blocks.len(),
                reserved_bytes: pool.blocks.iter().map(|b| b.size).sum(),
                used_bytes: pool.blocks.iter().map(MemoryBlock::used).sum(),
                allocations: pool.blocks.iter().map(MemoryBlock::allocation_count).sum(),
                largest_free_range: pool
                    .blocks
                    .iter()
                    .map(MemoryBlock::largest_free_range)
                    .max()
                    .unwrap_or(0),
            })
            .collect()
    }

    fn shutdown(&mut self, driver: &D) {
        self.placements.clear();
        for pool in self.pools.drain(..) {
            for block in pool.blocks {
                // SAFETY: every resource bound to the block has been destroyed.
                unsafe { driver.free_memory(block.memory) };
            }
        }
        self.heap_reserved.iter_mut().for_each(|r| *r = 0);
    }
}

impl PoolBackend {
    fn place<D: Driver>(
        &mut self,
        driver: &D,
        request: &MemoryRequest<'_>,
    ) -> Result<(PlacedRange, MemoryPlacement)> {
        let requirements = &request.requirements;
        let location = request.location;
        let memory_type =
            find_memory_type(&self.memory_types, requirements.memory_type_bits, location).ok_or(
                GpuError::NoCompatibleMemoryType {
                    location,
                    type_bits: requirements.memory_type_bits,
                },
            )?;
        let key = PoolKey {
            memory_type,
            linear: request.linear,
        };
        let heap_index = self.memory_types[memory_type as usize].heap_index;
        let pool_index = self.pool_index(key, heap_index);
        let size = requirements.size;
        let alignment = requirements.alignment.max(1);
        let dedicated = size >= self.config.dedicated_threshold;

        if !dedicated {
            if let Some((block_id, offset)) = self.pools[pool_index].try_allocate(size, alignment) {
                return Ok(self.placement(pool_index, block_id, offset, size));
            }
        }

        // Grow the pool
        let heap = heap_index as usize;
        let heap_free = self.heap_sizes[heap].saturating_sub(self.heap_reserved[heap]);
        let preferred = if dedicated {
            size
        } else {
            size.max(self.block_size(memory_type))
        };
        let block_size = if preferred <= heap_free {
            preferred
        } else if size <= heap_free {
            // Not enough room for a full block, an exact-fit one still helps
            align_up(size, alignment)
        } else {
            return Err(self.exhaustion_error(pool_index, size, location));
        };

        let memory = match driver.allocate_memory(memory_type, block_size) {
            Ok(memory) => memory,
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY) => {
                return Err(self.exhaustion_error(pool_index, size, location));
            }
            Err(e) => return Err(e.into()),
        };

        let (block_id, offset) =
            self.adopt_block(driver, pool_index, memory, block_size, dedicated, size, alignment)?;
        Ok(self.placement(pool_index, block_id, offset, size))
    }

    /// Map a fresh block when host-visible, place the first range in it and
    /// add it to the pool. On failure the memory goes back to the driver.
    #[allow(clippy::too_many_arguments)]
    fn adopt_block<D: Driver>(
        &mut self,
        driver: &D,
        pool_index: usize,
        memory: vk::DeviceMemory,
        block_size: u64,
        dedicated: bool,
        size: u64,
        alignment: u64,
    ) -> Result<(u64, u64)> {
        let pool = &self.pools[pool_index];
        let memory_type = pool.key.memory_type;
        let heap = pool.heap_index as usize;

        let host_visible = self.memory_types[memory_type as usize]
            .flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        let mapped = if host_visible {
            // SAFETY: fresh host-visible block, not yet mapped.
            match unsafe { driver.map_memory(memory, block_size) } {
                Ok(ptr) => Some(ptr),
                Err(e) => {
                    // SAFETY: nothing is bound to the block.
                    unsafe { driver.free_memory(memory) };
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let mut block = MemoryBlock::new(self.next_block_id, memory, block_size, dedicated, mapped);
        let Some(offset) = block.try_allocate(size, alignment) else {
            // SAFETY: nothing is bound to the block.
            unsafe { driver.free_memory(memory) };
            return Err(GpuError::InvalidState(format!(
                "Fresh {block_size} byte memory block cannot hold {size} bytes"
            )));
        };

        let block_id = self.next_block_id;
        self.next_block_id += 1;
        self.heap_reserved[heap] += block_size;
        self.pools[pool_index].blocks.push(block);

        tracing::debug!(
            "New {} memory block {block_id}: {block_size} bytes (type {memory_type}, heap {heap})",
            if dedicated { "dedicated" } else { "shared" }
        );
        Ok((block_id, offset))
    }

    fn placement(
        &mut self,
        pool_index: usize,
        block_id: u64,
        offset: u64,
        size: u64,
    ) -> (PlacedRange, MemoryPlacement) {
        let pool = &mut self.pools[pool_index];
        let key = pool.key;
        let (memory, mapped) = pool
            .block_mut(block_id)
            .map(|b| (b.memory, b.mapped))
            .unwrap_or((vk::DeviceMemory::null(), None));

        let range = PlacedRange {
            pool: key,
            block_id,
            offset,
            size,
        };
        let placement = MemoryPlacement {
            memory,
            offset,
            // SAFETY: the offset is inside the mapped block.
            mapped: mapped.map(|base| unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) }),
        };
        (range, placement)
    }

    fn release_range<D: Driver>(&mut self, driver: &D, range: PlacedRange) {
        let Some(pool) = self.pools.iter_mut().find(|p| p.key == range.pool) else {
            tracing::error!("Free into unknown pool {:?}", range.pool);
            return;
        };
        let heap = pool.heap_index as usize;

        match pool.block_mut(range.block_id) {
            Some(block) => block.release(range.offset, range.size),
            None => {
                tracing::error!("Free into unknown block {}", range.block_id);
                return;
            }
        }

        if let Some(block) = pool.take_if_empty(range.block_id) {
            tracing::debug!("Releasing memory block {}: {} bytes", block.id, block.size);
            self.heap_reserved[heap] = self.heap_reserved[heap].saturating_sub(block.size);
            // SAFETY: the block is empty, so nothing is bound to it.
            unsafe { driver.free_memory(block.memory) };
        }
    }

    fn pool_index(&mut self, key: PoolKey, heap_index: u32) -> usize {
        if let Some(index) = self.pools.iter().position(|p| p.key == key) {
            return index;
        }
        self.pools.push(MemoryPool::new(key, heap_index));
        self.pools.len() - 1
    }

    fn block_size(&self, memory_type: u32) -> u64 {
        let flags = self.memory_types[memory_type as usize].flags;
        if flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            self.config.host_block_size
        } else {
            self.config.device_block_size
        }
    }

    fn exhaustion_error(&self, pool_index: usize, size: u64, location: MemoryLocation) -> GpuError {
        let pool = &self.pools[pool_index];
        let free_bytes = pool.shared_free_bytes();
        if free_bytes >= size {
            GpuError::Fragmentation {
                size,
                location,
                free_bytes,
            }
        } else if self.heap_device_local[pool.heap_index as usize] {
            GpuError::OutOfDeviceMemory { size, location }
        } else {
            GpuError::OutOfHostMemory { size, location }
        }
    }
}

/// Pick a memory type for `location` among those allowed by `type_bits`.
///
/// Each usage class has required flags and a preferred superset; the first
/// type with the preferred flags wins, else the first with the required ones.
pub fn find_memory_type(
    memory_types: &[MemoryTypeInfo],
    type_bits: u32,
    location: MemoryLocation,
) -> Option<u32> {
    use vk::MemoryPropertyFlags as F;

    let (required, preferred) = match location {
        MemoryLocation::GpuOnly => (F::DEVICE_LOCAL, F::DEVICE_LOCAL),
        MemoryLocation::CpuToGpu => (
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::HOST_VISIBLE | F::HOST_COHERENT | F::DEVICE_LOCAL,
        ),
        MemoryLocation::GpuToCpu => (
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED,
        ),
        MemoryLocation::Unknown => (F::empty(), F::empty()),
    };

    let allowed = |index: usize| index < 32 && type_bits & (1 << index) != 0;
    let find = |flags: F| {
        memory_types
            .iter()
            .enumerate()
            .find(|(i, ty)| allowed(*i) && ty.flags.contains(flags))
            .map(|(i, _)| i as u32)
    };

    find(preferred).or_else(|| find(required))
}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{DeviceContext, DeviceContextBuilder};
    use crate::memory::BoundResource;
    use crate::software::{SoftwareDriver, SoftwareSurface};

    fn block(size: u64) -> MemoryBlock {
        MemoryBlock::new(1, vk::DeviceMemory::null(), size, false, None)
    }

    #[test]
    fn first_fit_with_alignment() {
        let mut b = block(1024);
        assert_eq!(b.try_allocate(100, 1), Some(0));
        assert_eq!(b.try_allocate(100, 256), Some(256));
        // Padding between 100 and 256 is still usable
        assert_eq!(b.try_allocate(100, 4), Some(100));
        assert_eq!(b.used(), 300);
        assert_eq!(b.allocation_count(), 3);
    }

    #[test]
    fn release_coalesces() {
        let mut b = block(1024);
        let a = b.try_allocate(256, 1).unwrap();
        let c = b.try_allocate(256, 1).unwrap();
        let d = b.try_allocate(256, 1).unwrap();

        b.release(c, 256);
        b.release(a, 256);
        b.release(d, 256);

        assert!(b.is_empty());
        assert_eq!(b.free_range_count(), 1);
        assert_eq!(b.largest_free_range(), 1024);
    }

    #[test]
    fn exhausted_block_refuses() {
        let mut b = block(512);
        assert!(b.try_allocate(512, 1).is_some());
        assert!(b.try_allocate(1, 1).is_none());
    }

    #[test]
    fn fragmented_block_has_free_bytes_but_no_range() {
        let mut b = block(1024);
        let offsets: Vec<u64> = (0..4).map(|_| b.try_allocate(256, 1).unwrap()).collect();
        b.release(offsets[0], 256);
        b.release(offsets[2], 256);

        assert_eq!(b.free_bytes(), 512);
        assert_eq!(b.largest_free_range(), 256);
        assert!(b.try_allocate(300, 1).is_none());
    }

    #[test]
    fn pool_gives_back_every_empty_block() {
        let key = PoolKey {
            memory_type: 0,
            linear: true,
        };
        let mut pool = MemoryPool::new(key, 0);
        pool.blocks.push(MemoryBlock::new(1, vk::DeviceMemory::null(), 64, false, None));
        pool.blocks.push(MemoryBlock::new(2, vk::DeviceMemory::null(), 64, true, None));
        let busy = pool.blocks[0].try_allocate(16, 1).unwrap();

        assert!(pool.take_if_empty(2).is_some());
        assert!(pool.take_if_empty(1).is_none());

        pool.blocks[0].release(busy, 16);
        assert!(pool.take_if_empty(1).is_some());
        assert!(pool.blocks.is_empty());
    }

    fn software_context() -> DeviceContext<SoftwareDriver> {
        DeviceContextBuilder::new()
            .build(SoftwareDriver::default(), &SoftwareSurface::default())
            .unwrap()
    }

    fn backend(ctx: &DeviceContext<SoftwareDriver>) -> PoolBackend {
        <PoolBackend as MemoryBackend<SoftwareDriver>>::create(
            ctx.driver(),
            ctx.adapter(),
            &AllocatorConfig::default().with_block_sizes(MIB, MIB),
        )
        .unwrap()
    }

    fn request(id: u64, size: u64) -> MemoryRequest<'static> {
        MemoryRequest {
            id,
            name: "range",
            requirements: vk::MemoryRequirements {
                size,
                alignment: 256,
                memory_type_bits: u32::MAX,
            },
            location: MemoryLocation::GpuOnly,
            linear: true,
            resource: BoundResource::Buffer(vk::Buffer::null()),
        }
    }

    #[test]
    fn cold_round_trip_returns_the_block() {
        let ctx = software_context();
        let probe = ctx.driver().probe();
        let mut backend = backend(&ctx);
        let before = MemoryBackend::<SoftwareDriver>::stats(&backend);

        backend.allocate(ctx.driver(), &request(1, 4096)).unwrap();
        assert_eq!(probe.memory_blocks(), 1);
        backend.free(ctx.driver(), 1).unwrap();

        assert_eq!(MemoryBackend::<SoftwareDriver>::stats(&backend), before);
        assert!(MemoryBackend::<SoftwareDriver>::pool_stats(&backend).is_empty());
        assert_eq!(probe.memory_blocks(), 0);
        assert!(backend.heap_reserved.iter().all(|&r| r == 0));
    }

    #[test]
    fn unplaceable_fresh_block_goes_back_to_the_driver() {
        let ctx = software_context();
        let probe = ctx.driver().probe();
        let mut backend = backend(&ctx);
        let key = PoolKey {
            memory_type: 0,
            linear: true,
        };
        let pool_index = backend.pool_index(key, backend.memory_types[0].heap_index);
        let memory = ctx.driver().allocate_memory(0, 1024).unwrap();

        let result = backend.adopt_block(ctx.driver(), pool_index, memory, 1024, false, 4096, 1);

        assert!(matches!(result, Err(GpuError::InvalidState(_))));
        assert!(backend.pools[pool_index].blocks.is_empty());
        assert!(backend.heap_reserved.iter().all(|&r| r == 0));
        assert_eq!(probe.memory_blocks(), 0);
        assert!(probe.violations().is_empty());
    }

    #[test]
    fn freeing_unknown_id_is_rejected() {
        let ctx = software_context();
        let mut backend = backend(&ctx);
        assert!(matches!(
            backend.free(ctx.driver(), 7),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn align_up_rounds() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(7, 0), 7);
    }

    fn types() -> Vec<MemoryTypeInfo> {
        use vk::MemoryPropertyFlags as F;
        vec![
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
        ]
    }

    #[test]
    fn memory_type_per_usage_class() {
        let types = types();
        assert_eq!(find_memory_type(&types, 0b111, MemoryLocation::GpuOnly), Some(0));
        assert_eq!(find_memory_type(&types, 0b111, MemoryLocation::CpuToGpu), Some(1));
        assert_eq!(find_memory_type(&types, 0b111, MemoryLocation::GpuToCpu), Some(2));
    }

    #[test]
    fn memory_type_respects_type_bits() {
        let types = types();
        // Cached type excluded: fall back to plain host-visible
        assert_eq!(find_memory_type(&types, 0b011, MemoryLocation::GpuToCpu), Some(1));
        assert_eq!(find_memory_type(&types, 0b110, MemoryLocation::GpuOnly), None);
    }
}
