//! Linear device-memory arenas.
//!
//! All long-lived GPU resources are carved out of a handful of large
//! `vkAllocateMemory` blocks, one per memory class (staging, textures,
//! device-address buffers, render targets, per-frame pools). Each block is
//! bump-allocated in one direction and never freed piecemeal; an arena's
//! offset only rewinds when the whole block is torn down, e.g. when a
//! window resize invalidates the screen-sized color targets.

use ash::vk;

use crate::error::{Error, Result};

/// Round `value` up to the next multiple of `alignment`.
///
/// An alignment of zero is treated as one (no constraint), which is how the
/// driver reports "don't care" for some resources.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    let remainder = value % alignment;
    if remainder == 0 {
        value
    } else {
        value + (alignment - remainder)
    }
}

/// Offset bookkeeping for a single linear arena.
///
/// Kept separate from the `vk::DeviceMemory` it governs so the allocation
/// rules are testable without a device.
#[derive(Debug)]
pub struct LinearAllocator {
    name: &'static str,
    capacity: u64,
    offset: u64,
}

impl LinearAllocator {
    pub fn new(name: &'static str, capacity: u64) -> Self {
        Self {
            name,
            capacity,
            offset: 0,
        }
    }

    /// Reserve `size` bytes at the next offset aligned to `alignment`.
    ///
    /// Returns the byte offset of the reservation. Exceeding capacity is a
    /// hard configuration error and leaves the allocator unchanged.
    pub fn alloc(&mut self, size: u64, alignment: u64) -> Result<u64> {
        let aligned = align_up(self.offset, alignment);
        let end = aligned
            .checked_add(size)
            .ok_or_else(|| self.exhausted(size, alignment))?;
        if end > self.capacity {
            return Err(self.exhausted(size, alignment));
        }
        self.offset = end;
        Ok(aligned)
    }

    /// Rewind to empty. Only valid once every resource bound into the arena
    /// has been destroyed.
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn remaining(&self) -> u64 {
        self.capacity - self.offset
    }

    fn exhausted(&self, size: u64, alignment: u64) -> Error {
        Error::ArenaExhausted {
            name: self.name,
            size,
            alignment,
            remaining: self.remaining(),
            capacity: self.capacity,
        }
    }
}

/// Pick a memory type whose property flags satisfy `required`.
///
/// Exact matches win; otherwise the first type carrying a superset of the
/// required flags is used. The fallback matters on devices that only expose
/// combined host+device types, where an exact-match-only scan finds nothing.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let types = &props.memory_types[..props.memory_type_count as usize];
    if let Some(i) = types.iter().position(|t| t.property_flags == required) {
        return Some(i as u32);
    }
    types
        .iter()
        .position(|t| t.property_flags.contains(required))
        .map(|i| i as u32)
}

/// One `vk::DeviceMemory` block plus the linear allocator that carves it.
///
/// Host-visible arenas keep a persistent whole-range mapping; the memory is
/// host-coherent, so no flushes are needed.
pub struct MemoryArena {
    allocator: LinearAllocator,
    memory: vk::DeviceMemory,
    mapped: *mut u8,
}

impl MemoryArena {
    /// Allocate the backing block.
    ///
    /// `alloc_flags` is `DEVICE_ADDRESS` for arenas backing buffers whose
    /// device addresses feed acceleration-structure builds, empty otherwise.
    /// `host_mapped` requests a persistent mapping and requires a
    /// host-visible memory type.
    pub fn new(
        device: &ash::Device,
        name: &'static str,
        capacity: u64,
        memory_type_index: u32,
        alloc_flags: vk::MemoryAllocateFlags,
        host_mapped: bool,
    ) -> Result<Self> {
        let mut flags_info = vk::MemoryAllocateFlagsInfo::default().flags(alloc_flags);
        let mut alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(capacity)
            .memory_type_index(memory_type_index);
        if !alloc_flags.is_empty() {
            alloc_info = alloc_info.push_next(&mut flags_info);
        }

        let memory = unsafe {
            device
                .allocate_memory(&alloc_info, None)
                .map_err(|e| Error::vk("allocate arena memory", e))?
        };

        let mapped = if host_mapped {
            unsafe {
                device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                    .map_err(|e| Error::vk("map arena memory", e))? as *mut u8
            }
        } else {
            std::ptr::null_mut()
        };

        Ok(Self {
            allocator: LinearAllocator::new(name, capacity),
            memory,
            mapped,
        })
    }

    pub fn alloc(&mut self, size: u64, alignment: u64) -> Result<u64> {
        self.allocator.alloc(size, alignment)
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn capacity(&self) -> u64 {
        self.allocator.capacity()
    }

    /// Mutable view of `len` mapped bytes starting at `offset`.
    ///
    /// Panics if the arena is not host-mapped or the range is out of bounds;
    /// both indicate a bug in the caller, not a runtime condition.
    pub fn mapped_slice_mut(&mut self, offset: u64, len: u64) -> &mut [u8] {
        assert!(!self.mapped.is_null(), "arena '{}' is not host-mapped", self.allocator.name());
        assert!(
            offset + len <= self.allocator.capacity(),
            "mapped range {}..{} exceeds arena '{}' capacity {}",
            offset,
            offset + len,
            self.allocator.name(),
            self.allocator.capacity()
        );
        unsafe { std::slice::from_raw_parts_mut(self.mapped.add(offset as usize), len as usize) }
    }

    /// Rewind the allocator. Callers must have destroyed every resource
    /// bound into this arena first.
    pub fn reset(&mut self) {
        self.allocator.reset();
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        if self.memory != vk::DeviceMemory::null() {
            unsafe {
                if !self.mapped.is_null() {
                    device.unmap_memory(self.memory);
                    self.mapped = std::ptr::null_mut();
                }
                device.free_memory(self.memory, None);
            }
            self.memory = vk::DeviceMemory::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_basics() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_up(5, 0), 5);
        assert_eq!(align_up(5, 1), 5);
        // Non-power-of-two alignments follow the same remainder rule.
        assert_eq!(align_up(10, 12), 12);
    }

    #[test]
    fn allocations_are_disjoint_and_aligned() {
        let mut arena = LinearAllocator::new("test", 4096);
        let requests = [(100u64, 4u64), (1, 256), (64, 16), (3, 1), (512, 128)];

        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for &(size, alignment) in &requests {
            let offset = arena.alloc(size, alignment).unwrap();
            assert_eq!(offset % alignment.max(1), 0);
            ranges.push((offset, offset + size));
        }

        for (i, &(a_start, a_end)) in ranges.iter().enumerate() {
            for &(b_start, b_end) in &ranges[i + 1..] {
                assert!(a_end <= b_start || b_end <= a_start, "ranges overlap");
            }
        }
    }

    #[test]
    fn offset_is_monotone_and_bounded() {
        let mut arena = LinearAllocator::new("test", 1024);
        let mut last = 0;
        for _ in 0..8 {
            arena.alloc(100, 32).unwrap();
            assert!(arena.offset() >= last);
            assert!(arena.offset() <= arena.capacity());
            last = arena.offset();
        }
    }

    #[test]
    fn exhaustion_fails_loudly_and_leaves_offset_unchanged() {
        let mut arena = LinearAllocator::new("test", 128);
        arena.alloc(100, 1).unwrap();
        let before = arena.offset();

        let err = arena.alloc(64, 1).unwrap_err();
        assert!(matches!(err, Error::ArenaExhausted { name: "test", .. }));
        assert_eq!(arena.offset(), before);

        // Alignment padding alone can push past capacity.
        let err = arena.alloc(1, 256).unwrap_err();
        assert!(matches!(err, Error::ArenaExhausted { .. }));
    }

    #[test]
    fn exact_fit_succeeds() {
        let mut arena = LinearAllocator::new("test", 128);
        arena.alloc(128, 1).unwrap();
        assert_eq!(arena.remaining(), 0);
        assert!(arena.alloc(1, 1).is_err());
    }

    #[test]
    fn reset_rewinds_to_zero() {
        let mut arena = LinearAllocator::new("test", 256);
        arena.alloc(200, 1).unwrap();
        arena.reset();
        assert_eq!(arena.offset(), 0);
        assert_eq!(arena.alloc(200, 1).unwrap(), 0);
    }

    fn memory_props(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (i, &f) in flags.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: f,
                heap_index: 0,
            };
        }
        props
    }

    #[test]
    fn memory_type_exact_match_wins() {
        let props = memory_props(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        assert_eq!(
            find_memory_type(&props, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(1)
        );
    }

    #[test]
    fn memory_type_superset_is_accepted_as_fallback() {
        // Only a combined host+device type exists; the request must still
        // resolve instead of failing like an exact-match-only scan would.
        let props = memory_props(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        assert_eq!(
            find_memory_type(&props, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
        assert_eq!(
            find_memory_type(
                &props,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            ),
            Some(0)
        );
    }

    #[test]
    fn memory_type_missing_is_none() {
        let props = memory_props(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        assert_eq!(
            find_memory_type(&props, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
    }
}
