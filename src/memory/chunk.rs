use vulkanalia::prelude::v1_0::*;

/// Unique identifier of a chunk within its memory kind. Ids are
/// never reused, so a stale `GpuMemory` can always be traced
/// back to the chunk it came from even after sweeps removed
/// other chunks.
pub type ChunkId = u64;

/// A contiguous free byte range within a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeRange {
    pub offset: u64,
    pub length: u64,
}

/// Free-space bookkeeping for one chunk, kept apart from any
/// driver handle so the range arithmetic can be exercised on
/// its own. Ranges are stored sorted by offset and are always
/// pairwise disjoint; releasing a range merges it with adjacent
/// neighbours, so free space never fragments beyond what the
/// live allocations force.
pub struct FreeList {
    size: u64,
    ranges: Vec<FreeRange>,
}

impl FreeList {
    /// A new list holds a single range spanning the whole
    /// chunk.
    pub fn new(size: u64) -> Self {
        Self {
            size,
            ranges: vec![FreeRange { offset: 0, length: size }],
        }
    }

    /// Carves an aligned sub-range out of the free space and
    /// returns its offset, or `None` if no range can fit it.
    ///
    /// Selection is worst-fit: a range that fits the request
    /// exactly wins immediately, otherwise the widest candidate
    /// is chosen. Wide ranges survive many more splits before
    /// becoming useless slivers, which keeps fragmentation down
    /// under the arbitrary allocation patterns a game produces.
    pub fn alloc(&mut self, size: u64, alignment: u64) -> Option<u64> {
        debug_assert!(size > 0 && alignment.is_power_of_two());

        let mut selected: Option<usize> = None;
        for (index, range) in self.ranges.iter().enumerate() {
            // The usable start of the range is its offset
            // rounded up to the alignment; the range is a
            // candidate if the request still fits behind it.
            let aligned = align_up(range.offset, alignment);
            if aligned + size > range.offset + range.length {
                continue;
            }

            // An exact fit cannot be beaten, take it without
            // scanning the rest of the list.
            if range.length == size && aligned == range.offset {
                selected = Some(index);
                break;
            }

            match selected {
                Some(best) if self.ranges[best].length >= range.length => {}
                _ => selected = Some(index),
            }
        }

        let index = selected?;
        let range = self.ranges.remove(index);
        let aligned = align_up(range.offset, alignment);

        // Whatever the alignment skipped at the head of the
        // range stays free, as does the tail beyond the
        // allocation.
        if aligned > range.offset {
            self.insert(FreeRange {
                offset: range.offset,
                length: aligned - range.offset,
            });
        }

        let end = range.offset + range.length;
        if aligned + size < end {
            self.insert(FreeRange {
                offset: aligned + size,
                length: end - (aligned + size),
            });
        }

        Some(aligned)
    }

    /// Returns a previously allocated range to the list,
    /// coalescing it with adjacent free ranges.
    pub fn free(&mut self, offset: u64, length: u64) {
        debug_assert!(length > 0 && offset + length <= self.size);
        self.insert(FreeRange { offset, length });
    }

    fn insert(&mut self, range: FreeRange) {
        // Find the insertion point that keeps the list sorted
        // by offset.
        let index = self
            .ranges
            .partition_point(|existing| existing.offset < range.offset);

        debug_assert!(
            index >= self.ranges.len() || range.offset + range.length <= self.ranges[index].offset,
            "free range overlaps its successor"
        );

        // Merge with the predecessor if it ends exactly where
        // the new range starts...
        if index > 0 && self.ranges[index - 1].offset + self.ranges[index - 1].length == range.offset
        {
            self.ranges[index - 1].length += range.length;

            // ...and fold the successor in as well if the
            // grown predecessor now touches it.
            if index < self.ranges.len()
                && self.ranges[index - 1].offset + self.ranges[index - 1].length
                    == self.ranges[index].offset
            {
                self.ranges[index - 1].length += self.ranges[index].length;
                self.ranges.remove(index);
            }
            return;
        }

        // Merge with the successor if the new range ends where
        // it starts.
        if index < self.ranges.len()
            && range.offset + range.length == self.ranges[index].offset
        {
            self.ranges[index].offset = range.offset;
            self.ranges[index].length += range.length;
            return;
        }

        self.ranges.insert(index, range);
    }

    /// Whether a request of the given size and alignment could
    /// be satisfied, without carving anything.
    pub fn can_fit(&self, size: u64, alignment: u64) -> bool {
        self.ranges.iter().any(|range| {
            align_up(range.offset, alignment) + size <= range.offset + range.length
        })
    }

    pub fn free_bytes(&self) -> u64 {
        self.ranges.iter().map(|range| range.length).sum()
    }

    /// True when nothing is allocated: a single range spanning
    /// the whole chunk.
    pub fn is_whole(&self) -> bool {
        self.ranges.len() == 1 && self.ranges[0].offset == 0 && self.ranges[0].length == self.size
    }

    #[cfg(test)]
    fn ranges(&self) -> &[FreeRange] {
        &self.ranges
    }
}

/// One large block of device memory obtained directly from the
/// driver and carved up by its owning memory kind. The chunk
/// keeps the raw handle, a whole-chunk mapping when the memory
/// is host-visible, and the free-list of unclaimed ranges.
pub struct MemoryChunk {
    pub id: ChunkId,
    pub memory: vk::DeviceMemory,
    pub size: u64,
    /// Base of the persistent whole-chunk mapping, null for
    /// memory that is not host-visible.
    pub mapped_ptr: *mut u8,
    free: FreeList,
}

// The mapped pointer is plain host memory owned by the driver
// mapping; moving the chunk between threads is fine, access is
// serialized by the owning kind's mutex.
unsafe impl Send for MemoryChunk {}

impl MemoryChunk {
    /// Allocates one block of the given memory type from the
    /// driver, mapping it persistently when host-visible. The
    /// raw error code is returned so the caller can shrink and
    /// retry on out-of-memory.
    pub fn new(
        device: &Device,
        id: ChunkId,
        size: u64,
        memory_type_index: u32,
        host_visible: bool,
    ) -> Result<Self, vk::ErrorCode> {
        let memory_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { device.allocate_memory(&memory_info, None)? };

        let mapped_ptr = if host_visible {
            let mapped = unsafe {
                device.map_memory(memory, 0, vk::WHOLE_SIZE as u64, vk::MemoryMapFlags::empty())
            };

            match mapped {
                Ok(pointer) => pointer as *mut u8,
                Err(code) => {
                    unsafe { device.free_memory(memory, None) };
                    return Err(code);
                }
            }
        } else {
            std::ptr::null_mut()
        };

        Ok(Self {
            id,
            memory,
            size,
            mapped_ptr,
            free: FreeList::new(size),
        })
    }

    pub fn alloc(&mut self, size: u64, alignment: u64) -> Option<u64> {
        self.free.alloc(size, alignment)
    }

    pub fn free(&mut self, offset: u64, length: u64) {
        self.free.free(offset, length);
    }

    pub fn can_fit(&self, size: u64, alignment: u64) -> bool {
        self.free.can_fit(size, alignment)
    }

    /// Whether no sub-allocations are live in this chunk.
    pub fn is_empty(&self) -> bool {
        self.free.is_whole()
    }

    /// Returns the chunk's memory to the driver. The mapping is
    /// released implicitly by freeing the memory object.
    pub fn destroy(&self, device: &Device) {
        unsafe { device.free_memory(self.memory, None) };
    }
}

pub fn align_down(value: u64, alignment: u64) -> u64 {
    // The alignment is a power of two, so masking away the low
    // bits rounds down to the nearest multiple.
    value & !(alignment - 1)
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    // Aligning up is aligning down the value offset by one page
    // (alignment - 1).
    align_down(value + alignment - 1, alignment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const CHUNK: u64 = 1 << 20;

    fn assert_invariants(list: &FreeList, live: &[(u64, u64)]) {
        // Ranges sorted, disjoint, non-touching (touching
        // ranges must have been coalesced).
        let ranges = list.ranges();
        for pair in ranges.windows(2) {
            assert!(pair[0].offset + pair[0].length < pair[1].offset);
        }

        // No free range overlaps a live allocation.
        for range in ranges {
            for &(offset, length) in live {
                let disjoint =
                    offset + length <= range.offset || range.offset + range.length <= offset;
                assert!(disjoint, "free range overlaps live allocation");
            }
        }

        // Byte conservation: free + live == chunk size.
        let live_bytes: u64 = live.iter().map(|&(_, length)| length).sum();
        assert_eq!(list.free_bytes() + live_bytes, CHUNK);
    }

    #[test]
    fn alloc_free_conservation_randomized() {
        let mut rng = StdRng::seed_from_u64(0x1d9f);
        let mut list = FreeList::new(CHUNK);
        let mut live: Vec<(u64, u64)> = Vec::new();

        for _ in 0..4000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = rng.gen_range(1..=8192u64);
                let alignment = 1u64 << rng.gen_range(0..10);
                if let Some(offset) = list.alloc(size, alignment) {
                    assert_eq!(offset % alignment, 0);
                    live.push((offset, size));
                }
            } else {
                let index = rng.gen_range(0..live.len());
                let (offset, length) = live.swap_remove(index);
                list.free(offset, length);
            }

            assert_invariants(&list, &live);
        }

        // Draining everything restores the single whole-chunk
        // range.
        for (offset, length) in live.drain(..) {
            list.free(offset, length);
        }
        assert!(list.is_whole());
    }

    #[test]
    fn exact_fit_beats_widest() {
        let mut list = FreeList::new(CHUNK);

        // Carve the chunk into a 256-byte hole followed by a
        // much wider one.
        let a = list.alloc(256, 1).unwrap();
        let _b = list.alloc(1024, 1).unwrap();
        list.free(a, 256);

        // A 256-byte request must take the exact hole, not
        // split the wide tail range.
        assert_eq!(list.alloc(256, 1), Some(a));
    }

    #[test]
    fn worst_fit_prefers_widest_range() {
        let mut list = FreeList::new(CHUNK);

        // Lay out [hole 512][live][hole 4096][live][tail] and
        // check a small request lands in the tail, the widest
        // range.
        let a = list.alloc(512, 1).unwrap();
        let _keep1 = list.alloc(64, 1).unwrap();
        let b = list.alloc(4096, 1).unwrap();
        let _keep2 = list.alloc(64, 1).unwrap();
        list.free(a, 512);
        list.free(b, 4096);

        let offset = list.alloc(128, 1).unwrap();
        assert!(offset > b + 4096, "expected allocation from the wide tail");
    }

    #[test]
    fn coalesces_both_neighbours() {
        let mut list = FreeList::new(CHUNK);
        let a = list.alloc(100, 1).unwrap();
        let b = list.alloc(100, 1).unwrap();
        let c = list.alloc(100, 1).unwrap();

        // Freeing c touches the tail range and coalesces with
        // it right away, leaving the hole at a and the grown
        // tail.
        list.free(a, 100);
        list.free(c, 100);
        assert_eq!(list.ranges().len(), 2);

        // Freeing the middle range must fuse all three holes
        // and the tail into one.
        list.free(b, 100);
        assert!(list.is_whole());
    }

    #[test]
    fn alignment_padding_stays_free() {
        let mut list = FreeList::new(CHUNK);
        let _head = list.alloc(10, 1).unwrap();

        // The next free range starts at 10; a 256-aligned
        // request must skip to 256 and leave [10, 256) free.
        let offset = list.alloc(64, 256).unwrap();
        assert_eq!(offset, 256);
        assert!(list.can_fit(246, 1));
        assert_eq!(list.free_bytes(), CHUNK - 10 - 64);
    }

    #[test]
    fn refuses_oversized_requests() {
        let mut list = FreeList::new(CHUNK);
        assert_eq!(list.alloc(CHUNK + 1, 1), None);
        assert_eq!(list.alloc(CHUNK, 1), Some(0));
        assert!(!list.can_fit(1, 1));
    }

    #[test]
    fn align_helpers() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_down(511, 256), 256);
    }
}
