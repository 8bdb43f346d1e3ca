use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use vulkanalia::prelude::v1_0::*;

use super::allocator::DedicationHint;
use super::chunk::{ChunkId, MemoryChunk};
use super::heap::{MemoryCategory, MemoryHeap};

/// Chunks smaller than this are not worth the driver call; the
/// budget-driven halving stops here (or at the request size,
/// whichever is larger).
const MIN_CHUNK_SIZE: u64 = 4 << 20;

/// We want a heap to be able to hold a reasonable number of
/// chunks, so the configured chunk size is halved until at
/// least this many fit.
const MIN_CHUNKS_PER_HEAP: u64 = 15;

/// One sub-allocated range of device memory, exclusively owned
/// by its requester until returned to the allocator. Dedicated
/// allocations carry no chunk id and span their whole memory
/// object.
pub struct GpuMemory {
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    pub length: u64,
    /// Host pointer to the start of this range, null when the
    /// backing memory is not host-visible.
    pub mapped_ptr: *mut u8,
    pub(crate) kind: u32,
    pub(crate) chunk: Option<ChunkId>,
    pub(crate) category: MemoryCategory,
}

// The mapped pointer aliases driver-owned host memory; the
// range itself is exclusively owned, so moving or sharing the
// handle across threads is sound.
unsafe impl Send for GpuMemory {}
unsafe impl Sync for GpuMemory {}

impl GpuMemory {
    pub fn is_dedicated(&self) -> bool {
        self.chunk.is_none()
    }

    pub fn category(&self) -> MemoryCategory {
        self.category
    }
}

struct KindChunk {
    chunk: MemoryChunk,
    /// Category the triggering request was accounted under;
    /// chunk-level "allocated" bookkeeping follows it for the
    /// chunk's whole lifetime.
    category: MemoryCategory,
}

/// One allocatable flavor of memory: a heap plus a set of
/// capability flags, together with the chunks sub-allocated
/// from it. Each kind carries its own mutex so unrelated memory
/// types never contend.
pub struct MemoryKind {
    pub index: u32,
    pub flags: vk::MemoryPropertyFlags,
    pub heap: Arc<MemoryHeap>,
    chunk_size: u64,
    chunks: Mutex<Vec<KindChunk>>,
    next_chunk_id: AtomicU64,
    driver_allocated: Arc<AtomicU64>,
}

impl MemoryKind {
    pub fn new(
        index: u32,
        flags: vk::MemoryPropertyFlags,
        heap: Arc<MemoryHeap>,
        configured_chunk_size: u64,
        driver_allocated: Arc<AtomicU64>,
    ) -> Self {
        let chunk_size = tuned_chunk_size(configured_chunk_size, heap.capacity);

        Self {
            index,
            flags,
            heap,
            chunk_size,
            chunks: Mutex::new(Vec::new()),
            next_chunk_id: AtomicU64::new(1),
            driver_allocated,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn host_visible(&self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Attempts one allocation from this kind. `None` means the
    /// kind cannot satisfy the request right now; the caller's
    /// fallback ladder decides what to relax next. Requests at
    /// or above the chunk size, and requests carrying a
    /// dedication hint, go straight to the driver; everything
    /// else is sub-allocated from chunks.
    pub fn alloc(
        &self,
        device: &Device,
        size: u64,
        alignment: u64,
        category: MemoryCategory,
        priority: f32,
        dedicated: Option<&DedicationHint>,
        use_priority_ext: bool,
    ) -> Option<GpuMemory> {
        if dedicated.is_some() || size >= self.chunk_size {
            return self.alloc_dedicated(device, size, category, priority, dedicated, use_priority_ext);
        }

        self.alloc_from_chunks(device, size, alignment, category)
    }

    fn alloc_dedicated(
        &self,
        device: &Device,
        size: u64,
        category: MemoryCategory,
        priority: f32,
        dedicated: Option<&DedicationHint>,
        use_priority_ext: bool,
    ) -> Option<GpuMemory> {
        // The budget check is a graceful "try smaller" signal
        // to the fallback ladder, not an error: a dedicated
        // allocation cannot shrink, so it is refused outright.
        if !self.heap.fits_budget(size) {
            return None;
        }

        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::builder()
            .buffer(dedicated.and_then(|hint| hint.buffer).unwrap_or(vk::Buffer::null()))
            .image(dedicated.and_then(|hint| hint.image).unwrap_or(vk::Image::null()));
        let mut priority_info = vk::MemoryPriorityAllocateInfoEXT::builder().priority(priority);

        let mut memory_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(self.index);

        if dedicated.is_some() {
            memory_info = memory_info.push_next(&mut dedicated_info);
        }

        if use_priority_ext {
            memory_info = memory_info.push_next(&mut priority_info);
        }

        let memory = match unsafe { device.allocate_memory(&memory_info, None) } {
            Ok(memory) => memory,
            Err(code) => {
                debug!("Dedicated allocation of {size} bytes from type {} failed: {code:?}", self.index);
                return None;
            }
        };

        let mapped_ptr = if self.host_visible() {
            let mapped = unsafe {
                device.map_memory(memory, 0, vk::WHOLE_SIZE as u64, vk::MemoryMapFlags::empty())
            };

            match mapped {
                Ok(pointer) => pointer as *mut u8,
                Err(code) => {
                    debug!("Mapping dedicated allocation failed: {code:?}");
                    unsafe { device.free_memory(memory, None) };
                    return None;
                }
            }
        } else {
            std::ptr::null_mut()
        };

        self.heap.add_allocated(category, size);
        self.heap.add_used(category, size);
        self.driver_allocated.fetch_add(size, Ordering::Relaxed);

        Some(GpuMemory {
            memory,
            offset: 0,
            length: size,
            mapped_ptr,
            kind: self.index,
            chunk: None,
            category,
        })
    }

    fn alloc_from_chunks(
        &self,
        device: &Device,
        size: u64,
        alignment: u64,
        category: MemoryCategory,
    ) -> Option<GpuMemory> {
        let mut chunks = self.chunks.lock();

        // First chunk with a big enough free range wins; the
        // worst-fit tie-break happens inside the chunk's
        // free-list.
        for entry in chunks.iter_mut() {
            if let Some(offset) = entry.chunk.alloc(size, alignment) {
                self.heap.add_used(category, size);
                return Some(self.sub_allocation(&entry.chunk, offset, size, category));
            }
        }

        // No chunk fits, grow: allocate a new chunk, halving
        // the requested size while the heap budget would be
        // exceeded or the driver refuses.
        let mut chunk_size = self.chunk_size;
        let floor = size.max(MIN_CHUNK_SIZE.min(self.chunk_size));
        let chunk = loop {
            if chunk_size < floor {
                return None;
            }

            if !self.heap.fits_budget(chunk_size) {
                chunk_size /= 2;
                continue;
            }

            let id = self.next_chunk_id.fetch_add(1, Ordering::Relaxed);
            match MemoryChunk::new(device, id, chunk_size, self.index, self.host_visible()) {
                Ok(chunk) => break chunk,
                Err(code) => {
                    debug!("Chunk allocation of {chunk_size} bytes from type {} failed: {code:?}", self.index);
                    chunk_size /= 2;
                }
            }
        };

        self.heap.add_allocated(category, chunk.size);
        self.driver_allocated.fetch_add(chunk.size, Ordering::Relaxed);

        let mut entry = KindChunk { chunk, category };
        let offset = entry
            .chunk
            .alloc(size, alignment)
            .expect("fresh chunk must fit the allocation that created it");

        self.heap.add_used(category, size);
        let memory = self.sub_allocation(&entry.chunk, offset, size, category);
        chunks.push(entry);

        Some(memory)
    }

    fn sub_allocation(
        &self,
        chunk: &MemoryChunk,
        offset: u64,
        size: u64,
        category: MemoryCategory,
    ) -> GpuMemory {
        let mapped_ptr = if chunk.mapped_ptr.is_null() {
            std::ptr::null_mut()
        } else {
            // The whole chunk is mapped persistently, so the
            // range's pointer is just the base plus its offset.
            unsafe { chunk.mapped_ptr.add(offset as usize) }
        };

        GpuMemory {
            memory: chunk.memory,
            offset,
            length: size,
            mapped_ptr,
            kind: self.index,
            chunk: Some(chunk.id),
            category,
        }
    }

    /// Returns an allocation to this kind. Sub-allocations go
    /// back to their owning chunk's free-list; dedicated memory
    /// goes back to the driver.
    pub fn free(&self, device: &Device, memory: &GpuMemory) {
        debug_assert_eq!(memory.kind, self.index);

        match memory.chunk {
            None => {
                unsafe { device.free_memory(memory.memory, None) };
                self.heap.remove_allocated(memory.category, memory.length);
                self.heap.remove_used(memory.category, memory.length);
                self.driver_allocated.fetch_sub(memory.length, Ordering::Relaxed);
            }
            Some(chunk_id) => {
                let mut chunks = self.chunks.lock();
                let entry = chunks
                    .iter_mut()
                    .find(|entry| entry.chunk.id == chunk_id)
                    .expect("freed memory references an unknown chunk");

                entry.chunk.free(memory.offset, memory.length);
                self.heap.remove_used(memory.category, memory.length);
            }
        }
    }

    /// Sweeps wholly-empty chunks back to the driver and
    /// returns the number of bytes released.
    pub fn free_unused_chunks(&self, device: &Device) -> u64 {
        let mut chunks = self.chunks.lock();
        let mut freed = 0;

        chunks.retain(|entry| {
            if !entry.chunk.is_empty() {
                return true;
            }

            entry.chunk.destroy(device);
            self.heap.remove_allocated(entry.category, entry.chunk.size);
            self.driver_allocated.fetch_sub(entry.chunk.size, Ordering::Relaxed);
            freed += entry.chunk.size;
            false
        });

        freed
    }

    /// Releases every chunk unconditionally. Only valid at
    /// device teardown, after all sub-allocations came back.
    pub fn destroy(&self, device: &Device) {
        let mut chunks = self.chunks.lock();
        for entry in chunks.drain(..) {
            debug_assert!(entry.chunk.is_empty(), "chunk destroyed with live allocations");
            entry.chunk.destroy(device);
            self.heap.remove_allocated(entry.category, entry.chunk.size);
            self.driver_allocated.fetch_sub(entry.chunk.size, Ordering::Relaxed);
        }
    }
}

/// Halves the configured chunk size until at least
/// `MIN_CHUNKS_PER_HEAP` chunks fit the heap, so small heaps
/// (32-bit BARs, integrated parts) are not monopolized by one
/// or two giant chunks.
fn tuned_chunk_size(configured: u64, heap_capacity: u64) -> u64 {
    let mut size = configured;
    while size > MIN_CHUNK_SIZE && size * MIN_CHUNKS_PER_HEAP > heap_capacity {
        // The halve is clamped so a size between one and two
        // floors lands exactly on the floor.
        size = (size / 2).max(MIN_CHUNK_SIZE);
    }

    size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_untouched_on_large_heaps() {
        assert_eq!(tuned_chunk_size(320 << 20, 8 << 30), 320 << 20);
    }

    #[test]
    fn chunk_size_halved_on_small_heaps() {
        // A 256 MiB heap: 320 -> 160 -> 80 -> 40 -> 20 -> 10
        // MiB, the first size of which 15 fit into 256 MiB.
        let tuned = tuned_chunk_size(320 << 20, 256 << 20);
        assert_eq!(tuned, 10 << 20);
        assert!(tuned * MIN_CHUNKS_PER_HEAP <= 256 << 20);
    }

    #[test]
    fn chunk_size_never_drops_below_floor() {
        assert_eq!(tuned_chunk_size(320 << 20, 16 << 20), MIN_CHUNK_SIZE);

        // A configured size between one and two floors must
        // clamp to the floor, not halve below it.
        assert_eq!(tuned_chunk_size(5 << 20, 1 << 20), MIN_CHUNK_SIZE);
        assert_eq!(tuned_chunk_size(7 << 20, 1 << 20), MIN_CHUNK_SIZE);
    }
}
