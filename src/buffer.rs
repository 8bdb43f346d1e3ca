use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use log::trace;
use parking_lot::Mutex;
use vulkanalia::prelude::v1_0::*;

use crate::memory::{align_up, DedicationHint, DeviceMemoryAllocator, GpuMemory, MemoryCategory};

/// Upper bound on the slice count of a single physical buffer;
/// capacity doubling stops here.
const MAX_SLICES_PER_BUFFER: u32 = 256;

/// Parameters for one virtual buffer.
#[derive(Clone, Copy, Debug)]
pub struct BufferCreateParams {
    /// Usable length of one slice, in bytes.
    pub slice_length: u64,
    /// Number of slices reserved up front. They are carved out
    /// of the first physical buffer lazily, on the first
    /// free-list exhaustion.
    pub slice_count: u32,
    pub usage: vk::BufferUsageFlags,
    pub memory_flags: vk::MemoryPropertyFlags,
    pub category: MemoryCategory,
}

/// One checked-out region of a physical buffer. The handle is
/// valid only between checkout and the matching return;
/// concurrent checkout of the same slice by two owners is a
/// contract violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferSlice {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub length: u64,
    /// Host pointer to the slice, null for non-host-visible
    /// memory.
    pub mapped_ptr: *mut u8,
}

unsafe impl Send for BufferSlice {}
unsafe impl Sync for BufferSlice {}

struct PhysicalBuffer {
    buffer: vk::Buffer,
    memory: Option<GpuMemory>,
}

/// A virtual buffer identity over one or more physical
/// allocations of equal-size slices. Writers that must not
/// clobber data still referenced by in-flight GPU work check
/// out a fresh slice, fill it, and `rename` it in; the old
/// slice drains back through a command list's slice tracker
/// once its fence resolves.
///
/// The two free-lists exist so the hot paths never serialize:
/// producers pop from the primary under its lock while the
/// finish thread pushes returns to the secondary under the
/// other, and the pair is swapped only when the primary runs
/// dry.
pub struct GpuBuffer {
    device: Arc<Device>,
    allocator: Arc<DeviceMemoryAllocator>,
    params: BufferCreateParams,
    stride: u64,
    current: Mutex<BufferSlice>,
    physical: Mutex<Vec<PhysicalBuffer>>,
    free_slices: Mutex<VecDeque<BufferSlice>>,
    next_slices: Mutex<VecDeque<BufferSlice>>,
    /// Slices reserved at creation but not yet split out of the
    /// first physical buffer.
    reserved: Mutex<VecDeque<BufferSlice>>,
    /// Slice count for the next physical buffer; doubles on
    /// each growth up to the cap.
    grow_count: AtomicU32,
    /// Keeps the parent alive for clone views; `Some` marks
    /// this buffer as a clone that owns nothing.
    parent: Option<Arc<GpuBuffer>>,
}

impl GpuBuffer {
    /// Creates a virtual buffer with one physical backing
    /// buffer of `slice_count` slices. The first slice becomes
    /// the current one; the rest stay un-split until needed.
    pub fn new(
        allocator: Arc<DeviceMemoryAllocator>,
        params: BufferCreateParams,
    ) -> Result<Arc<Self>> {
        let device = allocator.device().clone();
        let stride = slice_stride(params.slice_length, params.usage, allocator.limits());

        let count = params.slice_count.max(1);
        let (physical, mut slices) =
            create_physical(&device, &allocator, &params, stride, count)?;

        let current = slices.pop_front().expect("physical buffer with zero slices");

        Ok(Arc::new(Self {
            device,
            allocator,
            params,
            stride,
            current: Mutex::new(current),
            physical: Mutex::new(vec![physical]),
            free_slices: Mutex::new(VecDeque::new()),
            next_slices: Mutex::new(VecDeque::new()),
            reserved: Mutex::new(slices),
            grow_count: AtomicU32::new((count * 2).min(MAX_SLICES_PER_BUFFER)),
            parent: None,
        }))
    }

    pub fn slice_length(&self) -> u64 {
        self.params.slice_length
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// The slice currently visible to readers.
    pub fn current(&self) -> BufferSlice {
        *self.current.lock()
    }

    /// Checks a slice out of the pool, growing the backing
    /// storage if every list is empty. Never waits on a fence;
    /// the worst case is one (blocking) driver allocation.
    pub fn alloc_slice(&self) -> Result<BufferSlice> {
        debug_assert!(self.parent.is_none(), "allocating a slice from a buffer clone");

        if let Some(slice) = pop_or_swap(&self.free_slices, &self.next_slices) {
            return Ok(slice);
        }

        // Slices reserved at creation are split out before any
        // new memory is allocated.
        if let Some(slice) = self.reserved.lock().pop_front() {
            return Ok(slice);
        }

        self.grow()
    }

    /// Returns a slice to the pool. Always lands on the
    /// secondary list, under its own lock, so the producer side
    /// and the reclaiming side never block each other.
    pub fn free_slice(&self, slice: BufferSlice) {
        debug_assert!(self.parent.is_none(), "returning a slice to a buffer clone");
        self.next_slices.lock().push_back(slice);
    }

    /// Swaps which slice is current for readers and returns the
    /// previous one. The caller arranges for the old slice to
    /// be freed once the GPU is done with it, typically via a
    /// command list's slice tracker.
    pub fn rename(&self, slice: BufferSlice) -> BufferSlice {
        std::mem::replace(&mut *self.current.lock(), slice)
    }

    /// Creates a read-only view sharing this buffer's physical
    /// storage and current slice, used for intentionally
    /// orphaned views. The view owns no slices and refuses
    /// slice allocation; cloning a clone is a contract
    /// violation.
    pub fn clone_view(self: &Arc<Self>) -> Arc<Self> {
        debug_assert!(self.parent.is_none(), "cloning a buffer clone");

        Arc::new(Self {
            device: self.device.clone(),
            allocator: self.allocator.clone(),
            params: self.params,
            stride: self.stride,
            current: Mutex::new(self.current()),
            physical: Mutex::new(Vec::new()),
            free_slices: Mutex::new(VecDeque::new()),
            next_slices: Mutex::new(VecDeque::new()),
            reserved: Mutex::new(VecDeque::new()),
            grow_count: AtomicU32::new(0),
            parent: Some(self.clone()),
        })
    }

    fn grow(&self) -> Result<BufferSlice> {
        let count = self.grow_count.load(Ordering::Relaxed).max(1);
        let (physical, mut slices) =
            create_physical(&self.device, &self.allocator, &self.params, self.stride, count)?;

        trace!(
            "Buffer grew by a physical buffer of {count} slices ({} bytes).",
            count as u64 * self.stride,
        );

        self.physical.lock().push(physical);
        self.grow_count
            .store((count * 2).min(MAX_SLICES_PER_BUFFER), Ordering::Relaxed);

        let first = slices.pop_front().expect("physical buffer with zero slices");
        self.free_slices.lock().append(&mut slices);

        Ok(first)
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        // Clones own nothing; the parent Arc they hold keeps
        // the storage alive for their own lifetime.
        if self.parent.is_some() {
            return;
        }

        for mut physical in self.physical.lock().drain(..) {
            unsafe { self.device.destroy_buffer(physical.buffer, None) };
            if let Some(memory) = physical.memory.take() {
                self.allocator.free(memory);
            }
        }
    }
}

/// Pops from the primary list, swapping in the secondary first
/// when the primary is dry. The secondary is the one the finish
/// thread pushes returned slices to, under its own lock, so the
/// two sides only ever contend here, on exhaustion.
fn pop_or_swap<T>(primary: &Mutex<VecDeque<T>>, secondary: &Mutex<VecDeque<T>>) -> Option<T> {
    let mut free = primary.lock();
    if let Some(item) = free.pop_front() {
        return Some(item);
    }

    let mut next = secondary.lock();
    std::mem::swap(&mut *free, &mut *next);
    drop(next);

    free.pop_front()
}

/// Creates one physical buffer holding `count` slices and binds
/// it to freshly allocated memory, returning the buffer and its
/// slice handles.
fn create_physical(
    device: &Device,
    allocator: &DeviceMemoryAllocator,
    params: &BufferCreateParams,
    stride: u64,
    count: u32,
) -> Result<(PhysicalBuffer, VecDeque<BufferSlice>)> {
    // Buffers are created with a size, a usage and a sharing
    // mode; everything here is owned by a single queue family
    // at a time, so EXCLUSIVE it is.
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(stride * count as u64)
        .usage(params.usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { device.create_buffer(&buffer_info, None)? };

    // The buffer dictates its memory requirements (size,
    // alignment, admissible memory types); the allocator picks
    // a memory type and hands back a bindable range.
    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

    let memory = match allocator.alloc(
        &requirements,
        DedicationHint::none(),
        params.memory_flags,
        0.5,
        params.category,
    ) {
        Ok(memory) => memory,
        Err(error) => {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(error);
        }
    };

    unsafe { device.bind_buffer_memory(buffer, memory.memory, memory.offset)? };

    let slices = (0..count)
        .map(|index| {
            let offset = index as u64 * stride;
            let mapped_ptr = if memory.mapped_ptr.is_null() {
                std::ptr::null_mut()
            } else {
                unsafe { memory.mapped_ptr.add(offset as usize) }
            };

            BufferSlice {
                buffer,
                offset,
                length: params.slice_length,
                mapped_ptr,
            }
        })
        .collect();

    Ok((
        PhysicalBuffer {
            buffer,
            memory: Some(memory),
        },
        slices,
    ))
}

/// Rounds the slice length up to the strictest offset alignment
/// the buffer's usage demands, so every slice offset is itself
/// a valid bind offset.
fn slice_stride(length: u64, usage: vk::BufferUsageFlags, limits: &vk::PhysicalDeviceLimits) -> u64 {
    let mut alignment = limits.optimal_buffer_copy_offset_alignment.max(4);

    if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
        alignment = alignment.max(limits.min_uniform_buffer_offset_alignment);
    }

    if usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
        alignment = alignment.max(limits.min_storage_buffer_offset_alignment);
    }

    if usage.intersects(
        vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER,
    ) {
        alignment = alignment.max(limits.min_texel_buffer_offset_alignment);
    }

    align_up(length, alignment.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> vk::PhysicalDeviceLimits {
        vk::PhysicalDeviceLimits {
            optimal_buffer_copy_offset_alignment: 4,
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 64,
            min_texel_buffer_offset_alignment: 16,
            ..Default::default()
        }
    }

    #[test]
    fn stride_follows_usage_alignment() {
        let limits = limits();

        // Plain copy source: only the copy alignment applies.
        assert_eq!(
            slice_stride(100, vk::BufferUsageFlags::TRANSFER_SRC, &limits),
            100,
        );

        // Uniform usage forces 256-byte strides.
        assert_eq!(
            slice_stride(100, vk::BufferUsageFlags::UNIFORM_BUFFER, &limits),
            256,
        );

        // Combined usages take the strictest alignment.
        assert_eq!(
            slice_stride(
                300,
                vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER,
                &limits,
            ),
            512,
        );

        // Aligned lengths stay untouched.
        assert_eq!(
            slice_stride(512, vk::BufferUsageFlags::UNIFORM_BUFFER, &limits),
            512,
        );
    }

    #[test]
    fn free_list_pair_swaps_on_exhaustion() {
        let primary = Mutex::new(VecDeque::from([1, 2]));
        let secondary = Mutex::new(VecDeque::from([3, 4]));

        // The primary serves in order until dry.
        assert_eq!(pop_or_swap(&primary, &secondary), Some(1));
        assert_eq!(pop_or_swap(&primary, &secondary), Some(2));

        // Exhaustion swaps in the secondary wholesale.
        assert_eq!(pop_or_swap(&primary, &secondary), Some(3));
        assert!(secondary.lock().is_empty());

        // Returns land on the secondary and surface after the
        // next swap, preserving their order.
        secondary.lock().push_back(5);
        assert_eq!(pop_or_swap(&primary, &secondary), Some(4));
        assert_eq!(pop_or_swap(&primary, &secondary), Some(5));
        assert_eq!(pop_or_swap(&primary, &secondary), None);
    }
}
