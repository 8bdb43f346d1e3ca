use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use log::{debug, error, info};
use vulkanalia::prelude::v1_0::*;

use crate::config::CoreConfig;
use crate::error::GpuError;

use super::heap::{HeapStats, MemoryCategory, MemoryHeap};
use super::kind::{GpuMemory, MemoryKind};

/// Caller-provided dedication hint for one allocation. A
/// `required` hint is never dropped; a merely `preferred` one
/// is retried without dedication before any capability flags
/// are sacrificed.
#[derive(Clone, Copy, Default)]
pub struct DedicationHint {
    pub buffer: Option<vk::Buffer>,
    pub image: Option<vk::Image>,
    pub preferred: bool,
    pub required: bool,
}

impl DedicationHint {
    pub fn none() -> Self {
        Self::default()
    }

    fn requested(&self) -> bool {
        self.preferred || self.required
    }
}

/// Top-level device memory allocator. Owns one `MemoryKind` per
/// enumerated memory type and one shared `MemoryHeap` record
/// per physical heap; selection walks a fallback ladder that
/// trades capability flags for allocation success before giving
/// up.
pub struct DeviceMemoryAllocator {
    device: Arc<Device>,
    kinds: Vec<MemoryKind>,
    heaps: Vec<Arc<MemoryHeap>>,
    driver_allocated: Arc<AtomicU64>,
    limits: vk::PhysicalDeviceLimits,
    buffer_image_granularity: u64,
    memory_priority: bool,
}

impl DeviceMemoryAllocator {
    /// Enumerates heaps and memory types from the physical
    /// device and builds the allocator. On unified-memory
    /// systems every heap gets a soft budget of
    /// `config.heap_budget_fraction` of its capacity, since the
    /// GPU pool is also the application's working memory there.
    pub fn new(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        device: Arc<Device>,
        config: &CoreConfig,
        memory_priority: bool,
    ) -> Self {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory = unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let types = &memory.memory_types[..memory.memory_type_count as usize];

        // A system is treated as unified when every device-local
        // memory type is also host-visible: there is only one
        // physical pool, shared with the CPU side.
        let unified = types.iter().all(|memory_type| {
            !memory_type.property_flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
                || memory_type.property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        });

        let heaps = memory.memory_heaps[..memory.memory_heap_count as usize]
            .iter()
            .enumerate()
            .map(|(index, heap)| {
                let budget = if unified {
                    (heap.size as f64 * config.heap_budget_fraction as f64) as u64
                } else {
                    0
                };

                Arc::new(MemoryHeap::new(index, heap.size, budget))
            })
            .collect::<Vec<_>>();

        let driver_allocated = Arc::new(AtomicU64::new(0));

        let kinds = types
            .iter()
            .enumerate()
            .map(|(index, memory_type)| {
                // Device-local types get the large chunk size;
                // everything else (staging memory) the smaller
                // one.
                let chunk_size = if memory_type
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
                {
                    config.device_chunk_size
                } else {
                    config.host_chunk_size
                };

                MemoryKind::new(
                    index as u32,
                    memory_type.property_flags,
                    heaps[memory_type.heap_index as usize].clone(),
                    chunk_size,
                    driver_allocated.clone(),
                )
            })
            .collect();

        info!(
            "Memory allocator created: {} heaps, {} types{}.",
            memory.memory_heap_count,
            memory.memory_type_count,
            if unified { " (unified memory)" } else { "" },
        );

        Self {
            device,
            kinds,
            heaps,
            driver_allocated,
            limits: properties.limits,
            buffer_image_granularity: properties.limits.buffer_image_granularity,
            memory_priority,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.limits
    }

    /// Allocates memory satisfying `requirements` with the
    /// desired property flags. The attempt ladder, in order:
    ///
    ///  1. every matching memory type with the desired flags,
    ///     honoring the dedication hint;
    ///  2. the same without dedication, if it was only
    ///     preferred;
    ///  3. the same with HOST_CACHED dropped, then with
    ///     DEVICE_LOCAL dropped as well, trading performance
    ///     for success.
    ///
    /// Only when every rung fails does the call surface an
    /// error, carrying the full per-heap usage dump.
    pub fn alloc(
        &self,
        requirements: &vk::MemoryRequirements,
        dedication: DedicationHint,
        flags: vk::MemoryPropertyFlags,
        priority: f32,
        category: MemoryCategory,
    ) -> Result<GpuMemory> {
        // Images and buffers sharing a chunk must respect the
        // device's buffer/image granularity; aligning every
        // sub-allocation to it sidesteps per-neighbour checks.
        let alignment = requirements
            .alignment
            .max(self.buffer_image_granularity)
            .max(1);

        for candidate_flags in fallback_flag_sets(flags) {
            for try_dedicated in dedication_passes(&dedication) {
                for kind in &self.kinds {
                    if !kind_matches(kind.index, kind.flags, requirements.memory_type_bits, candidate_flags) {
                        continue;
                    }

                    let memory = kind.alloc(
                        &self.device,
                        requirements.size,
                        alignment,
                        category,
                        priority,
                        try_dedicated,
                        self.memory_priority,
                    );

                    if let Some(memory) = memory {
                        if candidate_flags != flags {
                            debug!(
                                "Allocated {} bytes with relaxed flags {candidate_flags:?} (wanted {flags:?}).",
                                requirements.size,
                            );
                        }
                        return Ok(memory);
                    }
                }
            }
        }

        let heap_dump = self.heap_dump();
        error!(
            "Device memory exhausted: {} bytes requested (alignment {}, flags {flags:?})\n{heap_dump}",
            requirements.size, requirements.alignment,
        );

        Err(GpuError::OutOfDeviceMemory {
            size: requirements.size,
            alignment: requirements.alignment,
            flags,
            heap_dump,
        }
        .into())
    }

    /// Returns an allocation to its owning memory kind.
    pub fn free(&self, memory: GpuMemory) {
        self.kinds[memory.kind as usize].free(&self.device, &memory);
    }

    /// Sweeps wholly-empty chunks on every memory kind back to
    /// the driver.
    pub fn free_unused_chunks(&self) {
        let mut freed = 0;
        for kind in &self.kinds {
            freed += kind.free_unused_chunks(&self.device);
        }

        if freed > 0 {
            debug!("Released {} KiB of unused chunks.", freed >> 10);
        }
    }

    /// Total bytes currently allocated from the driver, across
    /// all heaps.
    pub fn allocated_from_driver(&self) -> u64 {
        self.driver_allocated.load(Ordering::Relaxed)
    }

    /// Per-heap counter snapshots for telemetry and HUD
    /// display.
    pub fn stats(&self) -> Vec<HeapStats> {
        self.heaps.iter().map(|heap| heap.stats()).collect()
    }

    pub fn heap_dump(&self) -> String {
        self.heaps.iter().map(|heap| heap.dump()).collect()
    }

    /// Releases all chunks. Only valid at device teardown.
    pub fn destroy(&self) {
        for kind in &self.kinds {
            kind.destroy(&self.device);
        }
    }
}

/// The ordered flag combinations the ladder walks through:
/// the desired set, then without HOST_CACHED, then without
/// DEVICE_LOCAL either. Identical consecutive sets are skipped,
/// so the ladder is at most three rungs and always terminates.
fn fallback_flag_sets(flags: vk::MemoryPropertyFlags) -> Vec<vk::MemoryPropertyFlags> {
    let mut sets = vec![flags];

    let without_cached = flags & !vk::MemoryPropertyFlags::HOST_CACHED;
    if without_cached != flags {
        sets.push(without_cached);
    }

    let without_local = without_cached & !vk::MemoryPropertyFlags::DEVICE_LOCAL;
    if without_local != without_cached {
        sets.push(without_local);
    }

    sets
}

/// The dedication attempts for one flag set: a required hint is
/// non-negotiable, a preferred one falls back to sub-allocation,
/// and no hint means chunks only.
fn dedication_passes(hint: &DedicationHint) -> Vec<Option<&DedicationHint>> {
    if hint.required {
        vec![Some(hint)]
    } else if hint.requested() {
        vec![Some(hint), None]
    } else {
        vec![None]
    }
}

/// Whether a memory type can serve a request: its bit must be
/// set in the requirements' type mask and its property flags
/// must be a superset of the wanted flags.
fn kind_matches(
    index: u32,
    kind_flags: vk::MemoryPropertyFlags,
    type_bits: u32,
    wanted: vk::MemoryPropertyFlags,
) -> bool {
    type_bits & (1 << index) != 0 && kind_flags.contains(wanted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_is_ordered_and_bounded() {
        let wanted = vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_CACHED;

        let sets = fallback_flag_sets(wanted);
        assert_eq!(sets.len(), 3);
        assert_eq!(sets[0], wanted);
        assert_eq!(
            sets[1],
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE
        );
        assert_eq!(sets[2], vk::MemoryPropertyFlags::HOST_VISIBLE);
    }

    #[test]
    fn ladder_skips_redundant_rungs() {
        // Nothing to drop: a single rung.
        let sets = fallback_flag_sets(vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert_eq!(sets, vec![vk::MemoryPropertyFlags::HOST_VISIBLE]);

        // Only DEVICE_LOCAL to drop: two rungs.
        let sets = fallback_flag_sets(vk::MemoryPropertyFlags::DEVICE_LOCAL);
        assert_eq!(
            sets,
            vec![
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::empty(),
            ]
        );
    }

    #[test]
    fn dedication_pass_counts() {
        let none = DedicationHint::none();
        assert_eq!(dedication_passes(&none).len(), 1);

        let preferred = DedicationHint { preferred: true, ..DedicationHint::none() };
        let passes = dedication_passes(&preferred);
        assert_eq!(passes.len(), 2);
        assert!(passes[0].is_some() && passes[1].is_none());

        let required = DedicationHint { required: true, ..DedicationHint::none() };
        let passes = dedication_passes(&required);
        assert_eq!(passes.len(), 1);
        assert!(passes[0].is_some());
    }

    #[test]
    fn kind_matching() {
        let flags = vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE;

        // Bit 2 set in the mask, superset flags: match.
        assert!(kind_matches(2, flags, 0b0100, vk::MemoryPropertyFlags::HOST_VISIBLE));
        // Bit not set: no match even with the right flags.
        assert!(!kind_matches(1, flags, 0b0100, vk::MemoryPropertyFlags::HOST_VISIBLE));
        // Missing wanted flag: no match.
        assert!(!kind_matches(2, flags, 0b0100, vk::MemoryPropertyFlags::HOST_CACHED));
    }
}
