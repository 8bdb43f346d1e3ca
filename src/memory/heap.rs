use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Usage category an allocation is accounted under. The
/// categories exist purely for diagnostics (telemetry and HUD
/// display); they have no influence on where memory actually
/// comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryCategory {
    /// Vertex, index and constant buffers created on behalf of
    /// the application.
    AppBuffer,
    /// Textures created on behalf of the application.
    AppTexture,
    /// Ray-tracing acceleration structures.
    AccelStructure,
    /// Render targets and depth-stencil surfaces.
    RenderTarget,
    /// Everything else (staging memory, internal scratch, ...).
    Other,
}

pub const CATEGORY_COUNT: usize = 5;

impl MemoryCategory {
    pub const ALL: [MemoryCategory; CATEGORY_COUNT] = [
        MemoryCategory::AppBuffer,
        MemoryCategory::AppTexture,
        MemoryCategory::AccelStructure,
        MemoryCategory::RenderTarget,
        MemoryCategory::Other,
    ];

    fn index(self) -> usize {
        match self {
            MemoryCategory::AppBuffer => 0,
            MemoryCategory::AppTexture => 1,
            MemoryCategory::AccelStructure => 2,
            MemoryCategory::RenderTarget => 3,
            MemoryCategory::Other => 4,
        }
    }

    fn label(self) -> &'static str {
        match self {
            MemoryCategory::AppBuffer => "app buffers",
            MemoryCategory::AppTexture => "app textures",
            MemoryCategory::AccelStructure => "accel structures",
            MemoryCategory::RenderTarget => "render targets",
            MemoryCategory::Other => "other",
        }
    }
}

/// Bookkeeping for one physical memory pool enumerated from the
/// device. Heaps are created once at device init and live until
/// teardown; every allocation and free on the device passes
/// through the counters here. Two figures are kept per
/// category:
///  - `allocated`: bytes obtained from the driver (whole chunks
///    and dedicated allocations);
///  - `used`: bytes actually handed out to resources, which is
///    at most `allocated` since chunks are carved up lazily.
pub struct MemoryHeap {
    /// Index of the heap as enumerated by the device.
    pub index: usize,
    /// Total capacity of the heap in bytes.
    pub capacity: u64,
    /// Soft budget in bytes; 0 means unlimited. Exceeding the
    /// budget is refused gracefully so callers can retry with a
    /// smaller request, it is not an error by itself.
    pub budget: u64,
    allocated: [AtomicU64; CATEGORY_COUNT],
    used: [AtomicU64; CATEGORY_COUNT],
}

/// Read-only snapshot of one heap's counters. The values are
/// sampled independently from atomics, so totals may be off by
/// an in-flight allocation; this is a diagnostics surface, not
/// a stable iteration contract.
#[derive(Clone, Copy, Debug)]
pub struct HeapStats {
    pub index: usize,
    pub capacity: u64,
    pub budget: u64,
    pub categories: [CategoryStats; CATEGORY_COUNT],
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CategoryStats {
    pub allocated: u64,
    pub used: u64,
}

impl MemoryHeap {
    pub fn new(index: usize, capacity: u64, budget: u64) -> Self {
        Self {
            index,
            capacity,
            budget,
            allocated: std::array::from_fn(|_| AtomicU64::new(0)),
            used: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn add_allocated(&self, category: MemoryCategory, bytes: u64) {
        self.allocated[category.index()].fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn remove_allocated(&self, category: MemoryCategory, bytes: u64) {
        self.allocated[category.index()].fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn add_used(&self, category: MemoryCategory, bytes: u64) {
        self.used[category.index()].fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn remove_used(&self, category: MemoryCategory, bytes: u64) {
        self.used[category.index()].fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Total number of bytes obtained from the driver on this
    /// heap, across all categories.
    pub fn total_allocated(&self) -> u64 {
        self.allocated
            .iter()
            .map(|count| count.load(Ordering::Relaxed))
            .sum()
    }

    /// Whether allocating `extra` more bytes from the driver
    /// would stay within the heap budget. A zero budget never
    /// rejects.
    pub fn fits_budget(&self, extra: u64) -> bool {
        self.budget == 0 || self.total_allocated() + extra <= self.budget
    }

    pub fn stats(&self) -> HeapStats {
        let mut categories = [CategoryStats::default(); CATEGORY_COUNT];
        for (index, stats) in categories.iter_mut().enumerate() {
            stats.allocated = self.allocated[index].load(Ordering::Relaxed);
            stats.used = self.used[index].load(Ordering::Relaxed);
        }

        HeapStats {
            index: self.index,
            capacity: self.capacity,
            budget: self.budget,
            categories,
        }
    }

    /// Human-readable counter dump, attached to allocation
    /// failure errors so that out-of-memory reports carry the
    /// full picture.
    pub fn dump(&self) -> String {
        let stats = self.stats();
        let mut out = format!(
            "heap {}: {} MiB capacity, {} budget\n",
            stats.index,
            stats.capacity >> 20,
            if stats.budget == 0 {
                "unlimited".to_string()
            } else {
                format!("{} MiB", stats.budget >> 20)
            },
        );

        for (category, counts) in MemoryCategory::ALL.iter().zip(stats.categories.iter()) {
            let _ = writeln!(
                out,
                "  {:<16} {:>8} KiB used / {:>8} KiB allocated",
                category.label(),
                counts.used >> 10,
                counts.allocated >> 10,
            );
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_round_trip() {
        let heap = MemoryHeap::new(0, 1 << 30, 0);
        heap.add_allocated(MemoryCategory::AppBuffer, 4096);
        heap.add_allocated(MemoryCategory::RenderTarget, 8192);
        heap.add_used(MemoryCategory::AppBuffer, 1024);

        assert_eq!(heap.total_allocated(), 12288);

        let stats = heap.stats();
        assert_eq!(stats.categories[0].allocated, 4096);
        assert_eq!(stats.categories[0].used, 1024);
        assert_eq!(stats.categories[3].allocated, 8192);

        heap.remove_allocated(MemoryCategory::AppBuffer, 4096);
        heap.remove_used(MemoryCategory::AppBuffer, 1024);
        heap.remove_allocated(MemoryCategory::RenderTarget, 8192);
        assert_eq!(heap.total_allocated(), 0);
    }

    #[test]
    fn budget_enforcement() {
        let heap = MemoryHeap::new(0, 1 << 30, 512 << 20);
        assert!(heap.fits_budget(512 << 20));
        assert!(!heap.fits_budget((512 << 20) + 1));

        heap.add_allocated(MemoryCategory::Other, 256 << 20);
        assert!(heap.fits_budget(256 << 20));
        assert!(!heap.fits_budget((256 << 20) + 1));
    }

    #[test]
    fn zero_budget_is_unlimited() {
        let heap = MemoryHeap::new(1, 1 << 30, 0);
        heap.add_allocated(MemoryCategory::Other, 1 << 40);
        assert!(heap.fits_budget(u64::MAX >> 1));
    }

    #[test]
    fn dump_mentions_every_category() {
        let heap = MemoryHeap::new(0, 8 << 30, 6 << 30);
        let dump = heap.dump();
        for category in MemoryCategory::ALL {
            assert!(dump.contains(category.label()));
        }
    }
}
