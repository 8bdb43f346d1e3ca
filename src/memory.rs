pub mod allocator;
pub mod chunk;
pub mod heap;
pub mod kind;

pub use allocator::{DedicationHint, DeviceMemoryAllocator};
pub use chunk::{align_up, ChunkId, FreeList, FreeRange, MemoryChunk};
pub use heap::{CategoryStats, HeapStats, MemoryCategory, MemoryHeap};
pub use kind::{GpuMemory, MemoryKind};
