use vulkanalia::prelude::v1_0::*;

use thiserror::Error;

/// Errors surfaced by the resource and submission core. Single
/// allocation attempts that fail are retried internally by the
/// allocator's fallback ladder and never reach the caller; only
/// the two genuinely terminal conditions are represented here,
/// so that the translation layer above can map them to the
/// legacy API's own error codes.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Every memory type and flag combination has been tried
    /// and the driver refused them all. The attached dump lists
    /// the per-heap allocated/used/budget figures at the time
    /// of failure.
    #[error("out of device memory: {size} bytes requested (alignment {alignment}, flags {flags:?})\n{heap_dump}")]
    OutOfDeviceMemory {
        size: u64,
        alignment: u64,
        flags: vk::MemoryPropertyFlags,
        heap_dump: String,
    },

    /// A submission or fence wait reported VK_ERROR_DEVICE_LOST.
    /// The submission queue latches this and drops all further
    /// GPU work; a lost device cannot resume mid-stream.
    #[error("the device has been lost")]
    DeviceLost,

    /// A bounded fence wait ran out of retries. A fence that
    /// never signals means the driver hung, which we treat the
    /// same as a lost device rather than deadlocking forever.
    #[error("fence wait exceeded {0} ms without signaling; treating the device as lost")]
    FenceTimeout(u64),
}
