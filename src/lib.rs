//! GPU resource lifetime and submission core for a
//! legacy-API-on-Vulkan translation layer.
//!
//! The crate covers the plumbing between a translated command
//! stream and the driver: a chunked device memory allocator
//! with budget awareness and graceful fallback, virtual buffers
//! that hand out fence-guarded slices for lock-free renaming,
//! command lists that pin every referenced resource until their
//! fence resolves, and a two-thread submission queue that keeps
//! driver calls off the application's hot path.

pub mod buffer;
pub mod command;
pub mod config;
pub mod error;
pub mod memory;
pub mod present;
pub mod queues;
pub mod submit;

pub use buffer::{BufferCreateParams, BufferSlice, GpuBuffer};
pub use command::{CmdBufferClass, CommandList, CommandListPool};
pub use config::CoreConfig;
pub use error::GpuError;
pub use memory::{DedicationHint, DeviceMemoryAllocator, MemoryCategory};
pub use present::{PresentRequest, Presenter, SwapchainPresenter};
pub use queues::{DeviceQueues, QueueFamilyIndices};
pub use submit::{SubmissionQueue, SubmitResult, SubmitStatus};
