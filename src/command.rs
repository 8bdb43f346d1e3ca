pub mod deferred;
pub mod tracker;

use std::any::Any;
use std::sync::Arc;

use anyhow::Result;
use log::warn;
use parking_lot::Mutex;
use vulkanalia::prelude::v1_0::*;
use vulkanalia::vk::DeviceV1_3;

use crate::buffer::{BufferSlice, GpuBuffer};
use crate::error::GpuError;
use crate::queues::DeviceQueues;

use tracker::{
    Access, DescriptorPoolTracker, EventTracker, LifetimeTracker, QueryTracker, RecyclerBanks,
    SignalTracker, SliceTracker,
};

/// One bounded fence wait, in nanoseconds.
const FENCE_WAIT_NS: u64 = 1_000_000_000;

/// Number of bounded waits before a fence is declared hung. The
/// wait is re-polled in a loop rather than issued once with an
/// infinite timeout so a wedged driver surfaces as an error
/// instead of a permanent deadlock.
const FENCE_WAIT_ATTEMPTS: u32 = 10;

/// Which of a command list's command buffers a command is
/// recorded into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdBufferClass {
    /// The main graphics/compute buffer; nearly every list uses
    /// it.
    General,
    /// Asynchronous uploads, submitted to the dedicated
    /// transfer queue when the hardware has one.
    Transfer,
    /// Pre-pass setup commands (image layout initialization and
    /// the like), executed before the general buffer on the
    /// same queue.
    Init,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ListState {
    Idle,
    Recording,
    Executable,
    Pending,
}

#[derive(Clone, Copy, Default)]
struct UsedBuffers {
    general: bool,
    transfer: bool,
    init: bool,
}

/// One recordable unit of GPU work. A command list owns a
/// fence, up to three command buffers across two queue
/// families, and the trackers that pin every referenced
/// resource until the fence proves the GPU is done with them.
///
/// Lifecycle: Idle -> `begin_recording` -> Recording ->
/// `end_recording` -> Executable -> `submit` -> Pending ->
/// fence resolves -> `reset` -> Idle, back to the pool.
pub struct CommandList {
    device: Arc<Device>,
    queues: DeviceQueues,
    banks: Arc<RecyclerBanks>,

    fence: vk::Fence,
    general_pool: vk::CommandPool,
    transfer_pool: vk::CommandPool,
    general: vk::CommandBuffer,
    init: vk::CommandBuffer,
    transfer: vk::CommandBuffer,
    /// Orders the transfer submission before the general one
    /// when they go to different hardware queues.
    transfer_semaphore: vk::Semaphore,

    state: ListState,
    used: UsedBuffers,

    /// At most one extra wait and one extra signal may be
    /// attached per submission by external callers (presenter
    /// handoff, frame-generation pacing); both are consumed by
    /// the next `submit`.
    extra_wait: Option<(vk::Semaphore, u64)>,
    extra_signal: Option<(vk::Semaphore, u64)>,

    resources: LifetimeTracker,
    slices: SliceTracker,
    descriptor_pools: DescriptorPoolTracker,
    queries: QueryTracker,
    events: EventTracker,
    signals: SignalTracker,
}

impl CommandList {
    pub fn new(
        device: Arc<Device>,
        queues: DeviceQueues,
        banks: Arc<RecyclerBanks>,
    ) -> Result<Self> {
        // One pool per queue family: command pools lock their
        // memory to a single thread, and resetting the whole
        // pool at begin is cheaper than resetting buffers
        // individually.
        let general_pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queues.general_family);

        let transfer_pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queues.transfer_family.unwrap_or(queues.general_family));

        let (general_pool, transfer_pool) = unsafe {
            (
                device.create_command_pool(&general_pool_info, None)?,
                device.create_command_pool(&transfer_pool_info, None)?,
            )
        };

        // The general and init buffers share the general pool;
        // the transfer buffer lives on the transfer family so
        // it can be submitted to the dedicated queue.
        let general_alloc = vk::CommandBufferAllocateInfo::builder()
            .command_pool(general_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(2);

        let transfer_alloc = vk::CommandBufferAllocateInfo::builder()
            .command_pool(transfer_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let (general, init, transfer) = unsafe {
            let general_buffers = device.allocate_command_buffers(&general_alloc)?;
            let transfer_buffers = device.allocate_command_buffers(&transfer_alloc)?;
            (general_buffers[0], general_buffers[1], transfer_buffers[0])
        };

        let (fence, transfer_semaphore) = unsafe {
            (
                device.create_fence(&vk::FenceCreateInfo::builder(), None)?,
                device.create_semaphore(&vk::SemaphoreCreateInfo::builder(), None)?,
            )
        };

        Ok(Self {
            device,
            queues,
            banks,
            fence,
            general_pool,
            transfer_pool,
            general,
            init,
            transfer,
            transfer_semaphore,
            state: ListState::Idle,
            used: UsedBuffers::default(),
            extra_wait: None,
            extra_signal: None,
            resources: LifetimeTracker::default(),
            slices: SliceTracker::default(),
            descriptor_pools: DescriptorPoolTracker::default(),
            queries: QueryTracker::default(),
            events: EventTracker::default(),
            signals: SignalTracker::default(),
        })
    }

    /// Resets the pools and fence and opens all three command
    /// buffers for recording. The general buffer is marked used
    /// unconditionally; nearly every list records into it, and
    /// the fence has to ride on some submission regardless.
    pub fn begin_recording(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, ListState::Idle);

        unsafe {
            self.device
                .reset_command_pool(self.general_pool, vk::CommandPoolResetFlags::empty())?;
            self.device
                .reset_command_pool(self.transfer_pool, vk::CommandPoolResetFlags::empty())?;
            self.device.reset_fences(&[self.fence])?;
        }

        let info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device.begin_command_buffer(self.general, &info)?;
            self.device.begin_command_buffer(self.init, &info)?;
            self.device.begin_command_buffer(self.transfer, &info)?;
        }

        self.used = UsedBuffers {
            general: true,
            ..UsedBuffers::default()
        };
        self.state = ListState::Recording;

        Ok(())
    }

    /// Closes all three command buffers, used or not; ending an
    /// empty buffer is cheaper than tracking which ones to
    /// skip.
    pub fn end_recording(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, ListState::Recording);

        unsafe {
            self.device.end_command_buffer(self.general)?;
            self.device.end_command_buffer(self.init)?;
            self.device.end_command_buffer(self.transfer)?;
        }

        self.state = ListState::Executable;
        Ok(())
    }

    /// Issues one driver submission per hardware queue actually
    /// used. A recorded transfer buffer goes to the dedicated
    /// transfer queue first, signaling a semaphore the general
    /// submission waits on; without a dedicated queue it is
    /// simply ordered before the init and general buffers in
    /// the single submission. The raw error code is returned so
    /// the submission queue can recognize device loss.
    ///
    /// The caller must hold the hardware queue lock across this
    /// entire call.
    pub fn submit(
        &mut self,
        wait: Option<(vk::Semaphore, u64)>,
        signal: Option<(vk::Semaphore, u64)>,
    ) -> Result<(), vk::ErrorCode> {
        debug_assert_eq!(self.state, ListState::Executable);

        // The explicit arguments and the externally attached
        // extras are additive; both go into the submission, and
        // the extras are consumed by it.
        let mut waits = semaphore_submits(wait, self.extra_wait.take());
        let signals = semaphore_submits(signal, self.extra_signal.take());
        let mut buffers = Vec::with_capacity(3);

        let mut transfer_submitted = false;
        if self.used.transfer {
            match self.queues.transfer {
                Some(transfer_queue) => {
                    // Dedicated DMA engine: its submission gets
                    // its own completion semaphore, and the
                    // general submission is made to wait on it.
                    let transfer_buffers = [vk::CommandBufferSubmitInfo::builder()
                        .command_buffer(self.transfer)
                        .build()];
                    let transfer_signals = [semaphore_submit(self.transfer_semaphore, 0)];

                    let transfer_submit = vk::SubmitInfo2::builder()
                        .command_buffer_infos(&transfer_buffers)
                        .signal_semaphore_infos(&transfer_signals);

                    unsafe {
                        self.device.queue_submit2(
                            transfer_queue,
                            &[transfer_submit],
                            vk::Fence::null(),
                        )?;
                    }

                    transfer_submitted = true;
                    waits.push(semaphore_submit(self.transfer_semaphore, 0));
                }
                None => {
                    buffers.push(
                        vk::CommandBufferSubmitInfo::builder()
                            .command_buffer(self.transfer)
                            .build(),
                    );
                }
            }
        }

        if self.used.init {
            buffers.push(
                vk::CommandBufferSubmitInfo::builder()
                    .command_buffer(self.init)
                    .build(),
            );
        }

        buffers.push(
            vk::CommandBufferSubmitInfo::builder()
                .command_buffer(self.general)
                .build(),
        );

        let submit = vk::SubmitInfo2::builder()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&buffers)
            .signal_semaphore_infos(&signals);

        let result = unsafe {
            self.device
                .queue_submit2(self.queues.general, &[submit], self.fence)
        };

        if let Err(code) = result {
            // The fence rides on the general submission, so any
            // transfer work already handed to the dedicated
            // queue is fence-less now. It must be drained before
            // the caller reclaims the tracked resources it may
            // still be reading.
            recover_partial_submission(transfer_submitted, || {
                if let Some(transfer_queue) = self.queues.transfer {
                    let _ = unsafe { self.device.queue_wait_idle(transfer_queue) };
                }
            });

            return Err(code);
        }

        self.state = ListState::Pending;
        Ok(())
    }

    /// Blocks until the fence resolves. The wait is bounded and
    /// re-polled so a hung driver turns into an error rather
    /// than an unbounded stall; running out of retries is
    /// treated as device loss.
    pub fn synchronize(&self) -> Result<(), GpuError> {
        for attempt in 0..FENCE_WAIT_ATTEMPTS {
            let result = unsafe {
                self.device
                    .wait_for_fences(&[self.fence], true, FENCE_WAIT_NS)
            };

            match result {
                Ok(vk::SuccessCode::TIMEOUT) => {
                    warn!("Fence wait timed out (attempt {}).", attempt + 1);
                }
                Ok(_) => return Ok(()),
                Err(vk::ErrorCode::DEVICE_LOST) => return Err(GpuError::DeviceLost),
                Err(code) => {
                    warn!("Fence wait failed: {code:?}.");
                    return Err(GpuError::DeviceLost);
                }
            }
        }

        Err(GpuError::FenceTimeout(
            FENCE_WAIT_ATTEMPTS as u64 * FENCE_WAIT_NS / 1_000_000,
        ))
    }

    /// Runs the user-level completion callbacks. Called by the
    /// finish thread after the fence resolved, before `reset`.
    pub fn notify_signals(&mut self) {
        self.signals.notify();
    }

    /// Drains every tracker, returning slices to their buffers
    /// and borrowed pools to their banks, and makes the list
    /// reusable. Only valid once the fence has resolved; the
    /// trackers exist precisely to delay this until then.
    pub fn reset(&mut self) {
        self.slices.reset();
        self.descriptor_pools.reset(&self.banks.descriptors);
        self.queries.reset(&self.banks.queries);
        self.events.reset(&self.banks.events);
        self.resources.clear();

        self.used = UsedBuffers::default();
        self.extra_wait = None;
        self.extra_signal = None;
        self.state = ListState::Idle;
    }

    pub fn is_pending(&self) -> bool {
        self.state == ListState::Pending
    }

    // ------------------------------------------------------
    // External semaphore attachment (presenter handoff and
    // frame-generation pacing).

    /// Attaches one extra wait semaphore to the next `submit`.
    /// Attaching a second before the first is consumed is a
    /// programming error.
    pub fn add_wait_semaphore(&mut self, semaphore: vk::Semaphore, value: u64) {
        debug_assert!(self.extra_wait.is_none(), "extra wait semaphore already attached");
        self.extra_wait = Some((semaphore, value));
    }

    /// Attaches one extra signal semaphore to the next
    /// `submit`; same single-slot contract as the wait side.
    pub fn add_signal_semaphore(&mut self, semaphore: vk::Semaphore, value: u64) {
        debug_assert!(self.extra_signal.is_none(), "extra signal semaphore already attached");
        self.extra_signal = Some((semaphore, value));
    }

    // ------------------------------------------------------
    // Tracking.

    pub fn track_resource(&mut self, resource: Arc<dyn Any + Send + Sync>, access: Access) {
        self.resources.track(resource, access);
    }

    pub fn track_slice(&mut self, buffer: Arc<GpuBuffer>, slice: BufferSlice) {
        self.slices.track(buffer, slice);
    }

    pub fn track_descriptor_pool(&mut self, pool: vk::DescriptorPool) {
        self.descriptor_pools.track(pool);
    }

    pub fn track_query_pool(&mut self, pool: vk::QueryPool) {
        self.queries.track(pool);
    }

    pub fn track_event(&mut self, event: vk::Event) {
        self.events.track(event);
    }

    pub fn on_complete(&mut self, signal: Box<dyn FnOnce() + Send>) {
        self.signals.track(signal);
    }

    // ------------------------------------------------------
    // Recording passthroughs, the only points at which the
    // shim layer touches command buffers.

    fn target(&mut self, class: CmdBufferClass) -> vk::CommandBuffer {
        debug_assert_eq!(self.state, ListState::Recording);

        match class {
            CmdBufferClass::General => {
                self.used.general = true;
                self.general
            }
            CmdBufferClass::Transfer => {
                self.used.transfer = true;
                self.transfer
            }
            CmdBufferClass::Init => {
                self.used.init = true;
                self.init
            }
        }
    }

    pub fn copy_buffer(
        &mut self,
        class: CmdBufferClass,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        let buffer = self.target(class);
        unsafe { self.device.cmd_copy_buffer(buffer, src, dst, regions) };
    }

    pub fn copy_buffer_to_image(
        &mut self,
        class: CmdBufferClass,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        let buffer = self.target(class);
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(buffer, src, dst, dst_layout, regions)
        };
    }

    pub fn copy_image_to_buffer(
        &mut self,
        class: CmdBufferClass,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        let buffer = self.target(class);
        unsafe {
            self.device
                .cmd_copy_image_to_buffer(buffer, src, src_layout, dst, regions)
        };
    }

    pub fn blit_image(
        &mut self,
        class: CmdBufferClass,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        let buffer = self.target(class);
        unsafe {
            self.device
                .cmd_blit_image(buffer, src, src_layout, dst, dst_layout, regions, filter)
        };
    }

    pub fn clear_color_image(
        &mut self,
        class: CmdBufferClass,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        let buffer = self.target(class);
        unsafe {
            self.device
                .cmd_clear_color_image(buffer, image, layout, color, ranges)
        };
    }

    pub fn pipeline_barrier(&mut self, class: CmdBufferClass, dependency: &vk::DependencyInfo) {
        let buffer = self.target(class);
        unsafe { self.device.cmd_pipeline_barrier2(buffer, dependency) };
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        let buffer = self.target(CmdBufferClass::General);
        unsafe { self.device.cmd_dispatch(buffer, x, y, z) };
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        let buffer = self.target(CmdBufferClass::General);
        unsafe {
            self.device
                .cmd_draw(buffer, vertex_count, instance_count, first_vertex, first_instance)
        };
    }

    #[allow(clippy::too_many_arguments)]
    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        let buffer = self.target(CmdBufferClass::General);
        unsafe {
            self.device.cmd_draw_indexed(
                buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        // Trackers may still hold resources if the list never
        // got submitted; release them before the Vulkan objects
        // go away.
        self.reset();

        unsafe {
            self.device.destroy_command_pool(self.general_pool, None);
            self.device.destroy_command_pool(self.transfer_pool, None);
            self.device.destroy_fence(self.fence, None);
            self.device.destroy_semaphore(self.transfer_semaphore, None);
        }
    }
}

/// A semaphore submit operation: the semaphore, the value (for
/// timeline semaphores; ignored by binary ones) and a stage
/// mask limiting the synchronization scope.
fn semaphore_submit(semaphore: vk::Semaphore, value: u64) -> vk::SemaphoreSubmitInfo {
    vk::SemaphoreSubmitInfo::builder()
        .semaphore(semaphore)
        .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .device_index(0)
        .value(value)
        .build()
}

/// Merges an explicit submit-time semaphore with an externally
/// attached extra one; neither side may displace the other.
fn semaphore_submits(
    explicit: Option<(vk::Semaphore, u64)>,
    extra: Option<(vk::Semaphore, u64)>,
) -> Vec<vk::SemaphoreSubmitInfo> {
    explicit
        .into_iter()
        .chain(extra)
        .map(|(semaphore, value)| semaphore_submit(semaphore, value))
        .collect()
}

/// Cleanup after a submission that failed partway: transfer
/// work that already reached its queue carries no fence and has
/// to be drained before tracked resources are reclaimed.
fn recover_partial_submission(transfer_submitted: bool, drain_transfer: impl FnOnce()) {
    if transfer_submitted {
        drain_transfer();
    }
}

/// Pool of reusable command lists. The finish thread returns
/// reset lists here; recording threads draw from it instead of
/// paying pool/buffer/fence creation per frame.
pub struct CommandListPool {
    device: Arc<Device>,
    queues: DeviceQueues,
    banks: Arc<RecyclerBanks>,
    free: Mutex<Vec<Box<CommandList>>>,
}

impl CommandListPool {
    pub fn new(device: Arc<Device>, queues: DeviceQueues) -> Arc<Self> {
        Arc::new(Self {
            banks: Arc::new(RecyclerBanks::new(&device)),
            device,
            queues,
            free: Mutex::new(Vec::new()),
        })
    }

    pub fn banks(&self) -> &Arc<RecyclerBanks> {
        &self.banks
    }

    pub fn acquire(&self) -> Result<Box<CommandList>> {
        if let Some(list) = self.free.lock().pop() {
            return Ok(list);
        }

        Ok(Box::new(CommandList::new(
            self.device.clone(),
            self.queues,
            self.banks.clone(),
        )?))
    }

    pub fn recycle(&self, list: Box<CommandList>) {
        debug_assert!(!list.is_pending());
        self.free.lock().push(list);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_and_extra_semaphores_are_additive() {
        let explicit = vk::Semaphore::from_raw(1);
        let extra = vk::Semaphore::from_raw(2);

        // Passing an explicit semaphore must not displace an
        // attached extra one; both ride the submission.
        let infos = semaphore_submits(Some((explicit, 7)), Some((extra, 9)));
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].semaphore, explicit);
        assert_eq!(infos[0].value, 7);
        assert_eq!(infos[1].semaphore, extra);
        assert_eq!(infos[1].value, 9);
    }

    #[test]
    fn lone_semaphores_pass_through() {
        let semaphore = vk::Semaphore::from_raw(3);

        let infos = semaphore_submits(Some((semaphore, 0)), None);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].semaphore, semaphore);

        let infos = semaphore_submits(None, Some((semaphore, 4)));
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].value, 4);

        assert!(semaphore_submits(None, None).is_empty());
    }

    #[test]
    fn partial_submission_recovery_drains_exactly_when_needed() {
        let mut drained = false;
        recover_partial_submission(true, || drained = true);
        assert!(drained);

        recover_partial_submission(false, || panic!("nothing reached the driver"));
    }
}
