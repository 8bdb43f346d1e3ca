use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Result;
use log::{debug, error, info};
use parking_lot::{Condvar, Mutex, MutexGuard};
use vulkanalia::prelude::v1_0::*;

use crate::command::{CommandList, CommandListPool};
use crate::config::CoreConfig;
use crate::error::GpuError;
use crate::present::{PresentRequest, Presenter};
use crate::queues::DeviceQueues;

/// Outcome of one queued submission or presentation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitResult {
    Success,
    /// Presented, but the swapchain no longer matches the
    /// surface exactly; rebuild when convenient.
    Suboptimal,
    /// The swapchain is unusable and must be rebuilt before the
    /// next present.
    OutOfDate,
    DeviceLost,
    Error,
}

impl SubmitResult {
    fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(Self::Success),
            2 => Some(Self::Suboptimal),
            3 => Some(Self::OutOfDate),
            4 => Some(Self::DeviceLost),
            5 => Some(Self::Error),
            _ => None,
        }
    }

    fn as_raw(self) -> i32 {
        match self {
            Self::Success => 1,
            Self::Suboptimal => 2,
            Self::OutOfDate => 3,
            Self::DeviceLost => 4,
            Self::Error => 5,
        }
    }
}

impl From<vk::ErrorCode> for SubmitResult {
    fn from(code: vk::ErrorCode) -> Self {
        match code {
            vk::ErrorCode::DEVICE_LOST => Self::DeviceLost,
            _ => Self::Error,
        }
    }
}

/// Completion handle for one queued operation. The common path
/// only ever calls `poll`, which is a single atomic load;
/// `wait` takes the lock and sleeps until the worker threads
/// publish a result.
pub struct SubmitStatus {
    state: AtomicI32,
    lock: Mutex<()>,
    cond: Condvar,
}

impl SubmitStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicI32::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        })
    }

    /// The result, if one has been published yet.
    pub fn poll(&self) -> Option<SubmitResult> {
        SubmitResult::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Blocks until a result is published.
    pub fn wait(&self) -> SubmitResult {
        if let Some(result) = self.poll() {
            return result;
        }

        let mut guard = self.lock.lock();
        loop {
            if let Some(result) = self.poll() {
                return result;
            }
            self.cond.wait(&mut guard);
        }
    }

    fn signal(&self, result: SubmitResult) {
        // The store happens under the lock so a waiter cannot
        // check, miss the result, and then sleep through the
        // notification.
        let _guard = self.lock.lock();
        self.state.store(result.as_raw(), Ordering::Release);
        self.cond.notify_all();
    }
}

struct PipelineState<S, F> {
    submit: std::collections::VecDeque<S>,
    finish: std::collections::VecDeque<F>,
    /// Entries popped from a queue but not yet completed; they
    /// still count against capacity and against drain waits.
    submitting: usize,
    finishing: usize,
    stopped: bool,
}

/// The two-stage work pipeline between the application, the
/// submit thread and the finish thread. Generic over the entry
/// types so the queueing discipline is testable with plain
/// values and real threads, no GPU required.
///
/// Capacity bounds the total number of in-flight entries across
/// both stages; `enqueue` blocks once it is reached, which is
/// the backpressure that stops a fast CPU from running
/// unboundedly ahead of the GPU.
pub struct SubmitPipeline<S, F> {
    state: Mutex<PipelineState<S, F>>,
    submit_cond: Condvar,
    finish_cond: Condvar,
    drain_cond: Condvar,
    capacity: usize,
}

impl<S, F> SubmitPipeline<S, F> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PipelineState {
                submit: std::collections::VecDeque::new(),
                finish: std::collections::VecDeque::new(),
                submitting: 0,
                finishing: 0,
                stopped: false,
            }),
            submit_cond: Condvar::new(),
            finish_cond: Condvar::new(),
            drain_cond: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn in_flight(state: &PipelineState<S, F>) -> usize {
        state.submit.len() + state.submitting + state.finish.len() + state.finishing
    }

    /// Queues an entry for the submit stage, blocking while the
    /// pipeline is at capacity.
    pub fn enqueue(&self, entry: S) {
        let mut state = self.state.lock();
        while !state.stopped && Self::in_flight(&state) >= self.capacity {
            self.drain_cond.wait(&mut state);
        }

        state.submit.push_back(entry);
        self.submit_cond.notify_one();
    }

    /// Pops the next submit entry, blocking while the queue is
    /// empty. Returns `None` once the pipeline is stopped and
    /// drained.
    pub fn pop_submit(&self) -> Option<S> {
        let mut state = self.state.lock();
        loop {
            if let Some(entry) = state.submit.pop_front() {
                state.submitting += 1;
                return Some(entry);
            }
            if state.stopped {
                return None;
            }
            self.submit_cond.wait(&mut state);
        }
    }

    /// Marks the entry from the last `pop_submit` as done with
    /// the submit stage (without forwarding anything to the
    /// finish stage).
    pub fn complete_submit(&self) {
        let mut state = self.state.lock();
        state.submitting -= 1;
        self.drain_cond.notify_all();
    }

    /// Forwards an entry to the finish stage and completes its
    /// submit stage in one step.
    pub fn forward(&self, entry: F) {
        let mut state = self.state.lock();
        state.submitting -= 1;
        state.finish.push_back(entry);
        self.finish_cond.notify_one();
        self.drain_cond.notify_all();
    }

    pub fn pop_finish(&self) -> Option<F> {
        let mut state = self.state.lock();
        loop {
            if let Some(entry) = state.finish.pop_front() {
                state.finishing += 1;
                return Some(entry);
            }
            if state.stopped {
                return None;
            }
            self.finish_cond.wait(&mut state);
        }
    }

    pub fn complete_finish(&self) {
        let mut state = self.state.lock();
        state.finishing -= 1;
        self.drain_cond.notify_all();
    }

    /// Blocks until every entry has cleared the submit stage.
    /// Entries may still be waiting on their fences in the
    /// finish stage.
    pub fn wait_submit_drained(&self) {
        let mut state = self.state.lock();
        while state.submit.len() + state.submitting > 0 {
            self.drain_cond.wait(&mut state);
        }
    }

    /// Blocks until the pipeline is completely empty.
    pub fn wait_all_drained(&self) {
        let mut state = self.state.lock();
        while Self::in_flight(&state) > 0 {
            self.drain_cond.wait(&mut state);
        }
    }

    /// Stops the pipeline: blocked producers and consumers wake
    /// up, and consumers drain what remains before seeing
    /// `None`.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        self.submit_cond.notify_all();
        self.finish_cond.notify_all();
        self.drain_cond.notify_all();
    }
}

/// Resolves one finish-stage entry: a latched device loss is
/// reflected immediately, without ever blocking on the fence —
/// after a loss each queued fence could otherwise stall the
/// finish thread for the full bounded wait.
fn fence_outcome(
    device_lost: bool,
    wait: impl FnOnce() -> Result<(), GpuError>,
) -> Result<(), GpuError> {
    if device_lost {
        Err(GpuError::DeviceLost)
    } else {
        wait()
    }
}

/// Entries handled by the submit thread, in strict queue order.
enum SubmitEntry {
    Submit {
        list: Box<CommandList>,
        status: Arc<SubmitStatus>,
    },
    Present {
        presenter: Arc<dyn Presenter>,
        request: PresentRequest,
        status: Arc<SubmitStatus>,
    },
    /// Arbitrary work ordered with the submissions around it,
    /// e.g. frame-generation setup that must run between two
    /// frames' submits.
    Callback(Box<dyn FnOnce() + Send>),
}

struct FinishEntry {
    list: Box<CommandList>,
    status: Arc<SubmitStatus>,
}

struct QueueShared {
    device: Arc<Device>,
    queues: DeviceQueues,
    pool: Arc<CommandListPool>,
    pipeline: SubmitPipeline<SubmitEntry, FinishEntry>,
    /// Guards every access to the hardware queues. Exposed via
    /// `lock_queue` so external code (overlays, capture tools)
    /// can interleave its own submissions safely.
    queue_lock: Mutex<()>,
    /// Sticky: once the device is lost every later submission
    /// fails fast without touching the driver.
    device_lost: AtomicBool,
}

impl QueueShared {
    fn run_submit(&self) {
        while let Some(entry) = self.pipeline.pop_submit() {
            match entry {
                SubmitEntry::Submit { mut list, status } => {
                    if self.device_lost.load(Ordering::Acquire) {
                        status.signal(SubmitResult::DeviceLost);
                        list.reset();
                        self.pool.recycle(list);
                        self.pipeline.complete_submit();
                        continue;
                    }

                    let result = {
                        let _queue = self.queue_lock.lock();
                        list.submit(None, None)
                    };

                    match result {
                        Ok(()) => self.pipeline.forward(FinishEntry { list, status }),
                        Err(code) => {
                            error!("Queue submission failed: {code:?}.");
                            if code == vk::ErrorCode::DEVICE_LOST {
                                self.device_lost.store(true, Ordering::Release);
                            }
                            status.signal(code.into());
                            list.reset();
                            self.pool.recycle(list);
                            self.pipeline.complete_submit();
                        }
                    }
                }
                SubmitEntry::Present { presenter, request, status } => {
                    let result = if self.device_lost.load(Ordering::Acquire) {
                        SubmitResult::DeviceLost
                    } else {
                        let _queue = self.queue_lock.lock();
                        presenter.present(self.queues.general, &request)
                    };

                    if result == SubmitResult::DeviceLost {
                        self.device_lost.store(true, Ordering::Release);
                    }
                    status.signal(result);
                    self.pipeline.complete_submit();
                }
                SubmitEntry::Callback(callback) => {
                    callback();
                    self.pipeline.complete_submit();
                }
            }
        }
    }

    fn run_finish(&self) {
        while let Some(FinishEntry { mut list, status }) = self.pipeline.pop_finish() {
            let lost = self.device_lost.load(Ordering::Acquire);
            match fence_outcome(lost, || list.synchronize()) {
                Ok(()) => {
                    list.notify_signals();
                    status.signal(SubmitResult::Success);
                }
                Err(GpuError::DeviceLost) => {
                    error!("Device lost while waiting on a submission fence.");
                    self.device_lost.store(true, Ordering::Release);
                    status.signal(SubmitResult::DeviceLost);
                }
                Err(err) => {
                    error!("Submission fence never resolved: {err}.");
                    self.device_lost.store(true, Ordering::Release);
                    status.signal(SubmitResult::DeviceLost);
                }
            }

            list.reset();
            self.pool.recycle(list);
            self.pipeline.complete_finish();
        }
    }
}

/// The two-thread submission queue. Applications enqueue
/// executable command lists and presents here; a submit thread
/// feeds the driver in strict order, and a finish thread waits
/// on fences and recycles command lists once the GPU is done.
/// Keeping driver calls off the application threads hides their
/// latency, which is the whole point of the design.
pub struct SubmissionQueue {
    shared: Arc<QueueShared>,
    submit_thread: Option<JoinHandle<()>>,
    finish_thread: Option<JoinHandle<()>>,
}

impl SubmissionQueue {
    pub fn new(
        device: Arc<Device>,
        queues: DeviceQueues,
        pool: Arc<CommandListPool>,
        config: &CoreConfig,
    ) -> Result<Self> {
        let shared = Arc::new(QueueShared {
            device,
            queues,
            pool,
            pipeline: SubmitPipeline::new(config.max_queued_command_buffers),
            queue_lock: Mutex::new(()),
            device_lost: AtomicBool::new(false),
        });

        let submit_shared = shared.clone();
        let submit_thread = std::thread::Builder::new()
            .name("gpu-submit".into())
            .spawn(move || submit_shared.run_submit())?;

        let finish_shared = shared.clone();
        let finish_thread = std::thread::Builder::new()
            .name("gpu-finish".into())
            .spawn(move || finish_shared.run_finish())?;

        info!(
            "Submission queue started ({} in-flight submissions max).",
            config.max_queued_command_buffers,
        );

        Ok(Self {
            shared,
            submit_thread: Some(submit_thread),
            finish_thread: Some(finish_thread),
        })
    }

    /// Queues an executable command list. Blocks only when the
    /// pipeline is at capacity.
    pub fn submit(&self, list: Box<CommandList>) -> Arc<SubmitStatus> {
        let status = SubmitStatus::new();
        self.shared.pipeline.enqueue(SubmitEntry::Submit {
            list,
            status: status.clone(),
        });
        status
    }

    /// Queues a presentation behind every submission queued so
    /// far.
    pub fn present(&self, presenter: Arc<dyn Presenter>, request: PresentRequest) -> Arc<SubmitStatus> {
        let status = SubmitStatus::new();
        self.shared.pipeline.enqueue(SubmitEntry::Present {
            presenter,
            request,
            status: status.clone(),
        });
        status
    }

    /// Queues arbitrary work on the submit thread, ordered with
    /// the submissions around it.
    pub fn submit_callback(&self, callback: Box<dyn FnOnce() + Send>) {
        self.shared.pipeline.enqueue(SubmitEntry::Callback(callback));
    }

    /// Blocks until everything queued so far has reached the
    /// driver. Fences may still be pending.
    pub fn synchronize(&self) {
        self.shared.pipeline.wait_submit_drained();
    }

    /// Blocks until a specific queued submission has fully
    /// completed.
    pub fn synchronize_submission(&self, status: &SubmitStatus) -> SubmitResult {
        status.wait()
    }

    /// Blocks until both stages are empty (everything submitted,
    /// every fence resolved, every command list recycled) and
    /// then waits the device itself idle.
    pub fn wait_for_idle(&self) {
        self.shared.pipeline.wait_all_drained();

        let _queue = self.shared.queue_lock.lock();
        if let Err(code) = unsafe { self.shared.device.device_wait_idle() } {
            error!("Device idle wait failed: {code:?}.");
            if code == vk::ErrorCode::DEVICE_LOST {
                self.shared.device_lost.store(true, Ordering::Release);
            }
        }
    }

    /// Takes the hardware queue lock. External submissions
    /// (overlays, capture layers) must hold this around their
    /// own driver calls.
    pub fn lock_queue(&self) -> MutexGuard<'_, ()> {
        self.shared.queue_lock.lock()
    }

    pub fn is_device_lost(&self) -> bool {
        self.shared.device_lost.load(Ordering::Acquire)
    }
}

impl Drop for SubmissionQueue {
    fn drop(&mut self) {
        debug!("Stopping submission queue.");
        self.shared.pipeline.stop();

        if let Some(thread) = self.submit_thread.take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.finish_thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn pipeline_is_fifo_through_both_stages() {
        let pipeline = Arc::new(SubmitPipeline::<u32, u32>::new(64));
        let order = Arc::new(Mutex::new(Vec::new()));

        let submit_pipeline = pipeline.clone();
        let submit = std::thread::spawn(move || {
            while let Some(value) = submit_pipeline.pop_submit() {
                submit_pipeline.forward(value);
            }
        });

        let finish_pipeline = pipeline.clone();
        let finish_order = order.clone();
        let finish = std::thread::spawn(move || {
            while let Some(value) = finish_pipeline.pop_finish() {
                finish_order.lock().push(value);
                finish_pipeline.complete_finish();
            }
        });

        for value in 0..100 {
            pipeline.enqueue(value);
        }

        pipeline.wait_all_drained();
        pipeline.stop();
        submit.join().unwrap();
        finish.join().unwrap();

        assert_eq!(*order.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn enqueue_blocks_at_capacity() {
        let pipeline = Arc::new(SubmitPipeline::<u32, u32>::new(8));
        let enqueued = Arc::new(AtomicUsize::new(0));

        let producer_pipeline = pipeline.clone();
        let producer_count = enqueued.clone();
        let producer = std::thread::spawn(move || {
            for value in 0..9 {
                producer_pipeline.enqueue(value);
                producer_count.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Nobody is consuming, so the ninth enqueue must block.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(enqueued.load(Ordering::SeqCst), 8);

        // Completing one entry frees a slot and unblocks it.
        assert_eq!(pipeline.pop_submit(), Some(0));
        pipeline.complete_submit();
        producer.join().unwrap();
        assert_eq!(enqueued.load(Ordering::SeqCst), 9);

        // Drain the rest so the pipeline ends empty.
        for expected in 1..9 {
            assert_eq!(pipeline.pop_submit(), Some(expected));
            pipeline.complete_submit();
        }
        pipeline.wait_all_drained();
    }

    #[test]
    fn submit_drain_ignores_finish_stage() {
        let pipeline = Arc::new(SubmitPipeline::<u32, u32>::new(8));

        pipeline.enqueue(1);
        let value = pipeline.pop_submit().unwrap();
        pipeline.forward(value);

        // The entry sits in the finish stage; the submit side is
        // drained regardless.
        pipeline.wait_submit_drained();

        let value = pipeline.pop_finish().unwrap();
        assert_eq!(value, 1);
        pipeline.complete_finish();
        pipeline.wait_all_drained();
    }

    #[test]
    fn stopped_pipeline_drains_then_ends() {
        let pipeline = Arc::new(SubmitPipeline::<u32, u32>::new(8));
        pipeline.enqueue(7);
        pipeline.stop();

        // Entries queued before the stop still come out.
        assert_eq!(pipeline.pop_submit(), Some(7));
        pipeline.complete_submit();
        assert!(pipeline.pop_submit().is_none());
        assert!(pipeline.pop_finish().is_none());
    }

    #[test]
    fn latched_device_loss_skips_the_fence_wait() {
        // A cached loss must resolve the entry without touching
        // the fence at all.
        let outcome = fence_outcome(true, || panic!("must not block on the fence"));
        assert!(matches!(outcome, Err(GpuError::DeviceLost)));

        // Without a cached loss, the wait runs and its result
        // passes through.
        assert!(fence_outcome(false, || Ok(())).is_ok());
        let outcome = fence_outcome(false, || Err(GpuError::FenceTimeout(10_000)));
        assert!(matches!(outcome, Err(GpuError::FenceTimeout(_))));
    }

    #[test]
    fn status_wait_sees_result_from_another_thread() {
        let status = SubmitStatus::new();
        assert_eq!(status.poll(), None);

        let signaller = status.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            signaller.signal(SubmitResult::Suboptimal);
        });

        assert_eq!(status.wait(), SubmitResult::Suboptimal);
        assert_eq!(status.poll(), Some(SubmitResult::Suboptimal));
        thread.join().unwrap();
    }
}
