use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;
use vulkanalia::prelude::v1_0::*;
use vulkanalia::vk::KhrSwapchainExtension;

use crate::submit::SubmitResult;

/// One presentation operation, queued behind the GPU work that
/// renders the image.
#[derive(Clone, Copy, Debug)]
pub struct PresentRequest {
    pub image_index: u32,
    /// Semaphore the presentation engine waits on before
    /// scanning the image out.
    pub wait_semaphore: vk::Semaphore,
}

/// Presentation backend driven by the submission queue's submit
/// thread. The indirection keeps the queue ignorant of the
/// surface: frame-generation layers or headless targets slot in
/// by implementing this instead of `SwapchainPresenter`.
pub trait Presenter: Send + Sync {
    /// Acquires the next presentable image, signaling
    /// `semaphore` when it is ready to render into.
    fn acquire(&self, semaphore: vk::Semaphore) -> (u32, SubmitResult);

    /// Presents one image on the given hardware queue. The
    /// caller holds the hardware queue lock for the duration.
    fn present(&self, queue: vk::Queue, request: &PresentRequest) -> SubmitResult;

    /// Swaps in a rebuilt swapchain after an out-of-date or
    /// suboptimal result. The old handle is the caller's to
    /// destroy once no presentation is in flight.
    fn recreate(&self, swapchain: vk::SwapchainKHR) -> vk::SwapchainKHR;
}

/// The plain swapchain-backed presenter.
pub struct SwapchainPresenter {
    device: Arc<Device>,
    swapchain: Mutex<vk::SwapchainKHR>,
}

impl SwapchainPresenter {
    pub fn new(device: Arc<Device>, swapchain: vk::SwapchainKHR) -> Self {
        Self {
            device,
            swapchain: Mutex::new(swapchain),
        }
    }

    pub fn swapchain(&self) -> vk::SwapchainKHR {
        *self.swapchain.lock()
    }
}

impl Presenter for SwapchainPresenter {
    fn acquire(&self, semaphore: vk::Semaphore) -> (u32, SubmitResult) {
        let result = unsafe {
            self.device.acquire_next_image_khr(
                *self.swapchain.lock(),
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, vk::SuccessCode::SUBOPTIMAL_KHR)) => (index, SubmitResult::Suboptimal),
            Ok((index, _)) => (index, SubmitResult::Success),
            Err(vk::ErrorCode::OUT_OF_DATE_KHR) => (0, SubmitResult::OutOfDate),
            Err(vk::ErrorCode::DEVICE_LOST) => (0, SubmitResult::DeviceLost),
            Err(code) => {
                warn!("Image acquisition failed: {code:?}.");
                (0, SubmitResult::Error)
            }
        }
    }

    fn present(&self, queue: vk::Queue, request: &PresentRequest) -> SubmitResult {
        let swapchains = [*self.swapchain.lock()];
        let image_indices = [request.image_index];
        let wait_semaphores = [request.wait_semaphore];

        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.device.queue_present_khr(queue, &info) };

        // Suboptimal and out-of-date are not failures; they tell
        // the application to rebuild the swapchain at its next
        // convenience (immediately, for out-of-date).
        match result {
            Ok(vk::SuccessCode::SUBOPTIMAL_KHR) => SubmitResult::Suboptimal,
            Ok(_) => SubmitResult::Success,
            Err(vk::ErrorCode::OUT_OF_DATE_KHR) => SubmitResult::OutOfDate,
            Err(vk::ErrorCode::DEVICE_LOST) => SubmitResult::DeviceLost,
            Err(code) => {
                warn!("Presentation failed: {code:?}.");
                SubmitResult::Error
            }
        }
    }

    fn recreate(&self, swapchain: vk::SwapchainKHR) -> vk::SwapchainKHR {
        std::mem::replace(&mut *self.swapchain.lock(), swapchain)
    }
}
