use vulkanalia::prelude::v1_0::*;

use anyhow::{anyhow, Result};
use thiserror::Error;

// The macro will create an error type with a Display impl that
// prints the given string.
#[derive(Error, Debug)]
#[error("Missing {0}.")]
pub struct SuitabilityError(pub &'static str);

/// Queue families the core records and submits on: one general
/// family for graphics and compute, and, when the hardware has
/// one, a dedicated transfer family whose DMA engine can move
/// data while the general queue keeps rendering.
#[derive(Clone, Copy, Debug)]
pub struct QueueFamilyIndices {
    pub general: u32,
    pub transfer: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn get(instance: &Instance, physical_device: vk::PhysicalDevice) -> Result<Self> {
        // Almost every operation in Vulkan requires commands to
        // be submitted to a queue, and each queue family allows
        // only a subset of commands. We need one family that
        // supports both graphics and compute work.
        let families = unsafe {
            instance.get_physical_device_queue_family_properties(physical_device)
        };

        let general = families
            .iter()
            .position(|properties| {
                properties
                    .queue_flags
                    .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .map(|index| index as u32)
            .ok_or(anyhow!(SuitabilityError("Missing general queue family.")))?;

        // A dedicated transfer family is one that advertises
        // TRANSFER but neither GRAPHICS nor COMPUTE; those map
        // to the copy/DMA engines on discrete hardware. Not
        // finding one is fine, transfer work then rides on the
        // general queue.
        let transfer = families
            .iter()
            .position(|properties| {
                properties.queue_flags.contains(vk::QueueFlags::TRANSFER)
                    && !properties
                        .queue_flags
                        .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .map(|index| index as u32);

        Ok(Self { general, transfer })
    }
}

/// Queue handles retrieved from the logical device, shared by
/// every command list and the submission queue.
#[derive(Clone, Copy, Debug)]
pub struct DeviceQueues {
    pub general: vk::Queue,
    pub general_family: u32,
    pub transfer: Option<vk::Queue>,
    pub transfer_family: Option<u32>,
}

impl DeviceQueues {
    pub fn get(device: &Device, indices: QueueFamilyIndices) -> Self {
        let general = unsafe { device.get_device_queue(indices.general, 0) };
        let transfer = indices
            .transfer
            .map(|family| unsafe { device.get_device_queue(family, 0) });

        Self {
            general,
            general_family: indices.general,
            transfer,
            transfer_family: indices.transfer,
        }
    }

    pub fn has_transfer_queue(&self) -> bool {
        self.transfer.is_some()
    }
}
