//! Headless smoke test for the allocator and submission queue:
//! allocates two host-visible buffers, copies a pattern between
//! them on the GPU and verifies the readback.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::*;
use vulkanalia::loader::{LibloadingLoader, LIBRARY};
use vulkanalia::prelude::v1_0::*;
use vulkanalia::Version;

use prospero::command::{CmdBufferClass, CommandListPool};
use prospero::{
    BufferCreateParams, CoreConfig, DeviceMemoryAllocator, DeviceQueues, GpuBuffer,
    MemoryCategory, QueueFamilyIndices, SubmissionQueue, SubmitResult,
};

/// The macOS-specific Vulkan portability extensions became
/// required as of this version.
const PORTABILITY_MACOS_VERSION: Version = Version::new(1, 3, 216);

const SLICE_LENGTH: u64 = 64 * 1024;

fn main() -> Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();

    let loader = unsafe { LibloadingLoader::new(LIBRARY)? };
    let entry = unsafe { Entry::new(loader) }.map_err(|e| anyhow!("{}", e))?;
    let instance = create_instance(&entry)?;

    // Pick the first device exposing a general queue family; no
    // surface is involved, so presentation support is not a
    // criterion.
    let (physical_device, indices) = pick_physical_device(&instance)?;
    let device = Arc::new(create_logical_device(&entry, &instance, physical_device, indices)?);
    let queues = DeviceQueues::get(&device, indices);

    let config = CoreConfig::from_env();
    let allocator = Arc::new(DeviceMemoryAllocator::new(
        &instance,
        physical_device,
        device.clone(),
        &config,
        false,
    ));

    let src = GpuBuffer::new(
        allocator.clone(),
        BufferCreateParams {
            slice_length: SLICE_LENGTH,
            slice_count: 4,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            memory_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            category: MemoryCategory::AppBuffer,
        },
    )?;

    let dst = GpuBuffer::new(
        allocator.clone(),
        BufferCreateParams {
            slice_length: SLICE_LENGTH,
            slice_count: 1,
            usage: vk::BufferUsageFlags::TRANSFER_DST,
            memory_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            category: MemoryCategory::AppBuffer,
        },
    )?;

    let pool = CommandListPool::new(device.clone(), queues);
    let queue = SubmissionQueue::new(device.clone(), queues, pool.clone(), &config)?;

    // Fill a checked-out staging slice with a pattern; the
    // memory is host-coherent, so no flush is needed.
    let staging = src.alloc_slice()?;
    let pattern = (0..SLICE_LENGTH).map(|i| (i % 251) as u8).collect::<Vec<_>>();
    unsafe {
        std::ptr::copy_nonoverlapping(pattern.as_ptr(), staging.mapped_ptr, pattern.len());
    }

    let target = dst.current();

    let mut list = pool.acquire()?;
    list.begin_recording()?;
    list.copy_buffer(
        CmdBufferClass::General,
        staging.buffer,
        target.buffer,
        &[vk::BufferCopy {
            src_offset: staging.offset,
            dst_offset: target.offset,
            size: SLICE_LENGTH,
        }],
    );

    // The staging slice goes back to its buffer's free-list
    // once the fence proves the copy is done.
    list.track_slice(src.clone(), staging);
    list.end_recording()?;

    let status = queue.submit(list);
    let result = status.wait();
    if result != SubmitResult::Success {
        return Err(anyhow!("submission failed: {result:?}"));
    }

    let mut readback = vec![0u8; SLICE_LENGTH as usize];
    unsafe {
        std::ptr::copy_nonoverlapping(target.mapped_ptr, readback.as_mut_ptr(), readback.len());
    }

    if readback != pattern {
        return Err(anyhow!("readback does not match the written pattern"));
    }
    info!("Copied and verified {} bytes.", SLICE_LENGTH);

    for stats in allocator.stats() {
        let allocated: u64 = stats.categories.iter().map(|c| c.allocated).sum();
        let used: u64 = stats.categories.iter().map(|c| c.used).sum();
        info!("Heap {}: {} KiB allocated, {} KiB used.", stats.index, allocated >> 10, used >> 10);
    }

    // Teardown in dependency order: queue threads first, then
    // buffers (which return their memory), then the allocator's
    // chunks, then the device itself.
    queue.wait_for_idle();
    drop(queue);
    drop(pool);
    drop(src);
    drop(dst);
    allocator.free_unused_chunks();
    allocator.destroy();

    unsafe {
        device.destroy_device(None);
        instance.destroy_instance(None);
    }

    info!("Done.");
    Ok(())
}

fn create_instance(entry: &Entry) -> Result<Instance> {
    let application_info = vk::ApplicationInfo::builder()
        .application_name(b"buffer_alloc\0")
        .application_version(vk::make_version(1, 0, 0))
        .engine_name(b"prospero\0")
        .engine_version(vk::make_version(1, 0, 0))
        .api_version(vk::make_version(1, 3, 0));

    // Some implementations are not fully conformant, so certain
    // Vulkan extensions need to be enabled to ensure
    // portability.
    let mut extensions: Vec<*const i8> = Vec::new();
    let flags = if cfg!(target_os = "macos") && entry.version()? >= PORTABILITY_MACOS_VERSION {
        extensions.push(vk::KHR_PORTABILITY_ENUMERATION_EXTENSION.name.as_ptr());
        vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
    } else {
        vk::InstanceCreateFlags::empty()
    };

    let info = vk::InstanceCreateInfo::builder()
        .application_info(&application_info)
        .enabled_extension_names(&extensions)
        .flags(flags);

    let instance = unsafe { entry.create_instance(&info, None)? };
    Ok(instance)
}

fn pick_physical_device(instance: &Instance) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
    for device in unsafe { instance.enumerate_physical_devices()? } {
        let properties = unsafe { instance.get_physical_device_properties(device) };

        match QueueFamilyIndices::get(instance, device) {
            Ok(indices) => {
                info!("Selected physical device: {}.", properties.device_name);
                return Ok((device, indices));
            }
            Err(error) => {
                warn!("Skipping physical device ({}): {}", properties.device_name, error);
            }
        }
    }

    Err(anyhow!("No suitable physical device found."))
}

fn create_logical_device(
    entry: &Entry,
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    indices: QueueFamilyIndices,
) -> Result<Device> {
    // One queue per used family: the general one, and the
    // dedicated transfer family when the hardware has one.
    let priorities = &[1.0];
    let mut queue_infos = vec![vk::DeviceQueueCreateInfo::builder()
        .queue_family_index(indices.general)
        .queue_priorities(priorities)
        .build()];

    if let Some(transfer) = indices.transfer {
        queue_infos.push(
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(transfer)
                .queue_priorities(priorities)
                .build(),
        );
    }

    let mut extensions: Vec<*const i8> = Vec::new();
    if cfg!(target_os = "macos") && entry.version()? >= PORTABILITY_MACOS_VERSION {
        extensions.push(vk::KHR_PORTABILITY_SUBSET_EXTENSION.name.as_ptr());
    }

    let features = vk::PhysicalDeviceFeatures::builder();

    // The submission path records with synchronization2, which
    // is core in Vulkan 1.3 but still has to be enabled.
    let mut features13 = vk::PhysicalDeviceVulkan13Features::builder().synchronization2(true);

    let info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extensions)
        .enabled_features(&features)
        .push_next(&mut features13);

    let device = unsafe { instance.create_device(physical_device, &info, None)? };
    info!("Logical device created.");
    Ok(device)
}
