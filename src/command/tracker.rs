use std::any::Any;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use vulkanalia::prelude::v1_0::*;

use crate::buffer::{BufferSlice, GpuBuffer};

/// How a command list touched a tracked resource. Reads and
/// writes both pin the resource until the fence resolves; the
/// tag exists so hazard-aware callers can distinguish them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Keeps every resource referenced by recorded commands alive
/// until the command list's fence resolves. Dropping the held
/// `Arc`s is what finally allows buffers, images and views to
/// be destroyed.
#[derive(Default)]
pub struct LifetimeTracker {
    resources: Vec<(Arc<dyn Any + Send + Sync>, Access)>,
}

impl LifetimeTracker {
    pub fn track(&mut self, resource: Arc<dyn Any + Send + Sync>, access: Access) {
        self.resources.push((resource, access));
    }

    pub fn clear(&mut self) {
        self.resources.clear();
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Buffer slices referenced by recorded commands. On reset each
/// slice goes back to its owning buffer's secondary free-list,
/// which is the only route a slice may take back into
/// circulation: returning it earlier would let a writer clobber
/// data the GPU is still reading.
#[derive(Default)]
pub struct SliceTracker {
    slices: Vec<(Arc<GpuBuffer>, BufferSlice)>,
}

impl SliceTracker {
    pub fn track(&mut self, buffer: Arc<GpuBuffer>, slice: BufferSlice) {
        self.slices.push((buffer, slice));
    }

    pub fn reset(&mut self) {
        for (buffer, slice) in self.slices.drain(..) {
            buffer.free_slice(slice);
        }
    }
}

/// Descriptor pools borrowed for this command list's descriptor
/// sets, returned to the bank on reset.
#[derive(Default)]
pub struct DescriptorPoolTracker {
    pools: Vec<vk::DescriptorPool>,
}

impl DescriptorPoolTracker {
    pub fn track(&mut self, pool: vk::DescriptorPool) {
        self.pools.push(pool);
    }

    pub fn reset(&mut self, bank: &DescriptorPoolBank) {
        for pool in self.pools.drain(..) {
            bank.recycle(pool);
        }
    }
}

/// Query pools in flight on this command list.
#[derive(Default)]
pub struct QueryTracker {
    pools: Vec<vk::QueryPool>,
}

impl QueryTracker {
    pub fn track(&mut self, pool: vk::QueryPool) {
        self.pools.push(pool);
    }

    pub fn reset(&mut self, bank: &QueryBank) {
        for pool in self.pools.drain(..) {
            bank.recycle(pool);
        }
    }
}

/// Events in flight on this command list.
#[derive(Default)]
pub struct EventTracker {
    events: Vec<vk::Event>,
}

impl EventTracker {
    pub fn track(&mut self, event: vk::Event) {
        self.events.push(event);
    }

    pub fn reset(&mut self, bank: &EventBank) {
        for event in self.events.drain(..) {
            bank.recycle(event);
        }
    }
}

/// User-level completion callbacks, run by the finish thread
/// once the fence has resolved and before the command list is
/// reset for reuse.
#[derive(Default)]
pub struct SignalTracker {
    signals: Vec<Box<dyn FnOnce() + Send>>,
}

impl SignalTracker {
    pub fn track(&mut self, signal: Box<dyn FnOnce() + Send>) {
        self.signals.push(signal);
    }

    pub fn notify(&mut self) {
        for signal in self.signals.drain(..) {
            signal();
        }
    }
}

/// Maximum descriptor sets per borrowed pool.
const DESCRIPTOR_POOL_SETS: u32 = 1024;

/// Queries per borrowed query pool.
const QUERY_POOL_SIZE: u32 = 128;

/// Shared pool of descriptor pools. Command lists borrow whole
/// pools, allocate sets from them freely while recording, and
/// hand them back after the fence; the bank resets a returned
/// pool in one call instead of freeing sets one by one.
pub struct DescriptorPoolBank {
    device: Arc<Device>,
    free: Mutex<Vec<vk::DescriptorPool>>,
}

impl DescriptorPoolBank {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn acquire(&self) -> Result<vk::DescriptorPool> {
        if let Some(pool) = self.free.lock().pop() {
            return Ok(pool);
        }

        // Sizes cover the descriptor mix a translated draw
        // stream produces: mostly combined image samplers and
        // uniform buffers, some storage for compute passes.
        let sizes = [
            vk::DescriptorPoolSize::builder()
                .type_(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(2048)
                .build(),
            vk::DescriptorPoolSize::builder()
                .type_(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(2048)
                .build(),
            vk::DescriptorPoolSize::builder()
                .type_(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(512)
                .build(),
            vk::DescriptorPoolSize::builder()
                .type_(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(512)
                .build(),
        ];

        let info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(DESCRIPTOR_POOL_SETS)
            .pool_sizes(&sizes);

        let pool = unsafe { self.device.create_descriptor_pool(&info, None)? };
        Ok(pool)
    }

    pub fn recycle(&self, pool: vk::DescriptorPool) {
        let reset = unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        };

        // A pool that cannot be reset is dropped rather than
        // recirculated with stale sets.
        if reset.is_ok() {
            self.free.lock().push(pool);
        } else {
            unsafe { self.device.destroy_descriptor_pool(pool, None) };
        }
    }
}

impl Drop for DescriptorPoolBank {
    fn drop(&mut self) {
        for pool in self.free.lock().drain(..) {
            unsafe { self.device.destroy_descriptor_pool(pool, None) };
        }
    }
}

/// Shared pool of occlusion query pools. Returned pools are not
/// reset host-side; the borrower resets the ranges it uses on
/// the GPU timeline before writing new queries.
pub struct QueryBank {
    device: Arc<Device>,
    free: Mutex<Vec<vk::QueryPool>>,
}

impl QueryBank {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn acquire(&self) -> Result<vk::QueryPool> {
        if let Some(pool) = self.free.lock().pop() {
            return Ok(pool);
        }

        let info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::OCCLUSION)
            .query_count(QUERY_POOL_SIZE);

        let pool = unsafe { self.device.create_query_pool(&info, None)? };
        Ok(pool)
    }

    pub fn recycle(&self, pool: vk::QueryPool) {
        self.free.lock().push(pool);
    }

    pub fn query_count(&self) -> u32 {
        QUERY_POOL_SIZE
    }
}

impl Drop for QueryBank {
    fn drop(&mut self) {
        for pool in self.free.lock().drain(..) {
            unsafe { self.device.destroy_query_pool(pool, None) };
        }
    }
}

/// Shared pool of events, reset host-side on return.
pub struct EventBank {
    device: Arc<Device>,
    free: Mutex<Vec<vk::Event>>,
}

impl EventBank {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn acquire(&self) -> Result<vk::Event> {
        if let Some(event) = self.free.lock().pop() {
            return Ok(event);
        }

        let info = vk::EventCreateInfo::builder();
        let event = unsafe { self.device.create_event(&info, None)? };
        Ok(event)
    }

    pub fn recycle(&self, event: vk::Event) {
        if unsafe { self.device.reset_event(event) }.is_ok() {
            self.free.lock().push(event);
        } else {
            unsafe { self.device.destroy_event(event, None) };
        }
    }
}

impl Drop for EventBank {
    fn drop(&mut self) {
        for event in self.free.lock().drain(..) {
            unsafe { self.device.destroy_event(event, None) };
        }
    }
}

/// The recycling banks shared by every command list of a
/// device.
pub struct RecyclerBanks {
    pub descriptors: DescriptorPoolBank,
    pub queries: QueryBank,
    pub events: EventBank,
}

impl RecyclerBanks {
    pub fn new(device: &Arc<Device>) -> Self {
        Self {
            descriptors: DescriptorPoolBank::new(device.clone()),
            queries: QueryBank::new(device.clone()),
            events: EventBank::new(device.clone()),
        }
    }
}
