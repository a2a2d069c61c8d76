// Device handle
//
// Responsibilities:
// - Own the compute command pool and, when the transfer family differs,
//   a transfer command pool
// - Submission and idle-wait on the compute and transfer queues
// - Memory-type lookup for the allocator
// - Route diagnostics to the report sink
//
// Buffers and programs keep an `Arc<Device>`, so the device outlives them.

use ash::vk;
use parking_lot::Mutex;
use std::ffi::c_void;
use std::sync::Arc;

use super::driver::{Driver, QueueFamilies};
use super::error::{Result, VkResultExt};
use super::report::{Report, ReportSink};

/// Which of the device's queues a command goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Compute,
    Transfer,
}

pub struct Device {
    driver: Arc<dyn Driver>,
    sink: Arc<dyn ReportSink>,
    name: String,
    families: QueueFamilies,
    memory_properties: vk::PhysicalDeviceMemoryProperties,

    compute_queue: vk::Queue,
    transfer_queue: vk::Queue,

    // Pools need external synchronization
    compute_pool: Mutex<vk::CommandPool>,
    transfer_pool: Option<Mutex<vk::CommandPool>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("families", &self.families)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Open the device behind `driver`: fetch its queues and create command pools
    pub fn new(driver: Arc<dyn Driver>, sink: Arc<dyn ReportSink>) -> Result<Arc<Self>> {
        let name = driver.device_name();
        let families = driver.queue_families();
        let memory_properties = driver.memory_properties();

        log::info!(
            "Opening device {} (compute family {}, transfer family {})",
            name,
            families.compute,
            families.transfer
        );

        let compute_pool = create_command_pool(driver.as_ref(), families.compute)?;
        let transfer_pool = if families.has_dedicated_transfer() {
            match create_command_pool(driver.as_ref(), families.transfer) {
                Ok(pool) => Some(Mutex::new(pool)),
                Err(e) => {
                    driver.destroy_command_pool(compute_pool);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let compute_queue = driver.queue(families.compute);
        let transfer_queue = driver.queue(families.transfer);

        Ok(Arc::new(Self {
            driver,
            sink,
            name,
            families,
            memory_properties,
            compute_queue,
            transfer_queue,
            compute_pool: Mutex::new(compute_pool),
            transfer_pool,
        }))
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn sink(&self) -> &Arc<dyn ReportSink> {
        &self.sink
    }

    pub fn report(&self, report: &Report<'_>) -> bool {
        self.sink.report(report)
    }

    /// First memory type allowed by `requirements` whose flags contain `flags`
    pub fn memory_type_matching(
        &self,
        requirements: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        let props = &self.memory_properties;
        (0..props.memory_type_count).find(|&i| {
            let allowed = requirements.memory_type_bits & (1 << i) != 0;
            allowed && props.memory_types[i as usize].property_flags.contains(flags)
        })
    }

    pub fn memory_type_flags(&self, memory_type: u32) -> vk::MemoryPropertyFlags {
        self.memory_properties
            .memory_types
            .get(memory_type as usize)
            .map(|t| t.property_flags)
            .unwrap_or_default()
    }

    pub fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> Result<()> {
        self.driver
            .bind_buffer_memory(buffer, memory)
            .context_vk("vkBindBufferMemory")
    }

    pub fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<*mut c_void> {
        self.driver
            .map_memory(memory, offset, size)
            .context_vk("vkMapMemory")
    }

    pub fn unmap_memory(&self, memory: vk::DeviceMemory) {
        self.driver.unmap_memory(memory);
    }

    fn pool(&self, kind: QueueKind) -> &Mutex<vk::CommandPool> {
        match (kind, &self.transfer_pool) {
            (QueueKind::Transfer, Some(pool)) => pool,
            _ => &self.compute_pool,
        }
    }

    pub fn queue(&self, kind: QueueKind) -> vk::Queue {
        match kind {
            QueueKind::Compute => self.compute_queue,
            QueueKind::Transfer => self.transfer_queue,
        }
    }

    /// Allocate a primary command buffer and begin recording it
    pub fn begin_commands(&self, kind: QueueKind) -> Result<vk::CommandBuffer> {
        let pool = self.pool(kind).lock();
        let cmd = self
            .driver
            .allocate_command_buffer(*pool)
            .context_vk("vkAllocateCommandBuffers")?;
        if let Err(result) = self.driver.begin_command_buffer(cmd) {
            self.driver.free_command_buffer(*pool, cmd);
            return Err(result).context_vk("vkBeginCommandBuffer");
        }
        Ok(cmd)
    }

    /// Finish recording; the buffer is freed if that fails
    pub fn end_commands(&self, kind: QueueKind, cmd: vk::CommandBuffer) -> Result<()> {
        if let Err(result) = self.driver.end_command_buffer(cmd) {
            self.free_commands(kind, cmd);
            return Err(result).context_vk("vkEndCommandBuffer");
        }
        Ok(())
    }

    pub fn free_commands(&self, kind: QueueKind, cmd: vk::CommandBuffer) {
        let pool = self.pool(kind).lock();
        self.driver.free_command_buffer(*pool, cmd);
    }

    // A pool and its queue share one lock, which is also the queue's external sync
    pub fn submit(&self, kind: QueueKind, cmd: vk::CommandBuffer, fence: vk::Fence) -> Result<()> {
        let _queue = self.pool(kind).lock();
        self.driver
            .queue_submit(self.queue(kind), cmd, fence)
            .context_vk("vkQueueSubmit")
    }

    pub fn wait_idle(&self, kind: QueueKind) -> Result<()> {
        let _queue = self.pool(kind).lock();
        self.driver
            .queue_wait_idle(self.queue(kind))
            .context_vk("vkQueueWaitIdle")
    }

    /// Submit `cmd` and block until the queue drains, then free `cmd`
    pub fn submit_and_wait(&self, kind: QueueKind, cmd: vk::CommandBuffer) -> Result<()> {
        let result = self
            .submit(kind, cmd, vk::Fence::null())
            .and_then(|()| self.wait_idle(kind));
        self.free_commands(kind, cmd);
        result
    }
}

fn create_command_pool(driver: &dyn Driver, family: u32) -> Result<vk::CommandPool> {
    driver
        .create_command_pool(family)
        .context_vk("vkCreateCommandPool")
}

impl Drop for Device {
    fn drop(&mut self) {
        log::info!("Destroying device {}...", self.name);

        // Pending work must finish before its pool goes away
        let _ = self.driver.queue_wait_idle(self.compute_queue);
        if let Some(pool) = self.transfer_pool.take() {
            let _ = self.driver.queue_wait_idle(self.transfer_queue);
            self.driver.destroy_command_pool(pool.into_inner());
        }
        self.driver.destroy_command_pool(*self.compute_pool.get_mut());
    }
}
