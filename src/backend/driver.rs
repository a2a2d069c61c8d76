// Driver boundary
//
// Everything the runtime asks of the native API goes through `Driver`.
// `VulkanDriver` implements it over a real logical device, `SimDriver` over
// host memory. Handles are plain `ash::vk` handles in both cases.
//
// Creation calls return raw status codes; release calls are infallible and
// safe to call from `Drop`.

use ash::vk;
use std::ffi::c_void;

/// Queue families a device was opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub compute: u32,
    pub transfer: u32,
}

impl QueueFamilies {
    pub fn has_dedicated_transfer(&self) -> bool {
        self.compute != self.transfer
    }
}

/// Specialization constants packed for pipeline creation
#[derive(Debug, Clone, Default)]
pub struct SpecializationData {
    pub entries: Vec<vk::SpecializationMapEntry>,
    pub data: Vec<u8>,
}

impl SpecializationData {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append one constant with the next free constant id
    pub fn push(&mut self, bytes: &[u8]) {
        let entry = vk::SpecializationMapEntry {
            constant_id: self.entries.len() as u32,
            offset: self.data.len() as u32,
            size: bytes.len(),
        };
        self.entries.push(entry);
        self.data.extend_from_slice(bytes);
    }
}

/// One buffer written into a descriptor slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub buffer: vk::Buffer,
    pub range: vk::DeviceSize,
}

pub type VkResult<T> = Result<T, vk::Result>;

pub trait Driver: Send + Sync {
    fn device_name(&self) -> String;
    fn queue_families(&self) -> QueueFamilies;
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;
    fn queue(&self, family: u32) -> vk::Queue;

    // Memory and buffers
    fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags)
        -> VkResult<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn allocate_memory(&self, size: vk::DeviceSize, memory_type: u32)
        -> VkResult<vk::DeviceMemory>;
    fn free_memory(&self, memory: vk::DeviceMemory);
    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()>;
    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut c_void>;
    fn unmap_memory(&self, memory: vk::DeviceMemory);
    fn flush_memory(&self, memory: vk::DeviceMemory) -> VkResult<()>;
    fn invalidate_memory(&self, memory: vk::DeviceMemory) -> VkResult<()>;

    // Program objects
    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorType],
    ) -> VkResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(
        &self,
        sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> VkResult<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet>;
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);
    fn create_pipeline_layout(
        &self,
        set_layout: vk::DescriptorSetLayout,
        push_constant_size: u32,
    ) -> VkResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_pipeline_cache(&self) -> VkResult<vk::PipelineCache>;
    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache);
    fn create_compute_pipeline(
        &self,
        cache: vk::PipelineCache,
        layout: vk::PipelineLayout,
        module: vk::ShaderModule,
        entry_point: &std::ffi::CStr,
        specialization: &SpecializationData,
    ) -> VkResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    // Commands
    fn create_command_pool(&self, family: u32) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer);
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline);
    fn cmd_bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    );
    fn cmd_push_constants(&self, cmd: vk::CommandBuffer, layout: vk::PipelineLayout, data: &[u8]);
    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, groups: [u32; 3]);
    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    );
    fn cmd_wait_event(&self, cmd: vk::CommandBuffer, event: vk::Event);

    // Synchronization
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// `Err(vk::Result::TIMEOUT)` when the fence is still unsignaled
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;
    fn create_event(&self) -> VkResult<vk::Event>;
    fn destroy_event(&self, event: vk::Event);
    fn set_event(&self, event: vk::Event) -> VkResult<()>;
    fn queue_submit(
        &self,
        queue: vk::Queue,
        cmd: vk::CommandBuffer,
        fence: vk::Fence,
    ) -> VkResult<()>;
    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specialization_entries_are_contiguous() {
        let mut spec = SpecializationData::default();
        spec.push(&64u32.to_ne_bytes());
        spec.push(&1.5f64.to_ne_bytes());
        spec.push(&[1u8]);

        let offsets: Vec<_> = spec
            .entries
            .iter()
            .map(|e| (e.constant_id, e.offset, e.size))
            .collect();
        assert_eq!(offsets, vec![(0, 0, 4), (1, 4, 8), (2, 12, 1)]);
        assert_eq!(spec.data.len(), 13);
    }
}
