// Driver implementation over a real logical device (ash)

use ash::vk;
use std::ffi::{c_void, CStr};
use std::sync::Arc;

use super::driver::{DescriptorWrite, Driver, QueueFamilies, SpecializationData, VkResult};
use super::error::{Result, VkResultExt};
use super::instance::{Instance, PhysicalDevice};

pub struct VulkanDriver {
    device: ash::Device,
    name: String,
    families: QueueFamilies,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    // Keeps the instance alive until the device is destroyed
    _instance: Arc<Instance>,
}

impl VulkanDriver {
    pub fn new(
        instance: Arc<Instance>,
        physical: &PhysicalDevice,
        families: QueueFamilies,
    ) -> Result<Self> {
        let queue_priorities = [1.0];
        let mut queue_infos = vec![vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(families.compute)
            .queue_priorities(&queue_priorities)
            .build()];
        if families.has_dedicated_transfer() {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(families.transfer)
                    .queue_priorities(&queue_priorities)
                    .build(),
            );
        }

        let create_info = vk::DeviceCreateInfo::builder().queue_create_infos(&queue_infos);

        // SAFETY: physical.handle was enumerated from this instance
        let device = unsafe {
            instance
                .instance
                .create_device(physical.handle, &create_info, None)
        }
        .context_vk("vkCreateDevice")?;

        Ok(Self {
            device,
            name: physical.name.clone(),
            families,
            memory_properties: physical.memory_properties,
            _instance: instance,
        })
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        // SAFETY: the runtime destroyed every child object before the last
        // Arc to this driver went away.
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

// SAFETY for every block below: handles passed in were created from
// `self.device` by the runtime, which also serializes access to pools and
// queues as Vulkan requires.
impl Driver for VulkanDriver {
    fn device_name(&self) -> String {
        self.name.clone()
    }

    fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.memory_properties
    }

    fn queue(&self, family: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(family, 0) }
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VkResult<vk::Buffer> {
        // Copies run on the transfer family, dispatches on the compute family
        let families = [self.families.compute, self.families.transfer];
        let info = vk::BufferCreateInfo::builder().size(size).usage(usage);
        let info = if self.families.has_dedicated_transfer() {
            info.sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            info.sharing_mode(vk::SharingMode::EXCLUSIVE)
        };
        unsafe { self.device.create_buffer(&info, None) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type: u32,
    ) -> VkResult<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type);
        unsafe { self.device.allocate_memory(&info, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, 0) }
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut c_void> {
        unsafe {
            self.device
                .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
        }
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) }
    }

    fn flush_memory(&self, memory: vk::DeviceMemory) -> VkResult<()> {
        let range = vk::MappedMemoryRange::builder()
            .memory(memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        unsafe { self.device.flush_mapped_memory_ranges(&[range]) }
    }

    fn invalidate_memory(&self, memory: vk::DeviceMemory) -> VkResult<()> {
        let range = vk::MappedMemoryRange::builder()
            .memory(memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        unsafe { self.device.invalidate_mapped_memory_ranges(&[range]) }
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::builder().code(code);
        unsafe { self.device.create_shader_module(&info, None) }
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) }
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorType],
    ) -> VkResult<vk::DescriptorSetLayout> {
        let bindings: Vec<_> = bindings
            .iter()
            .enumerate()
            .map(|(i, &ty)| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(i as u32)
                    .descriptor_type(ty)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .build()
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        unsafe { self.device.create_descriptor_set_layout(&info, None) }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) }
    }

    fn create_descriptor_pool(
        &self,
        sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> VkResult<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(sizes);
        unsafe { self.device.create_descriptor_pool(&info, None) }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info) }?;
        sets.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let infos: Vec<_> = writes
            .iter()
            .map(|w| vk::DescriptorBufferInfo {
                buffer: w.buffer,
                offset: 0,
                range: w.range,
            })
            .collect();
        let descriptor_writes: Vec<_> = writes
            .iter()
            .zip(&infos)
            .map(|(w, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(w.binding)
                    .descriptor_type(w.descriptor_type)
                    .buffer_info(std::slice::from_ref(info))
                    .build()
            })
            .collect();
        unsafe { self.device.update_descriptor_sets(&descriptor_writes, &[]) }
    }

    fn create_pipeline_layout(
        &self,
        set_layout: vk::DescriptorSetLayout,
        push_constant_size: u32,
    ) -> VkResult<vk::PipelineLayout> {
        let set_layouts = [set_layout];
        let push_ranges: Vec<_> = (push_constant_size > 0)
            .then(|| vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::COMPUTE,
                offset: 0,
                size: push_constant_size,
            })
            .into_iter()
            .collect();
        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        unsafe { self.device.create_pipeline_layout(&info, None) }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) }
    }

    fn create_pipeline_cache(&self) -> VkResult<vk::PipelineCache> {
        let info = vk::PipelineCacheCreateInfo::builder();
        unsafe { self.device.create_pipeline_cache(&info, None) }
    }

    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache) {
        unsafe { self.device.destroy_pipeline_cache(cache, None) }
    }

    fn create_compute_pipeline(
        &self,
        cache: vk::PipelineCache,
        layout: vk::PipelineLayout,
        module: vk::ShaderModule,
        entry_point: &CStr,
        specialization: &SpecializationData,
    ) -> VkResult<vk::Pipeline> {
        let spec_info = vk::SpecializationInfo::builder()
            .map_entries(&specialization.entries)
            .data(&specialization.data);
        let mut stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(entry_point);
        if !specialization.is_empty() {
            stage = stage.specialization_info(&spec_info);
        }

        let info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage.build())
            .layout(layout)
            .build();
        let pipelines = unsafe { self.device.create_compute_pipelines(cache, &[info], None) }
            .map_err(|(_, e)| e)?;
        pipelines.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) }
    }

    fn create_command_pool(&self, family: u32) -> VkResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        unsafe { self.device.create_command_pool(&info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }?;
        buffers.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[buffer]) }
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let info = vk::CommandBufferBeginInfo::builder();
        unsafe { self.device.begin_command_buffer(cmd, &info) }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(cmd) }
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline)
        }
    }

    fn cmd_bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                layout,
                0,
                &[set],
                &[],
            )
        }
    }

    fn cmd_push_constants(&self, cmd: vk::CommandBuffer, layout: vk::PipelineLayout, data: &[u8]) {
        unsafe {
            self.device
                .cmd_push_constants(cmd, layout, vk::ShaderStageFlags::COMPUTE, 0, data)
        }
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, groups: [u32; 3]) {
        let [x, y, z] = groups;
        unsafe { self.device.cmd_dispatch(cmd, x, y, z) }
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, &[region]) }
    }

    fn cmd_wait_event(&self, cmd: vk::CommandBuffer, event: vk::Event) {
        // Host writes made before vkSetEvent become visible to the shader
        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::HOST_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE)
            .build();
        unsafe {
            self.device.cmd_wait_events(
                cmd,
                &[event],
                vk::PipelineStageFlags::HOST,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                &[barrier],
                &[],
                &[],
            )
        }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }
    }

    fn create_event(&self) -> VkResult<vk::Event> {
        let info = vk::EventCreateInfo::builder();
        unsafe { self.device.create_event(&info, None) }
    }

    fn destroy_event(&self, event: vk::Event) {
        unsafe { self.device.destroy_event(event, None) }
    }

    fn set_event(&self, event: vk::Event) -> VkResult<()> {
        unsafe { self.device.set_event(event) }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        cmd: vk::CommandBuffer,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .build();
        unsafe { self.device.queue_submit(queue, &[submit_info], fence) }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        unsafe { self.device.queue_wait_idle(queue) }
    }
}
