// Simulated driver
//
// Implements `Driver` entirely in host memory so the runtime can be exercised
// without a GPU. Shader modules are stand-ins for host closures registered
// with `SimDriver::register_kernel`; a dispatch calls the closure once with
// the whole grid, the bound buffers, push constants and specialization data.
//
// Queues execute in submission order. A submission blocked on an unset event
// holds back everything queued after it, like a real queue.

use ash::vk::{self, Handle};
use bytemuck::Pod;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::ffi::{c_void, CStr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::driver::{DescriptorWrite, Driver, QueueFamilies, SpecializationData, VkResult};

const SIM_MAGIC: u32 = 0x5349_4d4b;
const QUEUE_BASE: u64 = 0x5000;

pub type Kernel = Arc<dyn Fn(&mut Invocation<'_>) + Send + Sync>;

/// One dispatch as seen by a simulated kernel
pub struct Invocation<'a> {
    groups: [u32; 3],
    push_constants: &'a [u8],
    specialization: &'a SpecializationData,
    bindings: &'a mut [Vec<u8>],
}

impl Invocation<'_> {
    /// Workgroup counts of the dispatch
    pub fn groups(&self) -> [u32; 3] {
        self.groups
    }

    pub fn push_constants<P: Pod>(&self) -> Option<P> {
        let size = std::mem::size_of::<P>();
        self.push_constants
            .get(..size)
            .map(bytemuck::pod_read_unaligned)
    }

    pub fn spec_constant<T: Pod>(&self, id: u32) -> Option<T> {
        let entry = self
            .specialization
            .entries
            .iter()
            .find(|e| e.constant_id == id)?;
        if entry.size != std::mem::size_of::<T>() {
            return None;
        }
        let start = entry.offset as usize;
        self.specialization
            .data
            .get(start..start + entry.size)
            .map(bytemuck::pod_read_unaligned)
    }

    /// Contents of the buffer at `binding`
    pub fn read<T: Pod>(&self, binding: u32) -> Vec<T> {
        let size = std::mem::size_of::<T>();
        match self.bindings.get(binding as usize) {
            Some(bytes) if size > 0 => bytes
                .chunks_exact(size)
                .map(bytemuck::pod_read_unaligned)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Overwrite the start of the buffer at `binding`, clipped to its size
    pub fn write<T: Pod>(&mut self, binding: u32, data: &[T]) {
        if let Some(bytes) = self.bindings.get_mut(binding as usize) {
            let src: &[u8] = bytemuck::cast_slice(data);
            let n = src.len().min(bytes.len());
            bytes[..n].copy_from_slice(&src[..n]);
        }
    }
}

/// Shape of the simulated device
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub name: String,
    pub memory_types: Vec<vk::MemoryPropertyFlags>,
    /// Memory types whose allocations fail with `ERROR_OUT_OF_DEVICE_MEMORY`
    pub failing_memory_types: Vec<u32>,
    pub dedicated_transfer: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        use vk::MemoryPropertyFlags as F;
        Self {
            name: "Simulated discrete GPU".to_string(),
            memory_types: vec![
                F::DEVICE_LOCAL,
                F::HOST_VISIBLE | F::HOST_COHERENT,
                F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED,
            ],
            failing_memory_types: Vec::new(),
            dedicated_transfer: false,
        }
    }
}

impl SimConfig {
    /// Integrated GPU: all device memory is host-visible
    pub fn integrated() -> Self {
        use vk::MemoryPropertyFlags as F;
        Self {
            name: "Simulated integrated GPU".to_string(),
            memory_types: vec![
                F::DEVICE_LOCAL | F::HOST_VISIBLE | F::HOST_COHERENT,
                F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED,
            ],
            ..Self::default()
        }
    }

    pub fn with_memory_types(
        mut self,
        types: impl IntoIterator<Item = vk::MemoryPropertyFlags>,
    ) -> Self {
        self.memory_types = types.into_iter().collect();
        self
    }

    pub fn failing_memory_type(mut self, index: u32) -> Self {
        self.failing_memory_types.push(index);
        self
    }

    pub fn dedicated_transfer(mut self, enabled: bool) -> Self {
        self.dedicated_transfer = enabled;
        self
    }
}

/// Creation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub buffers_created: usize,
    pub allocations: usize,
    pub failed_allocations: usize,
    pub set_layouts_created: usize,
    pub pipeline_layouts_created: usize,
    pub pipelines_created: usize,
    pub command_buffers_allocated: usize,
    pub submissions: usize,
    pub dispatches: usize,
    pub copies: usize,
}

#[derive(Debug, Clone)]
enum Command {
    BindPipeline(u64),
    BindSet(u64),
    PushConstants(Vec<u8>),
    Dispatch([u32; 3]),
    Copy { src: u64, dst: u64, region: vk::BufferCopy },
    WaitEvent(u64),
}

struct SimBuffer {
    size: vk::DeviceSize,
    memory: Option<u64>,
}

struct SimMemory {
    // u128 words keep mapped pointers aligned for any element type
    words: Vec<u128>,
    size: usize,
}

impl SimMemory {
    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.size]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.size]
    }
}

struct SimPipeline {
    kernel: usize,
    specialization: SpecializationData,
}

struct SimCommandBuffer {
    pool: u64,
    commands: Vec<Command>,
}

struct Submission {
    commands: Vec<Command>,
    pc: usize,
    fence: u64,
    pipeline: u64,
    set: u64,
    push_constants: Vec<u8>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    kernels: Vec<Kernel>,
    buffers: HashMap<u64, SimBuffer>,
    memories: HashMap<u64, SimMemory>,
    modules: HashMap<u64, usize>,
    set_layouts: HashMap<u64, Vec<vk::DescriptorType>>,
    descriptor_pools: HashMap<u64, Vec<u64>>,
    descriptor_sets: HashMap<u64, HashMap<u32, DescriptorWrite>>,
    pipeline_layouts: HashMap<u64, u32>,
    pipeline_caches: HashMap<u64, ()>,
    pipelines: HashMap<u64, SimPipeline>,
    command_pools: HashMap<u64, u32>,
    command_buffers: HashMap<u64, SimCommandBuffer>,
    fences: HashMap<u64, bool>,
    events: HashMap<u64, bool>,
    queues: HashMap<u64, VecDeque<Submission>>,
    stats: SimStats,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn live_objects(&self) -> usize {
        self.buffers.len()
            + self.memories.len()
            + self.modules.len()
            + self.set_layouts.len()
            + self.descriptor_pools.len()
            + self.pipeline_layouts.len()
            + self.pipeline_caches.len()
            + self.pipelines.len()
            + self.command_pools.len()
            + self.command_buffers.len()
            + self.fences.len()
            + self.events.len()
    }

    fn record(&mut self, cmd: vk::CommandBuffer, command: Command) {
        match self.command_buffers.get_mut(&cmd.as_raw()) {
            Some(buffer) => buffer.commands.push(command),
            None => log::error!("[sim] recording into unknown command buffer {:?}", cmd),
        }
    }

    /// Run every queue as far as events allow. Returns whether anything finished.
    fn pump(&mut self) -> bool {
        let mut progressed = false;
        let queue_ids: Vec<u64> = self.queues.keys().copied().collect();
        for queue in queue_ids {
            while let Some(mut submission) =
                self.queues.get_mut(&queue).and_then(|q| q.pop_front())
            {
                if self.execute(&mut submission) {
                    if let Some(signaled) = self.fences.get_mut(&submission.fence) {
                        *signaled = true;
                    }
                    progressed = true;
                } else {
                    if let Some(q) = self.queues.get_mut(&queue) {
                        q.push_front(submission);
                    }
                    break;
                }
            }
        }
        progressed
    }

    /// Execute from the submission's program counter; false if blocked
    fn execute(&mut self, submission: &mut Submission) -> bool {
        while let Some(command) = submission.commands.get(submission.pc).cloned() {
            match command {
                Command::WaitEvent(event) => {
                    if !self.events.get(&event).copied().unwrap_or(false) {
                        return false;
                    }
                }
                Command::BindPipeline(pipeline) => submission.pipeline = pipeline,
                Command::BindSet(set) => submission.set = set,
                Command::PushConstants(data) => submission.push_constants = data,
                Command::Dispatch(groups) => self.dispatch(submission, groups),
                Command::Copy { src, dst, region } => self.copy(src, dst, region),
            }
            submission.pc += 1;
        }
        true
    }

    fn memory_of(&self, buffer: u64) -> Option<u64> {
        self.buffers.get(&buffer).and_then(|b| b.memory)
    }

    fn dispatch(&mut self, submission: &Submission, groups: [u32; 3]) {
        self.stats.dispatches += 1;
        let Some(pipeline) = self.pipelines.get(&submission.pipeline) else {
            log::error!("[sim] dispatch without a bound pipeline");
            return;
        };
        let kernel = self.kernels[pipeline.kernel].clone();
        let specialization = pipeline.specialization.clone();

        let mut writes: Vec<DescriptorWrite> = self
            .descriptor_sets
            .get(&submission.set)
            .map(|set| set.values().copied().collect())
            .unwrap_or_default();
        writes.sort_by_key(|w| w.binding);

        let mut bindings: Vec<Vec<u8>> = writes
            .iter()
            .map(|w| {
                self.memory_of(w.buffer.as_raw())
                    .and_then(|m| self.memories.get(&m))
                    .map(|m| {
                        let bytes = m.bytes();
                        bytes[..(w.range as usize).min(bytes.len())].to_vec()
                    })
                    .unwrap_or_default()
            })
            .collect();

        let mut invocation = Invocation {
            groups,
            push_constants: &submission.push_constants,
            specialization: &specialization,
            bindings: &mut bindings,
        };
        kernel(&mut invocation);

        for (write, data) in writes.iter().zip(bindings) {
            if let Some(memory) = self
                .memory_of(write.buffer.as_raw())
                .and_then(|m| self.memories.get_mut(&m))
            {
                memory.bytes_mut()[..data.len()].copy_from_slice(&data);
            }
        }
    }

    fn copy(&mut self, src: u64, dst: u64, region: vk::BufferCopy) {
        self.stats.copies += 1;
        let size = region.size as usize;
        let src_start = region.src_offset as usize;
        let dst_start = region.dst_offset as usize;

        let data = match self.memory_of(src).and_then(|m| self.memories.get(&m)) {
            Some(memory) => memory.bytes()[src_start..src_start + size].to_vec(),
            None => {
                log::error!("[sim] copy from unbound buffer");
                return;
            }
        };
        match self.memory_of(dst).and_then(|m| self.memories.get_mut(&m)) {
            Some(memory) => memory.bytes_mut()[dst_start..dst_start + size].copy_from_slice(&data),
            None => log::error!("[sim] copy into unbound buffer"),
        }
    }
}

pub struct SimDriver {
    config: SimConfig,
    state: Mutex<State>,
    progress: Condvar,
}

impl std::fmt::Debug for SimDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDriver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SimDriver {
    pub fn new(config: SimConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(State::default()),
            progress: Condvar::new(),
        })
    }

    /// Register a kernel; the returned words load it as a shader module
    pub fn register_kernel<F>(&self, kernel: F) -> Vec<u32>
    where
        F: Fn(&mut Invocation<'_>) + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        state.kernels.push(Arc::new(kernel));
        vec![SIM_MAGIC, (state.kernels.len() - 1) as u32]
    }

    pub fn stats(&self) -> SimStats {
        self.state.lock().stats
    }

    /// Objects created and not yet destroyed
    pub fn live_objects(&self) -> usize {
        self.state.lock().live_objects()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock()
    }

    fn wait_until(
        &self,
        timeout_ns: u64,
        mut done: impl FnMut(&State) -> Option<VkResult<()>>,
    ) -> VkResult<()> {
        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        let mut state = self.lock();
        loop {
            if let Some(result) = done(&*state) {
                return result;
            }
            match deadline {
                Some(deadline) => {
                    if self.progress.wait_until(&mut state, deadline).timed_out() {
                        return done(&*state).unwrap_or(Err(vk::Result::TIMEOUT));
                    }
                }
                None => self.progress.wait(&mut state),
            }
        }
    }
}

impl Driver for SimDriver {
    fn device_name(&self) -> String {
        self.config.name.clone()
    }

    fn queue_families(&self) -> QueueFamilies {
        QueueFamilies {
            compute: 0,
            transfer: if self.config.dedicated_transfer { 1 } else { 0 },
        }
    }

    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: self.config.memory_types.len().min(vk::MAX_MEMORY_TYPES) as u32,
            memory_heap_count: 1,
            ..Default::default()
        };
        props.memory_heaps[0] = vk::MemoryHeap {
            size: 1 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        for (slot, &flags) in props.memory_types.iter_mut().zip(&self.config.memory_types) {
            *slot = vk::MemoryType {
                property_flags: flags,
                heap_index: 0,
            };
        }
        props
    }

    fn queue(&self, family: u32) -> vk::Queue {
        let raw = QUEUE_BASE + family as u64;
        self.lock().queues.entry(raw).or_default();
        vk::Queue::from_raw(raw)
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
    ) -> VkResult<vk::Buffer> {
        let mut state = self.lock();
        let handle = state.handle();
        state.buffers.insert(handle, SimBuffer { size, memory: None });
        state.stats.buffers_created += 1;
        Ok(vk::Buffer::from_raw(handle))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.lock().buffers.remove(&buffer.as_raw());
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self
            .lock()
            .buffers
            .get(&buffer.as_raw())
            .map(|b| b.size)
            .unwrap_or(0);
        let type_count = self.config.memory_types.len().min(vk::MAX_MEMORY_TYPES) as u32;
        vk::MemoryRequirements {
            size: (size + 15) & !15,
            alignment: 16,
            memory_type_bits: if type_count >= 32 { u32::MAX } else { (1 << type_count) - 1 },
        }
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type: u32,
    ) -> VkResult<vk::DeviceMemory> {
        let mut state = self.lock();
        if self.config.failing_memory_types.contains(&memory_type) {
            state.stats.failed_allocations += 1;
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        if memory_type as usize >= self.config.memory_types.len() {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }

        let handle = state.handle();
        let size = size as usize;
        state.memories.insert(
            handle,
            SimMemory {
                words: vec![0; size.div_ceil(16)],
                size,
            },
        );
        state.stats.allocations += 1;
        Ok(vk::DeviceMemory::from_raw(handle))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        self.lock().memories.remove(&memory.as_raw());
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        let mut state = self.lock();
        if !state.memories.contains_key(&memory.as_raw()) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        match state.buffers.get_mut(&buffer.as_raw()) {
            Some(b) => {
                b.memory = Some(memory.as_raw());
                Ok(())
            }
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut c_void> {
        let mut state = self.lock();
        let Some(mem) = state.memories.get_mut(&memory.as_raw()) else {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        };
        if offset.saturating_add(size) > mem.words.len() as u64 * 16 {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let base = bytemuck::cast_slice_mut::<u128, u8>(&mut mem.words).as_mut_ptr();
        // SAFETY: offset + size lies within the allocation checked above
        Ok(unsafe { base.add(offset as usize) }.cast())
    }

    fn unmap_memory(&self, _memory: vk::DeviceMemory) {}

    fn flush_memory(&self, _memory: vk::DeviceMemory) -> VkResult<()> {
        Ok(())
    }

    fn invalidate_memory(&self, _memory: vk::DeviceMemory) -> VkResult<()> {
        Ok(())
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let mut state = self.lock();
        let kernel = match code {
            [SIM_MAGIC, id, ..] if (*id as usize) < state.kernels.len() => *id as usize,
            _ => return Err(vk::Result::ERROR_INITIALIZATION_FAILED),
        };
        let handle = state.handle();
        state.modules.insert(handle, kernel);
        Ok(vk::ShaderModule::from_raw(handle))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.lock().modules.remove(&module.as_raw());
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorType],
    ) -> VkResult<vk::DescriptorSetLayout> {
        let mut state = self.lock();
        let handle = state.handle();
        state.set_layouts.insert(handle, bindings.to_vec());
        state.stats.set_layouts_created += 1;
        Ok(vk::DescriptorSetLayout::from_raw(handle))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.lock().set_layouts.remove(&layout.as_raw());
    }

    fn create_descriptor_pool(
        &self,
        sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> VkResult<vk::DescriptorPool> {
        if sizes.is_empty() || max_sets == 0 {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let mut state = self.lock();
        let handle = state.handle();
        state.descriptor_pools.insert(handle, Vec::new());
        Ok(vk::DescriptorPool::from_raw(handle))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.lock();
        if let Some(sets) = state.descriptor_pools.remove(&pool.as_raw()) {
            for set in sets {
                state.descriptor_sets.remove(&set);
            }
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let mut state = self.lock();
        if !state.set_layouts.contains_key(&layout.as_raw()) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let handle = state.handle();
        match state.descriptor_pools.get_mut(&pool.as_raw()) {
            Some(sets) => sets.push(handle),
            None => return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY),
        }
        state.descriptor_sets.insert(handle, HashMap::new());
        Ok(vk::DescriptorSet::from_raw(handle))
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let mut state = self.lock();
        if let Some(bindings) = state.descriptor_sets.get_mut(&set.as_raw()) {
            for write in writes {
                bindings.insert(write.binding, *write);
            }
        }
    }

    fn create_pipeline_layout(
        &self,
        set_layout: vk::DescriptorSetLayout,
        push_constant_size: u32,
    ) -> VkResult<vk::PipelineLayout> {
        let mut state = self.lock();
        if !state.set_layouts.contains_key(&set_layout.as_raw()) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let handle = state.handle();
        state.pipeline_layouts.insert(handle, push_constant_size);
        state.stats.pipeline_layouts_created += 1;
        Ok(vk::PipelineLayout::from_raw(handle))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.lock().pipeline_layouts.remove(&layout.as_raw());
    }

    fn create_pipeline_cache(&self) -> VkResult<vk::PipelineCache> {
        let mut state = self.lock();
        let handle = state.handle();
        state.pipeline_caches.insert(handle, ());
        Ok(vk::PipelineCache::from_raw(handle))
    }

    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache) {
        self.lock().pipeline_caches.remove(&cache.as_raw());
    }

    fn create_compute_pipeline(
        &self,
        _cache: vk::PipelineCache,
        layout: vk::PipelineLayout,
        module: vk::ShaderModule,
        _entry_point: &CStr,
        specialization: &SpecializationData,
    ) -> VkResult<vk::Pipeline> {
        let mut state = self.lock();
        if !state.pipeline_layouts.contains_key(&layout.as_raw()) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let Some(&kernel) = state.modules.get(&module.as_raw()) else {
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        let handle = state.handle();
        state.pipelines.insert(
            handle,
            SimPipeline {
                kernel,
                specialization: specialization.clone(),
            },
        );
        state.stats.pipelines_created += 1;
        Ok(vk::Pipeline::from_raw(handle))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.lock().pipelines.remove(&pipeline.as_raw());
    }

    fn create_command_pool(&self, family: u32) -> VkResult<vk::CommandPool> {
        let mut state = self.lock();
        let handle = state.handle();
        state.command_pools.insert(handle, family);
        Ok(vk::CommandPool::from_raw(handle))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.lock();
        state.command_pools.remove(&pool.as_raw());
        state
            .command_buffers
            .retain(|_, buffer| buffer.pool != pool.as_raw());
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let mut state = self.lock();
        if !state.command_pools.contains_key(&pool.as_raw()) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let handle = state.handle();
        state.command_buffers.insert(
            handle,
            SimCommandBuffer {
                pool: pool.as_raw(),
                commands: Vec::new(),
            },
        );
        state.stats.command_buffers_allocated += 1;
        Ok(vk::CommandBuffer::from_raw(handle))
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        self.lock().command_buffers.remove(&buffer.as_raw());
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        match self.lock().command_buffers.get_mut(&cmd.as_raw()) {
            Some(buffer) => {
                buffer.commands.clear();
                Ok(())
            }
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        if self.lock().command_buffers.contains_key(&cmd.as_raw()) {
            Ok(())
        } else {
            Err(vk::Result::ERROR_UNKNOWN)
        }
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.lock().record(cmd, Command::BindPipeline(pipeline.as_raw()));
    }

    fn cmd_bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        self.lock().record(cmd, Command::BindSet(set.as_raw()));
    }

    fn cmd_push_constants(&self, cmd: vk::CommandBuffer, _layout: vk::PipelineLayout, data: &[u8]) {
        self.lock().record(cmd, Command::PushConstants(data.to_vec()));
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, groups: [u32; 3]) {
        self.lock().record(cmd, Command::Dispatch(groups));
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        self.lock().record(
            cmd,
            Command::Copy {
                src: src.as_raw(),
                dst: dst.as_raw(),
                region,
            },
        );
    }

    fn cmd_wait_event(&self, cmd: vk::CommandBuffer, event: vk::Event) {
        self.lock().record(cmd, Command::WaitEvent(event.as_raw()));
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.lock();
        let handle = state.handle();
        state.fences.insert(handle, signaled);
        Ok(vk::Fence::from_raw(handle))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.lock().fences.remove(&fence.as_raw());
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        let raw = fence.as_raw();
        self.wait_until(timeout_ns, |state| match state.fences.get(&raw) {
            Some(true) => Some(Ok(())),
            Some(false) => None,
            None => Some(Err(vk::Result::ERROR_UNKNOWN)),
        })
    }

    fn create_event(&self) -> VkResult<vk::Event> {
        let mut state = self.lock();
        let handle = state.handle();
        state.events.insert(handle, false);
        Ok(vk::Event::from_raw(handle))
    }

    fn destroy_event(&self, event: vk::Event) {
        self.lock().events.remove(&event.as_raw());
    }

    fn set_event(&self, event: vk::Event) -> VkResult<()> {
        let mut state = self.lock();
        match state.events.get_mut(&event.as_raw()) {
            Some(set) => *set = true,
            None => return Err(vk::Result::ERROR_UNKNOWN),
        }
        if state.pump() {
            self.progress.notify_all();
        }
        Ok(())
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        cmd: vk::CommandBuffer,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut state = self.lock();
        let Some(buffer) = state.command_buffers.get(&cmd.as_raw()) else {
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        let submission = Submission {
            commands: buffer.commands.clone(),
            pc: 0,
            fence: fence.as_raw(),
            pipeline: 0,
            set: 0,
            push_constants: Vec::new(),
        };
        state.stats.submissions += 1;
        state
            .queues
            .entry(queue.as_raw())
            .or_default()
            .push_back(submission);
        if state.pump() {
            self.progress.notify_all();
        }
        Ok(())
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        let raw = queue.as_raw();
        self.wait_until(u64::MAX, |state| {
            state
                .queues
                .get(&raw)
                .map_or(true, |q| q.is_empty())
                .then_some(Ok(()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_bytecode_is_rejected() {
        let sim = SimDriver::new(SimConfig::default());
        assert_eq!(
            sim.create_shader_module(&[0x0723_0203, 0]),
            Err(vk::Result::ERROR_INITIALIZATION_FAILED)
        );
    }

    #[test]
    fn event_blocks_queue_until_set() {
        let sim = SimDriver::new(SimConfig::default());
        let queue = sim.queue(0);
        let pool = sim.create_command_pool(0).unwrap();
        let cmd = sim.allocate_command_buffer(pool).unwrap();
        let event = sim.create_event().unwrap();
        let fence = sim.create_fence(false).unwrap();

        sim.begin_command_buffer(cmd).unwrap();
        sim.cmd_wait_event(cmd, event);
        sim.end_command_buffer(cmd).unwrap();
        sim.queue_submit(queue, cmd, fence).unwrap();

        assert_eq!(sim.wait_for_fence(fence, 0), Err(vk::Result::TIMEOUT));
        sim.set_event(event).unwrap();
        assert_eq!(sim.wait_for_fence(fence, 0), Ok(()));
    }

    #[test]
    fn mapped_memory_is_word_aligned() {
        let sim = SimDriver::new(SimConfig::default());
        let memory = sim.allocate_memory(40, 1).unwrap();
        let ptr = sim.map_memory(memory, 0, 40).unwrap();
        assert_eq!(ptr as usize % 16, 0);
        assert!(sim.map_memory(memory, 40, 16).is_err());
    }
}
