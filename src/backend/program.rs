// Compute programs
//
// A `Program` wraps one shader module and everything needed to dispatch it:
//
//   Unbound ──bind──> LayoutReady ──> PipelineReady ──> Recorded ──run_async──> Submitted
//                                          ^                │  ^                    │
//                                          └── spec() ──────┘  └──────── bind ──────┘
//
// The descriptor-set layout is derived from the *types* of the first bound
// arguments and never re-derived; later binds must use the same signature and
// reuse the pipeline. Each bind records a fresh command buffer and descriptor
// set, so dispatches handed off with `run_async` never share either. Pending
// dispatches hold the pipeline and layouts alive past `spec()` or drop.

use ash::vk;
use bytemuck::Pod;
use glam::UVec3;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use super::buffer::{Buffer, RawBuffer};
use super::device::{Device, QueueKind};
use super::driver::{DescriptorWrite, SpecializationData};
use super::error::{Error, Result, VkResultExt};
use super::memory::MemoryKind;
use super::shader;
use super::sync::Delayed;

/// Something that can be bound to a descriptor slot
pub trait Argument {
    fn descriptor_type(&self) -> vk::DescriptorType;
    fn raw_buffer(&self) -> &Arc<RawBuffer>;
    fn range(&self) -> vk::DeviceSize;
}

impl<T: Pod, M: MemoryKind> Argument for Buffer<T, M> {
    fn descriptor_type(&self) -> vk::DescriptorType {
        vk::DescriptorType::STORAGE_BUFFER
    }

    fn raw_buffer(&self) -> &Arc<RawBuffer> {
        self.raw()
    }

    fn range(&self) -> vk::DeviceSize {
        self.size_bytes().max(1)
    }
}

/// Binds a buffer as a uniform block instead of a storage buffer.
///
/// The buffer needs `UNIFORM_BUFFER` usage (see `Buffer::with_usage`).
pub struct Uniform<'a, T, M>(pub &'a Buffer<T, M>);

impl<T: Pod, M: MemoryKind> Argument for Uniform<'_, T, M> {
    fn descriptor_type(&self) -> vk::DescriptorType {
        vk::DescriptorType::UNIFORM_BUFFER
    }

    fn raw_buffer(&self) -> &Arc<RawBuffer> {
        self.0.raw()
    }

    fn range(&self) -> vk::DeviceSize {
        self.0.size_bytes().max(1)
    }
}

/// Values baked into the pipeline as specialization constants 0, 1, 2, ...
pub trait SpecConstants {
    fn pack(&self) -> SpecializationData;
}

impl SpecConstants for () {
    fn pack(&self) -> SpecializationData {
        SpecializationData::default()
    }
}

macro_rules! spec_tuple {
    ($($name:ident $idx:tt),+) => {
        impl<$($name: Pod),+> SpecConstants for ($($name,)+) {
            fn pack(&self) -> SpecializationData {
                let mut data = SpecializationData::default();
                $(data.push(bytemuck::bytes_of(&self.$idx));)+
                data
            }
        }
    };
}

spec_tuple!(A 0);
spec_tuple!(A 0, B 1);
spec_tuple!(A 0, B 1, C 2);
spec_tuple!(A 0, B 1, C 2, D 3);
spec_tuple!(A 0, B 1, C 2, D 3, E 4);
spec_tuple!(A 0, B 1, C 2, D 3, E 4, F 5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramState {
    /// Shader loaded, no layouts yet
    Unbound,
    /// Descriptor-set and pipeline layouts exist
    LayoutReady,
    /// Compute pipeline built
    PipelineReady,
    /// A command buffer with the dispatch is ready to submit
    Recorded,
    /// The last recording was handed to the GPU with `run_async`
    Submitted,
}

/// Descriptor-set and pipeline layouts, shared with every pipeline built on them
struct Layout {
    device: Arc<Device>,
    signature: Vec<vk::DescriptorType>,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
}

impl Layout {
    fn create(
        device: &Arc<Device>,
        signature: Vec<vk::DescriptorType>,
        push_size: u32,
    ) -> Result<Self> {
        let driver = device.driver();
        // Partially created layouts are cleaned up by `Drop`
        let mut layout = Layout {
            device: device.clone(),
            signature,
            set_layout: vk::DescriptorSetLayout::null(),
            pipeline_layout: vk::PipelineLayout::null(),
        };
        layout.set_layout = driver
            .create_descriptor_set_layout(&layout.signature)
            .context_vk("vkCreateDescriptorSetLayout")?;
        layout.pipeline_layout = driver
            .create_pipeline_layout(layout.set_layout, push_size)
            .context_vk("vkCreatePipelineLayout")?;
        Ok(layout)
    }
}

impl Drop for Layout {
    fn drop(&mut self) {
        let driver = self.device.driver();
        if self.pipeline_layout != vk::PipelineLayout::null() {
            driver.destroy_pipeline_layout(self.pipeline_layout);
        }
        if self.set_layout != vk::DescriptorSetLayout::null() {
            driver.destroy_descriptor_set_layout(self.set_layout);
        }
    }
}

/// A built compute pipeline; lives until the program and every pending
/// dispatch that binds it are gone
struct Pipeline {
    handle: vk::Pipeline,
    layout: Arc<Layout>,
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.layout.device.driver().destroy_pipeline(self.handle);
    }
}

/// One descriptor pool entry per distinct descriptor type, sized by its count
fn pool_sizes(signature: &[vk::DescriptorType]) -> Vec<vk::DescriptorPoolSize> {
    let mut counts = BTreeMap::new();
    for ty in signature {
        *counts.entry(ty.as_raw()).or_insert(0u32) += 1;
    }
    counts
        .into_iter()
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
            ty: vk::DescriptorType::from_raw(ty),
            descriptor_count,
        })
        .collect()
}

/// Everything one recorded dispatch touches on the GPU.
///
/// Each recording has its own descriptor set, so rebinding never rewrites a
/// set a pending submission still reads. `run_async` moves the recording into
/// the completion handle, which drops it after the fence signals.
struct Recording {
    device: Arc<Device>,
    pipeline: Arc<Pipeline>,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    cmd: vk::CommandBuffer,
    event: Option<vk::Event>,
    buffers: Vec<Arc<RawBuffer>>,
}

impl Recording {
    fn new(
        device: &Arc<Device>,
        pipeline: Arc<Pipeline>,
        args: &[&dyn Argument],
    ) -> Result<Self> {
        let driver = device.driver();
        let mut recording = Recording {
            device: device.clone(),
            pipeline,
            pool: vk::DescriptorPool::null(),
            set: vk::DescriptorSet::null(),
            cmd: vk::CommandBuffer::null(),
            event: None,
            buffers: args.iter().map(|a| a.raw_buffer().clone()).collect(),
        };

        let layout = &recording.pipeline.layout;
        recording.pool = driver
            .create_descriptor_pool(&pool_sizes(&layout.signature), 1)
            .context_vk("vkCreateDescriptorPool")?;
        recording.set = driver
            .allocate_descriptor_set(recording.pool, layout.set_layout)
            .context_vk("vkAllocateDescriptorSets")?;

        let writes: Vec<_> = args
            .iter()
            .enumerate()
            .map(|(binding, arg)| DescriptorWrite {
                binding: binding as u32,
                descriptor_type: arg.descriptor_type(),
                buffer: arg.raw_buffer().handle(),
                range: arg.range(),
            })
            .collect();
        driver.update_descriptor_set(recording.set, &writes);
        Ok(recording)
    }

    /// Record the dispatch into a fresh command buffer, replacing the previous
    /// one. On success the recording owns `event`.
    fn encode(
        &mut self,
        grid: UVec3,
        push_constants: &[u8],
        event: Option<vk::Event>,
    ) -> Result<()> {
        let driver = self.device.driver();
        let pipeline_layout = self.pipeline.layout.pipeline_layout;
        let cmd = self.device.begin_commands(QueueKind::Compute)?;

        if let Some(event) = event {
            driver.cmd_wait_event(cmd, event);
        }
        driver.cmd_bind_pipeline(cmd, self.pipeline.handle);
        driver.cmd_bind_descriptor_set(cmd, pipeline_layout, self.set);
        if !push_constants.is_empty() {
            driver.cmd_push_constants(cmd, pipeline_layout, push_constants);
        }
        driver.cmd_dispatch(cmd, grid.to_array());

        if let Err(e) = self.device.end_commands(QueueKind::Compute, cmd) {
            self.device.free_commands(QueueKind::Compute, cmd);
            return Err(e);
        }
        self.release_commands();
        self.cmd = cmd;
        self.event = event;
        Ok(())
    }

    fn release_commands(&mut self) {
        if self.cmd != vk::CommandBuffer::null() {
            self.device.free_commands(QueueKind::Compute, self.cmd);
            self.cmd = vk::CommandBuffer::null();
        }
        if let Some(event) = self.event.take() {
            self.device.driver().destroy_event(event);
        }
    }
}

impl Drop for Recording {
    fn drop(&mut self) {
        self.release_commands();
        // Destroying the pool frees the set
        if self.pool != vk::DescriptorPool::null() {
            self.device.driver().destroy_descriptor_pool(self.pool);
        }
    }
}

/// Compute kernel with push-constant block `P`
pub struct Program<P = ()> {
    device: Arc<Device>,
    module: vk::ShaderModule,
    entry_point: CString,
    cache: vk::PipelineCache,
    layout: Option<Arc<Layout>>,
    pipeline: Option<Arc<Pipeline>>,
    specialization: SpecializationData,
    grid: Option<UVec3>,
    push_constants: Vec<u8>,
    recording: Option<Recording>,
    state: ProgramState,
    _params: PhantomData<fn(&P)>,
}

impl<P> std::fmt::Debug for Program<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("module", &self.module)
            .field("entry_point", &self.entry_point)
            .field("state", &self.state)
            .field("grid", &self.grid)
            .finish_non_exhaustive()
    }
}

impl<P: Pod> Program<P> {
    /// Create a program from SPIR-V words
    pub fn new(device: &Arc<Device>, code: &[u32]) -> Result<Self> {
        let driver = device.driver();
        let module = driver
            .create_shader_module(code)
            .context_vk("vkCreateShaderModule")?;
        let cache = match driver.create_pipeline_cache() {
            Ok(cache) => cache,
            Err(result) => {
                driver.destroy_shader_module(module);
                return Err(result).context_vk("vkCreatePipelineCache");
            }
        };

        log::debug!("Created program from {} words of SPIR-V", code.len());

        Ok(Self {
            device: device.clone(),
            module,
            entry_point: CString::from(c"main"),
            cache,
            layout: None,
            pipeline: None,
            specialization: SpecializationData::default(),
            grid: None,
            push_constants: Vec::new(),
            recording: None,
            state: ProgramState::Unbound,
            _params: PhantomData,
        })
    }

    /// Create a program from a compiled shader file
    pub fn from_file(device: &Arc<Device>, path: impl AsRef<Path>) -> Result<Self> {
        let code = shader::read_spirv(path)?;
        Self::new(device, &code)
    }

    /// Use `name` instead of `main` as the shader entry point
    pub fn with_entry_point(mut self, name: &str) -> Result<Self> {
        self.entry_point = CString::new(name)
            .map_err(|_| Error::precondition("entry point name contains a NUL byte"))?;
        Ok(self)
    }

    pub fn state(&self) -> ProgramState {
        self.state
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Dispatch grid in workgroups
    pub fn grid(&mut self, x: u32, y: u32, z: u32) -> &mut Self {
        self.grid_dims(UVec3::new(x, y, z))
    }

    pub fn grid_dims(&mut self, groups: UVec3) -> &mut Self {
        self.grid = Some(groups);
        self
    }

    /// Set specialization constants; a built pipeline is rebuilt on the next
    /// bind. Dispatches already submitted keep the old one.
    pub fn spec(&mut self, constants: impl SpecConstants) -> &mut Self {
        self.specialization = constants.pack();
        if self.pipeline.take().is_some() {
            self.recording = None;
            self.state = ProgramState::LayoutReady;
        }
        self
    }

    /// Bind `params` and `args` and record a dispatch over the current grid
    pub fn bind(&mut self, params: &P, args: &[&dyn Argument]) -> Result<&mut Self> {
        let grid = self
            .grid
            .ok_or_else(|| Error::precondition("dispatch grid not set before bind"))?;
        if args.is_empty() {
            return Err(Error::precondition("a program needs at least one argument"));
        }

        let signature: Vec<_> = args.iter().map(|a| a.descriptor_type()).collect();
        self.ensure_layout(signature)?;
        let pipeline = self.ensure_pipeline()?;

        self.push_constants = bytemuck::bytes_of(params).to_vec();
        self.recording = None;
        let mut recording = Recording::new(&self.device, pipeline, args)?;
        recording.encode(grid, &self.push_constants, None)?;
        self.recording = Some(recording);
        self.state = ProgramState::Recorded;
        Ok(self)
    }

    /// Submit the recorded dispatch and block until the compute queue is idle
    pub fn run(&mut self) -> Result<()> {
        let recording = self
            .recording
            .as_ref()
            .ok_or_else(|| Error::precondition("run called with nothing recorded"))?;
        self.device
            .submit(QueueKind::Compute, recording.cmd, vk::Fence::null())?;
        self.device.wait_idle(QueueKind::Compute)
    }

    /// Bind and run synchronously
    pub fn call(&mut self, params: &P, args: &[&dyn Argument]) -> Result<()> {
        self.bind(params, args)?;
        self.run()
    }

    /// Submit the recorded dispatch and return without waiting.
    ///
    /// With `suspend` the dispatch waits on an event until
    /// `Delayed::resume` is called. The recording moves into the returned
    /// handle; bind again before the next run.
    pub fn run_async(&mut self, suspend: bool) -> Result<Delayed> {
        let Some(mut recording) = self.recording.take() else {
            return Err(Error::precondition("run_async called with nothing recorded"));
        };
        let fence = match self.submit_async(&mut recording, suspend) {
            Ok(fence) => fence,
            Err(e) => {
                self.recording = Some(recording);
                return Err(e);
            }
        };
        self.state = ProgramState::Submitted;

        // The handle owns the event from here on
        let event = recording.event.take();
        let action = move || drop(recording);
        Ok(match event {
            Some(event) => Delayed::with_event(self.device.clone(), fence, event, action),
            None => Delayed::new(self.device.clone(), fence, action),
        })
    }

    fn submit_async(&self, recording: &mut Recording, suspend: bool) -> Result<vk::Fence> {
        let driver = self.device.driver();
        if suspend {
            let grid = self
                .grid
                .ok_or_else(|| Error::precondition("dispatch grid not set"))?;
            let event = driver.create_event().context_vk("vkCreateEvent")?;
            if let Err(e) = recording.encode(grid, &self.push_constants, Some(event)) {
                driver.destroy_event(event);
                return Err(e);
            }
        }

        let fence = driver.create_fence(false).context_vk("vkCreateFence")?;
        if let Err(e) = self.device.submit(QueueKind::Compute, recording.cmd, fence) {
            driver.destroy_fence(fence);
            return Err(e);
        }
        Ok(fence)
    }

    fn ensure_layout(&mut self, signature: Vec<vk::DescriptorType>) -> Result<()> {
        if let Some(layout) = &self.layout {
            if layout.signature != signature {
                return Err(Error::SignatureMismatch {
                    expected: layout.signature.clone(),
                    found: signature,
                });
            }
            return Ok(());
        }

        let push_size = std::mem::size_of::<P>();
        if push_size % 4 != 0 {
            return Err(Error::precondition(format!(
                "push-constant block of {} bytes is not a multiple of 4",
                push_size
            )));
        }

        let layout = Layout::create(&self.device, signature, push_size as u32)?;
        log::debug!(
            "Created layouts for {:?} with {} bytes of push constants",
            layout.signature,
            push_size
        );
        self.layout = Some(Arc::new(layout));
        self.state = ProgramState::LayoutReady;
        Ok(())
    }

    fn ensure_pipeline(&mut self) -> Result<Arc<Pipeline>> {
        if let Some(pipeline) = &self.pipeline {
            return Ok(pipeline.clone());
        }
        let layout = self
            .layout
            .clone()
            .ok_or_else(|| Error::precondition("pipeline requested before layout"))?;

        let handle = self
            .device
            .driver()
            .create_compute_pipeline(
                self.cache,
                layout.pipeline_layout,
                self.module,
                &self.entry_point,
                &self.specialization,
            )
            .context_vk("vkCreateComputePipelines")?;
        log::debug!(
            "Built compute pipeline with {} specialization constants",
            self.specialization.entries.len()
        );
        let pipeline = Arc::new(Pipeline { handle, layout });
        self.pipeline = Some(pipeline.clone());
        self.state = ProgramState::PipelineReady;
        Ok(pipeline)
    }
}

impl<P> Drop for Program<P> {
    fn drop(&mut self) {
        // Pipelines and layouts are refcounted and go with the last dispatch using them
        self.recording = None;
        self.pipeline = None;
        self.layout = None;
        let driver = self.device.driver();
        driver.destroy_pipeline_cache(self.cache);
        driver.destroy_shader_module(self.module);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_sizes_count_each_type() {
        let sizes = pool_sizes(&[
            vk::DescriptorType::STORAGE_BUFFER,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::DescriptorType::STORAGE_BUFFER,
        ]);
        let storage = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::STORAGE_BUFFER)
            .unwrap();
        let uniform = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::UNIFORM_BUFFER)
            .unwrap();
        assert_eq!(sizes.len(), 2);
        assert_eq!(storage.descriptor_count, 2);
        assert_eq!(uniform.descriptor_count, 1);
    }

    #[test]
    fn spec_tuples_pack_in_order() {
        let packed = (64u32, 1u32, 0.5f32).pack();
        assert_eq!(packed.entries.len(), 3);
        assert_eq!(packed.entries[2].constant_id, 2);
        assert_eq!(packed.entries[2].offset, 8);
        assert_eq!(&packed.data[0..4], &64u32.to_ne_bytes());
    }
}
