//! Command buffer management.

use crate::context::{GpuContext, ThreadQueue};
use crate::descriptors::DescriptorSet;
use crate::error::{GpuError, Result};
use crate::image::Image;
use crate::pipeline::{Bindable, RayTracingPipeline};
use ash::vk;
use std::marker::PhantomData;

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = device.create_command_pool(&create_info, None)?;

        Ok(Self { pool })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }
}

/// A primary command buffer allocated from the calling thread's pool.
///
/// Command pools are externally synchronized, so a command buffer stays on
/// the thread that allocated it.
pub struct CommandBuffer {
    ctx: GpuContext,
    cmd: vk::CommandBuffer,
    pool: vk::CommandPool,
    queue_index: usize,
    _not_send: PhantomData<*const ()>,
}

impl CommandBuffer {
    pub(crate) fn allocate(ctx: GpuContext, thread_queue: ThreadQueue) -> Result<Self> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(thread_queue.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = unsafe { ctx.device().allocate_command_buffers(&alloc_info)? }
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::InvalidState("No command buffer allocated".to_string()))?;

        Ok(Self {
            ctx,
            cmd,
            pool: thread_queue.command_pool,
            queue_index: thread_queue.queue_index,
            _not_send: PhantomData,
        })
    }

    /// Raw handle.
    pub fn raw(&self) -> vk::CommandBuffer {
        self.cmd
    }

    /// Queue this buffer is submitted to.
    pub fn queue_index(&self) -> usize {
        self.queue_index
    }

    /// Context the buffer was allocated from.
    pub fn context(&self) -> &GpuContext {
        &self.ctx
    }

    /// Begin recording for repeated submission.
    pub fn begin(&self) -> Result<()> {
        self.begin_with(vk::CommandBufferUsageFlags::empty())
    }

    /// Begin recording for a single submission.
    pub fn begin_one_time(&self) -> Result<()> {
        self.begin_with(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
    }

    fn begin_with(&self, flags: vk::CommandBufferUsageFlags) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe {
            self.ctx.device().begin_command_buffer(self.cmd, &begin_info)?;
        }
        Ok(())
    }

    /// End recording.
    pub fn end(&self) -> Result<()> {
        unsafe {
            self.ctx.device().end_command_buffer(self.cmd)?;
        }
        Ok(())
    }

    /// Bind a pipeline at its bind point.
    pub fn bind_pipeline(&self, pipeline: &impl Bindable) {
        unsafe {
            self.ctx
                .device()
                .cmd_bind_pipeline(self.cmd, pipeline.bind_point(), pipeline.raw());
        }
    }

    /// Bind a descriptor set at set index 0 of the pipeline's layout.
    pub fn bind_descriptor_set(&self, set: &DescriptorSet, pipeline: &impl Bindable) {
        self.bind_descriptor_set_at(0, set, pipeline);
    }

    /// Bind a descriptor set at the given set index.
    pub fn bind_descriptor_set_at(&self, index: u32, set: &DescriptorSet, pipeline: &impl Bindable) {
        unsafe {
            self.ctx.device().cmd_bind_descriptor_sets(
                self.cmd,
                pipeline.bind_point(),
                pipeline.layout(),
                index,
                &[set.raw()],
                &[],
            );
        }
    }

    /// Push constants visible to all stages of the pipeline layout.
    pub fn push_constants<T: bytemuck::Pod>(
        &self,
        pipeline: &impl Bindable,
        stages: vk::ShaderStageFlags,
        data: &T,
    ) {
        unsafe {
            self.ctx.device().cmd_push_constants(
                self.cmd,
                pipeline.layout(),
                stages,
                0,
                bytemuck::bytes_of(data),
            );
        }
    }

    /// Dispatch compute work groups.
    pub fn dispatch(&self, x: u32, y: u32, z: u32) {
        unsafe {
            self.ctx.device().cmd_dispatch(self.cmd, x, y, z);
        }
    }

    /// Launch `width * height * depth` ray generation invocations through
    /// the pipeline's shader binding table. The pipeline must be bound.
    pub fn trace_rays(
        &self,
        pipeline: &RayTracingPipeline,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Result<()> {
        let loader = self.ctx.ray_tracing_pipeline_loader()?;
        let sbt = pipeline.sbt();
        unsafe {
            loader.cmd_trace_rays(
                self.cmd,
                sbt.raygen_region(),
                sbt.miss_region(),
                sbt.hit_region(),
                sbt.callable_region(),
                width,
                height,
                depth,
            );
        }
        Ok(())
    }

    /// Copy a region between buffers.
    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, size: u64) {
        let region = vk::BufferCopy::default().size(size);
        unsafe {
            self.ctx
                .device()
                .cmd_copy_buffer(self.cmd, src, dst, std::slice::from_ref(&region));
        }
    }

    /// Full pipeline barrier over the given stages and access masks.
    pub fn memory_barrier(
        &self,
        src_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(src_stage)
            .src_access_mask(src_access)
            .dst_stage_mask(dst_stage)
            .dst_access_mask(dst_access);
        let dependency_info =
            vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
        unsafe {
            self.ctx
                .device()
                .cmd_pipeline_barrier2(self.cmd, &dependency_info);
        }
    }

    /// Transition an image to `new_layout`, recording the layout it ends in.
    pub fn transition_layout(&self, image: &Image, new_layout: vk::ImageLayout) {
        let old_layout = image.swap_layout(new_layout);
        if old_layout == new_layout {
            return;
        }

        let barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.raw())
            .subresource_range(image.subresource_range());

        let dependency_info = vk::DependencyInfo::default()
            .image_memory_barriers(std::slice::from_ref(&barrier));
        unsafe {
            self.ctx
                .device()
                .cmd_pipeline_barrier2(self.cmd, &dependency_info);
        }
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        unsafe {
            self.ctx
                .device()
                .free_command_buffers(self.pool, &[self.cmd]);
        }
    }
}
