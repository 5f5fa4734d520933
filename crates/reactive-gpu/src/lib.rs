//! Vulkan abstraction layer for the Reactive framework.
//!
//! This crate provides:
//! - Vulkan instance and device management with per-thread queues
//! - GPU capability detection
//! - Memory allocation via gpu-allocator
//! - Buffers, images, shader modules, compute and ray tracing pipelines
//! - Shader binding tables
//! - SPIR-V reflection and descriptor sets laid out from it
//! - Command buffers, fences and timestamp timers

pub mod binding;
pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod image;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod reflection;
pub mod sbt;
pub mod shader;
pub mod sync;
pub mod timer;

pub use binding::{
    BindingTable, DescriptorInfo, DescriptorInfos, DescriptorResource, ResourceBinding,
    ResourceClass,
};
pub use buffer::{Buffer, BufferCreateInfo};
pub use capabilities::{GpuCapabilities, GpuVendor, ShaderGroupProperties};
pub use command::CommandBuffer;
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{DescriptorSet, DescriptorSetCreateInfo};
pub use error::{GpuError, Result};
pub use image::{Image, ImageCreateInfo};
pub use memory::{align_up, BufferUsage, MemoryUsage};
pub use pipeline::{
    Bindable, ComputePipeline, ComputePipelineCreateInfo, HitGroup, RayTracingPipeline,
    RayTracingPipelineCreateInfo,
};
pub use reactive_shaders::ShaderStage;
pub use reflection::{reflect, DescriptorKind, ReflectedBinding};
pub use sbt::{SbtLayout, ShaderBindingTable};
pub use shader::{Shader, ShaderCreateInfo};
pub use sync::Fence;
pub use timer::GpuTimer;
