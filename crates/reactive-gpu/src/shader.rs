//! Shader modules.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use ash::vk;
use reactive_shaders::{ShaderStage, SPIRV_MAGIC};

/// Vulkan stage flag for a shader stage.
pub const fn stage_flags(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
        ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        ShaderStage::RayGen => vk::ShaderStageFlags::RAYGEN_KHR,
        ShaderStage::Miss => vk::ShaderStageFlags::MISS_KHR,
        ShaderStage::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        ShaderStage::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
        ShaderStage::Intersection => vk::ShaderStageFlags::INTERSECTION_KHR,
        ShaderStage::Callable => vk::ShaderStageFlags::CALLABLE_KHR,
        ShaderStage::Task => vk::ShaderStageFlags::TASK_EXT,
        ShaderStage::Mesh => vk::ShaderStageFlags::MESH_EXT,
    }
}

/// Parameters for [`GpuContext::create_shader`].
#[derive(Debug, Clone, Copy)]
pub struct ShaderCreateInfo<'a> {
    pub code: &'a [u32],
    pub stage: ShaderStage,
    pub debug_name: &'a str,
}

impl Default for ShaderCreateInfo<'_> {
    fn default() -> Self {
        Self {
            code: &[],
            stage: ShaderStage::Compute,
            debug_name: "shader",
        }
    }
}

/// Immutable SPIR-V module for one pipeline stage.
///
/// The words are kept alongside the module so descriptor sets can reflect
/// them later.
pub struct Shader {
    ctx: GpuContext,
    module: vk::ShaderModule,
    code: Vec<u32>,
    stage: ShaderStage,
}

impl Shader {
    pub(crate) fn new(ctx: GpuContext, info: &ShaderCreateInfo<'_>) -> Result<Self> {
        if info.code.first() != Some(&SPIRV_MAGIC) {
            return Err(GpuError::ShaderCompilation(format!(
                "'{}' is not a SPIR-V module",
                info.debug_name
            )));
        }

        let create_info = vk::ShaderModuleCreateInfo::default().code(info.code);
        let module = unsafe { ctx.device().create_shader_module(&create_info, None) }
            .map_err(|e| GpuError::ShaderCompilation(format!("{}: {e}", info.debug_name)))?;

        ctx.set_debug_name(module, info.debug_name);

        Ok(Self {
            ctx,
            module,
            code: info.code.to_vec(),
            stage: info.stage,
        })
    }

    pub fn module(&self) -> vk::ShaderModule {
        self.module
    }

    pub fn code(&self) -> &[u32] {
        &self.code
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn stage_flags(&self) -> vk::ShaderStageFlags {
        stage_flags(self.stage)
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_shader_module(self.module, None);
        }
    }
}
