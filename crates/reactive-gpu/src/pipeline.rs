//! Pipeline creation and management.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::sbt::{SbtLayout, ShaderBindingTable};
use crate::shader::{stage_flags, Shader};
use ash::vk;
use reactive_shaders::ShaderStage;

/// A pipeline that command buffers can bind, along with descriptor sets and
/// push constants against its layout.
pub trait Bindable {
    fn raw(&self) -> vk::Pipeline;
    fn layout(&self) -> vk::PipelineLayout;
    fn bind_point(&self) -> vk::PipelineBindPoint;
}

/// Parameters for [`GpuContext::create_compute_pipeline`].
#[derive(Clone, Copy)]
pub struct ComputePipelineCreateInfo<'a> {
    pub shader: &'a Shader,
    pub descriptor_set_layouts: &'a [vk::DescriptorSetLayout],
    /// Bytes of push constants visible to the compute stage.
    pub push_constant_size: u32,
    pub debug_name: &'a str,
}

/// Compute pipeline wrapper.
pub struct ComputePipeline {
    ctx: GpuContext,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl ComputePipeline {
    pub(crate) fn new(ctx: GpuContext, info: &ComputePipelineCreateInfo<'_>) -> Result<Self> {
        if info.shader.stage() != ShaderStage::Compute {
            return Err(GpuError::PipelineCreation(format!(
                "'{}' needs a compute shader, got {:?}",
                info.debug_name,
                info.shader.stage()
            )));
        }

        let push_constant_ranges: Vec<_> = (info.push_constant_size > 0)
            .then(|| {
                vk::PushConstantRange::default()
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .offset(0)
                    .size(info.push_constant_size)
            })
            .into_iter()
            .collect();

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(info.descriptor_set_layouts)
            .push_constant_ranges(&push_constant_ranges);

        let layout = unsafe { ctx.device().create_pipeline_layout(&layout_info, None) }
            .map_err(|e| GpuError::PipelineCreation(e.to_string()))?;

        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(info.shader.module())
            .name(c"main");

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout);

        let pipelines = unsafe {
            ctx.device()
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        let pipeline = match pipelines {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { ctx.device().destroy_pipeline_layout(layout, None) };
                return Err(GpuError::PipelineCreation(format!("{}: {e}", info.debug_name)));
            }
        };

        ctx.set_debug_name(pipeline, info.debug_name);

        Ok(Self {
            ctx,
            pipeline,
            layout,
        })
    }
}

impl Bindable for ComputePipeline {
    fn raw(&self) -> vk::Pipeline {
        self.pipeline
    }

    fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    fn bind_point(&self) -> vk::PipelineBindPoint {
        vk::PipelineBindPoint::COMPUTE
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_pipeline(self.pipeline, None);
            self.ctx.device().destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Stages that may read push constants of a ray tracing pipeline.
const RAY_TRACING_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
        | vk::ShaderStageFlags::MISS_KHR.as_raw()
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::ANY_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::INTERSECTION_KHR.as_raw()
        | vk::ShaderStageFlags::CALLABLE_KHR.as_raw(),
);

/// A triangle hit group. At least one shader must be set.
#[derive(Debug, Clone, Copy)]
pub struct HitGroup<S> {
    pub closest_hit: Option<S>,
    pub any_hit: Option<S>,
}

impl<S> HitGroup<S> {
    pub const fn closest_hit(shader: S) -> Self {
        Self {
            closest_hit: Some(shader),
            any_hit: None,
        }
    }
}

/// Parameters for [`GpuContext::create_ray_tracing_pipeline`].
#[derive(Clone, Copy)]
pub struct RayTracingPipelineCreateInfo<'a> {
    pub raygen: &'a Shader,
    pub miss: &'a [&'a Shader],
    pub hit_groups: &'a [HitGroup<&'a Shader>],
    pub descriptor_set_layouts: &'a [vk::DescriptorSetLayout],
    /// Bytes of push constants visible to every ray tracing stage.
    pub push_constant_size: u32,
    /// Clamped to the device limit.
    pub max_ray_recursion_depth: u32,
    pub debug_name: &'a str,
}

/// Anything with a shader stage, so group planning can run on bare stages.
trait Staged: Copy {
    fn stage(self) -> ShaderStage;
}

impl Staged for &Shader {
    fn stage(self) -> ShaderStage {
        Shader::stage(self)
    }
}

/// Stage order and shader groups of a ray tracing pipeline.
struct GroupPlan<S> {
    stages: Vec<S>,
    groups: Vec<vk::RayTracingShaderGroupCreateInfoKHR<'static>>,
}

fn plan_groups<S: Staged>(
    name: &str,
    raygen: S,
    miss: &[S],
    hit_groups: &[HitGroup<S>],
) -> Result<GroupPlan<S>> {
    let mut plan = GroupPlan {
        stages: Vec::new(),
        groups: Vec::new(),
    };
    let mut push = |shader: S, expected: ShaderStage| -> Result<u32> {
        if shader.stage() != expected {
            return Err(GpuError::PipelineCreation(format!(
                "'{name}' needs a {expected:?} shader, got {:?}",
                shader.stage()
            )));
        }
        let index = u32::try_from(plan.stages.len())
            .map_err(|_| GpuError::PipelineCreation(format!("'{name}' has too many shaders")))?;
        plan.stages.push(shader);
        Ok(index)
    };

    let general = |index: u32| {
        vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(index)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
    };

    let mut groups = vec![general(push(raygen, ShaderStage::RayGen)?)];
    for &shader in miss {
        groups.push(general(push(shader, ShaderStage::Miss)?));
    }
    for group in hit_groups {
        if group.closest_hit.is_none() && group.any_hit.is_none() {
            return Err(GpuError::PipelineCreation(format!(
                "'{name}' has an empty hit group"
            )));
        }
        let closest_hit = match group.closest_hit {
            Some(shader) => push(shader, ShaderStage::ClosestHit)?,
            None => vk::SHADER_UNUSED_KHR,
        };
        let any_hit = match group.any_hit {
            Some(shader) => push(shader, ShaderStage::AnyHit)?,
            None => vk::SHADER_UNUSED_KHR,
        };
        groups.push(
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(closest_hit)
                .any_hit_shader(any_hit)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
        );
    }

    plan.groups = groups;
    Ok(plan)
}

/// Ray tracing pipeline with its shader binding table.
pub struct RayTracingPipeline {
    ctx: GpuContext,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    sbt: ShaderBindingTable,
}

impl RayTracingPipeline {
    pub(crate) fn new(ctx: GpuContext, info: &RayTracingPipelineCreateInfo<'_>) -> Result<Self> {
        let loader = ctx.ray_tracing_pipeline_loader()?;
        let plan = plan_groups(info.debug_name, info.raygen, info.miss, info.hit_groups)?;
        let sbt_layout = SbtLayout::new(
            &ctx.capabilities().shader_group,
            u32::try_from(info.miss.len()).unwrap_or(u32::MAX),
            u32::try_from(info.hit_groups.len()).unwrap_or(u32::MAX),
        )?;

        let push_constant_ranges: Vec<_> = (info.push_constant_size > 0)
            .then(|| {
                vk::PushConstantRange::default()
                    .stage_flags(RAY_TRACING_STAGES)
                    .offset(0)
                    .size(info.push_constant_size)
            })
            .into_iter()
            .collect();

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(info.descriptor_set_layouts)
            .push_constant_ranges(&push_constant_ranges);

        let layout = unsafe { ctx.device().create_pipeline_layout(&layout_info, None) }
            .map_err(|e| GpuError::PipelineCreation(e.to_string()))?;

        let stages: Vec<_> = plan
            .stages
            .iter()
            .map(|shader| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage_flags(shader.stage()))
                    .module(shader.module())
                    .name(c"main")
            })
            .collect();

        let max_depth = ctx.capabilities().shader_group.max_ray_recursion_depth;
        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&plan.groups)
            .max_pipeline_ray_recursion_depth(info.max_ray_recursion_depth.min(max_depth))
            .layout(layout);

        let pipelines = unsafe {
            loader.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[pipeline_info],
                None,
            )
        };
        let pipeline = match pipelines {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { ctx.device().destroy_pipeline_layout(layout, None) };
                return Err(GpuError::PipelineCreation(format!("{}: {e}", info.debug_name)));
            }
        };

        let sbt = match ShaderBindingTable::new(&ctx, pipeline, sbt_layout, info.debug_name) {
            Ok(sbt) => sbt,
            Err(e) => {
                unsafe {
                    ctx.device().destroy_pipeline(pipeline, None);
                    ctx.device().destroy_pipeline_layout(layout, None);
                }
                return Err(e);
            }
        };

        ctx.set_debug_name(pipeline, info.debug_name);
        tracing::debug!(
            "Created ray tracing pipeline '{}' with {} shader group(s)",
            info.debug_name,
            plan.groups.len()
        );

        Ok(Self {
            ctx,
            pipeline,
            layout,
            sbt,
        })
    }

    pub fn sbt(&self) -> &ShaderBindingTable {
        &self.sbt
    }
}

impl Bindable for RayTracingPipeline {
    fn raw(&self) -> vk::Pipeline {
        self.pipeline
    }

    fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    fn bind_point(&self) -> vk::PipelineBindPoint {
        vk::PipelineBindPoint::RAY_TRACING_KHR
    }
}

impl Drop for RayTracingPipeline {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_pipeline(self.pipeline, None);
            self.ctx.device().destroy_pipeline_layout(self.layout, None);
        }
    }
}

impl GpuContext {
    /// Create a ray tracing pipeline and fill its shader binding table.
    ///
    /// Groups are laid out as ray generation, then `miss`, then
    /// `hit_groups`, so miss index `i` in a shader selects `info.miss[i]`.
    pub fn create_ray_tracing_pipeline(
        &self,
        info: &RayTracingPipelineCreateInfo<'_>,
    ) -> Result<RayTracingPipeline> {
        RayTracingPipeline::new(self.clone(), info)
    }

    /// Create a compute pipeline.
    pub fn create_compute_pipeline(
        &self,
        info: &ComputePipelineCreateInfo<'_>,
    ) -> Result<ComputePipeline> {
        ComputePipeline::new(self.clone(), info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl Staged for ShaderStage {
        fn stage(self) -> ShaderStage {
            self
        }
    }

    #[test]
    fn groups_follow_raygen_miss_hit_order() {
        let plan = plan_groups(
            "trace",
            ShaderStage::RayGen,
            &[ShaderStage::Miss, ShaderStage::Miss],
            &[
                HitGroup::closest_hit(ShaderStage::ClosestHit),
                HitGroup {
                    closest_hit: Some(ShaderStage::ClosestHit),
                    any_hit: Some(ShaderStage::AnyHit),
                },
                HitGroup {
                    closest_hit: None,
                    any_hit: Some(ShaderStage::AnyHit),
                },
            ],
        )
        .unwrap();

        assert_eq!(plan.stages.len(), 7);
        assert_eq!(plan.groups.len(), 6);
        for (i, group) in plan.groups[..3].iter().enumerate() {
            assert_eq!(group.ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
            assert_eq!(group.general_shader, i as u32);
            assert_eq!(group.closest_hit_shader, vk::SHADER_UNUSED_KHR);
        }

        let hits: Vec<_> = plan.groups[3..]
            .iter()
            .map(|g| (g.general_shader, g.closest_hit_shader, g.any_hit_shader))
            .collect();
        let unused = vk::SHADER_UNUSED_KHR;
        assert_eq!(hits, [(unused, 3, unused), (unused, 4, 5), (unused, unused, 6)]);
        assert!(plan.groups[3..]
            .iter()
            .all(|g| g.ty == vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
                && g.intersection_shader == unused));
    }

    #[test]
    fn shaders_must_match_their_slot() {
        let wrong_raygen = plan_groups("trace", ShaderStage::Compute, &[], &[]);
        assert!(matches!(wrong_raygen, Err(GpuError::PipelineCreation(m)) if m.contains("RayGen")));

        let wrong_miss = plan_groups(
            "trace",
            ShaderStage::RayGen,
            &[ShaderStage::ClosestHit],
            &[],
        );
        assert!(wrong_miss.is_err());

        let swapped = plan_groups(
            "trace",
            ShaderStage::RayGen,
            &[ShaderStage::Miss],
            &[HitGroup {
                closest_hit: Some(ShaderStage::AnyHit),
                any_hit: None,
            }],
        );
        assert!(swapped.is_err());
    }

    #[test]
    fn empty_hit_groups_are_rejected() {
        let plan = plan_groups(
            "trace",
            ShaderStage::RayGen,
            &[ShaderStage::Miss],
            &[HitGroup {
                closest_hit: None,
                any_hit: None,
            }],
        );
        assert!(matches!(plan, Err(GpuError::PipelineCreation(m)) if m.contains("empty hit group")));
    }

    #[test]
    fn raygen_alone_is_one_group() {
        let plan = plan_groups("trace", ShaderStage::RayGen, &[], &[]).unwrap();
        assert_eq!(plan.stages, [ShaderStage::RayGen]);
        assert_eq!(plan.groups.len(), 1);
    }

    #[test]
    fn push_constants_reach_every_ray_stage() {
        for stage in [
            ShaderStage::RayGen,
            ShaderStage::Miss,
            ShaderStage::ClosestHit,
            ShaderStage::AnyHit,
            ShaderStage::Intersection,
            ShaderStage::Callable,
        ] {
            assert!(RAY_TRACING_STAGES.contains(stage_flags(stage)));
        }
        assert!(!RAY_TRACING_STAGES.contains(vk::ShaderStageFlags::COMPUTE));
    }
}
