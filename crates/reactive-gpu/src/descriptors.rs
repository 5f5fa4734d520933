//! Descriptor sets laid out from shader reflection.

use crate::binding::{plan_writes, BindingTable, DescriptorInfos, DescriptorResource};
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::shader::Shader;
use ash::vk;
use std::collections::HashMap;

/// Parameters for [`GpuContext::create_descriptor_set`].
///
/// ```ignore
/// let info = DescriptorSetCreateInfo::new()
///     .shaders(&[&vertex, &fragment])
///     .resources("mvp", &[&uniforms])?
///     .count("textures", 16);
/// ```
#[derive(Default)]
pub struct DescriptorSetCreateInfo<'a> {
    shaders: Vec<&'a Shader>,
    resources: Vec<(&'a str, DescriptorInfos)>,
    counts: Vec<(&'a str, u32)>,
    debug_name: &'a str,
}

impl<'a> DescriptorSetCreateInfo<'a> {
    pub fn new() -> Self {
        Self {
            debug_name: "descriptor set",
            ..Default::default()
        }
    }

    /// Add a shader whose bindings the set must satisfy.
    #[must_use]
    pub fn shader(mut self, shader: &'a Shader) -> Self {
        self.shaders.push(shader);
        self
    }

    #[must_use]
    pub fn shaders(mut self, shaders: &[&'a Shader]) -> Self {
        self.shaders.extend_from_slice(shaders);
        self
    }

    /// Assign resources at creation. The binding's array count becomes
    /// the number of resources.
    pub fn resources<R: DescriptorResource>(mut self, name: &'a str, resources: &[R]) -> Result<Self> {
        let infos = DescriptorInfos::from_resources(name, resources)?;
        self.resources.push((name, infos));
        Ok(self)
    }

    /// Set a binding's array count without assigning resources yet.
    #[must_use]
    pub fn count(mut self, name: &'a str, count: u32) -> Self {
        self.counts.push((name, count));
        self
    }

    #[must_use]
    pub fn debug_name(mut self, name: &'a str) -> Self {
        self.debug_name = name;
        self
    }

    /// Apply explicit counts, then size each binding to its non-empty
    /// resource list and validate it.
    fn apply(&self, table: &mut BindingTable) -> Result<()> {
        for (name, count) in &self.counts {
            table.set_count(name, *count)?;
        }
        for (name, infos) in &self.resources {
            if !infos.is_empty() {
                table.set_count(name, descriptor_count(name, infos.len())?)?;
            }
            table.validate(name, infos)?;
        }
        Ok(())
    }
}

fn descriptor_count(name: &str, len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| GpuError::DescriptorCountExceeded {
        name: name.to_string(),
        capacity: u32::MAX,
        actual: len,
    })
}

/// A descriptor set plus the resources assigned to its named bindings.
pub struct DescriptorSet {
    ctx: GpuContext,
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
    table: BindingTable,
    assigned: HashMap<String, DescriptorInfos>,
}

impl DescriptorSet {
    pub(crate) fn new(ctx: GpuContext, info: &DescriptorSetCreateInfo<'_>) -> Result<Self> {
        let mut table = BindingTable::from_shaders(&info.shaders)?;
        info.apply(&mut table)?;

        let layout_bindings = table.layout_bindings();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&layout_bindings);
        let layout = unsafe {
            ctx.device()
                .create_descriptor_set_layout(&layout_info, None)?
        };

        let set = match ctx.allocate_descriptor_set(layout) {
            Ok(set) => set,
            Err(e) => {
                unsafe { ctx.device().destroy_descriptor_set_layout(layout, None) };
                return Err(e);
            }
        };

        ctx.set_debug_name(layout, info.debug_name);
        ctx.set_debug_name(set, info.debug_name);

        tracing::debug!(
            "Created descriptor set '{}' with {} binding(s)",
            info.debug_name,
            table.len()
        );

        let assigned = info
            .resources
            .iter()
            .map(|(name, infos)| ((*name).to_string(), infos.clone()))
            .collect();

        Ok(Self {
            ctx,
            layout,
            set,
            table,
            assigned,
        })
    }

    /// Replace the resources assigned to `name`. Takes effect on [`update`](Self::update).
    pub fn set<R: DescriptorResource>(&mut self, name: &str, resources: &[R]) -> Result<()> {
        let infos = DescriptorInfos::from_resources(name, resources)?;
        self.table.validate(name, &infos)?;
        self.assigned.insert(name.to_string(), infos);
        Ok(())
    }

    /// Write every populated binding in one `vkUpdateDescriptorSets` call.
    ///
    /// The set must not be in use by a pending command buffer.
    pub fn update(&self) -> Result<()> {
        let planned = plan_writes(&self.table, &self.assigned);

        let mut accel_writes: Vec<_> = planned
            .iter()
            .filter_map(|w| match w.infos {
                DescriptorInfos::AccelerationStructures(handles) => Some(
                    vk::WriteDescriptorSetAccelerationStructureKHR::default()
                        .acceleration_structures(handles),
                ),
                _ => None,
            })
            .collect();
        let mut accel_writes = accel_writes.iter_mut();

        let mut writes = Vec::with_capacity(planned.len());
        for planned in &planned {
            let write = vk::WriteDescriptorSet::default()
                .dst_set(self.set)
                .dst_binding(planned.binding)
                .dst_array_element(0)
                .descriptor_type(planned.kind.vk());

            writes.push(match planned.infos {
                DescriptorInfos::Buffers(infos) => write.buffer_info(infos),
                DescriptorInfos::Images(infos) => write.image_info(infos),
                DescriptorInfos::AccelerationStructures(handles) => {
                    let count = descriptor_count(planned.name, handles.len())?;
                    let accel = accel_writes.next().ok_or_else(|| {
                        GpuError::InvalidState("Missing acceleration structure write".to_string())
                    })?;
                    write
                        .descriptor_count(count)
                        .push_next(accel)
                }
            });
        }

        unsafe {
            self.ctx.device().update_descriptor_sets(&writes, &[]);
        }
        Ok(())
    }

    pub fn raw(&self) -> vk::DescriptorSet {
        self.set
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// The merged bindings the set was laid out from.
    pub fn bindings(&self) -> &BindingTable {
        &self.table
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        self.ctx.free_descriptor_set(self.set);
        unsafe {
            self.ctx
                .device()
                .destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Descriptor pool for allocating descriptor sets.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    const MAX_SETS: u32 = 1024;
    const PER_TYPE: u32 = 1024;

    /// Create a new descriptor pool.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

        let pool = device.create_descriptor_pool(&create_info, None)?;
        Ok(Self { pool })
    }

    /// Pool sized for every descriptor type reflection can produce.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn with_default_sizes(device: &ash::Device, ray_tracing: bool) -> Result<Self> {
        let mut types = vec![
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::DescriptorType::SAMPLED_IMAGE,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::DescriptorType::SAMPLER,
            vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
            vk::DescriptorType::STORAGE_TEXEL_BUFFER,
            vk::DescriptorType::INPUT_ATTACHMENT,
        ];
        if ray_tracing {
            types.push(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR);
        }

        let sizes: Vec<_> = types
            .into_iter()
            .map(|ty| vk::DescriptorPoolSize {
                ty,
                descriptor_count: Self::PER_TYPE,
            })
            .collect();

        Self::new(device, Self::MAX_SETS, &sizes)
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Allocate descriptor sets.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(
        &self,
        device: &ash::Device,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        let sets = device.allocate_descriptor_sets(&alloc_info)?;
        Ok(sets)
    }

    /// Return a set to the pool.
    ///
    /// # Safety
    /// The device must be valid and the set must not be in use.
    pub unsafe fn free(&self, device: &ash::Device, set: vk::DescriptorSet) {
        if let Err(e) = device.free_descriptor_sets(self.pool, &[set]) {
            tracing::error!("Failed to free descriptor set: {e}");
        }
    }

    /// Destroy the pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.pool, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferCreateInfo;
    use crate::memory::{BufferUsage, MemoryUsage};
    use crate::reflection::asm::Asm;
    use crate::shader::ShaderCreateInfo;
    use crate::GpuContextBuilder;
    use crate::binding::DescriptorInfo;
    use crate::reflection::reflect;
    use ash::vk::Handle;
    use reactive_shaders::ShaderStage;

    fn uniform(raw: u64) -> DescriptorInfo {
        DescriptorInfo::Buffer(
            vk::DescriptorBufferInfo::default()
                .buffer(vk::Buffer::from_raw(raw))
                .range(vk::WHOLE_SIZE),
        )
    }

    fn table() -> BindingTable {
        let code = Asm::new()
            .uniform_block(10, "params", 0, 0)
            .uniform_block(20, "lights", 0, 1)
            .finish();
        let mut table = BindingTable::new();
        table
            .merge(&reflect(&code).unwrap(), vk::ShaderStageFlags::COMPUTE)
            .unwrap();
        table
    }

    #[test]
    fn resources_size_their_binding() {
        let mut table = table();
        DescriptorSetCreateInfo::new()
            .resources("lights", &[uniform(1), uniform(2), uniform(3)])
            .unwrap()
            .apply(&mut table)
            .unwrap();
        assert_eq!(table.get("lights").unwrap().count, 3);
        assert_eq!(table.get("params").unwrap().count, 1);
    }

    #[test]
    fn empty_resources_keep_the_count() {
        let mut table = table();
        DescriptorSetCreateInfo::new()
            .count("lights", 4)
            .resources::<DescriptorInfo>("lights", &[])
            .unwrap()
            .resources::<DescriptorInfo>("params", &[])
            .unwrap()
            .apply(&mut table)
            .unwrap();
        assert_eq!(table.get("lights").unwrap().count, 4);
        assert_eq!(table.get("params").unwrap().count, 1);
        assert!(table.layout_bindings().iter().all(|b| b.descriptor_count > 0));
    }

    #[test]
    fn unknown_resource_names_are_rejected() {
        let mut table = table();
        let info = DescriptorSetCreateInfo::new()
            .resources("shadows", &[uniform(1)])
            .unwrap();
        assert!(matches!(
            info.apply(&mut table),
            Err(GpuError::UnknownBinding(_))
        ));
    }

    #[test]
    fn descriptor_counts_fit_in_u32() {
        assert_eq!(descriptor_count("scene", 2).unwrap(), 2);
        assert!(matches!(
            descriptor_count("scene", usize::MAX),
            Err(GpuError::DescriptorCountExceeded { capacity: u32::MAX, .. })
        ));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn set_and_update_twice() {
        let ctx = GpuContextBuilder::new().validation(false).build().unwrap();
        let code = Asm::new().uniform_block(10, "params", 0, 0).finish();
        let shader = ctx
            .create_shader(&ShaderCreateInfo {
                code: &code,
                stage: ShaderStage::Compute,
                debug_name: "reflected",
            })
            .unwrap();
        let uniforms = ctx
            .create_buffer(&BufferCreateInfo {
                size: 64,
                usage: BufferUsage::UNIFORM,
                memory: MemoryUsage::Host,
                ..Default::default()
            })
            .unwrap();

        let mut set = ctx
            .create_descriptor_set(&DescriptorSetCreateInfo::new().shader(&shader))
            .unwrap();
        set.set("params", &[&uniforms]).unwrap();
        set.update().unwrap();
        set.update().unwrap();

        assert!(matches!(
            set.set("missing", &[&uniforms]),
            Err(GpuError::UnknownBinding(_))
        ));
    }
}
