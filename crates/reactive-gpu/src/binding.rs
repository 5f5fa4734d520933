//! Named binding tables merged from reflected shader stages, and the
//! descriptor infos assigned to them.

use crate::buffer::Buffer;
use crate::error::{GpuError, Result};
use crate::image::Image;
use crate::reflection::{reflect, DescriptorKind, ReflectedBinding};
use crate::shader::Shader;
use ash::vk;
use std::collections::HashMap;
use std::sync::Arc;

/// One named resource of a descriptor set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceBinding {
    pub name: String,
    pub binding: u32,
    pub kind: DescriptorKind,
    pub count: u32,
    /// Every stage that declares the resource.
    pub stages: vk::ShaderStageFlags,
}

/// Bindings of descriptor set 0 keyed by resource name.
#[derive(Debug, Clone, Default)]
pub struct BindingTable {
    bindings: Vec<ResourceBinding>,
    by_name: HashMap<String, usize>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reflect and merge every shader in order.
    pub fn from_shaders(shaders: &[&Shader]) -> Result<Self> {
        let mut table = Self::new();
        for shader in shaders {
            table.merge(&reflect(shader.code())?, shader.stage_flags())?;
        }
        Ok(table)
    }

    /// Merge the reflected bindings of one stage.
    ///
    /// The first stage to declare a name decides its slot and kind; later
    /// stages must agree and only add their stage flag. Array counts that
    /// differ between stages resolve to the larger one.
    pub fn merge(&mut self, reflected: &[ReflectedBinding], stage: vk::ShaderStageFlags) -> Result<()> {
        for resource in reflected {
            if resource.set != 0 {
                tracing::warn!(
                    "Ignoring '{}' in descriptor set {}: only set 0 is managed",
                    resource.name,
                    resource.set
                );
                continue;
            }

            if let Some(&index) = self.by_name.get(&resource.name) {
                let existing = &mut self.bindings[index];
                if existing.binding != resource.binding || existing.kind != resource.kind {
                    return Err(GpuError::BindingMismatch {
                        name: resource.name.clone(),
                        existing_slot: existing.binding,
                        existing_kind: existing.kind.vk(),
                        slot: resource.binding,
                        kind: resource.kind.vk(),
                    });
                }
                existing.stages |= stage;
                existing.count = existing.count.max(resource.count);
                continue;
            }

            if let Some(other) = self.bindings.iter().find(|b| b.binding == resource.binding) {
                return Err(GpuError::SlotConflict {
                    slot: resource.binding,
                    first: other.name.clone(),
                    second: resource.name.clone(),
                });
            }

            tracing::debug!(
                "Binding '{}' -> slot {} ({:?} x{})",
                resource.name,
                resource.binding,
                resource.kind,
                resource.count
            );
            self.by_name
                .insert(resource.name.clone(), self.bindings.len());
            self.bindings.push(ResourceBinding {
                name: resource.name.clone(),
                binding: resource.binding,
                kind: resource.kind,
                count: resource.count,
                stages: stage,
            });
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ResourceBinding> {
        self.by_name.get(name).map(|&i| &self.bindings[i])
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut ResourceBinding> {
        match self.by_name.get(name) {
            Some(&i) => Ok(&mut self.bindings[i]),
            None => Err(GpuError::UnknownBinding(name.to_string())),
        }
    }

    /// Override the array count of a binding.
    pub fn set_count(&mut self, name: &str, count: u32) -> Result<()> {
        self.get_mut(name)?.count = count;
        Ok(())
    }

    /// Bindings in the order they were first declared.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceBinding> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Layout bindings in ascending slot order.
    pub fn layout_bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
        let mut bindings: Vec<_> = self
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.kind.vk())
                    .descriptor_count(b.count)
                    .stage_flags(b.stages)
            })
            .collect();
        bindings.sort_by_key(|b| b.binding);
        bindings
    }

    /// Check that `infos` may be written to the binding called `name`.
    pub fn validate(&self, name: &str, infos: &DescriptorInfos) -> Result<()> {
        let binding = self
            .get(name)
            .ok_or_else(|| GpuError::UnknownBinding(name.to_string()))?;

        let expected = ResourceClass::of(binding.kind);
        if !infos.is_empty() && infos.class() != expected {
            return Err(GpuError::DescriptorKindMismatch {
                name: name.to_string(),
                expected: expected.name(),
                actual: infos.class().name(),
            });
        }
        if let DescriptorInfos::Images(images) = infos {
            let needs_sampler = matches!(
                binding.kind,
                DescriptorKind::CombinedImageSampler | DescriptorKind::Sampler
            );
            if needs_sampler && images.iter().any(|i| i.sampler == vk::Sampler::null()) {
                return Err(GpuError::DescriptorKindMismatch {
                    name: name.to_string(),
                    expected: "image with sampler",
                    actual: "image without sampler",
                });
            }
        }
        if infos.len() > binding.count as usize {
            return Err(GpuError::DescriptorCountExceeded {
                name: name.to_string(),
                capacity: binding.count,
                actual: infos.len(),
            });
        }
        Ok(())
    }
}

/// What a descriptor kind is written from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
    Buffer,
    Image,
    AccelerationStructure,
    /// Texel buffers need buffer views, which no resource here provides.
    TexelBuffer,
}

impl ResourceClass {
    pub const fn of(kind: DescriptorKind) -> Self {
        match kind {
            DescriptorKind::UniformBuffer | DescriptorKind::StorageBuffer => Self::Buffer,
            DescriptorKind::CombinedImageSampler
            | DescriptorKind::SampledImage
            | DescriptorKind::StorageImage
            | DescriptorKind::Sampler
            | DescriptorKind::InputAttachment => Self::Image,
            DescriptorKind::AccelerationStructure => Self::AccelerationStructure,
            DescriptorKind::UniformTexelBuffer | DescriptorKind::StorageTexelBuffer => {
                Self::TexelBuffer
            }
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Buffer => "buffer",
            Self::Image => "image",
            Self::AccelerationStructure => "acceleration structure",
            Self::TexelBuffer => "texel buffer",
        }
    }
}

/// Descriptor info of a single resource.
#[derive(Debug, Clone, Copy)]
pub enum DescriptorInfo {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

impl DescriptorInfo {
    pub const fn class(&self) -> ResourceClass {
        match self {
            Self::Buffer(_) => ResourceClass::Buffer,
            Self::Image(_) => ResourceClass::Image,
            Self::AccelerationStructure(_) => ResourceClass::AccelerationStructure,
        }
    }
}

/// Descriptor infos of all array elements of one binding.
#[derive(Debug, Clone)]
pub enum DescriptorInfos {
    Buffers(Vec<vk::DescriptorBufferInfo>),
    Images(Vec<vk::DescriptorImageInfo>),
    AccelerationStructures(Vec<vk::AccelerationStructureKHR>),
}

impl DescriptorInfos {
    /// Gather the infos of `resources`, which must all be of one class.
    pub fn from_resources<R: DescriptorResource>(name: &str, resources: &[R]) -> Result<Self> {
        let mut infos = resources.iter().map(DescriptorResource::descriptor);
        let Some(first) = infos.next() else {
            return Ok(Self::Buffers(Vec::new()));
        };

        let mut collected = match first {
            DescriptorInfo::Buffer(info) => Self::Buffers(vec![info]),
            DescriptorInfo::Image(info) => Self::Images(vec![info]),
            DescriptorInfo::AccelerationStructure(handle) => {
                Self::AccelerationStructures(vec![handle])
            }
        };

        for info in infos {
            match (&mut collected, info) {
                (Self::Buffers(v), DescriptorInfo::Buffer(info)) => v.push(info),
                (Self::Images(v), DescriptorInfo::Image(info)) => v.push(info),
                (Self::AccelerationStructures(v), DescriptorInfo::AccelerationStructure(h)) => {
                    v.push(h);
                }
                (collected, other) => {
                    return Err(GpuError::DescriptorKindMismatch {
                        name: name.to_string(),
                        expected: collected.class().name(),
                        actual: other.class().name(),
                    });
                }
            }
        }

        Ok(collected)
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Buffers(v) => v.len(),
            Self::Images(v) => v.len(),
            Self::AccelerationStructures(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn class(&self) -> ResourceClass {
        match self {
            Self::Buffers(_) => ResourceClass::Buffer,
            Self::Images(_) => ResourceClass::Image,
            Self::AccelerationStructures(_) => ResourceClass::AccelerationStructure,
        }
    }
}

/// Anything that can be written into a descriptor.
pub trait DescriptorResource {
    fn descriptor(&self) -> DescriptorInfo;
}

impl DescriptorResource for Buffer {
    fn descriptor(&self) -> DescriptorInfo {
        DescriptorInfo::Buffer(self.descriptor_info())
    }
}

impl DescriptorResource for Image {
    fn descriptor(&self) -> DescriptorInfo {
        DescriptorInfo::Image(self.descriptor_info())
    }
}

impl DescriptorResource for DescriptorInfo {
    fn descriptor(&self) -> DescriptorInfo {
        *self
    }
}

impl<T: DescriptorResource + ?Sized> DescriptorResource for &T {
    fn descriptor(&self) -> DescriptorInfo {
        (**self).descriptor()
    }
}

impl<T: DescriptorResource + ?Sized> DescriptorResource for Arc<T> {
    fn descriptor(&self) -> DescriptorInfo {
        (**self).descriptor()
    }
}

/// One descriptor write, before it is turned into a `VkWriteDescriptorSet`.
#[derive(Debug, Clone, Copy)]
pub struct PlannedWrite<'a> {
    pub name: &'a str,
    pub binding: u32,
    pub kind: DescriptorKind,
    pub infos: &'a DescriptorInfos,
}

/// Writes for every populated binding, in ascending slot order.
pub fn plan_writes<'a>(
    table: &BindingTable,
    assigned: &'a HashMap<String, DescriptorInfos>,
) -> Vec<PlannedWrite<'a>> {
    let mut writes: Vec<_> = assigned
        .iter()
        .filter(|(_, infos)| !infos.is_empty())
        .filter_map(|(name, infos)| {
            table.get(name).map(|binding| PlannedWrite {
                name: name.as_str(),
                binding: binding.binding,
                kind: binding.kind,
                infos,
            })
        })
        .collect();
    writes.sort_by_key(|w| w.binding);
    writes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflection::asm::Asm;
    use ash::vk::Handle;

    fn buffer_info(raw: u64) -> DescriptorInfo {
        DescriptorInfo::Buffer(
            vk::DescriptorBufferInfo::default()
                .buffer(vk::Buffer::from_raw(raw))
                .range(vk::WHOLE_SIZE),
        )
    }

    fn image_info(raw: u64) -> DescriptorInfo {
        DescriptorInfo::Image(
            vk::DescriptorImageInfo::default()
                .sampler(vk::Sampler::from_raw(raw))
                .image_view(vk::ImageView::from_raw(raw))
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        )
    }

    fn unsampled_image_info(raw: u64) -> DescriptorInfo {
        DescriptorInfo::Image(
            vk::DescriptorImageInfo::default()
                .image_view(vk::ImageView::from_raw(raw))
                .image_layout(vk::ImageLayout::GENERAL),
        )
    }

    fn table(stages: &[(Vec<u32>, vk::ShaderStageFlags)]) -> Result<BindingTable> {
        let mut table = BindingTable::new();
        for (words, stage) in stages {
            table.merge(&reflect(words)?, *stage)?;
        }
        Ok(table)
    }

    #[test]
    fn vertex_uniform_and_fragment_texture() {
        let vertex = Asm::new().uniform_block(10, "mvp", 0, 0).finish();
        let fragment = Asm::new().sampled_texture(10, "tex", 0, 1).finish();

        let table = table(&[
            (vertex, vk::ShaderStageFlags::VERTEX),
            (fragment, vk::ShaderStageFlags::FRAGMENT),
        ])
        .unwrap();

        assert_eq!(table.len(), 2);
        let mvp = table.get("mvp").unwrap();
        assert_eq!(mvp.binding, 0);
        assert_eq!(mvp.kind.vk(), vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(mvp.stages, vk::ShaderStageFlags::VERTEX);

        let tex = table.get("tex").unwrap();
        assert_eq!(tex.binding, 1);
        assert_eq!(tex.kind.vk(), vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(tex.stages, vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn shared_names_merge_stages() {
        let a = Asm::new()
            .uniform_block(10, "camera", 0, 0)
            .accel(20, "topLevelAS", 0, 1)
            .finish();
        let b = Asm::new().uniform_block(10, "camera", 0, 0).finish();

        let table = table(&[
            (a, vk::ShaderStageFlags::RAYGEN_KHR),
            (b, vk::ShaderStageFlags::CLOSEST_HIT_KHR),
        ])
        .unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(
            table.get("camera").unwrap().stages,
            vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR
        );
        assert_eq!(
            table.get("topLevelAS").unwrap().stages,
            vk::ShaderStageFlags::RAYGEN_KHR
        );
    }

    #[test]
    fn differing_slot_for_same_name_is_an_error() {
        let a = Asm::new().uniform_block(10, "camera", 0, 0).finish();
        let b = Asm::new().uniform_block(10, "camera", 0, 3).finish();

        let err = table(&[
            (a, vk::ShaderStageFlags::VERTEX),
            (b, vk::ShaderStageFlags::FRAGMENT),
        ])
        .unwrap_err();

        match err {
            GpuError::BindingMismatch {
                name,
                existing_slot,
                slot,
                ..
            } => {
                assert_eq!(name, "camera");
                assert_eq!((existing_slot, slot), (0, 3));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn differing_kind_for_same_name_is_an_error() {
        let a = Asm::new().uniform_block(10, "thing", 0, 0).finish();
        let b = Asm::new().accel(10, "thing", 0, 0).finish();

        assert!(matches!(
            table(&[
                (a, vk::ShaderStageFlags::VERTEX),
                (b, vk::ShaderStageFlags::FRAGMENT),
            ]),
            Err(GpuError::BindingMismatch { .. })
        ));
    }

    #[test]
    fn two_names_on_one_slot_conflict() {
        let a = Asm::new().uniform_block(10, "a", 0, 2).finish();
        let b = Asm::new().uniform_block(10, "b", 0, 2).finish();

        assert!(matches!(
            table(&[
                (a, vk::ShaderStageFlags::VERTEX),
                (b, vk::ShaderStageFlags::FRAGMENT),
            ]),
            Err(GpuError::SlotConflict { slot: 2, .. })
        ));
    }

    #[test]
    fn other_descriptor_sets_are_skipped() {
        let words = Asm::new()
            .uniform_block(10, "global", 0, 0)
            .uniform_block(20, "material", 1, 0)
            .finish();

        let table = table(&[(words, vk::ShaderStageFlags::FRAGMENT)]).unwrap();
        assert!(table.get("global").is_some());
        assert!(table.get("material").is_none());
    }

    #[test]
    fn layout_bindings_are_sorted_by_slot() {
        let words = Asm::new()
            .sampled_texture(10, "tex", 0, 4)
            .uniform_block(20, "ubo", 0, 1)
            .finish();

        let mut table = table(&[(words, vk::ShaderStageFlags::COMPUTE)]).unwrap();
        table.set_count("tex", 8).unwrap();

        let layout = table.layout_bindings();
        assert_eq!(layout.len(), 2);
        assert_eq!(layout[0].binding, 1);
        assert_eq!(layout[1].binding, 4);
        assert_eq!(layout[1].descriptor_count, 8);
        assert!(table.set_count("missing", 2).is_err());
    }

    #[test]
    fn validation_rejects_unknown_wrong_class_and_overflow() {
        let words = Asm::new()
            .uniform_block(10, "ubo", 0, 0)
            .sampled_texture(20, "tex", 0, 1)
            .finish();
        let table = table(&[(words, vk::ShaderStageFlags::FRAGMENT)]).unwrap();

        let buffers = DescriptorInfos::from_resources("ubo", &[buffer_info(1)]).unwrap();
        let two_buffers =
            DescriptorInfos::from_resources("ubo", &[buffer_info(1), buffer_info(2)]).unwrap();
        let image = DescriptorInfos::from_resources("tex", &[image_info(3)]).unwrap();

        assert!(table.validate("ubo", &buffers).is_ok());
        assert!(table.validate("tex", &image).is_ok());
        assert!(matches!(
            table.validate("nope", &buffers),
            Err(GpuError::UnknownBinding(_))
        ));
        assert!(matches!(
            table.validate("tex", &buffers),
            Err(GpuError::DescriptorKindMismatch {
                expected: "image",
                actual: "buffer",
                ..
            })
        ));
        assert!(matches!(
            table.validate("ubo", &two_buffers),
            Err(GpuError::DescriptorCountExceeded {
                capacity: 1,
                actual: 2,
                ..
            })
        ));
    }

    #[test]
    fn sampler_slots_need_a_sampler() {
        let words = Asm::new()
            .sampled_texture(20, "tex", 0, 1)
            .sampler(30, "smp", 0, 2)
            .finish();
        let table = table(&[(words, vk::ShaderStageFlags::FRAGMENT)]).unwrap();
        assert_eq!(table.get("smp").unwrap().kind, DescriptorKind::Sampler);

        let bare = DescriptorInfos::from_resources("tex", &[unsampled_image_info(4)]).unwrap();
        for name in ["tex", "smp"] {
            assert!(matches!(
                table.validate(name, &bare),
                Err(GpuError::DescriptorKindMismatch {
                    expected: "image with sampler",
                    actual: "image without sampler",
                    ..
                })
            ));
        }

        let mixed =
            DescriptorInfos::from_resources("tex", &[image_info(3), unsampled_image_info(4)])
                .unwrap();
        assert!(table.validate("tex", &mixed).is_err());
        let sampled = DescriptorInfos::from_resources("smp", &[image_info(3)]).unwrap();
        assert!(table.validate("smp", &sampled).is_ok());
    }

    #[test]
    fn mixed_resource_classes_are_rejected() {
        assert!(matches!(
            DescriptorInfos::from_resources("mixed", &[buffer_info(1), image_info(2)]),
            Err(GpuError::DescriptorKindMismatch { .. })
        ));
    }

    #[test]
    fn writes_are_planned_in_slot_order_and_repeatable() {
        let words = Asm::new()
            .sampled_texture(10, "tex", 0, 5)
            .uniform_block(20, "ubo", 0, 2)
            .accel(30, "scene", 0, 0)
            .finish();
        let table = table(&[(words, vk::ShaderStageFlags::COMPUTE)]).unwrap();

        let mut assigned = HashMap::new();
        assigned.insert(
            "tex".to_string(),
            DescriptorInfos::from_resources("tex", &[image_info(7)]).unwrap(),
        );
        assigned.insert(
            "ubo".to_string(),
            DescriptorInfos::from_resources("ubo", &[buffer_info(9)]).unwrap(),
        );
        assigned.insert(
            "scene".to_string(),
            DescriptorInfos::AccelerationStructures(vec![vk::AccelerationStructureKHR::from_raw(
                11,
            )]),
        );

        let first: Vec<_> = plan_writes(&table, &assigned)
            .iter()
            .map(|w| (w.binding, w.kind, w.infos.len()))
            .collect();
        let second: Vec<_> = plan_writes(&table, &assigned)
            .iter()
            .map(|w| (w.binding, w.kind, w.infos.len()))
            .collect();

        assert_eq!(
            first,
            vec![
                (0, DescriptorKind::AccelerationStructure, 1),
                (2, DescriptorKind::UniformBuffer, 1),
                (5, DescriptorKind::CombinedImageSampler, 1),
            ]
        );
        assert_eq!(first, second);
    }

    #[test]
    fn unset_bindings_are_not_written() {
        let words = Asm::new()
            .uniform_block(10, "used", 0, 0)
            .uniform_block(20, "unused", 0, 1)
            .finish();
        let table = table(&[(words, vk::ShaderStageFlags::VERTEX)]).unwrap();

        let mut assigned = HashMap::new();
        assigned.insert(
            "used".to_string(),
            DescriptorInfos::from_resources("used", &[buffer_info(1)]).unwrap(),
        );
        assigned.insert("unused".to_string(), DescriptorInfos::Buffers(Vec::new()));

        let writes = plan_writes(&table, &assigned);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].binding, 0);
    }
}
