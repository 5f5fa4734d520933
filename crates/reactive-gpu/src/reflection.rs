//! SPIR-V reflection of descriptor bindings.
//!
//! Only the instructions that describe resource variables are decoded:
//! names, binding/set decorations, the type declarations a resource can be
//! built from, integer constants and specialization constant defaults
//! (array lengths) and variables. Everything
//! else is skipped by word count.

use crate::error::{GpuError, Result};
use ash::vk;
use reactive_shaders::SPIRV_MAGIC;
use std::collections::{HashMap, HashSet};

const HEADER_WORDS: usize = 5;

mod op {
    pub const NAME: u32 = 5;
    pub const TYPE_IMAGE: u32 = 25;
    pub const TYPE_SAMPLER: u32 = 26;
    pub const TYPE_SAMPLED_IMAGE: u32 = 27;
    pub const TYPE_ARRAY: u32 = 28;
    pub const TYPE_RUNTIME_ARRAY: u32 = 29;
    pub const TYPE_STRUCT: u32 = 30;
    pub const TYPE_POINTER: u32 = 32;
    pub const CONSTANT: u32 = 43;
    pub const SPEC_CONSTANT: u32 = 50;
    pub const VARIABLE: u32 = 59;
    pub const DECORATE: u32 = 71;
    pub const TYPE_ACCELERATION_STRUCTURE_KHR: u32 = 5341;
}

mod decoration {
    pub const BLOCK: u32 = 2;
    pub const BUFFER_BLOCK: u32 = 3;
    pub const BINDING: u32 = 33;
    pub const DESCRIPTOR_SET: u32 = 34;
}

mod storage {
    pub const UNIFORM_CONSTANT: u32 = 0;
    pub const UNIFORM: u32 = 2;
    pub const STORAGE_BUFFER: u32 = 12;
}

const DIM_BUFFER: u32 = 5;
const DIM_SUBPASS_DATA: u32 = 6;

/// Kind of descriptor a shader resource consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    UniformBuffer,
    StorageBuffer,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    Sampler,
    UniformTexelBuffer,
    StorageTexelBuffer,
    InputAttachment,
    AccelerationStructure,
}

impl DescriptorKind {
    pub const fn vk(self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            Self::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            Self::Sampler => vk::DescriptorType::SAMPLER,
            Self::UniformTexelBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
            Self::StorageTexelBuffer => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
            Self::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
            Self::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        }
    }
}

/// A resource variable found in a SPIR-V module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedBinding {
    pub name: String,
    pub set: u32,
    pub binding: u32,
    pub kind: DescriptorKind,
    /// Declared array count. Runtime-sized arrays report 1.
    pub count: u32,
}

#[derive(Debug, Clone, Copy)]
enum Type {
    Image { dim: u32, sampled: u32 },
    Sampler,
    SampledImage,
    Array { element: u32, length: u32 },
    RuntimeArray { element: u32 },
    Struct,
    Pointer { pointee: u32 },
    AccelerationStructure,
}

#[derive(Default)]
struct Module {
    names: HashMap<u32, String>,
    bindings: HashMap<u32, u32>,
    sets: HashMap<u32, u32>,
    blocks: HashSet<u32>,
    buffer_blocks: HashSet<u32>,
    types: HashMap<u32, Type>,
    constants: HashMap<u32, u32>,
    /// (pointer type, result id, storage class) in declaration order.
    variables: Vec<(u32, u32, u32)>,
}

fn malformed(message: impl Into<String>) -> GpuError {
    GpuError::Reflection(message.into())
}

fn operand(operands: &[u32], index: usize, opcode: u32) -> Result<u32> {
    operands
        .get(index)
        .copied()
        .ok_or_else(|| malformed(format!("opcode {opcode} is missing operand {index}")))
}

/// Decode a nul-terminated literal string packed little-endian into words.
fn literal_string(words: &[u32]) -> Result<String> {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for word in words {
        for byte in word.to_le_bytes() {
            if byte == 0 {
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.push(byte);
        }
    }
    Err(malformed("unterminated string literal"))
}

fn parse(words: &[u32]) -> Result<Module> {
    if words.len() < HEADER_WORDS {
        return Err(malformed(format!(
            "module has {} words, header needs {HEADER_WORDS}",
            words.len()
        )));
    }
    if words[0] != SPIRV_MAGIC {
        return Err(malformed(format!("bad magic number {:#010x}", words[0])));
    }

    let mut module = Module::default();
    let mut offset = HEADER_WORDS;

    while offset < words.len() {
        let word_count = (words[offset] >> 16) as usize;
        let opcode = words[offset] & 0xFFFF;

        if word_count == 0 {
            return Err(malformed(format!("zero-length instruction at word {offset}")));
        }
        let end = offset + word_count;
        if end > words.len() {
            return Err(malformed(format!(
                "instruction at word {offset} overruns the module ({word_count} words)"
            )));
        }
        let ops = &words[offset + 1..end];

        match opcode {
            op::NAME => {
                let target = operand(ops, 0, opcode)?;
                module.names.insert(target, literal_string(&ops[1..])?);
            }
            op::DECORATE => {
                let target = operand(ops, 0, opcode)?;
                match operand(ops, 1, opcode)? {
                    decoration::BINDING => {
                        module.bindings.insert(target, operand(ops, 2, opcode)?);
                    }
                    decoration::DESCRIPTOR_SET => {
                        module.sets.insert(target, operand(ops, 2, opcode)?);
                    }
                    decoration::BLOCK => {
                        module.blocks.insert(target);
                    }
                    decoration::BUFFER_BLOCK => {
                        module.buffer_blocks.insert(target);
                    }
                    _ => {}
                }
            }
            op::TYPE_IMAGE => {
                let ty = Type::Image {
                    dim: operand(ops, 2, opcode)?,
                    sampled: operand(ops, 6, opcode)?,
                };
                module.types.insert(operand(ops, 0, opcode)?, ty);
            }
            op::TYPE_SAMPLER => {
                module.types.insert(operand(ops, 0, opcode)?, Type::Sampler);
            }
            op::TYPE_SAMPLED_IMAGE => {
                module.types.insert(operand(ops, 0, opcode)?, Type::SampledImage);
            }
            op::TYPE_ARRAY => {
                let ty = Type::Array {
                    element: operand(ops, 1, opcode)?,
                    length: operand(ops, 2, opcode)?,
                };
                module.types.insert(operand(ops, 0, opcode)?, ty);
            }
            op::TYPE_RUNTIME_ARRAY => {
                let ty = Type::RuntimeArray {
                    element: operand(ops, 1, opcode)?,
                };
                module.types.insert(operand(ops, 0, opcode)?, ty);
            }
            op::TYPE_STRUCT => {
                module.types.insert(operand(ops, 0, opcode)?, Type::Struct);
            }
            op::TYPE_POINTER => {
                let ty = Type::Pointer {
                    pointee: operand(ops, 2, opcode)?,
                };
                module.types.insert(operand(ops, 0, opcode)?, ty);
            }
            op::TYPE_ACCELERATION_STRUCTURE_KHR => {
                module
                    .types
                    .insert(operand(ops, 0, opcode)?, Type::AccelerationStructure);
            }
            op::CONSTANT | op::SPEC_CONSTANT => {
                // Array lengths fit in the low word. Specialization
                // constants report their default value.
                module
                    .constants
                    .insert(operand(ops, 1, opcode)?, operand(ops, 2, opcode)?);
            }
            op::VARIABLE => {
                module.variables.push((
                    operand(ops, 0, opcode)?,
                    operand(ops, 1, opcode)?,
                    operand(ops, 2, opcode)?,
                ));
            }
            _ => {}
        }

        offset = end;
    }

    Ok(module)
}

impl Module {
    fn kind_of(&self, ty: u32, storage_class: u32) -> Option<DescriptorKind> {
        match self.types.get(&ty)? {
            Type::Struct => match storage_class {
                storage::STORAGE_BUFFER => Some(DescriptorKind::StorageBuffer),
                storage::UNIFORM if self.buffer_blocks.contains(&ty) => {
                    Some(DescriptorKind::StorageBuffer)
                }
                storage::UNIFORM => Some(DescriptorKind::UniformBuffer),
                _ => None,
            },
            Type::SampledImage => Some(DescriptorKind::CombinedImageSampler),
            Type::Image { dim, sampled } => Some(match (*dim, *sampled) {
                (DIM_BUFFER, 2) => DescriptorKind::StorageTexelBuffer,
                (DIM_BUFFER, _) => DescriptorKind::UniformTexelBuffer,
                (DIM_SUBPASS_DATA, _) => DescriptorKind::InputAttachment,
                (_, 2) => DescriptorKind::StorageImage,
                _ => DescriptorKind::SampledImage,
            }),
            Type::Sampler => Some(DescriptorKind::Sampler),
            Type::AccelerationStructure => Some(DescriptorKind::AccelerationStructure),
            Type::Array { .. } | Type::RuntimeArray { .. } | Type::Pointer { .. } => None,
        }
    }

    /// Strip array wrappers, returning the element type and total count.
    fn unwrap_arrays(&self, mut ty: u32) -> Result<(u32, u32)> {
        let mut count = 1u32;
        loop {
            match self.types.get(&ty) {
                Some(Type::Array { element, length }) => {
                    let length = self.constants.get(length).ok_or_else(|| {
                        malformed(format!("array length %{length} is not a constant"))
                    })?;
                    count = count.saturating_mul(*length);
                    ty = *element;
                }
                Some(Type::RuntimeArray { element }) => ty = *element,
                _ => return Ok((ty, count)),
            }
        }
    }

    fn name_of(&self, variable: u32, ty: u32) -> Option<&str> {
        [variable, ty]
            .iter()
            .filter_map(|id| self.names.get(id))
            .map(String::as_str)
            .find(|name| !name.is_empty())
    }
}

/// Reflect the descriptor bindings declared by a SPIR-V module, in
/// declaration order.
pub fn reflect(words: &[u32]) -> Result<Vec<ReflectedBinding>> {
    let module = parse(words)?;
    let mut reflected = Vec::new();

    for &(pointer_type, id, storage_class) in &module.variables {
        if !matches!(
            storage_class,
            storage::UNIFORM_CONSTANT | storage::UNIFORM | storage::STORAGE_BUFFER
        ) {
            continue;
        }

        let Some(Type::Pointer { pointee }) = module.types.get(&pointer_type) else {
            return Err(malformed(format!(
                "variable %{id} does not have a pointer type"
            )));
        };
        let (element, count) = module.unwrap_arrays(*pointee)?;

        let Some(kind) = module.kind_of(element, storage_class) else {
            tracing::debug!("Skipping non-descriptor variable %{id}");
            continue;
        };

        let set = module.sets.get(&id).copied().unwrap_or(0);
        let binding = module.bindings.get(&id).copied().unwrap_or(0);
        let name = module
            .name_of(id, element)
            .map_or_else(|| format!("set{set}_binding{binding}"), str::to_string);

        tracing::debug!(
            "Reflected '{name}': set {set} binding {binding} {kind:?} x{count}"
        );

        reflected.push(ReflectedBinding {
            name,
            set,
            binding,
            kind,
            count,
        });
    }

    Ok(reflected)
}

#[cfg(test)]
pub(crate) mod asm {
    //! Minimal SPIR-V assembler for building test modules.

    use super::*;

    pub struct Asm {
        words: Vec<u32>,
    }

    impl Asm {
        pub fn new() -> Self {
            Self {
                words: vec![SPIRV_MAGIC, 0x0001_0500, 0, 100, 0],
            }
        }

        pub fn op(mut self, opcode: u32, operands: &[u32]) -> Self {
            let count = u32::try_from(operands.len() + 1).unwrap();
            self.words.push((count << 16) | opcode);
            self.words.extend_from_slice(operands);
            self
        }

        pub fn name(self, id: u32, name: &str) -> Self {
            let mut operands = vec![id];
            operands.extend(string_words(name));
            self.op(op::NAME, &operands)
        }

        pub fn decorate(self, id: u32, decoration: u32, value: Option<u32>) -> Self {
            let mut operands = vec![id, decoration];
            operands.extend(value);
            self.op(op::DECORATE, &operands)
        }

        pub fn bind(self, id: u32, set: u32, binding: u32) -> Self {
            self.decorate(id, decoration::DESCRIPTOR_SET, Some(set))
                .decorate(id, decoration::BINDING, Some(binding))
        }

        /// `uniform <name> { ... }` at (`set`, `binding`) using ids `base..base+3`.
        pub fn uniform_block(self, base: u32, name: &str, set: u32, binding: u32) -> Self {
            let (st, ptr, var) = (base, base + 1, base + 2);
            self.name(var, name)
                .decorate(st, decoration::BLOCK, None)
                .bind(var, set, binding)
                .op(op::TYPE_STRUCT, &[st])
                .op(op::TYPE_POINTER, &[ptr, storage::UNIFORM, st])
                .op(op::VARIABLE, &[ptr, var, storage::UNIFORM])
        }

        /// `uniform sampler2D <name>` using ids `base..base+5`.
        pub fn sampled_texture(self, base: u32, name: &str, set: u32, binding: u32) -> Self {
            let (float, image, sampled, ptr, var) = (base, base + 1, base + 2, base + 3, base + 4);
            self.name(var, name)
                .bind(var, set, binding)
                .op(22, &[float, 32])
                .op(op::TYPE_IMAGE, &[image, float, 1, 0, 0, 0, 1, 0])
                .op(op::TYPE_SAMPLED_IMAGE, &[sampled, image])
                .op(op::TYPE_POINTER, &[ptr, storage::UNIFORM_CONSTANT, sampled])
                .op(op::VARIABLE, &[ptr, var, storage::UNIFORM_CONSTANT])
        }

        /// `uniform sampler <name>` using ids `base..base+3`.
        pub fn sampler(self, base: u32, name: &str, set: u32, binding: u32) -> Self {
            let (ty, ptr, var) = (base, base + 1, base + 2);
            self.name(var, name)
                .bind(var, set, binding)
                .op(op::TYPE_SAMPLER, &[ty])
                .op(op::TYPE_POINTER, &[ptr, storage::UNIFORM_CONSTANT, ty])
                .op(op::VARIABLE, &[ptr, var, storage::UNIFORM_CONSTANT])
        }

        /// `uniform accelerationStructureEXT <name>` using ids `base..base+3`.
        pub fn accel(self, base: u32, name: &str, set: u32, binding: u32) -> Self {
            let (ty, ptr, var) = (base, base + 1, base + 2);
            self.name(var, name)
                .bind(var, set, binding)
                .op(op::TYPE_ACCELERATION_STRUCTURE_KHR, &[ty])
                .op(op::TYPE_POINTER, &[ptr, storage::UNIFORM_CONSTANT, ty])
                .op(op::VARIABLE, &[ptr, var, storage::UNIFORM_CONSTANT])
        }

        pub fn finish(self) -> Vec<u32> {
            self.words
        }
    }

    pub fn string_words(s: &str) -> Vec<u32> {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}
