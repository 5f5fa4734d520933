//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
///
/// Every variant is fatal for the operation that produced it. Configuration
/// errors describe a host/shader contract violation and are never retried.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported or not enabled.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Shader module creation or compilation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// SPIR-V could not be parsed for reflection.
    #[error("Shader reflection failed: {0}")]
    Reflection(String),

    /// The same resource name was declared differently in two shader stages.
    #[error(
        "Binding '{name}' does not match across shader stages: \
         slot {existing_slot} ({existing_kind:?}) vs slot {slot} ({kind:?})"
    )]
    BindingMismatch {
        name: String,
        existing_slot: u32,
        existing_kind: vk::DescriptorType,
        slot: u32,
        kind: vk::DescriptorType,
    },

    /// Two differently named resources claim the same binding slot.
    #[error("Binding slot {slot} is claimed by both '{first}' and '{second}'")]
    SlotConflict {
        slot: u32,
        first: String,
        second: String,
    },

    /// A resource was assigned to a name no shader declares.
    #[error("Descriptor set has no binding named '{0}'")]
    UnknownBinding(String),

    /// The resources given to a binding are of the wrong class.
    #[error("Binding '{name}' expects {expected} descriptors, got {actual}")]
    DescriptorKindMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// More resources than the binding's array count.
    #[error("Binding '{name}' holds {capacity} descriptors, got {actual}")]
    DescriptorCountExceeded {
        name: String,
        capacity: u32,
        actual: usize,
    },

    /// Instance updates must keep the instance count the structure was built with.
    #[error("Instance count mismatch: built with {expected}, got {actual}")]
    InstanceCountMismatch { expected: usize, actual: usize },

    /// Geometry exceeds the maxima an acceleration structure was sized for.
    #[error("{what} count {requested} exceeds the maximum of {max}")]
    PrimitiveCountExceeded {
        what: &'static str,
        requested: u32,
        max: u32,
    },

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
