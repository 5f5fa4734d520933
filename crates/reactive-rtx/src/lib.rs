//! Hardware ray tracing for the Reactive framework.
//!
//! Bottom-level structures are built from triangle meshes; top-level
//! structures place them through an instance buffer that can be rewritten
//! and refit in place. Requires a context built with ray tracing enabled.

pub mod acceleration;
pub mod geometry;
pub mod instance;

pub use acceleration::{
    accel_build_barrier, accel_trace_barrier, AccelContextExt, AccelState, BottomLevelAccel,
    BottomLevelAccelCreateInfo, TopLevelAccel, TopLevelAccelCreateInfo,
};
pub use geometry::{Geometry, TriangleGeometry};
pub use instance::{serialize_instances, AccelInstance, InstanceRecord};
