//! Bottom- and top-level acceleration structures for hardware ray tracing.
//!
//! Both levels are sized once at creation and then built into the same
//! backing store. Builds are recorded into caller command buffers; their
//! completion is observed only through the submission's fence.

use crate::geometry::{Geometry, TriangleGeometry};
use crate::instance::{serialize_instances, AccelInstance, InstanceRecord};
use ash::vk;
use parking_lot::Mutex;
use reactive_gpu::{
    align_up, Buffer, BufferCreateInfo, BufferUsage, CommandBuffer, DescriptorInfo,
    DescriptorResource, GpuContext, GpuError, MemoryUsage, Result,
};

/// Lifecycle of an acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelState {
    Uninitialized,
    SizesQueried,
    BuffersAllocated,
    Built,
    /// Inputs changed since the last build; a build or refit is pending.
    Updated,
}

/// Tracks the state and the input counts of the last build.
///
/// Top-level structures have no vertices and always pass zero.
#[derive(Debug)]
struct BuildTracker {
    state: AccelState,
    primitives: u32,
    vertices: u32,
}

impl BuildTracker {
    const fn new() -> Self {
        Self {
            state: AccelState::Uninitialized,
            primitives: 0,
            vertices: 0,
        }
    }

    fn advance(&mut self, expected: AccelState, next: AccelState) -> Result<()> {
        if self.state != expected {
            return Err(GpuError::InvalidState(format!(
                "Acceleration structure is {:?}, expected {expected:?}",
                self.state
            )));
        }
        self.state = next;
        Ok(())
    }

    fn build(&mut self, primitives: u32, vertices: u32) -> Result<()> {
        match self.state {
            AccelState::BuffersAllocated | AccelState::Built | AccelState::Updated => {
                self.state = AccelState::Built;
                self.primitives = primitives;
                self.vertices = vertices;
                Ok(())
            }
            state => Err(GpuError::InvalidState(format!(
                "Cannot build an acceleration structure that is {state:?}"
            ))),
        }
    }

    fn refit(
        &mut self,
        primitives: u32,
        vertices: u32,
        build_flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> Result<()> {
        if !build_flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE) {
            return Err(GpuError::InvalidState(
                "Refit requires the ALLOW_UPDATE build flag".to_string(),
            ));
        }
        if !matches!(self.state, AccelState::Built | AccelState::Updated) {
            return Err(GpuError::InvalidState(format!(
                "Cannot refit an acceleration structure that is {:?}",
                self.state
            )));
        }
        if primitives != self.primitives {
            return Err(GpuError::InvalidState(format!(
                "Refit with {primitives} primitives, last build had {}",
                self.primitives
            )));
        }
        if vertices != self.vertices {
            return Err(GpuError::InvalidState(format!(
                "Refit with {vertices} vertices, last build had {}",
                self.vertices
            )));
        }
        self.state = AccelState::Built;
        Ok(())
    }

    fn mark_updated(&mut self) -> Result<()> {
        match self.state {
            AccelState::Built | AccelState::Updated => {
                self.state = AccelState::Updated;
                Ok(())
            }
            state => Err(GpuError::InvalidState(format!(
                "Cannot update inputs of an acceleration structure that is {state:?}"
            ))),
        }
    }
}

/// Reject geometry larger than the structure was sized for.
fn check_count(what: &'static str, requested: u32, max: u32) -> Result<()> {
    if requested > max {
        return Err(GpuError::PrimitiveCountExceeded {
            what,
            requested,
            max,
        });
    }
    Ok(())
}

/// Reject an instance list whose length differs from the sized instance count.
fn check_instance_count(expected: u32, actual: usize) -> Result<()> {
    if actual != expected as usize {
        return Err(GpuError::InstanceCountMismatch {
            expected: expected as usize,
            actual,
        });
    }
    Ok(())
}

fn query_build_sizes(
    ctx: &GpuContext,
    geometry: &Geometry,
    geometry_flags: vk::GeometryFlagsKHR,
    build_flags: vk::BuildAccelerationStructureFlagsKHR,
    max_primitives: u32,
) -> Result<vk::AccelerationStructureBuildSizesInfoKHR<'static>> {
    let loader = ctx.acceleration_structure_loader()?;
    let raw = geometry.to_vk(geometry_flags);
    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(geometry.structure_type())
        .flags(build_flags)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(std::slice::from_ref(&raw));

    let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
    unsafe {
        loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &[max_primitives],
            &mut sizes,
        );
    }
    Ok(sizes)
}

/// Backing store, scratch memory and handle shared by both levels.
struct AccelStorage {
    ctx: GpuContext,
    handle: vk::AccelerationStructureKHR,
    address: vk::DeviceAddress,
    storage: Buffer,
    /// Over-allocated so `scratch_address` can be aligned.
    scratch: Buffer,
    scratch_address: vk::DeviceAddress,
}

impl AccelStorage {
    fn new(
        ctx: &GpuContext,
        ty: vk::AccelerationStructureTypeKHR,
        sizes: &vk::AccelerationStructureBuildSizesInfoKHR<'_>,
        debug_name: &str,
    ) -> Result<Self> {
        let loader = ctx.acceleration_structure_loader()?;

        let storage = ctx.create_buffer(&BufferCreateInfo {
            size: sizes.acceleration_structure_size,
            usage: BufferUsage::ACCEL_STORAGE,
            memory: MemoryUsage::Device,
            data: None,
            debug_name,
        })?;

        let alignment = u64::from(ctx.capabilities().min_scratch_offset_alignment);
        let scratch_size = sizes.build_scratch_size.max(sizes.update_scratch_size);
        let scratch = ctx.create_buffer(&BufferCreateInfo {
            size: scratch_size + alignment,
            usage: BufferUsage::SCRATCH,
            memory: MemoryUsage::Device,
            data: None,
            debug_name: "acceleration structure scratch",
        })?;
        let scratch_address = align_up(scratch.device_address(), alignment);

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(storage.raw())
            .offset(0)
            .size(sizes.acceleration_structure_size)
            .ty(ty);
        let handle = unsafe { loader.create_acceleration_structure(&create_info, None)? };

        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
        let address = unsafe { loader.get_acceleration_structure_device_address(&address_info) };

        ctx.set_debug_name(handle, debug_name);

        Ok(Self {
            ctx: ctx.clone(),
            handle,
            address,
            storage,
            scratch,
            scratch_address,
        })
    }

    fn record(
        &self,
        cmd: &CommandBuffer,
        geometry: &Geometry,
        geometry_flags: vk::GeometryFlagsKHR,
        build_flags: vk::BuildAccelerationStructureFlagsKHR,
        mode: vk::BuildAccelerationStructureModeKHR,
        primitive_count: u32,
    ) -> Result<()> {
        let loader = self.ctx.acceleration_structure_loader()?;
        let raw = geometry.to_vk(geometry_flags);

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(geometry.structure_type())
            .flags(build_flags)
            .mode(mode)
            .dst_acceleration_structure(self.handle)
            .geometries(std::slice::from_ref(&raw))
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: self.scratch_address,
            });
        if mode == vk::BuildAccelerationStructureModeKHR::UPDATE {
            build_info = build_info.src_acceleration_structure(self.handle);
        }

        let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(primitive_count)
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0);

        unsafe {
            loader.cmd_build_acceleration_structures(
                cmd.raw(),
                &[build_info],
                &[std::slice::from_ref(&build_range)],
            );
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.storage.size()
    }

    fn scratch_size(&self) -> u64 {
        self.scratch.size()
    }
}

impl Drop for AccelStorage {
    fn drop(&mut self) {
        if let Ok(loader) = self.ctx.acceleration_structure_loader() {
            unsafe { loader.destroy_acceleration_structure(self.handle, None) };
        }
    }
}

/// Parameters for [`AccelContextExt::create_bottom_accel`].
#[derive(Debug, Clone, Copy)]
pub struct BottomLevelAccelCreateInfo<'a> {
    /// Bytes between consecutive vertex positions.
    pub vertex_stride: u64,
    pub vertex_format: vk::Format,
    pub max_vertex_count: u32,
    pub max_triangle_count: u32,
    pub geometry_flags: vk::GeometryFlagsKHR,
    pub build_flags: vk::BuildAccelerationStructureFlagsKHR,
    pub debug_name: &'a str,
}

impl Default for BottomLevelAccelCreateInfo<'_> {
    fn default() -> Self {
        Self {
            vertex_stride: 12,
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            max_vertex_count: 0,
            max_triangle_count: 0,
            geometry_flags: vk::GeometryFlagsKHR::OPAQUE,
            build_flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
            debug_name: "bottom level accel",
        }
    }
}

/// Triangle-mesh acceleration structure.
///
/// Sized for `max_vertex_count` vertices and `max_triangle_count` triangles
/// with 32-bit indices; may be rebuilt with any mesh within those maxima.
pub struct BottomLevelAccel {
    storage: AccelStorage,
    vertex_stride: u64,
    vertex_format: vk::Format,
    max_vertex_count: u32,
    max_triangle_count: u32,
    geometry_flags: vk::GeometryFlagsKHR,
    build_flags: vk::BuildAccelerationStructureFlagsKHR,
    tracker: Mutex<BuildTracker>,
}

impl BottomLevelAccel {
    fn new(ctx: &GpuContext, info: &BottomLevelAccelCreateInfo<'_>) -> Result<Self> {
        let mut tracker = BuildTracker::new();

        let sizing = Geometry::Triangles(TriangleGeometry::new(
            0,
            info.vertex_stride,
            info.vertex_format,
            info.max_vertex_count,
            0,
        ));
        let sizes = query_build_sizes(
            ctx,
            &sizing,
            info.geometry_flags,
            info.build_flags,
            info.max_triangle_count,
        )?;
        tracker.advance(AccelState::Uninitialized, AccelState::SizesQueried)?;

        let storage = AccelStorage::new(
            ctx,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            &sizes,
            info.debug_name,
        )?;
        tracker.advance(AccelState::SizesQueried, AccelState::BuffersAllocated)?;

        tracing::debug!(
            "Created BLAS '{}': {} bytes, {} scratch bytes, up to {} triangles",
            info.debug_name,
            storage.size(),
            storage.scratch_size(),
            info.max_triangle_count
        );

        Ok(Self {
            storage,
            vertex_stride: info.vertex_stride,
            vertex_format: info.vertex_format,
            max_vertex_count: info.max_vertex_count,
            max_triangle_count: info.max_triangle_count,
            geometry_flags: info.geometry_flags,
            build_flags: info.build_flags,
            tracker: Mutex::new(tracker),
        })
    }

    /// Record a full build from the given mesh.
    ///
    /// Both buffers need device addresses and must stay alive until the
    /// command buffer has executed.
    pub fn build(
        &self,
        cmd: &CommandBuffer,
        vertex_buffer: &Buffer,
        index_buffer: &Buffer,
        vertex_count: u32,
        triangle_count: u32,
    ) -> Result<()> {
        let geometry = self.geometry(vertex_buffer, index_buffer, vertex_count, triangle_count)?;
        let mut tracker = self.tracker.lock();
        self.storage.record(
            cmd,
            &geometry,
            self.geometry_flags,
            self.build_flags,
            vk::BuildAccelerationStructureModeKHR::BUILD,
            triangle_count,
        )?;
        tracker.build(triangle_count, vertex_count)
    }

    /// Record an in-place update after vertex positions moved.
    ///
    /// The vertex and triangle counts must match the last build.
    pub fn refit(
        &self,
        cmd: &CommandBuffer,
        vertex_buffer: &Buffer,
        index_buffer: &Buffer,
        vertex_count: u32,
        triangle_count: u32,
    ) -> Result<()> {
        let geometry = self.geometry(vertex_buffer, index_buffer, vertex_count, triangle_count)?;
        let mut tracker = self.tracker.lock();
        tracker.refit(triangle_count, vertex_count, self.build_flags)?;
        self.storage.record(
            cmd,
            &geometry,
            self.geometry_flags,
            self.build_flags,
            vk::BuildAccelerationStructureModeKHR::UPDATE,
            triangle_count,
        )
    }

    fn geometry(
        &self,
        vertex_buffer: &Buffer,
        index_buffer: &Buffer,
        vertex_count: u32,
        triangle_count: u32,
    ) -> Result<Geometry> {
        check_count("Vertex", vertex_count, self.max_vertex_count)?;
        check_count("Triangle", triangle_count, self.max_triangle_count)?;
        if vertex_buffer.device_address() == 0 || index_buffer.device_address() == 0 {
            return Err(GpuError::InvalidState(
                "BLAS inputs need SHADER_DEVICE_ADDRESS usage".to_string(),
            ));
        }

        Ok(Geometry::Triangles(TriangleGeometry::new(
            vertex_buffer.device_address(),
            self.vertex_stride,
            self.vertex_format,
            vertex_count,
            index_buffer.device_address(),
        )))
    }

    pub fn raw(&self) -> vk::AccelerationStructureKHR {
        self.storage.handle
    }

    /// Address referenced by top-level instances.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.storage.address
    }

    pub fn state(&self) -> AccelState {
        self.tracker.lock().state
    }

    pub fn max_triangle_count(&self) -> u32 {
        self.max_triangle_count
    }

    pub fn max_vertex_count(&self) -> u32 {
        self.max_vertex_count
    }
}

/// Parameters for [`AccelContextExt::create_top_accel`].
#[derive(Debug, Clone, Copy)]
pub struct TopLevelAccelCreateInfo<'a> {
    pub instances: &'a [AccelInstance],
    pub geometry_flags: vk::GeometryFlagsKHR,
    pub build_flags: vk::BuildAccelerationStructureFlagsKHR,
    pub debug_name: &'a str,
}

impl Default for TopLevelAccelCreateInfo<'_> {
    fn default() -> Self {
        Self {
            instances: &[],
            geometry_flags: vk::GeometryFlagsKHR::OPAQUE,
            build_flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
            debug_name: "top level accel",
        }
    }
}

/// Instance acceleration structure with a host-visible instance buffer.
///
/// The instance count is fixed at creation.
pub struct TopLevelAccel {
    storage: AccelStorage,
    instance_buffer: Buffer,
    instance_count: u32,
    geometry_flags: vk::GeometryFlagsKHR,
    build_flags: vk::BuildAccelerationStructureFlagsKHR,
    tracker: Mutex<BuildTracker>,
}

impl TopLevelAccel {
    fn new(ctx: &GpuContext, info: &TopLevelAccelCreateInfo<'_>) -> Result<Self> {
        let instance_count = u32::try_from(info.instances.len()).map_err(|_| {
            GpuError::InvalidState(format!("{} instances", info.instances.len()))
        })?;
        let mut tracker = BuildTracker::new();

        let records = serialize_instances(info.instances);
        let instance_buffer = ctx.create_buffer(&BufferCreateInfo {
            size: (records.len().max(1) * InstanceRecord::SIZE) as u64,
            usage: BufferUsage::ACCEL_INPUT,
            memory: MemoryUsage::Host,
            data: None,
            debug_name: "instance buffer",
        })?;
        if !records.is_empty() {
            instance_buffer.write(0, &records)?;
        }

        let geometry = Geometry::Instances {
            address: instance_buffer.device_address(),
        };
        let sizes = query_build_sizes(
            ctx,
            &geometry,
            info.geometry_flags,
            info.build_flags,
            instance_count,
        )?;
        tracker.advance(AccelState::Uninitialized, AccelState::SizesQueried)?;

        let storage = AccelStorage::new(
            ctx,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            &sizes,
            info.debug_name,
        )?;
        tracker.advance(AccelState::SizesQueried, AccelState::BuffersAllocated)?;

        let tlas = Self {
            storage,
            instance_buffer,
            instance_count,
            geometry_flags: info.geometry_flags,
            build_flags: info.build_flags,
            tracker: Mutex::new(tracker),
        };

        ctx.one_time_submit(|cmd| {
            accel_build_barrier(cmd);
            tlas.build(cmd)
        })?;

        tracing::info!(
            "Built TLAS '{}' with {} instance(s), {} bytes",
            info.debug_name,
            instance_count,
            tlas.storage.size()
        );

        Ok(tlas)
    }

    /// Overwrite the instance buffer in place. Records no build.
    ///
    /// Call [`build`](Self::build) or [`refit`](Self::refit) afterwards. The
    /// buffer must not be read by a pending build while it is written.
    pub fn update_instances(&self, instances: &[AccelInstance]) -> Result<()> {
        check_instance_count(self.instance_count, instances.len())?;

        let mut tracker = self.tracker.lock();
        tracker.mark_updated()?;
        if !instances.is_empty() {
            self.instance_buffer.write(0, &serialize_instances(instances))?;
        }
        Ok(())
    }

    /// Record a full rebuild from the current instance buffer.
    pub fn build(&self, cmd: &CommandBuffer) -> Result<()> {
        let mut tracker = self.tracker.lock();
        self.record(cmd, vk::BuildAccelerationStructureModeKHR::BUILD)?;
        tracker.build(self.instance_count, 0)
    }

    /// Record an in-place update from the current instance buffer.
    pub fn refit(&self, cmd: &CommandBuffer) -> Result<()> {
        let mut tracker = self.tracker.lock();
        tracker.refit(self.instance_count, 0, self.build_flags)?;
        self.record(cmd, vk::BuildAccelerationStructureModeKHR::UPDATE)
    }

    fn record(&self, cmd: &CommandBuffer, mode: vk::BuildAccelerationStructureModeKHR) -> Result<()> {
        let geometry = Geometry::Instances {
            address: self.instance_buffer.device_address(),
        };
        self.storage.record(
            cmd,
            &geometry,
            self.geometry_flags,
            self.build_flags,
            mode,
            self.instance_count,
        )
    }

    /// Records currently stored in the instance buffer.
    pub fn instance_records(&self) -> Result<Vec<InstanceRecord>> {
        self.instance_buffer.read(0, self.instance_count as usize)
    }

    pub fn raw(&self) -> vk::AccelerationStructureKHR {
        self.storage.handle
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.storage.address
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn state(&self) -> AccelState {
        self.tracker.lock().state
    }
}

impl DescriptorResource for TopLevelAccel {
    fn descriptor(&self) -> DescriptorInfo {
        DescriptorInfo::AccelerationStructure(self.storage.handle)
    }
}

/// Make earlier acceleration structure builds visible to later builds in
/// the same queue, e.g. bottom-level builds before the top-level build.
pub fn accel_build_barrier(cmd: &CommandBuffer) {
    cmd.memory_barrier(
        vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
        vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
            | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
    );
}

/// Make acceleration structure builds visible to ray queries and ray
/// tracing shaders.
pub fn accel_trace_barrier(cmd: &CommandBuffer) {
    cmd.memory_barrier(
        vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
        vk::PipelineStageFlags2::COMPUTE_SHADER
            | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR
            | vk::PipelineStageFlags2::FRAGMENT_SHADER,
        vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
    );
}

/// Acceleration structure factories on the GPU context.
pub trait AccelContextExt {
    /// Size and allocate a BLAS. Does not build it.
    fn create_bottom_accel(&self, info: &BottomLevelAccelCreateInfo<'_>) -> Result<BottomLevelAccel>;

    /// Upload the instances and build a TLAS, waiting for the build.
    ///
    /// Every referenced BLAS must already be built.
    fn create_top_accel(&self, info: &TopLevelAccelCreateInfo<'_>) -> Result<TopLevelAccel>;
}

impl AccelContextExt for GpuContext {
    fn create_bottom_accel(&self, info: &BottomLevelAccelCreateInfo<'_>) -> Result<BottomLevelAccel> {
        BottomLevelAccel::new(self, info)
    }

    fn create_top_accel(&self, info: &TopLevelAccelCreateInfo<'_>) -> Result<TopLevelAccel> {
        TopLevelAccel::new(self, info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reactive_gpu::GpuContextBuilder;

    const UPDATABLE: vk::BuildAccelerationStructureFlagsKHR =
        vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;

    fn allocated() -> BuildTracker {
        let mut tracker = BuildTracker::new();
        tracker
            .advance(AccelState::Uninitialized, AccelState::SizesQueried)
            .unwrap();
        tracker
            .advance(AccelState::SizesQueried, AccelState::BuffersAllocated)
            .unwrap();
        tracker
    }

    #[test]
    fn creation_steps_run_in_order() {
        let mut tracker = BuildTracker::new();
        assert!(tracker
            .advance(AccelState::SizesQueried, AccelState::BuffersAllocated)
            .is_err());
        assert_eq!(tracker.state, AccelState::Uninitialized);
        assert_eq!(allocated().state, AccelState::BuffersAllocated);
    }

    #[test]
    fn build_then_update_then_refit() {
        let mut tracker = allocated();
        tracker.build(3, 0).unwrap();
        assert_eq!(tracker.state, AccelState::Built);

        tracker.mark_updated().unwrap();
        assert_eq!(tracker.state, AccelState::Updated);
        tracker.mark_updated().unwrap();

        tracker.refit(3, 0, UPDATABLE).unwrap();
        assert_eq!(tracker.state, AccelState::Built);

        tracker.mark_updated().unwrap();
        tracker.build(3, 0).unwrap();
        assert_eq!(tracker.state, AccelState::Built);
    }

    #[test]
    fn refit_needs_a_prior_build() {
        let mut tracker = allocated();
        assert!(matches!(
            tracker.refit(1, 3, UPDATABLE),
            Err(GpuError::InvalidState(_))
        ));
        assert!(tracker.mark_updated().is_err());
        assert!(BuildTracker::new().build(1, 3).is_err());
    }

    #[test]
    fn refit_needs_allow_update() {
        let mut tracker = allocated();
        tracker.build(2, 4).unwrap();
        let err = tracker
            .refit(2, 4, vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .unwrap_err();
        assert!(err.to_string().contains("ALLOW_UPDATE"));
        assert_eq!(tracker.state, AccelState::Built);
    }

    #[test]
    fn refit_keeps_primitive_count() {
        let mut tracker = allocated();
        tracker.build(4, 6).unwrap();
        assert!(tracker.refit(5, 6, UPDATABLE).is_err());
        tracker.build(5, 6).unwrap();
        tracker.refit(5, 6, UPDATABLE).unwrap();
    }

    #[test]
    fn refit_keeps_vertex_count() {
        let mut tracker = allocated();
        tracker.build(2, 4).unwrap();

        let err = tracker.refit(2, 3, UPDATABLE).unwrap_err();
        assert!(err.to_string().contains("3 vertices"));
        let err = tracker.refit(2, 5, UPDATABLE).unwrap_err();
        assert!(err.to_string().contains("last build had 4"));
        assert_eq!(tracker.state, AccelState::Built);

        tracker.refit(2, 4, UPDATABLE).unwrap();
        tracker.build(2, 5).unwrap();
        tracker.refit(2, 5, UPDATABLE).unwrap();
    }

    #[test]
    fn instance_count_must_match() {
        assert!(check_instance_count(3, 3).is_ok());
        assert!(check_instance_count(0, 0).is_ok());
        for actual in [2, 4] {
            assert!(matches!(
                check_instance_count(3, actual),
                Err(GpuError::InstanceCountMismatch { expected: 3, actual: a }) if a == actual
            ));
        }
    }

    #[test]
    fn counts_up_to_the_maximum_pass() {
        assert!(check_count("Triangle", 0, 8).is_ok());
        assert!(check_count("Triangle", 8, 8).is_ok());
        assert!(matches!(
            check_count("Triangle", 9, 8),
            Err(GpuError::PrimitiveCountExceeded {
                what: "Triangle",
                requested: 9,
                max: 8
            })
        ));
    }

    #[test]
    fn default_flags_allow_refit() {
        let blas = BottomLevelAccelCreateInfo::default();
        let tlas = TopLevelAccelCreateInfo::default();
        assert!(blas.build_flags.contains(UPDATABLE));
        assert!(tlas.build_flags.contains(UPDATABLE));
        assert_eq!(blas.geometry_flags, vk::GeometryFlagsKHR::OPAQUE);
        assert_eq!(blas.vertex_stride, 12);
    }

    fn triangle_buffers(ctx: &GpuContext) -> (Buffer, Buffer) {
        let vertices: [f32; 9] = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let indices: [u32; 3] = [0, 1, 2];
        let vertex_buffer = ctx
            .create_buffer(&BufferCreateInfo {
                usage: BufferUsage::ACCEL_VERTEX,
                data: Some(bytemuck::cast_slice(&vertices)),
                ..Default::default()
            })
            .unwrap();
        let index_buffer = ctx
            .create_buffer(&BufferCreateInfo {
                usage: BufferUsage::ACCEL_INDEX,
                data: Some(bytemuck::cast_slice(&indices)),
                ..Default::default()
            })
            .unwrap();
        (vertex_buffer, index_buffer)
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn blas_rejects_oversized_mesh() {
        let ctx = GpuContextBuilder::new()
            .validation(false)
            .ray_tracing(true)
            .build()
            .unwrap();
        let blas = ctx
            .create_bottom_accel(&BottomLevelAccelCreateInfo {
                max_vertex_count: 3,
                max_triangle_count: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(blas.state(), AccelState::BuffersAllocated);
        assert_ne!(blas.device_address(), 0);

        let (vertex_buffer, index_buffer) = triangle_buffers(&ctx);
        ctx.one_time_submit(|cmd| {
            assert!(matches!(
                blas.build(cmd, &vertex_buffer, &index_buffer, 3, 2),
                Err(GpuError::PrimitiveCountExceeded { .. })
            ));
            blas.build(cmd, &vertex_buffer, &index_buffer, 3, 1)
        })
        .unwrap();
        assert_eq!(blas.state(), AccelState::Built);

        ctx.one_time_submit(|cmd| {
            assert!(matches!(
                blas.refit(cmd, &vertex_buffer, &index_buffer, 2, 1),
                Err(GpuError::InvalidState(_))
            ));
            blas.refit(cmd, &vertex_buffer, &index_buffer, 3, 1)
        })
        .unwrap();
        assert_eq!(blas.state(), AccelState::Built);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn tlas_instance_updates_keep_count() {
        use glam::{Mat4, Vec3};

        let ctx = GpuContextBuilder::new()
            .validation(false)
            .ray_tracing(true)
            .build()
            .unwrap();
        let info = BottomLevelAccelCreateInfo {
            max_vertex_count: 3,
            max_triangle_count: 1,
            ..Default::default()
        };
        let first = ctx.create_bottom_accel(&info).unwrap();
        let second = ctx.create_bottom_accel(&info).unwrap();
        let (vertex_buffer, index_buffer) = triangle_buffers(&ctx);
        ctx.one_time_submit(|cmd| {
            first.build(cmd, &vertex_buffer, &index_buffer, 3, 1)?;
            second.build(cmd, &vertex_buffer, &index_buffer, 3, 1)
        })
        .unwrap();

        let instances = [
            AccelInstance::new(&first),
            AccelInstance::new(&second),
            AccelInstance::new(&first),
        ];
        let tlas = ctx
            .create_top_accel(&TopLevelAccelCreateInfo {
                instances: &instances,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(tlas.state(), AccelState::Built);

        let moved: Vec<_> = instances
            .iter()
            .enumerate()
            .map(|(i, instance)| {
                instance.with_transform(Mat4::from_translation(Vec3::new(i as f32, 0.0, 0.0)))
            })
            .collect();
        tlas.update_instances(&moved).unwrap();
        assert_eq!(tlas.instance_count(), 3);
        assert_eq!(tlas.state(), AccelState::Updated);
        assert_eq!(tlas.instance_records().unwrap(), serialize_instances(&moved));

        assert!(matches!(
            tlas.update_instances(&moved[..2]),
            Err(GpuError::InstanceCountMismatch {
                expected: 3,
                actual: 2
            })
        ));

        ctx.one_time_submit(|cmd| tlas.refit(cmd)).unwrap();
        assert_eq!(tlas.state(), AccelState::Built);
    }
}
