//! Geometry descriptions fed to acceleration structure builds.

use ash::vk;

/// Indexed triangle mesh addressed by device addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub vertex_address: vk::DeviceAddress,
    pub vertex_stride: u64,
    pub vertex_format: vk::Format,
    /// Highest vertex index referenced by the index buffer.
    pub max_vertex: u32,
    pub index_address: vk::DeviceAddress,
    pub index_type: vk::IndexType,
}

impl TriangleGeometry {
    /// Geometry with `vertex_count` vertices and 32-bit indices.
    ///
    /// The addresses may be zero when only querying build sizes.
    pub fn new(
        vertex_address: vk::DeviceAddress,
        vertex_stride: u64,
        vertex_format: vk::Format,
        vertex_count: u32,
        index_address: vk::DeviceAddress,
    ) -> Self {
        Self {
            vertex_address,
            vertex_stride,
            vertex_format,
            max_vertex: vertex_count.saturating_sub(1),
            index_address,
            index_type: vk::IndexType::UINT32,
        }
    }
}

/// Input of a single-geometry acceleration structure build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Geometry {
    Triangles(TriangleGeometry),
    /// Tightly packed array of 64-byte instance records.
    Instances { address: vk::DeviceAddress },
}

impl Geometry {
    pub const fn structure_type(&self) -> vk::AccelerationStructureTypeKHR {
        match self {
            Self::Triangles(_) => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            Self::Instances { .. } => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }

    pub fn to_vk(&self, flags: vk::GeometryFlagsKHR) -> vk::AccelerationStructureGeometryKHR<'static> {
        match self {
            Self::Triangles(triangles) => vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .flags(flags)
                .geometry(vk::AccelerationStructureGeometryDataKHR {
                    triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                        .vertex_format(triangles.vertex_format)
                        .vertex_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: triangles.vertex_address,
                        })
                        .vertex_stride(triangles.vertex_stride)
                        .max_vertex(triangles.max_vertex)
                        .index_type(triangles.index_type)
                        .index_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: triangles.index_address,
                        }),
                }),
            Self::Instances { address } => vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .flags(flags)
                .geometry(vk::AccelerationStructureGeometryDataKHR {
                    instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                        .array_of_pointers(false)
                        .data(vk::DeviceOrHostAddressConstKHR {
                            device_address: *address,
                        }),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_vertex_is_last_index() {
        let triangles = TriangleGeometry::new(0, 12, vk::Format::R32G32B32_SFLOAT, 3, 0);
        assert_eq!(triangles.max_vertex, 2);
        assert_eq!(triangles.index_type, vk::IndexType::UINT32);

        let empty = TriangleGeometry::new(0, 12, vk::Format::R32G32B32_SFLOAT, 0, 0);
        assert_eq!(empty.max_vertex, 0);
    }

    #[test]
    fn geometry_kind_selects_level() {
        let triangles = Geometry::Triangles(TriangleGeometry::new(
            0x1000,
            12,
            vk::Format::R32G32B32_SFLOAT,
            4,
            0x2000,
        ));
        let instances = Geometry::Instances { address: 0x3000 };

        assert_eq!(
            triangles.structure_type(),
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL
        );
        assert_eq!(
            instances.structure_type(),
            vk::AccelerationStructureTypeKHR::TOP_LEVEL
        );

        let raw = triangles.to_vk(vk::GeometryFlagsKHR::OPAQUE);
        assert_eq!(raw.geometry_type, vk::GeometryTypeKHR::TRIANGLES);
        assert_eq!(raw.flags, vk::GeometryFlagsKHR::OPAQUE);
        let data = unsafe { raw.geometry.triangles };
        assert_eq!(unsafe { data.vertex_data.device_address }, 0x1000);
        assert_eq!(data.max_vertex, 3);

        let raw = instances.to_vk(vk::GeometryFlagsKHR::empty());
        assert_eq!(raw.geometry_type, vk::GeometryTypeKHR::INSTANCES);
        assert_eq!(unsafe { raw.geometry.instances.data.device_address }, 0x3000);
    }
}
