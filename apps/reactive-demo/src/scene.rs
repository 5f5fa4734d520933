//! Demo geometry and instance placement.

use ash::vk;
use glam::{Mat4, Quat, Vec3};
use reactive_gpu::{Buffer, BufferCreateInfo, BufferUsage, GpuContext};
use reactive_rtx::{
    accel_build_barrier, AccelContextExt, AccelInstance, BottomLevelAccel,
    BottomLevelAccelCreateInfo,
};

/// Vertex and index buffers of one mesh plus its bottom-level structure.
pub struct Mesh {
    pub vertices: Buffer,
    pub indices: Buffer,
    pub vertex_count: u32,
    pub triangle_count: u32,
    pub blas: BottomLevelAccel,
}

impl Mesh {
    fn new(ctx: &GpuContext, name: &str, positions: &[[f32; 3]], indices: &[u32]) -> anyhow::Result<Self> {
        let vertex_count = u32::try_from(positions.len())?;
        let triangle_count = u32::try_from(indices.len() / 3)?;

        let vertices = ctx.create_buffer(&BufferCreateInfo {
            usage: BufferUsage::ACCEL_VERTEX,
            data: Some(bytemuck::cast_slice(positions)),
            debug_name: name,
            ..Default::default()
        })?;
        let indices = ctx.create_buffer(&BufferCreateInfo {
            usage: BufferUsage::ACCEL_INDEX,
            data: Some(bytemuck::cast_slice(indices)),
            debug_name: name,
            ..Default::default()
        })?;

        let blas = ctx.create_bottom_accel(&BottomLevelAccelCreateInfo {
            vertex_stride: std::mem::size_of::<[f32; 3]>() as u64,
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            max_vertex_count: vertex_count,
            max_triangle_count: triangle_count,
            debug_name: name,
            ..Default::default()
        })?;

        Ok(Self {
            vertices,
            indices,
            vertex_count,
            triangle_count,
            blas,
        })
    }
}

/// A triangle and a quad, each with a built BLAS.
pub struct Scene {
    pub triangle: Mesh,
    pub quad: Mesh,
}

impl Scene {
    pub fn new(ctx: &GpuContext) -> anyhow::Result<Self> {
        let triangle = Mesh::new(
            ctx,
            "triangle",
            &[[-0.5, -0.5, 0.0], [0.5, -0.5, 0.0], [0.0, 0.5, 0.0]],
            &[0, 1, 2],
        )?;
        let quad = Mesh::new(
            ctx,
            "quad",
            &[
                [-0.5, -0.5, 0.0],
                [0.5, -0.5, 0.0],
                [0.5, 0.5, 0.0],
                [-0.5, 0.5, 0.0],
            ],
            &[0, 1, 2, 0, 2, 3],
        )?;

        ctx.one_time_submit(|cmd| {
            for mesh in [&triangle, &quad] {
                mesh.blas.build(
                    cmd,
                    &mesh.vertices,
                    &mesh.indices,
                    mesh.vertex_count,
                    mesh.triangle_count,
                )?;
            }
            accel_build_barrier(cmd);
            Ok(())
        })?;

        Ok(Self { triangle, quad })
    }

    /// Three instances over the two meshes, turned by `angle` radians.
    pub fn instances(&self, angle: f32) -> [AccelInstance; 3] {
        let spin = Quat::from_rotation_y(angle);
        [
            AccelInstance::new(&self.triangle.blas)
                .with_transform(Mat4::from_rotation_translation(spin, Vec3::new(-1.5, 0.0, 0.0))),
            AccelInstance::new(&self.quad.blas)
                .with_transform(Mat4::from_scale_rotation_translation(
                    Vec3::splat(1.5),
                    spin.inverse(),
                    Vec3::ZERO,
                ))
                .with_custom_index(1),
            AccelInstance::new(&self.triangle.blas)
                .with_transform(Mat4::from_rotation_translation(spin, Vec3::new(1.5, 0.0, 0.0)))
                .with_custom_index(2),
        ]
    }
}
