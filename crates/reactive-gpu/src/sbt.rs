//! Shader binding tables for ray tracing pipelines.
//!
//! A table holds one ray generation record, then the miss records, then the
//! hit group records. Every region starts on the shader group base
//! alignment and records inside a region are one aligned handle apart.

use crate::buffer::{Buffer, BufferCreateInfo};
use crate::capabilities::ShaderGroupProperties;
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::memory::{align_up, BufferUsage, MemoryUsage};
use ash::vk;

/// Byte layout of a shader binding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    handle_size: u64,
    handle_stride: u64,
    base_alignment: u64,
    miss_count: u32,
    hit_count: u32,
    raygen_size: u64,
    miss_size: u64,
    hit_size: u64,
}

impl SbtLayout {
    pub fn new(properties: &ShaderGroupProperties, miss_count: u32, hit_count: u32) -> Result<Self> {
        if properties.handle_size == 0 {
            return Err(GpuError::ExtensionNotSupported(
                "VK_KHR_ray_tracing_pipeline (no shader group handles)".to_string(),
            ));
        }

        let handle_size = u64::from(properties.handle_size);
        let base_alignment = u64::from(properties.base_alignment);
        let handle_stride = align_up(handle_size, u64::from(properties.handle_alignment));

        // The ray generation region must have size equal to its stride.
        let raygen_size = align_up(handle_stride, base_alignment);
        let miss_size = align_up(u64::from(miss_count) * handle_stride, base_alignment);
        let hit_size = align_up(u64::from(hit_count) * handle_stride, base_alignment);

        Ok(Self {
            handle_size,
            handle_stride,
            base_alignment,
            miss_count,
            hit_count,
            raygen_size,
            miss_size,
            hit_size,
        })
    }

    /// Shader groups in the pipeline: one ray generation group plus the
    /// miss and hit groups.
    pub const fn group_count(&self) -> u32 {
        1 + self.miss_count + self.hit_count
    }

    /// Bytes of tightly packed handles returned by the driver.
    pub const fn handle_data_size(&self) -> usize {
        self.handle_size as usize * self.group_count() as usize
    }

    pub const fn size(&self) -> u64 {
        self.raygen_size + self.miss_size + self.hit_size
    }

    pub const fn handle_stride(&self) -> u64 {
        self.handle_stride
    }

    pub const fn base_alignment(&self) -> u64 {
        self.base_alignment
    }

    /// Regions of a table starting at `address`, in ray generation, miss,
    /// hit and callable order. Empty regions are zeroed.
    pub fn regions(&self, address: vk::DeviceAddress) -> [vk::StridedDeviceAddressRegionKHR; 4] {
        let region = |offset: u64, stride: u64, size: u64| {
            if size == 0 {
                return vk::StridedDeviceAddressRegionKHR::default();
            }
            vk::StridedDeviceAddressRegionKHR {
                device_address: address + offset,
                stride,
                size,
            }
        };

        [
            region(0, self.raygen_size, self.raygen_size),
            region(self.raygen_size, self.handle_stride, self.miss_size),
            region(
                self.raygen_size + self.miss_size,
                self.handle_stride,
                self.hit_size,
            ),
            vk::StridedDeviceAddressRegionKHR::default(),
        ]
    }

    /// Scatter tightly packed group handles into table records.
    pub fn fill(&self, handles: &[u8]) -> Result<Vec<u8>> {
        if handles.len() != self.handle_data_size() {
            return Err(GpuError::InvalidState(format!(
                "Expected {} bytes of shader group handles, got {}",
                self.handle_data_size(),
                handles.len()
            )));
        }

        let miss_base = self.raygen_size;
        let hit_base = self.raygen_size + self.miss_size;
        let offsets = std::iter::once(0)
            .chain((0..u64::from(self.miss_count)).map(|i| miss_base + i * self.handle_stride))
            .chain((0..u64::from(self.hit_count)).map(|i| hit_base + i * self.handle_stride));

        let handle_size = self.handle_size as usize;
        let mut table = vec![0u8; self.size() as usize];
        for (handle, offset) in handles.chunks_exact(handle_size).zip(offsets) {
            let offset = offset as usize;
            table[offset..offset + handle_size].copy_from_slice(handle);
        }
        Ok(table)
    }
}

/// Host-visible shader binding table of one ray tracing pipeline.
pub struct ShaderBindingTable {
    buffer: Buffer,
    layout: SbtLayout,
    regions: [vk::StridedDeviceAddressRegionKHR; 4],
}

impl ShaderBindingTable {
    pub(crate) fn new(
        ctx: &GpuContext,
        pipeline: vk::Pipeline,
        layout: SbtLayout,
        debug_name: &str,
    ) -> Result<Self> {
        let loader = ctx.ray_tracing_pipeline_loader()?;
        let handles = unsafe {
            loader.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                layout.group_count(),
                layout.handle_data_size(),
            )
        }?;
        let table = layout.fill(&handles)?;

        // Over-allocated so the table can start on the base alignment.
        let buffer = ctx.create_buffer(&BufferCreateInfo {
            size: layout.size() + layout.base_alignment(),
            usage: BufferUsage::SHADER_BINDING_TABLE,
            memory: MemoryUsage::Host,
            data: None,
            debug_name,
        })?;
        let address = align_up(buffer.device_address(), layout.base_alignment());
        buffer.write_bytes(address - buffer.device_address(), &table)?;

        tracing::debug!(
            "Shader binding table '{}': {} group(s), {} bytes",
            debug_name,
            layout.group_count(),
            layout.size()
        );

        Ok(Self {
            regions: layout.regions(address),
            buffer,
            layout,
        })
    }

    pub fn raygen_region(&self) -> &vk::StridedDeviceAddressRegionKHR {
        &self.regions[0]
    }

    pub fn miss_region(&self) -> &vk::StridedDeviceAddressRegionKHR {
        &self.regions[1]
    }

    pub fn hit_region(&self) -> &vk::StridedDeviceAddressRegionKHR {
        &self.regions[2]
    }

    pub fn callable_region(&self) -> &vk::StridedDeviceAddressRegionKHR {
        &self.regions[3]
    }

    pub fn layout(&self) -> &SbtLayout {
        &self.layout
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }
}
