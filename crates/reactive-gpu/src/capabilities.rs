//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Device extensions needed for acceleration structures and ray queries.
pub fn ray_tracing_extensions() -> [&'static CStr; 4] {
    [
        ash::khr::acceleration_structure::NAME,
        ash::khr::deferred_host_operations::NAME,
        ash::khr::ray_tracing_pipeline::NAME,
        ash::khr::ray_query::NAME,
    ]
}

/// Shader group handle layout of a ray tracing pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShaderGroupProperties {
    pub handle_size: u32,
    pub handle_alignment: u32,
    /// Alignment of each shader binding table region.
    pub base_alignment: u32,
    pub max_ray_recursion_depth: u32,
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,

    /// Buffer device address support
    pub supports_buffer_device_address: bool,
    /// All of [`ray_tracing_extensions`] are available
    pub supports_ray_tracing: bool,

    /// Nanoseconds per timestamp tick
    pub timestamp_period: f32,
    /// Timestamps are supported on graphics and compute queues
    pub supports_timestamps: bool,

    /// Required alignment of acceleration structure scratch addresses.
    /// Zero when ray tracing is unsupported.
    pub min_scratch_offset_alignment: u32,

    /// Ray tracing pipeline limits. Zero when ray tracing is unsupported.
    pub shader_group: ShaderGroupProperties,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,

    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let supports_ray_tracing = ray_tracing_extensions()
            .iter()
            .all(|ext| ext.to_str().is_ok_and(|e| available_extensions.contains(e)));

        let (min_scratch_offset_alignment, shader_group) = if supports_ray_tracing {
            let mut accel_properties =
                vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
            let mut rt_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
            let mut properties2 = vk::PhysicalDeviceProperties2::default()
                .push_next(&mut accel_properties)
                .push_next(&mut rt_properties);
            instance.get_physical_device_properties2(physical_device, &mut properties2);
            (
                accel_properties.min_acceleration_structure_scratch_offset_alignment,
                ShaderGroupProperties {
                    handle_size: rt_properties.shader_group_handle_size,
                    handle_alignment: rt_properties.shader_group_handle_alignment,
                    base_alignment: rt_properties.shader_group_base_alignment,
                    max_ray_recursion_depth: rt_properties.max_ray_recursion_depth,
                },
            )
        } else {
            (0, ShaderGroupProperties::default())
        };

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let api_version = properties.api_version;
        let has_vulkan_1_3 = is_vulkan_1_3(api_version);

        Self {
            vendor,
            device_name,
            api_version,
            supports_buffer_device_address: has_vulkan_1_3
                || available_extensions.contains("VK_KHR_buffer_device_address"),
            supports_ray_tracing,
            timestamp_period: properties.limits.timestamp_period,
            supports_timestamps: properties.limits.timestamp_compute_and_graphics == vk::TRUE,
            min_scratch_offset_alignment,
            shader_group,
            device_local_memory_mb,
            available_extensions,
        }
    }

    /// Check if the GPU meets the framework's minimum requirements.
    pub fn meets_requirements(&self, ray_tracing: bool) -> bool {
        if !is_vulkan_1_3(self.api_version) {
            return false;
        }

        // Acceleration structure inputs and scratch are addressed by device address
        if !self.supports_buffer_device_address {
            return false;
        }

        !ray_tracing || self.supports_ray_tracing
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - ray tracing: {}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            if self.supports_ray_tracing { "yes" } else { "no" },
        )
    }
}

fn is_vulkan_1_3(api_version: u32) -> bool {
    let major = vk::api_version_major(api_version);
    let minor = vk::api_version_minor(api_version);
    major > 1 || (major == 1 && minor >= 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(api_version: u32, ray_tracing: bool) -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Nvidia,
            device_name: "test".to_string(),
            api_version,
            supports_buffer_device_address: true,
            supports_ray_tracing: ray_tracing,
            timestamp_period: 1.0,
            supports_timestamps: true,
            min_scratch_offset_alignment: 128,
            shader_group: ShaderGroupProperties::default(),
            device_local_memory_mb: 4096,
            available_extensions: HashSet::new(),
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn requirements_check_version_and_ray_tracing() {
        let v1_2 = vk::make_api_version(0, 1, 2, 0);
        let v1_3 = vk::make_api_version(0, 1, 3, 0);

        assert!(!capabilities(v1_2, true).meets_requirements(false));
        assert!(capabilities(v1_3, false).meets_requirements(false));
        assert!(!capabilities(v1_3, false).meets_requirements(true));
        assert!(capabilities(v1_3, true).meets_requirements(true));
    }
}
