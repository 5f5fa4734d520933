//! GPU memory management.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;

/// Memory residency class of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryUsage {
    /// Device-local, not host visible. Initial data goes through a staging copy.
    #[default]
    Device,
    /// Host-visible memory the host writes and the device reads.
    Host,
    /// Device-local and host-visible where the heap allows it.
    DeviceHost,
}

impl MemoryUsage {
    /// The allocator location this class maps to.
    pub fn location(self) -> MemoryLocation {
        match self {
            Self::Device => MemoryLocation::GpuOnly,
            Self::Host | Self::DeviceHost => MemoryLocation::CpuToGpu,
        }
    }

    /// Whether the host can map allocations of this class.
    pub fn is_host_visible(self) -> bool {
        !matches!(self, Self::Device)
    }
}

/// Buffer usage presets.
pub struct BufferUsage;

const fn combine(a: vk::BufferUsageFlags, b: vk::BufferUsageFlags) -> vk::BufferUsageFlags {
    vk::BufferUsageFlags::from_raw(a.as_raw() | b.as_raw())
}

const ADDRESSABLE: vk::BufferUsageFlags = combine(
    vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
    vk::BufferUsageFlags::TRANSFER_DST,
);

impl BufferUsage {
    pub const UNIFORM: vk::BufferUsageFlags =
        combine(vk::BufferUsageFlags::UNIFORM_BUFFER, ADDRESSABLE);
    pub const STORAGE: vk::BufferUsageFlags =
        combine(vk::BufferUsageFlags::STORAGE_BUFFER, ADDRESSABLE);
    pub const STAGING: vk::BufferUsageFlags = vk::BufferUsageFlags::TRANSFER_SRC;
    pub const VERTEX: vk::BufferUsageFlags =
        combine(vk::BufferUsageFlags::VERTEX_BUFFER, ADDRESSABLE);
    pub const INDEX: vk::BufferUsageFlags =
        combine(vk::BufferUsageFlags::INDEX_BUFFER, ADDRESSABLE);
    /// Vertex, index and instance data read by acceleration structure builds.
    pub const ACCEL_INPUT: vk::BufferUsageFlags = combine(
        combine(
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        ),
        ADDRESSABLE,
    );
    /// Mesh buffers usable both for rasterization and as build inputs.
    pub const ACCEL_VERTEX: vk::BufferUsageFlags = combine(Self::VERTEX, Self::ACCEL_INPUT);
    pub const ACCEL_INDEX: vk::BufferUsageFlags = combine(Self::INDEX, Self::ACCEL_INPUT);
    pub const ACCEL_STORAGE: vk::BufferUsageFlags = combine(
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
        vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
    );
    pub const SCRATCH: vk::BufferUsageFlags = combine(
        vk::BufferUsageFlags::STORAGE_BUFFER,
        vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
    );
    pub const SHADER_BINDING_TABLE: vk::BufferUsageFlags = combine(
        vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR,
        vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
    );
    pub const READBACK: vk::BufferUsageFlags =
        combine(vk::BufferUsageFlags::TRANSFER_DST, vk::BufferUsageFlags::STORAGE_BUFFER);
}

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: ash::Device,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
        buffer_device_address: bool,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device: device.clone(),
        })
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))
    }

    /// Create a buffer and bind freshly allocated memory to it.
    pub fn allocate_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory: MemoryUsage,
        name: &str,
    ) -> Result<(vk::Buffer, Allocation)> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.inner()?.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: memory.location(),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(GpuError::AllocationFailed(format!("{name}: {e}")));
            }
        };

        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;
        }

        Ok((buffer, allocation))
    }

    /// Create an image and bind freshly allocated memory to it.
    pub fn allocate_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        memory: MemoryUsage,
        name: &str,
    ) -> Result<(vk::Image, Allocation)> {
        let image = unsafe { self.device.create_image(create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.inner()?.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: memory.location(),
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(GpuError::AllocationFailed(format!("{name}: {e}")));
            }
        };

        unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())?;
        }

        Ok((image, allocation))
    }

    /// Return an allocation to the allocator.
    pub fn free(&mut self, allocation: Allocation) -> Result<()> {
        self.inner()?
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Round `value` up to a multiple of `alignment` (a power of two, or zero).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn residency_classes_map_to_locations() {
        assert_eq!(MemoryUsage::Device.location(), MemoryLocation::GpuOnly);
        assert_eq!(MemoryUsage::Host.location(), MemoryLocation::CpuToGpu);
        assert!(!MemoryUsage::Device.is_host_visible());
        assert!(MemoryUsage::DeviceHost.is_host_visible());
    }

    #[test]
    fn presets_are_addressable() {
        for usage in [
            BufferUsage::ACCEL_INPUT,
            BufferUsage::ACCEL_STORAGE,
            BufferUsage::SCRATCH,
            BufferUsage::STORAGE,
        ] {
            assert!(usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
        }
        assert!(BufferUsage::ACCEL_VERTEX.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(BufferUsage::ACCEL_VERTEX
            .contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR));
    }

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 128), 0);
        assert_eq!(align_up(1, 128), 128);
        assert_eq!(align_up(256, 128), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(77, 0), 77);
    }
}
