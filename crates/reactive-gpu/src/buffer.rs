//! Device buffers.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::memory::{BufferUsage, MemoryUsage};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::Allocation;

/// Parameters for [`GpuContext::create_buffer`].
#[derive(Debug, Clone, Copy)]
pub struct BufferCreateInfo<'a> {
    /// Size in bytes. Zero means "size of `data`".
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory: MemoryUsage,
    /// Initial contents, uploaded through a staging copy for device memory.
    pub data: Option<&'a [u8]>,
    pub debug_name: &'a str,
}

impl Default for BufferCreateInfo<'_> {
    fn default() -> Self {
        Self {
            size: 0,
            usage: BufferUsage::STORAGE,
            memory: MemoryUsage::Device,
            data: None,
            debug_name: "buffer",
        }
    }
}

/// A buffer and the memory bound to it.
pub struct Buffer {
    ctx: GpuContext,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
    memory: MemoryUsage,
    address: vk::DeviceAddress,
}

impl Buffer {
    pub(crate) fn new(ctx: GpuContext, info: &BufferCreateInfo<'_>) -> Result<Self> {
        let size = match (info.size, info.data) {
            (0, Some(data)) => data.len() as u64,
            (size, _) => size,
        };
        if size == 0 {
            return Err(GpuError::InvalidState(format!(
                "Buffer '{}' has zero size",
                info.debug_name
            )));
        }

        let mut usage = info.usage;
        if info.data.is_some() && !info.memory.is_host_visible() {
            usage |= vk::BufferUsageFlags::TRANSFER_DST;
        }

        let (buffer, allocation) =
            ctx.allocator()
                .lock()
                .allocate_buffer(size, usage, info.memory, info.debug_name)?;

        let address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let address_info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
            unsafe { ctx.device().get_buffer_device_address(&address_info) }
        } else {
            0
        };

        ctx.set_debug_name(buffer, info.debug_name);

        let this = Self {
            ctx,
            buffer,
            allocation: Some(allocation),
            size,
            memory: info.memory,
            address,
        };

        if let Some(data) = info.data {
            this.upload(data)?;
        }

        tracing::trace!("Created buffer '{}' ({} bytes)", info.debug_name, size);

        Ok(this)
    }

    fn upload(&self, data: &[u8]) -> Result<()> {
        if self.memory.is_host_visible() {
            return self.write_bytes(0, data);
        }

        let staging = self.ctx.create_buffer(&BufferCreateInfo {
            usage: BufferUsage::STAGING,
            memory: MemoryUsage::Host,
            data: Some(data),
            debug_name: "staging",
            ..Default::default()
        })?;

        self.ctx.one_time_submit(|cmd| {
            cmd.copy_buffer(staging.raw(), self.buffer, data.len() as u64);
            Ok(())
        })
    }

    pub fn raw(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn memory(&self) -> MemoryUsage {
        self.memory
    }

    /// Device address, or zero when the buffer was created without
    /// `SHADER_DEVICE_ADDRESS`.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.address
    }

    /// Descriptor info covering the whole buffer.
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo::default()
            .buffer(self.buffer)
            .offset(0)
            .range(vk::WHOLE_SIZE)
    }

    fn mapped_ptr(&self) -> Result<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(|p| p.as_ptr().cast::<u8>())
            .ok_or_else(|| GpuError::InvalidState("Buffer is not host visible".to_string()))
    }

    /// Write raw bytes at `offset` (host-visible memory only).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        check_range(offset, data.len(), self.size)?;
        let ptr = self.mapped_ptr()?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        Ok(())
    }

    /// Write typed data at `offset` (host-visible memory only).
    pub fn write<T: Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    /// Read `count` elements starting at byte `offset` (host-visible memory only).
    pub fn read<T: Pod>(&self, offset: u64, count: usize) -> Result<Vec<T>> {
        let mut out = vec![<T as bytemuck::Zeroable>::zeroed(); count];
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut out);
        check_range(offset, bytes.len(), self.size)?;
        let ptr = self.mapped_ptr()?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), bytes.as_mut_ptr(), bytes.len());
        }
        Ok(out)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.ctx.allocator().lock().free(allocation) {
                tracing::error!("Failed to free buffer memory: {e}");
            }
        }
        unsafe {
            self.ctx.device().destroy_buffer(self.buffer, None);
        }
    }
}

fn check_range(offset: u64, len: usize, size: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
    if end > size {
        return Err(GpuError::InvalidState(format!(
            "Range {offset}..{end} exceeds buffer size {size}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GpuContextBuilder;

    #[test]
    fn ranges_inside_the_buffer_are_accepted() {
        assert!(check_range(0, 64, 64).is_ok());
        assert!(check_range(32, 32, 64).is_ok());
        assert!(check_range(64, 0, 64).is_ok());
    }

    #[test]
    fn ranges_past_the_end_are_rejected() {
        assert!(check_range(33, 32, 64).is_err());
        assert!(check_range(u64::MAX, 1, 64).is_err());
    }

    #[test]
    fn defaults_describe_a_device_storage_buffer() {
        let info = BufferCreateInfo::default();
        assert_eq!(info.memory, MemoryUsage::Device);
        assert!(info.usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(info.data.is_none());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn host_buffer_round_trips_data() {
        let ctx = GpuContextBuilder::new().validation(false).build().unwrap();
        let values = [1u32, 2, 3, 4];
        let buffer = ctx
            .create_buffer(&BufferCreateInfo {
                memory: MemoryUsage::Host,
                data: Some(bytemuck::cast_slice(&values)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(buffer.size(), 16);
        assert_eq!(buffer.read::<u32>(4, 2).unwrap(), vec![2, 3]);
    }
}
