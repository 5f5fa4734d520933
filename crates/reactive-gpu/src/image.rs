//! 2D images with a view, optional sampler and tracked layout.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::memory::MemoryUsage;
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use parking_lot::Mutex;

/// Parameters for [`GpuContext::create_image`].
#[derive(Debug, Clone, Copy)]
pub struct ImageCreateInfo<'a> {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub memory: MemoryUsage,
    /// Create a linear-filtering sampler alongside the view.
    pub sampler: bool,
    pub debug_name: &'a str,
}

impl Default for ImageCreateInfo<'_> {
    fn default() -> Self {
        Self {
            extent: vk::Extent2D::default(),
            format: vk::Format::R8G8B8A8_UNORM,
            usage: vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
            memory: MemoryUsage::Device,
            sampler: false,
            debug_name: "image",
        }
    }
}

pub struct Image {
    ctx: GpuContext,
    image: vk::Image,
    view: vk::ImageView,
    sampler: Option<vk::Sampler>,
    allocation: Option<Allocation>,
    format: vk::Format,
    extent: vk::Extent2D,
    layout: Mutex<vk::ImageLayout>,
}

impl Image {
    pub(crate) fn new(ctx: GpuContext, info: &ImageCreateInfo<'_>) -> Result<Self> {
        if info.extent.width == 0 || info.extent.height == 0 {
            return Err(GpuError::InvalidState(format!(
                "Image '{}' has an empty extent",
                info.debug_name
            )));
        }

        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(info.format)
            .extent(vk::Extent3D {
                width: info.extent.width,
                height: info.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let (image, allocation) =
            ctx.allocator()
                .lock()
                .allocate_image(&create_info, info.memory, info.debug_name)?;

        let range = subresource_range(info.format);
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(info.format)
            .subresource_range(range);
        let view = unsafe { ctx.device().create_image_view(&view_info, None)? };

        let sampler = if info.sampler {
            let sampler_info = vk::SamplerCreateInfo::default()
                .mag_filter(vk::Filter::LINEAR)
                .min_filter(vk::Filter::LINEAR)
                .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
                .address_mode_u(vk::SamplerAddressMode::REPEAT)
                .address_mode_v(vk::SamplerAddressMode::REPEAT)
                .address_mode_w(vk::SamplerAddressMode::REPEAT)
                .max_lod(vk::LOD_CLAMP_NONE);
            Some(unsafe { ctx.device().create_sampler(&sampler_info, None)? })
        } else {
            None
        };

        ctx.set_debug_name(image, info.debug_name);
        ctx.set_debug_name(view, info.debug_name);

        Ok(Self {
            ctx,
            image,
            view,
            sampler,
            allocation: Some(allocation),
            format: info.format,
            extent: info.extent,
            layout: Mutex::new(vk::ImageLayout::UNDEFINED),
        })
    }

    pub fn raw(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn sampler(&self) -> Option<vk::Sampler> {
        self.sampler
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Layout the image is in once all recorded transitions have executed.
    pub fn layout(&self) -> vk::ImageLayout {
        *self.layout.lock()
    }

    pub(crate) fn swap_layout(&self, new_layout: vk::ImageLayout) -> vk::ImageLayout {
        std::mem::replace(&mut *self.layout.lock(), new_layout)
    }

    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        subresource_range(self.format)
    }

    /// Descriptor info in the image's current layout.
    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo::default()
            .image_view(self.view)
            .sampler(self.sampler.unwrap_or_default())
            .image_layout(self.layout())
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            if let Some(sampler) = self.sampler {
                self.ctx.device().destroy_sampler(sampler, None);
            }
            self.ctx.device().destroy_image_view(self.view, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.ctx.allocator().lock().free(allocation) {
                tracing::error!("Failed to free image memory: {e}");
            }
        }
        unsafe {
            self.ctx.device().destroy_image(self.image, None);
        }
    }
}

fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

fn subresource_range(format: vk::Format) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspect_for_format(format))
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_formats_use_depth_aspect() {
        assert_eq!(
            aspect_for_format(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert!(aspect_for_format(vk::Format::D24_UNORM_S8_UINT)
            .contains(vk::ImageAspectFlags::STENCIL));
        assert_eq!(
            aspect_for_format(vk::Format::R8G8B8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
    }
}
