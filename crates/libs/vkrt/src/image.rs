use std::sync::{Arc, Mutex};

use anyhow::Result;
use ash::vk;
use gpu_allocator::vulkan::AllocationScheme;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, Allocator},
    MemoryLocation,
};

use crate::{device::Device, Context};

/// Bytes per texel for the formats the backend actually creates. Anything
/// else is a fatal configuration error; extend the table when a new format
/// is introduced.
pub fn format_pixel_size(format: vk::Format) -> Result<vk::DeviceSize> {
    match format {
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM => Ok(4),
        vk::Format::R32G32B32A32_SFLOAT => Ok(16),
        _ => Err(anyhow::anyhow!("unhandled image format {format:?}")),
    }
}

pub struct Image {
    device: Arc<Device>,
    allocator: Arc<Mutex<Allocator>>,
    pub(crate) inner: vk::Image,
    allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
}

pub struct ImageView {
    device: Arc<Device>,
    pub(crate) inner: vk::ImageView,
}

impl Image {
    pub(crate) fn new_2d(
        device: Arc<Device>,
        allocator: Arc<Mutex<Allocator>>,
        usage: vk::ImageUsageFlags,
        memory_location: MemoryLocation,
        format: vk::Format,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        // Fail on unsupported formats before any allocation happens.
        format_pixel_size(format)?;

        let extent = vk::Extent3D {
            width,
            height,
            depth: 1,
        };

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let inner = unsafe { device.inner.create_image(&image_info, None)? };
        let requirements = unsafe { device.inner.get_image_memory_requirements(inner) };

        let allocation = allocator.lock().unwrap().allocate(&AllocationCreateDesc {
            name: "image",
            requirements,
            location: memory_location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe {
            device
                .inner
                .bind_image_memory(inner, allocation.memory(), allocation.offset())?
        };

        Ok(Self {
            device,
            allocator,
            inner,
            allocation: Some(allocation),
            format,
            extent,
        })
    }

    pub fn create_image_view(&self) -> Result<ImageView> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(self.inner)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let inner = unsafe { self.device.inner.create_image_view(&view_info, None)? };

        Ok(ImageView {
            device: self.device.clone(),
            inner,
        })
    }

    pub fn pixel_size(&self) -> vk::DeviceSize {
        // The constructor already rejected unsupported formats.
        format_pixel_size(self.format).unwrap()
    }

    pub fn linear_size(&self) -> vk::DeviceSize {
        self.extent.width as vk::DeviceSize * self.extent.height as vk::DeviceSize
            * self.pixel_size()
    }
}

impl Context {
    /// Images are always device-local; there is no host-visible image path.
    pub fn create_image(
        &self,
        usage: vk::ImageUsageFlags,
        format: vk::Format,
        width: u32,
        height: u32,
    ) -> Result<Image> {
        Image::new_2d(
            self.device.clone(),
            self.allocator.clone(),
            usage,
            MemoryLocation::GpuOnly,
            format,
            width,
            height,
        )
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_image(self.inner, None) };
        self.allocator
            .lock()
            .unwrap()
            .free(self.allocation.take().unwrap())
            .unwrap();
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_image_view(self.inner, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_size_covers_backend_formats() {
        assert_eq!(format_pixel_size(vk::Format::R8G8B8A8_UNORM).unwrap(), 4);
        assert_eq!(format_pixel_size(vk::Format::B8G8R8A8_UNORM).unwrap(), 4);
        assert_eq!(
            format_pixel_size(vk::Format::R32G32B32A32_SFLOAT).unwrap(),
            16
        );
    }

    #[test]
    fn pixel_size_rejects_unknown_formats() {
        assert!(format_pixel_size(vk::Format::D32_SFLOAT).is_err());
        assert!(format_pixel_size(vk::Format::BC7_UNORM_BLOCK).is_err());
    }
}
