use ash::vk;
use std::sync::Arc;

use super::{DeviceMemory, DeviceObject, MemoryBacked};
use crate::device::HarnessDevice;
use crate::error::{Result, VkResultExt};

/// Parameters for a 2D image, defaulting to a single-sampled, single-level
/// color attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSpec {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub tiling: vk::ImageTiling,
    pub array_layers: u32,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            extent: vk::Extent2D {
                width: 32,
                height: 32,
            },
            format: vk::Format::B8G8R8A8_UNORM,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            tiling: vk::ImageTiling::OPTIMAL,
            array_layers: 1,
            mip_levels: 1,
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }
}

impl ImageSpec {
    pub fn new(extent: vk::Extent2D, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            extent,
            format,
            usage,
            ..Self::default()
        }
    }

    pub fn create_info(&self) -> vk::ImageCreateInfo {
        vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(self.format)
            .extent(vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            })
            .mip_levels(self.mip_levels)
            .array_layers(self.array_layers)
            .samples(self.samples)
            .tiling(self.tiling)
            .usage(self.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .build()
    }
}

/// Aspect mask implied by a format.
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Image view info covering the first mip level and layer of `image`.
pub fn safe_sane_image_view_info(
    image: vk::Image,
    format: vk::Format,
    aspect_mask: vk::ImageAspectFlags,
) -> vk::ImageViewCreateInfo {
    vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .build()
}

/// A 2D image with its own memory allocation.
pub struct Image {
    device: Arc<HarnessDevice>,
    raw: vk::Image,
    spec: ImageSpec,
    memory: Option<DeviceMemory>,
}

impl Image {
    /// Creates the image and binds device-local memory to it.
    pub fn new(device: &Arc<HarnessDevice>, spec: ImageSpec) -> Result<Self> {
        Self::with_memory(device, spec, vk::MemoryPropertyFlags::DEVICE_LOCAL)
    }

    pub fn with_memory(
        device: &Arc<HarnessDevice>,
        spec: ImageSpec,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let mut image = Self::unbound(device, spec)?;
        let requirements = unsafe { device.get_image_memory_requirements(image.raw) };
        let memory = DeviceMemory::allocate(device, &requirements, properties)?;
        unsafe { device.bind_image_memory(image.raw, memory.handle(), 0) }
            .vk_context("vkBindImageMemory")?;
        image.memory = Some(memory);
        Ok(image)
    }

    /// Creates the image without binding memory.
    pub fn unbound(device: &Arc<HarnessDevice>, spec: ImageSpec) -> Result<Self> {
        let info = spec.create_info();
        let raw = unsafe { device.create_image(&info, None) }.vk_context("vkCreateImage")?;
        device.track(raw, "image");
        Ok(Self {
            device: Arc::clone(device),
            raw,
            spec,
            memory: None,
        })
    }

    pub fn handle(&self) -> vk::Image {
        self.raw
    }

    pub fn spec(&self) -> &ImageSpec {
        &self.spec
    }

    pub fn format(&self) -> vk::Format {
        self.spec.format
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_for_format(self.spec.format)
    }

    /// A view over the first level and layer with the format's aspect.
    pub fn create_view(&self) -> Result<ImageView> {
        ImageView::new(
            &self.device,
            &safe_sane_image_view_info(self.raw, self.spec.format, self.aspect()),
        )
    }
}

impl DeviceObject for Image {
    type Handle = vk::Image;

    fn handle(&self) -> vk::Image {
        self.raw
    }

    fn device(&self) -> &Arc<HarnessDevice> {
        &self.device
    }
}

impl MemoryBacked for Image {
    fn memory(&self) -> vk::DeviceMemory {
        self.memory
            .as_ref()
            .map_or(vk::DeviceMemory::null(), DeviceMemory::handle)
    }

    fn memory_size(&self) -> vk::DeviceSize {
        self.memory.as_ref().map_or(0, DeviceMemory::size)
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ash::vk::Handle;
        f.debug_struct("Image")
            .field("handle", &self.raw.as_raw())
            .field("spec", &self.spec)
            .field("memory", &self.memory)
            .finish()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe { self.device.destroy_image(self.raw, None) };
        self.device.untrack(self.raw);
    }
}

super::device_object!(
    /// An image view.
    ImageView,
    vk::ImageView,
    destroy_image_view,
    "image view"
);

impl ImageView {
    pub fn new(device: &Arc<HarnessDevice>, info: &vk::ImageViewCreateInfo) -> Result<Self> {
        let raw = unsafe { device.create_image_view(info, None) }.vk_context("vkCreateImageView")?;
        Ok(Self::from_raw(device, raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_spec_is_single_sample_color_attachment() {
        let info = ImageSpec::default().create_info();
        assert_eq!(info.image_type, vk::ImageType::TYPE_2D);
        assert_eq!(info.extent.depth, 1);
        assert_eq!(info.samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(info.usage, vk::ImageUsageFlags::COLOR_ATTACHMENT);
        assert_eq!(info.initial_layout, vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn aspects_follow_format() {
        assert_eq!(aspect_for_format(vk::Format::R8G8B8A8_UNORM), vk::ImageAspectFlags::COLOR);
        assert_eq!(aspect_for_format(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn view_info_covers_first_level_and_layer() {
        let info = safe_sane_image_view_info(
            vk::Image::null(),
            vk::Format::B8G8R8A8_UNORM,
            vk::ImageAspectFlags::COLOR,
        );
        assert_eq!(info.view_type, vk::ImageViewType::TYPE_2D);
        assert_eq!(info.subresource_range.level_count, 1);
        assert_eq!(info.subresource_range.layer_count, 1);
        assert_eq!(info.components.r, vk::ComponentSwizzle::IDENTITY);
    }
}
