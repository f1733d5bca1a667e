//! Images and image views.
//!
//! Images live in an [`ImageArena`] and views refer back to them by [`ImageKey`],
//! so moving an arena (or the render target owning it) never invalidates a view.

use ash::vk;
use nadir_rhi_derive::DeviceObject;
use slotmap::{new_key_type, SlotMap};

use crate::device::RenderDevice;
use crate::error::{RhiError, RhiResult};
use crate::utility::format_to_aspect_mask;

new_key_type! { pub struct ImageKey; }

/// Image descriptor for creating GPU images.
#[derive(Debug, Clone)]
pub struct ImageDesc {
    /// Image format.
    pub format: vk::Format,
    /// Image extent (width, height, depth).
    pub extent: vk::Extent3D,
    /// Image usage flags.
    pub usage: vk::ImageUsageFlags,
    /// Memory property flags for allocation.
    pub memory_flags: vk::MemoryPropertyFlags,
    /// Image type (1D, 2D, 3D).
    pub image_type: vk::ImageType,
    /// Number of mip levels.
    pub mip_levels: u32,
    /// Number of array layers.
    pub array_layers: u32,
    /// Sample count for multisampling.
    pub samples: vk::SampleCountFlags,
    /// Image tiling mode.
    pub tiling: vk::ImageTiling,
}

impl Default for ImageDesc {
    fn default() -> Self {
        Self {
            format: vk::Format::R8G8B8A8_UNORM,
            extent: vk::Extent3D {
                width: 1,
                height: 1,
                depth: 1,
            },
            usage: vk::ImageUsageFlags::SAMPLED,
            memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            image_type: vk::ImageType::TYPE_2D,
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
        }
    }
}

impl ImageDesc {
    /// Create a new 2D image descriptor.
    pub fn new_2d(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            ..Default::default()
        }
    }

    /// Create a color attachment descriptor.
    pub fn new_color_attachment(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self::new_2d(extent.width, extent.height, format)
            .with_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
    }

    /// Create a transient depth attachment descriptor.
    pub fn new_depth_attachment(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self::new_2d(extent.width, extent.height, format).with_usage(
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
        )
    }

    pub fn with_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_additional_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage |= usage;
        self
    }

    pub fn with_image_type(mut self, image_type: vk::ImageType) -> Self {
        self.image_type = image_type;
        self
    }

    pub fn with_mip_levels(mut self, levels: u32) -> Self {
        self.mip_levels = levels;
        self
    }

    pub fn with_array_layers(mut self, layers: u32) -> Self {
        self.array_layers = layers;
        self
    }

    pub fn with_samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }
}

/// A GPU image, either owned (allocated through the backend) or borrowed from a swapchain.
#[DeviceObject]
pub struct Image {
    handle: vk::Image,
    desc: ImageDesc,
    /// Swapchain images belong to the swapchain and are never destroyed here.
    owned: bool,
}

impl Image {
    pub fn new(device: &RenderDevice, desc: &ImageDesc) -> RhiResult<Self> {
        let handle = device.backend().create_image(desc)?;
        Ok(Self {
            handle,
            desc: desc.clone(),
            owned: true,
            device: device.backend().clone(),
        })
    }

    /// Wrap a swapchain image (does not own the image or its memory).
    pub fn from_swapchain_image(
        device: &RenderDevice,
        handle: vk::Image,
        extent: vk::Extent3D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        let desc = ImageDesc {
            format,
            extent,
            usage,
            memory_flags: vk::MemoryPropertyFlags::empty(),
            ..Default::default()
        };
        Self {
            handle,
            desc,
            owned: false,
            device: device.backend().clone(),
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::Image { self.handle }

    #[inline]
    pub fn desc(&self) -> &ImageDesc { &self.desc }

    #[inline]
    pub fn format(&self) -> vk::Format { self.desc.format }

    #[inline]
    pub fn extent(&self) -> vk::Extent3D { self.desc.extent }

    #[inline]
    pub fn usage(&self) -> vk::ImageUsageFlags { self.desc.usage }

    #[inline]
    pub fn sample_count(&self) -> vk::SampleCountFlags { self.desc.samples }

    #[inline]
    pub fn image_type(&self) -> vk::ImageType { self.desc.image_type }

    #[inline]
    pub fn mip_levels(&self) -> u32 { self.desc.mip_levels }

    #[inline]
    pub fn array_layers(&self) -> u32 { self.desc.array_layers }

    /// Get the aspect flags for this image based on its format.
    #[inline]
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        format_to_aspect_mask(self.desc.format)
    }

    pub fn is_swapchain_image(&self) -> bool {
        !self.owned
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if self.owned {
            self.device.destroy_image(self.handle);
        }
    }
}

/// Stable-slot storage for images referenced by views.
#[derive(Default)]
pub struct ImageArena {
    images: SlotMap<ImageKey, Image>,
}

impl ImageArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, image: Image) -> ImageKey {
        self.images.insert(image)
    }

    pub fn get(&self, key: ImageKey) -> RhiResult<&Image> {
        self.images.get(key).ok_or(RhiError::UnknownImage)
    }

    pub fn remove(&mut self, key: ImageKey) -> Option<Image> {
        self.images.remove(key)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ImageKey, &Image)> {
        self.images.iter()
    }
}

/// A view onto a subresource range of an image stored in an [`ImageArena`].
#[DeviceObject]
pub struct ImageView {
    handle: vk::ImageView,
    image: ImageKey,
    image_handle: vk::Image,
    format: vk::Format,
    view_type: vk::ImageViewType,
    subresource_range: vk::ImageSubresourceRange,
}

impl ImageView {
    /// Create a view of `image`.
    ///
    /// `format == UNDEFINED` takes the image's format; a zero mip or layer count
    /// takes the image's full count.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &RenderDevice,
        arena: &ImageArena,
        image: ImageKey,
        view_type: vk::ImageViewType,
        format: vk::Format,
        base_mip_level: u32,
        base_array_layer: u32,
        mip_count: u32,
        layer_count: u32,
    ) -> RhiResult<Self> {
        let source = arena.get(image)?;

        let format = if format == vk::Format::UNDEFINED { source.format() } else { format };
        let level_count = if mip_count == 0 { source.mip_levels() } else { mip_count };
        let layer_count = if layer_count == 0 { source.array_layers() } else { layer_count };

        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: format_to_aspect_mask(format),
            base_mip_level,
            level_count,
            base_array_layer,
            layer_count,
        };

        let create_info = vk::ImageViewCreateInfo::default()
            .image(source.handle())
            .view_type(view_type)
            .format(format)
            .subresource_range(subresource_range);

        let handle = device.backend().create_image_view(&create_info)?;

        Ok(Self {
            handle,
            image,
            image_handle: source.handle(),
            format,
            view_type,
            subresource_range,
            device: device.backend().clone(),
        })
    }

    /// Full-resource 2D view with the image's own format.
    pub fn new_2d(device: &RenderDevice, arena: &ImageArena, image: ImageKey) -> RhiResult<Self> {
        Self::new(device, arena, image, vk::ImageViewType::TYPE_2D, vk::Format::UNDEFINED, 0, 0, 0, 0)
    }

    #[inline]
    pub fn handle(&self) -> vk::ImageView { self.handle }

    #[inline]
    pub fn image_key(&self) -> ImageKey { self.image }

    #[inline]
    pub fn image_handle(&self) -> vk::Image { self.image_handle }

    #[inline]
    pub fn format(&self) -> vk::Format { self.format }

    #[inline]
    pub fn view_type(&self) -> vk::ImageViewType { self.view_type }

    #[inline]
    pub fn subresource_range(&self) -> vk::ImageSubresourceRange { self.subresource_range }

    pub fn image<'a>(&self, arena: &'a ImageArena) -> RhiResult<&'a Image> {
        arena.get(self.image)
    }

    /// Extent of the viewed base mip level.
    pub fn mip_extent(&self, arena: &ImageArena) -> RhiResult<vk::Extent2D> {
        let extent = self.image(arena)?.extent();
        let mip = self.subresource_range.base_mip_level;
        Ok(vk::Extent2D {
            width: (extent.width >> mip).max(1),
            height: (extent.height >> mip).max(1),
        })
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        self.device.destroy_image_view(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::null::NullBackend;
    use std::sync::Arc;

    fn device() -> (Arc<NullBackend>, RenderDevice) {
        let backend = Arc::new(NullBackend::new());
        let device = RenderDevice::new(backend.clone()).unwrap();
        (backend, device)
    }

    #[test]
    fn view_inherits_format_and_counts() {
        let (_backend, device) = device();
        let mut arena = ImageArena::new();
        let desc = ImageDesc::new_2d(64, 32, vk::Format::D32_SFLOAT)
            .with_mip_levels(4)
            .with_array_layers(2);
        let key = arena.insert(Image::new(&device, &desc).unwrap());

        let view = ImageView::new_2d(&device, &arena, key).unwrap();
        assert_eq!(view.format(), vk::Format::D32_SFLOAT);
        assert_eq!(view.subresource_range().level_count, 4);
        assert_eq!(view.subresource_range().layer_count, 2);
        assert_eq!(view.subresource_range().aspect_mask, vk::ImageAspectFlags::DEPTH);
        assert_eq!(view.image_handle(), arena.get(key).unwrap().handle());
    }

    #[test]
    fn mip_extent_halves_per_level() {
        let (_backend, device) = device();
        let mut arena = ImageArena::new();
        let desc = ImageDesc::new_2d(64, 3, vk::Format::R8G8B8A8_UNORM).with_mip_levels(3);
        let key = arena.insert(Image::new(&device, &desc).unwrap());

        let view = ImageView::new(
            &device, &arena, key, vk::ImageViewType::TYPE_2D, vk::Format::UNDEFINED, 2, 0, 1, 1,
        )
        .unwrap();
        assert_eq!(view.mip_extent(&arena).unwrap(), vk::Extent2D { width: 16, height: 1 });
    }

    #[test]
    fn swapchain_images_are_not_destroyed() {
        let (backend, device) = device();
        let owned = Image::new(&device, &ImageDesc::new_2d(8, 8, vk::Format::R8G8B8A8_UNORM)).unwrap();
        let borrowed = Image::from_swapchain_image(
            &device,
            vk::Image::null(),
            vk::Extent3D { width: 8, height: 8, depth: 1 },
            vk::Format::B8G8R8A8_SRGB,
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
        );
        assert!(borrowed.is_swapchain_image());

        assert_eq!(backend.live_objects().images, 1);
        drop(borrowed);
        assert_eq!(backend.live_objects().images, 1);
        drop(owned);
        assert_eq!(backend.live_objects().images, 0);
    }

    #[test]
    fn removed_key_is_unknown() {
        let (_backend, device) = device();
        let mut arena = ImageArena::new();
        let key = arena.insert(Image::new(&device, &ImageDesc::default()).unwrap());
        assert!(arena.remove(key).is_some());
        assert!(matches!(ImageView::new_2d(&device, &arena, key), Err(RhiError::UnknownImage)));
    }
}
