//! Render targets: a set of same-sized 2D images and their views.

use std::sync::Arc;

use ash::vk;

use crate::device::RenderDevice;
use crate::error::{RhiError, RhiResult};
use crate::image::{Image, ImageArena, ImageDesc, ImageView};
use crate::render_pass::Attachment;

/// Builds the render target for one swapchain (or offscreen) image.
pub type CreateFunc = Arc<dyn Fn(&RenderDevice, Image) -> RhiResult<RenderTarget> + Send + Sync>;

pub struct RenderTarget {
    extent: vk::Extent2D,
    // Views go before the images they look at.
    views: Vec<ImageView>,
    images: ImageArena,
    attachments: Vec<Attachment>,
    input_attachments: Vec<u32>,
    output_attachments: Vec<u32>,
}

impl RenderTarget {
    /// Take ownership of `images` and create a full 2D view of each.
    pub fn from_images(device: &RenderDevice, images: Vec<Image>) -> RhiResult<Self> {
        let Some(first) = images.first() else {
            return Err(RhiError::InvalidRenderTarget("no images given".into()));
        };
        let extent = vk::Extent2D {
            width: first.extent().width,
            height: first.extent().height,
        };

        for image in &images {
            if image.image_type() != vk::ImageType::TYPE_2D {
                return Err(RhiError::InvalidRenderTarget(format!(
                    "image type {:?} is not 2D",
                    image.image_type()
                )));
            }
            if image.extent().width != extent.width || image.extent().height != extent.height {
                return Err(RhiError::InvalidRenderTarget(format!(
                    "extent {}x{} differs from {}x{}",
                    image.extent().width,
                    image.extent().height,
                    extent.width,
                    extent.height
                )));
            }
        }

        let attachments = images
            .iter()
            .map(|image| Attachment::new(image.format(), image.sample_count(), image.usage()))
            .collect();

        let mut arena = ImageArena::new();
        let keys: Vec<_> = images.into_iter().map(|image| arena.insert(image)).collect();
        let views = keys
            .into_iter()
            .map(|key| ImageView::new_2d(device, &arena, key))
            .collect::<RhiResult<Vec<_>>>()?;

        Ok(Self {
            extent,
            views,
            images: arena,
            attachments,
            input_attachments: Vec::new(),
            output_attachments: vec![0],
        })
    }

    /// Wrap caller-made views of images in `images`; every view's base mip must share one extent.
    pub fn from_views(images: ImageArena, views: Vec<ImageView>) -> RhiResult<Self> {
        let Some(first) = views.first() else {
            return Err(RhiError::InvalidRenderTarget("no views given".into()));
        };
        let extent = first.mip_extent(&images)?;

        let mut attachments = Vec::with_capacity(views.len());
        for view in &views {
            let mip_extent = view.mip_extent(&images)?;
            if mip_extent != extent {
                return Err(RhiError::InvalidRenderTarget(format!(
                    "view extent {}x{} differs from {}x{}",
                    mip_extent.width, mip_extent.height, extent.width, extent.height
                )));
            }
            let image = view.image(&images)?;
            attachments.push(Attachment::new(image.format(), image.sample_count(), image.usage()));
        }

        Ok(Self {
            extent,
            views,
            images,
            attachments,
            input_attachments: Vec::new(),
            output_attachments: vec![0],
        })
    }

    /// Color target from the given image plus a transient depth buffer of the same extent.
    pub fn default_create_func() -> CreateFunc {
        Arc::new(|device: &RenderDevice, color: Image| {
            let extent = vk::Extent2D {
                width: color.extent().width,
                height: color.extent().height,
            };
            let depth_format = device.suitable_depth_format(false)?;
            let depth = Image::new(device, &ImageDesc::new_depth_attachment(extent, depth_format))?;
            RenderTarget::from_images(device, vec![color, depth])
        })
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D { self.extent }

    #[inline]
    pub fn views(&self) -> &[ImageView] { &self.views }

    #[inline]
    pub fn images(&self) -> &ImageArena { &self.images }

    #[inline]
    pub fn attachments(&self) -> &[Attachment] { &self.attachments }

    pub fn set_input_attachments(&mut self, input: Vec<u32>) {
        self.input_attachments = input;
    }

    #[inline]
    pub fn input_attachments(&self) -> &[u32] { &self.input_attachments }

    pub fn set_output_attachments(&mut self, output: Vec<u32>) {
        self.output_attachments = output;
    }

    #[inline]
    pub fn output_attachments(&self) -> &[u32] { &self.output_attachments }

    /// Record the layout attachment `index` will be in when the next render pass begins.
    ///
    /// # Panics
    ///
    /// If `index` is not an attachment of this target.
    pub fn set_layout(&mut self, index: usize, layout: vk::ImageLayout) {
        self.attachments[index].initial_layout = layout;
    }

    pub fn layout(&self, index: usize) -> vk::ImageLayout {
        self.attachments[index].initial_layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::null::NullBackend;

    fn device() -> (Arc<NullBackend>, RenderDevice) {
        let backend = Arc::new(NullBackend::new());
        let device = RenderDevice::new(backend.clone()).unwrap();
        (backend, device)
    }

    fn color(device: &RenderDevice, width: u32, height: u32) -> Image {
        let desc = ImageDesc::new_color_attachment(vk::Extent2D { width, height }, vk::Format::R8G8B8A8_SRGB);
        Image::new(device, &desc).unwrap()
    }

    #[test]
    fn default_target_has_color_and_depth() {
        let (backend, device) = device();
        let create = RenderTarget::default_create_func();
        let target = create(&device, color(&device, 320, 200)).unwrap();

        assert_eq!(target.extent(), vk::Extent2D { width: 320, height: 200 });
        assert_eq!(target.attachments().len(), 2);
        assert_eq!(target.views().len(), 2);
        assert_eq!(target.attachments()[1].format, vk::Format::D32_SFLOAT);
        assert_eq!(target.output_attachments(), &[0]);
        assert!(target.input_attachments().is_empty());

        drop(target);
        let live = backend.live_objects();
        assert_eq!(live.images, 0);
        assert_eq!(live.image_views, 0);
    }

    #[test]
    fn mismatched_extents_are_rejected() {
        let (_backend, device) = device();
        let images = vec![color(&device, 64, 64), color(&device, 32, 64)];
        assert!(matches!(
            RenderTarget::from_images(&device, images),
            Err(RhiError::InvalidRenderTarget(_))
        ));
    }

    #[test]
    fn non_2d_images_are_rejected() {
        let (_backend, device) = device();
        let desc = ImageDesc::new_2d(16, 16, vk::Format::R8G8B8A8_UNORM).with_image_type(vk::ImageType::TYPE_3D);
        let image = Image::new(&device, &desc).unwrap();
        assert!(RenderTarget::from_images(&device, vec![image]).is_err());
        assert!(RenderTarget::from_images(&device, Vec::new()).is_err());
    }

    #[test]
    fn views_of_matching_mips_are_accepted() {
        let (_backend, device) = device();
        let mut arena = ImageArena::new();
        let big = arena.insert(Image::new(&device, &ImageDesc::new_2d(64, 64, vk::Format::R8G8B8A8_UNORM).with_mip_levels(2)).unwrap());
        let small = arena.insert(Image::new(&device, &ImageDesc::new_2d(32, 32, vk::Format::R8G8B8A8_UNORM)).unwrap());

        let views = vec![
            ImageView::new(&device, &arena, big, vk::ImageViewType::TYPE_2D, vk::Format::UNDEFINED, 1, 0, 1, 1).unwrap(),
            ImageView::new_2d(&device, &arena, small).unwrap(),
        ];
        let target = RenderTarget::from_views(arena, views).unwrap();
        assert_eq!(target.extent(), vk::Extent2D { width: 32, height: 32 });
    }

    #[test]
    fn layouts_are_tracked_per_attachment() {
        let (_backend, device) = device();
        let mut target = RenderTarget::from_images(&device, vec![color(&device, 8, 8)]).unwrap();
        assert_eq!(target.layout(0), vk::ImageLayout::UNDEFINED);
        target.set_layout(0, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(target.attachments()[0].initial_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }
}
