//! Swapchain creation, recreation and acquire/present.

use ash::vk;
use nadir_core::config::{GraphicsConfig, PresentModeSetting};
use nadir_core::log;
use nadir_rhi_derive::DeviceObject;

use crate::device::{DeviceRef, RenderDevice};
use crate::error::{RhiError, RhiResult};
use crate::queue::Queue;

/// Requested swapchain properties. Each is matched against what the surface supports.
#[derive(Debug, Clone)]
pub struct SwapchainConfig {
    pub present_mode: vk::PresentModeKHR,
    /// Tried in order when `present_mode` is unavailable; FIFO is the last resort.
    pub present_mode_priority: Vec<vk::PresentModeKHR>,
    /// An explicit surface format; `None` walks `surface_format_priority`.
    pub surface_format: Option<vk::SurfaceFormatKHR>,
    pub surface_format_priority: Vec<vk::SurfaceFormatKHR>,
    pub image_count: u32,
    /// Individual usage bits; unsupported ones are dropped.
    pub image_usage: Vec<vk::ImageUsageFlags>,
    pub transform: vk::SurfaceTransformFlagsKHR,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        let srgb = |format| vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };

        Self {
            present_mode: vk::PresentModeKHR::FIFO,
            present_mode_priority: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
            surface_format: None,
            surface_format_priority: vec![
                srgb(vk::Format::R8G8B8A8_SRGB),
                srgb(vk::Format::B8G8R8A8_SRGB),
                srgb(vk::Format::R8G8B8A8_UNORM),
                srgb(vk::Format::B8G8R8A8_UNORM),
            ],
            image_count: 3,
            image_usage: vec![vk::ImageUsageFlags::COLOR_ATTACHMENT, vk::ImageUsageFlags::TRANSFER_SRC],
            transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
        }
    }
}

impl From<&GraphicsConfig> for SwapchainConfig {
    fn from(config: &GraphicsConfig) -> Self {
        let present_mode = match config.present_mode {
            PresentModeSetting::Immediate => vk::PresentModeKHR::IMMEDIATE,
            PresentModeSetting::Mailbox => vk::PresentModeKHR::MAILBOX,
            PresentModeSetting::Fifo => vk::PresentModeKHR::FIFO,
            PresentModeSetting::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
        };

        Self {
            present_mode,
            image_count: config.image_count,
            ..Default::default()
        }
    }
}

/// What the swapchain was actually built with.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainProperties {
    pub image_count: u32,
    pub extent: vk::Extent2D,
    pub surface_format: vk::SurfaceFormatKHR,
    pub array_layers: u32,
    pub image_usage: vk::ImageUsageFlags,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
}

/// Outcome of an acquire or present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainStatus {
    Success,
    Suboptimal,
    OutOfDate,
    Failed(vk::Result),
}

impl SwapchainStatus {
    fn from_error(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::OutOfDate,
            other => Self::Failed(other),
        }
    }

    /// Suboptimal and out-of-date results are healed by rebuilding the swapchain.
    pub fn needs_rebuild(self) -> bool {
        matches!(self, Self::Suboptimal | Self::OutOfDate)
    }
}

#[DeviceObject]
pub struct Swapchain {
    handle: vk::SwapchainKHR,
    surface: vk::SurfaceKHR,
    images: Vec<vk::Image>,
    properties: SwapchainProperties,
    config: SwapchainConfig,
}

impl Swapchain {
    /// Build a swapchain for `surface`.
    ///
    /// `extent` is only a request: a surface with a fixed current extent wins, and a
    /// zero extent always takes the surface's.
    pub fn new(
        device: &RenderDevice,
        surface: vk::SurfaceKHR,
        extent: vk::Extent2D,
        config: SwapchainConfig,
    ) -> RhiResult<Self> {
        Self::build(device.backend(), surface, extent, config, vk::SwapchainKHR::null())
    }

    /// A new swapchain replacing this one, keeping every property but extent and transform.
    pub fn recreate(&self, extent: vk::Extent2D, transform: vk::SurfaceTransformFlagsKHR) -> RhiResult<Self> {
        let config = SwapchainConfig {
            present_mode: self.properties.present_mode,
            image_count: self.properties.image_count,
            transform,
            ..self.config.clone()
        };
        Self::build(&self.device, self.surface, extent, config, self.handle)
    }

    #[profiling::function]
    fn build(
        device: &DeviceRef,
        surface: vk::SurfaceKHR,
        extent: vk::Extent2D,
        config: SwapchainConfig,
        old_swapchain: vk::SwapchainKHR,
    ) -> RhiResult<Self> {
        let capabilities = device.surface_capabilities(surface)?;
        let formats = device.surface_formats(surface)?;
        let present_modes = device.surface_present_modes(surface)?;

        let max_image_count = if capabilities.max_image_count == 0 {
            u32::MAX
        } else {
            capabilities.max_image_count
        };
        let image_count = config.image_count.max(capabilities.min_image_count).min(max_image_count);

        let surface_format = choose_surface_format(config.surface_format, &formats, &config.surface_format_priority)?;
        let features = device.format_properties(surface_format.format).optimal_tiling_features;

        let properties = SwapchainProperties {
            image_count,
            extent: choose_extent(extent, &capabilities),
            surface_format,
            array_layers: 1,
            image_usage: choose_image_usage(&config.image_usage, capabilities.supported_usage_flags, features)?,
            pre_transform: choose_transform(config.transform, &capabilities),
            composite_alpha: choose_composite_alpha(
                vk::CompositeAlphaFlagsKHR::INHERIT,
                capabilities.supported_composite_alpha,
            )?,
            present_mode: choose_present_mode(config.present_mode, &present_modes, &config.present_mode_priority),
        };

        log::info!(
            "Creating swapchain: {:?} {:?}, {}x{}, {} images, {:?}, {:?}",
            properties.surface_format.format,
            properties.surface_format.color_space,
            properties.extent.width,
            properties.extent.height,
            properties.image_count,
            properties.present_mode,
            properties.pre_transform,
        );

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(properties.image_count)
            .image_format(properties.surface_format.format)
            .image_color_space(properties.surface_format.color_space)
            .image_extent(properties.extent)
            .image_array_layers(properties.array_layers)
            .image_usage(properties.image_usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(properties.pre_transform)
            .composite_alpha(properties.composite_alpha)
            .present_mode(properties.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let handle = device.create_swapchain(&create_info)?;
        let images = match device.swapchain_images(handle) {
            Ok(images) => images,
            Err(e) => {
                device.destroy_swapchain(handle);
                return Err(e);
            }
        };

        Ok(Self {
            handle,
            surface,
            images,
            properties,
            config,
            device: device.clone(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR { self.handle }

    #[inline]
    pub fn surface(&self) -> vk::SurfaceKHR { self.surface }

    #[inline]
    pub fn images(&self) -> &[vk::Image] { &self.images }

    #[inline]
    pub fn properties(&self) -> &SwapchainProperties { &self.properties }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D { self.properties.extent }

    #[inline]
    pub fn format(&self) -> vk::Format { self.properties.surface_format.format }

    #[inline]
    pub fn usage(&self) -> vk::ImageUsageFlags { self.properties.image_usage }

    #[inline]
    pub fn transform(&self) -> vk::SurfaceTransformFlagsKHR { self.properties.pre_transform }

    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR { self.properties.present_mode }

    /// Acquire the next image, signalling `semaphore` once it is available.
    ///
    /// The index is present for `Success` and `Suboptimal`.
    #[profiling::function]
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore, timeout: u64) -> (SwapchainStatus, Option<u32>) {
        match self.device.acquire_next_image(self.handle, timeout, semaphore) {
            Ok((index, false)) => (SwapchainStatus::Success, Some(index)),
            Ok((index, true)) => (SwapchainStatus::Suboptimal, Some(index)),
            Err(result) => (SwapchainStatus::from_error(result), None),
        }
    }

    #[profiling::function]
    pub fn present(&self, queue: &Queue, image_index: u32, wait_semaphore: vk::Semaphore) -> SwapchainStatus {
        match self.device.queue_present(queue.handle(), self.handle, image_index, wait_semaphore) {
            Ok(false) => SwapchainStatus::Success,
            Ok(true) => SwapchainStatus::Suboptimal,
            Err(result) => SwapchainStatus::from_error(result),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.device.destroy_swapchain(self.handle);
    }
}

fn choose_extent(request: vk::Extent2D, capabilities: &vk::SurfaceCapabilitiesKHR) -> vk::Extent2D {
    let current = capabilities.current_extent;
    if current.width == u32::MAX {
        return request;
    }

    if request.width < 1 || request.height < 1 {
        return current;
    }

    vk::Extent2D {
        width: request
            .width
            .max(capabilities.min_image_extent.width)
            .min(capabilities.max_image_extent.width),
        height: request
            .height
            .max(capabilities.min_image_extent.height)
            .min(capabilities.max_image_extent.height),
    }
}

fn same_format(a: &vk::SurfaceFormatKHR, b: &vk::SurfaceFormatKHR) -> bool {
    a.format == b.format && a.color_space == b.color_space
}

fn choose_surface_format(
    requested: Option<vk::SurfaceFormatKHR>,
    available: &[vk::SurfaceFormatKHR],
    priority: &[vk::SurfaceFormatKHR],
) -> RhiResult<vk::SurfaceFormatKHR> {
    if let Some(requested) = requested.filter(|r| available.iter().any(|a| same_format(a, r))) {
        return Ok(requested);
    }

    priority
        .iter()
        .find(|p| available.iter().any(|a| same_format(a, p)))
        .or_else(|| available.first())
        .copied()
        .ok_or_else(|| RhiError::UnsupportedSurface("no surface formats".into()))
}

fn choose_present_mode(
    requested: vk::PresentModeKHR,
    available: &[vk::PresentModeKHR],
    priority: &[vk::PresentModeKHR],
) -> vk::PresentModeKHR {
    if available.contains(&requested) {
        return requested;
    }

    priority
        .iter()
        .copied()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

fn choose_transform(
    requested: vk::SurfaceTransformFlagsKHR,
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> vk::SurfaceTransformFlagsKHR {
    if capabilities.supported_transforms.intersects(requested) {
        requested
    } else {
        capabilities.current_transform
    }
}

fn choose_composite_alpha(
    requested: vk::CompositeAlphaFlagsKHR,
    supported: vk::CompositeAlphaFlagsKHR,
) -> RhiResult<vk::CompositeAlphaFlagsKHR> {
    if supported.intersects(requested) {
        return Ok(requested);
    }

    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|alpha| supported.intersects(*alpha))
    .ok_or_else(|| RhiError::UnsupportedSurface("no compatible composite alpha".into()))
}

fn usage_supported(usage: vk::ImageUsageFlags, supported: vk::ImageUsageFlags, features: vk::FormatFeatureFlags) -> bool {
    supported.contains(usage)
        && (usage != vk::ImageUsageFlags::STORAGE || features.contains(vk::FormatFeatureFlags::STORAGE_IMAGE))
}

fn choose_image_usage(
    requested: &[vk::ImageUsageFlags],
    supported: vk::ImageUsageFlags,
    features: vk::FormatFeatureFlags,
) -> RhiResult<vk::ImageUsageFlags> {
    let usage = requested
        .iter()
        .copied()
        .filter(|&usage| usage_supported(usage, supported, features))
        .fold(vk::ImageUsageFlags::empty(), |acc, usage| acc | usage);

    if !usage.is_empty() {
        return Ok(usage);
    }

    [
        vk::ImageUsageFlags::COLOR_ATTACHMENT,
        vk::ImageUsageFlags::STORAGE,
        vk::ImageUsageFlags::SAMPLED,
        vk::ImageUsageFlags::TRANSFER_DST,
    ]
    .into_iter()
    .find(|&usage| usage_supported(usage, supported, features))
    .ok_or_else(|| RhiError::UnsupportedSurface("no compatible image usage".into()))
}
