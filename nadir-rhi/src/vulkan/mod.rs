//! Vulkan device backend on top of `ash`.

mod allocator;
mod instance;

use std::ffi::CString;

use ash::{vk, Entry, Instance};
use nadir_core::log;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};

use crate::backend::{DeviceBackend, Inheritance, QueueFamilyInfo, RenderPassBegin, RenderPassDesc, SubmitBatch};
use crate::error::{RhiError, RhiResult};
use crate::image::ImageDesc;
use crate::synchronization::FenceWait;

use allocator::MemoryAllocator;

/// Instance-level options for [`VulkanBackend`].
#[derive(Debug, Clone)]
pub struct VulkanOptions {
    pub app_name: String,
    /// Enable the Khronos validation layer when it is installed.
    pub validation: bool,
}

impl Default for VulkanOptions {
    fn default() -> Self {
        Self {
            app_name: "Nadir".to_owned(),
            validation: cfg!(debug_assertions),
        }
    }
}

/// Surface, its loader and the device-level swapchain loader.
struct Presentation {
    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: ash::khr::swapchain::Device,
    surface: vk::SurfaceKHR,
}

pub struct VulkanBackend {
    allocator: MemoryAllocator,
    presentation: Option<Presentation>,
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    queue_families: Vec<QueueFamilyInfo>,
    device_name: String,
    #[cfg(feature = "validation")]
    debug_messenger: Option<instance::DebugMessenger>,
    instance: Instance,
    _entry: Entry,
}

impl VulkanBackend {
    /// Backend without a surface, for offscreen rendering.
    #[profiling::function]
    pub fn new_headless(options: &VulkanOptions) -> RhiResult<Self> {
        Self::create(options, None)
    }

    /// Backend presenting to `window`. The surface is exposed through [`DeviceBackend::surface`].
    #[profiling::function]
    pub fn new_with_window<W>(options: &VulkanOptions, window: &W) -> RhiResult<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window.display_handle()?.as_raw();
        let window = window.window_handle()?.as_raw();
        Self::create(options, Some((display, window)))
    }

    fn create(options: &VulkanOptions, handles: Option<(RawDisplayHandle, RawWindowHandle)>) -> RhiResult<Self> {
        let entry = unsafe { Entry::load()? };

        let app_name = CString::new(options.app_name.replace('\0', "")).unwrap_or_default();
        let (instance, validation) =
            instance::create_instance(&entry, &app_name, handles.map(|(display, _)| display), options.validation)?;

        #[cfg(feature = "validation")]
        let debug_messenger = if validation {
            match instance::setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    log::warn!("Failed to create debug messenger: {e}");
                    None
                }
            }
        } else {
            None
        };

        let surface = match handles {
            Some((display, window)) => {
                let loader = ash::khr::surface::Instance::new(&entry, &instance);
                match unsafe { ash_window::create_surface(&entry, &instance, display, window, None) } {
                    Ok(surface) => Some((loader, surface)),
                    Err(e) => {
                        #[cfg(feature = "validation")]
                        if let Some(messenger) = &debug_messenger {
                            unsafe { messenger.destroy() };
                        }
                        unsafe { instance.destroy_instance(None) };
                        return Err(e.into());
                    }
                }
            }
            None => None,
        };

        let built = instance::select_physical_device(&instance, surface.as_ref().map(|(loader, s)| (loader, *s)))
            .and_then(|selected| {
                instance::create_logical_device(&instance, &selected, surface.is_some()).map(|device| (selected, device))
            });

        let (selected, device) = match built {
            Ok(built) => built,
            Err(e) => {
                unsafe {
                    if let Some((loader, surface)) = &surface {
                        loader.destroy_surface(*surface, None);
                    }
                    #[cfg(feature = "validation")]
                    if let Some(messenger) = &debug_messenger {
                        messenger.destroy();
                    }
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        let presentation = surface.map(|(surface_loader, surface)| Presentation {
            swapchain_loader: ash::khr::swapchain::Device::new(&instance, &device),
            surface_loader,
            surface,
        });

        log::info!(
            "Vulkan backend on '{}' ({}, validation: {})",
            selected.name,
            if presentation.is_some() { "windowed" } else { "headless" },
            validation
        );

        Ok(Self {
            allocator: MemoryAllocator::new(selected.memory_properties),
            presentation,
            device,
            physical_device: selected.handle,
            queue_families: selected.queue_families,
            device_name: selected.name,
            #[cfg(feature = "validation")]
            debug_messenger,
            instance,
            _entry: entry,
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Number of images whose memory is still owned by the backend.
    pub fn live_image_count(&self) -> usize {
        self.allocator.allocation_count()
    }

    fn presentation(&self) -> RhiResult<&Presentation> {
        self.presentation
            .as_ref()
            .ok_or_else(|| RhiError::MissingExtension(ash::khr::swapchain::NAME.to_string_lossy().into_owned()))
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("Failed to wait for device idle: {e}");
            }
            self.allocator.release_all(&self.device);
            self.device.destroy_device(None);

            if let Some(presentation) = &self.presentation {
                presentation.surface_loader.destroy_surface(presentation.surface, None);
            }

            #[cfg(feature = "validation")]
            if let Some(messenger) = &self.debug_messenger {
                messenger.destroy();
            }

            self.instance.destroy_instance(None);
        }
    }
}

impl DeviceBackend for VulkanBackend {
    fn name(&self) -> &str {
        &self.device_name
    }

    fn queue_families(&self) -> &[QueueFamilyInfo] {
        &self.queue_families
    }

    fn queue(&self, family_index: u32, queue_index: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(family_index, queue_index) }
    }

    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    fn wait_idle(&self) -> RhiResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        let info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.device.create_fence(&info, None)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> RhiResult<FenceWait> {
        if fences.is_empty() {
            return Ok(FenceWait::Signaled);
        }
        match unsafe { self.device.wait_for_fences(fences, true, timeout) } {
            Ok(()) => Ok(FenceWait::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceWait::TimedOut),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()> {
        if !fences.is_empty() {
            unsafe { self.device.reset_fences(fences)? };
        }
        Ok(())
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.device.create_semaphore(&info, None)? })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_command_pool(&self, queue_family_index: u32, flags: vk::CommandPoolCreateFlags) -> RhiResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(flags);
        Ok(unsafe { self.device.create_command_pool(&info, None)? })
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()> {
        unsafe { self.device.reset_command_pool(pool, vk::CommandPoolResetFlags::empty())? };
        Ok(())
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool, level: vk::CommandBufferLevel) -> RhiResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info)? };
        buffers
            .into_iter()
            .next()
            .ok_or(RhiError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY))
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        if !buffers.is_empty() {
            unsafe { self.device.free_command_buffers(pool, buffers) };
        }
    }

    fn reset_command_buffer(&self, buffer: vk::CommandBuffer, flags: vk::CommandBufferResetFlags) -> RhiResult<()> {
        unsafe { self.device.reset_command_buffer(buffer, flags)? };
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
        inheritance: Option<&Inheritance>,
    ) -> RhiResult<()> {
        // Secondary buffers always need an inheritance struct; primaries ignore it.
        let inheritance_info = match inheritance {
            Some(inherit) => vk::CommandBufferInheritanceInfo::default()
                .render_pass(inherit.render_pass)
                .subpass(inherit.subpass)
                .framebuffer(inherit.framebuffer),
            None => vk::CommandBufferInheritanceInfo::default(),
        };
        let info = vk::CommandBufferBeginInfo::default()
            .flags(flags)
            .inheritance_info(&inheritance_info);
        unsafe { self.device.begin_command_buffer(buffer, &info)? };
        Ok(())
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> RhiResult<()> {
        unsafe { self.device.end_command_buffer(buffer)? };
        Ok(())
    }

    fn cmd_begin_render_pass(&self, buffer: vk::CommandBuffer, begin: &RenderPassBegin<'_>, contents: vk::SubpassContents) {
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(begin.render_pass)
            .framebuffer(begin.framebuffer)
            .render_area(begin.render_area)
            .clear_values(begin.clear_values);
        unsafe { self.device.cmd_begin_render_pass(buffer, &info, contents) };
    }

    fn cmd_next_subpass(&self, buffer: vk::CommandBuffer, contents: vk::SubpassContents) {
        unsafe { self.device.cmd_next_subpass(buffer, contents) };
    }

    fn cmd_end_render_pass(&self, buffer: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(buffer) };
    }

    fn cmd_image_barrier(
        &self,
        buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier<'_>,
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(barrier),
            )
        };
    }

    #[profiling::function]
    fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch<'_>, fence: vk::Fence) -> RhiResult<()> {
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(batch.wait_semaphores)
            .wait_dst_stage_mask(batch.wait_stages)
            .command_buffers(batch.command_buffers)
            .signal_semaphores(batch.signal_semaphores);
        unsafe { self.device.queue_submit(queue, std::slice::from_ref(&submit), fence)? };
        Ok(())
    }

    fn create_image(&self, desc: &ImageDesc) -> RhiResult<vk::Image> {
        self.allocator.create_image(&self.device, desc)
    }

    fn destroy_image(&self, image: vk::Image) {
        self.allocator.destroy_image(&self.device, image);
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> RhiResult<vk::ImageView> {
        Ok(unsafe { self.device.create_image_view(info, None)? })
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> RhiResult<vk::RenderPass> {
        let subpasses: Vec<_> = desc
            .subpasses
            .iter()
            .map(|subpass| {
                let mut description = vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .input_attachments(&subpass.input_attachments)
                    .color_attachments(&subpass.color_attachments);
                if !subpass.resolve_attachments.is_empty() {
                    description = description.resolve_attachments(&subpass.resolve_attachments);
                }
                if let Some(depth) = &subpass.depth_stencil_attachment {
                    description = description.depth_stencil_attachment(depth);
                }
                description
            })
            .collect();

        let info = vk::RenderPassCreateInfo::default()
            .attachments(&desc.attachments)
            .subpasses(&subpasses)
            .dependencies(&desc.dependencies);

        Ok(unsafe { self.device.create_render_pass(&info, None)? })
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) };
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> RhiResult<vk::Framebuffer> {
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        Ok(unsafe { self.device.create_framebuffer(&info, None)? })
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn surface(&self) -> Option<vk::SurfaceKHR> {
        self.presentation.as_ref().map(|p| p.surface)
    }

    fn surface_capabilities(&self, surface: vk::SurfaceKHR) -> RhiResult<vk::SurfaceCapabilitiesKHR> {
        let presentation = self.presentation()?;
        Ok(unsafe {
            presentation
                .surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, surface)?
        })
    }

    fn surface_formats(&self, surface: vk::SurfaceKHR) -> RhiResult<Vec<vk::SurfaceFormatKHR>> {
        let presentation = self.presentation()?;
        Ok(unsafe {
            presentation
                .surface_loader
                .get_physical_device_surface_formats(self.physical_device, surface)?
        })
    }

    fn surface_present_modes(&self, surface: vk::SurfaceKHR) -> RhiResult<Vec<vk::PresentModeKHR>> {
        let presentation = self.presentation()?;
        Ok(unsafe {
            presentation
                .surface_loader
                .get_physical_device_surface_present_modes(self.physical_device, surface)?
        })
    }

    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR<'_>) -> RhiResult<vk::SwapchainKHR> {
        let presentation = self.presentation()?;
        Ok(unsafe { presentation.swapchain_loader.create_swapchain(info, None)? })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if let Some(presentation) = &self.presentation {
            unsafe { presentation.swapchain_loader.destroy_swapchain(swapchain, None) };
        }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RhiResult<Vec<vk::Image>> {
        let presentation = self.presentation()?;
        Ok(unsafe { presentation.swapchain_loader.get_swapchain_images(swapchain)? })
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), vk::Result> {
        let presentation = self.presentation.as_ref().ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;
        unsafe {
            presentation
                .swapchain_loader
                .acquire_next_image(swapchain, timeout, semaphore, vk::Fence::null())
        }
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool, vk::Result> {
        let presentation = self.presentation.as_ref().ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;

        let wait_semaphores = [wait_semaphore];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let mut info = vk::PresentInfoKHR::default()
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        if wait_semaphore != vk::Semaphore::null() {
            info = info.wait_semaphores(&wait_semaphores);
        }

        unsafe { presentation.swapchain_loader.queue_present(queue, &info) }
    }
}
