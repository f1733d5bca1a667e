//! Device gateway - the single seam between the frame engine and the graphics API.
//!
//! Everything above this trait (pools, caches, frames, the render context) talks
//! to the GPU exclusively through handle-level calls on a [`DeviceBackend`].
//! [`crate::vulkan::VulkanBackend`] drives a real device through `ash`;
//! [`crate::null::NullBackend`] completes all work on the CPU for tests and
//! headless runs.

use std::fmt;

use ash::vk;

use crate::error::RhiResult;
use crate::image::ImageDesc;
use crate::synchronization::FenceWait;

/// Capabilities of one queue family as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub index: u32,
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    /// Whether this family can present to the backend's surface.
    pub present_supported: bool,
}

/// One queue submission.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubmitBatch<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    /// One stage mask per wait semaphore.
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub command_buffers: &'a [vk::CommandBuffer],
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// Attachment references of one subpass, already resolved to layouts.
#[derive(Debug, Clone, Default)]
pub struct SubpassDesc {
    pub input_attachments: Vec<vk::AttachmentReference>,
    pub color_attachments: Vec<vk::AttachmentReference>,
    pub resolve_attachments: Vec<vk::AttachmentReference>,
    pub depth_stencil_attachment: Option<vk::AttachmentReference>,
}

/// Owned render pass description handed to [`DeviceBackend::create_render_pass`].
#[derive(Debug, Clone, Default)]
pub struct RenderPassDesc {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub subpasses: Vec<SubpassDesc>,
    pub dependencies: Vec<vk::SubpassDependency>,
}

#[derive(Clone, Copy)]
pub struct RenderPassBegin<'a> {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub render_area: vk::Rect2D,
    pub clear_values: &'a [vk::ClearValue],
}

// `vk::ClearValue` is a union and has no `Debug`.
impl fmt::Debug for RenderPassBegin<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderPassBegin")
            .field("render_pass", &self.render_pass)
            .field("framebuffer", &self.framebuffer)
            .field("render_area", &self.render_area)
            .field("clear_value_count", &self.clear_values.len())
            .finish()
    }
}

/// Render pass state a secondary command buffer continues from.
#[derive(Debug, Clone, Copy)]
pub struct Inheritance {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub subpass: u32,
}

/// Handle-level graphics API operations.
///
/// Implementations own every native object they hand out; callers return handles
/// through the matching `destroy_*` call exactly once.
pub trait DeviceBackend: Send + Sync {
    fn name(&self) -> &str;

    // Device & queues
    fn queue_families(&self) -> &[QueueFamilyInfo];
    fn queue(&self, family_index: u32, queue_index: u32) -> vk::Queue;
    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties;
    fn wait_idle(&self) -> RhiResult<()>;

    // Synchronization
    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Blocks until every fence signals or `timeout` nanoseconds pass.
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> RhiResult<FenceWait>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()>;
    fn create_semaphore(&self) -> RhiResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // Command pools & buffers
    fn create_command_pool(&self, queue_family_index: u32, flags: vk::CommandPoolCreateFlags) -> RhiResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn reset_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()>;
    fn allocate_command_buffer(&self, pool: vk::CommandPool, level: vk::CommandBufferLevel) -> RhiResult<vk::CommandBuffer>;
    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);
    fn reset_command_buffer(&self, buffer: vk::CommandBuffer, flags: vk::CommandBufferResetFlags) -> RhiResult<()>;
    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
        inheritance: Option<&Inheritance>,
    ) -> RhiResult<()>;
    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> RhiResult<()>;

    // Recording
    fn cmd_begin_render_pass(&self, buffer: vk::CommandBuffer, begin: &RenderPassBegin<'_>, contents: vk::SubpassContents);
    fn cmd_next_subpass(&self, buffer: vk::CommandBuffer, contents: vk::SubpassContents);
    fn cmd_end_render_pass(&self, buffer: vk::CommandBuffer);
    fn cmd_image_barrier(
        &self,
        buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier<'_>,
    );

    fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch<'_>, fence: vk::Fence) -> RhiResult<()>;

    // Images & derived objects
    /// Creates an image with bound device memory from the backend's allocator.
    fn create_image(&self, desc: &ImageDesc) -> RhiResult<vk::Image>;
    fn destroy_image(&self, image: vk::Image);
    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> RhiResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_render_pass(&self, desc: &RenderPassDesc) -> RhiResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> RhiResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    // Surface & swapchain
    /// The presentation surface, if the backend was created with one.
    fn surface(&self) -> Option<vk::SurfaceKHR>;
    fn surface_capabilities(&self, surface: vk::SurfaceKHR) -> RhiResult<vk::SurfaceCapabilitiesKHR>;
    fn surface_formats(&self, surface: vk::SurfaceKHR) -> RhiResult<Vec<vk::SurfaceFormatKHR>>;
    fn surface_present_modes(&self, surface: vk::SurfaceKHR) -> RhiResult<Vec<vk::PresentModeKHR>>;
    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR<'_>) -> RhiResult<vk::SwapchainKHR>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RhiResult<Vec<vk::Image>>;
    /// Raw acquire outcome: `Ok((index, suboptimal))` or the failing result code.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), vk::Result>;
    /// Raw present outcome: `Ok(suboptimal)` or the failing result code.
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool, vk::Result>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_pass_begin_debug_reports_clear_value_count() {
        let clear_values = [
            vk::ClearValue { color: vk::ClearColorValue { float32: [0.0; 4] } },
            vk::ClearValue { depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 } },
        ];
        let begin = RenderPassBegin {
            render_pass: vk::RenderPass::null(),
            framebuffer: vk::Framebuffer::null(),
            render_area: vk::Rect2D::default(),
            clear_values: &clear_values,
        };

        let copy = begin;
        let printed = format!("{copy:?}");
        assert!(printed.starts_with("RenderPassBegin"));
        assert!(printed.contains("clear_value_count: 2"));
    }
}
