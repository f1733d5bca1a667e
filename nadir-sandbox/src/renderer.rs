use std::sync::Arc;

use anyhow::Context;
use nadir_core::config::GraphicsConfig;
use nadir_core::log;
use nadir_rhi::vk;
use nadir_rhi::{
    CommandBufferResetMode, ImageMemoryBarrier, LoadStoreInfo, RenderContext, RenderDevice, RenderTarget,
    SubpassInfo, SwapchainConfig,
};

/// Clears every frame to a slowly cycling color, then hands it to the presentation engine.
pub struct Renderer {
    context: RenderContext,
    reset_mode: CommandBufferResetMode,
    frame_count: u64,
}

impl Renderer {
    pub fn new(
        device: Arc<RenderDevice>,
        surface: Option<vk::SurfaceKHR>,
        extent: vk::Extent2D,
        config: &GraphicsConfig,
    ) -> anyhow::Result<Self> {
        let mut context = RenderContext::new(device, surface, extent, SwapchainConfig::from(config))
            .context("Failed to create render context")?
            .with_fence_timeout(config.fence_timeout_ns);

        context
            .prepare(config.thread_count, RenderTarget::default_create_func())
            .context("Failed to prepare render frames")?;

        Ok(Self {
            context,
            reset_mode: config.reset_mode.into(),
            frame_count: 0,
        })
    }

    #[inline]
    pub fn frame_count(&self) -> u64 { self.frame_count }

    #[inline]
    pub fn context(&self) -> &RenderContext { &self.context }

    /// Follow a window resize. Surfaces that report a fixed extent are picked up by
    /// the context on its own; the rest need the new size pushed in.
    pub fn resize(&mut self, extent: vk::Extent2D) -> anyhow::Result<()> {
        if extent.width == 0 || extent.height == 0 {
            return Ok(());
        }
        if self.context.handle_surface_changes(false)? {
            return Ok(());
        }

        let transform = self.context.swapchain().map(|swapchain| swapchain.transform());
        if let Some(transform) = transform {
            if self.context.surface_extent() != extent {
                log::debug!("Pushing window size {}x{} to the swapchain", extent.width, extent.height);
                self.context.update_swapchain(extent, transform)?;
            }
        }
        Ok(())
    }

    #[profiling::function]
    pub fn render(&mut self) -> anyhow::Result<()> {
        self.context.begin_frame()?;
        if !self.context.is_frame_active() {
            return Ok(());
        }

        let device = self.context.device().clone();
        let queue = *self.context.queue();
        let presenting = self.context.has_swapchain();
        let clear_color = self.clear_color();

        let frame = self.context.active_frame_mut()?;
        let (cmd, target) =
            frame.request_command_buffer_with_target(&queue, self.reset_mode, vk::CommandBufferLevel::PRIMARY, 0)?;

        let load_store: Vec<_> = target
            .attachments()
            .iter()
            .enumerate()
            .map(|(i, _)| LoadStoreInfo {
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: if i == 0 { vk::AttachmentStoreOp::STORE } else { vk::AttachmentStoreOp::DONT_CARE },
            })
            .collect();
        let clear_values = [
            vk::ClearValue { color: vk::ClearColorValue { float32: clear_color } },
            vk::ClearValue { depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 } },
        ];

        cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        cmd.begin_render_pass(
            &device,
            target,
            &load_store,
            &clear_values[..target.attachments().len().min(clear_values.len())],
            &[SubpassInfo::from_render_target(target)],
            vk::SubpassContents::INLINE,
        )?;
        cmd.end_render_pass();

        if presenting {
            cmd.image_memory_barrier(
                &target.views()[0],
                &ImageMemoryBarrier {
                    src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    dst_stage_mask: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                    old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                    ..Default::default()
                },
            );
        }

        cmd.end()?;
        let handle = cmd.handle();

        self.context.submit(&[handle])?;
        self.frame_count += 1;
        Ok(())
    }

    fn clear_color(&self) -> [f32; 4] {
        let t = (self.frame_count % 360) as f32 / 360.0 * std::f32::consts::TAU;
        [0.2 + 0.1 * t.sin(), 0.3, 0.6 + 0.2 * t.cos(), 1.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nadir_rhi::{DeviceBackend, NullBackend};

    #[test]
    fn repeated_resize_on_unbounded_surface_rebuilds_once() {
        let extent = vk::Extent2D { width: 800, height: 600 };
        let backend = Arc::new(NullBackend::new().with_surface(extent, 2, 8));
        backend.set_surface_unbounded(true);
        let surface = backend.surface();
        let device = Arc::new(RenderDevice::new(backend.clone()).unwrap());

        let mut renderer = Renderer::new(device, surface, extent, &GraphicsConfig::default()).unwrap();
        renderer.render().unwrap();

        let waits = backend.counters().wait_idle;
        let resized = vk::Extent2D { width: 640, height: 480 };
        renderer.resize(resized).unwrap();
        renderer.resize(resized).unwrap();

        assert!(backend.counters().wait_idle > waits);
        assert_eq!(backend.counters().swapchains_created, 2);
        assert_eq!(renderer.context().surface_extent(), resized);

        renderer.render().unwrap();
        assert_eq!(renderer.frame_count(), 2);
    }
}
