//! Frame orchestration: N in-flight frames over a swapchain or a single offscreen target.
//!
//! State machine: unprepared -> prepared (idle) -> frame active -> prepared -> ...
//! Suboptimal and out-of-date swapchains are rebuilt here and never reach the caller.

use std::sync::Arc;

use ash::vk;
use nadir_core::log;

use crate::backend::SubmitBatch;
use crate::command::{CommandBuffer, CommandBufferResetMode};
use crate::device::RenderDevice;
use crate::error::{RhiError, RhiResult};
use crate::image::{Image, ImageDesc};
use crate::queue::Queue;
use crate::render_frame::{RenderFrame, DEFAULT_FENCE_TIMEOUT};
use crate::render_target::{CreateFunc, RenderTarget};
use crate::swapchain::{Swapchain, SwapchainConfig, SwapchainStatus};

/// Color format of the single offscreen frame used when there is no swapchain.
pub const DEFAULT_OFFSCREEN_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

pub struct RenderContext {
    // Frames hold views of swapchain images and are torn down before the swapchain.
    frames: Vec<RenderFrame>,
    swapchain: Option<Swapchain>,
    /// Owned between begin_frame and end_frame.
    acquired_semaphore: Option<vk::Semaphore>,
    active_frame_index: usize,
    frame_active: bool,
    prepared: bool,
    surface_extent: vk::Extent2D,
    pre_transform: vk::SurfaceTransformFlagsKHR,
    thread_count: usize,
    create_render_target: Option<CreateFunc>,
    queue: Queue,
    fence_timeout: u64,
    acquire_timeout: u64,
    device: Arc<RenderDevice>,
}

impl RenderContext {
    /// Create a context presenting to `surface`, or an offscreen one when `surface` is `None`.
    ///
    /// `extent` is the window size; it only sizes the swapchain when the surface lets
    /// the swapchain decide, and always sizes the offscreen target.
    pub fn new(
        device: Arc<RenderDevice>,
        surface: Option<vk::SurfaceKHR>,
        extent: vk::Extent2D,
        config: SwapchainConfig,
    ) -> RhiResult<Self> {
        let queue = device.suitable_graphics_queue()?;
        let pre_transform = config.transform;

        let swapchain = match surface {
            Some(surface) => {
                let capabilities = device.backend().surface_capabilities(surface)?;
                let request = if capabilities.current_extent.width == u32::MAX {
                    extent
                } else {
                    vk::Extent2D::default()
                };
                Some(Swapchain::new(&device, surface, request, config)?)
            }
            None => None,
        };

        Ok(Self {
            frames: Vec::new(),
            swapchain,
            acquired_semaphore: None,
            active_frame_index: 0,
            frame_active: false,
            prepared: false,
            surface_extent: extent,
            pre_transform,
            thread_count: 1,
            create_render_target: None,
            queue,
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
            acquire_timeout: u64::MAX,
            device,
        })
    }

    /// Fence timeout, in nanoseconds, for frames built by the next `prepare`.
    pub fn with_fence_timeout(mut self, timeout: u64) -> Self {
        self.fence_timeout = timeout;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: u64) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Build one frame per swapchain image (or one offscreen frame), each around a
    /// render target made by `create_render_target`.
    #[profiling::function]
    pub fn prepare(&mut self, thread_count: usize, create_render_target: CreateFunc) -> RhiResult<()> {
        if self.frame_active {
            return Err(RhiError::FrameAlreadyActive);
        }
        self.device.wait_idle()?;
        self.frames.clear();
        self.active_frame_index = 0;

        if let Some(swapchain) = &self.swapchain {
            self.surface_extent = swapchain.extent();
            let extent = extent_3d(swapchain.extent());

            for &handle in swapchain.images() {
                let image =
                    Image::from_swapchain_image(&self.device, handle, extent, swapchain.format(), swapchain.usage());
                let render_target = create_render_target(self.device.as_ref(), image)?;
                self.frames.push(
                    RenderFrame::new(self.device.clone(), render_target, thread_count)
                        .with_fence_timeout(self.fence_timeout),
                );
            }
        } else {
            let desc = ImageDesc::new_2d(self.surface_extent.width, self.surface_extent.height, DEFAULT_OFFSCREEN_FORMAT)
                .with_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC);
            let image = Image::new(&self.device, &desc)?;
            let render_target = create_render_target(self.device.as_ref(), image)?;
            self.frames.push(
                RenderFrame::new(self.device.clone(), render_target, thread_count).with_fence_timeout(self.fence_timeout),
            );
        }

        log::info!(
            "Render context prepared: {} frame(s), {} thread(s), {}",
            self.frames.len(),
            thread_count,
            if self.swapchain.is_some() { "swapchain" } else { "offscreen" }
        );

        self.create_render_target = Some(create_render_target);
        self.thread_count = thread_count;
        self.prepared = true;
        Ok(())
    }

    /// Begin a frame if none is active and hand out a primary command buffer from it.
    pub fn begin(&mut self, reset_mode: CommandBufferResetMode) -> RhiResult<&mut CommandBuffer> {
        if !self.prepared {
            return Err(RhiError::NotPrepared);
        }

        if !self.frame_active {
            self.begin_frame()?;
        }

        if !self.frame_active {
            return Err(RhiError::FrameNotActive);
        }

        let queue = self.queue;
        self.active_frame_mut()?
            .request_command_buffer(&queue, reset_mode, vk::CommandBufferLevel::PRIMARY, 0)
    }

    /// Acquire the next image and make its frame active, waiting for that frame's previous work.
    ///
    /// Leaves no frame active (but returns `Ok`) when the swapchain stays out of date
    /// even after a rebuild.
    #[profiling::function]
    pub fn begin_frame(&mut self) -> RhiResult<()> {
        if !self.prepared {
            return Err(RhiError::NotPrepared);
        }
        if self.frame_active {
            return Err(RhiError::FrameAlreadyActive);
        }

        if self.swapchain.is_some() {
            self.handle_surface_changes(false)?;
        }

        let prev = self.active_frame_index;
        // Signalled for the *next* image, so it must outlive the previous frame's reset.
        let mut semaphore = self.frame_mut(prev)?.request_semaphore_with_ownership()?;

        if self.swapchain.is_some() {
            let (mut status, mut index) = self.acquire(semaphore);

            if status.needs_rebuild() {
                let updated = self.handle_surface_changes(status == SwapchainStatus::OutOfDate)?;
                if updated {
                    // May already be signalled by the stale swapchain.
                    self.device.backend().destroy_semaphore(semaphore);
                    semaphore = self.frame_mut(prev)?.request_semaphore_with_ownership()?;
                    (status, index) = self.acquire(semaphore);
                }
            }

            match (status, index) {
                (SwapchainStatus::Success | SwapchainStatus::Suboptimal, Some(index)) => {
                    self.active_frame_index = index as usize;
                }
                (status, _) => {
                    let frame = self.frame_mut(prev)?;
                    frame.release_owned_semaphore(semaphore);
                    frame.reset()?;

                    return match status {
                        SwapchainStatus::Failed(result) => Err(RhiError::AcquireFailed(result)),
                        _ => {
                            log::warn!("Swapchain still out of date after rebuild, skipping frame");
                            Ok(())
                        }
                    };
                }
            }
        }

        self.acquired_semaphore = Some(semaphore);
        self.frame_active = true;

        self.active_frame_mut()?.reset()
    }

    /// Submit `command_buffers` on the context's queue and end the frame.
    #[profiling::function]
    pub fn submit(&mut self, command_buffers: &[vk::CommandBuffer]) -> RhiResult<()> {
        if !self.frame_active {
            return Err(RhiError::FrameNotActive);
        }

        let queue = self.queue;
        let render_semaphore = if self.swapchain.is_some() {
            let acquired = self.acquired_semaphore.ok_or(RhiError::FrameNotActive)?;
            self.submit_with_semaphores(
                &queue,
                command_buffers,
                acquired,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            )?
        } else {
            self.submit_without_semaphores(&queue, command_buffers)?;
            vk::Semaphore::null()
        };

        self.end_frame(render_semaphore)
    }

    /// Submit waiting on `wait_semaphore`; returns the semaphore signalled on completion.
    pub fn submit_with_semaphores(
        &mut self,
        queue: &Queue,
        command_buffers: &[vk::CommandBuffer],
        wait_semaphore: vk::Semaphore,
        wait_stage: vk::PipelineStageFlags,
    ) -> RhiResult<vk::Semaphore> {
        let (signal_semaphore, fence) = {
            let frame = self.active_frame_mut()?;
            (frame.request_semaphore()?, frame.request_fence()?)
        };

        let wait_count = usize::from(wait_semaphore != vk::Semaphore::null());
        let wait_semaphores = [wait_semaphore];
        let wait_stages = [wait_stage];
        let signal_semaphores = [signal_semaphore];
        let batch = SubmitBatch {
            wait_semaphores: &wait_semaphores[..wait_count],
            wait_stages: &wait_stages[..wait_count],
            command_buffers,
            signal_semaphores: &signal_semaphores,
        };
        if let Err(e) = self.device.submit(queue, &batch, fence) {
            self.active_frame_mut()?.return_unsubmitted_fence(fence);
            return Err(e);
        }

        Ok(signal_semaphore)
    }

    pub fn submit_without_semaphores(&mut self, queue: &Queue, command_buffers: &[vk::CommandBuffer]) -> RhiResult<()> {
        let fence = self.active_frame_mut()?.request_fence()?;
        let batch = SubmitBatch {
            command_buffers,
            ..Default::default()
        };
        if let Err(e) = self.device.submit(queue, &batch, fence) {
            self.active_frame_mut()?.return_unsubmitted_fence(fence);
            return Err(e);
        }
        Ok(())
    }

    /// Present (when there is a swapchain) and deactivate the frame.
    ///
    /// The acquired semaphore returns to the active frame and is reused only after
    /// that frame's next reset.
    #[profiling::function]
    pub fn end_frame(&mut self, semaphore: vk::Semaphore) -> RhiResult<()> {
        if !self.frame_active {
            return Err(RhiError::FrameNotActive);
        }

        let image_index = self.active_frame_index as u32;
        let status = self
            .swapchain
            .as_ref()
            .map(|swapchain| swapchain.present(&self.queue, image_index, semaphore));

        let mut result = Ok(());
        match status {
            None | Some(SwapchainStatus::Success) => {}
            Some(SwapchainStatus::Suboptimal | SwapchainStatus::OutOfDate) => {
                if let Err(e) = self.handle_surface_changes(false) {
                    result = Err(e);
                }
            }
            Some(SwapchainStatus::Failed(code)) => result = Err(RhiError::PresentFailed(code)),
        }

        if let Some(acquired) = self.acquired_semaphore.take() {
            self.active_frame_mut()?.release_owned_semaphore(acquired);
        }
        self.frame_active = false;

        result
    }

    /// Rebuild the swapchain when the surface extent changed (or `force`); returns whether it did.
    pub fn handle_surface_changes(&mut self, force: bool) -> RhiResult<bool> {
        let Some(surface) = self.swapchain.as_ref().map(Swapchain::surface) else {
            return Ok(false);
        };

        let capabilities = self.device.backend().surface_capabilities(surface)?;
        let current = capabilities.current_extent;
        if current.width == u32::MAX {
            return Ok(false);
        }

        if current != self.surface_extent || force {
            log::info!(
                "Surface changed to {}x{} (forced: {force}), rebuilding swapchain",
                current.width,
                current.height
            );
            self.update_swapchain(current, self.pre_transform)?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Rebuild the swapchain for a surface of `extent` seen through `transform`.
    ///
    /// Waits for the device first: the render targets and framebuffers of frames
    /// still in flight are replaced. `extent` becomes the tracked surface extent.
    pub fn update_swapchain(&mut self, extent: vk::Extent2D, transform: vk::SurfaceTransformFlagsKHR) -> RhiResult<()> {
        let Some(swapchain) = &self.swapchain else {
            return Ok(());
        };

        // Pre-rotation keeps the swapchain in the display's native orientation.
        let quarter_turn = vk::SurfaceTransformFlagsKHR::ROTATE_90 | vk::SurfaceTransformFlagsKHR::ROTATE_270;
        let image_extent = if transform.intersects(quarter_turn) {
            vk::Extent2D { width: extent.height, height: extent.width }
        } else {
            extent
        };

        self.device.wait_idle()?;
        let rebuilt = swapchain.recreate(image_extent, transform)?;
        let _retired = self.swapchain.replace(rebuilt);
        self.surface_extent = extent;
        self.pre_transform = transform;

        self.recreate()
    }

    /// Point every frame at the current swapchain images, adding frames if the image count grew.
    pub fn recreate(&mut self) -> RhiResult<()> {
        let Some(swapchain) = &self.swapchain else {
            return Ok(());
        };
        let create = self.create_render_target.clone().ok_or(RhiError::NotPrepared)?;
        let extent = extent_3d(swapchain.extent());

        // Cached framebuffers reference the views about to be replaced.
        self.device.resource_cache().clear_framebuffers();

        for (i, &handle) in swapchain.images().iter().enumerate() {
            let image = Image::from_swapchain_image(&self.device, handle, extent, swapchain.format(), swapchain.usage());
            let render_target = create(self.device.as_ref(), image)?;

            match self.frames.get_mut(i) {
                Some(frame) => frame.update_render_target(render_target),
                None => self.frames.push(
                    RenderFrame::new(self.device.clone(), render_target, self.thread_count)
                        .with_fence_timeout(self.fence_timeout),
                ),
            }
        }

        Ok(())
    }

    fn acquire(&self, semaphore: vk::Semaphore) -> (SwapchainStatus, Option<u32>) {
        match &self.swapchain {
            Some(swapchain) => swapchain.acquire_next_image(semaphore, self.acquire_timeout),
            None => (SwapchainStatus::Success, Some(self.active_frame_index as u32)),
        }
    }

    fn frame_mut(&mut self, index: usize) -> RhiResult<&mut RenderFrame> {
        self.frames.get_mut(index).ok_or(RhiError::NotPrepared)
    }

    #[inline]
    pub fn device(&self) -> &Arc<RenderDevice> { &self.device }

    #[inline]
    pub fn queue(&self) -> &Queue { &self.queue }

    #[inline]
    pub fn swapchain(&self) -> Option<&Swapchain> { self.swapchain.as_ref() }

    #[inline]
    pub fn has_swapchain(&self) -> bool { self.swapchain.is_some() }

    #[inline]
    pub fn is_prepared(&self) -> bool { self.prepared }

    #[inline]
    pub fn is_frame_active(&self) -> bool { self.frame_active }

    #[inline]
    pub fn surface_extent(&self) -> vk::Extent2D { self.surface_extent }

    #[inline]
    pub fn thread_count(&self) -> usize { self.thread_count }

    /// Color format frames render into.
    pub fn format(&self) -> vk::Format {
        self.swapchain.as_ref().map_or(DEFAULT_OFFSCREEN_FORMAT, Swapchain::format)
    }

    #[inline]
    pub fn render_frames(&self) -> &[RenderFrame] { &self.frames }

    pub fn active_frame_index(&self) -> RhiResult<usize> {
        if self.frame_active {
            Ok(self.active_frame_index)
        } else {
            Err(RhiError::FrameNotActive)
        }
    }

    pub fn active_frame(&self) -> RhiResult<&RenderFrame> {
        if !self.frame_active {
            return Err(RhiError::FrameNotActive);
        }
        self.frames.get(self.active_frame_index).ok_or(RhiError::FrameNotActive)
    }

    pub fn active_frame_mut(&mut self) -> RhiResult<&mut RenderFrame> {
        if !self.frame_active {
            return Err(RhiError::FrameNotActive);
        }
        self.frames.get_mut(self.active_frame_index).ok_or(RhiError::FrameNotActive)
    }

    /// The frame rendered last, valid between frames.
    pub fn last_rendered_frame(&self) -> RhiResult<&RenderFrame> {
        if self.frame_active {
            return Err(RhiError::FrameAlreadyActive);
        }
        self.frames.get(self.active_frame_index).ok_or(RhiError::NotPrepared)
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle while destroying render context: {e}");
        }
        if let Some(semaphore) = self.acquired_semaphore.take() {
            self.device.backend().destroy_semaphore(semaphore);
        }
        self.frames.clear();
    }
}

fn extent_3d(extent: vk::Extent2D) -> vk::Extent3D {
    vk::Extent3D {
        width: extent.width,
        height: extent.height,
        depth: 1,
    }
}

/// Render target factory producing a color-only target from the given image.
pub fn color_only_render_target() -> CreateFunc {
    Arc::new(|device: &RenderDevice, image: Image| RenderTarget::from_images(device, vec![image]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::null::NullBackend;

    fn offscreen() -> (Arc<NullBackend>, RenderContext) {
        let backend = Arc::new(NullBackend::new());
        let device = Arc::new(RenderDevice::new(backend.clone()).unwrap());
        let context = RenderContext::new(
            device,
            None,
            vk::Extent2D { width: 64, height: 64 },
            SwapchainConfig::default(),
        )
        .unwrap();
        (backend, context)
    }

    #[test]
    fn unprepared_context_refuses_to_begin() {
        let (_backend, mut context) = offscreen();
        assert!(matches!(context.begin(CommandBufferResetMode::ResetPool), Err(RhiError::NotPrepared)));
        assert!(matches!(context.begin_frame(), Err(RhiError::NotPrepared)));
    }

    #[test]
    fn inactive_frame_rejects_submit_and_end() {
        let (_backend, mut context) = offscreen();
        context.prepare(1, color_only_render_target()).unwrap();
        assert!(matches!(context.submit(&[]), Err(RhiError::FrameNotActive)));
        assert!(matches!(context.end_frame(vk::Semaphore::null()), Err(RhiError::FrameNotActive)));
        assert!(matches!(context.active_frame(), Err(RhiError::FrameNotActive)));
    }

    #[test]
    fn begin_frame_twice_is_an_error() {
        let (_backend, mut context) = offscreen();
        context.prepare(1, color_only_render_target()).unwrap();
        context.begin_frame().unwrap();
        assert!(matches!(context.begin_frame(), Err(RhiError::FrameAlreadyActive)));
    }

    #[test]
    fn offscreen_frame_uses_default_format() {
        let (backend, mut context) = offscreen();
        context.prepare(2, color_only_render_target()).unwrap();

        assert_eq!(context.render_frames().len(), 1);
        assert_eq!(context.format(), DEFAULT_OFFSCREEN_FORMAT);
        let target = context.render_frames()[0].render_target();
        assert_eq!(target.attachments()[0].format, DEFAULT_OFFSCREEN_FORMAT);
        assert_eq!(
            target.attachments()[0].usage,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC
        );

        let cmd = context.begin(CommandBufferResetMode::ResetPool).unwrap().handle();
        context.submit(&[cmd]).unwrap();

        let submits = backend.submissions();
        assert_eq!(submits.len(), 1);
        assert!(submits[0].wait_semaphores.is_empty());
        assert!(submits[0].signal_semaphores.is_empty());
        assert_eq!(backend.counters().presents, 0);
        assert!(!context.is_frame_active());
    }

    #[test]
    fn dropping_context_releases_frame_objects() {
        let (backend, mut context) = offscreen();
        context.prepare(1, color_only_render_target()).unwrap();
        let cmd = context.begin(CommandBufferResetMode::ResetPool).unwrap().handle();
        context.submit(&[cmd]).unwrap();
        context.begin(CommandBufferResetMode::ResetPool).unwrap();
        drop(context);

        let live = backend.live_objects();
        assert_eq!(live.fences, 0);
        assert_eq!(live.semaphores, 0);
        assert_eq!(live.command_pools, 0);
        assert_eq!(live.images, 0);
        assert_eq!(live.image_views, 0);
    }
}
