//! Command pools and the command buffers they recycle.

use std::sync::Arc;

use ash::vk;
use nadir_core::config::ResetModeSetting;
use nadir_core::log;
use nadir_rhi_derive::DeviceObject;

use crate::backend::{Inheritance, RenderPassBegin};
use crate::device::{DeviceRef, RenderDevice};
use crate::error::{RhiError, RhiResult};
use crate::image::ImageView;
use crate::render_pass::{Framebuffer, LoadStoreInfo, RenderPass, SubpassInfo};
use crate::render_target::RenderTarget;
use crate::utility::{is_depth_only_format, is_depth_stencil_format};

/// How a [`CommandPool`] recycles its command buffers between frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CommandBufferResetMode {
    /// One bulk reset of the whole pool.
    #[default]
    ResetPool,
    /// Each buffer is reset on its own; the pool is created with `RESET_COMMAND_BUFFER`.
    ResetIndividually,
    /// Buffers are freed on reset and freshly allocated on the next request.
    AlwaysAllocate,
}

impl From<ResetModeSetting> for CommandBufferResetMode {
    fn from(setting: ResetModeSetting) -> Self {
        match setting {
            ResetModeSetting::ResetPool => Self::ResetPool,
            ResetModeSetting::ResetIndividually => Self::ResetIndividually,
            ResetModeSetting::AlwaysAllocate => Self::AlwaysAllocate,
        }
    }
}

impl CommandBufferResetMode {
    fn pool_flags(self) -> vk::CommandPoolCreateFlags {
        match self {
            Self::ResetPool => vk::CommandPoolCreateFlags::TRANSIENT,
            Self::ResetIndividually | Self::AlwaysAllocate => vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        }
    }
}

/// Layout transition of a single image view.
#[derive(Debug, Clone, Copy)]
pub struct ImageMemoryBarrier {
    pub src_stage_mask: vk::PipelineStageFlags,
    pub dst_stage_mask: vk::PipelineStageFlags,
    pub src_access_mask: vk::AccessFlags,
    pub dst_access_mask: vk::AccessFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

impl Default for ImageMemoryBarrier {
    fn default() -> Self {
        Self {
            src_stage_mask: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            dst_stage_mask: vk::PipelineStageFlags::TOP_OF_PIPE,
            src_access_mask: vk::AccessFlags::empty(),
            dst_access_mask: vk::AccessFlags::empty(),
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::UNDEFINED,
            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
        }
    }
}

/// Render pass a command buffer is currently inside of.
///
/// Secondary buffers recorded for the same pass begin from a snapshot of this.
#[derive(Clone)]
pub struct RenderPassState {
    pub render_pass: Arc<RenderPass>,
    pub framebuffer: Arc<Framebuffer>,
    pub subpass: u32,
}

impl RenderPassState {
    fn inheritance(&self) -> Inheritance {
        Inheritance {
            render_pass: self.render_pass.handle(),
            framebuffer: self.framebuffer.handle(),
            subpass: self.subpass,
        }
    }
}

#[DeviceObject]
pub struct CommandBuffer {
    handle: vk::CommandBuffer,
    pool: vk::CommandPool,
    level: vk::CommandBufferLevel,
    reset_mode: CommandBufferResetMode,
    render_pass_state: Option<RenderPassState>,
}

impl CommandBuffer {
    fn new(
        device: &DeviceRef,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        reset_mode: CommandBufferResetMode,
    ) -> RhiResult<Self> {
        let handle = device.allocate_command_buffer(pool, level)?;
        Ok(Self {
            handle,
            pool,
            level,
            reset_mode,
            render_pass_state: None,
            device: device.clone(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer { self.handle }

    #[inline]
    pub fn level(&self) -> vk::CommandBufferLevel { self.level }

    #[inline]
    pub fn reset_mode(&self) -> CommandBufferResetMode { self.reset_mode }

    #[inline]
    pub fn render_pass_state(&self) -> Option<&RenderPassState> { self.render_pass_state.as_ref() }

    /// Begin recording a primary buffer.
    ///
    /// Secondary buffers need render pass inheritance, see [`Self::begin_secondary`].
    pub fn begin(&mut self, flags: vk::CommandBufferUsageFlags) -> RhiResult<()> {
        if self.level == vk::CommandBufferLevel::SECONDARY {
            return Err(RhiError::MissingInheritance);
        }
        self.render_pass_state = None;
        self.device.begin_command_buffer(self.handle, flags, None)
    }

    /// Begin recording a secondary buffer that continues `state`'s render pass.
    pub fn begin_secondary(
        &mut self,
        flags: vk::CommandBufferUsageFlags,
        state: Option<&RenderPassState>,
    ) -> RhiResult<()> {
        let state = state.ok_or(RhiError::MissingInheritance)?;
        let inheritance = state.inheritance();
        self.render_pass_state = Some(state.clone());
        self.device.begin_command_buffer(
            self.handle,
            flags | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
            Some(&inheritance),
        )
    }

    pub fn begin_inherited(
        &mut self,
        flags: vk::CommandBufferUsageFlags,
        render_pass: &Arc<RenderPass>,
        framebuffer: &Arc<Framebuffer>,
        subpass: u32,
    ) -> RhiResult<()> {
        let state = RenderPassState {
            render_pass: render_pass.clone(),
            framebuffer: framebuffer.clone(),
            subpass,
        };
        self.begin_secondary(flags, Some(&state))
    }

    /// Begin a secondary buffer from the render pass `primary` is currently recording.
    pub fn begin_from_primary(
        &mut self,
        flags: vk::CommandBufferUsageFlags,
        primary: &CommandBuffer,
    ) -> RhiResult<()> {
        self.begin_secondary(flags, primary.render_pass_state())
    }

    pub fn end(&mut self) -> RhiResult<()> {
        self.device.end_command_buffer(self.handle)
    }

    /// Reset this buffer for reuse.
    ///
    /// # Panics
    ///
    /// If `reset_mode` differs from the mode of the pool the buffer came from.
    pub fn reset(&mut self, reset_mode: CommandBufferResetMode) -> RhiResult<()> {
        assert_eq!(
            reset_mode, self.reset_mode,
            "command buffer reset with a mode other than its pool's"
        );

        if reset_mode == CommandBufferResetMode::ResetIndividually {
            self.device
                .reset_command_buffer(self.handle, vk::CommandBufferResetFlags::RELEASE_RESOURCES)?;
        }
        self.render_pass_state = None;
        Ok(())
    }

    /// Begin a render pass over `render_target`, fetching the render pass and
    /// framebuffer from the device's resource cache.
    #[profiling::function]
    pub fn begin_render_pass(
        &mut self,
        device: &RenderDevice,
        render_target: &RenderTarget,
        load_store_infos: &[LoadStoreInfo],
        clear_values: &[vk::ClearValue],
        subpasses: &[SubpassInfo],
        contents: vk::SubpassContents,
    ) -> RhiResult<()> {
        if subpasses.is_empty() {
            return Err(RhiError::EmptySubpassList);
        }

        let cache = device.resource_cache();
        let render_pass = cache.request_render_pass(render_target.attachments(), load_store_infos, subpasses)?;
        let framebuffer = cache.request_framebuffer(render_target, &render_pass)?;

        self.begin_render_pass_with(render_target, render_pass, framebuffer, clear_values, contents);
        Ok(())
    }

    /// Begin an explicit render pass / framebuffer pair.
    pub fn begin_render_pass_with(
        &mut self,
        render_target: &RenderTarget,
        render_pass: Arc<RenderPass>,
        framebuffer: Arc<Framebuffer>,
        clear_values: &[vk::ClearValue],
        contents: vk::SubpassContents,
    ) {
        let begin = RenderPassBegin {
            render_pass: render_pass.handle(),
            framebuffer: framebuffer.handle(),
            render_area: vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: render_target.extent(),
            },
            clear_values,
        };
        self.device.cmd_begin_render_pass(self.handle, &begin, contents);

        self.render_pass_state = Some(RenderPassState {
            render_pass,
            framebuffer,
            subpass: 0,
        });
    }

    pub fn next_subpass(&mut self, contents: vk::SubpassContents) {
        if let Some(state) = &mut self.render_pass_state {
            state.subpass += 1;
        }
        self.device.cmd_next_subpass(self.handle, contents);
    }

    pub fn end_render_pass(&mut self) {
        self.device.cmd_end_render_pass(self.handle);
    }

    pub fn image_memory_barrier(&mut self, view: &ImageView, barrier: &ImageMemoryBarrier) {
        let mut subresource_range = view.subresource_range();
        let format = view.format();
        if is_depth_only_format(format) {
            subresource_range.aspect_mask = vk::ImageAspectFlags::DEPTH;
        } else if is_depth_stencil_format(format) {
            subresource_range.aspect_mask = vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL;
        }

        let image_barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(barrier.src_access_mask)
            .dst_access_mask(barrier.dst_access_mask)
            .old_layout(barrier.old_layout)
            .new_layout(barrier.new_layout)
            .src_queue_family_index(barrier.src_queue_family)
            .dst_queue_family_index(barrier.dst_queue_family)
            .image(view.image_handle())
            .subresource_range(subresource_range);

        self.device
            .cmd_image_barrier(self.handle, barrier.src_stage_mask, barrier.dst_stage_mask, &image_barrier);
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        self.device.free_command_buffers(self.pool, &[self.handle]);
    }
}

/// Per-thread, per-queue-family pool of primary and secondary command buffers.
///
/// `buffers[..active]` were handed out since the last reset; the rest are idle.
#[DeviceObject]
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family_index: u32,
    thread_index: usize,
    reset_mode: CommandBufferResetMode,
    primary_command_buffers: Vec<CommandBuffer>,
    active_primary_command_buffer_count: usize,
    secondary_command_buffers: Vec<CommandBuffer>,
    active_secondary_command_buffer_count: usize,
}

impl CommandPool {
    pub fn new(
        device: &RenderDevice,
        queue_family_index: u32,
        thread_index: usize,
        reset_mode: CommandBufferResetMode,
    ) -> RhiResult<Self> {
        let backend = device.backend();
        let pool = backend.create_command_pool(queue_family_index, reset_mode.pool_flags())?;

        Ok(Self {
            pool,
            queue_family_index,
            thread_index,
            reset_mode,
            primary_command_buffers: Vec::new(),
            active_primary_command_buffer_count: 0,
            secondary_command_buffers: Vec::new(),
            active_secondary_command_buffer_count: 0,
            device: backend.clone(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandPool { self.pool }

    #[inline]
    pub fn queue_family_index(&self) -> u32 { self.queue_family_index }

    #[inline]
    pub fn thread_index(&self) -> usize { self.thread_index }

    #[inline]
    pub fn reset_mode(&self) -> CommandBufferResetMode { self.reset_mode }

    /// Hand out the next idle buffer of `level`, allocating one when all are in use.
    pub fn request_command_buffer(&mut self, level: vk::CommandBufferLevel) -> RhiResult<&mut CommandBuffer> {
        let (buffers, active) = if level == vk::CommandBufferLevel::PRIMARY {
            (&mut self.primary_command_buffers, &mut self.active_primary_command_buffer_count)
        } else {
            (&mut self.secondary_command_buffers, &mut self.active_secondary_command_buffer_count)
        };

        if *active == buffers.len() {
            buffers.push(CommandBuffer::new(&self.device, self.pool, level, self.reset_mode)?);
        }

        let index = *active;
        *active += 1;
        Ok(&mut buffers[index])
    }

    #[profiling::function]
    pub fn reset_pool(&mut self) -> RhiResult<()> {
        match self.reset_mode {
            CommandBufferResetMode::ResetPool => {
                self.device.reset_command_pool(self.pool)?;
                for buffer in self.all_buffers_mut() {
                    buffer.render_pass_state = None;
                }
            }
            CommandBufferResetMode::ResetIndividually => {
                let mode = self.reset_mode;
                for buffer in self.all_buffers_mut() {
                    buffer.reset(mode)?;
                }
            }
            CommandBufferResetMode::AlwaysAllocate => {
                self.primary_command_buffers.clear();
                self.secondary_command_buffers.clear();
            }
        }

        self.active_primary_command_buffer_count = 0;
        self.active_secondary_command_buffer_count = 0;
        Ok(())
    }

    pub fn active_primary_count(&self) -> usize { self.active_primary_command_buffer_count }

    pub fn active_secondary_count(&self) -> usize { self.active_secondary_command_buffer_count }

    pub fn primary_len(&self) -> usize { self.primary_command_buffers.len() }

    pub fn secondary_len(&self) -> usize { self.secondary_command_buffers.len() }

    fn all_buffers_mut(&mut self) -> impl Iterator<Item = &mut CommandBuffer> {
        self.primary_command_buffers
            .iter_mut()
            .chain(self.secondary_command_buffers.iter_mut())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        log::trace!(
            "Destroying command pool (family {}, thread {})",
            self.queue_family_index,
            self.thread_index
        );
        self.primary_command_buffers.clear();
        self.secondary_command_buffers.clear();
        self.device.destroy_command_pool(self.pool);
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

    #[test]
    fn buffers_are_reused_after_pool_reset() {
        let (backend, device) = device();
        let mut pool = CommandPool::new(&device, 0, 0, CommandBufferResetMode::ResetPool).unwrap();

        let first = pool.request_command_buffer(vk::CommandBufferLevel::PRIMARY).unwrap().handle();
        let second = pool.request_command_buffer(vk::CommandBufferLevel::PRIMARY).unwrap().handle();
        assert_ne!(first, second);
        assert_eq!(pool.active_primary_count(), 2);

        pool.reset_pool().unwrap();
        assert_eq!(pool.active_primary_count(), 0);
        assert_eq!(pool.request_command_buffer(vk::CommandBufferLevel::PRIMARY).unwrap().handle(), first);
        assert_eq!(pool.primary_len(), 2);

        let counters = backend.counters();
        assert_eq!(counters.command_pool_resets, 1);
        assert_eq!(counters.command_buffer_allocations, 2);
        assert_eq!(counters.command_buffer_resets, 0);
    }

    #[test]
    fn secondary_watermark_advances() {
        let (_backend, device) = device();
        let mut pool = CommandPool::new(&device, 0, 0, CommandBufferResetMode::ResetPool).unwrap();

        let a = pool.request_command_buffer(vk::CommandBufferLevel::SECONDARY).unwrap().handle();
        let b = pool.request_command_buffer(vk::CommandBufferLevel::SECONDARY).unwrap().handle();
        assert_ne!(a, b);
        assert_eq!(pool.active_secondary_count(), 2);
        assert_eq!(pool.active_primary_count(), 0);
    }

    #[test]
    fn individual_reset_touches_every_buffer() {
        let (backend, device) = device();
        let mut pool = CommandPool::new(&device, 0, 0, CommandBufferResetMode::ResetIndividually).unwrap();
        let primary = pool.request_command_buffer(vk::CommandBufferLevel::PRIMARY).unwrap().handle();
        let secondary = pool.request_command_buffer(vk::CommandBufferLevel::SECONDARY).unwrap().handle();

        pool.reset_pool().unwrap();

        assert_eq!(backend.command_buffer_reset_count(primary), 1);
        assert_eq!(backend.command_buffer_reset_count(secondary), 1);
        assert_eq!(backend.counters().command_pool_resets, 0);
    }

    #[test]
    fn always_allocate_frees_on_reset() {
        let (backend, device) = device();
        let mut pool = CommandPool::new(&device, 0, 0, CommandBufferResetMode::AlwaysAllocate).unwrap();
        pool.request_command_buffer(vk::CommandBufferLevel::PRIMARY).unwrap();

        pool.reset_pool().unwrap();
        assert_eq!(pool.primary_len(), 0);
        assert_eq!(backend.counters().command_buffer_frees, 1);

        pool.request_command_buffer(vk::CommandBufferLevel::PRIMARY).unwrap();
        assert_eq!(backend.counters().command_buffer_allocations, 2);
    }

    #[test]
    fn secondary_begin_requires_inheritance() {
        let (_backend, device) = device();
        let mut pool = CommandPool::new(&device, 0, 0, CommandBufferResetMode::ResetPool).unwrap();

        let secondary = pool.request_command_buffer(vk::CommandBufferLevel::SECONDARY).unwrap();
        assert!(matches!(
            secondary.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            Err(RhiError::MissingInheritance)
        ));
        assert!(matches!(
            secondary.begin_secondary(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, None),
            Err(RhiError::MissingInheritance)
        ));
    }

    #[test]
    #[should_panic]
    fn reset_with_foreign_mode_panics() {
        let (_backend, device) = device();
        let mut pool = CommandPool::new(&device, 0, 0, CommandBufferResetMode::ResetPool).unwrap();
        let buffer = pool.request_command_buffer(vk::CommandBufferLevel::PRIMARY).unwrap();
        let _ = buffer.reset(CommandBufferResetMode::ResetIndividually);
    }

    #[test]
    fn dropping_pool_releases_everything() {
        let (backend, device) = device();
        {
            let mut pool = CommandPool::new(&device, 0, 0, CommandBufferResetMode::ResetPool).unwrap();
            pool.request_command_buffer(vk::CommandBufferLevel::PRIMARY).unwrap();
            pool.request_command_buffer(vk::CommandBufferLevel::SECONDARY).unwrap();
        }
        let live = backend.live_objects();
        assert_eq!(live.command_pools, 0);
        assert_eq!(live.command_buffers, 0);
    }
}
