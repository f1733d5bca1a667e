//! Per-frame resources: sync pools, per-thread command pools and the render target.

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;
use nadir_core::log;

use crate::command::{CommandBuffer, CommandBufferResetMode, CommandPool};
use crate::device::RenderDevice;
use crate::error::{RhiError, RhiResult};
use crate::queue::Queue;
use crate::render_target::RenderTarget;
use crate::synchronization::{FencePool, FenceWait, SemaphorePool};

pub const DEFAULT_FENCE_TIMEOUT: u64 = u64::MAX;

/// Everything one in-flight frame owns. Resetting it recycles all of it at once.
pub struct RenderFrame {
    // Dropping the fence pool waits for the frame's GPU work, so it goes first.
    fence_pool: FencePool,
    command_pools: BTreeMap<u32, Vec<CommandPool>>,
    semaphore_pool: SemaphorePool,
    render_target: RenderTarget,
    thread_count: usize,
    fence_timeout: u64,
    device: Arc<RenderDevice>,
}

impl RenderFrame {
    pub fn new(device: Arc<RenderDevice>, render_target: RenderTarget, thread_count: usize) -> Self {
        Self {
            fence_pool: FencePool::new(&device),
            command_pools: BTreeMap::new(),
            semaphore_pool: SemaphorePool::new(&device),
            render_target,
            thread_count: thread_count.max(1),
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
            device,
        }
    }

    pub fn with_fence_timeout(mut self, timeout: u64) -> Self {
        self.fence_timeout = timeout;
        self
    }

    /// Wait for this frame's previous submission, then recycle fences, command pools and semaphores.
    #[profiling::function]
    pub fn reset(&mut self) -> RhiResult<()> {
        if self.fence_pool.wait(self.fence_timeout)? == FenceWait::TimedOut {
            return Err(RhiError::FenceTimeout);
        }
        self.fence_pool.reset()?;

        for pool in self.command_pools.values_mut().flatten() {
            pool.reset_pool()?;
        }

        self.semaphore_pool.reset();
        Ok(())
    }

    #[inline]
    pub fn device(&self) -> &Arc<RenderDevice> { &self.device }

    #[inline]
    pub fn thread_count(&self) -> usize { self.thread_count }

    #[inline]
    pub fn fence_pool(&self) -> &FencePool { &self.fence_pool }

    #[inline]
    pub fn semaphore_pool(&self) -> &SemaphorePool { &self.semaphore_pool }

    pub fn request_fence(&mut self) -> RhiResult<vk::Fence> {
        self.fence_pool.request_fence()
    }

    pub fn return_unsubmitted_fence(&mut self, fence: vk::Fence) {
        self.fence_pool.return_unsubmitted_fence(fence);
    }

    pub fn request_semaphore(&mut self) -> RhiResult<vk::Semaphore> {
        self.semaphore_pool.request_semaphore()
    }

    pub fn request_semaphore_with_ownership(&mut self) -> RhiResult<vk::Semaphore> {
        self.semaphore_pool.request_semaphore_with_ownership()
    }

    pub fn release_owned_semaphore(&mut self, semaphore: vk::Semaphore) {
        self.semaphore_pool.release_owned_semaphore(semaphore);
    }

    /// One command pool per recording thread for `queue`'s family.
    ///
    /// Pools are created on first use; asking with a different reset mode waits for
    /// the device and rebuilds them.
    pub fn command_pools(
        &mut self,
        queue: &Queue,
        reset_mode: CommandBufferResetMode,
    ) -> RhiResult<&mut [CommandPool]> {
        let family = queue.family_index();

        let stale = self
            .command_pools
            .get(&family)
            .and_then(|pools| pools.first())
            .is_some_and(|pool| pool.reset_mode() != reset_mode);
        if stale {
            log::info!("Command pool reset mode changed to {reset_mode:?} for queue family {family}, recreating pools");
            self.device.wait_idle()?;
            self.command_pools.remove(&family);
        }

        if !self.command_pools.contains_key(&family) {
            let pools = (0..self.thread_count)
                .map(|thread| CommandPool::new(&self.device, family, thread, reset_mode))
                .collect::<RhiResult<Vec<_>>>()?;
            self.command_pools.insert(family, pools);
        }

        match self.command_pools.get_mut(&family) {
            Some(pools) => Ok(pools.as_mut_slice()),
            None => Err(RhiError::QueueNotFound(format!("command pools for family {family}"))),
        }
    }

    pub fn request_command_buffer(
        &mut self,
        queue: &Queue,
        reset_mode: CommandBufferResetMode,
        level: vk::CommandBufferLevel,
        thread_index: usize,
    ) -> RhiResult<&mut CommandBuffer> {
        let count = self.thread_count;
        let pools = self.command_pools(queue, reset_mode)?;
        let pool = pools
            .get_mut(thread_index)
            .ok_or(RhiError::ThreadIndexOutOfRange { index: thread_index, count })?;
        pool.request_command_buffer(level)
    }

    /// Like [`request_command_buffer`](Self::request_command_buffer), also lending out the
    /// render target so a pass over it can be recorded straight away.
    pub fn request_command_buffer_with_target(
        &mut self,
        queue: &Queue,
        reset_mode: CommandBufferResetMode,
        level: vk::CommandBufferLevel,
        thread_index: usize,
    ) -> RhiResult<(&mut CommandBuffer, &RenderTarget)> {
        self.command_pools(queue, reset_mode)?;

        let count = self.thread_count;
        let pool = self
            .command_pools
            .get_mut(&queue.family_index())
            .and_then(|pools| pools.get_mut(thread_index))
            .ok_or(RhiError::ThreadIndexOutOfRange { index: thread_index, count })?;

        Ok((pool.request_command_buffer(level)?, &self.render_target))
    }

    #[inline]
    pub fn render_target(&self) -> &RenderTarget { &self.render_target }

    #[inline]
    pub fn render_target_mut(&mut self) -> &mut RenderTarget { &mut self.render_target }

    pub fn update_render_target(&mut self, render_target: RenderTarget) {
        self.render_target = render_target;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Image, ImageDesc};
    use crate::null::NullBackend;

    fn frame(threads: usize) -> (Arc<NullBackend>, Arc<RenderDevice>, RenderFrame) {
        let backend = Arc::new(NullBackend::new());
        let device = Arc::new(RenderDevice::new(backend.clone()).unwrap());
        let image = Image::new(
            &device,
            &ImageDesc::new_color_attachment(vk::Extent2D { width: 4, height: 4 }, vk::Format::R8G8B8A8_SRGB),
        )
        .unwrap();
        let target = RenderTarget::from_images(&device, vec![image]).unwrap();
        let frame = RenderFrame::new(device.clone(), target, threads);
        (backend, device, frame)
    }

    #[test]
    fn thread_index_is_bounded() {
        let (_backend, device, mut frame) = frame(2);
        let queue = device.suitable_graphics_queue().unwrap();

        assert!(frame
            .request_command_buffer(&queue, CommandBufferResetMode::ResetPool, vk::CommandBufferLevel::PRIMARY, 1)
            .is_ok());
        assert!(matches!(
            frame.request_command_buffer(&queue, CommandBufferResetMode::ResetPool, vk::CommandBufferLevel::PRIMARY, 2),
            Err(RhiError::ThreadIndexOutOfRange { index: 2, count: 2 })
        ));
    }

    #[test]
    fn changing_reset_mode_rebuilds_pools() {
        let (backend, device, mut frame) = frame(3);
        let queue = device.suitable_graphics_queue().unwrap();

        assert_eq!(frame.command_pools(&queue, CommandBufferResetMode::ResetPool).unwrap().len(), 3);
        assert_eq!(backend.counters().command_pools_created, 3);
        frame.command_pools(&queue, CommandBufferResetMode::ResetPool).unwrap();
        assert_eq!(backend.counters().command_pools_created, 3);

        let waits = backend.counters().wait_idle;
        let pools = frame.command_pools(&queue, CommandBufferResetMode::AlwaysAllocate).unwrap();
        assert!(pools.iter().all(|p| p.reset_mode() == CommandBufferResetMode::AlwaysAllocate));
        assert_eq!(backend.counters().wait_idle, waits + 1);
        assert_eq!(backend.live_objects().command_pools, 3);
    }

    #[test]
    fn reset_recycles_everything() {
        let (backend, device, mut frame) = frame(1);
        let queue = device.suitable_graphics_queue().unwrap();

        let cmd = frame
            .request_command_buffer(&queue, CommandBufferResetMode::ResetPool, vk::CommandBufferLevel::PRIMARY, 0)
            .unwrap()
            .handle();
        let fence = frame.request_fence().unwrap();
        frame.request_semaphore().unwrap();
        device
            .submit(&queue, &crate::backend::SubmitBatch { command_buffers: &[cmd], ..Default::default() }, fence)
            .unwrap();

        frame.reset().unwrap();
        assert_eq!(frame.fence_pool().active_fence_count(), 0);
        assert_eq!(frame.semaphore_pool().active_semaphore_count(), 0);
        assert_eq!(backend.counters().command_pool_resets, 1);
        assert_eq!(backend.is_fence_signaled(fence), Some(false));
    }

    #[test]
    fn unsignaled_fence_times_out() {
        let (_backend, _device, mut frame) = frame(1);
        frame.request_fence().unwrap();
        let mut frame = frame.with_fence_timeout(0);
        assert!(matches!(frame.reset(), Err(RhiError::FenceTimeout)));
    }
}
