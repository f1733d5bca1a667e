//! CPU-only backend.
//!
//! Hands out unique handles, tracks which objects are alive, and completes every
//! submission immediately: a submitted fence is signaled before `queue_submit`
//! returns. A fence that was never submitted stays unsignaled, so waiting on it
//! reports [`FenceWait::TimedOut`] instead of blocking forever.
//!
//! The surface is scriptable (extent, transform, image count) as are the
//! results of upcoming acquire and present calls, which lets the frame loop be
//! driven through resize and out-of-date paths without a window.

use std::collections::VecDeque;

use ash::vk::{self, Handle};
use nadir_core::collections::hashmap::HashMap;
use nadir_core::collections::hashset::HashSet;
use parking_lot::Mutex;

use crate::backend::{DeviceBackend, Inheritance, QueueFamilyInfo, RenderPassBegin, RenderPassDesc, SubmitBatch};
use crate::error::{RhiError, RhiResult};
use crate::image::ImageDesc;
use crate::synchronization::FenceWait;

/// Call counters, for asserting how the engine drove the device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NullCounters {
    pub fences_created: usize,
    pub fence_waits: usize,
    pub fence_resets: usize,
    pub semaphores_created: usize,
    pub command_pools_created: usize,
    pub command_pool_resets: usize,
    pub command_buffer_allocations: usize,
    pub command_buffer_resets: usize,
    pub command_buffer_frees: usize,
    pub render_passes_created: usize,
    pub framebuffers_created: usize,
    pub render_pass_begins: usize,
    pub image_barriers: usize,
    pub submits: usize,
    pub wait_idle: usize,
    pub swapchains_created: usize,
    pub acquires: usize,
    pub presents: usize,
}

/// Number of objects currently alive per kind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LiveObjects {
    pub fences: usize,
    pub semaphores: usize,
    pub command_pools: usize,
    pub command_buffers: usize,
    pub images: usize,
    pub image_views: usize,
    pub render_passes: usize,
    pub framebuffers: usize,
    pub swapchains: usize,
}

/// A queue submission as seen by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSubmit {
    pub queue: vk::Queue,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub fence: vk::Fence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedPresent {
    pub swapchain: vk::SwapchainKHR,
    pub image_index: u32,
    pub wait_semaphore: vk::Semaphore,
}

struct NullSurface {
    handle: vk::SurfaceKHR,
    extent: vk::Extent2D,
    /// Report `u32::MAX` as the current extent, as window systems that let the swapchain decide do.
    unbounded: bool,
    min_image_count: u32,
    max_image_count: u32,
    transform: vk::SurfaceTransformFlagsKHR,
}

struct NullSwapchain {
    images: Vec<vk::Image>,
    extent: vk::Extent2D,
    pre_transform: vk::SurfaceTransformFlagsKHR,
    next_image: u32,
    retired: bool,
}

impl NullSwapchain {
    /// Surface extent this swapchain was built for, undoing a quarter-turn pre-transform.
    fn surface_extent(&self) -> vk::Extent2D {
        let quarter_turn = vk::SurfaceTransformFlagsKHR::ROTATE_90 | vk::SurfaceTransformFlagsKHR::ROTATE_270;
        if self.pre_transform.intersects(quarter_turn) {
            vk::Extent2D { width: self.extent.height, height: self.extent.width }
        } else {
            self.extent
        }
    }
}

struct State {
    next_handle: u64,
    fences: HashMap<vk::Fence, bool>,
    semaphores: HashSet<vk::Semaphore>,
    command_pools: HashMap<vk::CommandPool, Vec<vk::CommandBuffer>>,
    buffer_resets: HashMap<vk::CommandBuffer, usize>,
    inheritance: HashMap<vk::CommandBuffer, Inheritance>,
    images: HashSet<vk::Image>,
    image_views: HashSet<vk::ImageView>,
    render_passes: HashMap<vk::RenderPass, RenderPassDesc>,
    framebuffers: HashSet<vk::Framebuffer>,
    swapchains: HashMap<vk::SwapchainKHR, NullSwapchain>,
    surface: Option<NullSurface>,
    unsupported_formats: Vec<vk::Format>,
    acquire_script: VecDeque<vk::Result>,
    present_script: VecDeque<vk::Result>,
    submit_script: VecDeque<vk::Result>,
    submissions: Vec<RecordedSubmit>,
    presents: Vec<RecordedPresent>,
    counters: NullCounters,
}

impl State {
    fn next<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }
}

pub struct NullBackend {
    queue_families: Vec<QueueFamilyInfo>,
    state: Mutex<State>,
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NullBackend {
    /// One graphics+compute+transfer family with a single present-capable queue, no surface.
    pub fn new() -> Self {
        Self::with_queue_families(vec![QueueFamilyInfo {
            index: 0,
            flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            queue_count: 1,
            present_supported: true,
        }])
    }

    pub fn with_queue_families(queue_families: Vec<QueueFamilyInfo>) -> Self {
        Self {
            queue_families,
            state: Mutex::new(State {
                next_handle: 0x1000,
                fences: HashMap::default(),
                semaphores: HashSet::default(),
                command_pools: HashMap::default(),
                buffer_resets: HashMap::default(),
                inheritance: HashMap::default(),
                images: HashSet::default(),
                image_views: HashSet::default(),
                render_passes: HashMap::default(),
                framebuffers: HashSet::default(),
                swapchains: HashMap::default(),
                surface: None,
                unsupported_formats: Vec::new(),
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                submit_script: VecDeque::new(),
                submissions: Vec::new(),
                presents: Vec::new(),
                counters: NullCounters::default(),
            }),
        }
    }

    /// Attach a presentable surface of the given extent supporting `min..=max` swapchain images.
    pub fn with_surface(self, extent: vk::Extent2D, min_image_count: u32, max_image_count: u32) -> Self {
        {
            let mut state = self.state.lock();
            let handle = state.next();
            state.surface = Some(NullSurface {
                handle,
                extent,
                unbounded: false,
                min_image_count,
                max_image_count,
                transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            });
        }
        self
    }

    /// Simulate a window resize.
    pub fn set_surface_extent(&self, extent: vk::Extent2D) {
        if let Some(surface) = self.state.lock().surface.as_mut() {
            surface.extent = extent;
        }
    }

    pub fn set_surface_unbounded(&self, unbounded: bool) {
        if let Some(surface) = self.state.lock().surface.as_mut() {
            surface.unbounded = unbounded;
        }
    }

    pub fn set_surface_transform(&self, transform: vk::SurfaceTransformFlagsKHR) {
        if let Some(surface) = self.state.lock().surface.as_mut() {
            surface.transform = transform;
        }
    }

    /// Formats reported without any optimal-tiling features.
    pub fn set_unsupported_formats(&self, formats: &[vk::Format]) {
        self.state.lock().unsupported_formats = formats.to_vec();
    }

    /// Queue the outcome of an upcoming acquire (`SUCCESS`, `SUBOPTIMAL_KHR` or an error code).
    pub fn script_acquire(&self, result: vk::Result) {
        self.state.lock().acquire_script.push_back(result);
    }

    /// Queue the outcome of an upcoming present.
    pub fn script_present(&self, result: vk::Result) {
        self.state.lock().present_script.push_back(result);
    }

    /// Fail the next queue submission with `result`; the fence is left unsignaled.
    pub fn script_submit_failure(&self, result: vk::Result) {
        self.state.lock().submit_script.push_back(result);
    }

    pub fn counters(&self) -> NullCounters {
        self.state.lock().counters
    }

    pub fn live_objects(&self) -> LiveObjects {
        let state = self.state.lock();
        LiveObjects {
            fences: state.fences.len(),
            semaphores: state.semaphores.len(),
            command_pools: state.command_pools.len(),
            command_buffers: state.command_pools.values().map(Vec::len).sum(),
            images: state.images.len(),
            image_views: state.image_views.len(),
            render_passes: state.render_passes.len(),
            framebuffers: state.framebuffers.len(),
            swapchains: state.swapchains.len(),
        }
    }

    pub fn is_fence_signaled(&self, fence: vk::Fence) -> Option<bool> {
        self.state.lock().fences.get(&fence).copied()
    }

    pub fn is_semaphore_alive(&self, semaphore: vk::Semaphore) -> bool {
        self.state.lock().semaphores.contains(&semaphore)
    }

    /// How many times an individual command buffer was reset.
    pub fn command_buffer_reset_count(&self, buffer: vk::CommandBuffer) -> usize {
        self.state.lock().buffer_resets.get(&buffer).copied().unwrap_or(0)
    }

    /// Inheritance a secondary command buffer was last begun with.
    pub fn inheritance(&self, buffer: vk::CommandBuffer) -> Option<Inheritance> {
        self.state.lock().inheritance.get(&buffer).copied()
    }

    pub fn render_pass_desc(&self, render_pass: vk::RenderPass) -> Option<RenderPassDesc> {
        self.state.lock().render_passes.get(&render_pass).cloned()
    }

    pub fn submissions(&self) -> Vec<RecordedSubmit> {
        self.state.lock().submissions.clone()
    }

    pub fn presents(&self) -> Vec<RecordedPresent> {
        self.state.lock().presents.clone()
    }

    fn check_surface(state: &State, surface: vk::SurfaceKHR) -> RhiResult<()> {
        match &state.surface {
            Some(s) if s.handle == surface => Ok(()),
            _ => Err(RhiError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR)),
        }
    }
}

impl DeviceBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn queue_families(&self) -> &[QueueFamilyInfo] {
        &self.queue_families
    }

    fn queue(&self, family_index: u32, queue_index: u32) -> vk::Queue {
        vk::Queue::from_raw(0x100 + ((family_index as u64) << 4) + queue_index as u64)
    }

    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        if self.state.lock().unsupported_formats.contains(&format) {
            return vk::FormatProperties::default();
        }
        vk::FormatProperties {
            linear_tiling_features: vk::FormatFeatureFlags::empty(),
            optimal_tiling_features: vk::FormatFeatureFlags::COLOR_ATTACHMENT
                | vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
                | vk::FormatFeatureFlags::SAMPLED_IMAGE,
            buffer_features: vk::FormatFeatureFlags::empty(),
        }
    }

    fn wait_idle(&self) -> RhiResult<()> {
        self.state.lock().counters.wait_idle += 1;
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let mut state = self.state.lock();
        let fence = state.next();
        state.fences.insert(fence, signaled);
        state.counters.fences_created += 1;
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().fences.remove(&fence);
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], _timeout: u64) -> RhiResult<FenceWait> {
        let mut state = self.state.lock();
        state.counters.fence_waits += 1;
        let mut all_signaled = true;
        for fence in fences {
            match state.fences.get(fence) {
                Some(signaled) => all_signaled &= *signaled,
                None => return Err(RhiError::Vulkan(vk::Result::ERROR_UNKNOWN)),
            }
        }
        Ok(if all_signaled { FenceWait::Signaled } else { FenceWait::TimedOut })
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()> {
        let mut state = self.state.lock();
        state.counters.fence_resets += 1;
        for fence in fences {
            if let Some(signaled) = state.fences.get_mut(fence) {
                *signaled = false;
            }
        }
        Ok(())
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore = state.next();
        state.semaphores.insert(semaphore);
        state.counters.semaphores_created += 1;
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().semaphores.remove(&semaphore);
    }

    fn create_command_pool(&self, _queue_family_index: u32, _flags: vk::CommandPoolCreateFlags) -> RhiResult<vk::CommandPool> {
        let mut state = self.state.lock();
        let pool = state.next();
        state.command_pools.insert(pool, Vec::new());
        state.counters.command_pools_created += 1;
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.state.lock().command_pools.remove(&pool);
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()> {
        let mut state = self.state.lock();
        if !state.command_pools.contains_key(&pool) {
            return Err(RhiError::Vulkan(vk::Result::ERROR_UNKNOWN));
        }
        state.counters.command_pool_resets += 1;
        Ok(())
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool, _level: vk::CommandBufferLevel) -> RhiResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        let buffer = state.next();
        state
            .command_pools
            .get_mut(&pool)
            .ok_or(RhiError::Vulkan(vk::Result::ERROR_UNKNOWN))?
            .push(buffer);
        state.counters.command_buffer_allocations += 1;
        Ok(buffer)
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        if let Some(allocated) = state.command_pools.get_mut(&pool) {
            allocated.retain(|b| !buffers.contains(b));
        }
        state.counters.command_buffer_frees += buffers.len();
    }

    fn reset_command_buffer(&self, buffer: vk::CommandBuffer, _flags: vk::CommandBufferResetFlags) -> RhiResult<()> {
        let mut state = self.state.lock();
        *state.buffer_resets.entry(buffer).or_insert(0) += 1;
        state.counters.command_buffer_resets += 1;
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
        inheritance: Option<&Inheritance>,
    ) -> RhiResult<()> {
        if let Some(inheritance) = inheritance {
            self.state.lock().inheritance.insert(buffer, *inheritance);
        }
        Ok(())
    }

    fn end_command_buffer(&self, _buffer: vk::CommandBuffer) -> RhiResult<()> {
        Ok(())
    }

    fn cmd_begin_render_pass(&self, _buffer: vk::CommandBuffer, _begin: &RenderPassBegin<'_>, _contents: vk::SubpassContents) {
        self.state.lock().counters.render_pass_begins += 1;
    }

    fn cmd_next_subpass(&self, _buffer: vk::CommandBuffer, _contents: vk::SubpassContents) {}

    fn cmd_end_render_pass(&self, _buffer: vk::CommandBuffer) {}

    fn cmd_image_barrier(
        &self,
        _buffer: vk::CommandBuffer,
        _src_stage: vk::PipelineStageFlags,
        _dst_stage: vk::PipelineStageFlags,
        _barrier: &vk::ImageMemoryBarrier<'_>,
    ) {
        self.state.lock().counters.image_barriers += 1;
    }

    fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch<'_>, fence: vk::Fence) -> RhiResult<()> {
        let mut state = self.state.lock();
        state.counters.submits += 1;
        if let Some(result) = state.submit_script.pop_front() {
            return Err(result.into());
        }
        if fence != vk::Fence::null() {
            *state
                .fences
                .get_mut(&fence)
                .ok_or(RhiError::Vulkan(vk::Result::ERROR_UNKNOWN))? = true;
        }
        state.submissions.push(RecordedSubmit {
            queue,
            wait_semaphores: batch.wait_semaphores.to_vec(),
            wait_stages: batch.wait_stages.to_vec(),
            command_buffers: batch.command_buffers.to_vec(),
            signal_semaphores: batch.signal_semaphores.to_vec(),
            fence,
        });
        Ok(())
    }

    fn create_image(&self, _desc: &ImageDesc) -> RhiResult<vk::Image> {
        let mut state = self.state.lock();
        let image = state.next();
        state.images.insert(image);
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        self.state.lock().images.remove(&image);
    }

    fn create_image_view(&self, _info: &vk::ImageViewCreateInfo<'_>) -> RhiResult<vk::ImageView> {
        let mut state = self.state.lock();
        let view = state.next();
        state.image_views.insert(view);
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state.lock().image_views.remove(&view);
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> RhiResult<vk::RenderPass> {
        let mut state = self.state.lock();
        let render_pass = state.next();
        state.render_passes.insert(render_pass, desc.clone());
        state.counters.render_passes_created += 1;
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.state.lock().render_passes.remove(&render_pass);
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        _attachments: &[vk::ImageView],
        _extent: vk::Extent2D,
    ) -> RhiResult<vk::Framebuffer> {
        let mut state = self.state.lock();
        if !state.render_passes.contains_key(&render_pass) {
            return Err(RhiError::Vulkan(vk::Result::ERROR_UNKNOWN));
        }
        let framebuffer = state.next();
        state.framebuffers.insert(framebuffer);
        state.counters.framebuffers_created += 1;
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.state.lock().framebuffers.remove(&framebuffer);
    }

    fn surface(&self) -> Option<vk::SurfaceKHR> {
        self.state.lock().surface.as_ref().map(|s| s.handle)
    }

    fn surface_capabilities(&self, surface: vk::SurfaceKHR) -> RhiResult<vk::SurfaceCapabilitiesKHR> {
        let state = self.state.lock();
        Self::check_surface(&state, surface)?;
        let Some(s) = state.surface.as_ref() else {
            return Err(RhiError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR));
        };
        let current_extent = if s.unbounded {
            vk::Extent2D { width: u32::MAX, height: u32::MAX }
        } else {
            s.extent
        };
        Ok(vk::SurfaceCapabilitiesKHR {
            min_image_count: s.min_image_count,
            max_image_count: s.max_image_count,
            current_extent,
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 16384, height: 16384 },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY
                | vk::SurfaceTransformFlagsKHR::ROTATE_90
                | vk::SurfaceTransformFlagsKHR::ROTATE_180
                | vk::SurfaceTransformFlagsKHR::ROTATE_270,
            current_transform: s.transform,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE | vk::CompositeAlphaFlagsKHR::INHERIT,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
            ..Default::default()
        })
    }

    fn surface_formats(&self, surface: vk::SurfaceKHR) -> RhiResult<Vec<vk::SurfaceFormatKHR>> {
        Self::check_surface(&self.state.lock(), surface)?;
        Ok(vec![
            vk::SurfaceFormatKHR { format: vk::Format::B8G8R8A8_UNORM, color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR },
            vk::SurfaceFormatKHR { format: vk::Format::B8G8R8A8_SRGB, color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR },
        ])
    }

    fn surface_present_modes(&self, surface: vk::SurfaceKHR) -> RhiResult<Vec<vk::PresentModeKHR>> {
        Self::check_surface(&self.state.lock(), surface)?;
        Ok(vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX])
    }

    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR<'_>) -> RhiResult<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        Self::check_surface(&state, info.surface)?;
        if let Some(old) = state.swapchains.get_mut(&info.old_swapchain) {
            old.retired = true;
        }
        let images = (0..info.min_image_count).map(|_| state.next()).collect();
        let swapchain = state.next();
        state.swapchains.insert(
            swapchain,
            NullSwapchain {
                images,
                extent: info.image_extent,
                pre_transform: info.pre_transform,
                next_image: 0,
                retired: false,
            },
        );
        state.counters.swapchains_created += 1;
        Ok(swapchain)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.state.lock().swapchains.remove(&swapchain);
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RhiResult<Vec<vk::Image>> {
        self.state
            .lock()
            .swapchains
            .get(&swapchain)
            .map(|s| s.images.clone())
            .ok_or(RhiError::Vulkan(vk::Result::ERROR_UNKNOWN))
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout: u64,
        _semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), vk::Result> {
        let mut state = self.state.lock();
        state.counters.acquires += 1;
        let scripted = state.acquire_script.pop_front().unwrap_or(vk::Result::SUCCESS);
        let surface_extent = state.surface.as_ref().filter(|s| !s.unbounded).map(|s| s.extent);

        let chain = state.swapchains.get_mut(&swapchain).ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?;
        if chain.retired || surface_extent.is_some_and(|extent| extent != chain.surface_extent()) {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }

        let suboptimal = match scripted {
            vk::Result::SUCCESS => false,
            vk::Result::SUBOPTIMAL_KHR => true,
            error => return Err(error),
        };
        let index = chain.next_image;
        chain.next_image = (chain.next_image + 1) % chain.images.len().max(1) as u32;
        Ok((index, suboptimal))
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool, vk::Result> {
        let mut state = self.state.lock();
        state.counters.presents += 1;
        state.presents.push(RecordedPresent { swapchain, image_index, wait_semaphore });
        match state.present_script.pop_front().unwrap_or(vk::Result::SUCCESS) {
            vk::Result::SUCCESS => Ok(false),
            vk::Result::SUBOPTIMAL_KHR => Ok(true),
            error => Err(error),
        }
    }
}
