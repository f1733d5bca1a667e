//! Nadir RHI - frame lifecycle and GPU resource recycling over a pluggable device backend.
//!
//! A [`RenderContext`] owns one [`RenderFrame`] per swapchain image (or a single
//! offscreen frame). Each frame recycles its fences, semaphores and command
//! pools every time it comes around again. Render passes and framebuffers are
//! deduplicated device-wide by the [`ResourceCache`].

pub mod backend;
pub mod command;
pub mod device;
pub mod error;
pub mod image;
pub mod null;
pub mod queue;
pub mod render_context;
pub mod render_frame;
pub mod render_pass;
pub mod render_target;
pub mod resource_cache;
pub mod swapchain;
pub mod synchronization;
pub mod vulkan;
mod utility;

pub use ash::vk;

pub use backend::{DeviceBackend, Inheritance, QueueFamilyInfo, RenderPassBegin, RenderPassDesc, SubmitBatch, SubpassDesc};
pub use command::{CommandBuffer, CommandBufferResetMode, CommandPool, ImageMemoryBarrier, RenderPassState};
pub use device::{DeviceRef, RenderDevice};
pub use error::{RhiError, RhiResult};
pub use image::{Image, ImageArena, ImageDesc, ImageView};
pub use null::NullBackend;
pub use queue::Queue;
pub use render_context::{color_only_render_target, RenderContext, DEFAULT_OFFSCREEN_FORMAT};
pub use render_frame::{RenderFrame, DEFAULT_FENCE_TIMEOUT};
pub use render_pass::{describe_render_pass, Attachment, Framebuffer, LoadStoreInfo, RenderPass, SubpassInfo};
pub use render_target::{CreateFunc, RenderTarget};
pub use resource_cache::{ResourceCache, ResourceCacheStats};
pub use swapchain::{Swapchain, SwapchainConfig, SwapchainProperties, SwapchainStatus};
pub use synchronization::{FencePool, FenceWait, SemaphorePool};
pub use utility::{format_to_aspect_mask, is_depth_format, is_depth_only_format, is_depth_stencil_format};
pub use vulkan::{VulkanBackend, VulkanOptions};
