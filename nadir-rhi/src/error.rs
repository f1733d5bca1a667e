//! RHI-specific error types.

use ash::vk;
use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),

    /// The device was lost while waiting on or submitting GPU work
    #[error("Device lost")]
    DeviceLost,

    /// Failed to load Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// Window or display handle unavailable
    #[error("Window handle error: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    #[error("Required extension or layer is not available: {0}")]
    MissingExtension(String),

    #[error("No supported format among the candidates ({0})")]
    UnsupportedFormat(String),

    /// The surface offers nothing the swapchain can be built with
    #[error("Unsupported surface: {0}")]
    UnsupportedSurface(String),

    /// Images or views of a render target disagree on type or extent
    #[error("Invalid render target: {0}")]
    InvalidRenderTarget(String),

    #[error("Cannot create a render pass without any subpass")]
    EmptySubpassList,

    /// A secondary command buffer was begun without a render pass and framebuffer to inherit
    #[error("Secondary command buffer requires a render pass and framebuffer to inherit")]
    MissingInheritance,

    #[error("Thread index {index} is out of bounds (thread count {count})")]
    ThreadIndexOutOfRange { index: usize, count: usize },

    #[error("No queue matches {0}")]
    QueueNotFound(String),

    #[error("Frame is not active, call begin() first")]
    FrameNotActive,

    #[error("Frame is still active, call end_frame() first")]
    FrameAlreadyActive,

    #[error("Render context is not prepared, call prepare() first")]
    NotPrepared,

    /// Active fences did not signal within the frame's fence timeout
    #[error("Timed out waiting for frame fences")]
    FenceTimeout,

    #[error("Failed to acquire swapchain image: {0}")]
    AcquireFailed(vk::Result),

    #[error("Failed to present swapchain image: {0}")]
    PresentFailed(vk::Result),

    /// An image key no longer refers to a live image in its arena
    #[error("Image key does not refer to a live image")]
    UnknownImage,

    #[error("Insertion error for #{id} cache object ({kind})")]
    CacheInsertion { kind: &'static str, id: usize },

    /// An object handed to the device was created by a different device
    #[error("{0} belongs to a different device")]
    ForeignDeviceObject(&'static str),
}

impl From<vk::Result> for RhiError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => RhiError::DeviceLost,
            other => RhiError::Vulkan(other),
        }
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_loss_is_distinct_from_other_vulkan_errors() {
        assert!(matches!(RhiError::from(vk::Result::ERROR_DEVICE_LOST), RhiError::DeviceLost));
        assert!(matches!(
            RhiError::from(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            RhiError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        ));
    }
}
