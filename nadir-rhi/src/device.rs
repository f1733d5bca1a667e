//! Render device - queue discovery, device-wide caches and the shared backend handle.

use std::sync::Arc;

use ash::vk;
use nadir_core::log;

use crate::backend::{DeviceBackend, SubmitBatch};
use crate::error::{RhiError, RhiResult};
use crate::queue::Queue;
use crate::resource_cache::ResourceCache;
use crate::utility::DEPTH_FORMAT_PRIORITY;

/// Shared handle to the backend every device object was created from.
pub type DeviceRef = Arc<dyn DeviceBackend>;

/// Logical device: the backend plus the queues it exposes and the device-wide resource cache.
pub struct RenderDevice {
    // Cached render passes and framebuffers must be released before the backend goes away.
    resource_cache: ResourceCache,
    queues: Vec<Vec<Queue>>,
    backend: DeviceRef,
}

impl RenderDevice {
    pub fn new(backend: DeviceRef) -> RhiResult<Self> {
        let queues = backend
            .queue_families()
            .iter()
            .map(|family| {
                (0..family.queue_count)
                    .map(|index| {
                        Queue::new(
                            backend.queue(family.index, index),
                            family.index,
                            index,
                            family.flags,
                            family.present_supported,
                        )
                    })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        if queues.iter().all(|family| family.is_empty()) {
            return Err(RhiError::QueueNotFound("any queue family".to_owned()));
        }

        log::info!(
            "Render device on '{}' with {} queue families",
            backend.name(),
            queues.len()
        );

        Ok(Self {
            resource_cache: ResourceCache::new(backend.clone()),
            queues,
            backend,
        })
    }

    #[inline]
    pub fn backend(&self) -> &DeviceRef {
        &self.backend
    }

    #[inline]
    pub fn resource_cache(&self) -> &ResourceCache {
        &self.resource_cache
    }

    /// First queue of a family supporting all of `flags`.
    pub fn queue_by_flags(&self, flags: vk::QueueFlags, queue_index: u32) -> RhiResult<Queue> {
        self.queues
            .iter()
            .find(|family| family.first().is_some_and(|q| q.flags().contains(flags)) && (queue_index as usize) < family.len())
            .map(|family| family[queue_index as usize])
            .ok_or_else(|| RhiError::QueueNotFound(format!("{flags:?} (index {queue_index})")))
    }

    /// First queue of a family that can present.
    pub fn queue_by_present(&self, queue_index: u32) -> RhiResult<Queue> {
        self.queues
            .iter()
            .find(|family| family.first().is_some_and(|q| q.can_present()) && (queue_index as usize) < family.len())
            .map(|family| family[queue_index as usize])
            .ok_or_else(|| RhiError::QueueNotFound(format!("present (index {queue_index})")))
    }

    /// A graphics queue, preferring one that can also present.
    pub fn suitable_graphics_queue(&self) -> RhiResult<Queue> {
        self.queues
            .iter()
            .flatten()
            .find(|q| q.flags().contains(vk::QueueFlags::GRAPHICS) && q.can_present())
            .copied()
            .map_or_else(|| self.queue_by_flags(vk::QueueFlags::GRAPHICS, 0), Ok)
    }

    /// First depth format in priority order usable as an optimal-tiling depth attachment.
    pub fn suitable_depth_format(&self, depth_only: bool) -> RhiResult<vk::Format> {
        DEPTH_FORMAT_PRIORITY
            .iter()
            .copied()
            .filter(|&format| !depth_only || crate::utility::is_depth_only_format(format))
            .find(|&format| {
                self.backend
                    .format_properties(format)
                    .optimal_tiling_features
                    .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            })
            .ok_or_else(|| RhiError::UnsupportedFormat(format!("depth attachment from {DEPTH_FORMAT_PRIORITY:?}")))
    }

    pub fn wait_idle(&self) -> RhiResult<()> {
        self.backend.wait_idle()
    }

    #[profiling::function]
    pub fn submit(&self, queue: &Queue, batch: &SubmitBatch<'_>, fence: vk::Fence) -> RhiResult<()> {
        self.backend.queue_submit(queue.handle(), batch, fence)
    }
}

impl Drop for RenderDevice {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            log::error!("Failed to wait for device idle on shutdown: {e}");
        }
        self.resource_cache.clear();
    }
}

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// Crate-only trait for objects that own native handles destroyed through the device backend.
///
/// This trait is sealed and not visible to users of `nadir-rhi`.
pub(crate) trait DeviceObject: sealed::Sealed {
    fn device(&self) -> &DeviceRef;

    /// Whether the object's handles were created through `device`.
    fn belongs_to(&self, device: &DeviceRef) -> bool {
        Arc::ptr_eq(self.device(), device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::QueueFamilyInfo;
    use crate::null::NullBackend;

    #[test]
    fn graphics_queue_prefers_present_capable_family() {
        let backend = Arc::new(NullBackend::with_queue_families(vec![
            QueueFamilyInfo { index: 0, flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, queue_count: 1, present_supported: false },
            QueueFamilyInfo { index: 1, flags: vk::QueueFlags::TRANSFER, queue_count: 2, present_supported: false },
            QueueFamilyInfo { index: 2, flags: vk::QueueFlags::GRAPHICS, queue_count: 1, present_supported: true },
        ]));
        let device = RenderDevice::new(backend).unwrap();

        assert_eq!(device.suitable_graphics_queue().unwrap().family_index(), 2);
        assert_eq!(device.queue_by_flags(vk::QueueFlags::GRAPHICS, 0).unwrap().family_index(), 0);
        assert_eq!(device.queue_by_flags(vk::QueueFlags::TRANSFER, 1).unwrap().index(), 1);
        assert!(device.queue_by_flags(vk::QueueFlags::SPARSE_BINDING, 0).is_err());
        assert_eq!(device.queue_by_present(0).unwrap().family_index(), 2);
    }

    #[test]
    fn graphics_queue_falls_back_without_present() {
        let backend = Arc::new(NullBackend::with_queue_families(vec![QueueFamilyInfo {
            index: 0,
            flags: vk::QueueFlags::GRAPHICS,
            queue_count: 1,
            present_supported: false,
        }]));
        let device = RenderDevice::new(backend).unwrap();
        assert_eq!(device.suitable_graphics_queue().unwrap().family_index(), 0);
    }

    #[test]
    fn depth_format_follows_priority() {
        let backend = Arc::new(NullBackend::new());
        let device = RenderDevice::new(backend.clone()).unwrap();
        assert_eq!(device.suitable_depth_format(false).unwrap(), vk::Format::D32_SFLOAT);

        backend.set_unsupported_formats(&[vk::Format::D32_SFLOAT]);
        assert_eq!(device.suitable_depth_format(false).unwrap(), vk::Format::D24_UNORM_S8_UINT);
        assert_eq!(device.suitable_depth_format(true).unwrap(), vk::Format::D16_UNORM);
    }
}
