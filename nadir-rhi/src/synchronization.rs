//! Recycled fence and semaphore pools.
//!
//! Both pools only grow. `objects[..active]` are in use this generation and
//! `objects[active..]` are idle; `reset()` rewinds the watermark.

use ash::vk;
use nadir_core::log;
use nadir_rhi_derive::DeviceObject;

use crate::device::RenderDevice;
use crate::error::RhiResult;

/// Outcome of a host-side fence wait. Timing out is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWait {
    Signaled,
    TimedOut,
}

#[DeviceObject]
pub struct FencePool {
    fences: Vec<vk::Fence>,
    active_fence_count: usize,
}

impl FencePool {
    pub fn new(device: &RenderDevice) -> Self {
        Self {
            fences: Vec::new(),
            active_fence_count: 0,
            device: device.backend().clone(),
        }
    }

    /// Returns an idle unsignaled fence, creating one only when none is idle.
    pub fn request_fence(&mut self) -> RhiResult<vk::Fence> {
        if let Some(&fence) = self.fences.get(self.active_fence_count) {
            self.active_fence_count += 1;
            return Ok(fence);
        }

        let fence = self.device.create_fence(false)?;
        self.fences.push(fence);
        self.active_fence_count += 1;
        Ok(fence)
    }

    /// Give back the last requested fence when the work it guarded was never submitted,
    /// so the next wait does not block on it.
    pub fn return_unsubmitted_fence(&mut self, fence: vk::Fence) {
        let last = self.active_fence_count.checked_sub(1);
        if last.and_then(|i| self.fences.get(i)) == Some(&fence) {
            self.active_fence_count -= 1;
        } else {
            log::warn!("Fence {fence:?} is not the last one requested, keeping it active");
        }
    }

    /// Blocks until every active fence signals or `timeout` nanoseconds pass.
    #[profiling::function]
    pub fn wait(&self, timeout: u64) -> RhiResult<FenceWait> {
        if self.active_fence_count == 0 {
            return Ok(FenceWait::Signaled);
        }
        self.device.wait_for_fences(&self.fences[..self.active_fence_count], timeout)
    }

    /// Unsignals every active fence and marks them idle.
    pub fn reset(&mut self) -> RhiResult<()> {
        if self.active_fence_count == 0 {
            return Ok(());
        }
        self.device.reset_fences(&self.fences[..self.active_fence_count])?;
        self.active_fence_count = 0;
        Ok(())
    }

    #[inline]
    pub fn active_fence_count(&self) -> usize { self.active_fence_count }

    #[inline]
    pub fn len(&self) -> usize { self.fences.len() }

    #[inline]
    pub fn is_empty(&self) -> bool { self.fences.is_empty() }
}

impl Drop for FencePool {
    fn drop(&mut self) {
        match self.wait(u64::MAX) {
            Ok(FenceWait::Signaled) => {}
            Ok(FenceWait::TimedOut) => log::warn!("Destroying {} fences that never signaled", self.active_fence_count),
            Err(e) => log::error!("Fence wait failed while destroying pool: {e}"),
        }
        for fence in self.fences.drain(..) {
            self.device.destroy_fence(fence);
        }
    }
}

#[DeviceObject]
pub struct SemaphorePool {
    semaphores: Vec<vk::Semaphore>,
    active_semaphore_count: usize,
    /// Handed out with ownership and given back, but possibly still pending on the GPU.
    released_semaphores: Vec<vk::Semaphore>,
}

impl SemaphorePool {
    pub fn new(device: &RenderDevice) -> Self {
        Self {
            semaphores: Vec::new(),
            active_semaphore_count: 0,
            released_semaphores: Vec::new(),
            device: device.backend().clone(),
        }
    }

    pub fn request_semaphore(&mut self) -> RhiResult<vk::Semaphore> {
        if let Some(&semaphore) = self.semaphores.get(self.active_semaphore_count) {
            self.active_semaphore_count += 1;
            return Ok(semaphore);
        }

        let semaphore = self.device.create_semaphore()?;
        self.semaphores.push(semaphore);
        self.active_semaphore_count += 1;
        Ok(semaphore)
    }

    /// Removes a semaphore from the pool entirely.
    ///
    /// The caller owns it until [`release_owned_semaphore`](Self::release_owned_semaphore)
    /// hands it back; a freshly created one is not tracked by the pool at all.
    pub fn request_semaphore_with_ownership(&mut self) -> RhiResult<vk::Semaphore> {
        if self.active_semaphore_count < self.semaphores.len() {
            if let Some(semaphore) = self.semaphores.pop() {
                return Ok(semaphore);
            }
        }
        self.device.create_semaphore()
    }

    /// Returns an owned semaphore. It is quarantined until the next [`reset`](Self::reset).
    pub fn release_owned_semaphore(&mut self, semaphore: vk::Semaphore) {
        self.released_semaphores.push(semaphore);
    }

    pub fn reset(&mut self) {
        self.active_semaphore_count = 0;
        self.semaphores.append(&mut self.released_semaphores);
    }

    #[inline]
    pub fn active_semaphore_count(&self) -> usize { self.active_semaphore_count }

    #[inline]
    pub fn len(&self) -> usize { self.semaphores.len() }

    #[inline]
    pub fn is_empty(&self) -> bool { self.semaphores.is_empty() }

    #[inline]
    pub fn released_count(&self) -> usize { self.released_semaphores.len() }
}

impl Drop for SemaphorePool {
    fn drop(&mut self) {
        self.reset();
        for semaphore in self.semaphores.drain(..) {
            self.device.destroy_semaphore(semaphore);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SubmitBatch;
    use crate::null::NullBackend;
    use std::sync::Arc;

    fn device() -> (Arc<NullBackend>, RenderDevice) {
        let backend = Arc::new(NullBackend::new());
        let device = RenderDevice::new(backend.clone()).unwrap();
        (backend, device)
    }

    #[test]
    fn fence_pool_grows_only_to_the_per_cycle_peak() {
        let (backend, device) = device();
        let mut pool = FencePool::new(&device);
        let queue = device.suitable_graphics_queue().unwrap();

        for requests in [3usize, 2, 3, 1] {
            for _ in 0..requests {
                let fence = pool.request_fence().unwrap();
                device.submit(&queue, &SubmitBatch::default(), fence).unwrap();
            }
            assert_eq!(pool.active_fence_count(), requests);
            assert_eq!(pool.wait(u64::MAX).unwrap(), FenceWait::Signaled);
            pool.reset().unwrap();
            assert_eq!(pool.active_fence_count(), 0);
            assert!(pool.len() <= 3);
        }
        assert_eq!(backend.counters().fences_created, 3);
    }

    #[test]
    fn reused_fences_count_as_active() {
        let (_backend, device) = device();
        let mut pool = FencePool::new(&device);
        let first = pool.request_fence().unwrap();
        pool.reset().unwrap();

        assert_eq!(pool.request_fence().unwrap(), first);
        assert_eq!(pool.active_fence_count(), 1);
        assert_ne!(pool.request_fence().unwrap(), first);
    }

    #[test]
    fn unsignaled_fence_times_out_without_error() {
        let (_backend, device) = device();
        let mut pool = FencePool::new(&device);
        assert_eq!(pool.wait(0).unwrap(), FenceWait::Signaled);

        pool.request_fence().unwrap();
        assert_eq!(pool.wait(1_000).unwrap(), FenceWait::TimedOut);
    }

    #[test]
    fn unsubmitted_fence_goes_back_to_the_pool() {
        let (backend, device) = device();
        let mut pool = FencePool::new(&device);
        let queue = device.suitable_graphics_queue().unwrap();
        let submitted = pool.request_fence().unwrap();
        device.submit(&queue, &SubmitBatch::default(), submitted).unwrap();

        backend.script_submit_failure(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let failed = pool.request_fence().unwrap();
        assert!(device.submit(&queue, &SubmitBatch::default(), failed).is_err());
        pool.return_unsubmitted_fence(failed);

        assert_eq!(pool.active_fence_count(), 1);
        assert_eq!(pool.wait(0).unwrap(), FenceWait::Signaled);

        // Only the most recent request can be handed back.
        pool.return_unsubmitted_fence(failed);
        assert_eq!(pool.active_fence_count(), 1);
        assert_eq!(pool.request_fence().unwrap(), failed);
    }

    #[test]
    fn reset_unsignals_active_fences() {
        let (backend, device) = device();
        let mut pool = FencePool::new(&device);
        let queue = device.suitable_graphics_queue().unwrap();
        let fence = pool.request_fence().unwrap();
        device.submit(&queue, &SubmitBatch::default(), fence).unwrap();
        assert_eq!(backend.is_fence_signaled(fence), Some(true));

        pool.reset().unwrap();
        assert_eq!(backend.is_fence_signaled(fence), Some(false));
    }

    #[test]
    fn semaphore_pool_recycles_after_reset() {
        let (backend, device) = device();
        let mut pool = SemaphorePool::new(&device);
        let a = pool.request_semaphore().unwrap();
        let b = pool.request_semaphore().unwrap();
        assert_ne!(a, b);
        pool.reset();

        assert_eq!(pool.active_semaphore_count(), 0);
        assert_eq!(pool.request_semaphore().unwrap(), a);
        assert_eq!(pool.request_semaphore().unwrap(), b);
        assert_eq!(backend.counters().semaphores_created, 2);
    }

    #[test]
    fn owned_semaphores_are_quarantined_until_reset() {
        let (_backend, device) = device();
        let mut pool = SemaphorePool::new(&device);

        let owned = pool.request_semaphore_with_ownership().unwrap();
        assert_eq!(pool.len(), 0);
        pool.release_owned_semaphore(owned);
        assert_eq!(pool.released_count(), 1);

        let fresh = pool.request_semaphore().unwrap();
        assert_ne!(fresh, owned);

        pool.reset();
        assert_eq!(pool.released_count(), 0);
        assert_eq!(pool.len(), 2);
        let recycled = [pool.request_semaphore().unwrap(), pool.request_semaphore().unwrap()];
        assert!(recycled.contains(&owned));
    }

    #[test]
    fn ownership_takes_an_idle_semaphore_out_of_the_pool() {
        let (_backend, device) = device();
        let mut pool = SemaphorePool::new(&device);
        let idle = pool.request_semaphore().unwrap();
        pool.reset();

        assert_eq!(pool.request_semaphore_with_ownership().unwrap(), idle);
        assert!(pool.is_empty());
    }

    #[test]
    fn dropping_pools_destroys_their_objects() {
        let (backend, device) = device();
        {
            let mut fences = FencePool::new(&device);
            let mut semaphores = SemaphorePool::new(&device);
            fences.request_fence().unwrap();
            semaphores.request_semaphore().unwrap();
            let owned = semaphores.request_semaphore_with_ownership().unwrap();
            semaphores.release_owned_semaphore(owned);
        }
        let live = backend.live_objects();
        assert_eq!(live.fences, 0);
        assert_eq!(live.semaphores, 0);
    }
}
