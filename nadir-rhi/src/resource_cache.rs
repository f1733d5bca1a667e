//! Device-wide cache of render passes and framebuffers.
//!
//! Lookups are keyed by a combined hash of the creation parameters, with a full
//! equality check so that a hash collision can never hand back the wrong object.
//! Each map has its own lock and objects are built while holding it, so two
//! threads asking for the same parameters always receive the same `Arc`.

use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use ash::vk;
use nadir_core::collections::hashmap::HashMap;
use nadir_core::collections::{DefaultHashBuilder, SmallVec};
use nadir_core::log;
use parking_lot::Mutex;

use crate::device::{DeviceObject, DeviceRef};
use crate::error::{RhiError, RhiResult};
use crate::render_pass::{Attachment, Framebuffer, LoadStoreInfo, RenderPass, SubpassInfo};
use crate::render_target::RenderTarget;

#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceCacheStats {
    pub render_pass_count: usize,
    pub framebuffer_count: usize,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct RenderPassKey {
    attachments: Vec<Attachment>,
    load_store_infos: Vec<LoadStoreInfo>,
    subpasses: Vec<SubpassInfo>,
}

/// A framebuffer is identified by the exact views (and their images) it binds and its render pass.
#[derive(Clone, PartialEq, Eq, Hash)]
struct FramebufferKey {
    views: SmallVec<[(vk::ImageView, vk::Image); 4]>,
    render_pass: vk::RenderPass,
}

/// `seed ^= h + 0x9e3779b9 + (seed << 6) + (seed >> 2)`
pub(crate) fn hash_combine<T: Hash + ?Sized>(seed: &mut u64, value: &T) {
    let h = DefaultHashBuilder::default().hash_one(value);
    *seed ^= h
        .wrapping_add(0x9e37_79b9)
        .wrapping_add(*seed << 6)
        .wrapping_add(*seed >> 2);
}

struct CacheMap<K, T> {
    entries: HashMap<u64, SmallVec<[(K, Arc<T>); 1]>>,
    len: usize,
}

impl<K: PartialEq, T> CacheMap<K, T> {
    fn new() -> Self {
        Self {
            entries: HashMap::default(),
            len: 0,
        }
    }

    fn find(&self, hash: u64, key: &K) -> Option<Arc<T>> {
        self.entries
            .get(&hash)?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    fn insert(&mut self, hash: u64, key: K, value: Arc<T>) -> Result<(), ()> {
        let bucket = self.entries.entry(hash).or_default();
        if bucket.iter().any(|(k, _)| *k == key) {
            return Err(());
        }
        bucket.push((key, value));
        self.len += 1;
        Ok(())
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.len = 0;
    }
}

fn request_resource<K: PartialEq, T>(
    map: &Mutex<CacheMap<K, T>>,
    kind: &'static str,
    hash: u64,
    key: K,
    create: impl FnOnce() -> RhiResult<T>,
) -> RhiResult<Arc<T>> {
    let mut map = map.lock();

    if let Some(found) = map.find(hash, &key) {
        return Ok(found);
    }

    let id = map.len;
    if map.entries.contains_key(&hash) {
        log::warn!("{kind} cache hash collision on {hash:#018x}");
    }
    log::debug!("Building #{id} cache object ({kind})");

    let resource = Arc::new(create()?);
    map.insert(hash, key, resource.clone())
        .map_err(|_| RhiError::CacheInsertion { kind, id })?;

    Ok(resource)
}

pub struct ResourceCache {
    // Framebuffers reference render passes, keep them first.
    framebuffers: Mutex<CacheMap<FramebufferKey, Framebuffer>>,
    render_passes: Mutex<CacheMap<RenderPassKey, RenderPass>>,
    device: DeviceRef,
}

impl ResourceCache {
    pub fn new(device: DeviceRef) -> Self {
        Self {
            framebuffers: Mutex::new(CacheMap::new()),
            render_passes: Mutex::new(CacheMap::new()),
            device,
        }
    }

    #[profiling::function]
    pub fn request_render_pass(
        &self,
        attachments: &[Attachment],
        load_store_infos: &[LoadStoreInfo],
        subpasses: &[SubpassInfo],
    ) -> RhiResult<Arc<RenderPass>> {
        let mut hash = 0;
        hash_combine(&mut hash, attachments);
        hash_combine(&mut hash, load_store_infos);
        hash_combine(&mut hash, subpasses);

        let key = RenderPassKey {
            attachments: attachments.to_vec(),
            load_store_infos: load_store_infos.to_vec(),
            subpasses: subpasses.to_vec(),
        };

        request_resource(&self.render_passes, "render pass", hash, key, || {
            RenderPass::new(&self.device, attachments, load_store_infos, subpasses)
        })
    }

    #[profiling::function]
    pub fn request_framebuffer(
        &self,
        render_target: &RenderTarget,
        render_pass: &RenderPass,
    ) -> RhiResult<Arc<Framebuffer>> {
        if !render_pass.belongs_to(&self.device) {
            return Err(RhiError::ForeignDeviceObject("render pass"));
        }
        if !render_target.views().iter().all(|view| view.belongs_to(&self.device)) {
            return Err(RhiError::ForeignDeviceObject("render target view"));
        }

        let views = render_target
            .views()
            .iter()
            .map(|view| (view.handle(), view.image_handle()))
            .collect();
        let key = FramebufferKey {
            views,
            render_pass: render_pass.handle(),
        };

        let mut hash = 0;
        hash_combine(&mut hash, &key.views[..]);
        hash_combine(&mut hash, &key.render_pass);

        request_resource(&self.framebuffers, "framebuffer", hash, key, || {
            Framebuffer::new(&self.device, render_target, render_pass)
        })
    }

    /// Drop every cached framebuffer. Needed whenever the views they reference are rebuilt.
    pub fn clear_framebuffers(&self) {
        self.framebuffers.lock().clear();
    }

    pub fn clear(&self) {
        self.clear_framebuffers();
        self.render_passes.lock().clear();
    }

    pub fn stats(&self) -> ResourceCacheStats {
        ResourceCacheStats {
            render_pass_count: self.render_passes.lock().len,
            framebuffer_count: self.framebuffers.lock().len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_combine_is_order_sensitive() {
        let (mut a, mut b) = (0, 0);
        hash_combine(&mut a, &1u32);
        hash_combine(&mut a, &2u32);
        hash_combine(&mut b, &2u32);
        hash_combine(&mut b, &1u32);
        assert_ne!(a, b);
    }

    #[test]
    fn colliding_keys_stay_distinct() {
        let map = Mutex::new(CacheMap::<u32, String>::new());
        let first = request_resource(&map, "test", 7, 1, || Ok("one".to_owned())).unwrap();
        let second = request_resource(&map, "test", 7, 2, || Ok("two".to_owned())).unwrap();
        let again = request_resource(&map, "test", 7, 1, || Ok("never".to_owned())).unwrap();

        assert_eq!(*first, "one");
        assert_eq!(*second, "two");
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(map.lock().len, 2);
    }

    #[test]
    fn failed_construction_is_not_cached() {
        let map = Mutex::new(CacheMap::<u32, u32>::new());
        assert!(request_resource(&map, "test", 1, 1, || Err(RhiError::DeviceLost)).is_err());
        assert_eq!(map.lock().len, 0);
        assert_eq!(*request_resource(&map, "test", 1, 1, || Ok(5)).unwrap(), 5);
    }
}
