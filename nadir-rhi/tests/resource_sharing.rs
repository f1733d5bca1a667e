//! Cache sharing and per-thread recording across worker threads.

use std::sync::Arc;
use std::thread;

use nadir_rhi::vk;
use nadir_rhi::{
    Attachment, CommandBufferResetMode, CommandPool, Image, ImageDesc, LoadStoreInfo, NullBackend, RenderDevice,
    RenderFrame, RenderTarget, RhiError, SubpassInfo,
};

const THREADS: usize = 8;

fn device() -> (Arc<NullBackend>, RenderDevice) {
    let backend = Arc::new(NullBackend::new());
    let device = RenderDevice::new(backend.clone()).unwrap();
    (backend, device)
}

fn color_target(device: &RenderDevice, width: u32, height: u32) -> RenderTarget {
    let image = Image::new(
        device,
        &ImageDesc::new_color_attachment(vk::Extent2D { width, height }, vk::Format::R8G8B8A8_UNORM),
    )
    .unwrap();
    RenderTarget::from_images(device, vec![image]).unwrap()
}

#[test]
fn concurrent_render_pass_requests_construct_once() {
    let (backend, device) = device();
    let attachments = [Attachment::new(
        vk::Format::R8G8B8A8_UNORM,
        vk::SampleCountFlags::TYPE_1,
        vk::ImageUsageFlags::COLOR_ATTACHMENT,
    )];
    let load_store = [LoadStoreInfo::default()];
    let subpasses = [SubpassInfo { output_attachments: vec![0], ..Default::default() }];

    let passes: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(|| {
                    device
                        .resource_cache()
                        .request_render_pass(&attachments, &load_store, &subpasses)
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(passes.len(), THREADS);
    assert!(passes.iter().all(|pass| Arc::ptr_eq(pass, &passes[0])));
    assert_eq!(backend.counters().render_passes_created, 1);
    assert_eq!(device.resource_cache().stats().render_pass_count, 1);
}

#[test]
fn identical_framebuffer_requests_share_the_handle() {
    let (backend, device) = device();
    let target = color_target(&device, 128, 128);
    let cache = device.resource_cache();

    let render_pass = cache
        .request_render_pass(target.attachments(), &[LoadStoreInfo::default()], &[SubpassInfo::from_render_target(&target)])
        .unwrap();
    let first = cache.request_framebuffer(&target, &render_pass).unwrap();
    let second = cache.request_framebuffer(&target, &render_pass).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.handle(), second.handle());
    assert_eq!(first.extent(), vk::Extent2D { width: 128, height: 128 });
    assert_eq!(backend.counters().framebuffers_created, 1);

    // A different target with the same layout reuses the render pass but not the framebuffer.
    let other = color_target(&device, 128, 128);
    let third = cache.request_framebuffer(&other, &render_pass).unwrap();
    assert_ne!(third.handle(), first.handle());
    assert_eq!(cache.stats().render_pass_count, 1);
    assert_eq!(cache.stats().framebuffer_count, 2);
}

#[test]
fn cleared_framebuffers_are_destroyed_once_unreferenced() {
    let (backend, device) = device();
    let target = color_target(&device, 16, 16);
    let cache = device.resource_cache();

    let render_pass = cache
        .request_render_pass(target.attachments(), &[LoadStoreInfo::default()], &[SubpassInfo::from_render_target(&target)])
        .unwrap();
    let held = cache.request_framebuffer(&target, &render_pass).unwrap();

    cache.clear_framebuffers();
    assert_eq!(cache.stats().framebuffer_count, 0);
    assert_eq!(backend.live_objects().framebuffers, 1);

    drop(held);
    assert_eq!(backend.live_objects().framebuffers, 0);
    assert_eq!(backend.live_objects().render_passes, 1);
}

#[test]
fn framebuffers_refuse_objects_from_another_device() {
    let (_other_backend, other) = device();
    let (backend, device) = device();
    let target = color_target(&device, 32, 32);
    let load_store = [LoadStoreInfo::default()];
    let subpasses = [SubpassInfo::from_render_target(&target)];

    let foreign_pass = other
        .resource_cache()
        .request_render_pass(target.attachments(), &load_store, &subpasses)
        .unwrap();
    assert!(matches!(
        device.resource_cache().request_framebuffer(&target, &foreign_pass),
        Err(RhiError::ForeignDeviceObject(_))
    ));

    let own_pass = device
        .resource_cache()
        .request_render_pass(target.attachments(), &load_store, &subpasses)
        .unwrap();
    assert!(matches!(
        other.resource_cache().request_framebuffer(&target, &own_pass),
        Err(RhiError::ForeignDeviceObject(_))
    ));

    assert!(device.resource_cache().request_framebuffer(&target, &own_pass).is_ok());
    assert_eq!(backend.counters().framebuffers_created, 1);
}

#[test]
fn worker_threads_record_into_their_own_pools() {
    let backend = Arc::new(NullBackend::new());
    let device = Arc::new(RenderDevice::new(backend.clone()).unwrap());
    let queue = device.suitable_graphics_queue().unwrap();
    let target = color_target(&device, 32, 32);
    let mut frame = RenderFrame::new(device.clone(), target, 4);

    let pools = frame
        .command_pools(&queue, CommandBufferResetMode::ResetIndividually)
        .unwrap();
    assert_eq!(pools.len(), 4);

    let recorded: Vec<vk::CommandBuffer> = thread::scope(|scope| {
        let handles: Vec<_> = pools
            .iter_mut()
            .map(|pool: &mut CommandPool| {
                scope.spawn(move || {
                    (0..3)
                        .map(|_| {
                            let cmd = pool.request_command_buffer(vk::CommandBufferLevel::PRIMARY).unwrap();
                            cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
                            cmd.end().unwrap();
                            cmd.handle()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(recorded.len(), 12);
    let mut unique = recorded.clone();
    unique.sort_by_key(|cmd| vk::Handle::as_raw(*cmd));
    unique.dedup();
    assert_eq!(unique.len(), 12);

    // Every buffer is reset individually when the frame comes around again.
    frame.reset().unwrap();
    for cmd in &recorded {
        assert_eq!(backend.command_buffer_reset_count(*cmd), 1);
    }
    assert_eq!(backend.counters().command_pool_resets, 0);
}

#[test]
fn always_allocate_hands_out_fresh_buffers_each_frame() {
    let backend = Arc::new(NullBackend::new());
    let device = Arc::new(RenderDevice::new(backend.clone()).unwrap());
    let queue = device.suitable_graphics_queue().unwrap();
    let mut frame = RenderFrame::new(device.clone(), color_target(&device, 8, 8), 1);
    let mode = CommandBufferResetMode::AlwaysAllocate;

    let first = frame
        .request_command_buffer(&queue, mode, vk::CommandBufferLevel::PRIMARY, 0)
        .unwrap()
        .handle();
    frame.reset().unwrap();
    let second = frame
        .request_command_buffer(&queue, mode, vk::CommandBufferLevel::PRIMARY, 0)
        .unwrap()
        .handle();

    assert_ne!(first, second);
    assert_eq!(backend.counters().command_buffer_allocations, 2);
    assert_eq!(backend.live_objects().command_buffers, 1);
}
