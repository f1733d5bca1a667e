mod app;
mod renderer;

use std::sync::Arc;

use nadir_core::config::Config;
use nadir_core::{log, EngineArgs};
use nadir_rhi::vk;
use nadir_rhi::{DeviceBackend, NullBackend, RenderDevice, VulkanBackend, VulkanOptions};

use crate::app::SandboxLoop;
use crate::renderer::Renderer;

/// Frames rendered without a window when `--frames` is not given.
const DEFAULT_WINDOWLESS_FRAMES: u64 = 120;

fn main() -> anyhow::Result<()> {
    let args = EngineArgs::parse_args();

    let config = Config::load_from_path(&args.config);
    let level = args
        .log_level
        .or_else(|| config.as_ref().ok().map(|config| config.debug.log_level))
        .unwrap_or_default();
    log::initialize(level.into())?;
    let config = config?;

    if args.headless {
        run_headless(&config, args.frames.unwrap_or(DEFAULT_WINDOWLESS_FRAMES))
    } else if args.offscreen {
        run_offscreen(&config, args.frames.unwrap_or(DEFAULT_WINDOWLESS_FRAMES))
    } else {
        SandboxLoop::new(config, args.frames).run()
    }
}

fn window_extent(config: &Config) -> vk::Extent2D {
    vk::Extent2D {
        width: config.window.width,
        height: config.window.height,
    }
}

/// Full swapchain frame loop on the CPU-only backend.
fn run_headless(config: &Config, frames: u64) -> anyhow::Result<()> {
    let extent = window_extent(config);
    let backend = Arc::new(NullBackend::new().with_surface(extent, 2, 8));
    let surface = backend.surface();
    let device = Arc::new(RenderDevice::new(backend.clone())?);

    let mut renderer = Renderer::new(device, surface, extent, &config.graphics)?;
    for _ in 0..frames {
        renderer.render()?;
    }

    log::info!(
        "Headless run finished: {} frames over {} render frames",
        renderer.frame_count(),
        renderer.context().render_frames().len()
    );
    log::info!("{:?}", backend.counters());
    Ok(())
}

/// Offscreen rendering on a real GPU, no window or swapchain.
fn run_offscreen(config: &Config, frames: u64) -> anyhow::Result<()> {
    let options = VulkanOptions {
        app_name: config.window.title.clone(),
        validation: config.debug.validation,
    };
    let backend = Arc::new(VulkanBackend::new_headless(&options)?);
    let device = Arc::new(RenderDevice::new(backend)?);

    let mut renderer = Renderer::new(device.clone(), None, window_extent(config), &config.graphics)?;
    for _ in 0..frames {
        renderer.render()?;
    }
    device.wait_idle()?;

    let stats = device.resource_cache().stats();
    log::info!(
        "Offscreen run finished: {} frames, {} render passes and {} framebuffers cached",
        renderer.frame_count(),
        stats.render_pass_count,
        stats.framebuffer_count
    );
    Ok(())
}
