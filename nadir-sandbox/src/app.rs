use std::sync::Arc;
use std::time::Instant;

use nadir_core::config::Config;
use nadir_core::log;
use nadir_rhi::vk;
use nadir_rhi::{DeviceBackend, RenderDevice, VulkanBackend, VulkanOptions};
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::renderer::Renderer;

/// Windowed frame loop: one redraw per rendered frame.
pub struct SandboxLoop {
    config: Config,
    max_frames: Option<u64>,

    // The renderer owns the surface and must go before the window.
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,

    frames_since_print: u64,
    last_time_printed: Instant,
    error: Option<anyhow::Error>,
}

impl SandboxLoop {
    pub fn new(config: Config, max_frames: Option<u64>) -> Self {
        Self {
            config,
            max_frames,
            renderer: None,
            window: None,
            frames_since_print: 0,
            last_time_printed: Instant::now(),
            error: None,
        }
    }

    pub fn run(mut self) -> anyhow::Result<()> {
        let event_loop = EventLoop::new()?;
        event_loop.set_control_flow(ControlFlow::Poll);
        event_loop.run_app(&mut self)?;

        match self.error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn create_renderer(&self, window: &Window) -> anyhow::Result<Renderer> {
        let options = VulkanOptions {
            app_name: self.config.window.title.clone(),
            validation: self.config.debug.validation,
        };
        let backend = Arc::new(VulkanBackend::new_with_window(&options, window)?);
        let surface = backend.surface();
        let device = Arc::new(RenderDevice::new(backend)?);

        let size = window.inner_size();
        let extent = vk::Extent2D { width: size.width, height: size.height };
        Renderer::new(device, surface, extent, &self.config.graphics)
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{error:#}");
        self.error = Some(error);
        event_loop.exit();
    }

    #[profiling::function]
    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };

        if let Err(e) = renderer.render() {
            self.fail(event_loop, e);
            return;
        }
        let rendered = renderer.frame_count();
        profiling::finish_frame!();

        self.frames_since_print += 1;
        let elapsed = self.last_time_printed.elapsed().as_secs_f32();
        if elapsed > 1.0 {
            log::info!("Frame rate: {:.1} fps", self.frames_since_print as f32 / elapsed);
            self.last_time_printed = Instant::now();
            self.frames_since_print = 0;
        }

        if self.max_frames.is_some_and(|max| rendered >= max) {
            log::info!("Rendered {rendered} frames, exiting");
            event_loop.exit();
        }
    }
}

impl ApplicationHandler for SandboxLoop {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attributes = Window::default_attributes()
            .with_title(self.config.window.title.clone())
            .with_min_inner_size(LogicalSize::new(32, 32))
            .with_inner_size(LogicalSize::new(self.config.window.width, self.config.window.height));

        let window = match event_loop.create_window(attributes) {
            Ok(window) => Arc::new(window),
            Err(e) => return self.fail(event_loop, e.into()),
        };

        match self.create_renderer(&window) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => return self.fail(event_loop, e),
        }

        window.request_redraw();
        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => event_loop.exit(),
            WindowEvent::Resized(size) => {
                let extent = vk::Extent2D { width: size.width, height: size.height };
                if let Some(Err(e)) = self.renderer.as_mut().map(|renderer| renderer.resize(extent)) {
                    self.fail(event_loop, e);
                }
            }
            WindowEvent::RedrawRequested => {
                self.redraw(event_loop);
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            _ => {}
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.renderer = None;
        self.window = None;
    }
}
