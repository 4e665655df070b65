//! Application runner and event loop.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use vkl_gpu::{DeviceContextBuilder, GpuError, GpuRuntime, VulkanDriver, WindowTarget};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::AppConfig;
use crate::clear::record_clear;

fn log_working_directory() {
    match std::env::current_dir() {
        Ok(dir) => info!("Working directory: {}", dir.display()),
        Err(e) => warn!("Failed to read working directory: {e}"),
    }
}

/// A window that clears every frame to the configured color.
#[derive(Debug, Clone)]
pub struct Application {
    config: AppConfig,
}

impl Application {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Initialize logging, open the window and run the frame loop until the
    /// window closes or a fatal GPU error occurs.
    pub fn run(self) -> anyhow::Result<()> {
        init_logging();

        info!("{} starting...", self.config.title);
        log_working_directory();

        let event_loop = EventLoop::new()?;
        event_loop.set_control_flow(ControlFlow::Poll);

        let mut runner = AppRunner {
            config: self.config,
            state: None,
            error: None,
        };
        event_loop.run_app(&mut runner)?;

        match runner.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "profiling-tracy")]
    {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
            .init();
    }
    #[cfg(not(feature = "profiling-tracy"))]
    {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Internal application runner that implements winit's `ApplicationHandler`.
struct AppRunner {
    config: AppConfig,
    state: Option<AppState>,
    // First fatal error, returned from `Application::run`
    error: Option<anyhow::Error>,
}

/// Internal application state.
struct AppState {
    // Declared before the window so the surface goes first
    runtime: GpuRuntime<VulkanDriver>,
    window: Arc<Window>,
    clear_color: [f32; 4],
    needs_rebuild: bool,
    frames: u64,
    started: Instant,
}

impl ApplicationHandler for AppRunner {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(state) = self.state.take() {
                    state.cleanup();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                if let Err(e) = state.render_frame() {
                    self.handle_gpu_error(event_loop, e);
                }
            }
            WindowEvent::Resized(size) => {
                let Some(state) = &mut self.state else {
                    return;
                };
                if let Err(e) = state.handle_resize(size) {
                    self.handle_gpu_error(event_loop, e);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.window.request_redraw();
        }
    }
}

impl AppRunner {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = Arc::new(event_loop.create_window(window_attrs)?);
        let target = WindowTarget::from_window(&*window)?;

        let context = DeviceContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation);
        let runtime = GpuRuntime::new(
            VulkanDriver::new(),
            &target,
            context,
            self.config.runtime_config(),
            extent_of(window.inner_size()),
        )?;

        let swapchain = runtime.swapchain();
        info!(
            "GPU: {} | {} images {:?} {:?}",
            runtime.context().adapter().name,
            swapchain.image_count(),
            swapchain.format().format,
            swapchain.present_mode()
        );

        Ok(AppState {
            runtime,
            window,
            clear_color: self.config.clear_color,
            needs_rebuild: false,
            frames: 0,
            started: Instant::now(),
        })
    }

    fn handle_gpu_error(&mut self, event_loop: &ActiveEventLoop, e: GpuError) {
        let Some(state) = &mut self.state else {
            return;
        };

        if e.requires_rebuild() {
            debug!("Swapchain needs rebuild: {e}");
            state.needs_rebuild = true;
        } else if matches!(e, GpuError::FrameTimeout { .. } | GpuError::Timeout) {
            warn!("Frame skipped: {e}");
        } else if e.is_fatal() {
            error!("Fatal GPU error: {e}");
            if let Some(state) = self.state.take() {
                state.cleanup();
            }
            self.error = Some(e.into());
            event_loop.exit();
        } else {
            // A failed frame keeps its image acquired until the next rebuild
            error!("Render error: {e}");
            state.needs_rebuild = true;
        }
    }
}

impl AppState {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> Result<(), GpuError> {
        if self.needs_rebuild {
            let size = self.window.inner_size();
            if size.width == 0 || size.height == 0 {
                return Ok(());
            }
            self.runtime.rebuild(extent_of(size))?;
            self.needs_rebuild = false;
        }

        let frame = self.runtime.begin_frame()?;
        if frame.suboptimal {
            self.needs_rebuild = true;
        }

        let color = self.clear_color;
        self.runtime.record(|ctx, frame| match ctx.driver().device() {
            // SAFETY: the frame is active and its command buffer is recording.
            Some(device) => unsafe { record_clear(device, frame, color) },
            None => warn!("No device to record frame {} on", frame.frame_number),
        })?;
        self.runtime.end_frame()?;

        self.frames += 1;
        Ok(())
    }

    fn handle_resize(&mut self, size: PhysicalSize<u32>) -> Result<(), GpuError> {
        if size.width == 0 || size.height == 0 {
            // Minimized; rebuild once the window is visible again
            self.needs_rebuild = true;
            return Ok(());
        }

        self.runtime.rebuild(extent_of(size))?;
        self.needs_rebuild = false;
        debug!("Resized to {}x{}", size.width, size.height);
        Ok(())
    }

    fn cleanup(mut self) {
        if let Err(e) = self.runtime.drain() {
            warn!("Failed to drain frames: {e}");
        }

        let elapsed = self.started.elapsed().as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        let fps = if elapsed > 0.0 {
            self.frames as f64 / elapsed
        } else {
            0.0
        };
        info!("Rendered {} frames ({fps:.1} fps average)", self.frames);

        let stats = self.runtime.allocator_stats();
        debug!("Allocator at shutdown: {stats:?}");

        self.runtime.shutdown();
        info!("Cleanup complete");
    }
}

const fn extent_of(size: PhysicalSize<u32>) -> vk::Extent2D {
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn working_directory_is_logged_at_info() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, log_working_directory);

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let dir = std::env::current_dir().unwrap();
        assert!(output.contains("INFO"));
        assert!(output.contains(&format!("Working directory: {}", dir.display())));
    }
}
