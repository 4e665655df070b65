//! Windowed application shell.
//!
//! Opens a window, builds a [`GpuRuntime`](vkl_gpu::GpuRuntime) on the
//! Vulkan driver and clears every swapchain image to a fixed color. Errors
//! from the frame loop are handled by kind: out-of-date swapchains are
//! rebuilt, timeouts are retried and fatal errors end the loop.

mod app;
mod clear;
mod runner;

pub use app::AppConfig;
pub use clear::record_clear;
pub use runner::Application;
