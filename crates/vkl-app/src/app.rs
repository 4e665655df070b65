//! Application configuration.

use std::time::Duration;
use vkl_gpu::{FramePipelineConfig, GpuRuntimeConfig, SwapchainConfig};

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Window title, also used as the Vulkan application name.
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    /// Enable the Khronos validation layer.
    pub validation: bool,
    pub frames_in_flight: usize,
    /// Bound on the wait for a frame slot.
    pub frame_timeout: Duration,
    /// RGBA color every frame is cleared to.
    pub clear_color: [f32; 4],
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "vkl".to_string(),
            width: 1280,
            height: 720,
            vsync: true,
            validation: cfg!(debug_assertions),
            frames_in_flight: 2,
            frame_timeout: Duration::from_secs(1),
            clear_color: [0.1, 0.1, 0.15, 1.0],
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window size.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Runtime configuration derived from this config.
    pub fn runtime_config(&self) -> GpuRuntimeConfig {
        GpuRuntimeConfig::default()
            .with_swapchain(SwapchainConfig::default().with_vsync(self.vsync))
            .with_frames(
                FramePipelineConfig::default()
                    .with_frames_in_flight(self.frames_in_flight)
                    .with_frame_timeout(self.frame_timeout),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_flow_into_runtime_config() {
        let config = AppConfig::new("test")
            .with_size(640, 480)
            .with_vsync(false)
            .with_frames_in_flight(3)
            .with_frame_timeout(Duration::from_millis(250));
        assert_eq!(config.title, "test");
        assert_eq!((config.width, config.height), (640, 480));

        let runtime = config.runtime_config();
        assert!(!runtime.swapchain.vsync);
        assert_eq!(runtime.frames.frames_in_flight, 3);
        assert_eq!(runtime.frames.frame_timeout, Duration::from_millis(250));
    }

    #[test]
    fn default_keeps_two_frames_in_flight() {
        let config = AppConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert!(config.vsync);
    }
}
