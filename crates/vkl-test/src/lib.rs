//! Test harness for the GPU core.
//!
//! Provides a headless rig that runs the full runtime on the software
//! adapter, so frame, swapchain and allocator behavior can be tested without
//! a GPU.

pub mod rig;

pub use rig::{RigConfig, SoftwareRig};

use thiserror::Error;
use vkl_gpu::GpuError;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
    #[error("Driver reported {n} violations: {0:?}", n = .0.len())]
    Violations(Vec<String>),
    #[error("{0} device objects still alive after shutdown")]
    Leaked(usize),
}

pub type Result<T> = std::result::Result<T, TestError>;

/// Route log output through the test harness writer. Safe to call repeatedly.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
