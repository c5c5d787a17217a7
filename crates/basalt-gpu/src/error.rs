//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
///
/// The three semantic kinds map to how a failure must be treated:
/// [`GpuError::Initialization`] is fatal at startup, [`GpuError::InvalidState`]
/// is a caller bug, and [`GpuError::Timeout`] means the device stopped making
/// progress. None of them are retried inside this crate.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Device, queue, swapchain, or shader-module creation failed.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// A caller violated an internal invariant.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A bounded fence or acquire wait expired.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Raw Vulkan error from a device call.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
