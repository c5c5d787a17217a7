//! Engine configuration.

use ash::vk;
use std::ffi::CStr;

/// Engine name reported to the driver.
pub const ENGINE_NAME: &CStr = c"Basalt";

/// Vulkan API version the engine targets.
pub const API_VERSION: u32 = vk::API_VERSION_1_2;

/// Construction-time configuration for the GPU context and frame ring.
///
/// Everything here is fixed once the context is built; there are no runtime
/// knobs. Tests construct alternate configurations (e.g. single-buffered)
/// instead of mutating globals.
#[derive(Debug, Clone)]
pub struct GpuConfig {
    /// Application name reported to the driver.
    pub app_name: String,
    /// Application version reported to the driver.
    pub app_version: u32,
    /// Engine version reported to the driver.
    pub engine_version: u32,
    /// Number of frames buffered in flight. One frame slot and one swapchain
    /// image exist per unit of depth.
    pub buffering_depth: u32,
    /// Enable the Khronos validation layer.
    pub enable_validation: bool,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            app_name: "Basalt".to_string(),
            app_version: vk::make_api_version(0, 0, 1, 0),
            engine_version: vk::make_api_version(0, 0, 1, 0),
            buffering_depth: 2,
            enable_validation: cfg!(debug_assertions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_double_buffered() {
        assert_eq!(GpuConfig::default().buffering_depth, 2);
    }
}
