//! Vulkan instance creation.

use crate::config::{GpuConfig, API_VERSION, ENGINE_NAME};
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{CStr, CString};

/// Required instance extensions for the engine.
pub fn required_instance_extensions() -> Vec<&'static CStr> {
    let extensions = vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::ext::metal_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ];

    extensions
}

/// Validation layers to enable when requested.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create a Vulkan instance.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(entry: &ash::Entry, config: &GpuConfig) -> Result<ash::Instance> {
    let app_name = CString::new(config.app_name.as_str())
        .map_err(|_| GpuError::Initialization("application name contains a NUL byte".into()))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(config.app_version)
        .engine_name(ENGINE_NAME)
        .engine_version(config.engine_version)
        .api_version(API_VERSION);

    let extension_names: Vec<*const i8> = required_instance_extensions()
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let layers = if config.enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    // Check that requested layers are actually present
    let available_layers = entry.enumerate_instance_layer_properties()?;
    for layer in &layers {
        let found = available_layers.iter().any(|props| {
            let name = CStr::from_ptr(props.layer_name.as_ptr());
            name == *layer
        });
        if !found {
            tracing::warn!("Validation layer {:?} not available", layer);
        }
    }

    let layer_names: Vec<*const i8> = layers.iter().map(|l| l.as_ptr()).collect();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = entry
        .create_instance(&create_info, None)
        .map_err(|e| GpuError::Initialization(format!("instance creation failed: {e}")))?;

    tracing::info!("Created Vulkan instance ({} layers enabled)", layers.len());

    Ok(instance)
}
