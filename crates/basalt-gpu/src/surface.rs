//! Surface management for windowed rendering.
//!
//! The window itself (creation, event polling, sizing) lives outside this
//! crate; a surface provider only has to hand over raw window and display
//! handles plus current pixel dimensions.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::swapchain::Swapchain;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// Surface context for windowed rendering.
pub struct SurfaceContext {
    /// The Vulkan surface handle.
    pub surface: vk::SurfaceKHR,
    /// Surface extension loader.
    pub surface_loader: ash::khr::surface::Instance,
    /// Swapchain extension loader.
    pub swapchain_loader: ash::khr::swapchain::Device,
    /// The Vulkan entry point (kept alive for surface_loader lifetime).
    #[allow(dead_code)]
    entry: ash::Entry,
}

impl SurfaceContext {
    /// Create a surface context from an externally owned window.
    ///
    /// # Safety
    /// The GPU context must be valid and the window must have valid handles.
    pub unsafe fn from_window<W>(gpu: &GpuContext, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let entry = ash::Entry::load()
            .map_err(|e| GpuError::Initialization(format!("failed to load Vulkan entry: {e}")))?;

        let display = window
            .display_handle()
            .map_err(|e| GpuError::Initialization(format!("failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::Initialization(format!("failed to get window handle: {e}")))?;

        let surface = ash_window::create_surface(
            &entry,
            gpu.instance(),
            display.as_raw(),
            window_handle.as_raw(),
            None,
        )
        .map_err(|e| GpuError::Initialization(format!("surface creation failed: {e}")))?;

        let surface_loader = ash::khr::surface::Instance::new(&entry, gpu.instance());
        let swapchain_loader = ash::khr::swapchain::Device::new(gpu.instance(), gpu.device());

        Ok(Self {
            surface,
            surface_loader,
            swapchain_loader,
            entry,
        })
    }

    /// Create a swapchain for this surface with the configured buffering
    /// depth.
    ///
    /// # Safety
    /// The GPU context must be valid.
    pub unsafe fn create_swapchain(
        &self,
        gpu: &GpuContext,
        image_count: u32,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> Result<Swapchain> {
        let supported = self.surface_loader.get_physical_device_surface_support(
            gpu.physical_device(),
            gpu.graphics_queue_family(),
            self.surface,
        )?;
        if !supported {
            return Err(GpuError::Initialization(
                "graphics queue family does not support presentation".into(),
            ));
        }

        let capabilities = self
            .surface_loader
            .get_physical_device_surface_capabilities(gpu.physical_device(), self.surface)?;
        let formats = self
            .surface_loader
            .get_physical_device_surface_formats(gpu.physical_device(), self.surface)?;
        let surface_format = *formats.first().ok_or_else(|| {
            GpuError::Initialization("surface reports no supported formats".into())
        })?;

        Swapchain::new(
            gpu.device(),
            &self.swapchain_loader,
            self.surface,
            &capabilities,
            surface_format,
            image_count,
            old_swapchain,
            gpu.graphics_queue_family(),
        )
    }

    /// Recreate the swapchain wholesale after a resize.
    ///
    /// # Safety
    /// The old swapchain must not be in use (the caller must have waited for
    /// device idle).
    pub unsafe fn recreate_swapchain(
        &self,
        gpu: &GpuContext,
        old_swapchain: &mut Swapchain,
        image_count: u32,
    ) -> Result<Swapchain> {
        old_swapchain.destroy(gpu.device(), &self.swapchain_loader);
        self.create_swapchain(gpu, image_count, None)
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// The surface must not be in use.
    pub unsafe fn destroy(&self) {
        self.surface_loader.destroy_surface(self.surface, None);
    }
}
