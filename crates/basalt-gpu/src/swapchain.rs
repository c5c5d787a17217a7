//! Swapchain management.
//!
//! The presentable image chain is recreated wholesale on resize; there is no
//! partial update. Recreation invalidates every framebuffer built against the
//! old image views, which the frame ring must rebuild afterwards.

use crate::error::{GpuError, Result};
use ash::vk;

/// Swapchain wrapper: presentation handle, chosen format, extent, and one
/// view per image.
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a new swapchain with exactly `image_count` images.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
        surface: vk::SurfaceKHR,
        surface_capabilities: &vk::SurfaceCapabilitiesKHR,
        surface_format: vk::SurfaceFormatKHR,
        image_count: u32,
        old_swapchain: Option<vk::SwapchainKHR>,
        graphics_queue_family: u32,
    ) -> Result<Self> {
        let image_count = validate_image_count(surface_capabilities, image_count)?;
        let extent = surface_extent(surface_capabilities)?;

        let pre_transform = if surface_capabilities
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            surface_capabilities.current_transform
        };

        let queue_families = [graphics_queue_family];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true)
            .old_swapchain(old_swapchain.unwrap_or(vk::SwapchainKHR::null()));

        let swapchain = swapchain_loader
            .create_swapchain(&create_info, None)
            .map_err(|e| GpuError::Initialization(format!("swapchain creation failed: {e}")))?;

        let images = swapchain_loader.get_swapchain_images(swapchain)?;

        let image_views: Vec<_> = images
            .iter()
            .map(|&image| {
                let view_info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .components(vk::ComponentMapping::default())
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .base_mip_level(0)
                            .level_count(1)
                            .base_array_layer(0)
                            .layer_count(1),
                    );

                device.create_image_view(&view_info, None)
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        tracing::info!(
            "Created swapchain: {} images, {}x{}",
            images.len(),
            extent.width,
            extent.height
        );

        Ok(Self {
            swapchain,
            images,
            image_views,
            format: surface_format.format,
            extent,
        })
    }

    /// Acquire the next presentable image.
    ///
    /// An expired bound surfaces as [`GpuError::Timeout`]; OUT_OF_DATE
    /// propagates so the caller can decide to recreate. There is no internal
    /// retry.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn acquire_next_image(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<(u32, bool)> {
        let result = swapchain_loader.acquire_next_image(
            self.swapchain,
            timeout_ns,
            semaphore,
            vk::Fence::null(),
        );

        match result {
            Ok((index, suboptimal)) => Ok((index, suboptimal)),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => {
                Err(GpuError::Timeout("swapchain image acquisition"))
            }
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Present an image. Returns `true` if the swapchain is suboptimal or out
    /// of date; recreation is the caller's explicit decision.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn present(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = swapchain_loader.queue_present(queue, &present_info);

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Destroy the swapchain and its image views.
    ///
    /// # Safety
    /// All handles must be valid and the swapchain must not be in use.
    pub unsafe fn destroy(
        &self,
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
    ) {
        for &view in &self.image_views {
            device.destroy_image_view(view, None);
        }
        swapchain_loader.destroy_swapchain(self.swapchain, None);
    }
}

/// Check the configured buffering depth against the surface's supported
/// image-count range.
pub fn validate_image_count(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired: u32,
) -> Result<u32> {
    let max_ok = capabilities.max_image_count == 0 || desired <= capabilities.max_image_count;
    if desired < capabilities.min_image_count || !max_ok {
        return Err(GpuError::Initialization(format!(
            "surface supports {}..={} images, configured depth is {}",
            capabilities.min_image_count, capabilities.max_image_count, desired
        )));
    }
    Ok(desired)
}

/// Get the surface's current extent, which must be concrete.
fn surface_extent(capabilities: &vk::SurfaceCapabilitiesKHR) -> Result<vk::Extent2D> {
    let extent = capabilities.current_extent;
    if extent.width == u32::MAX || extent.height == u32::MAX {
        return Err(GpuError::Initialization(
            "surface did not provide a concrete extent".into(),
        ));
    }
    Ok(extent)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            ..Default::default()
        }
    }

    #[test]
    fn image_count_within_bounds_is_accepted() {
        assert_eq!(validate_image_count(&capabilities(2, 8), 2).unwrap(), 2);
        assert_eq!(validate_image_count(&capabilities(2, 8), 3).unwrap(), 3);
    }

    #[test]
    fn image_count_outside_bounds_fails_initialization() {
        assert!(matches!(
            validate_image_count(&capabilities(2, 8), 1),
            Err(GpuError::Initialization(_))
        ));
        assert!(matches!(
            validate_image_count(&capabilities(2, 3), 4),
            Err(GpuError::Initialization(_))
        ));
    }

    #[test]
    fn zero_max_means_unbounded() {
        assert_eq!(validate_image_count(&capabilities(2, 0), 16).unwrap(), 16);
    }
}
