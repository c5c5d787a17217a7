//! Texture upload from decoded pixel data.
//!
//! Image decoding happens outside the engine; the loader supplies raw pixels
//! with explicit width, height, and channel count. Channel counts outside the
//! supported set fail loudly instead of being reinterpreted.

use ash::vk;
use basalt_gpu::command::CommandPool;
use basalt_gpu::error::Result;
use basalt_gpu::memory::{texture_format_for_channels, GpuImage, MemoryFactory};

/// A sampled texture: device-local image, view, and sampler.
pub struct Texture {
    pub image: GpuImage,
}

impl Texture {
    /// Upload decoded color pixels (3 or 4 channels).
    pub fn upload(
        factory: &MemoryFactory,
        pool: &CommandPool,
        queue: vk::Queue,
        pixels: &[u8],
        width: u32,
        height: u32,
        channels: u32,
    ) -> Result<Self> {
        let format = texture_format_for_channels(channels)?;
        Self::upload_with_format(factory, pool, queue, pixels, width, height, format)
    }

    /// Upload a single-channel bitmap (font atlases).
    pub fn upload_r8(
        factory: &MemoryFactory,
        pool: &CommandPool,
        queue: vk::Queue,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Self> {
        Self::upload_with_format(
            factory,
            pool,
            queue,
            pixels,
            width,
            height,
            vk::Format::R8_UNORM,
        )
    }

    fn upload_with_format(
        factory: &MemoryFactory,
        pool: &CommandPool,
        queue: vk::Queue,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: vk::Format,
    ) -> Result<Self> {
        let mut staging = factory.create_buffer(
            pixels.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )?;
        staging.copy_to_buffer(pixels, 0)?;

        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let mut image = factory.create_image(&create_info, vk::ImageAspectFlags::COLOR)?;
        factory.upload_image_data(pool, queue, &image, &staging)?;

        // Upload path waits for queue idle, so the staging buffer is done
        unsafe {
            staging.destroy(factory.device());
        }

        image.sampler = Some(factory.create_texture_sampler()?);

        tracing::debug!("Uploaded {}x{} texture ({:?})", width, height, format);

        Ok(Self { image })
    }

    /// Destroy the texture.
    ///
    /// # Safety
    /// No in-flight command buffer may reference the texture.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.image.destroy(device);
    }
}
