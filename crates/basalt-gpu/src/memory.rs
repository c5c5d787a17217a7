//! GPU memory management.
//!
//! Buffers are host-visible, host-coherent, and persistently mapped: callers
//! memcpy into the mapped pointer at any offset below `capacity` without
//! flush calls. Images are device-local and reached through the synchronous
//! staging upload path, which is a load-time facility only.

use crate::command::{execute_single_time, CommandPool};
use crate::context::find_memory_type;
use crate::error::{GpuError, Result};
use ash::vk;
use std::ptr::NonNull;
use std::sync::Arc;

/// Round a requested buffer size up to the device's minimum offset alignment
/// for the given usage.
///
/// Only uniform and storage usages carry an alignment requirement; for every
/// other usage the requested size is returned unchanged.
pub fn aligned_size(
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    limits: &vk::PhysicalDeviceLimits,
) -> vk::DeviceSize {
    let mut alignment: vk::DeviceSize = 0;
    if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
        alignment = alignment.max(limits.min_uniform_buffer_offset_alignment);
    }
    if usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
        alignment = alignment.max(limits.min_storage_buffer_offset_alignment);
    }

    if alignment > 0 {
        (size + alignment - 1) & !(alignment - 1)
    } else {
        size
    }
}

/// Map a decoded pixel channel count to an image format.
///
/// Only 3- and 4-channel images are supported; anything else fails loudly
/// rather than being reinterpreted.
pub fn texture_format_for_channels(channels: u32) -> Result<vk::Format> {
    match channels {
        3 => Ok(vk::Format::R8G8B8_SRGB),
        4 => Ok(vk::Format::R8G8B8A8_SRGB),
        other => Err(GpuError::InvalidState(format!(
            "unsupported image channel count: {other}"
        ))),
    }
}

/// A buffer with its backing memory and persistent mapping.
///
/// `capacity` is the aligned size actually backing the allocation, not the
/// size the caller asked for.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub mapped: Option<NonNull<u8>>,
    pub capacity: vk::DeviceSize,
}

impl GpuBuffer {
    /// Copy bytes into the mapped region at `write_offset` and return the
    /// offset one past the written range, so sequential writes can be chained
    /// without the caller tracking offsets.
    ///
    /// The caller must ensure `write_offset + src.len() <= capacity`; this is
    /// a documented contract, not a runtime guard.
    pub fn copy_to_buffer(&self, src: &[u8], write_offset: vk::DeviceSize) -> Result<vk::DeviceSize> {
        let mapped = self
            .mapped
            .ok_or_else(|| GpuError::InvalidState("buffer is not host mapped".into()))?;

        debug_assert!(write_offset + src.len() as vk::DeviceSize <= self.capacity);

        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                mapped.as_ptr().add(write_offset as usize),
                src.len(),
            );
        }

        Ok(write_offset + src.len() as vk::DeviceSize)
    }

    /// Copy a slice of plain-old-data values into the mapped region.
    pub fn write_slice<T: bytemuck::Pod>(
        &self,
        data: &[T],
        write_offset: vk::DeviceSize,
    ) -> Result<vk::DeviceSize> {
        self.copy_to_buffer(bytemuck::cast_slice(data), write_offset)
    }

    /// Read bytes back from the mapped region.
    ///
    /// Only meaningful once the GPU work writing the range has retired; same
    /// bounds contract as [`Self::copy_to_buffer`].
    pub fn read_bytes(&self, offset: vk::DeviceSize, len: usize) -> Result<Vec<u8>> {
        let mapped = self
            .mapped
            .ok_or_else(|| GpuError::InvalidState("buffer is not host mapped".into()))?;

        debug_assert!(offset + len as vk::DeviceSize <= self.capacity);

        let mut out = vec![0_u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(
                mapped.as_ptr().add(offset as usize),
                out.as_mut_ptr(),
                len,
            );
        }
        Ok(out)
    }

    /// Destroy the buffer and free its memory.
    ///
    /// # Safety
    /// The device must be valid and no in-flight command buffer may reference
    /// this buffer (the owning frame slot's fence must have signaled, or the
    /// device must be idle).
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_buffer(self.buffer, None);
        device.free_memory(self.memory, None);
        self.buffer = vk::Buffer::null();
        self.memory = vk::DeviceMemory::null();
        self.mapped = None;
        self.capacity = 0;
    }
}

/// An image with its view, backing memory, and optional sampler.
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub memory: vk::DeviceMemory,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub sampler: Option<vk::Sampler>,
}

impl GpuImage {
    /// Destroy the image, its view, its sampler if any, and free its memory.
    ///
    /// # Safety
    /// Same retirement contract as [`GpuBuffer::destroy`].
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        if let Some(sampler) = self.sampler.take() {
            device.destroy_sampler(sampler, None);
        }
        device.destroy_image_view(self.view, None);
        device.destroy_image(self.image, None);
        device.free_memory(self.memory, None);
        self.image = vk::Image::null();
        self.view = vk::ImageView::null();
        self.memory = vk::DeviceMemory::null();
    }
}

/// Factory for allocating buffers and images with correct alignment and
/// memory type.
pub struct MemoryFactory {
    device: Arc<ash::Device>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: vk::PhysicalDeviceLimits,
}

impl MemoryFactory {
    /// Create a factory from a device and its cached physical-device queries.
    pub fn new(
        device: Arc<ash::Device>,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
        limits: vk::PhysicalDeviceLimits,
    ) -> Self {
        Self {
            device,
            memory_properties,
            limits,
        }
    }

    /// Get the device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Allocate a host-visible, host-coherent, persistently mapped buffer.
    ///
    /// The buffer's capacity is `byte_size` rounded up to the usage's minimum
    /// offset alignment; the backing allocation is at least as large as the
    /// driver-reported memory requirement.
    pub fn create_buffer(
        &self,
        byte_size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<GpuBuffer> {
        let capacity = aligned_size(byte_size, usage, &self.limits);

        let buffer_info = vk::BufferCreateInfo::default()
            .size(capacity)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let type_index = find_memory_type(
            &self.memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let allocation_size = capacity.max(requirements.size);
        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(allocation_size)
            .memory_type_index(type_index);

        let memory = unsafe { self.device.allocate_memory(&allocate_info, None)? };
        unsafe {
            self.device.bind_buffer_memory(buffer, memory, 0)?;
        }

        let mapped = unsafe {
            self.device
                .map_memory(memory, 0, capacity, vk::MemoryMapFlags::empty())?
        };

        Ok(GpuBuffer {
            buffer,
            memory,
            mapped: NonNull::new(mapped.cast()),
            capacity,
        })
    }

    /// Allocate a device-local image and a matching view.
    ///
    /// The allocation is sized by the driver-reported requirement, never by a
    /// caller estimate.
    pub fn create_image(
        &self,
        create_info: &vk::ImageCreateInfo,
        aspect: vk::ImageAspectFlags,
    ) -> Result<GpuImage> {
        let image = unsafe { self.device.create_image(create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let type_index = find_memory_type(
            &self.memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);

        let memory = unsafe { self.device.allocate_memory(&allocate_info, None)? };
        unsafe {
            self.device.bind_image_memory(image, memory, 0)?;
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(create_info.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );
        let view = unsafe { self.device.create_image_view(&view_info, None)? };

        tracing::debug!(
            "Created image resource {}x{}",
            create_info.extent.width,
            create_info.extent.height
        );

        Ok(GpuImage {
            image,
            view,
            memory,
            extent: create_info.extent,
            format: create_info.format,
            sampler: None,
        })
    }

    /// Allocate a single-sample, optimal-tiling 2D depth-stencil image.
    pub fn create_depth_stencil(
        &self,
        width: u32,
        height: u32,
        format: vk::Format,
    ) -> Result<GpuImage> {
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
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT);

        tracing::debug!("Creating depth buffer");

        self.create_image(&create_info, vk::ImageAspectFlags::DEPTH)
    }

    /// Create a linear-filtered, mirrored-repeat texture sampler.
    pub fn create_texture_sampler(&self) -> Result<vk::Sampler> {
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::MIRRORED_REPEAT)
            .address_mode_v(vk::SamplerAddressMode::MIRRORED_REPEAT)
            .address_mode_w(vk::SamplerAddressMode::MIRRORED_REPEAT)
            .min_lod(0.0)
            .max_lod(1.0)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE);

        let sampler = unsafe { self.device.create_sampler(&create_info, None)? };
        Ok(sampler)
    }

    /// Upload staged pixel data into a device-local image.
    ///
    /// Records and submits a one-shot transfer: transition to
    /// TRANSFER_DST, buffer-to-image copy, transition to SHADER_READ_ONLY,
    /// then blocks on queue idle. Synchronous by design; suitable for
    /// load-time asset upload only, never the per-frame path.
    pub fn upload_image_data(
        &self,
        pool: &CommandPool,
        queue: vk::Queue,
        image: &GpuImage,
        staging: &GpuBuffer,
    ) -> Result<()> {
        unsafe {
            execute_single_time(&self.device, pool, queue, |cmd| {
                let pre_copy = image_layout_barrier(
                    vk::AccessFlags::NONE,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    image.image,
                );
                self.device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::BY_REGION,
                    &[],
                    &[],
                    &[pre_copy],
                );

                let copy_region = vk::BufferImageCopy::default()
                    .image_subresource(
                        vk::ImageSubresourceLayers::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .mip_level(0)
                            .base_array_layer(0)
                            .layer_count(1),
                    )
                    .image_extent(image.extent);
                self.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[copy_region],
                );

                let post_copy = image_layout_barrier(
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::SHADER_READ,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    image.image,
                );
                self.device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::DependencyFlags::BY_REGION,
                    &[],
                    &[],
                    &[post_copy],
                );
            })
        }
    }
}

/// Build an image layout transition barrier covering all mips and layers.
pub fn image_layout_barrier(
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    image: vk::Image,
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(vk::REMAINING_MIP_LEVELS)
                .base_array_layer(0)
                .layer_count(vk::REMAINING_ARRAY_LAYERS),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(uniform: u64, storage: u64) -> vk::PhysicalDeviceLimits {
        vk::PhysicalDeviceLimits {
            min_uniform_buffer_offset_alignment: uniform,
            min_storage_buffer_offset_alignment: storage,
            ..Default::default()
        }
    }

    /// Buffer mapped onto a heap allocation, no device behind it.
    fn host_buffer(backing: &mut Vec<u8>) -> GpuBuffer {
        GpuBuffer {
            buffer: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
            mapped: NonNull::new(backing.as_mut_ptr()),
            capacity: backing.len() as vk::DeviceSize,
        }
    }

    #[test]
    fn uniform_sizes_round_up_to_alignment() {
        let limits = limits(256, 64);
        for requested in [1, 255, 256, 257, 1000] {
            let size = aligned_size(requested, vk::BufferUsageFlags::UNIFORM_BUFFER, &limits);
            assert_eq!(size % 256, 0);
            assert!(size >= requested);
        }
    }

    #[test]
    fn largest_usage_alignment_wins() {
        let limits = limits(256, 64);
        let both = vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER;
        assert_eq!(aligned_size(100, both, &limits), 256);
    }

    #[test]
    fn unaligned_usages_keep_the_requested_size() {
        let limits = limits(256, 64);
        assert_eq!(
            aligned_size(100, vk::BufferUsageFlags::VERTEX_BUFFER, &limits),
            100
        );
    }

    #[test]
    fn copy_round_trips_bytes() {
        let mut backing = vec![0_u8; 64];
        let buffer = host_buffer(&mut backing);

        let payload = [0xAB_u8, 0xCD, 0xEF, 0x01];
        let next = buffer.copy_to_buffer(&payload, 8).unwrap();
        assert_eq!(next, 12);
        assert_eq!(buffer.read_bytes(8, 4).unwrap(), payload);
    }

    #[test]
    fn sequential_copies_chain_offsets() {
        let mut backing = vec![0_u8; 224];
        let buffer = host_buffer(&mut backing);

        let first = vec![1_u8; 64];
        let second = vec![2_u8; 128];
        let third = vec![3_u8; 32];

        let mut offset = buffer.copy_to_buffer(&first, 0).unwrap();
        offset = buffer.copy_to_buffer(&second, offset).unwrap();
        offset = buffer.copy_to_buffer(&third, offset).unwrap();

        assert_eq!(offset, 224);
        assert_eq!(buffer.read_bytes(0, 64).unwrap(), first);
        assert_eq!(buffer.read_bytes(64, 128).unwrap(), second);
        assert_eq!(buffer.read_bytes(192, 32).unwrap(), third);
    }

    #[test]
    fn unmapped_buffer_rejects_copies() {
        let buffer = GpuBuffer {
            buffer: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
            mapped: None,
            capacity: 64,
        };
        assert!(matches!(
            buffer.copy_to_buffer(&[0_u8; 4], 0),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn channel_counts_outside_three_or_four_fail() {
        assert_eq!(
            texture_format_for_channels(3).unwrap(),
            vk::Format::R8G8B8_SRGB
        );
        assert_eq!(
            texture_format_for_channels(4).unwrap(),
            vk::Format::R8G8B8A8_SRGB
        );
        assert!(matches!(
            texture_format_for_channels(1),
            Err(GpuError::InvalidState(_))
        ));
        assert!(matches!(
            texture_format_for_channels(5),
            Err(GpuError::InvalidState(_))
        ));
    }
}
