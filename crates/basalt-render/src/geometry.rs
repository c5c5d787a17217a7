//! Opaque geometry sub-pass.
//!
//! Draws loader-supplied meshes with per-frame lighting data, a per-object
//! transform table, and one material texture. Records into a secondary
//! command buffer executed from the orchestrator's main render pass.

use crate::mesh::{Mesh, Vertex};
use crate::texture::Texture;
use ash::vk;
use basalt_gpu::command::CommandPool;
use basalt_gpu::descriptors::{DescriptorManager, UsageFrequency};
use basalt_gpu::error::Result;
use basalt_gpu::memory::{GpuBuffer, MemoryFactory};
use basalt_gpu::pipeline::{
    create_pipeline_layout, create_shader_module, GraphicsPipelineBuilder, Pipeline,
};
use basalt_gpu::GpuContext;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

const FRAME_DATA_BINDING: u32 = 0;
const OBJECT_DATA_BINDING: u32 = 0;
const TEXTURE_BINDING: u32 = 0;

/// Per-frame shader constants.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct FrameData {
    pub directional_light: [f32; 4],
    pub camera_position: [f32; 4],
}

/// Decoded pixel data handed over by the external image loader.
pub struct TexturePixels<'a> {
    pub pixels: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

/// Shader bytecode for the geometry technique.
pub struct GeometryShaders<'a> {
    pub vertex: &'a [u8],
    pub fragment: &'a [u8],
}

/// The main opaque-geometry pass.
pub struct GeometryPass {
    descriptors: DescriptorManager,
    pipeline: Pipeline,
    vertex_module: vk::ShaderModule,
    fragment_module: vk::ShaderModule,
    frame_buffer: GpuBuffer,
    object_buffer: GpuBuffer,
    texture: Texture,
}

impl GeometryPass {
    /// Build the pass: descriptor slots, per-frame/per-object buffers, the
    /// material texture, and the pipeline.
    pub fn new(
        gpu: &GpuContext,
        factory: &MemoryFactory,
        upload_pool: &CommandPool,
        shaders: &GeometryShaders<'_>,
        texture_pixels: &TexturePixels<'_>,
        max_objects: u32,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        tracing::info!("Constructing geometry pass");

        let device = gpu.device();
        let mut descriptors = DescriptorManager::new(gpu.device_arc())?;

        descriptors.add_binding(
            FRAME_DATA_BINDING,
            vk::ShaderStageFlags::FRAGMENT,
            UsageFrequency::PerFrame,
            vk::DescriptorType::UNIFORM_BUFFER,
        )?;
        let frame_buffer = factory.create_buffer(
            std::mem::size_of::<FrameData>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )?;

        descriptors.add_binding(
            OBJECT_DATA_BINDING,
            vk::ShaderStageFlags::VERTEX,
            UsageFrequency::PerObject,
            vk::DescriptorType::STORAGE_BUFFER,
        )?;
        // Camera view-proj followed by one transform per object
        let object_buffer_size =
            (std::mem::size_of::<Mat4>() as vk::DeviceSize) * (1 + max_objects as vk::DeviceSize);
        let object_buffer =
            factory.create_buffer(object_buffer_size, vk::BufferUsageFlags::STORAGE_BUFFER)?;

        descriptors.add_binding(
            TEXTURE_BINDING,
            vk::ShaderStageFlags::FRAGMENT,
            UsageFrequency::PerMaterial,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        )?;
        let texture = Texture::upload(
            factory,
            upload_pool,
            gpu.graphics_queue(),
            texture_pixels.pixels,
            texture_pixels.width,
            texture_pixels.height,
            texture_pixels.channels,
        )?;

        // Material binding never changes after upload
        unsafe {
            descriptors
                .write_template(UsageFrequency::PerMaterial, TEXTURE_BINDING)?
                .write_image(
                    device,
                    texture.image.sampler.unwrap_or(vk::Sampler::null()),
                    texture.image.view,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                );
        }

        let (vertex_module, fragment_module) = unsafe {
            (
                create_shader_module(device, shaders.vertex)?,
                create_shader_module(device, shaders.fragment)?,
            )
        };

        let pipeline = unsafe {
            build_pipeline(
                device,
                &descriptors,
                vertex_module,
                fragment_module,
                render_pass,
                extent,
            )?
        };

        Ok(Self {
            descriptors,
            pipeline,
            vertex_module,
            fragment_module,
            frame_buffer,
            object_buffer,
            texture,
        })
    }

    /// Write this frame's lighting constants and rebind them.
    pub fn upload_frame_data(
        &self,
        device: &ash::Device,
        directional_light: Vec3,
        camera_position: Vec3,
    ) -> Result<()> {
        let data = FrameData {
            directional_light: directional_light.extend(1.0).to_array(),
            camera_position: camera_position.extend(1.0).to_array(),
        };
        self.frame_buffer.write_slice(std::slice::from_ref(&data), 0)?;

        let template = self
            .descriptors
            .write_template(UsageFrequency::PerFrame, FRAME_DATA_BINDING)?;
        unsafe {
            template.write_buffer(
                device,
                self.frame_buffer.buffer,
                0,
                std::mem::size_of::<FrameData>() as vk::DeviceSize,
            );
        }
        Ok(())
    }

    /// Write the camera matrix followed by the object transforms, chaining
    /// offsets, then rebind the written range.
    pub fn upload_object_data(
        &self,
        device: &ash::Device,
        view_proj: Mat4,
        transforms: &[Mat4],
    ) -> Result<()> {
        let mut offset = self
            .object_buffer
            .write_slice(std::slice::from_ref(&view_proj), 0)?;
        offset = self.object_buffer.write_slice(transforms, offset)?;

        let template = self
            .descriptors
            .write_template(UsageFrequency::PerObject, OBJECT_DATA_BINDING)?;
        unsafe {
            template.write_buffer(device, self.object_buffer.buffer, 0, offset);
        }
        Ok(())
    }

    /// Record the geometry draws into an already-begun secondary buffer.
    ///
    /// # Safety
    /// The command buffer must be recording in render-pass-continue mode.
    pub unsafe fn record(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        meshes: &[Mesh],
    ) -> Result<()> {
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);

        let sets = [
            self.descriptors.set(UsageFrequency::PerFrame)?,
            self.descriptors.set(UsageFrequency::PerObject)?,
            self.descriptors.set(UsageFrequency::PerMaterial)?,
        ];
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            self.pipeline.layout,
            0,
            &sets,
            &[],
        );

        for (object_index, mesh) in meshes.iter().enumerate() {
            mesh.record_draw(device, cmd, object_index as u32);
        }
        Ok(())
    }

    /// Rebuild the pipeline against a new extent after swapchain recreation.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn rebuild_pipeline(
        &mut self,
        device: &ash::Device,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> Result<()> {
        self.pipeline.destroy(device);
        self.pipeline = build_pipeline(
            device,
            &self.descriptors,
            self.vertex_module,
            self.fragment_module,
            render_pass,
            extent,
        )?;
        Ok(())
    }

    /// Destroy all pass resources.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.pipeline.destroy(device);
        device.destroy_shader_module(self.vertex_module, None);
        device.destroy_shader_module(self.fragment_module, None);
        self.frame_buffer.destroy(device);
        self.object_buffer.destroy(device);
        self.texture.destroy(device);
        self.descriptors.destroy();
    }
}

/// Pipeline for the geometry technique at a given extent.
///
/// # Safety
/// All handles must be valid.
unsafe fn build_pipeline(
    device: &ash::Device,
    descriptors: &DescriptorManager,
    vertex_module: vk::ShaderModule,
    fragment_module: vk::ShaderModule,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<Pipeline> {
    let set_layouts = [
        descriptors.layout(UsageFrequency::PerFrame)?,
        descriptors.layout(UsageFrequency::PerObject)?,
        descriptors.layout(UsageFrequency::PerMaterial)?,
    ];
    let layout = create_pipeline_layout(device, &set_layouts, &[])?;

    GraphicsPipelineBuilder::new(vertex_module, fragment_module)
        .vertex_layout(
            vec![Vertex::binding_description()],
            Vertex::attribute_descriptions(),
        )
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .rasterizer(vk::PolygonMode::FILL, vk::CullModeFlags::NONE)
        .depth(true, true, vk::CompareOp::LESS)
        .viewport(flipped_viewport(extent), full_scissor(extent))
        .build(device, layout, render_pass)
}

/// Y-flipped viewport so world space is y-up while clip space stays Vulkan's.
pub(crate) fn flipped_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: extent.height as f32,
        width: extent.width as f32,
        height: -(extent.height as f32),
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

/// Scissor covering the whole render area.
pub(crate) fn full_scissor(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_data_matches_shader_layout() {
        // Two vec4s
        assert_eq!(std::mem::size_of::<FrameData>(), 32);
    }

    #[test]
    fn viewport_is_y_flipped() {
        let extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let viewport = flipped_viewport(extent);
        assert_eq!(viewport.y, 600.0);
        assert_eq!(viewport.height, -600.0);
        assert_eq!(viewport.width, 800.0);
    }
}
