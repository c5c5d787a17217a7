//! Text overlay sub-pass.
//!
//! Draws screen-space glyph quads over the finished frame. The font content
//! (bitmap and per-glyph metrics) is supplied by the caller through
//! [`FontAtlas`]; this pass owns the GPU side: the R8 font texture, the quad
//! vertex buffer, and a render pass that loads the color attachment instead
//! of clearing it.

use crate::geometry::{flipped_viewport, full_scissor};
use crate::texture::Texture;
use ash::vk;
use basalt_gpu::command::{begin_command_buffer, end_command_buffer, CommandPool};
use basalt_gpu::descriptors::{DescriptorManager, UsageFrequency};
use basalt_gpu::error::Result;
use basalt_gpu::memory::{GpuBuffer, MemoryFactory};
use basalt_gpu::pipeline::{
    create_pipeline_layout, create_render_pass, create_shader_module,
    standard_forward_dependencies, AttachmentConfig, GraphicsPipelineBuilder, Pipeline,
};
use basalt_gpu::swapchain::Swapchain;
use basalt_gpu::GpuContext;
use bytemuck::{Pod, Zeroable};

/// Maximum characters the overlay vertex buffer can hold.
pub const MAX_OVERLAY_CHARS: usize = 1024;

const FONT_BINDING: u32 = 0;
const VERTICES_PER_GLYPH: usize = 4;

/// Screen-space metrics for one glyph quad, in character-cell units, plus its
/// atlas texture coordinates.
#[derive(Debug, Clone, Copy)]
pub struct Glyph {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
    pub s0: f32,
    pub t0: f32,
    pub s1: f32,
    pub t1: f32,
    pub advance: f32,
}

/// A rasterized font supplied by the caller.
pub trait FontAtlas {
    /// Bitmap dimensions in pixels.
    fn dimensions(&self) -> (u32, u32);
    /// Single-channel bitmap data, row-major, `width * height` bytes.
    fn pixels(&self) -> &[u8];
    /// Metrics for a character, or `None` if the atlas has no glyph for it.
    fn glyph(&self, c: char) -> Option<Glyph>;
}

/// One overlay vertex: clip-space position and atlas coordinates.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TextVertex {
    pub x: f32,
    pub y: f32,
    pub u: f32,
    pub v: f32,
}

impl TextVertex {
    fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(std::mem::size_of::<Self>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
    }

    fn attribute_descriptions() -> Vec<vk::VertexInputAttributeDescription> {
        vec![vk::VertexInputAttributeDescription::default()
            .location(0)
            .binding(0)
            .format(vk::Format::R32G32B32A32_SFLOAT)
            .offset(0)]
    }
}

/// Shader bytecode for the overlay.
pub struct OverlayShaders<'a> {
    pub vertex: &'a [u8],
    pub fragment: &'a [u8],
}

/// The text overlay pass.
pub struct OverlayPass {
    atlas: Box<dyn FontAtlas>,
    descriptors: DescriptorManager,
    render_pass: vk::RenderPass,
    pipeline: Pipeline,
    vertex_module: vk::ShaderModule,
    fragment_module: vk::ShaderModule,
    font_texture: Texture,
    vertex_buffer: GpuBuffer,
    framebuffers: Vec<vk::Framebuffer>,
    glyph_count: u32,
}

impl OverlayPass {
    /// Build the pass: font texture, overlay render pass, blend pipeline, and
    /// per-image framebuffers.
    pub fn new(
        gpu: &GpuContext,
        factory: &MemoryFactory,
        upload_pool: &CommandPool,
        atlas: Box<dyn FontAtlas>,
        shaders: &OverlayShaders<'_>,
        depth_format: vk::Format,
        swapchain: &Swapchain,
        depth_view: vk::ImageView,
    ) -> Result<Self> {
        tracing::info!("Creating text overlay");

        let device = gpu.device();

        let (font_width, font_height) = atlas.dimensions();
        let font_texture = Texture::upload_r8(
            factory,
            upload_pool,
            gpu.graphics_queue(),
            atlas.pixels(),
            font_width,
            font_height,
        )?;

        let mut descriptors = DescriptorManager::new(gpu.device_arc())?;
        descriptors.add_binding(
            FONT_BINDING,
            vk::ShaderStageFlags::FRAGMENT,
            UsageFrequency::PerMaterial,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        )?;
        unsafe {
            descriptors
                .write_template(UsageFrequency::PerMaterial, FONT_BINDING)?
                .write_image(
                    device,
                    font_texture.image.sampler.unwrap_or(vk::Sampler::null()),
                    font_texture.image.view,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                );
        }

        // The overlay draws over the finished frame: load the color
        // attachment, never clear it
        let render_pass = unsafe {
            create_render_pass(
                device,
                AttachmentConfig {
                    format: swapchain.format,
                    load_op: vk::AttachmentLoadOp::LOAD,
                    store_op: vk::AttachmentStoreOp::STORE,
                    initial_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                    final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                },
                AttachmentConfig {
                    format: depth_format,
                    load_op: vk::AttachmentLoadOp::CLEAR,
                    store_op: vk::AttachmentStoreOp::STORE,
                    initial_layout: vk::ImageLayout::UNDEFINED,
                    final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                },
                &standard_forward_dependencies(),
            )?
        };

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
                swapchain.extent,
            )?
        };

        let vertex_buffer = factory.create_buffer(
            (MAX_OVERLAY_CHARS * VERTICES_PER_GLYPH * std::mem::size_of::<TextVertex>())
                as vk::DeviceSize,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;

        let framebuffers =
            unsafe { create_framebuffers(device, render_pass, swapchain, depth_view)? };

        Ok(Self {
            atlas,
            descriptors,
            render_pass,
            pipeline,
            vertex_module,
            fragment_module,
            font_texture,
            vertex_buffer,
            framebuffers,
            glyph_count: 0,
        })
    }

    /// Rebuild the glyph quads for new text.
    pub fn set_text(&mut self, text: &str, extent: vk::Extent2D) -> Result<()> {
        let mut vertices = build_text_quads(self.atlas.as_ref(), text, extent);
        if vertices.len() > MAX_OVERLAY_CHARS * VERTICES_PER_GLYPH {
            tracing::warn!(
                "Overlay text truncated to {} characters",
                MAX_OVERLAY_CHARS
            );
            vertices.truncate(MAX_OVERLAY_CHARS * VERTICES_PER_GLYPH);
        }

        self.vertex_buffer.write_slice(&vertices, 0)?;
        self.glyph_count = (vertices.len() / VERTICES_PER_GLYPH) as u32;
        Ok(())
    }

    /// Record the overlay into its own primary buffer, one strip draw per
    /// glyph.
    ///
    /// # Safety
    /// The command buffer must come from a freshly reset pool and
    /// `image_index` must be a valid swapchain image index.
    pub unsafe fn record(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        image_index: u32,
        render_area: vk::Rect2D,
    ) -> Result<()> {
        begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;

        // Color entry is ignored (LOAD) but must occupy its attachment slot
        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue { float32: [0.0; 4] },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let pass_begin = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass)
            .framebuffer(self.framebuffers[image_index as usize])
            .render_area(render_area)
            .clear_values(&clear_values);

        device.cmd_begin_render_pass(cmd, &pass_begin, vk::SubpassContents::INLINE);

        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);
        let set = self.descriptors.set(UsageFrequency::PerMaterial)?;
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            self.pipeline.layout,
            0,
            &[set],
            &[],
        );
        device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer], &[0]);

        for glyph in 0..self.glyph_count {
            device.cmd_draw(cmd, VERTICES_PER_GLYPH as u32, 1, glyph * VERTICES_PER_GLYPH as u32, 0);
        }

        device.cmd_end_render_pass(cmd);
        end_command_buffer(device, cmd)?;
        Ok(())
    }

    /// Rebuild framebuffers and the pipeline after swapchain recreation.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn rebuild(
        &mut self,
        device: &ash::Device,
        swapchain: &Swapchain,
        depth_view: vk::ImageView,
    ) -> Result<()> {
        for &framebuffer in &self.framebuffers {
            device.destroy_framebuffer(framebuffer, None);
        }
        self.framebuffers = create_framebuffers(device, self.render_pass, swapchain, depth_view)?;

        self.pipeline.destroy(device);
        self.pipeline = build_pipeline(
            device,
            &self.descriptors,
            self.vertex_module,
            self.fragment_module,
            self.render_pass,
            swapchain.extent,
        )?;
        Ok(())
    }

    /// Destroy all pass resources.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for &framebuffer in &self.framebuffers {
            device.destroy_framebuffer(framebuffer, None);
        }
        self.framebuffers.clear();
        self.pipeline.destroy(device);
        device.destroy_shader_module(self.vertex_module, None);
        device.destroy_shader_module(self.fragment_module, None);
        device.destroy_render_pass(self.render_pass, None);
        self.vertex_buffer.destroy(device);
        self.font_texture.destroy(device);
        self.descriptors.destroy();
    }
}

/// # Safety
/// All handles must be valid.
unsafe fn create_framebuffers(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    swapchain: &Swapchain,
    depth_view: vk::ImageView,
) -> Result<Vec<vk::Framebuffer>> {
    swapchain
        .image_views
        .iter()
        .map(|&color_view| {
            let attachments = [color_view, depth_view];
            let create_info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(swapchain.extent.width)
                .height(swapchain.extent.height)
                .layers(1);
            let framebuffer = device.create_framebuffer(&create_info, None)?;
            Ok(framebuffer)
        })
        .collect()
}

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
    let set_layouts = [descriptors.layout(UsageFrequency::PerMaterial)?];
    let layout = create_pipeline_layout(device, &set_layouts, &[])?;

    GraphicsPipelineBuilder::new(vertex_module, fragment_module)
        .vertex_layout(
            vec![TextVertex::binding_description()],
            TextVertex::attribute_descriptions(),
        )
        .topology(vk::PrimitiveTopology::TRIANGLE_STRIP)
        .rasterizer(vk::PolygonMode::FILL, vk::CullModeFlags::NONE)
        .depth(true, true, vk::CompareOp::LESS_OR_EQUAL)
        .alpha_blend(true)
        .viewport(flipped_viewport(extent), full_scissor(extent))
        .build(device, layout, render_pass)
}

/// Build clip-space quad vertices for a line of text, four vertices per
/// drawable glyph, in strip order (top-left, bottom-left, top-right,
/// bottom-right). Characters the atlas has no glyph for are skipped.
fn build_text_quads(atlas: &dyn FontAtlas, text: &str, extent: vk::Extent2D) -> Vec<TextVertex> {
    // Character cell scale in clip space
    let char_w = 1.5 / extent.width as f32;
    let char_h = 1.5 / extent.height as f32;

    let mut vertices = Vec::with_capacity(text.len() * VERTICES_PER_GLYPH);
    let mut x = -1.0 + char_w;
    let y = -1.0 + char_h;

    for c in text.chars() {
        let Some(glyph) = atlas.glyph(c) else {
            continue;
        };

        vertices.push(TextVertex {
            x: x + glyph.x0 * char_w,
            y: -(y + glyph.y0 * char_h),
            u: glyph.s0,
            v: glyph.t0,
        });
        vertices.push(TextVertex {
            x: x + glyph.x0 * char_w,
            y: -(y + glyph.y1 * char_h),
            u: glyph.s0,
            v: glyph.t1,
        });
        vertices.push(TextVertex {
            x: x + glyph.x1 * char_w,
            y: -(y + glyph.y0 * char_h),
            u: glyph.s1,
            v: glyph.t0,
        });
        vertices.push(TextVertex {
            x: x + glyph.x1 * char_w,
            y: -(y + glyph.y1 * char_h),
            u: glyph.s1,
            v: glyph.t1,
        });

        x += glyph.advance * char_w;
    }

    vertices
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UniformAtlas;

    impl FontAtlas for UniformAtlas {
        fn dimensions(&self) -> (u32, u32) {
            (16, 16)
        }

        fn pixels(&self) -> &[u8] {
            &[]
        }

        fn glyph(&self, c: char) -> Option<Glyph> {
            c.is_ascii_lowercase().then_some(Glyph {
                x0: 0.0,
                y0: 0.0,
                x1: 8.0,
                y1: 8.0,
                s0: 0.0,
                t0: 0.0,
                s1: 1.0,
                t1: 1.0,
                advance: 10.0,
            })
        }
    }

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 100,
        height: 100,
    };

    #[test]
    fn four_vertices_per_drawable_glyph() {
        let vertices = build_text_quads(&UniformAtlas, "abc", EXTENT);
        assert_eq!(vertices.len(), 12);
    }

    #[test]
    fn unknown_glyphs_are_skipped() {
        let vertices = build_text_quads(&UniformAtlas, "a!b", EXTENT);
        assert_eq!(vertices.len(), 8);
    }

    #[test]
    fn advance_moves_successive_glyphs_right() {
        let vertices = build_text_quads(&UniformAtlas, "aa", EXTENT);
        let first_left = vertices[0].x;
        let second_left = vertices[4].x;
        let advance = 10.0 * 1.5 / 100.0;
        assert!((second_left - first_left - advance).abs() < 1e-6);
    }

    #[test]
    fn empty_text_builds_no_quads() {
        assert!(build_text_quads(&UniformAtlas, "", EXTENT).is_empty());
    }
}
