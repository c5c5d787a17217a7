//! Terrain density generation and drawing.
//!
//! A compute dispatch fills a density buffer on the GPU each frame; after the
//! frame retires the density values are read back on the host and handed to a
//! [`DensityMesher`] (the table-driven surface extraction lives outside this
//! core) which produces the vertex list drawn inside the main render pass on
//! the next frame.

use crate::geometry::{flipped_viewport, full_scissor};
use ash::vk;
use basalt_gpu::command::{begin_command_buffer, end_command_buffer};
use basalt_gpu::descriptors::{DescriptorManager, UsageFrequency};
use basalt_gpu::error::Result;
use basalt_gpu::memory::{GpuBuffer, MemoryFactory};
use basalt_gpu::pipeline::{
    create_compute_pipeline, create_pipeline_layout, create_shader_module,
    GraphicsPipelineBuilder, Pipeline,
};
use basalt_gpu::GpuContext;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

/// Number of density values produced per dispatch.
pub const DENSITY_VALUE_COUNT: usize = 256;

const DENSITY_INPUT_BINDING: u32 = 0;
const DENSITY_OUTPUT_BINDING: u32 = 1;

/// Vertex produced by surface extraction.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TerrainVertex {
    pub position: [f32; 3],
}

impl TerrainVertex {
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
            .format(vk::Format::R32G32B32_SFLOAT)
            .offset(0)]
    }
}

/// Turns a density field into terrain vertices.
///
/// The cell tables (marching-cubes style) are supplied by the caller; this
/// core only owns the GPU plumbing around them.
pub trait DensityMesher {
    fn mesh(&self, density: &[f32]) -> Vec<TerrainVertex>;
}

/// Shader bytecode for the terrain pass.
pub struct TerrainShaders<'a> {
    pub compute: &'a [u8],
    pub vertex: &'a [u8],
    pub fragment: &'a [u8],
}

/// Compute-to-graphics terrain sub-pass.
pub struct TerrainPass {
    descriptors: DescriptorManager,
    compute: Pipeline,
    graphics: Pipeline,
    vertex_module: vk::ShaderModule,
    fragment_module: vk::ShaderModule,
    input_buffer: GpuBuffer,
    output_buffer: GpuBuffer,
    mesh_buffer: Option<GpuBuffer>,
    vertex_count: u32,
}

impl TerrainPass {
    /// Build the pass: density buffers, the compute pipeline, and the
    /// graphics pipeline for the extracted mesh.
    pub fn new(
        gpu: &GpuContext,
        factory: &MemoryFactory,
        shaders: &TerrainShaders<'_>,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        tracing::info!("Constructing terrain pass");

        let device = gpu.device();
        let mut descriptors = DescriptorManager::new(gpu.device_arc())?;

        descriptors.add_binding(
            DENSITY_INPUT_BINDING,
            vk::ShaderStageFlags::COMPUTE,
            UsageFrequency::PerFrame,
            vk::DescriptorType::STORAGE_BUFFER,
        )?;
        descriptors.add_binding(
            DENSITY_OUTPUT_BINDING,
            vk::ShaderStageFlags::COMPUTE,
            UsageFrequency::PerFrame,
            vk::DescriptorType::STORAGE_BUFFER,
        )?;

        let input_buffer = factory.create_buffer(
            std::mem::size_of::<Mat4>() as vk::DeviceSize,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;
        input_buffer.write_slice(std::slice::from_ref(&Mat4::IDENTITY), 0)?;

        let output_buffer = factory.create_buffer(
            (DENSITY_VALUE_COUNT * std::mem::size_of::<f32>()) as vk::DeviceSize,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;
        output_buffer.write_slice(&[0.0_f32; DENSITY_VALUE_COUNT], 0)?;

        // Output binding points at the same buffer for the pass's lifetime
        unsafe {
            descriptors
                .write_template(UsageFrequency::PerFrame, DENSITY_OUTPUT_BINDING)?
                .write_buffer(device, output_buffer.buffer, 0, output_buffer.capacity);
        }

        let density_layout = descriptors.layout(UsageFrequency::PerFrame)?;
        let compute =
            unsafe { create_compute_pipeline(device, shaders.compute, &[density_layout], &[])? };

        let (vertex_module, fragment_module) = unsafe {
            (
                create_shader_module(device, shaders.vertex)?,
                create_shader_module(device, shaders.fragment)?,
            )
        };
        let graphics = unsafe {
            build_graphics_pipeline(device, vertex_module, fragment_module, render_pass, extent)?
        };

        Ok(Self {
            descriptors,
            compute,
            graphics,
            vertex_module,
            fragment_module,
            input_buffer,
            output_buffer,
            mesh_buffer: None,
            vertex_count: 0,
        })
    }

    /// Refresh the camera transform feeding the density shader.
    pub fn update_camera(&self, device: &ash::Device, view_proj: Mat4) -> Result<()> {
        self.input_buffer
            .write_slice(std::slice::from_ref(&view_proj), 0)?;

        let template = self
            .descriptors
            .write_template(UsageFrequency::PerFrame, DENSITY_INPUT_BINDING)?;
        unsafe {
            template.write_buffer(device, self.input_buffer.buffer, 0, self.input_buffer.capacity);
        }
        Ok(())
    }

    /// Record the density dispatch into its own primary command buffer,
    /// submitted alongside (and outside) the main render pass.
    ///
    /// # Safety
    /// The command buffer must come from a freshly reset pool.
    pub unsafe fn record_density(&self, device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
        begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;

        let set = self.descriptors.set(UsageFrequency::PerFrame)?;
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::COMPUTE,
            self.compute.layout,
            0,
            &[set],
            &[],
        );
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.compute.pipeline);
        device.cmd_dispatch(cmd, DENSITY_VALUE_COUNT as u32, 1, 1);

        end_command_buffer(device, cmd)?;
        Ok(())
    }

    /// Whether an extracted mesh exists to draw.
    pub fn ready(&self) -> bool {
        self.mesh_buffer.is_some()
    }

    /// Record the terrain draw into an already-begun secondary buffer.
    ///
    /// # Safety
    /// The command buffer must be recording in render-pass-continue mode and
    /// [`Self::ready`] must be true.
    pub unsafe fn record_draw(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        let Some(mesh_buffer) = &self.mesh_buffer else {
            return;
        };

        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.graphics.pipeline);
        device.cmd_bind_vertex_buffers(cmd, 0, &[mesh_buffer.buffer], &[0]);
        device.cmd_draw(cmd, self.vertex_count, 1, 0, 0);
    }

    /// Read the density values back from the mapped output buffer.
    ///
    /// Only valid after the submission that ran the dispatch has retired
    /// (the orchestrator's post-present idle wait).
    pub fn read_density(&self) -> Result<Vec<f32>> {
        let bytes = self
            .output_buffer
            .read_bytes(0, DENSITY_VALUE_COUNT * std::mem::size_of::<f32>())?;
        Ok(floats_from_bytes(&bytes))
    }

    /// Replace the terrain mesh from a freshly read density field.
    ///
    /// The previous vertex buffer is destroyed; callers must only invoke this
    /// while the device is quiescent.
    pub fn rebuild_mesh(
        &mut self,
        factory: &MemoryFactory,
        mesher: &dyn DensityMesher,
        density: &[f32],
    ) -> Result<()> {
        let vertices = mesher.mesh(density);

        if let Some(mut old) = self.mesh_buffer.take() {
            unsafe {
                old.destroy(factory.device());
            }
        }
        self.vertex_count = 0;

        if vertices.is_empty() {
            return Ok(());
        }

        let buffer = factory.create_buffer(
            std::mem::size_of_val(vertices.as_slice()) as vk::DeviceSize,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        buffer.write_slice(&vertices, 0)?;

        self.vertex_count = vertices.len() as u32;
        self.mesh_buffer = Some(buffer);
        Ok(())
    }

    /// Rebuild the graphics pipeline against a new extent.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn rebuild_pipeline(
        &mut self,
        device: &ash::Device,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> Result<()> {
        self.graphics.destroy(device);
        self.graphics = build_graphics_pipeline(
            device,
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
        self.compute.destroy(device);
        self.graphics.destroy(device);
        device.destroy_shader_module(self.vertex_module, None);
        device.destroy_shader_module(self.fragment_module, None);
        self.input_buffer.destroy(device);
        self.output_buffer.destroy(device);
        if let Some(mut mesh_buffer) = self.mesh_buffer.take() {
            mesh_buffer.destroy(device);
        }
        self.descriptors.destroy();
    }
}

/// Graphics pipeline for the extracted terrain mesh.
///
/// # Safety
/// All handles must be valid.
unsafe fn build_graphics_pipeline(
    device: &ash::Device,
    vertex_module: vk::ShaderModule,
    fragment_module: vk::ShaderModule,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<Pipeline> {
    let layout = create_pipeline_layout(device, &[], &[])?;

    GraphicsPipelineBuilder::new(vertex_module, fragment_module)
        .vertex_layout(
            vec![TerrainVertex::binding_description()],
            TerrainVertex::attribute_descriptions(),
        )
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .rasterizer(vk::PolygonMode::FILL, vk::CullModeFlags::NONE)
        .depth(true, true, vk::CompareOp::LESS)
        .viewport(flipped_viewport(extent), full_scissor(extent))
        .build(device, layout, render_pass)
}

/// Reinterpret little-endian density bytes as floats.
fn floats_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn density_bytes_round_trip() {
        let values = [0.0_f32, -1.5, 42.25];
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(floats_from_bytes(&bytes), values);
    }

    #[test]
    fn terrain_vertex_is_three_floats() {
        assert_eq!(std::mem::size_of::<TerrainVertex>(), 12);
        assert_eq!(TerrainVertex::binding_description().stride, 12);
    }

    struct ThresholdMesher;

    impl DensityMesher for ThresholdMesher {
        fn mesh(&self, density: &[f32]) -> Vec<TerrainVertex> {
            density
                .iter()
                .enumerate()
                .filter(|(_, value)| **value > 0.0)
                .map(|(index, _)| TerrainVertex {
                    position: [index as f32, 0.0, 0.0],
                })
                .collect()
        }
    }

    #[test]
    fn mesher_sees_the_full_density_field() {
        let density = vec![0.0_f32, 1.0, 0.0, 2.0];
        let vertices = ThresholdMesher.mesh(&density);
        assert_eq!(vertices.len(), 2);
        assert_eq!(vertices[0].position[0], 1.0);
        assert_eq!(vertices[1].position[0], 3.0);
    }
}
