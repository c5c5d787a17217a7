//! Pipeline and render-pass construction.

use crate::error::{GpuError, Result};
use ash::vk;

/// An immutable pipeline with its layout.
///
/// Rebuilding requires a new `Pipeline`; there is no in-place mutation, so an
/// in-flight command buffer can never observe a half-updated pipeline.
pub struct Pipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl Pipeline {
    /// Destroy the pipeline and its layout.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

/// Reinterpret raw shader bytes as SPIR-V words.
///
/// SPIR-V is a stream of 32-bit words; a byte length that is not a multiple
/// of four means the loader handed over a truncated or corrupt file.
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(GpuError::Initialization(format!(
            "shader bytecode length {} is not a multiple of 4",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Create a shader module from loader-supplied bytecode.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_shader_module(device: &ash::Device, bytes: &[u8]) -> Result<vk::ShaderModule> {
    let words = spirv_words(bytes)?;
    let create_info = vk::ShaderModuleCreateInfo::default().code(&words);

    device
        .create_shader_module(&create_info, None)
        .map_err(|e| GpuError::Initialization(format!("shader module creation failed: {e}")))
}

/// Create a pipeline layout from set layouts and push-constant ranges.
///
/// # Safety
/// The device and set layouts must be valid.
pub unsafe fn create_pipeline_layout(
    device: &ash::Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_ranges: &[vk::PushConstantRange],
) -> Result<vk::PipelineLayout> {
    let create_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(set_layouts)
        .push_constant_ranges(push_constant_ranges);

    let layout = device
        .create_pipeline_layout(&create_info, None)
        .map_err(|e| GpuError::Initialization(format!("pipeline layout creation failed: {e}")))?;
    Ok(layout)
}

/// Create a compute pipeline from shader bytecode.
///
/// The returned [`Pipeline`] owns the layout built from `set_layouts`.
///
/// # Safety
/// The device must be valid and the bytecode must be valid SPIR-V.
pub unsafe fn create_compute_pipeline(
    device: &ash::Device,
    shader_bytes: &[u8],
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_ranges: &[vk::PushConstantRange],
) -> Result<Pipeline> {
    let shader_module = create_shader_module(device, shader_bytes)?;
    let layout = create_pipeline_layout(device, set_layouts, push_constant_ranges)?;

    let stage_info = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(shader_module)
        .name(c"main");

    let pipeline_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage_info)
        .layout(layout);

    let pipelines = device
        .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        .map_err(|(_pipelines, e)| {
            GpuError::Initialization(format!("compute pipeline creation failed: {e}"))
        })?;

    // Module is compiled into the pipeline; no longer needed
    device.destroy_shader_module(shader_module, None);

    Ok(Pipeline {
        pipeline: pipelines[0],
        layout,
    })
}

/// Load/store and layout configuration for one render-pass attachment.
#[derive(Debug, Clone, Copy)]
pub struct AttachmentConfig {
    pub format: vk::Format,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

/// Create a single-subpass forward render pass.
///
/// Fixed two-attachment convention: attachment 0 is color, attachment 1 is
/// depth-stencil. The caller supplies ops, layouts, and subpass dependencies.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_render_pass(
    device: &ash::Device,
    color: AttachmentConfig,
    depth: AttachmentConfig,
    dependencies: &[vk::SubpassDependency],
) -> Result<vk::RenderPass> {
    let attachments = [
        vk::AttachmentDescription::default()
            .format(color.format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(color.load_op)
            .store_op(color.store_op)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(color.initial_layout)
            .final_layout(color.final_layout),
        vk::AttachmentDescription::default()
            .format(depth.format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(depth.load_op)
            .store_op(depth.store_op)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(depth.initial_layout)
            .final_layout(depth.final_layout),
    ];

    let color_reference = vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    let depth_reference = vk::AttachmentReference::default()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(std::slice::from_ref(&color_reference))
        .depth_stencil_attachment(&depth_reference);

    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(std::slice::from_ref(&subpass))
        .dependencies(dependencies);

    let render_pass = device
        .create_render_pass(&create_info, None)
        .map_err(|e| GpuError::Initialization(format!("render pass creation failed: {e}")))?;
    Ok(render_pass)
}

/// The two external color-attachment dependencies used by every forward pass:
/// presentable-image in, presentable-image out.
pub fn standard_forward_dependencies() -> [vk::SubpassDependency; 2] {
    [
        vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::MEMORY_READ)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            )
            .dependency_flags(vk::DependencyFlags::BY_REGION),
        vk::SubpassDependency::default()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
            .src_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            )
            .dst_access_mask(vk::AccessFlags::MEMORY_READ)
            .dependency_flags(vk::DependencyFlags::BY_REGION),
    ]
}

/// Builder accumulating graphics pipeline state.
///
/// Viewport and scissor are baked into the pipeline (not dynamic), so a
/// resize rebuilds pipelines along with the swapchain.
pub struct GraphicsPipelineBuilder {
    vertex_shader: vk::ShaderModule,
    fragment_shader: vk::ShaderModule,
    vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    topology: vk::PrimitiveTopology,
    polygon_mode: vk::PolygonMode,
    cull_mode: vk::CullModeFlags,
    front_face: vk::FrontFace,
    depth_test: bool,
    depth_write: bool,
    depth_compare: vk::CompareOp,
    alpha_blend: bool,
    viewport: vk::Viewport,
    scissor: vk::Rect2D,
}

impl GraphicsPipelineBuilder {
    /// Start a builder from a vertex and fragment shader module.
    pub fn new(vertex_shader: vk::ShaderModule, fragment_shader: vk::ShaderModule) -> Self {
        Self {
            vertex_shader,
            fragment_shader,
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS,
            alpha_blend: false,
            viewport: vk::Viewport::default(),
            scissor: vk::Rect2D::default(),
        }
    }

    /// Set the vertex layout.
    pub fn vertex_layout(
        mut self,
        bindings: Vec<vk::VertexInputBindingDescription>,
        attributes: Vec<vk::VertexInputAttributeDescription>,
    ) -> Self {
        self.vertex_bindings = bindings;
        self.vertex_attributes = attributes;
        self
    }

    /// Set the input topology.
    pub fn topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    /// Set rasterizer polygon and cull modes.
    pub fn rasterizer(mut self, polygon_mode: vk::PolygonMode, cull_mode: vk::CullModeFlags) -> Self {
        self.polygon_mode = polygon_mode;
        self.cull_mode = cull_mode;
        self
    }

    /// Set depth test parameters.
    pub fn depth(mut self, test: bool, write: bool, compare: vk::CompareOp) -> Self {
        self.depth_test = test;
        self.depth_write = write;
        self.depth_compare = compare;
        self
    }

    /// Enable standard alpha blending on the color attachment.
    pub fn alpha_blend(mut self, enable: bool) -> Self {
        self.alpha_blend = enable;
        self
    }

    /// Set the fixed viewport and scissor.
    pub fn viewport(mut self, viewport: vk::Viewport, scissor: vk::Rect2D) -> Self {
        self.viewport = viewport;
        self.scissor = scissor;
        self
    }

    /// Assemble the accumulated state into one immutable pipeline.
    ///
    /// The returned [`Pipeline`] takes ownership of `layout`.
    ///
    /// # Safety
    /// The device, shader modules, layout, and render pass must be valid.
    pub unsafe fn build(
        self,
        device: &ash::Device,
        layout: vk::PipelineLayout,
        render_pass: vk::RenderPass,
    ) -> Result<Pipeline> {
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(self.vertex_shader)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(self.fragment_shader)
                .name(c"main"),
        ];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&self.vertex_bindings)
            .vertex_attribute_descriptions(&self.vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(self.topology)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(std::slice::from_ref(&self.viewport))
            .scissors(std::slice::from_ref(&self.scissor));

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(self.polygon_mode)
            .cull_mode(self.cull_mode)
            .front_face(self.front_face)
            .depth_bias_enable(false)
            .line_width(1.0);

        // No multisampling
        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(self.depth_test)
            .depth_write_enable(self.depth_write)
            .depth_compare_op(self.depth_compare)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachment = if self.alpha_blend {
            vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        } else {
            vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(false)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        };

        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(std::slice::from_ref(&color_blend_attachment));

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0);

        let pipelines = device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_pipelines, e)| {
                GpuError::Initialization(format!("graphics pipeline creation failed: {e}"))
            })?;

        Ok(Pipeline {
            pipeline: pipelines[0],
            layout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spirv_words_are_little_endian() {
        let bytes = [0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x01, 0x00];
        let words = spirv_words(&bytes).unwrap();
        assert_eq!(words, [0x0723_0203, 0x0001_0000]);
    }

    #[test]
    fn truncated_bytecode_fails_initialization() {
        let result = spirv_words(&[0x03, 0x02, 0x23]);
        assert!(matches!(result, Err(GpuError::Initialization(_))));
    }

    #[test]
    fn empty_bytecode_is_zero_words() {
        assert!(spirv_words(&[]).unwrap().is_empty());
    }
}
