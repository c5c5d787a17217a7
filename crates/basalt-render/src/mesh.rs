//! GPU meshes with the engine's fixed vertex layout.
//!
//! Vertex and index content comes from an external model loader; the contract
//! here is fixed layout in, buffer copy out.

use ash::vk;
use basalt_gpu::error::Result;
use basalt_gpu::memory::{GpuBuffer, MemoryFactory};
use bytemuck::{Pod, Zeroable};

/// The fixed vertex layout every loaded model must conform to.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    /// Vertex buffer binding description.
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(std::mem::size_of::<Self>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
    }

    /// Attribute descriptions matching the layout above.
    pub fn attribute_descriptions() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            vk::VertexInputAttributeDescription::default()
                .location(0)
                .binding(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(0),
            vk::VertexInputAttributeDescription::default()
                .location(1)
                .binding(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(12),
            vk::VertexInputAttributeDescription::default()
                .location(2)
                .binding(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(24),
        ]
    }
}

/// A mesh uploaded to GPU buffers.
pub struct Mesh {
    pub vertex_buffer: GpuBuffer,
    pub index_buffer: GpuBuffer,
    pub index_count: u32,
}

impl Mesh {
    /// Upload loader-supplied vertex and index arrays.
    pub fn upload(factory: &MemoryFactory, vertices: &[Vertex], indices: &[u32]) -> Result<Self> {
        let vertex_buffer = factory.create_buffer(
            std::mem::size_of_val(vertices) as vk::DeviceSize,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        vertex_buffer.write_slice(vertices, 0)?;

        let index_buffer = factory.create_buffer(
            std::mem::size_of_val(indices) as vk::DeviceSize,
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;
        index_buffer.write_slice(indices, 0)?;

        Ok(Self {
            vertex_buffer,
            index_buffer,
            index_count: indices.len() as u32,
        })
    }

    /// Record an indexed draw. `object_index` reaches the vertex shader as
    /// the base instance so each mesh picks its own transform from the
    /// per-object storage buffer.
    ///
    /// # Safety
    /// The command buffer must be recording with a compatible pipeline bound.
    pub unsafe fn record_draw(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        object_index: u32,
    ) {
        device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer], &[0]);
        device.cmd_bind_index_buffer(cmd, self.index_buffer.buffer, 0, vk::IndexType::UINT32);
        device.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, object_index);
    }

    /// Destroy the mesh buffers.
    ///
    /// # Safety
    /// No in-flight command buffer may reference the mesh.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.vertex_buffer.destroy(device);
        self.index_buffer.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        let attributes = Vertex::attribute_descriptions();
        assert_eq!(attributes.len(), 3);
        assert_eq!(attributes[0].offset, 0);
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[2].offset, 24);
        assert_eq!(Vertex::binding_description().stride, 32);
    }
}
