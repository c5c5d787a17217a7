//! Per-frame resource slots and the frame ring.
//!
//! One [`FrameSlot`] exists per swapchain image. A slot's resources are
//! allocated once; on reuse the command pool is reset (never reallocated) and
//! the in-flight fence is waited on then reset. That fence wait is the sole
//! mechanism keeping the CPU from overwriting buffers the GPU is still
//! reading.

use ash::vk;
use basalt_gpu::command::CommandPool;
use basalt_gpu::error::Result;
use basalt_gpu::swapchain::Swapchain;
use basalt_gpu::sync::FrameSync;
use basalt_gpu::GpuContext;

/// One reusable bundle of per-frame synchronization and recording resources.
pub struct FrameSlot {
    /// Framebuffer over this slot's swapchain image view + shared depth view.
    pub framebuffer: vk::Framebuffer,
    /// Acquire/present semaphores and the in-flight fence.
    pub sync: FrameSync,
    /// This slot's command pool; the reset unit for all buffers below.
    pub command_pool: CommandPool,
    /// Primary buffer for the main geometry pass.
    pub main_cb: vk::CommandBuffer,
    /// Primary buffer for the terrain density compute dispatch.
    pub density_cb: vk::CommandBuffer,
    /// Primary buffer for the overlay pass.
    pub overlay_cb: vk::CommandBuffer,
    /// Secondary buffer for opaque geometry, executed inside the main pass.
    pub geometry_cb: vk::CommandBuffer,
    /// Secondary buffer for the terrain draw, executed inside the main pass.
    pub terrain_cb: vk::CommandBuffer,
}

impl FrameSlot {
    /// Allocate a slot against one swapchain image view.
    ///
    /// # Safety
    /// All handles must be valid.
    unsafe fn new(
        gpu: &GpuContext,
        render_pass: vk::RenderPass,
        color_view: vk::ImageView,
        depth_view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let device = gpu.device();

        let framebuffer = create_framebuffer(device, render_pass, color_view, depth_view, extent)?;
        let sync = FrameSync::new(device)?;
        let command_pool = CommandPool::new(device, gpu.graphics_queue_family())?;

        let primaries =
            command_pool.allocate_command_buffers(device, vk::CommandBufferLevel::PRIMARY, 3)?;
        let secondaries =
            command_pool.allocate_command_buffers(device, vk::CommandBufferLevel::SECONDARY, 2)?;

        Ok(Self {
            framebuffer,
            sync,
            command_pool,
            main_cb: primaries[0],
            density_cb: primaries[1],
            overlay_cb: primaries[2],
            geometry_cb: secondaries[0],
            terrain_cb: secondaries[1],
        })
    }

    /// Rebuild this slot's framebuffer against new image views.
    ///
    /// # Safety
    /// The old framebuffer must not be referenced by in-flight work.
    pub unsafe fn rebuild_framebuffer(
        &mut self,
        device: &ash::Device,
        render_pass: vk::RenderPass,
        color_view: vk::ImageView,
        depth_view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Result<()> {
        device.destroy_framebuffer(self.framebuffer, None);
        self.framebuffer = create_framebuffer(device, render_pass, color_view, depth_view, extent)?;
        Ok(())
    }

    /// Destroy the slot's resources.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_framebuffer(self.framebuffer, None);
        self.framebuffer = vk::Framebuffer::null();
        self.sync.destroy(device);
        self.command_pool.destroy(device);
    }
}

/// Create a framebuffer over a color view and the shared depth view.
///
/// # Safety
/// All handles must be valid.
unsafe fn create_framebuffer(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    color_view: vk::ImageView,
    depth_view: vk::ImageView,
    extent: vk::Extent2D,
) -> Result<vk::Framebuffer> {
    let attachments = [color_view, depth_view];
    let create_info = vk::FramebufferCreateInfo::default()
        .render_pass(render_pass)
        .attachments(&attachments)
        .width(extent.width)
        .height(extent.height)
        .layers(1);

    let framebuffer = device.create_framebuffer(&create_info, None)?;
    Ok(framebuffer)
}

/// Owns the frame slots and cycles through them round-robin.
pub struct FrameRing {
    slots: Vec<FrameSlot>,
    frames_rendered: u64,
}

impl FrameRing {
    /// Create one slot per swapchain image view.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn new(
        gpu: &GpuContext,
        render_pass: vk::RenderPass,
        swapchain: &Swapchain,
        depth_view: vk::ImageView,
    ) -> Result<Self> {
        let slots = swapchain
            .image_views
            .iter()
            .map(|&color_view| {
                FrameSlot::new(gpu, render_pass, color_view, depth_view, swapchain.extent)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            slots,
            frames_rendered: 0,
        })
    }

    /// Buffering depth of the ring.
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Total render calls so far.
    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    /// Index of the active slot.
    pub fn index(&self) -> usize {
        ring_index(self.frames_rendered, self.slots.len())
    }

    /// The active slot.
    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.index()]
    }

    /// The active slot, mutably.
    pub fn current_mut(&mut self) -> &mut FrameSlot {
        let index = self.index();
        &mut self.slots[index]
    }

    /// Advance to the next slot. Called unconditionally after submission.
    pub fn advance(&mut self) {
        self.frames_rendered += 1;
    }

    /// Rebuild every slot's framebuffer after swapchain recreation.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn rebuild_framebuffers(
        &mut self,
        device: &ash::Device,
        render_pass: vk::RenderPass,
        swapchain: &Swapchain,
        depth_view: vk::ImageView,
    ) -> Result<()> {
        for (slot, &color_view) in self.slots.iter_mut().zip(&swapchain.image_views) {
            slot.rebuild_framebuffer(device, render_pass, color_view, depth_view, swapchain.extent)?;
        }
        Ok(())
    }

    /// Destroy all slots.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for slot in &mut self.slots {
            slot.destroy(device);
        }
        self.slots.clear();
    }
}

/// Active slot index for a given render-call count and buffering depth.
fn ring_index(frames_rendered: u64, depth: usize) -> usize {
    (frames_rendered % depth as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_cycles_modulo_depth() {
        for depth in [1_usize, 2, 3] {
            for k in 0..10_u64 {
                assert_eq!(ring_index(k, depth), (k % depth as u64) as usize);
            }
        }
    }

    #[test]
    fn slot_reuse_period_equals_depth() {
        let depth = 2;
        // A slot used at call k is reused exactly at call k + depth
        for k in 0..8_u64 {
            assert_eq!(ring_index(k, depth), ring_index(k + depth as u64, depth));
            assert_ne!(ring_index(k, depth), ring_index(k + 1, depth));
        }
    }
}
