//! The render-loop driver.
//!
//! Per render call: wait on the active slot's fence, acquire a swapchain
//! image, reset the slot's command pool, record the three sub-passes
//! (geometry, terrain density, overlay), submit once with the correct
//! semaphore dependencies, present, and advance the ring.
//!
//! Several full-device idle waits are deliberate: the per-frame idle before
//! recording covers the descriptor sets shared across slots, and the
//! post-present idle covers the synchronous density readback. Both serialize
//! the CPU against the GPU; replacing them with per-resource fences is legal
//! as long as no shared mapped buffer is rewritten while the GPU still reads
//! it.

use crate::frame::FrameRing;
use crate::geometry::{GeometryPass, GeometryShaders, TexturePixels};
use crate::mesh::{Mesh, Vertex};
use crate::overlay::{FontAtlas, OverlayPass, OverlayShaders};
use crate::terrain::{DensityMesher, TerrainPass, TerrainShaders};
use ash::vk;
use basalt_gpu::command::{
    begin_command_buffer, begin_secondary_command_buffer, end_command_buffer, execute_single_time,
    submit_command_buffers, CommandPool,
};
use basalt_gpu::error::{GpuError, Result};
use basalt_gpu::memory::{image_layout_barrier, GpuImage, MemoryFactory};
use basalt_gpu::pipeline::{
    create_render_pass, standard_forward_dependencies, AttachmentConfig,
};
use basalt_gpu::surface::SurfaceContext;
use basalt_gpu::swapchain::Swapchain;
use basalt_gpu::GpuContext;
use glam::{Mat4, Vec3};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::time::{Duration, Instant};

/// Depth attachment format used by both render passes.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D16_UNORM;

/// Bound on the per-frame fence wait. Expiry means the GPU hung; fatal here.
const FENCE_TIMEOUT_NS: u64 = 1_000_000_000;
/// Bound on swapchain image acquisition.
const ACQUIRE_TIMEOUT_NS: u64 = 100_000_000;

const CLEAR_COLOR: [f32; 4] = [48.0 / 255.0, 10.0 / 255.0, 36.0 / 255.0, 1.0];

/// Vertex and index arrays handed over by the external model loader.
pub struct MeshData<'a> {
    pub vertices: &'a [Vertex],
    pub indices: &'a [u32],
}

/// Everything the orchestrator consumes from the excluded loaders at startup.
pub struct EngineAssets<'a> {
    pub geometry_shaders: GeometryShaders<'a>,
    pub terrain_shaders: TerrainShaders<'a>,
    pub overlay_shaders: OverlayShaders<'a>,
    pub material_pixels: TexturePixels<'a>,
    pub font: Box<dyn FontAtlas>,
    pub mesher: Box<dyn DensityMesher>,
    pub models: Vec<MeshData<'a>>,
}

/// Per-frame scene state supplied by the caller; transform and camera
/// bookkeeping stays outside this core.
pub struct FrameInput<'a> {
    pub view_proj: Mat4,
    pub camera_position: Vec3,
    pub directional_light: Vec3,
    pub object_transforms: &'a [Mat4],
    pub overlay_text: &'a str,
}

/// What one render call reports back.
pub struct FrameStats {
    /// The swapchain is suboptimal or out of date; the caller decides whether
    /// to call [`FrameOrchestrator::resize`].
    pub suboptimal: bool,
    /// CPU time spent inside the render call.
    pub cpu_time: Duration,
}

/// Owns the whole per-frame pipeline and drives it.
pub struct FrameOrchestrator {
    surface: SurfaceContext,
    swapchain: Swapchain,
    render_pass: vk::RenderPass,
    depth_buffer: GpuImage,
    factory: MemoryFactory,
    upload_pool: CommandPool,
    ring: FrameRing,
    geometry: GeometryPass,
    terrain: TerrainPass,
    overlay: OverlayPass,
    mesher: Box<dyn DensityMesher>,
    meshes: Vec<Mesh>,
    // Dropped last: its Drop waits for idle and destroys the device
    gpu: GpuContext,
}

impl FrameOrchestrator {
    /// Build the full frame pipeline against an externally owned window.
    pub fn new<W>(gpu: GpuContext, window: &W, assets: EngineAssets<'_>) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let buffering_depth = gpu.config().buffering_depth;

        let surface = unsafe { SurfaceContext::from_window(&gpu, window)? };
        let swapchain = unsafe { surface.create_swapchain(&gpu, buffering_depth, None)? };
        let extent = swapchain.extent;

        let factory = gpu.memory_factory();
        let upload_pool = unsafe { CommandPool::new(gpu.device(), gpu.graphics_queue_family())? };

        unsafe {
            transition_images_to_present(&gpu, &upload_pool, &swapchain)?;
        }

        let depth_buffer = factory.create_depth_stencil(extent.width, extent.height, DEPTH_FORMAT)?;

        let render_pass = unsafe {
            create_render_pass(
                gpu.device(),
                AttachmentConfig {
                    format: swapchain.format,
                    load_op: vk::AttachmentLoadOp::CLEAR,
                    store_op: vk::AttachmentStoreOp::STORE,
                    initial_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                    final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                },
                AttachmentConfig {
                    format: DEPTH_FORMAT,
                    load_op: vk::AttachmentLoadOp::CLEAR,
                    store_op: vk::AttachmentStoreOp::STORE,
                    initial_layout: vk::ImageLayout::UNDEFINED,
                    final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                },
                &standard_forward_dependencies(),
            )?
        };

        let ring = unsafe { FrameRing::new(&gpu, render_pass, &swapchain, depth_buffer.view)? };

        tracing::info!("Loading scene");
        let meshes = assets
            .models
            .iter()
            .map(|model| Mesh::upload(&factory, model.vertices, model.indices))
            .collect::<Result<Vec<_>>>()?;

        let geometry = GeometryPass::new(
            &gpu,
            &factory,
            &upload_pool,
            &assets.geometry_shaders,
            &assets.material_pixels,
            meshes.len() as u32,
            render_pass,
            extent,
        )?;

        let terrain = TerrainPass::new(&gpu, &factory, &assets.terrain_shaders, render_pass, extent)?;

        let overlay = OverlayPass::new(
            &gpu,
            &factory,
            &upload_pool,
            assets.font,
            &assets.overlay_shaders,
            DEPTH_FORMAT,
            &swapchain,
            depth_buffer.view,
        )?;

        Ok(Self {
            surface,
            swapchain,
            render_pass,
            depth_buffer,
            factory,
            upload_pool,
            ring,
            geometry,
            terrain,
            overlay,
            mesher: assets.mesher,
            meshes,
            gpu,
        })
    }

    /// The active configuration.
    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    /// Frames rendered so far.
    pub fn frames_rendered(&self) -> u64 {
        self.ring.frames_rendered()
    }

    /// Render one frame.
    ///
    /// Failures are surfaced, never retried: a fence or acquire timeout is
    /// fatal for this layer, and an out-of-date swapchain is reported through
    /// [`FrameStats::suboptimal`] for the caller to act on via
    /// [`Self::resize`].
    pub fn render(&mut self, input: &FrameInput<'_>) -> Result<FrameStats> {
        let cpu_start = Instant::now();
        let device = self.gpu.device();

        // Wait for this slot's previous work to retire, then take the fence
        // back to unsignaled for this frame's submission
        unsafe {
            let slot = self.ring.current();
            slot.sync.wait(device, FENCE_TIMEOUT_NS)?;
            slot.sync.reset(device)?;
        }

        let (image_index, acquire_suboptimal) = unsafe {
            let slot = self.ring.current();
            self.swapchain.acquire_next_image(
                &self.surface.swapchain_loader,
                slot.sync.image_available,
                ACQUIRE_TIMEOUT_NS,
            )?
        };

        // Descriptor sets and mapped buffers are shared across slots, so the
        // whole device must be quiescent before they are rewritten
        self.gpu.wait_idle()?;

        unsafe {
            self.ring.current().command_pool.reset(device)?;
        }

        // Refresh GPU-visible data before any set is bound
        self.geometry
            .upload_frame_data(device, input.directional_light, input.camera_position)?;
        self.geometry
            .upload_object_data(device, input.view_proj, input.object_transforms)?;
        self.terrain.update_camera(device, input.view_proj)?;
        self.overlay.set_text(input.overlay_text, self.swapchain.extent)?;

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.swapchain.extent,
        };

        let present_suboptimal;
        unsafe {
            let slot = self.ring.current();

            self.terrain.record_density(device, slot.density_cb)?;

            begin_secondary_command_buffer(
                device,
                slot.geometry_cb,
                self.render_pass,
                slot.framebuffer,
            )?;
            self.geometry.record(device, slot.geometry_cb, &self.meshes)?;
            end_command_buffer(device, slot.geometry_cb)?;

            let terrain_ready = self.terrain.ready();
            if terrain_ready {
                begin_secondary_command_buffer(
                    device,
                    slot.terrain_cb,
                    self.render_pass,
                    slot.framebuffer,
                )?;
                self.terrain.record_draw(device, slot.terrain_cb);
                end_command_buffer(device, slot.terrain_cb)?;
            }

            begin_command_buffer(
                device,
                slot.main_cb,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )?;

            let clear_values = [
                vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: CLEAR_COLOR,
                    },
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
                .framebuffer(slot.framebuffer)
                .render_area(render_area)
                .clear_values(&clear_values);

            device.cmd_begin_render_pass(
                slot.main_cb,
                &pass_begin,
                vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
            );
            device.cmd_execute_commands(slot.main_cb, &[slot.geometry_cb]);
            if terrain_ready {
                device.cmd_execute_commands(slot.main_cb, &[slot.terrain_cb]);
            }
            device.cmd_end_render_pass(slot.main_cb);
            end_command_buffer(device, slot.main_cb)?;

            self.overlay
                .record(device, slot.overlay_cb, image_index, render_area)?;

            // One submission: wait for the acquired image at color output,
            // signal presentability and the slot fence together
            submit_command_buffers(
                device,
                self.gpu.graphics_queue(),
                &[slot.density_cb, slot.main_cb, slot.overlay_cb],
                &[slot.sync.image_available],
                &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
                &[slot.sync.render_finished],
                slot.sync.in_flight,
            )?;

            present_suboptimal = self.swapchain.present(
                &self.surface.swapchain_loader,
                self.gpu.graphics_queue(),
                image_index,
                &[slot.sync.render_finished],
            )?;
        }

        // Synchronous density readback: drain the queue, then hand the field
        // to the mesher and swap the terrain vertex buffer
        unsafe {
            device
                .queue_wait_idle(self.gpu.graphics_queue())
                .map_err(GpuError::from)?;
        }
        let density = self.terrain.read_density()?;
        self.terrain
            .rebuild_mesh(&self.factory, self.mesher.as_ref(), &density)?;

        self.ring.advance();

        Ok(FrameStats {
            suboptimal: acquire_suboptimal || present_suboptimal,
            cpu_time: cpu_start.elapsed(),
        })
    }

    /// Recreate the swapchain and everything sized by it.
    ///
    /// Never called implicitly; a suboptimal or out-of-date report from
    /// [`Self::render`] leaves the decision to the caller.
    pub fn resize(&mut self) -> Result<()> {
        self.gpu.wait_idle()?;

        let buffering_depth = self.gpu.config().buffering_depth;
        self.swapchain = unsafe {
            self.surface
                .recreate_swapchain(&self.gpu, &mut self.swapchain, buffering_depth)?
        };
        let extent = self.swapchain.extent;

        unsafe {
            transition_images_to_present(&self.gpu, &self.upload_pool, &self.swapchain)?;
        }

        let device = self.gpu.device();
        unsafe {
            self.depth_buffer.destroy(device);
        }
        self.depth_buffer = self
            .factory
            .create_depth_stencil(extent.width, extent.height, DEPTH_FORMAT)?;

        unsafe {
            self.ring.rebuild_framebuffers(
                device,
                self.render_pass,
                &self.swapchain,
                self.depth_buffer.view,
            )?;
            self.geometry
                .rebuild_pipeline(device, self.render_pass, extent)?;
            self.terrain
                .rebuild_pipeline(device, self.render_pass, extent)?;
            self.overlay
                .rebuild(device, &self.swapchain, self.depth_buffer.view)?;
        }

        tracing::info!("Recreated swapchain at {}x{}", extent.width, extent.height);
        Ok(())
    }
}

impl Drop for FrameOrchestrator {
    fn drop(&mut self) {
        // All GPU work implicitly outlives the CPU calls that submitted it;
        // nothing may be destroyed before the device is fully idle
        let _ = self.gpu.wait_idle();

        let device = self.gpu.device_arc();
        unsafe {
            for mesh in &mut self.meshes {
                mesh.destroy(&device);
            }
            self.geometry.destroy(&device);
            self.terrain.destroy(&device);
            self.overlay.destroy(&device);
            self.ring.destroy(&device);
            self.depth_buffer.destroy(&device);
            device.destroy_render_pass(self.render_pass, None);
            self.swapchain.destroy(&device, &self.surface.swapchain_loader);
            self.upload_pool.destroy(&device);
            self.surface.destroy();
        }
    }
}

/// Transition freshly created swapchain images to the present layout the
/// main render pass expects as its initial layout.
///
/// # Safety
/// All handles must be valid.
unsafe fn transition_images_to_present(
    gpu: &GpuContext,
    pool: &CommandPool,
    swapchain: &Swapchain,
) -> Result<()> {
    execute_single_time(gpu.device(), pool, gpu.graphics_queue(), |cmd| {
        let barriers: Vec<_> = swapchain
            .images
            .iter()
            .map(|&image| {
                image_layout_barrier(
                    vk::AccessFlags::NONE,
                    vk::AccessFlags::MEMORY_READ,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                    image,
                )
            })
            .collect();

        gpu.device().cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::BY_REGION,
            &[],
            &[],
            &barriers,
        );
    })
}
