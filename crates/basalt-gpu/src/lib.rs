//! Vulkan substrate for the Basalt engine.
//!
//! This crate provides:
//! - Declarative physical-device selection and logical-device creation
//! - Memory-typed, alignment-aware buffer and image allocation
//! - Descriptor sets grouped by update frequency
//! - Graphics/compute pipeline and render-pass construction
//! - Swapchain and per-frame synchronization primitives

pub mod command;
pub mod config;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod requirements;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use config::GpuConfig;
pub use context::{find_graphics_queue_family, find_memory_type, GpuContext, GpuContextBuilder};
pub use descriptors::{DescriptorManager, UsageFrequency, WriteTemplate};
pub use error::{GpuError, Result};
pub use memory::{
    aligned_size, texture_format_for_channels, GpuBuffer, GpuImage, MemoryFactory,
};
pub use pipeline::{
    create_compute_pipeline, create_pipeline_layout, create_render_pass, create_shader_module,
    standard_forward_dependencies, AttachmentConfig, GraphicsPipelineBuilder, Pipeline,
};
pub use requirements::{features_superset, select_physical_device, DeviceRequirements};
pub use surface::SurfaceContext;
pub use swapchain::Swapchain;
pub use sync::{create_fence, create_semaphore, FrameSync};
