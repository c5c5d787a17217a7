//! Frame orchestration for the Basalt engine.
//!
//! This crate provides:
//! - The frame ring: per-slot command pools, framebuffers, and sync objects
//! - The three per-frame sub-passes: opaque geometry, terrain density
//!   compute, and the text overlay
//! - The orchestrator driving acquire → record → submit → present

pub mod frame;
pub mod geometry;
pub mod mesh;
pub mod orchestrator;
pub mod overlay;
pub mod terrain;
pub mod texture;

pub use frame::{FrameRing, FrameSlot};
pub use geometry::{FrameData, GeometryPass, GeometryShaders, TexturePixels};
pub use mesh::{Mesh, Vertex};
pub use orchestrator::{
    EngineAssets, FrameInput, FrameOrchestrator, FrameStats, MeshData, DEPTH_FORMAT,
};
pub use overlay::{FontAtlas, Glyph, OverlayPass, OverlayShaders, TextVertex, MAX_OVERLAY_CHARS};
pub use terrain::{
    DensityMesher, TerrainPass, TerrainShaders, TerrainVertex, DENSITY_VALUE_COUNT,
};
pub use texture::Texture;
