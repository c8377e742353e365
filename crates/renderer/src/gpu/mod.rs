//! Graphics seam between the composition tree and a concrete GPU API.
//!
//! Everything above this module talks to a [`GpuBackend`] through plain
//! handle ids, so the cache and node code never hold API objects:
//! - `recording` keeps handles in CPU memory and logs every clear and draw;
//!   it is what the tests and headless tooling run against.
//! - `context` owns wgpu instance/adapter/device wiring for both headless
//!   and surface-presenting setups.
//! - `pipeline` builds one render pipeline per [`ProgramKind`].
//! - `backend` glues those together as [`WgpuBackend`].
//!
//! Texture coordinates follow GL conventions: `v = 0` addresses the first
//! row of an uploaded frame and the bottom row of anything rendered into a
//! framebuffer. Viewport rectangles use a top-left origin.
use decoder::DecodedFrame;

use crate::types::Rect;

mod recording;

#[cfg(feature = "wgpu")]
mod backend;
#[cfg(feature = "wgpu")]
mod context;
#[cfg(feature = "wgpu")]
mod pipeline;

pub use recording::{GpuCommand, RecordingBackend, RecordingProbe};

#[cfg(feature = "wgpu")]
pub use backend::WgpuBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferId(pub u32);

impl FramebufferId {
    /// The presentation surface.
    pub const DEFAULT: FramebufferId = FramebufferId(0);

    pub fn is_default(&self) -> bool {
        *self == Self::DEFAULT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

/// The four quad shaders: plain or decoder-backed colour source, each with
/// or without a sampled alpha plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    Color,
    ColorExternal,
    ColorAlpha,
    ColorAlphaExternal,
}

impl ProgramKind {
    pub const ALL: [ProgramKind; 4] = [
        ProgramKind::Color,
        ProgramKind::ColorExternal,
        ProgramKind::ColorAlpha,
        ProgramKind::ColorAlphaExternal,
    ];

    pub fn select(external: bool, alpha: bool) -> Self {
        match (external, alpha) {
            (false, false) => Self::Color,
            (true, false) => Self::ColorExternal,
            (false, true) => Self::ColorAlpha,
            (true, true) => Self::ColorAlphaExternal,
        }
    }

    pub fn is_external(self) -> bool {
        matches!(self, Self::ColorExternal | Self::ColorAlphaExternal)
    }

    pub fn has_alpha(self) -> bool {
        matches!(self, Self::ColorAlpha | Self::ColorAlphaExternal)
    }

    /// Programs are shared by every node through this cache key.
    pub fn cache_key(self) -> &'static str {
        match self {
            Self::Color => "program:color",
            Self::ColorExternal => "program:color-external",
            Self::ColorAlpha => "program:color-alpha",
            Self::ColorAlphaExternal => "program:color-alpha-external",
        }
    }
}

/// One vertex of a textured quad: clip-space position and texture coordinate.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "wgpu", derive(bytemuck::Pod, bytemuck::Zeroable))]
pub struct QuadVertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
}

pub const QUAD_VERTEX_COUNT: usize = 6;

pub type QuadVertices = [QuadVertex; QUAD_VERTEX_COUNT];

/// Everything a backend needs to draw one quad.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadDraw {
    pub framebuffer: FramebufferId,
    /// Size of the framebuffer being drawn into.
    pub target_size: (u32, u32),
    pub viewport: Rect,
    pub program: ProgramId,
    pub vertices: BufferId,
    pub texture: TextureId,
    pub alpha: Option<TextureId>,
    /// Column-major transform applied to the quad's texture coordinates.
    pub texture_matrix: [f32; 16],
}

#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("graphics context lost")]
    ContextLost,
    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u32 },
    #[error("invalid texture size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
    #[error("no graphics backend is installed")]
    NoBackend,
    #[error("backend error: {0}")]
    Backend(String),
}

/// Native graphics operations used by the resource cache and the
/// composition tree. Only ever called on the cache's GPU thread.
pub trait GpuBackend: Send {
    /// Allocates an RGBA colour texture usable as a render target.
    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureId, GpuError>;
    /// Allocates a texture that decoder output is uploaded into; its size
    /// follows whatever frame arrives.
    fn create_external_texture(&mut self) -> Result<TextureId, GpuError>;
    fn delete_texture(&mut self, texture: TextureId);

    fn create_framebuffer(&mut self, texture: TextureId) -> Result<FramebufferId, GpuError>;
    fn delete_framebuffer(&mut self, framebuffer: FramebufferId);

    fn create_program(&mut self, kind: ProgramKind) -> Result<ProgramId, GpuError>;
    fn delete_program(&mut self, program: ProgramId);

    fn create_vertex_buffer(&mut self) -> Result<BufferId, GpuError>;
    fn update_vertex_buffer(
        &mut self,
        buffer: BufferId,
        vertices: &QuadVertices,
    ) -> Result<(), GpuError>;
    fn delete_vertex_buffer(&mut self, buffer: BufferId);

    fn upload_frame(&mut self, texture: TextureId, frame: &DecodedFrame) -> Result<(), GpuError>;

    fn clear(&mut self, framebuffer: FramebufferId, color: [f32; 4]) -> Result<(), GpuError>;
    fn draw_quad(&mut self, draw: &QuadDraw) -> Result<(), GpuError>;

    fn begin_frame(&mut self) -> Result<(), GpuError>;
    /// Submits the frame; reports [`GpuError::ContextLost`] when the
    /// context went away underneath it.
    fn end_frame(&mut self) -> Result<(), GpuError>;

    fn surface_size(&self) -> (u32, u32);
    fn resize_surface(&mut self, width: u32, height: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_selection_covers_every_combination() {
        assert_eq!(ProgramKind::select(false, false), ProgramKind::Color);
        assert_eq!(ProgramKind::select(true, false), ProgramKind::ColorExternal);
        assert_eq!(ProgramKind::select(false, true), ProgramKind::ColorAlpha);
        assert_eq!(
            ProgramKind::select(true, true),
            ProgramKind::ColorAlphaExternal
        );
        for kind in ProgramKind::ALL {
            assert_eq!(ProgramKind::select(kind.is_external(), kind.has_alpha()), kind);
        }
    }

    #[test]
    fn program_cache_keys_are_distinct() {
        let mut keys: Vec<_> = ProgramKind::ALL.iter().map(|kind| kind.cache_key()).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), 4);
    }
}
