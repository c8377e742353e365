//! Composition renderer for HEIF/MIAF images and image sequences.
//!
//! The crate turns the derivation graph of a container into a tree of
//! textured quads and draws it on a GPU thread. The overall flow is:
//!
//! ```text
//!   application ── RenderSession ──▶ render thread
//!                                       │ Compositor::draw_frame
//!                                       ▼
//!   ContainerModel ─▶ CompositionNode tree ─▶ ResourceCache ─▶ GpuBackend
//!                         │ Coded leaves
//!                         ▼
//!                  decoder::Decoder ─▶ OutputSurface ─▶ frame signal
//! ```
//!
//! `ResourceCache` owns every GPU-side object by name and rebuilds them
//! when the context is recreated. `CompositionNode` mirrors one image item
//! (coded, grid, overlay or identity) and draws its children into an
//! off-screen target before drawing itself. `GpuBackend` is the only place
//! that talks to a graphics API: `RecordingBackend` keeps everything on the
//! CPU, `WgpuBackend` (feature `wgpu`) renders for real.

#[cfg(feature = "wgpu")]
mod compile;
pub mod compositor;
pub mod gpu;
pub mod node;
pub mod playback;
pub mod resources;
pub mod session;
#[cfg(test)]
mod testing;
pub mod transform;
pub mod types;

use decoder::DecodeError;
use imagegraph::{ModelError, Source};

pub use compositor::{Compositor, DisplayRequests, FrameOutcome};
#[cfg(feature = "wgpu")]
pub use gpu::WgpuBackend;
pub use gpu::{GpuBackend, GpuError, RecordingBackend, RecordingProbe};
pub use node::{CompositionNode, NodeContext};
pub use playback::{FrameSchedule, FrameSlot, SequencePlayer};
pub use resources::{ContextRelease, ResourceCache};
pub use session::{BackendFactory, RenderSession, SessionCommand};
pub use transform::Orientation;
pub use types::{DrawTarget, Rect, Zoom};

/// Failures while building or driving a composition tree.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error("derivation below {0} is too deep")]
    TooDeep(Source),
    #[error("{0} is not a track")]
    NotATrack(Source),
    #[error("nothing is displayed")]
    NoContent,
}
