//! Frame driver for one display surface.
//!
//! The [`Compositor`] lives on the GPU thread. It keeps the composition tree
//! of the displayed source in a side table keyed by [`Source`], swaps trees
//! when the application asks for another source, and draws the root
//! letterboxed onto the display once every texture in it holds a frame.
//! Requests arrive through [`DisplayRequests`], which any thread may hold.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use imagegraph::{ContainerModel, ImageId, SampleId, Source, TrackId};

use crate::gpu::{FramebufferId, GpuBackend, GpuError};
use crate::node::{letterbox, CompositionNode, NodeContext};
use crate::resources::{lock, FrameSignal, ResourceCache, TextureClient};
use crate::types::{DrawTarget, Zoom};
use crate::ComposeError;

#[derive(Debug, Default)]
struct RequestState {
    pending: Option<Source>,
    busy: bool,
}

/// Source selection shared between the application and the GPU thread. A
/// request is accepted only when the previous one has been drawn or has
/// failed.
#[derive(Debug, Clone, Default)]
pub struct DisplayRequests {
    state: Arc<Mutex<RequestState>>,
}

impl DisplayRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_image(&self, image: ImageId) -> bool {
        self.request(Source::Image(image))
    }

    pub fn set_track(&self, track: TrackId) -> bool {
        self.request(Source::Track(track))
    }

    /// Returns `false` without changing anything while busy.
    pub fn request(&self, source: Source) -> bool {
        let mut state = lock(&self.state);
        if state.busy {
            tracing::debug!(requested = %source, "display busy; request rejected");
            return false;
        }
        state.busy = true;
        state.pending = Some(source);
        true
    }

    pub fn is_busy(&self) -> bool {
        lock(&self.state).busy
    }

    pub fn pending(&self) -> Option<Source> {
        lock(&self.state).pending
    }

    fn finish(&self) {
        lock(&self.state).busy = false;
    }

    fn fail(&self, source: Source) {
        let mut state = lock(&self.state);
        if state.pending == Some(source) {
            state.pending = None;
        }
        state.busy = false;
    }
}

/// What one [`Compositor::draw_frame`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The root was drawn to the display.
    Drawn,
    /// Some texture is still waiting for its first frame; draw again later.
    NotReady,
    /// Nothing to show.
    Idle,
}

pub struct Compositor {
    ctx: NodeContext,
    requests: DisplayRequests,
    nodes: HashMap<Source, CompositionNode>,
    current: Option<Source>,
    clear_color: [f32; 4],
}

impl Compositor {
    pub fn new(
        cache: Arc<ResourceCache>,
        model: Arc<dyn ContainerModel>,
        requests: DisplayRequests,
        frame_signal: Option<FrameSignal>,
    ) -> Self {
        Self {
            ctx: NodeContext {
                cache,
                model,
                frame_signal,
            },
            requests,
            nodes: HashMap::new(),
            current: None,
            clear_color: [0.0; 4],
        }
    }

    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    pub fn requests(&self) -> &DisplayRequests {
        &self.requests
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.ctx.cache
    }

    pub fn current(&self) -> Option<Source> {
        self.current
    }

    pub fn root(&self) -> Option<&CompositionNode> {
        self.current.and_then(|source| self.nodes.get(&source))
    }

    fn root_mut(&mut self) -> Option<&mut CompositionNode> {
        let source = self.current?;
        self.nodes.get_mut(&source)
    }

    /// Zooms the displayed root. Ignored when nothing is displayed.
    pub fn zoom(&mut self, zoom: Zoom) {
        if let Some(root) = self.root_mut() {
            root.set_zoom(zoom);
        }
    }

    /// Decode side of the displayed track's texture.
    pub fn track_client(&self) -> Option<Arc<TextureClient>> {
        self.root()
            .filter(|root| root.source().is_track())
            .and_then(CompositionNode::texture_client)
    }

    /// Queues `sample` of the displayed track for decoding.
    pub fn show_frame(&self, sample: SampleId) -> Result<(), ComposeError> {
        let root = self.root().ok_or(ComposeError::NoContent)?;
        let client = self
            .track_client()
            .ok_or(ComposeError::NotATrack(root.source()))?;
        client.decode_frame(sample)?;
        Ok(())
    }

    /// Runs one frame: clear, switch content if requested, reserve pending
    /// resources, update textures and draw the root if it is ready.
    pub fn draw_frame(&mut self) -> Result<FrameOutcome, GpuError> {
        self.with_gpu(|gpu| gpu.begin_frame())?;
        let outcome = self.compose();
        let submitted = self.with_gpu(|gpu| gpu.end_frame());
        let outcome = outcome?;
        submitted?;
        Ok(outcome)
    }

    fn compose(&mut self) -> Result<FrameOutcome, GpuError> {
        let clear_color = self.clear_color;
        self.with_gpu(|gpu| gpu.clear(FramebufferId::DEFAULT, clear_color))?;
        self.switch_content();
        self.ctx.cache.predraw();

        let Some(root) = self.root() else {
            return Ok(FrameOutcome::Idle);
        };
        self.with_gpu(|gpu| root.pre_draw(gpu))?;
        if !root.ready_to_draw() {
            return Ok(FrameOutcome::NotReady);
        }
        let render_size = root.render_size();
        self.with_gpu(|gpu| {
            let (width, height) = gpu.surface_size();
            let rect = letterbox(render_size, (width, height));
            root.draw(gpu, DrawTarget::display(width, height), rect)
        })?;
        self.requests.finish();
        Ok(FrameOutcome::Drawn)
    }

    fn switch_content(&mut self) {
        let Some(wanted) = self.requests.pending() else {
            return;
        };
        if self.current == Some(wanted) {
            return;
        }
        // Built before the old tree goes so shared textures survive the swap.
        let node = match self.nodes.remove(&wanted) {
            Some(node) => node,
            None => match CompositionNode::build(&self.ctx, wanted) {
                Ok(node) => node,
                Err(err) => {
                    tracing::warn!(source = %wanted, error = %err, "failed to build composition tree");
                    self.requests.fail(wanted);
                    return;
                }
            },
        };
        if let Some(previous) = self.current.take() {
            if let Some(mut old) = self.nodes.remove(&previous) {
                old.dispose(&self.ctx.cache);
            }
        }
        tracing::debug!(source = %wanted, "switched displayed content");
        self.nodes.insert(wanted, node);
        self.current = Some(wanted);
    }

    /// Disposes every tree; the cache keeps only what others still hold.
    pub fn dispose(&mut self) {
        for (_, mut node) in self.nodes.drain() {
            node.dispose(&self.ctx.cache);
        }
        self.current = None;
    }

    fn with_gpu<R>(
        &self,
        f: impl FnOnce(&mut dyn GpuBackend) -> Result<R, GpuError>,
    ) -> Result<R, GpuError> {
        self.ctx.cache.with_gpu(f).and_then(|result| result)
    }
}

impl std::fmt::Debug for Compositor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compositor")
            .field("current", &self.current)
            .field("nodes", &self.nodes.len())
            .field("requests", &self.requests)
            .finish()
    }
}
