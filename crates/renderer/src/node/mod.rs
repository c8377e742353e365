//! Composition tree mirroring an image's derivation graph.
//!
//! Every node owns a quad (vertex buffer plus program) that draws its
//! content into whatever target its parent hands it. Coded nodes sample a
//! decoder-backed texture directly. Grid, overlay and identity nodes first
//! draw their children into an off-screen target of their own and then
//! sample that. An image with an alpha auxiliary draws the auxiliary into a
//! second target and uses it as the fourth channel.
//!
//! All GPU resources go through the [`ResourceCache`]; a node only keeps
//! the shared handles and must be [disposed](CompositionNode::dispose) to
//! drop its references.
mod layout;

pub use layout::{background_color, grid_cells, letterbox, overlay_rect};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use decoder::DecodedFrame;
use imagegraph::{Auxiliary, ContainerModel, ImageId, ImageKind, ModelError, Size, Source};

use crate::gpu::{
    GpuBackend, GpuError, ProgramKind, QuadDraw, QuadVertex, QuadVertices, TextureId,
    QUAD_VERTEX_COUNT,
};
use crate::resources::{
    lock, FrameSignal, RenderTarget, ResourceCache, ShaderProgram, Shared, TextureClient,
    TextureHolder, VertexBuffer,
};
use crate::transform::{self, Orientation};
use crate::types::{DrawTarget, Rect, Zoom};
use crate::ComposeError;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Derivations nested deeper than this are treated as cyclic.
const MAX_DEPTH: usize = 32;

/// Auxiliary types carrying an alpha plane.
pub const ALPHA_AUX_TYPES: [&str; 3] = [
    "urn:mpeg:hevc:2015:auxid:1",
    "urn:mpeg:avc:2015:auxid:1",
    "urn:mpeg:mpegB:cicp:systems:auxiliary:alpha",
];

/// Auxiliary types carrying a depth map; used as alpha when no alpha plane
/// is declared.
pub const DEPTH_AUX_TYPES: [&str; 2] = [
    "urn:mpeg:hevc:2015:auxid:2",
    "urn:mpeg:mpegB:cicp:systems:auxiliary:depth",
];

/// The auxiliary image to composite as alpha: the last alpha-typed one,
/// else the last depth-typed one.
pub fn alpha_auxiliary(auxiliaries: &[Auxiliary]) -> Option<ImageId> {
    let last_of = |types: &[&str]| {
        auxiliaries
            .iter()
            .rev()
            .find(|aux| types.contains(&aux.aux_type.as_str()))
            .map(|aux| aux.image)
    };
    last_of(&ALPHA_AUX_TYPES).or_else(|| last_of(&DEPTH_AUX_TYPES))
}

/// What nodes need to build and refresh themselves.
#[derive(Clone)]
pub struct NodeContext {
    pub cache: Arc<ResourceCache>,
    pub model: Arc<dyn ContainerModel>,
    /// Handed to every decoder-backed texture; fired on each new frame.
    pub frame_signal: Option<FrameSignal>,
}

enum NodeKind {
    Coded {
        texture: Shared<TextureHolder>,
        key: String,
    },
    Grid,
    Overlay {
        background: [f32; 4],
    },
    Identity,
}

struct Child {
    node: CompositionNode,
    rect: Rect,
}

struct AlphaPlane {
    image: ImageId,
    node: Box<CompositionNode>,
    target: Shared<RenderTarget>,
}

pub struct CompositionNode {
    id: u64,
    source: Source,
    depth: usize,
    kind: NodeKind,
    size: Size,
    orientation: Orientation,
    zoom: Zoom,
    quad: QuadVertices,
    vertices: Option<Shared<VertexBuffer>>,
    program: Option<(ProgramKind, Shared<ShaderProgram>)>,
    target: Option<Shared<RenderTarget>>,
    alpha: Option<AlphaPlane>,
    children: Vec<Child>,
    disposed: bool,
}

impl CompositionNode {
    /// Builds the subtree for `source` and registers its resources.
    pub fn build(ctx: &NodeContext, source: Source) -> Result<Self, ComposeError> {
        Self::build_at(ctx, source, 0)
    }

    fn build_at(ctx: &NodeContext, source: Source, depth: usize) -> Result<Self, ComposeError> {
        if depth > MAX_DEPTH {
            return Err(ComposeError::TooDeep(source));
        }
        let kind = match source {
            Source::Track(_) => NodeKind::coded(ctx, source),
            Source::Image(image) => match ctx.model.image_kind(image)? {
                ImageKind::Coded => NodeKind::coded(ctx, source),
                ImageKind::Grid => NodeKind::Grid,
                ImageKind::Overlay => NodeKind::Overlay {
                    background: [0.0; 4],
                },
                ImageKind::Identity => NodeKind::Identity,
            },
        };
        let mut node = Self {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            source,
            depth,
            kind,
            size: Size::default(),
            orientation: Orientation::default(),
            zoom: Zoom::NONE,
            quad: [QuadVertex::default(); QUAD_VERTEX_COUNT],
            vertices: None,
            program: None,
            target: None,
            alpha: None,
            children: Vec::new(),
            disposed: false,
        };
        if let Err(err) = node.refresh_content(ctx) {
            node.dispose(&ctx.cache);
            return Err(err);
        }
        tracing::debug!(node = node.id, source = %source, kind = ?node.image_kind(), "built composition node");
        Ok(node)
    }

    /// Re-reads the model: size, transforms, children and alpha plane.
    /// Targets whose size changed are replaced, never resized.
    pub fn refresh_content(&mut self, ctx: &NodeContext) -> Result<(), ComposeError> {
        let model = ctx.model.as_ref();
        self.size = model.source_size(self.source)?;
        self.orientation = Orientation::from_properties(&model.source_transforms(self.source)?);
        self.quad = transform::image_quad(self.size, &self.orientation, self.zoom);

        if self.vertices.is_none() {
            self.vertices = Some(
                ctx.cache
                    .add_resource(self.key("vertices"), VertexBuffer::new()),
            );
        }
        if !self.is_coded() {
            self.refresh_target(&ctx.cache);
        }
        self.refresh_children(ctx)?;
        if let Source::Image(image) = self.source {
            self.refresh_alpha(ctx, image)?;
        }
        self.refresh_program(&ctx.cache);
        Ok(())
    }

    fn refresh_target(&mut self, cache: &ResourceCache) {
        let wanted = (self.size.width, self.size.height);
        if let Some(target) = &self.target {
            if lock(target).size() == wanted {
                return;
            }
        }
        let key = self.key("target");
        if self.target.take().is_some() {
            cache.remove_resource(&key);
        }
        self.target = Some(cache.add_resource(key, RenderTarget::new(wanted.0, wanted.1)));
    }

    /// Builds the new children before dropping the old ones, so cache
    /// entries both sets share stay reserved. On failure the old children
    /// are kept.
    fn refresh_children(&mut self, ctx: &NodeContext) -> Result<(), ComposeError> {
        let mut built = Vec::new();
        if let Err(err) = self.build_children(ctx, &mut built) {
            for mut child in built {
                child.node.dispose(&ctx.cache);
            }
            return Err(err);
        }
        for mut child in std::mem::replace(&mut self.children, built) {
            child.node.dispose(&ctx.cache);
        }
        Ok(())
    }

    fn build_children(
        &mut self,
        ctx: &NodeContext,
        built: &mut Vec<Child>,
    ) -> Result<(), ComposeError> {
        let Source::Image(image) = self.source else {
            return Ok(());
        };
        let depth = self.depth + 1;
        match &mut self.kind {
            NodeKind::Coded { .. } => {}
            NodeKind::Grid => {
                let grid = ctx.model.grid(image)?;
                let expected = grid.columns as usize * grid.rows as usize;
                if grid.cells.len() != expected {
                    return Err(ModelError::Invalid(format!(
                        "{image} has {} cells for a {}x{} grid",
                        grid.cells.len(),
                        grid.columns,
                        grid.rows
                    ))
                    .into());
                }
                let rects = layout::grid_cells(self.size, grid.columns, grid.rows);
                for (cell, rect) in grid.cells.iter().zip(rects) {
                    let node = Self::build_at(ctx, Source::Image(*cell), depth)?;
                    built.push(Child { node, rect });
                }
            }
            NodeKind::Overlay { background } => {
                let overlay = ctx.model.overlay(image)?;
                *background = layout::background_color(overlay.background);
                for layer in &overlay.layers {
                    let node = Self::build_at(ctx, Source::Image(layer.image), depth)?;
                    let rect = layout::overlay_rect(layer, node.size);
                    built.push(Child { node, rect });
                }
            }
            NodeKind::Identity => {
                let source = ctx.model.identity_source(image)?;
                let node = Self::build_at(ctx, Source::Image(source), depth)?;
                let rect = Rect::from_size(self.size.width, self.size.height);
                built.push(Child { node, rect });
            }
        }
        Ok(())
    }

    fn refresh_alpha(&mut self, ctx: &NodeContext, image: ImageId) -> Result<(), ComposeError> {
        let wanted = alpha_auxiliary(&ctx.model.auxiliaries(image)?);
        let key = self.key("alpha");

        if self.alpha.as_ref().map(|plane| plane.image) != wanted {
            let replacement = wanted
                .map(|aux| Self::build_at(ctx, Source::Image(aux), self.depth + 1))
                .transpose()?;
            if let Some(mut plane) = self.alpha.take() {
                plane.node.dispose(&ctx.cache);
                ctx.cache.remove_resource(&key);
                tracing::debug!(node = self.id, alpha = %plane.image, "detached alpha plane");
            }
            if let (Some(aux), Some(node)) = (wanted, replacement) {
                let target = ctx
                    .cache
                    .add_resource(key, RenderTarget::new(node.size.width, node.size.height));
                tracing::debug!(node = self.id, alpha = %aux, "attached alpha plane");
                self.alpha = Some(AlphaPlane {
                    image: aux,
                    node: Box::new(node),
                    target,
                });
            }
            return Ok(());
        }

        if let Some(plane) = &mut self.alpha {
            plane.node.refresh_content(ctx)?;
            let wanted = (plane.node.size.width, plane.node.size.height);
            if lock(&plane.target).size() != wanted {
                ctx.cache.remove_resource(&key);
                plane.target = ctx
                    .cache
                    .add_resource(key, RenderTarget::new(wanted.0, wanted.1));
            }
        }
        Ok(())
    }

    fn refresh_program(&mut self, cache: &ResourceCache) {
        let kind = ProgramKind::select(self.is_coded(), self.alpha.is_some());
        if matches!(&self.program, Some((current, _)) if *current == kind) {
            return;
        }
        if let Some((previous, _)) = self.program.take() {
            cache.remove_resource(previous.cache_key());
        }
        let program = cache
            .get_resource::<ShaderProgram>(kind.cache_key())
            .unwrap_or_else(|| cache.add_resource(kind.cache_key(), ShaderProgram::new(kind)));
        self.program = Some((kind, program));
    }

    /// Sets the viewing window; only meaningful on a root node.
    pub fn set_zoom(&mut self, zoom: Zoom) {
        self.zoom = zoom;
        self.quad = transform::image_quad(self.size, &self.orientation, zoom);
    }

    /// Copies freshly decoded frames into textures, top-down. Only a lost
    /// context is reported; other failures are logged per node.
    pub fn pre_draw(&self, gpu: &mut dyn GpuBackend) -> Result<(), GpuError> {
        if self.disposed {
            return Ok(());
        }
        if let Some(plane) = &self.alpha {
            plane.node.pre_draw(gpu)?;
        }
        for child in &self.children {
            child.node.pre_draw(gpu)?;
        }
        if let NodeKind::Coded { texture, .. } = &self.kind {
            let updated = lock(texture).update_texture(gpu);
            if let Ok(true) = updated {
                tracing::trace!(node = self.id, source = %self.source, "texture updated");
            }
            self.tolerate(updated.map(drop))?;
        }
        Ok(())
    }

    /// True once every texture below this node holds a frame.
    pub fn ready_to_draw(&self) -> bool {
        if self.disposed {
            return false;
        }
        if let Some(plane) = &self.alpha {
            if !plane.node.ready_to_draw() {
                return false;
            }
        }
        if !self.children.iter().all(|child| child.node.ready_to_draw()) {
            return false;
        }
        match &self.kind {
            NodeKind::Coded { texture, .. } => lock(texture).has_frame(),
            _ => true,
        }
    }

    /// Draws the subtree into `rect` of `target`.
    pub fn draw(
        &self,
        gpu: &mut dyn GpuBackend,
        target: DrawTarget,
        rect: Rect,
    ) -> Result<(), GpuError> {
        if self.disposed {
            return Ok(());
        }
        let alpha = match &self.alpha {
            Some(plane) => {
                let (plane_target, texture) = {
                    let target = lock(&plane.target);
                    (target.draw_target(), target.texture())
                };
                let (Some(plane_target), Some(texture)) = (plane_target, texture) else {
                    tracing::trace!(node = self.id, "alpha target not reserved");
                    return Ok(());
                };
                plane
                    .node
                    .draw(gpu, plane_target, plane_target.full_rect())?;
                Some(texture)
            }
            None => None,
        };

        let (texture, matrix) = match &self.kind {
            NodeKind::Coded { texture, .. } => {
                let holder = lock(texture);
                let Some(id) = holder.texture() else {
                    return Ok(());
                };
                (id, holder.transform())
            }
            kind => {
                let Some(own) = &self.target else {
                    return Ok(());
                };
                let (own, texture) = {
                    let own = lock(own);
                    (own.draw_target(), own.texture())
                };
                let (Some(own), Some(texture)) = (own, texture) else {
                    tracing::trace!(node = self.id, "render target not reserved");
                    return Ok(());
                };
                if let NodeKind::Overlay { background } = kind {
                    self.tolerate(gpu.clear(own.framebuffer, *background))?;
                }
                for child in &self.children {
                    child.node.draw(gpu, own, child.rect)?;
                }
                (texture, DecodedFrame::IDENTITY)
            }
        };
        self.draw_quad(gpu, target, rect, texture, alpha, matrix)
    }

    fn draw_quad(
        &self,
        gpu: &mut dyn GpuBackend,
        target: DrawTarget,
        rect: Rect,
        texture: TextureId,
        alpha: Option<TextureId>,
        texture_matrix: [f32; 16],
    ) -> Result<(), GpuError> {
        let (Some((_, program)), Some(vertices)) = (&self.program, &self.vertices) else {
            return Ok(());
        };
        let Some(program) = lock(program).id() else {
            return Ok(());
        };
        let mut vertices = lock(vertices);
        let Some(buffer) = vertices.id() else {
            return Ok(());
        };
        self.tolerate(vertices.update(gpu, &self.quad))?;
        let draw = QuadDraw {
            framebuffer: target.framebuffer,
            target_size: (target.width, target.height),
            viewport: rect,
            program,
            vertices: buffer,
            texture,
            alpha,
            texture_matrix,
        };
        self.tolerate(gpu.draw_quad(&draw))
    }

    /// Passes a lost context up and logs anything else.
    fn tolerate(&self, result: Result<(), GpuError>) -> Result<(), GpuError> {
        match result {
            Err(GpuError::ContextLost) => Err(GpuError::ContextLost),
            Err(err) => {
                tracing::warn!(node = self.id, source = %self.source, error = %err, "draw step failed");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Drops every cache reference held by the subtree. Safe to call twice.
    pub fn dispose(&mut self, cache: &ResourceCache) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if let Some(mut plane) = self.alpha.take() {
            plane.node.dispose(cache);
            cache.remove_resource(&self.key("alpha"));
        }
        for mut child in std::mem::take(&mut self.children) {
            child.node.dispose(cache);
        }
        if self.vertices.take().is_some() {
            cache.remove_resource(&self.key("vertices"));
        }
        if self.target.take().is_some() {
            cache.remove_resource(&self.key("target"));
        }
        if let Some((kind, _)) = self.program.take() {
            cache.remove_resource(kind.cache_key());
        }
        if let NodeKind::Coded { key, .. } = &self.kind {
            cache.remove_resource(key);
        }
        tracing::trace!(node = self.id, source = %self.source, "disposed composition node");
    }

    fn key(&self, suffix: &str) -> String {
        format!("node#{}/{suffix}", self.id)
    }

    fn is_coded(&self) -> bool {
        matches!(self.kind, NodeKind::Coded { .. })
    }

    pub fn source(&self) -> Source {
        self.source
    }

    /// Tracks report [`ImageKind::Coded`].
    pub fn image_kind(&self) -> ImageKind {
        match self.kind {
            NodeKind::Coded { .. } => ImageKind::Coded,
            NodeKind::Grid => ImageKind::Grid,
            NodeKind::Overlay { .. } => ImageKind::Overlay,
            NodeKind::Identity => ImageKind::Identity,
        }
    }

    pub fn size(&self) -> Size {
        self.size
    }

    /// Displayed size after rotation and crop.
    pub fn render_size(&self) -> (f32, f32) {
        self.orientation.render_size(self.size)
    }

    pub fn orientation(&self) -> &Orientation {
        &self.orientation
    }

    pub fn zoom(&self) -> Zoom {
        self.zoom
    }

    pub fn quad(&self) -> &QuadVertices {
        &self.quad
    }

    pub fn children(&self) -> impl Iterator<Item = (&CompositionNode, Rect)> {
        self.children.iter().map(|child| (&child.node, child.rect))
    }

    pub fn child_rects(&self) -> Vec<Rect> {
        self.children.iter().map(|child| child.rect).collect()
    }

    pub fn target_size(&self) -> Option<(u32, u32)> {
        self.target.as_ref().map(|target| lock(target).size())
    }

    pub fn alpha_source(&self) -> Option<ImageId> {
        self.alpha.as_ref().map(|plane| plane.image)
    }

    pub fn alpha_node(&self) -> Option<&CompositionNode> {
        self.alpha.as_ref().map(|plane| plane.node.as_ref())
    }

    pub fn alpha_target_size(&self) -> Option<(u32, u32)> {
        self.alpha.as_ref().map(|plane| lock(&plane.target).size())
    }

    pub fn program_kind(&self) -> Option<ProgramKind> {
        self.program.as_ref().map(|(kind, _)| *kind)
    }

    /// Cache key of the decoder-backed texture, for coded nodes.
    pub fn texture_key(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Coded { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Decode side of a coded node's texture.
    pub fn texture_client(&self) -> Option<Arc<TextureClient>> {
        match &self.kind {
            NodeKind::Coded { texture, .. } => Some(Arc::clone(lock(texture).client())),
            _ => None,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl NodeKind {
    fn coded(ctx: &NodeContext, source: Source) -> Self {
        let key = format!("{source}/texture");
        let texture = ctx
            .cache
            .get_resource::<TextureHolder>(&key)
            .unwrap_or_else(|| {
                ctx.cache.add_resource(
                    key.clone(),
                    TextureHolder::new(
                        Arc::clone(&ctx.model),
                        source,
                        Arc::clone(ctx.cache.decoders()),
                        ctx.frame_signal.clone(),
                    ),
                )
            });
        NodeKind::Coded { texture, key }
    }
}

impl std::fmt::Debug for CompositionNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositionNode")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("kind", &self.image_kind())
            .field("size", &self.size)
            .field("children", &self.children.len())
            .field("alpha", &self.alpha_source())
            .field("disposed", &self.disposed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imagegraph::{MemoryContainer, MirrorAxis, OverlayLayer, TransformProperty};

    use crate::gpu::{GpuCommand, RecordingProbe};
    use crate::testing::{backend, cache, jpeg, jpeg_config};

    const ALPHA: &str = "urn:mpeg:mpegB:cicp:systems:auxiliary:alpha";
    const DEPTH: &str = "urn:mpeg:hevc:2015:auxid:2";

    fn context(builder: &imagegraph::ContainerBuilder) -> (NodeContext, RecordingProbe) {
        let cache = Arc::new(cache());
        let (gpu, probe) = backend();
        cache.reserve_all(gpu);
        let ctx = NodeContext {
            cache,
            model: Arc::new(builder.build().unwrap()),
            frame_signal: None,
        };
        (ctx, probe)
    }

    fn coded(builder: &mut imagegraph::ContainerBuilder, id: u32, width: u32, height: u32) {
        builder.coded(
            ImageId(id),
            Size::new(width, height),
            jpeg_config(),
            jpeg(width, height),
        );
    }

    fn settle(ctx: &NodeContext, node: &CompositionNode) {
        ctx.cache.predraw();
        ctx.cache
            .with_gpu(|gpu| node.pre_draw(gpu))
            .unwrap()
            .unwrap();
    }

    fn framebuffer(target: &Shared<RenderTarget>) -> crate::gpu::FramebufferId {
        lock(target).draw_target().unwrap().framebuffer
    }

    fn two_cell_grid(size: Size) -> imagegraph::ContainerBuilder {
        let mut builder = MemoryContainer::builder();
        coded(&mut builder, 1, 10, 10);
        coded(&mut builder, 2, 10, 10);
        builder.grid(ImageId(10), size, 2, 1, vec![ImageId(1), ImageId(2)]);
        builder
    }

    fn with_alpha(aux: Option<u32>, aux_edge: u32) -> imagegraph::ContainerBuilder {
        let mut builder = MemoryContainer::builder();
        coded(&mut builder, 1, 16, 16);
        coded(&mut builder, 2, aux_edge, aux_edge);
        coded(&mut builder, 3, 4, 4);
        if let Some(aux) = aux {
            builder.auxiliary(ImageId(1), ImageId(aux), ALPHA);
        }
        builder
    }

    fn with_model(ctx: &NodeContext, builder: &imagegraph::ContainerBuilder) -> NodeContext {
        NodeContext {
            model: Arc::new(builder.build().unwrap()),
            ..ctx.clone()
        }
    }

    #[test]
    fn last_declared_alpha_wins_over_depth() {
        let aux = |image, aux_type: &str| Auxiliary {
            image: ImageId(image),
            aux_type: aux_type.to_string(),
        };
        let declared = [aux(5, DEPTH), aux(6, "urn:other"), aux(7, ALPHA), aux(8, ALPHA)];
        assert_eq!(alpha_auxiliary(&declared), Some(ImageId(8)));
        assert_eq!(alpha_auxiliary(&declared[..2]), Some(ImageId(5)));
        assert_eq!(alpha_auxiliary(&declared[1..2]), None);
        assert_eq!(alpha_auxiliary(&[aux(5, DEPTH), aux(9, DEPTH)]), Some(ImageId(9)));
    }

    #[test]
    fn refreshing_a_settled_grid_keeps_its_textures() {
        let mut builder = MemoryContainer::builder();
        coded(&mut builder, 1, 10, 10);
        coded(&mut builder, 2, 10, 10);
        builder.grid(
            ImageId(10),
            Size::new(20, 20),
            2,
            2,
            vec![ImageId(1), ImageId(2), ImageId(2), ImageId(1)],
        );
        let (ctx, probe) = context(&builder);
        let mut node = CompositionNode::build(&ctx, Source::Image(ImageId(10))).unwrap();
        settle(&ctx, &node);
        assert!(node.ready_to_draw());
        let uploads = probe.uploads();
        let textures = probe.live_textures();

        node.refresh_content(&ctx).unwrap();
        assert!(node.ready_to_draw());
        settle(&ctx, &node);
        assert_eq!(probe.uploads(), uploads);
        assert_eq!(probe.live_textures(), textures);
        assert_eq!(ctx.cache.ref_count("image#1/texture"), Some(2));
        assert_eq!(ctx.cache.is_reserved("image#2/texture"), Some(true));

        node.dispose(&ctx.cache);
        assert!(ctx.cache.is_empty(), "left behind: {:?}", ctx.cache.keys());
    }

    #[test]
    fn resized_image_gets_a_new_target() {
        let (ctx, probe) = context(&two_cell_grid(Size::new(20, 10)));
        let mut node = CompositionNode::build(&ctx, Source::Image(ImageId(10))).unwrap();
        let before = framebuffer(node.target.as_ref().unwrap());

        node.refresh_content(&with_model(&ctx, &two_cell_grid(Size::new(40, 20))))
            .unwrap();
        assert_eq!(node.target_size(), Some((40, 20)));
        assert_eq!(
            node.child_rects(),
            vec![Rect::new(0, 0, 20, 20), Rect::new(20, 0, 40, 20)]
        );
        let after = framebuffer(node.target.as_ref().unwrap());
        assert_ne!(after, before);
        assert_eq!(probe.framebuffer_texture(before), None);
        let texture = probe.framebuffer_texture(after).unwrap();
        assert_eq!(probe.texture_size(texture), Some((40, 20)));
        assert_eq!(ctx.cache.ref_count(&node.key("target")), Some(1));

        let unchanged = framebuffer(node.target.as_ref().unwrap());
        node.refresh_content(&with_model(&ctx, &two_cell_grid(Size::new(40, 20))))
            .unwrap();
        assert_eq!(framebuffer(node.target.as_ref().unwrap()), unchanged);
        node.dispose(&ctx.cache);
        assert_eq!(probe.live_handles(), 0);
    }

    #[test]
    fn alpha_plane_follows_the_model() {
        let (ctx, probe) = context(&with_alpha(Some(2), 8));
        let mut node = CompositionNode::build(&ctx, Source::Image(ImageId(1))).unwrap();
        let key = node.key("alpha");
        assert_eq!(node.alpha_target_size(), Some((8, 8)));
        let first = framebuffer(&node.alpha.as_ref().unwrap().target);

        // Same auxiliary, smaller plane.
        node.refresh_content(&with_model(&ctx, &with_alpha(Some(2), 6)))
            .unwrap();
        assert_eq!(node.alpha_source(), Some(ImageId(2)));
        assert_eq!(node.alpha_target_size(), Some((6, 6)));
        assert_eq!(probe.framebuffer_texture(first), None);
        assert_eq!(ctx.cache.ref_count(&key), Some(1));

        // Another auxiliary.
        let resized = framebuffer(&node.alpha.as_ref().unwrap().target);
        node.refresh_content(&with_model(&ctx, &with_alpha(Some(3), 6)))
            .unwrap();
        assert_eq!(node.alpha_source(), Some(ImageId(3)));
        assert_eq!(node.alpha_target_size(), Some((4, 4)));
        assert_eq!(probe.framebuffer_texture(resized), None);
        assert!(!ctx.cache.has_resource("image#2/texture"));
        assert_eq!(ctx.cache.is_reserved("image#3/texture"), Some(true));
        assert_eq!(ctx.cache.ref_count(&key), Some(1));
        assert_eq!(node.program_kind(), Some(ProgramKind::ColorAlphaExternal));

        // No auxiliary at all.
        node.refresh_content(&with_model(&ctx, &with_alpha(None, 6)))
            .unwrap();
        assert_eq!(node.alpha_source(), None);
        assert!(!ctx.cache.has_resource(&key));
        assert!(!ctx.cache.has_resource("image#3/texture"));
        assert!(!ctx.cache.has_resource("program:color-alpha-external"));
        assert_eq!(node.program_kind(), Some(ProgramKind::ColorExternal));

        node.dispose(&ctx.cache);
        assert!(ctx.cache.is_empty(), "left behind: {:?}", ctx.cache.keys());
        assert_eq!(probe.live_handles(), 0);
    }

    #[test]
    fn coded_node_draws_texture_straight_to_target() {
        let mut builder = MemoryContainer::builder();
        coded(&mut builder, 1, 8, 4);
        let (ctx, probe) = context(&builder);

        let node = CompositionNode::build(&ctx, Source::Image(ImageId(1))).unwrap();
        assert_eq!(node.image_kind(), ImageKind::Coded);
        assert_eq!(node.target_size(), None);
        assert_eq!(node.program_kind(), Some(ProgramKind::ColorExternal));
        assert!(!node.ready_to_draw());

        settle(&ctx, &node);
        assert!(node.ready_to_draw());

        let target = DrawTarget::display(64, 64);
        ctx.cache
            .with_gpu(|gpu| node.draw(gpu, target, Rect::new(0, 0, 32, 16)))
            .unwrap()
            .unwrap();
        let draws = probe.draws();
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].viewport, Rect::new(0, 0, 32, 16));
        assert_eq!(draws[0].texture_matrix, DecodedFrame::FLIP_Y);
        assert!(draws[0].alpha.is_none());
    }

    #[test]
    fn grid_children_tile_the_target() {
        let mut builder = MemoryContainer::builder();
        for id in 1..=4 {
            coded(&mut builder, id, 100, 100);
        }
        builder.grid(
            ImageId(10),
            Size::new(200, 200),
            2,
            2,
            vec![ImageId(1), ImageId(2), ImageId(3), ImageId(4)],
        );
        let (ctx, _) = context(&builder);

        let node = CompositionNode::build(&ctx, Source::Image(ImageId(10))).unwrap();
        assert_eq!(node.target_size(), Some((200, 200)));
        assert_eq!(
            node.child_rects(),
            vec![
                Rect::new(0, 0, 100, 100),
                Rect::new(100, 0, 200, 100),
                Rect::new(0, 100, 100, 200),
                Rect::new(100, 100, 200, 200),
            ]
        );
        assert_eq!(node.program_kind(), Some(ProgramKind::Color));
    }

    #[test]
    fn overlay_clears_background_before_layers() {
        let mut builder = MemoryContainer::builder();
        coded(&mut builder, 1, 16, 16);
        builder.overlay(
            ImageId(2),
            Size::new(32, 32),
            [65535, -1, 99999, 32768],
            vec![OverlayLayer {
                image: ImageId(1),
                horizontal_offset: 8,
                vertical_offset: 4,
            }],
        );
        let (ctx, probe) = context(&builder);

        let node = CompositionNode::build(&ctx, Source::Image(ImageId(2))).unwrap();
        assert_eq!(node.child_rects(), vec![Rect::new(8, 4, 24, 20)]);
        settle(&ctx, &node);
        probe.take_commands();

        ctx.cache
            .with_gpu(|gpu| node.draw(gpu, DrawTarget::display(64, 64), Rect::new(0, 0, 64, 64)))
            .unwrap()
            .unwrap();
        let commands = probe.commands();
        let GpuCommand::Clear { color, framebuffer } = commands[0] else {
            panic!("expected a clear first, got {:?}", commands[0]);
        };
        assert!(!framebuffer.is_default());
        assert_eq!(color[0], 1.0);
        assert_eq!(color[1], 0.0);
        assert_eq!(color[2], 1.0);
        assert!((color[3] - 0.5).abs() < 1e-4);
        let draws = probe.draws();
        assert_eq!(draws.len(), 2);
        assert_eq!(draws[0].framebuffer, framebuffer);
        assert_eq!(draws[0].viewport, Rect::new(8, 4, 24, 20));
        assert!(draws[1].framebuffer.is_default());
    }

    #[test]
    fn identity_carries_its_own_transform() {
        let mut builder = MemoryContainer::builder();
        coded(&mut builder, 1, 20, 10);
        builder.identity(ImageId(2), Size::new(20, 10), ImageId(1));
        builder.transform(ImageId(2), TransformProperty::Rotate { degrees: 90 });
        builder.transform(
            ImageId(2),
            TransformProperty::Mirror {
                axis: MirrorAxis::Horizontal,
            },
        );
        let (ctx, _) = context(&builder);

        let node = CompositionNode::build(&ctx, Source::Image(ImageId(2))).unwrap();
        assert_eq!(node.render_size(), (10.0, 20.0));
        assert_eq!(node.orientation().case(), 7);
        let (child, rect) = node.children().next().unwrap();
        assert_eq!(rect, Rect::new(0, 0, 20, 10));
        assert_eq!(child.orientation().case(), 1);
    }

    #[test]
    fn alpha_plane_renders_first_and_feeds_the_draw() {
        let mut builder = MemoryContainer::builder();
        coded(&mut builder, 1, 16, 16);
        coded(&mut builder, 2, 8, 8);
        builder.auxiliary(ImageId(1), ImageId(2), ALPHA);
        let (ctx, probe) = context(&builder);

        let node = CompositionNode::build(&ctx, Source::Image(ImageId(1))).unwrap();
        assert_eq!(node.alpha_source(), Some(ImageId(2)));
        assert_eq!(node.alpha_target_size(), Some((8, 8)));
        assert_eq!(node.program_kind(), Some(ProgramKind::ColorAlphaExternal));
        settle(&ctx, &node);
        assert!(node.ready_to_draw());

        ctx.cache
            .with_gpu(|gpu| node.draw(gpu, DrawTarget::display(64, 64), Rect::new(0, 0, 16, 16)))
            .unwrap()
            .unwrap();
        let draws = probe.draws();
        assert_eq!(draws.len(), 2);
        assert!(!draws[0].framebuffer.is_default());
        assert_eq!(draws[0].viewport, Rect::new(0, 0, 8, 8));
        let alpha_texture = probe.framebuffer_texture(draws[0].framebuffer);
        assert_eq!(draws[1].alpha, alpha_texture);
    }

    #[test]
    fn dispose_returns_every_reference() {
        let mut builder = MemoryContainer::builder();
        coded(&mut builder, 1, 10, 10);
        coded(&mut builder, 2, 4, 4);
        builder.auxiliary(ImageId(1), ImageId(2), DEPTH);
        builder.grid(
            ImageId(3),
            Size::new(20, 10),
            2,
            1,
            vec![ImageId(1), ImageId(1)],
        );
        let (ctx, probe) = context(&builder);

        let mut node = CompositionNode::build(&ctx, Source::Image(ImageId(3))).unwrap();
        assert_eq!(ctx.cache.ref_count("image#1/texture"), Some(2));
        assert_eq!(ctx.cache.ref_count("program:color-alpha-external"), Some(2));

        node.dispose(&ctx.cache);
        node.dispose(&ctx.cache);
        assert!(node.is_disposed());
        assert!(!node.ready_to_draw());
        assert!(ctx.cache.is_empty(), "left behind: {:?}", ctx.cache.keys());
        assert_eq!(probe.live_handles(), 0);
    }

    #[test]
    fn cyclic_derivation_fails_without_leaking() {
        let mut builder = MemoryContainer::builder();
        coded(&mut builder, 1, 10, 10);
        builder.identity(ImageId(2), Size::new(10, 10), ImageId(3));
        builder.identity(ImageId(3), Size::new(10, 10), ImageId(2));
        builder.overlay(
            ImageId(4),
            Size::new(10, 10),
            [0; 4],
            [1, 2]
                .map(|image| OverlayLayer {
                    image: ImageId(image),
                    horizontal_offset: 0,
                    vertical_offset: 0,
                })
                .to_vec(),
        );
        let (ctx, probe) = context(&builder);

        let err = CompositionNode::build(&ctx, Source::Image(ImageId(4))).unwrap_err();
        assert!(matches!(err, ComposeError::TooDeep(_)), "{err}");
        assert!(ctx.cache.is_empty(), "left behind: {:?}", ctx.cache.keys());
        assert_eq!(probe.live_handles(), 0);

        let err = CompositionNode::build(&ctx, Source::Image(ImageId(9))).unwrap_err();
        assert!(matches!(err, ComposeError::Model(ModelError::UnknownImage(_))));
    }

    #[test]
    fn zoom_rewrites_the_quad_only() {
        let mut builder = MemoryContainer::builder();
        coded(&mut builder, 1, 10, 10);
        let (ctx, _) = context(&builder);
        let mut node = CompositionNode::build(&ctx, Source::Image(ImageId(1))).unwrap();
        let before = *node.quad();

        node.set_zoom(Zoom::new((0.5, 0.5), 2.0));
        assert_ne!(*node.quad(), before);
        node.set_zoom(Zoom::NONE);
        assert_eq!(*node.quad(), before);
        node.dispose(&ctx.cache);
    }
}
