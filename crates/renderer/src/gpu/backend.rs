use std::collections::HashMap;

use anyhow::{anyhow, bail, Context as AnyhowContext, Result};
use bytemuck::{Pod, Zeroable};
use decoder::DecodedFrame;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use wgpu::util::DeviceExt;

use crate::types::Rect;

use super::context::{GpuContext, OFFSCREEN_FORMAT};
use super::pipeline::{PipelineCache, PipelineLayouts};
use super::{
    BufferId, FramebufferId, GpuBackend, GpuError, ProgramId, ProgramKind, QuadDraw, QuadVertices,
    TextureId, QUAD_VERTEX_COUNT,
};

/// Uniform block of the quad vertex shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct QuadParams {
    texture_matrix: [f32; 16],
    /// Scale and offset taking viewport clip space to target clip space.
    placement: [f32; 4],
}

struct Storage {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

impl Storage {
    fn new(device: &wgpu::Device, width: u32, height: u32, usage: wgpu::TextureUsages) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("quad texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: OFFSCREEN_FORMAT,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            width,
            height,
        }
    }
}

/// Decoder textures start without storage and take the size of whatever
/// frame is uploaded.
struct TextureSlot {
    storage: Option<Storage>,
    external: bool,
}

struct Frame {
    encoder: wgpu::CommandEncoder,
    surface: Option<wgpu::SurfaceTexture>,
    display_view: wgpu::TextureView,
}

/// [`GpuBackend`] on wgpu. Headless instances render the display into an
/// off-screen texture that [`WgpuBackend::read_display`] copies back.
pub struct WgpuBackend {
    context: GpuContext,
    layouts: PipelineLayouts,
    pipelines: PipelineCache,
    placeholder: Storage,
    display: Option<Storage>,
    textures: HashMap<TextureId, TextureSlot>,
    framebuffers: HashMap<FramebufferId, TextureId>,
    programs: HashMap<ProgramId, ProgramKind>,
    buffers: HashMap<BufferId, wgpu::Buffer>,
    next_handle: u32,
    frame: Option<Frame>,
}

const TARGET_USAGE: wgpu::TextureUsages = wgpu::TextureUsages::TEXTURE_BINDING
    .union(wgpu::TextureUsages::RENDER_ATTACHMENT)
    .union(wgpu::TextureUsages::COPY_SRC);
const UPLOAD_USAGE: wgpu::TextureUsages =
    wgpu::TextureUsages::TEXTURE_BINDING.union(wgpu::TextureUsages::COPY_DST);

impl WgpuBackend {
    pub fn headless(width: u32, height: u32) -> Result<Self> {
        let context = GpuContext::headless(width, height)?;
        Ok(Self::from_context(context))
    }

    /// Presents to the window behind `target`, which must outlive the backend.
    pub fn with_surface<T>(target: &T, width: u32, height: u32) -> Result<Self>
    where
        T: HasDisplayHandle + HasWindowHandle,
    {
        let context = GpuContext::with_surface(target, width, height)?;
        Ok(Self::from_context(context))
    }

    fn from_context(context: GpuContext) -> Self {
        let layouts = PipelineLayouts::new(&context.device);
        let placeholder = Storage::new(&context.device, 1, 1, UPLOAD_USAGE);
        context.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &placeholder.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &[0, 0, 0, 0],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4),
                rows_per_image: Some(1),
            },
            wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
        let display = context.surface.is_none().then(|| {
            Storage::new(&context.device, context.size.0, context.size.1, TARGET_USAGE)
        });
        Self {
            context,
            layouts,
            pipelines: PipelineCache::default(),
            placeholder,
            display,
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            buffers: HashMap::new(),
            next_handle: 0,
            frame: None,
        }
    }

    fn allocate(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn check_alive(&self) -> Result<(), GpuError> {
        if self.context.is_lost() {
            return Err(GpuError::ContextLost);
        }
        Ok(())
    }

    fn storage(&self, texture: TextureId) -> Result<Option<&Storage>, GpuError> {
        self.textures
            .get(&texture)
            .map(|slot| slot.storage.as_ref())
            .ok_or(GpuError::UnknownHandle {
                kind: "texture",
                id: texture.0,
            })
    }

    fn target_view(
        &self,
        framebuffer: FramebufferId,
    ) -> Result<(&wgpu::TextureView, wgpu::TextureFormat), GpuError> {
        if framebuffer.is_default() {
            let frame = self.frame.as_ref().ok_or_else(no_frame)?;
            return Ok((&frame.display_view, self.context.display_format));
        }
        let texture = self
            .framebuffers
            .get(&framebuffer)
            .ok_or(GpuError::UnknownHandle {
                kind: "framebuffer",
                id: framebuffer.0,
            })?;
        let storage = self.storage(*texture)?.ok_or(GpuError::UnknownHandle {
            kind: "framebuffer",
            id: framebuffer.0,
        })?;
        Ok((&storage.view, OFFSCREEN_FORMAT))
    }

    fn acquire_surface(&mut self) -> Result<Option<wgpu::SurfaceTexture>, GpuError> {
        let Some(present) = self.context.surface.as_ref() else {
            return Ok(None);
        };
        match present.surface.get_current_texture() {
            Ok(texture) => Ok(Some(texture)),
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                tracing::debug!("surface outdated; reconfiguring");
                self.context.reconfigure();
                let present = self.context.surface.as_ref().ok_or_else(no_frame)?;
                present
                    .surface
                    .get_current_texture()
                    .map(Some)
                    .map_err(surface_error)
            }
            Err(err) => Err(surface_error(err)),
        }
    }

    /// Copies the headless display back as tightly packed RGBA rows.
    pub fn read_display(&self) -> Result<Vec<u8>> {
        let display = self
            .display
            .as_ref()
            .ok_or_else(|| anyhow!("surface-backed displays cannot be read back"))?;
        if self.frame.is_some() {
            bail!("cannot read the display while a frame is being recorded");
        }
        let row_bytes = display.width * 4;
        let padded_row = row_bytes.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let readback = self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("display readback"),
            size: u64::from(padded_row) * u64::from(display.height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("display readback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &display.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(display.height),
                },
            },
            wgpu::Extent3d {
                width: display.width,
                height: display.height,
                depth_or_array_layers: 1,
            },
        );
        self.context.queue.submit(Some(encoder.finish()));

        let slice = readback.slice(..);
        let (tx, rx) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.context
            .device
            .poll(wgpu::PollType::Wait)
            .map_err(|err| anyhow!("failed to wait for readback: {err}"))?;
        rx.recv()
            .context("readback callback never ran")?
            .map_err(|err| anyhow!("failed to map readback buffer: {err}"))?;

        let mapped = slice.get_mapped_range();
        let mut pixels = Vec::with_capacity((row_bytes * display.height) as usize);
        for row in mapped.chunks(padded_row as usize) {
            pixels.extend_from_slice(&row[..row_bytes as usize]);
        }
        drop(mapped);
        readback.unmap();
        Ok(pixels)
    }
}

impl GpuBackend for WgpuBackend {
    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureId, GpuError> {
        self.check_alive()?;
        if width == 0 || height == 0 {
            return Err(GpuError::InvalidSize { width, height });
        }
        let storage = Storage::new(&self.context.device, width, height, TARGET_USAGE);
        let id = TextureId(self.allocate());
        self.textures.insert(
            id,
            TextureSlot {
                storage: Some(storage),
                external: false,
            },
        );
        Ok(id)
    }

    fn create_external_texture(&mut self) -> Result<TextureId, GpuError> {
        self.check_alive()?;
        let id = TextureId(self.allocate());
        self.textures.insert(
            id,
            TextureSlot {
                storage: None,
                external: true,
            },
        );
        Ok(id)
    }

    fn delete_texture(&mut self, texture: TextureId) {
        if let Some(slot) = self.textures.remove(&texture) {
            if let Some(storage) = slot.storage {
                storage.texture.destroy();
            }
        }
    }

    fn create_framebuffer(&mut self, texture: TextureId) -> Result<FramebufferId, GpuError> {
        self.check_alive()?;
        let renderable = self
            .textures
            .get(&texture)
            .is_some_and(|slot| !slot.external && slot.storage.is_some());
        if !renderable {
            return Err(GpuError::UnknownHandle {
                kind: "texture",
                id: texture.0,
            });
        }
        let id = FramebufferId(self.allocate());
        self.framebuffers.insert(id, texture);
        Ok(id)
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.framebuffers.remove(&framebuffer);
    }

    fn create_program(&mut self, kind: ProgramKind) -> Result<ProgramId, GpuError> {
        self.check_alive()?;
        self.pipelines.get_or_create(
            &self.context.device,
            &self.layouts,
            kind,
            OFFSCREEN_FORMAT,
        );
        let id = ProgramId(self.allocate());
        self.programs.insert(id, kind);
        Ok(id)
    }

    fn delete_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
    }

    fn create_vertex_buffer(&mut self) -> Result<BufferId, GpuError> {
        self.check_alive()?;
        let buffer = self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("quad vertices"),
            size: std::mem::size_of::<QuadVertices>() as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let id = BufferId(self.allocate());
        self.buffers.insert(id, buffer);
        Ok(id)
    }

    fn update_vertex_buffer(
        &mut self,
        buffer: BufferId,
        vertices: &QuadVertices,
    ) -> Result<(), GpuError> {
        self.check_alive()?;
        let target = self.buffers.get(&buffer).ok_or(GpuError::UnknownHandle {
            kind: "buffer",
            id: buffer.0,
        })?;
        self.context
            .queue
            .write_buffer(target, 0, bytemuck::cast_slice(vertices.as_slice()));
        Ok(())
    }

    fn delete_vertex_buffer(&mut self, buffer: BufferId) {
        if let Some(buffer) = self.buffers.remove(&buffer) {
            buffer.destroy();
        }
    }

    fn upload_frame(&mut self, texture: TextureId, frame: &DecodedFrame) -> Result<(), GpuError> {
        self.check_alive()?;
        let (width, height) = (frame.width, frame.height);
        if width == 0 || height == 0 {
            return Err(GpuError::InvalidSize { width, height });
        }
        let expected = width as usize * height as usize * 4;
        if frame.pixels.len() != expected {
            return Err(GpuError::Backend(format!(
                "frame of {width}x{height} carries {} bytes, expected {expected}",
                frame.pixels.len()
            )));
        }
        let device = &self.context.device;
        let slot = self
            .textures
            .get_mut(&texture)
            .ok_or(GpuError::UnknownHandle {
                kind: "texture",
                id: texture.0,
            })?;
        let resized = slot
            .storage
            .as_ref()
            .is_none_or(|storage| storage.width != width || storage.height != height);
        if resized {
            if let Some(old) = slot.storage.take() {
                old.texture.destroy();
            }
            slot.storage = Some(Storage::new(device, width, height, UPLOAD_USAGE));
        }
        let Some(storage) = slot.storage.as_ref() else {
            return Err(GpuError::UnknownHandle {
                kind: "texture",
                id: texture.0,
            });
        };
        self.context.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &storage.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &frame.pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * 4),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn clear(&mut self, framebuffer: FramebufferId, color: [f32; 4]) -> Result<(), GpuError> {
        self.check_alive()?;
        let (view, _) = self.target_view(framebuffer)?;
        let view = view.clone();
        let frame = self.frame.as_mut().ok_or_else(no_frame)?;
        let [r, g, b, a] = color.map(f64::from);
        drop(frame.encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("clear"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        }));
        Ok(())
    }

    fn draw_quad(&mut self, draw: &QuadDraw) -> Result<(), GpuError> {
        self.check_alive()?;
        if draw.viewport.is_empty() {
            return Ok(());
        }
        let kind = *self.programs.get(&draw.program).ok_or(GpuError::UnknownHandle {
            kind: "program",
            id: draw.program.0,
        })?;
        let (target, format) = self.target_view(draw.framebuffer)?;
        let target = target.clone();
        let color = self
            .storage(draw.texture)?
            .map_or(&self.placeholder.view, |storage| &storage.view)
            .clone();
        let alpha = match draw.alpha {
            Some(alpha) => self
                .storage(alpha)?
                .map_or(&self.placeholder.view, |storage| &storage.view)
                .clone(),
            None => self.placeholder.view.clone(),
        };
        let vertices = self
            .buffers
            .get(&draw.vertices)
            .ok_or(GpuError::UnknownHandle {
                kind: "buffer",
                id: draw.vertices.0,
            })?
            .clone();

        let device = &self.context.device;
        let params = QuadParams {
            texture_matrix: draw.texture_matrix,
            placement: placement(draw.viewport, draw.target_size),
        };
        let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("quad params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let params_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("quad params"),
            layout: &self.layouts.params_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: params_buffer.as_entire_binding(),
            }],
        });
        let texture_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("quad textures"),
            layout: &self.layouts.texture_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&color),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&alpha),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&self.layouts.sampler),
                },
            ],
        });
        let pipeline = self
            .pipelines
            .get_or_create(device, &self.layouts, kind, format)
            .clone();

        let frame = self.frame.as_mut().ok_or_else(no_frame)?;
        let mut pass = frame.encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(kind.cache_key()),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &target,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &params_group, &[]);
        pass.set_bind_group(1, &texture_group, &[]);
        pass.set_vertex_buffer(0, vertices.slice(..));
        pass.draw(0..QUAD_VERTEX_COUNT as u32, 0..1);
        Ok(())
    }

    fn begin_frame(&mut self) -> Result<(), GpuError> {
        self.check_alive()?;
        if self.frame.is_some() {
            tracing::warn!("begin_frame while a frame is open; discarding it");
            self.frame = None;
        }
        let surface = self.acquire_surface()?;
        let display_view = match (&surface, &self.display) {
            (Some(texture), _) => texture
                .texture
                .create_view(&wgpu::TextureViewDescriptor::default()),
            (None, Some(display)) => display.view.clone(),
            (None, None) => return Err(no_frame()),
        };
        let encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame"),
            });
        self.frame = Some(Frame {
            encoder,
            surface,
            display_view,
        });
        Ok(())
    }

    fn end_frame(&mut self) -> Result<(), GpuError> {
        if let Some(frame) = self.frame.take() {
            self.context.queue.submit(Some(frame.encoder.finish()));
            if let Some(surface) = frame.surface {
                surface.present();
            }
        }
        self.check_alive()
    }

    fn surface_size(&self) -> (u32, u32) {
        self.context.size
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 || self.context.size == (width, height) {
            return;
        }
        tracing::debug!(width, height, "resizing display");
        self.context.resize(width, height);
        if self.display.is_some() {
            self.display = Some(Storage::new(&self.context.device, width, height, TARGET_USAGE));
        }
    }
}

impl std::fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("size", &self.context.size)
            .field("headless", &self.display.is_some())
            .field("textures", &self.textures.len())
            .field("pipelines", &self.pipelines.len())
            .finish()
    }
}

fn no_frame() -> GpuError {
    GpuError::Backend("no frame in progress".into())
}

fn surface_error(err: wgpu::SurfaceError) -> GpuError {
    match err {
        wgpu::SurfaceError::OutOfMemory | wgpu::SurfaceError::Lost => GpuError::ContextLost,
        other => GpuError::Backend(format!("failed to acquire surface texture: {other}")),
    }
}

/// Maps the unit quad drawn into `viewport` onto the whole target, so
/// viewports may extend past the target's edges.
fn placement(viewport: Rect, target: (u32, u32)) -> [f32; 4] {
    let (width, height) = (target.0.max(1) as f32, target.1.max(1) as f32);
    let rect_width = viewport.width() as f32;
    let rect_height = viewport.height() as f32;
    [
        rect_width / width,
        rect_height / height,
        (2.0 * viewport.left as f32 + rect_width) / width - 1.0,
        1.0 - (2.0 * viewport.top as f32 + rect_height) / height,
    ]
}
