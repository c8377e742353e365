use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use decoder::DecodedFrame;

use super::{
    BufferId, FramebufferId, GpuBackend, GpuError, ProgramId, ProgramKind, QuadDraw, QuadVertices,
    TextureId,
};

/// Side effects a [`RecordingBackend`] has observed, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum GpuCommand {
    BeginFrame,
    EndFrame,
    Clear {
        framebuffer: FramebufferId,
        color: [f32; 4],
    },
    Upload {
        texture: TextureId,
        width: u32,
        height: u32,
    },
    Draw(QuadDraw),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TextureInfo {
    width: u32,
    height: u32,
    external: bool,
}

#[derive(Debug, Default)]
struct Recording {
    next_handle: u32,
    textures: BTreeMap<TextureId, TextureInfo>,
    framebuffers: BTreeMap<FramebufferId, TextureId>,
    programs: BTreeMap<ProgramId, ProgramKind>,
    buffers: BTreeMap<BufferId, Option<QuadVertices>>,
    commands: Vec<GpuCommand>,
    surface: (u32, u32),
    lose_context: bool,
    lost: bool,
}

impl Recording {
    fn allocate(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn check_alive(&self) -> Result<(), GpuError> {
        if self.lost {
            return Err(GpuError::ContextLost);
        }
        Ok(())
    }

    fn framebuffer_size(&self, framebuffer: FramebufferId) -> Result<(u32, u32), GpuError> {
        if framebuffer.is_default() {
            return Ok(self.surface);
        }
        let texture = self
            .framebuffers
            .get(&framebuffer)
            .ok_or(GpuError::UnknownHandle {
                kind: "framebuffer",
                id: framebuffer.0,
            })?;
        let info = self.textures.get(texture).ok_or(GpuError::UnknownHandle {
            kind: "texture",
            id: texture.0,
        })?;
        Ok((info.width, info.height))
    }
}

/// CPU-only backend. Hands out handle ids, tracks which are alive and logs
/// every clear, upload and draw so callers can inspect what a frame did.
pub struct RecordingBackend {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Recording {
                surface: (width, height),
                ..Recording::default()
            })),
        }
    }

    /// A handle that keeps observing this backend after it has been moved
    /// into a cache.
    pub fn probe(&self) -> RecordingProbe {
        RecordingProbe {
            inner: Arc::clone(&self.inner),
        }
    }

    fn state(&self) -> MutexGuard<'_, Recording> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl GpuBackend for RecordingBackend {
    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureId, GpuError> {
        if width == 0 || height == 0 {
            return Err(GpuError::InvalidSize { width, height });
        }
        let mut state = self.state();
        state.check_alive()?;
        let id = TextureId(state.allocate());
        state.textures.insert(
            id,
            TextureInfo {
                width,
                height,
                external: false,
            },
        );
        Ok(id)
    }

    fn create_external_texture(&mut self) -> Result<TextureId, GpuError> {
        let mut state = self.state();
        state.check_alive()?;
        let id = TextureId(state.allocate());
        state.textures.insert(
            id,
            TextureInfo {
                width: 0,
                height: 0,
                external: true,
            },
        );
        Ok(id)
    }

    fn delete_texture(&mut self, texture: TextureId) {
        if self.state().textures.remove(&texture).is_none() {
            tracing::error!(texture = texture.0, "deleting unknown texture");
        }
    }

    fn create_framebuffer(&mut self, texture: TextureId) -> Result<FramebufferId, GpuError> {
        let mut state = self.state();
        state.check_alive()?;
        if !state.textures.contains_key(&texture) {
            return Err(GpuError::UnknownHandle {
                kind: "texture",
                id: texture.0,
            });
        }
        let id = FramebufferId(state.allocate());
        state.framebuffers.insert(id, texture);
        Ok(id)
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        if self.state().framebuffers.remove(&framebuffer).is_none() {
            tracing::error!(framebuffer = framebuffer.0, "deleting unknown framebuffer");
        }
    }

    fn create_program(&mut self, kind: ProgramKind) -> Result<ProgramId, GpuError> {
        let mut state = self.state();
        state.check_alive()?;
        let id = ProgramId(state.allocate());
        state.programs.insert(id, kind);
        Ok(id)
    }

    fn delete_program(&mut self, program: ProgramId) {
        if self.state().programs.remove(&program).is_none() {
            tracing::error!(program = program.0, "deleting unknown program");
        }
    }

    fn create_vertex_buffer(&mut self) -> Result<BufferId, GpuError> {
        let mut state = self.state();
        state.check_alive()?;
        let id = BufferId(state.allocate());
        state.buffers.insert(id, None);
        Ok(id)
    }

    fn update_vertex_buffer(
        &mut self,
        buffer: BufferId,
        vertices: &QuadVertices,
    ) -> Result<(), GpuError> {
        let mut state = self.state();
        state.check_alive()?;
        let slot = state
            .buffers
            .get_mut(&buffer)
            .ok_or(GpuError::UnknownHandle {
                kind: "buffer",
                id: buffer.0,
            })?;
        *slot = Some(*vertices);
        Ok(())
    }

    fn delete_vertex_buffer(&mut self, buffer: BufferId) {
        if self.state().buffers.remove(&buffer).is_none() {
            tracing::error!(buffer = buffer.0, "deleting unknown vertex buffer");
        }
    }

    fn upload_frame(&mut self, texture: TextureId, frame: &DecodedFrame) -> Result<(), GpuError> {
        let mut state = self.state();
        state.check_alive()?;
        let info = state
            .textures
            .get_mut(&texture)
            .ok_or(GpuError::UnknownHandle {
                kind: "texture",
                id: texture.0,
            })?;
        info.width = frame.width;
        info.height = frame.height;
        state.commands.push(GpuCommand::Upload {
            texture,
            width: frame.width,
            height: frame.height,
        });
        Ok(())
    }

    fn clear(&mut self, framebuffer: FramebufferId, color: [f32; 4]) -> Result<(), GpuError> {
        let mut state = self.state();
        state.check_alive()?;
        state.framebuffer_size(framebuffer)?;
        state
            .commands
            .push(GpuCommand::Clear { framebuffer, color });
        Ok(())
    }

    fn draw_quad(&mut self, draw: &QuadDraw) -> Result<(), GpuError> {
        let mut state = self.state();
        state.check_alive()?;
        state.framebuffer_size(draw.framebuffer)?;
        if !state.programs.contains_key(&draw.program) {
            return Err(GpuError::UnknownHandle {
                kind: "program",
                id: draw.program.0,
            });
        }
        if !state.buffers.contains_key(&draw.vertices) {
            return Err(GpuError::UnknownHandle {
                kind: "buffer",
                id: draw.vertices.0,
            });
        }
        for texture in std::iter::once(draw.texture).chain(draw.alpha) {
            if !state.textures.contains_key(&texture) {
                return Err(GpuError::UnknownHandle {
                    kind: "texture",
                    id: texture.0,
                });
            }
        }
        state.commands.push(GpuCommand::Draw(*draw));
        Ok(())
    }

    fn begin_frame(&mut self) -> Result<(), GpuError> {
        let mut state = self.state();
        state.check_alive()?;
        state.commands.push(GpuCommand::BeginFrame);
        Ok(())
    }

    fn end_frame(&mut self) -> Result<(), GpuError> {
        let mut state = self.state();
        if state.lose_context {
            state.lose_context = false;
            state.lost = true;
        }
        state.check_alive()?;
        state.commands.push(GpuCommand::EndFrame);
        Ok(())
    }

    fn surface_size(&self) -> (u32, u32) {
        self.state().surface
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        self.state().surface = (width, height);
    }
}

/// Read side of a [`RecordingBackend`].
#[derive(Clone)]
pub struct RecordingProbe {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingProbe {
    fn state(&self) -> MutexGuard<'_, Recording> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn live_textures(&self) -> usize {
        self.state().textures.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.state().framebuffers.len()
    }

    pub fn live_programs(&self) -> usize {
        self.state().programs.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state().buffers.len()
    }

    pub fn live_handles(&self) -> usize {
        let state = self.state();
        state.textures.len() + state.framebuffers.len() + state.programs.len() + state.buffers.len()
    }

    pub fn texture_size(&self, texture: TextureId) -> Option<(u32, u32)> {
        self.state()
            .textures
            .get(&texture)
            .map(|info| (info.width, info.height))
    }

    pub fn is_external(&self, texture: TextureId) -> Option<bool> {
        self.state().textures.get(&texture).map(|info| info.external)
    }

    pub fn framebuffer_texture(&self, framebuffer: FramebufferId) -> Option<TextureId> {
        self.state().framebuffers.get(&framebuffer).copied()
    }

    pub fn program_kind(&self, program: ProgramId) -> Option<ProgramKind> {
        self.state().programs.get(&program).copied()
    }

    pub fn vertices(&self, buffer: BufferId) -> Option<QuadVertices> {
        self.state().buffers.get(&buffer).copied().flatten()
    }

    pub fn commands(&self) -> Vec<GpuCommand> {
        self.state().commands.clone()
    }

    pub fn take_commands(&self) -> Vec<GpuCommand> {
        std::mem::take(&mut self.state().commands)
    }

    pub fn draws(&self) -> Vec<QuadDraw> {
        self.state()
            .commands
            .iter()
            .filter_map(|command| match command {
                GpuCommand::Draw(draw) => Some(*draw),
                _ => None,
            })
            .collect()
    }

    pub fn clears(&self) -> Vec<(FramebufferId, [f32; 4])> {
        self.state()
            .commands
            .iter()
            .filter_map(|command| match command {
                GpuCommand::Clear { framebuffer, color } => Some((*framebuffer, *color)),
                _ => None,
            })
            .collect()
    }

    pub fn uploads(&self) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|command| matches!(command, GpuCommand::Upload { .. }))
            .count()
    }

    /// Makes the next `end_frame` report a lost context. Every later call
    /// fails the same way, as a real lost context would.
    pub fn lose_context(&self) {
        self.state().lose_context = true;
    }

    pub fn is_lost(&self) -> bool {
        self.state().lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Rect;

    #[test]
    fn tracks_live_handles() {
        let mut gpu = RecordingBackend::new(64, 64);
        let probe = gpu.probe();

        let texture = gpu.create_texture(16, 8).unwrap();
        let framebuffer = gpu.create_framebuffer(texture).unwrap();
        let program = gpu.create_program(ProgramKind::Color).unwrap();
        let buffer = gpu.create_vertex_buffer().unwrap();
        assert_eq!(probe.live_handles(), 4);
        assert_eq!(probe.texture_size(texture), Some((16, 8)));
        assert_eq!(probe.framebuffer_texture(framebuffer), Some(texture));

        gpu.delete_framebuffer(framebuffer);
        gpu.delete_texture(texture);
        gpu.delete_program(program);
        gpu.delete_vertex_buffer(buffer);
        assert_eq!(probe.live_handles(), 0);
    }

    #[test]
    fn rejects_zero_sized_targets() {
        let mut gpu = RecordingBackend::new(64, 64);
        assert!(matches!(
            gpu.create_texture(0, 8),
            Err(GpuError::InvalidSize { width: 0, height: 8 })
        ));
    }

    #[test]
    fn records_draws_against_known_handles() {
        let mut gpu = RecordingBackend::new(64, 64);
        let probe = gpu.probe();
        let texture = gpu.create_external_texture().unwrap();
        let program = gpu.create_program(ProgramKind::ColorExternal).unwrap();
        let buffer = gpu.create_vertex_buffer().unwrap();
        let draw = QuadDraw {
            framebuffer: FramebufferId::DEFAULT,
            target_size: (64, 64),
            viewport: Rect::new(0, 0, 64, 64),
            program,
            vertices: buffer,
            texture,
            alpha: None,
            texture_matrix: DecodedFrame::IDENTITY,
        };

        gpu.draw_quad(&draw).unwrap();
        let missing = QuadDraw {
            texture: TextureId(999),
            ..draw
        };
        assert!(gpu.draw_quad(&missing).is_err());
        assert_eq!(probe.draws(), vec![draw]);
    }

    #[test]
    fn lost_context_fails_every_later_call() {
        let mut gpu = RecordingBackend::new(8, 8);
        let probe = gpu.probe();
        gpu.begin_frame().unwrap();
        probe.lose_context();

        assert!(matches!(gpu.end_frame(), Err(GpuError::ContextLost)));
        assert!(matches!(gpu.begin_frame(), Err(GpuError::ContextLost)));
        assert!(matches!(
            gpu.create_vertex_buffer(),
            Err(GpuError::ContextLost)
        ));
        assert!(probe.is_lost());
    }
}
