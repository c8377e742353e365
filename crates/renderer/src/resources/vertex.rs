use crate::gpu::{BufferId, GpuBackend, GpuError, QuadVertices};

use super::GpuResource;

/// Six-vertex quad buffer. The last vertices written are kept so a fresh
/// context gets the same contents on reserve.
#[derive(Debug)]
pub struct VertexBuffer {
    buffer: Option<BufferId>,
    vertices: Option<QuadVertices>,
}

impl VertexBuffer {
    pub fn new() -> Self {
        Self {
            buffer: None,
            vertices: None,
        }
    }

    pub fn id(&self) -> Option<BufferId> {
        self.buffer
    }

    pub fn vertices(&self) -> Option<&QuadVertices> {
        self.vertices.as_ref()
    }

    /// Uploads `vertices` unless they are already the buffer's contents.
    pub fn update(
        &mut self,
        gpu: &mut dyn GpuBackend,
        vertices: &QuadVertices,
    ) -> Result<(), GpuError> {
        if self.vertices.as_ref() == Some(vertices) {
            return Ok(());
        }
        let buffer = self.buffer.ok_or(GpuError::UnknownHandle {
            kind: "buffer",
            id: 0,
        })?;
        gpu.update_vertex_buffer(buffer, vertices)?;
        self.vertices = Some(*vertices);
        Ok(())
    }
}

impl Default for VertexBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuResource for VertexBuffer {
    fn reserve(&mut self, gpu: &mut dyn GpuBackend) -> Result<(), GpuError> {
        if self.buffer.is_some() {
            self.release(Some(&mut *gpu));
        }
        let buffer = gpu.create_vertex_buffer()?;
        self.buffer = Some(buffer);
        if let Some(vertices) = &self.vertices {
            gpu.update_vertex_buffer(buffer, vertices)?;
        }
        Ok(())
    }

    fn release(&mut self, gpu: Option<&mut dyn GpuBackend>) {
        if let (Some(gpu), Some(buffer)) = (gpu, self.buffer.take()) {
            gpu.delete_vertex_buffer(buffer);
        }
        self.buffer = None;
    }
}
