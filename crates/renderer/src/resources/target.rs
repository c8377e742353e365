use crate::gpu::{FramebufferId, GpuBackend, GpuError, TextureId};
use crate::types::DrawTarget;

use super::GpuResource;

/// Off-screen colour texture plus the framebuffer that renders into it.
/// The size is fixed; a node that needs another size registers a new one.
#[derive(Debug)]
pub struct RenderTarget {
    width: u32,
    height: u32,
    texture: Option<TextureId>,
    framebuffer: Option<FramebufferId>,
}

impl RenderTarget {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            texture: None,
            framebuffer: None,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn texture(&self) -> Option<TextureId> {
        self.texture
    }

    /// Where to draw, once reserved.
    pub fn draw_target(&self) -> Option<DrawTarget> {
        self.framebuffer
            .map(|framebuffer| DrawTarget::offscreen(framebuffer, self.width, self.height))
    }

    pub fn is_reserved(&self) -> bool {
        self.texture.is_some() && self.framebuffer.is_some()
    }
}

impl GpuResource for RenderTarget {
    fn reserve(&mut self, gpu: &mut dyn GpuBackend) -> Result<(), GpuError> {
        if self.texture.is_some() || self.framebuffer.is_some() {
            self.release(Some(&mut *gpu));
        }
        let texture = gpu.create_texture(self.width, self.height)?;
        let framebuffer = match gpu.create_framebuffer(texture) {
            Ok(framebuffer) => framebuffer,
            Err(err) => {
                gpu.delete_texture(texture);
                return Err(err);
            }
        };
        self.texture = Some(texture);
        self.framebuffer = Some(framebuffer);
        Ok(())
    }

    fn release(&mut self, gpu: Option<&mut dyn GpuBackend>) {
        let texture = self.texture.take();
        let framebuffer = self.framebuffer.take();
        if let Some(gpu) = gpu {
            if let Some(framebuffer) = framebuffer {
                gpu.delete_framebuffer(framebuffer);
            }
            if let Some(texture) = texture {
                gpu.delete_texture(texture);
            }
        }
    }
}
