use crate::gpu::FramebufferId;

/// Pixel rectangle with a top-left origin. `right`/`bottom` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, saturating_i32(width), saturating_i32(height))
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> i64 {
        i64::from(self.width().max(0)) * i64::from(self.height().max(0))
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.left < other.right
            && other.left < self.right
            && self.top < other.bottom
            && other.top < self.bottom
    }
}

pub(crate) fn saturating_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// A framebuffer plus its size: either an off-screen target or the
/// presentation surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawTarget {
    pub framebuffer: FramebufferId,
    pub width: u32,
    pub height: u32,
}

impl DrawTarget {
    pub fn display(width: u32, height: u32) -> Self {
        Self {
            framebuffer: FramebufferId::DEFAULT,
            width,
            height,
        }
    }

    pub fn offscreen(framebuffer: FramebufferId, width: u32, height: u32) -> Self {
        Self {
            framebuffer,
            width,
            height,
        }
    }

    pub fn is_display(&self) -> bool {
        self.framebuffer.is_default()
    }

    pub fn full_rect(&self) -> Rect {
        Rect::from_size(self.width, self.height)
    }
}

/// Viewing window on a root image. `center` is in normalised top-left
/// coordinates; a factor of 2 shows half the width and half the height.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Zoom {
    pub center: (f32, f32),
    pub factor: f32,
}

impl Zoom {
    pub const NONE: Zoom = Zoom {
        center: (0.5, 0.5),
        factor: 1.0,
    };

    pub fn new(center: (f32, f32), factor: f32) -> Self {
        Self { center, factor }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::NONE
    }
}

impl Default for Zoom {
    fn default() -> Self {
        Self::NONE
    }
}
