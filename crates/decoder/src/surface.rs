use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

static NEXT_SURFACE_ID: AtomicU64 = AtomicU64::new(1);

type FrameListener = Arc<dyn Fn() + Send + Sync>;

/// RGBA8 output of one decode plus the texture transform to sample it with.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    /// Column-major 4x4 matrix applied to texture coordinates.
    pub transform: [f32; 16],
}

impl DecodedFrame {
    pub const IDENTITY: [f32; 16] = [
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ];

    /// Maps `v` to `1 - v`; frames stored top row first need it.
    pub const FLIP_Y: [f32; 16] = [
        1.0, 0.0, 0.0, 0.0, //
        0.0, -1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 1.0, 0.0, 1.0,
    ];
}

/// Destination a decoder renders into; stands in for a platform surface
/// texture. Shared between the texture that owns it and the decoder
/// currently bound to it.
pub struct OutputSurface {
    id: u64,
    pending: Mutex<Option<DecodedFrame>>,
    listener: Mutex<Option<FrameListener>>,
    released: AtomicBool,
}

impl OutputSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed),
            pending: Mutex::new(None),
            listener: Mutex::new(None),
            released: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_frame_listener(&self, listener: impl Fn() + Send + Sync + 'static) {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
    }

    /// Replaces any frame not yet latched and fires the frame listener.
    /// Frames posted after [`OutputSurface::release`] are dropped.
    pub fn post_frame(&self, frame: DecodedFrame) {
        if self.is_released() {
            tracing::debug!(surface = self.id, "dropping frame posted to released surface");
            return;
        }
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener();
        }
    }

    /// Takes the most recent frame, if one arrived since the last latch.
    pub fn latch(&self) -> Option<DecodedFrame> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn release(&self) {
        self.released.store(true, Ordering::Release);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for OutputSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSurface")
            .field("id", &self.id)
            .field("released", &self.is_released())
            .finish()
    }
}
