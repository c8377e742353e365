//! Decode scheduling for coded HEIF/MIAF items and track samples.
//!
//! A [`DecodeScheduler`] owns one hardware decoder and serialises decode jobs
//! into its input/output buffer exchange. [`SoftwareDecoder`] covers JPEG
//! items on the CPU. Both are handed out by a [`DecoderPool`], which reuses
//! still-image decoders whose configuration matches.
mod format;
mod hardware;
mod pool;
mod scheduler;
mod software;
mod surface;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use imagegraph::{DecoderConfig, FourCc, ModelError, SampleId};

pub use format::InputFormat;
pub use hardware::{DecoderFactory, HardwareDecoder};
pub use pool::DecoderPool;
pub use scheduler::{CodecEvents, DecodeMode, DecodeScheduler, PtsPolicy, SchedulerState};
pub use software::SoftwareDecoder;
pub use surface::{DecodedFrame, OutputSurface};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("decoder has been released")]
    Stopped,
    #[error("unsupported codec {0}")]
    UnsupportedCodec(FourCc),
    #[error("decoder configuration failed: {0}")]
    Configuration(String),
    #[error("decode job has no output surface")]
    MissingSurface,
    #[error("failed to read decoder input: {0}")]
    Input(#[from] ModelError),
    #[error("hardware decoder error: {0}")]
    Hardware(String),
    #[error("failed to decode image: {0}")]
    Image(#[from] image::ImageError),
}

/// The party waiting on a decode: a texture that owns the output surface and
/// knows where the compressed bytes live.
///
/// Callbacks arrive on decoder threads and must only flip state; they may not
/// call back into the decoder that invoked them.
pub trait DecodeClient: Send + Sync {
    fn output_surface(&self) -> Option<Arc<OutputSurface>>;
    /// Item data when `sample` is `None`, otherwise that sample's data.
    fn input_data(&self, sample: Option<SampleId>) -> Result<Vec<u8>, DecodeError>;
    fn notify_decode_ready(&self);
    fn set_available(&self, available: bool);
}

/// One request to decode an item or sample onto the client's surface.
#[derive(Clone)]
pub struct DecodeJob {
    pub client: Arc<dyn DecodeClient>,
    pub sample: Option<SampleId>,
    pub render: bool,
}

impl DecodeJob {
    /// Unblocks the client after a job could not be decoded.
    pub(crate) fn fail(&self) {
        self.client.notify_decode_ready();
        self.client.set_available(true);
    }
}

pub trait Decoder: Send + Sync {
    fn queue_decode(
        &self,
        client: Arc<dyn DecodeClient>,
        sample: Option<SampleId>,
        render: bool,
    ) -> Result<(), DecodeError>;

    /// Whether an item with `config` can be decoded without a new instance.
    fn compatible(&self, config: &DecoderConfig) -> bool;

    fn release(&self);
}

pub fn is_supported(codec: FourCc) -> bool {
    codec == FourCc::HVC1 || codec == FourCc::AVC1 || codec == FourCc::JPEG
}
