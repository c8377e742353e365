use std::sync::Arc;

use crate::format::InputFormat;
use crate::scheduler::CodecEvents;
use crate::surface::OutputSurface;
use crate::DecodeError;

/// Platform decoder instance (a MediaCodec-style asynchronous codec).
///
/// Buffer availability is reported through the [`CodecEvents`] passed to
/// `start`, from the platform's own callback thread. Implementations must not
/// deliver events synchronously from inside any of these calls.
pub trait HardwareDecoder: Send {
    fn configure(
        &mut self,
        format: &InputFormat,
        surface: &Arc<OutputSurface>,
    ) -> Result<(), DecodeError>;
    fn start(&mut self, events: CodecEvents) -> Result<(), DecodeError>;
    fn set_output_surface(&mut self, surface: &Arc<OutputSurface>) -> Result<(), DecodeError>;
    fn write_input(&mut self, index: usize, data: &[u8]) -> Result<(), DecodeError>;
    fn queue_input_buffer(&mut self, index: usize, size: usize, pts: u64)
        -> Result<(), DecodeError>;
    /// Returns an output buffer, presenting it on the bound surface when
    /// `render` is set.
    fn release_output_buffer(&mut self, index: usize, render: bool) -> Result<(), DecodeError>;
    fn stop(&mut self);
    fn release(&mut self);
}

/// Creates hardware decoder instances. Instances are scarce, so the pool
/// calls this only when no compatible decoder exists.
pub trait DecoderFactory: Send + Sync {
    fn create(&self, format: &InputFormat) -> Result<Box<dyn HardwareDecoder>, DecodeError>;
}
