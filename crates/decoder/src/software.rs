use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use imagegraph::{DecoderConfig, FourCc, SampleId};

use crate::surface::DecodedFrame;
use crate::{DecodeClient, DecodeError, Decoder};

/// CPU decoder for JPEG-coded items. Decodes synchronously on the caller's
/// thread and posts the result to the client's surface.
pub struct SoftwareDecoder {
    codec: FourCc,
    released: AtomicBool,
}

impl SoftwareDecoder {
    pub fn new(codec: FourCc) -> Result<Self, DecodeError> {
        if codec != FourCc::JPEG {
            return Err(DecodeError::UnsupportedCodec(codec));
        }
        Ok(Self {
            codec,
            released: AtomicBool::new(false),
        })
    }

    fn decode(&self, client: &dyn DecodeClient, sample: Option<SampleId>) -> Result<(), DecodeError> {
        let surface = client.output_surface().ok_or(DecodeError::MissingSurface)?;
        let data = client.input_data(sample)?;
        let image = image::load_from_memory_with_format(&data, image::ImageFormat::Jpeg)?;
        let rgba = image.to_rgba8();
        let (width, height) = rgba.dimensions();
        surface.post_frame(DecodedFrame {
            width,
            height,
            pixels: rgba.into_raw(),
            transform: DecodedFrame::FLIP_Y,
        });
        Ok(())
    }
}

impl Decoder for SoftwareDecoder {
    fn queue_decode(
        &self,
        client: Arc<dyn DecodeClient>,
        sample: Option<SampleId>,
        render: bool,
    ) -> Result<(), DecodeError> {
        if self.released.load(Ordering::Acquire) {
            return Err(DecodeError::Stopped);
        }
        if !render {
            // Intra-only: nothing later depends on this frame.
            return Ok(());
        }
        match self.decode(client.as_ref(), sample) {
            Ok(()) => client.notify_decode_ready(),
            Err(err) => {
                tracing::warn!(codec = %self.codec, error = %err, "software decode failed");
                client.notify_decode_ready();
                client.set_available(true);
            }
        }
        Ok(())
    }

    fn compatible(&self, config: &DecoderConfig) -> bool {
        config.codec == self.codec
    }

    fn release(&self) {
        self.released.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeClient;
    use image::codecs::jpeg::JpegEncoder;
    use image::{ExtendedColorType, ImageEncoder};

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let pixels = vec![200u8; (width * height * 3) as usize];
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 90)
            .write_image(&pixels, width, height, ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    #[test]
    fn decodes_jpeg_onto_client_surface() {
        let decoder = SoftwareDecoder::new(FourCc::JPEG).unwrap();
        let client = FakeClient::with_surface(jpeg(8, 4));

        decoder.queue_decode(client.clone(), None, true).unwrap();

        let frame = client.surface().latch().expect("frame posted");
        assert_eq!((frame.width, frame.height), (8, 4));
        assert_eq!(frame.pixels.len(), 8 * 4 * 4);
        assert_eq!(frame.transform, DecodedFrame::FLIP_Y);
        assert_eq!(client.ready_count(), 1);
    }

    #[test]
    fn corrupt_data_unblocks_client() {
        let decoder = SoftwareDecoder::new(FourCc::JPEG).unwrap();
        let client = FakeClient::with_surface(vec![0xFF, 0xD8, 0x00]);

        decoder.queue_decode(client.clone(), None, true).unwrap();

        assert!(client.surface().latch().is_none());
        assert_eq!(client.ready_count(), 1);
        assert!(client.is_available());
    }

    #[test]
    fn only_accepts_jpeg() {
        assert!(SoftwareDecoder::new(FourCc::HVC1).is_err());
        let decoder = SoftwareDecoder::new(FourCc::JPEG).unwrap();
        assert!(decoder.compatible(&DecoderConfig::new(FourCc::JPEG, vec![1, 2])));
        assert!(!decoder.compatible(&DecoderConfig::new(FourCc::HVC1, Vec::new())));
    }

    #[test]
    fn released_decoder_rejects_jobs() {
        let decoder = SoftwareDecoder::new(FourCc::JPEG).unwrap();
        decoder.release();
        let err = decoder
            .queue_decode(FakeClient::with_surface(jpeg(2, 2)), None, true)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Stopped));
    }
}
