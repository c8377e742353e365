use imagegraph::{DecoderConfig, FourCc, Size};

use crate::DecodeError;

pub const MIME_HEVC: &str = "video/hevc";
pub const MIME_AVC: &str = "video/avc";

/// Format handed to a hardware decoder at configure time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFormat {
    pub mime: &'static str,
    pub width: u32,
    pub height: u32,
    /// Decoder configuration record, passed through as csd-0.
    pub codec_specific_data: Vec<u8>,
}

impl InputFormat {
    pub fn for_config(config: &DecoderConfig, size: Size) -> Result<Self, DecodeError> {
        let mime = match config.codec {
            FourCc::HVC1 => MIME_HEVC,
            FourCc::AVC1 => MIME_AVC,
            other => return Err(DecodeError::UnsupportedCodec(other)),
        };
        Ok(Self {
            mime,
            width: size.width,
            height: size.height,
            codec_specific_data: config.bytes.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_hevc_and_avc_to_mime_types() {
        let hevc = InputFormat::for_config(
            &DecoderConfig::new(FourCc::HVC1, vec![1, 2]),
            Size::new(64, 32),
        )
        .unwrap();
        assert_eq!(hevc.mime, MIME_HEVC);
        assert_eq!(hevc.codec_specific_data, vec![1, 2]);
        assert_eq!((hevc.width, hevc.height), (64, 32));

        let avc =
            InputFormat::for_config(&DecoderConfig::new(FourCc::AVC1, Vec::new()), Size::new(1, 1))
                .unwrap();
        assert_eq!(avc.mime, MIME_AVC);
    }

    #[test]
    fn rejects_codecs_without_hardware_path() {
        let err = InputFormat::for_config(
            &DecoderConfig::new(FourCc::JPEG, Vec::new()),
            Size::new(1, 1),
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedCodec(FourCc::JPEG)));
    }
}
