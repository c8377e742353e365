use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ImageId, SampleId, TrackId};

/// Four-character codec identifier as stored in the item info box.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const HVC1: FourCc = FourCc(*b"hvc1");
    pub const AVC1: FourCc = FourCc(*b"avc1");
    pub const JPEG: FourCc = FourCc(*b"jpeg");
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({self})")
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            let ch = if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '?'
            };
            write!(f, "{ch}")?;
        }
        Ok(())
    }
}

impl TryFrom<String> for FourCc {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let bytes: [u8; 4] = value
            .as_bytes()
            .try_into()
            .map_err(|_| format!("four-character code must be 4 bytes, got '{value}'"))?;
        Ok(FourCc(bytes))
    }
}

impl From<FourCc> for String {
    fn from(value: FourCc) -> Self {
        value.to_string()
    }
}

/// Codec type plus the raw configuration record (hvcC/avcC payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub codec: FourCc,
    #[serde(default)]
    pub bytes: Vec<u8>,
}

impl DecoderConfig {
    pub fn new(codec: FourCc, bytes: Vec<u8>) -> Self {
        Self { codec, bytes }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub numerator: i32,
    pub denominator: i32,
}

impl Rational {
    pub const fn new(numerator: i32, denominator: i32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    pub const fn whole(value: i32) -> Self {
        Self::new(value, 1)
    }

    /// A zero denominator evaluates to zero rather than infinity.
    pub fn as_f32(&self) -> f32 {
        if self.denominator == 0 {
            return 0.0;
        }
        self.numerator as f32 / self.denominator as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorAxis {
    Horizontal,
    Vertical,
}

/// Transformative item properties (irot, imir, clap).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformProperty {
    /// Anticlockwise rotation in degrees; one of 0, 90, 180, 270.
    Rotate { degrees: u16 },
    Mirror { axis: MirrorAxis },
    CleanAperture {
        width: Rational,
        height: Rational,
        horizontal_offset: Rational,
        vertical_offset: Rational,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auxiliary {
    pub image: ImageId,
    pub aux_type: String,
}

/// Auxiliary sequence attached to a track, such as an alpha or depth track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackAuxiliary {
    pub track: TrackId,
    pub aux_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Coded,
    Grid,
    Overlay,
    Identity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridLayout {
    pub columns: u32,
    pub rows: u32,
    /// Row-major, `columns * rows` entries.
    pub cells: Vec<ImageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayLayer {
    pub image: ImageId,
    pub horizontal_offset: i32,
    pub vertical_offset: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayLayout {
    /// RGBA, 16 bits per channel as stored in the iovl box.
    pub background: [i32; 4],
    pub layers: Vec<OverlayLayer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleInfo {
    pub id: SampleId,
    pub dependencies: Vec<SampleId>,
    pub config: DecoderConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeStamp {
    pub sample: SampleId,
    pub time: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_round_trips_through_strings() {
        let parsed = FourCc::try_from("hvc1".to_string()).unwrap();
        assert_eq!(parsed, FourCc::HVC1);
        assert_eq!(String::from(parsed), "hvc1");
        assert!(FourCc::try_from("hev".to_string()).is_err());
    }

    #[test]
    fn rational_with_zero_denominator_is_zero() {
        assert_eq!(Rational::new(5, 0).as_f32(), 0.0);
        assert_eq!(Rational::new(3, 2).as_f32(), 1.5);
    }

    #[test]
    fn transform_properties_use_tagged_json() {
        let json = r#"[
            {"type": "rotate", "degrees": 90},
            {"type": "mirror", "axis": "vertical"}
        ]"#;
        let parsed: Vec<TransformProperty> = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed,
            vec![
                TransformProperty::Rotate { degrees: 90 },
                TransformProperty::Mirror {
                    axis: MirrorAxis::Vertical
                },
            ]
        );
    }
}
