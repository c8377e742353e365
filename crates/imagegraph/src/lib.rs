//! Read-only view of a HEIF/MIAF container's image derivation graph.
//!
//! The compositor never parses boxes itself. It walks items, tracks and
//! samples through [`ContainerModel`], which a real parser implements and
//! which [`MemoryContainer`] implements for fixtures and JSON-described
//! graphs.
mod container;
mod content;
mod memory;
mod properties;

pub use container::{is_decodable, ContainerModel, ModelError};
pub use content::{select_content, Constraints, Content, Preference, Roles, ALPHA_URN, DEPTH_URN};
pub use memory::{
    ContainerBuilder, ContainerDescription, ImageBody, ImageEntry, MemoryContainer, SampleEntry,
    TrackEntry,
};
pub use properties::{
    Auxiliary, DecoderConfig, FourCc, GridLayout, ImageKind, MirrorAxis, OverlayLayer,
    OverlayLayout, Rational, SampleInfo, Size, TimeStamp, TrackAuxiliary, TransformProperty,
};

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleId(pub u32);

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "image#{}", self.0)
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track#{}", self.0)
    }
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sample#{}", self.0)
    }
}

/// Anything the compositor can be asked to display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Image(ImageId),
    Track(TrackId),
}

impl Source {
    pub fn is_track(&self) -> bool {
        matches!(self, Self::Track(_))
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(id) => id.fmt(f),
            Self::Track(id) => id.fmt(f),
        }
    }
}

impl From<ImageId> for Source {
    fn from(id: ImageId) -> Self {
        Self::Image(id)
    }
}

impl From<TrackId> for Source {
    fn from(id: TrackId) -> Self {
        Self::Track(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_display_names_the_kind() {
        assert_eq!(Source::Image(ImageId(3)).to_string(), "image#3");
        assert_eq!(Source::Track(TrackId(1)).to_string(), "track#1");
    }

    #[test]
    fn sources_with_equal_ids_but_different_kinds_differ() {
        assert_ne!(Source::from(ImageId(1)), Source::from(TrackId(1)));
        assert!(Source::from(TrackId(1)).is_track());
    }
}
