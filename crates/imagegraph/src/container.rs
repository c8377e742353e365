use std::collections::HashSet;
use std::time::Duration;

use crate::properties::{
    Auxiliary, DecoderConfig, FourCc, GridLayout, ImageKind, OverlayLayout, SampleInfo, Size,
    TimeStamp, TrackAuxiliary, TransformProperty,
};
use crate::{ImageId, SampleId, Source, TrackId};

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("{0} not found")]
    UnknownImage(ImageId),
    #[error("{0} not found")]
    UnknownTrack(TrackId),
    #[error("{sample} not found in {track}")]
    UnknownSample { track: TrackId, sample: SampleId },
    #[error("{image} is a {actual:?} item, expected {expected:?}")]
    WrongKind {
        image: ImageId,
        expected: ImageKind,
        actual: ImageKind,
    },
    #[error("container has no primary image")]
    NoPrimaryImage,
    #[error("invalid container description: {0}")]
    Invalid(String),
    #[error("failed to parse container description: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Queries the compositor issues against a parsed container.
///
/// Implementations must be cheap to call repeatedly; nodes re-query on every
/// content refresh rather than caching model state.
pub trait ContainerModel: Send + Sync {
    fn image_kind(&self, image: ImageId) -> Result<ImageKind, ModelError>;
    fn image_size(&self, image: ImageId) -> Result<Size, ModelError>;
    fn decoder_config(&self, image: ImageId) -> Result<DecoderConfig, ModelError>;
    fn item_data(&self, image: ImageId) -> Result<Vec<u8>, ModelError>;
    fn transforms(&self, image: ImageId) -> Result<Vec<TransformProperty>, ModelError>;
    fn auxiliaries(&self, image: ImageId) -> Result<Vec<Auxiliary>, ModelError>;
    fn grid(&self, image: ImageId) -> Result<GridLayout, ModelError>;
    fn overlay(&self, image: ImageId) -> Result<OverlayLayout, ModelError>;
    fn identity_source(&self, image: ImageId) -> Result<ImageId, ModelError>;

    fn track_size(&self, track: TrackId) -> Result<Size, ModelError>;
    fn track_transforms(&self, track: TrackId) -> Result<Vec<TransformProperty>, ModelError>;
    fn samples(&self, track: TrackId) -> Result<Vec<SampleInfo>, ModelError>;
    fn sample_data(&self, track: TrackId, sample: SampleId) -> Result<Vec<u8>, ModelError>;
    fn timestamps(&self, track: TrackId) -> Result<Vec<TimeStamp>, ModelError>;
    fn track_duration(&self, track: TrackId) -> Result<Duration, ModelError>;

    /// The item a reader shows when nothing else is asked for.
    fn primary_image(&self) -> Option<ImageId> {
        None
    }

    fn tracks(&self) -> Vec<TrackId> {
        Vec::new()
    }

    /// Alternate entity groups; members of one group are interchangeable
    /// renditions of the same content, in declaration order.
    fn alternate_groups(&self) -> Vec<Vec<Source>> {
        Vec::new()
    }

    fn thumbnails(&self, _image: ImageId) -> Result<Vec<ImageId>, ModelError> {
        Ok(Vec::new())
    }

    fn track_thumbnails(&self, _track: TrackId) -> Result<Vec<TrackId>, ModelError> {
        Ok(Vec::new())
    }

    fn track_auxiliaries(&self, _track: TrackId) -> Result<Vec<TrackAuxiliary>, ModelError> {
        Ok(Vec::new())
    }

    fn sample(&self, track: TrackId, sample: SampleId) -> Result<SampleInfo, ModelError> {
        self.samples(track)?
            .into_iter()
            .find(|info| info.id == sample)
            .ok_or(ModelError::UnknownSample { track, sample })
    }

    fn source_size(&self, source: Source) -> Result<Size, ModelError> {
        match source {
            Source::Image(image) => self.image_size(image),
            Source::Track(track) => self.track_size(track),
        }
    }

    fn source_transforms(&self, source: Source) -> Result<Vec<TransformProperty>, ModelError> {
        match source {
            Source::Image(image) => self.transforms(image),
            Source::Track(track) => self.track_transforms(track),
        }
    }
}

/// Walks the derivation graph below `image` and reports whether every coded
/// leaf (including alpha auxiliaries) uses a codec accepted by `supported`.
pub fn is_decodable(
    model: &dyn ContainerModel,
    image: ImageId,
    supported: impl Fn(FourCc) -> bool,
) -> Result<bool, ModelError> {
    let mut visited = HashSet::new();
    let mut pending = vec![image];
    while let Some(current) = pending.pop() {
        if !visited.insert(current) {
            continue;
        }
        match model.image_kind(current)? {
            ImageKind::Coded => {
                if !supported(model.decoder_config(current)?.codec) {
                    return Ok(false);
                }
            }
            ImageKind::Grid => pending.extend(model.grid(current)?.cells),
            ImageKind::Overlay => {
                pending.extend(model.overlay(current)?.layers.iter().map(|layer| layer.image))
            }
            ImageKind::Identity => pending.push(model.identity_source(current)?),
        }
        pending.extend(model.auxiliaries(current)?.into_iter().map(|aux| aux.image));
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryContainer;

    fn grid_of(codecs: [FourCc; 2]) -> MemoryContainer {
        let mut builder = MemoryContainer::builder();
        let cell = Size::new(64, 64);
        builder
            .coded(ImageId(1), cell, DecoderConfig::new(codecs[0], Vec::new()), Vec::new())
            .coded(ImageId(2), cell, DecoderConfig::new(codecs[1], Vec::new()), Vec::new())
            .grid(ImageId(3), Size::new(128, 64), 2, 1, vec![ImageId(1), ImageId(2)]);
        builder.build().unwrap()
    }

    #[test]
    fn grid_of_supported_codecs_is_decodable() {
        let model = grid_of([FourCc::HVC1, FourCc::HVC1]);
        assert!(is_decodable(&model, ImageId(3), |codec| codec == FourCc::HVC1).unwrap());
    }

    #[test]
    fn single_unsupported_cell_makes_grid_undecodable() {
        let model = grid_of([FourCc::HVC1, FourCc(*b"av01")]);
        assert!(!is_decodable(&model, ImageId(3), |codec| codec == FourCc::HVC1).unwrap());
    }

    #[test]
    fn sample_lookup_reports_unknown_sample() {
        let model = grid_of([FourCc::HVC1, FourCc::HVC1]);
        let err = model.sample(TrackId(9), SampleId(0)).unwrap_err();
        assert!(matches!(err, ModelError::UnknownTrack(TrackId(9))));
    }
}
