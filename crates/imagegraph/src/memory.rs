//! In-memory container graph.
//!
//! `ContainerDescription` is the serde schema (JSON) for a whole graph:
//! images with their derivation bodies and properties, plus tracks with
//! their samples, the primary item and alternate groups. `MemoryContainer` validates a description once and then
//! answers [`ContainerModel`] queries from it. `ContainerBuilder` produces the
//! same description programmatically.
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::container::{ContainerModel, ModelError};
use crate::properties::{
    Auxiliary, DecoderConfig, GridLayout, ImageKind, OverlayLayer, OverlayLayout, SampleInfo,
    Size, TimeStamp, TrackAuxiliary, TransformProperty,
};
use crate::{ImageId, SampleId, Source, TrackId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerDescription {
    #[serde(default)]
    pub primary: Option<ImageId>,
    #[serde(default)]
    pub images: Vec<ImageEntry>,
    #[serde(default)]
    pub tracks: Vec<TrackEntry>,
    #[serde(default)]
    pub alternate_groups: Vec<Vec<Source>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageEntry {
    pub id: ImageId,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub transforms: Vec<TransformProperty>,
    #[serde(default)]
    pub auxiliaries: Vec<Auxiliary>,
    #[serde(default)]
    pub thumbnails: Vec<ImageId>,
    #[serde(flatten)]
    pub body: ImageBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ImageBody {
    Coded {
        config: DecoderConfig,
        #[serde(default)]
        data: Vec<u8>,
    },
    Grid {
        columns: u32,
        rows: u32,
        cells: Vec<ImageId>,
    },
    Overlay {
        #[serde(default)]
        background: [i32; 4],
        layers: Vec<OverlayLayer>,
    },
    Identity {
        source: ImageId,
    },
}

impl ImageBody {
    fn kind(&self) -> ImageKind {
        match self {
            Self::Coded { .. } => ImageKind::Coded,
            Self::Grid { .. } => ImageKind::Grid,
            Self::Overlay { .. } => ImageKind::Overlay,
            Self::Identity { .. } => ImageKind::Identity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackEntry {
    pub id: TrackId,
    pub width: u32,
    pub height: u32,
    pub config: DecoderConfig,
    #[serde(default)]
    pub transforms: Vec<TransformProperty>,
    /// Total presentation duration; defaults to the last sample's time.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub thumbnails: Vec<TrackId>,
    #[serde(default)]
    pub auxiliaries: Vec<TrackAuxiliary>,
    pub samples: Vec<SampleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleEntry {
    pub id: SampleId,
    pub time_ms: u64,
    #[serde(default)]
    pub dependencies: Vec<SampleId>,
    /// Overrides the track configuration for this sample.
    #[serde(default)]
    pub config: Option<DecoderConfig>,
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct MemoryContainer {
    primary: Option<ImageId>,
    images: BTreeMap<ImageId, ImageEntry>,
    tracks: BTreeMap<TrackId, TrackEntry>,
    alternate_groups: Vec<Vec<Source>>,
}

impl MemoryContainer {
    pub fn builder() -> ContainerBuilder {
        ContainerBuilder::default()
    }

    pub fn from_json_str(input: &str) -> Result<Self, ModelError> {
        let description: ContainerDescription = serde_json::from_str(input)?;
        Self::from_description(description)
    }

    pub fn from_description(description: ContainerDescription) -> Result<Self, ModelError> {
        let mut images = BTreeMap::new();
        for entry in description.images {
            let id = entry.id;
            if images.insert(id, entry).is_some() {
                return Err(ModelError::Invalid(format!("duplicate {id}")));
            }
        }
        let mut tracks = BTreeMap::new();
        for entry in description.tracks {
            let id = entry.id;
            if tracks.insert(id, entry).is_some() {
                return Err(ModelError::Invalid(format!("duplicate {id}")));
            }
        }

        let container = Self {
            primary: description.primary,
            images,
            tracks,
            alternate_groups: description.alternate_groups,
        };
        container.validate()?;
        Ok(container)
    }

    pub fn image_ids(&self) -> impl Iterator<Item = ImageId> + '_ {
        self.images.keys().copied()
    }

    pub fn track_ids(&self) -> impl Iterator<Item = TrackId> + '_ {
        self.tracks.keys().copied()
    }

    fn validate(&self) -> Result<(), ModelError> {
        for entry in self.images.values() {
            let id = entry.id;
            if entry.width == 0 || entry.height == 0 {
                return Err(ModelError::Invalid(format!("{id} has an empty size")));
            }
            match &entry.body {
                ImageBody::Coded { .. } => {}
                ImageBody::Grid {
                    columns,
                    rows,
                    cells,
                } => {
                    if *columns == 0 || *rows == 0 {
                        return Err(ModelError::Invalid(format!(
                            "grid {id} must have at least one row and column"
                        )));
                    }
                    let expected = (*columns as usize) * (*rows as usize);
                    if cells.len() != expected {
                        return Err(ModelError::Invalid(format!(
                            "grid {id} declares {columns}x{rows} cells but lists {}",
                            cells.len()
                        )));
                    }
                    for cell in cells {
                        self.require_image(id, *cell)?;
                    }
                }
                ImageBody::Overlay { layers, .. } => {
                    for layer in layers {
                        self.require_image(id, layer.image)?;
                    }
                }
                ImageBody::Identity { source } => {
                    if *source == id {
                        return Err(ModelError::Invalid(format!(
                            "identity {id} references itself"
                        )));
                    }
                    self.require_image(id, *source)?;
                }
            }
            for aux in &entry.auxiliaries {
                self.require_image(id, aux.image)?;
            }
            for thumbnail in &entry.thumbnails {
                self.require_image(id, *thumbnail)?;
            }
        }

        for track in self.tracks.values() {
            let id = track.id;
            if track.samples.is_empty() {
                return Err(ModelError::Invalid(format!("{id} has no samples")));
            }
            for referenced in track
                .thumbnails
                .iter()
                .chain(track.auxiliaries.iter().map(|aux| &aux.track))
            {
                if !self.tracks.contains_key(referenced) {
                    return Err(ModelError::Invalid(format!(
                        "{id} references unknown {referenced}"
                    )));
                }
            }
            let known: HashSet<SampleId> = track.samples.iter().map(|sample| sample.id).collect();
            if known.len() != track.samples.len() {
                return Err(ModelError::Invalid(format!("{id} repeats a sample id")));
            }
            for sample in &track.samples {
                if let Some(missing) = sample
                    .dependencies
                    .iter()
                    .find(|dependency| !known.contains(dependency))
                {
                    return Err(ModelError::Invalid(format!(
                        "{} in {id} depends on unknown {missing}",
                        sample.id
                    )));
                }
            }
        }

        if let Some(primary) = self.primary {
            if !self.images.contains_key(&primary) {
                return Err(ModelError::Invalid(format!("primary {primary} is not an image")));
            }
        }
        for member in self.alternate_groups.iter().flatten() {
            let known = match member {
                Source::Image(image) => self.images.contains_key(image),
                Source::Track(track) => self.tracks.contains_key(track),
            };
            if !known {
                return Err(ModelError::Invalid(format!(
                    "alternate group lists unknown {member}"
                )));
            }
        }

        Ok(())
    }

    fn require_image(&self, owner: ImageId, referenced: ImageId) -> Result<(), ModelError> {
        if self.images.contains_key(&referenced) {
            Ok(())
        } else {
            Err(ModelError::Invalid(format!(
                "{owner} references unknown {referenced}"
            )))
        }
    }

    fn image(&self, id: ImageId) -> Result<&ImageEntry, ModelError> {
        self.images.get(&id).ok_or(ModelError::UnknownImage(id))
    }

    fn track(&self, id: TrackId) -> Result<&TrackEntry, ModelError> {
        self.tracks.get(&id).ok_or(ModelError::UnknownTrack(id))
    }

    fn wrong_kind(entry: &ImageEntry, expected: ImageKind) -> ModelError {
        ModelError::WrongKind {
            image: entry.id,
            expected,
            actual: entry.body.kind(),
        }
    }
}

impl ContainerModel for MemoryContainer {
    fn image_kind(&self, image: ImageId) -> Result<ImageKind, ModelError> {
        Ok(self.image(image)?.body.kind())
    }

    fn image_size(&self, image: ImageId) -> Result<Size, ModelError> {
        let entry = self.image(image)?;
        Ok(Size::new(entry.width, entry.height))
    }

    fn decoder_config(&self, image: ImageId) -> Result<DecoderConfig, ModelError> {
        let entry = self.image(image)?;
        match &entry.body {
            ImageBody::Coded { config, .. } => Ok(config.clone()),
            _ => Err(Self::wrong_kind(entry, ImageKind::Coded)),
        }
    }

    fn item_data(&self, image: ImageId) -> Result<Vec<u8>, ModelError> {
        let entry = self.image(image)?;
        match &entry.body {
            ImageBody::Coded { data, .. } => Ok(data.clone()),
            _ => Err(Self::wrong_kind(entry, ImageKind::Coded)),
        }
    }

    fn transforms(&self, image: ImageId) -> Result<Vec<TransformProperty>, ModelError> {
        Ok(self.image(image)?.transforms.clone())
    }

    fn auxiliaries(&self, image: ImageId) -> Result<Vec<Auxiliary>, ModelError> {
        Ok(self.image(image)?.auxiliaries.clone())
    }

    fn grid(&self, image: ImageId) -> Result<GridLayout, ModelError> {
        let entry = self.image(image)?;
        match &entry.body {
            ImageBody::Grid {
                columns,
                rows,
                cells,
            } => Ok(GridLayout {
                columns: *columns,
                rows: *rows,
                cells: cells.clone(),
            }),
            _ => Err(Self::wrong_kind(entry, ImageKind::Grid)),
        }
    }

    fn overlay(&self, image: ImageId) -> Result<OverlayLayout, ModelError> {
        let entry = self.image(image)?;
        match &entry.body {
            ImageBody::Overlay { background, layers } => Ok(OverlayLayout {
                background: *background,
                layers: layers.clone(),
            }),
            _ => Err(Self::wrong_kind(entry, ImageKind::Overlay)),
        }
    }

    fn identity_source(&self, image: ImageId) -> Result<ImageId, ModelError> {
        let entry = self.image(image)?;
        match &entry.body {
            ImageBody::Identity { source } => Ok(*source),
            _ => Err(Self::wrong_kind(entry, ImageKind::Identity)),
        }
    }

    fn track_size(&self, track: TrackId) -> Result<Size, ModelError> {
        let entry = self.track(track)?;
        Ok(Size::new(entry.width, entry.height))
    }

    fn track_transforms(&self, track: TrackId) -> Result<Vec<TransformProperty>, ModelError> {
        Ok(self.track(track)?.transforms.clone())
    }

    fn samples(&self, track: TrackId) -> Result<Vec<SampleInfo>, ModelError> {
        let entry = self.track(track)?;
        Ok(entry
            .samples
            .iter()
            .map(|sample| SampleInfo {
                id: sample.id,
                dependencies: sample.dependencies.clone(),
                config: sample.config.clone().unwrap_or_else(|| entry.config.clone()),
            })
            .collect())
    }

    fn sample_data(&self, track: TrackId, sample: SampleId) -> Result<Vec<u8>, ModelError> {
        self.track(track)?
            .samples
            .iter()
            .find(|entry| entry.id == sample)
            .map(|entry| entry.data.clone())
            .ok_or(ModelError::UnknownSample { track, sample })
    }

    fn timestamps(&self, track: TrackId) -> Result<Vec<TimeStamp>, ModelError> {
        let mut stamps: Vec<TimeStamp> = self
            .track(track)?
            .samples
            .iter()
            .map(|sample| TimeStamp {
                sample: sample.id,
                time: Duration::from_millis(sample.time_ms),
            })
            .collect();
        stamps.sort_by_key(|stamp| stamp.time);
        Ok(stamps)
    }

    fn track_duration(&self, track: TrackId) -> Result<Duration, ModelError> {
        let entry = self.track(track)?;
        let last = entry
            .samples
            .iter()
            .map(|sample| sample.time_ms)
            .max()
            .unwrap_or(0);
        Ok(Duration::from_millis(entry.duration_ms.unwrap_or(last)))
    }

    fn primary_image(&self) -> Option<ImageId> {
        self.primary
    }

    fn tracks(&self) -> Vec<TrackId> {
        self.tracks.keys().copied().collect()
    }

    fn alternate_groups(&self) -> Vec<Vec<Source>> {
        self.alternate_groups.clone()
    }

    fn thumbnails(&self, image: ImageId) -> Result<Vec<ImageId>, ModelError> {
        Ok(self.image(image)?.thumbnails.clone())
    }

    fn track_thumbnails(&self, track: TrackId) -> Result<Vec<TrackId>, ModelError> {
        Ok(self.track(track)?.thumbnails.clone())
    }

    fn track_auxiliaries(&self, track: TrackId) -> Result<Vec<TrackAuxiliary>, ModelError> {
        Ok(self.track(track)?.auxiliaries.clone())
    }
}

/// Programmatic construction of a [`ContainerDescription`].
#[derive(Debug, Default)]
pub struct ContainerBuilder {
    description: ContainerDescription,
}

impl ContainerBuilder {
    pub fn coded(
        &mut self,
        id: ImageId,
        size: Size,
        config: DecoderConfig,
        data: Vec<u8>,
    ) -> &mut Self {
        self.image(id, size, ImageBody::Coded { config, data })
    }

    pub fn grid(
        &mut self,
        id: ImageId,
        size: Size,
        columns: u32,
        rows: u32,
        cells: Vec<ImageId>,
    ) -> &mut Self {
        self.image(
            id,
            size,
            ImageBody::Grid {
                columns,
                rows,
                cells,
            },
        )
    }

    pub fn overlay(
        &mut self,
        id: ImageId,
        size: Size,
        background: [i32; 4],
        layers: Vec<OverlayLayer>,
    ) -> &mut Self {
        self.image(id, size, ImageBody::Overlay { background, layers })
    }

    pub fn identity(&mut self, id: ImageId, size: Size, source: ImageId) -> &mut Self {
        self.image(id, size, ImageBody::Identity { source })
    }

    /// Appends a transform to an image added earlier. Unknown ids are ignored.
    pub fn transform(&mut self, id: ImageId, property: TransformProperty) -> &mut Self {
        if let Some(entry) = self.entry_mut(id) {
            entry.transforms.push(property);
        }
        self
    }

    pub fn auxiliary(&mut self, id: ImageId, image: ImageId, aux_type: &str) -> &mut Self {
        if let Some(entry) = self.entry_mut(id) {
            entry.auxiliaries.push(Auxiliary {
                image,
                aux_type: aux_type.to_string(),
            });
        }
        self
    }

    pub fn track(&mut self, track: TrackEntry) -> &mut Self {
        self.description.tracks.push(track);
        self
    }

    pub fn primary(&mut self, id: ImageId) -> &mut Self {
        self.description.primary = Some(id);
        self
    }

    /// Records `thumbnail` as a thumbnail of the image `id` added earlier.
    pub fn thumbnail(&mut self, id: ImageId, thumbnail: ImageId) -> &mut Self {
        if let Some(entry) = self.entry_mut(id) {
            entry.thumbnails.push(thumbnail);
        }
        self
    }

    pub fn alternates(&mut self, members: Vec<Source>) -> &mut Self {
        self.description.alternate_groups.push(members);
        self
    }

    pub fn build(&self) -> Result<MemoryContainer, ModelError> {
        MemoryContainer::from_description(self.description.clone())
    }

    fn image(&mut self, id: ImageId, size: Size, body: ImageBody) -> &mut Self {
        self.description.images.push(ImageEntry {
            id,
            width: size.width,
            height: size.height,
            transforms: Vec::new(),
            auxiliaries: Vec::new(),
            thumbnails: Vec::new(),
            body,
        });
        self
    }

    fn entry_mut(&mut self, id: ImageId) -> Option<&mut ImageEntry> {
        self.description
            .images
            .iter_mut()
            .rev()
            .find(|entry| entry.id == id)
    }
}
