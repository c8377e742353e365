//! Choosing what to show from a MIAF file.
//!
//! [`select_content`] starts from the primary item, swaps it for a member of
//! its alternate group when the caller's preference or size limits ask for
//! it, and then collects the thumbnails and auxiliary planes the requested
//! [`Roles`] name.
use crate::container::{is_decodable, ContainerModel, ModelError};
use crate::properties::{FourCc, Size};
use crate::{ImageId, Source, TrackId};

pub const ALPHA_URN: &str = "urn:mpeg:mpegB:cicp:systems:auxiliary:alpha";
pub const DEPTH_URN: &str = "urn:mpeg:mpegB:cicp:systems:auxiliary:depth";

/// Which kind of entity the caller would rather display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Preference {
    Image,
    Track,
    #[default]
    Any,
}

impl Preference {
    fn accepts(self, source: Source) -> bool {
        match self {
            Self::Image => !source.is_track(),
            Self::Track => source.is_track(),
            Self::Any => true,
        }
    }
}

/// Size limits and preference for [`select_content`]. `None` means no limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Constraints {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub preference: Preference,
}

impl Constraints {
    pub fn fits(&self, size: Size) -> bool {
        self.max_width.map_or(true, |max| size.width <= max)
            && self.max_height.map_or(true, |max| size.height <= max)
    }
}

/// The parts of the chosen entity to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Roles {
    pub master: bool,
    pub thumbnails: bool,
    pub alpha: bool,
    pub depth: bool,
}

impl Roles {
    pub const ALL: Roles = Roles {
        master: true,
        thumbnails: true,
        alpha: true,
        depth: true,
    };
    pub const MASTER: Roles = Roles {
        master: true,
        thumbnails: false,
        alpha: false,
        depth: false,
    };
    pub const AUXILIARIES: Roles = Roles {
        master: false,
        thumbnails: false,
        alpha: true,
        depth: true,
    };

    pub fn union(self, other: Roles) -> Roles {
        Roles {
            master: self.master || other.master,
            thumbnails: self.thumbnails || other.thumbnails,
            alpha: self.alpha || other.alpha,
            depth: self.depth || other.depth,
        }
    }

    fn wants_auxiliary(&self, aux_type: &str) -> bool {
        (self.alpha && aux_type == ALPHA_URN) || (self.depth && aux_type == DEPTH_URN)
    }
}

/// Result of [`select_content`]. Lists hold images for an image seed and
/// tracks for a track seed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Content {
    pub master: Option<Source>,
    pub thumbnails: Vec<Source>,
    pub auxiliaries: Vec<Source>,
}

/// Picks the entity to display and its companions.
///
/// Without an alternate group around the primary item, the primary item is
/// used as is unless tracks are preferred, in which case the first track
/// that fits and decodes wins. With a group, the first member of the
/// preferred kind that fits and decodes wins. `Ok(None)` when nothing
/// qualifies. `supported` decides which codecs count as decodable.
pub fn select_content(
    model: &dyn ContainerModel,
    constraints: &Constraints,
    roles: Roles,
    supported: impl Fn(FourCc) -> bool,
) -> Result<Option<Content>, ModelError> {
    let primary = model.primary_image().ok_or(ModelError::NoPrimaryImage)?;
    let seed = match alternates_of(model, Source::Image(primary)) {
        None if constraints.preference != Preference::Track => Some(Source::Image(primary)),
        None => first_fitting(
            model,
            model.tracks().into_iter().map(Source::Track),
            constraints,
            &supported,
        )?,
        Some(group) => first_fitting(
            model,
            group
                .into_iter()
                .filter(|member| constraints.preference.accepts(*member)),
            constraints,
            &supported,
        )?,
    };

    let Some(seed) = seed else {
        tracing::debug!(?constraints, "no content satisfies the constraints");
        return Ok(None);
    };
    let content = match seed {
        Source::Image(image) => image_content(model, image, roles)?,
        Source::Track(track) => track_content(model, track, roles, &supported)?,
    };
    tracing::debug!(%seed, ?content, "selected content");
    Ok(Some(content))
}

fn alternates_of(model: &dyn ContainerModel, source: Source) -> Option<Vec<Source>> {
    model
        .alternate_groups()
        .into_iter()
        .find(|group| group.contains(&source))
}

fn first_fitting(
    model: &dyn ContainerModel,
    candidates: impl IntoIterator<Item = Source>,
    constraints: &Constraints,
    supported: &impl Fn(FourCc) -> bool,
) -> Result<Option<Source>, ModelError> {
    for candidate in candidates {
        if constraints.fits(model.source_size(candidate)?)
            && source_decodable(model, candidate, supported)?
        {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

/// Tracks are judged by the configuration of their first sample.
fn source_decodable(
    model: &dyn ContainerModel,
    source: Source,
    supported: &impl Fn(FourCc) -> bool,
) -> Result<bool, ModelError> {
    match source {
        Source::Image(image) => is_decodable(model, image, supported),
        Source::Track(track) => Ok(model
            .samples(track)?
            .first()
            .is_some_and(|sample| supported(sample.config.codec))),
    }
}

fn image_content(
    model: &dyn ContainerModel,
    image: ImageId,
    roles: Roles,
) -> Result<Content, ModelError> {
    let mut content = Content::default();
    if roles.master {
        content.master = Some(Source::Image(image));
    }
    if roles.thumbnails {
        content.thumbnails = model
            .thumbnails(image)?
            .into_iter()
            .map(Source::Image)
            .collect();
    }
    if roles.alpha || roles.depth {
        content.auxiliaries = model
            .auxiliaries(image)?
            .into_iter()
            .filter(|aux| roles.wants_auxiliary(&aux.aux_type))
            .map(|aux| Source::Image(aux.image))
            .collect();
    }
    Ok(content)
}

/// An auxiliary track that cannot be decoded is replaced by every decodable
/// track in its alternate group.
fn track_content(
    model: &dyn ContainerModel,
    track: TrackId,
    roles: Roles,
    supported: &impl Fn(FourCc) -> bool,
) -> Result<Content, ModelError> {
    let mut content = Content::default();
    if roles.master {
        content.master = Some(Source::Track(track));
    }
    if roles.thumbnails {
        content.thumbnails = model
            .track_thumbnails(track)?
            .into_iter()
            .map(Source::Track)
            .collect();
    }
    for aux in model.track_auxiliaries(track)? {
        if !roles.wants_auxiliary(&aux.aux_type) {
            continue;
        }
        let source = Source::Track(aux.track);
        if source_decodable(model, source, supported)? {
            content.auxiliaries.push(source);
            continue;
        }
        for alternative in alternates_of(model, source).unwrap_or_default() {
            if alternative.is_track() && source_decodable(model, alternative, supported)? {
                content.auxiliaries.push(alternative);
            }
        }
    }
    Ok(content)
}
