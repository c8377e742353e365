//! Texture-coordinate derivation for an image's quad.
//!
//! Transformative properties are applied rotation first, then mirror, then
//! the clean-aperture crop, whatever order the container declares them in.
//! Each (mirror, rotation) pair selects one of eight orientation cases whose
//! corner formulas work on the unrotated pixel size; without a crop the full
//! post-rotation aperture is used.
use imagegraph::{MirrorAxis, Size, TransformProperty};

use crate::gpu::{QuadVertex, QuadVertices};
use crate::types::Zoom;

/// Pixel-space texture corners ordered top-left, top-right, bottom-left,
/// bottom-right.
pub type Corners = [[f32; 2]; 4];

/// Orientation case per mirror state (none, horizontal, vertical) and
/// rotation (0, 90, 180, 270).
const ORIENTATION_CASES: [[u8; 4]; 3] = [[1, 2, 3, 4], [6, 7, 5, 8], [5, 8, 6, 7]];

/// Corner indices for the two triangles: bottom-left, bottom-right,
/// top-left, bottom-right, top-right, top-left.
const TRIANGLE_CORNERS: [usize; 6] = [2, 3, 0, 3, 1, 0];

const CLIP_CORNERS: [[f32; 2]; 4] = [[-1.0, 1.0], [1.0, 1.0], [-1.0, -1.0], [1.0, -1.0]];

/// Crop rectangle in pixels of the rotated image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aperture {
    pub width: f32,
    pub height: f32,
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Orientation {
    /// Anticlockwise degrees, one of 0, 90, 180, 270.
    pub rotation: u16,
    pub mirror: Option<MirrorAxis>,
    pub aperture: Option<Aperture>,
}

impl Orientation {
    /// Later properties of the same type override earlier ones.
    pub fn from_properties(properties: &[TransformProperty]) -> Self {
        let mut orientation = Self::default();
        for property in properties {
            match *property {
                TransformProperty::Rotate { degrees } => match degrees % 360 {
                    rotation @ (0 | 90 | 180 | 270) => orientation.rotation = rotation,
                    _ => tracing::warn!(degrees, "ignoring rotation that is not a right angle"),
                },
                TransformProperty::Mirror { axis } => orientation.mirror = Some(axis),
                TransformProperty::CleanAperture {
                    width,
                    height,
                    horizontal_offset,
                    vertical_offset,
                } => {
                    orientation.aperture = Some(Aperture {
                        width: width.as_f32(),
                        height: height.as_f32(),
                        x: horizontal_offset.as_f32(),
                        y: vertical_offset.as_f32(),
                    })
                }
            }
        }
        orientation
    }

    pub fn swaps_axes(&self) -> bool {
        matches!(self.rotation, 90 | 270)
    }

    /// The orientation case, 1 to 8.
    pub fn case(&self) -> u8 {
        let row = match self.mirror {
            None => 0,
            Some(MirrorAxis::Horizontal) => 1,
            Some(MirrorAxis::Vertical) => 2,
        };
        let column = match self.rotation {
            90 => 1,
            180 => 2,
            270 => 3,
            _ => 0,
        };
        ORIENTATION_CASES[row][column]
    }

    /// Displayed size: the crop if there is one, otherwise the rotated size.
    pub fn render_size(&self, size: Size) -> (f32, f32) {
        match self.aperture {
            Some(aperture) => (aperture.width, aperture.height),
            None => self.rotated(size),
        }
    }

    pub fn corners(&self, size: Size) -> Corners {
        let tw = size.width as f32;
        let th = size.height as f32;
        let (rw, rh) = self.rotated(size);
        let Aperture {
            width: dw,
            height: dh,
            x: dx,
            y: dy,
        } = self.aperture.unwrap_or(Aperture {
            width: rw,
            height: rh,
            x: 0.0,
            y: 0.0,
        });
        match self.case() {
            2 => [
                [tw - dy, dx],
                [tw - dy, dx + dw],
                [tw - dh - dy, dx],
                [tw - dh - dy, dx + dw],
            ],
            3 => [
                [tw - dx, th - dy],
                [tw - dw - dx, th - dy],
                [tw - dx, th - dh - dy],
                [tw - dw - dx, th - dh - dy],
            ],
            4 => [
                [dy, th - dx],
                [dy, th - dw - dx],
                [dh + dy, th - dx],
                [dh + dy, th - dw - dx],
            ],
            5 => [
                [dx, th - dy],
                [dx + dw, th - dy],
                [dx, th - dy - dh],
                [dx + dw, th - dy - dh],
            ],
            6 => [
                [tw - dx, dy],
                [tw - dx - dw, dy],
                [tw - dx, dy + dh],
                [tw - dx - dw, dy + dh],
            ],
            7 => [
                [tw - dy, th - dx],
                [tw - dy, th - dx - dw],
                [tw - dh - dy, th - dx],
                [tw - dh - dy, th - dx - dw],
            ],
            8 => [
                [dy, dx],
                [dy, dx + dw],
                [dh + dy, dx],
                [dh + dy, dx + dw],
            ],
            _ => [
                [dx, dy],
                [dx + dw, dy],
                [dx, dy + dh],
                [dx + dw, dy + dh],
            ],
        }
    }

    fn rotated(&self, size: Size) -> (f32, f32) {
        if self.swaps_axes() {
            (size.height as f32, size.width as f32)
        } else {
            (size.width as f32, size.height as f32)
        }
    }
}

/// Pixel corners to texel-centred texture coordinates with `v` pointing up.
pub fn normalize(corners: Corners, size: Size) -> Corners {
    let tw = size.width.max(1) as f32;
    let th = size.height.max(1) as f32;
    corners.map(|[x, y]| {
        let u = x / (tw + 1.0) + 0.5 / tw;
        let v = y / (th + 1.0) + 0.5 / th;
        [u, 1.0 - v]
    })
}

/// Restricts `uv` to the zoom window by bilinear interpolation between its
/// corners. The identity zoom and non-positive factors leave `uv` as is.
pub fn apply_zoom(uv: Corners, zoom: Zoom) -> Corners {
    if zoom.is_identity() || zoom.factor <= 0.0 {
        return uv;
    }
    let extent = 1.0 / zoom.factor;
    let left = zoom.center.0 - extent / 2.0;
    let top = zoom.center.1 - extent / 2.0;
    let window = [
        [left, top],
        [left + extent, top],
        [left, top + extent],
        [left + extent, top + extent],
    ];
    let [tl, tr, bl, br] = uv;
    window.map(|[s, t]| {
        let mut out = [0.0; 2];
        for (axis, value) in out.iter_mut().enumerate() {
            let upper = tl[axis] + (tr[axis] - tl[axis]) * s;
            let lower = bl[axis] + (br[axis] - bl[axis]) * s;
            *value = upper + (lower - upper) * t;
        }
        out
    })
}

pub fn quad_vertices(uv: Corners) -> QuadVertices {
    TRIANGLE_CORNERS.map(|corner| QuadVertex {
        position: CLIP_CORNERS[corner],
        uv: uv[corner],
    })
}

/// Vertices for an image of `size` with its transforms and the zoom window.
pub fn image_quad(size: Size, orientation: &Orientation, zoom: Zoom) -> QuadVertices {
    let uv = normalize(orientation.corners(size), size);
    quad_vertices(apply_zoom(uv, zoom))
}

#[cfg(test)]
mod tests {
    use super::*;
    use imagegraph::Rational;

    const ROTATIONS: [u16; 4] = [0, 90, 180, 270];
    const MIRRORS: [Option<MirrorAxis>; 3] =
        [None, Some(MirrorAxis::Horizontal), Some(MirrorAxis::Vertical)];

    /// Derives corners by permuting the unit quad step by step.
    fn permuted(size: Size, rotation: u16, mirror: Option<MirrorAxis>) -> Corners {
        let (tw, th) = (size.width as f32, size.height as f32);
        let mut c = [[0.0, 0.0], [tw, 0.0], [0.0, th], [tw, th]];
        if matches!(rotation, 90 | 270) {
            c = [c[1], c[3], c[0], c[2]];
        }
        if matches!(rotation, 180 | 270) {
            c = [c[3], c[2], c[1], c[0]];
        }
        match mirror {
            Some(MirrorAxis::Horizontal) => c = [c[1], c[0], c[3], c[2]],
            Some(MirrorAxis::Vertical) => c = [c[2], c[3], c[0], c[1]],
            None => {}
        }
        c
    }

    fn orientation(rotation: u16, mirror: Option<MirrorAxis>) -> Orientation {
        Orientation {
            rotation,
            mirror,
            aperture: None,
        }
    }

    #[test]
    fn case_table_matches_every_rotation_and_mirror() {
        let expected = [
            [1, 2, 3, 4], // none
            [6, 7, 5, 8], // horizontal
            [5, 8, 6, 7], // vertical
        ];
        for (row, mirror) in MIRRORS.iter().enumerate() {
            for (column, rotation) in ROTATIONS.iter().enumerate() {
                assert_eq!(orientation(*rotation, *mirror).case(), expected[row][column]);
            }
        }
    }

    #[test]
    fn uncropped_corners_match_stepwise_permutation() {
        let size = Size::new(40, 30);
        for mirror in MIRRORS {
            for rotation in ROTATIONS {
                assert_eq!(
                    orientation(rotation, mirror).corners(size),
                    permuted(size, rotation, mirror),
                    "rotation {rotation} mirror {mirror:?}"
                );
            }
        }
    }

    #[test]
    fn crop_offsets_follow_orientation_case() {
        let size = Size::new(100, 50);
        let aperture = Some(Aperture {
            width: 20.0,
            height: 10.0,
            x: 5.0,
            y: 3.0,
        });
        let cropped = |rotation, mirror| Orientation {
            rotation,
            mirror,
            aperture,
        };
        assert_eq!(
            cropped(0, None).corners(size),
            [[5.0, 3.0], [25.0, 3.0], [5.0, 13.0], [25.0, 13.0]]
        );
        assert_eq!(
            cropped(90, None).corners(size),
            [[97.0, 5.0], [97.0, 25.0], [87.0, 5.0], [87.0, 25.0]]
        );
        assert_eq!(
            cropped(180, Some(MirrorAxis::Horizontal)).corners(size),
            [[5.0, 47.0], [25.0, 47.0], [5.0, 37.0], [25.0, 37.0]]
        );
        assert_eq!(
            cropped(270, Some(MirrorAxis::Vertical)).corners(size),
            [[97.0, 45.0], [97.0, 25.0], [87.0, 45.0], [87.0, 25.0]]
        );
        assert_eq!(cropped(90, None).render_size(size), (20.0, 10.0));
    }

    #[test]
    fn properties_apply_canonically_and_last_wins() {
        let properties = [
            TransformProperty::Mirror {
                axis: MirrorAxis::Vertical,
            },
            TransformProperty::Rotate { degrees: 90 },
            TransformProperty::Rotate { degrees: 450 },
            TransformProperty::CleanAperture {
                width: Rational::new(3, 2),
                height: Rational::whole(4),
                horizontal_offset: Rational::new(1, 0),
                vertical_offset: Rational::whole(0),
            },
        ];
        let parsed = Orientation::from_properties(&properties);
        assert_eq!(parsed.rotation, 90);
        assert_eq!(parsed.mirror, Some(MirrorAxis::Vertical));
        assert_eq!(
            parsed.aperture,
            Some(Aperture {
                width: 1.5,
                height: 4.0,
                x: 0.0,
                y: 0.0,
            })
        );
        assert_eq!(parsed.case(), 8);

        let skewed = Orientation::from_properties(&[TransformProperty::Rotate { degrees: 45 }]);
        assert_eq!(skewed.rotation, 0);
    }

    #[test]
    fn rotation_swaps_render_size() {
        let size = Size::new(64, 32);
        assert_eq!(orientation(90, None).render_size(size), (32.0, 64.0));
        assert_eq!(orientation(180, None).render_size(size), (64.0, 32.0));
    }

    #[test]
    fn normalisation_offsets_to_texel_centres() {
        let size = Size::new(3, 1);
        let uv = normalize([[0.0, 0.0], [3.0, 0.0], [0.0, 1.0], [3.0, 1.0]], size);
        let half = 0.5 / 3.0;
        assert_eq!(uv[0], [half, 1.0 - 0.5]);
        assert_eq!(uv[1], [3.0 / 4.0 + half, 1.0 - 0.5]);
        assert_eq!(uv[3], [3.0 / 4.0 + half, 1.0 - (1.0 / 2.0 + 0.5)]);
    }

    #[test]
    fn quad_uses_two_triangles_over_clip_space() {
        let uv = [[0.0, 1.0], [1.0, 1.0], [0.0, 0.0], [1.0, 0.0]];
        let vertices = quad_vertices(uv);
        let positions: Vec<_> = vertices.iter().map(|vertex| vertex.position).collect();
        assert_eq!(
            positions,
            vec![
                [-1.0, -1.0],
                [1.0, -1.0],
                [-1.0, 1.0],
                [1.0, -1.0],
                [1.0, 1.0],
                [-1.0, 1.0]
            ]
        );
        assert_eq!(vertices[4].uv, [1.0, 1.0]);
        assert_eq!(vertices[0].uv, [0.0, 0.0]);
    }

    #[test]
    fn zoom_selects_window_of_derived_coordinates() {
        let uv = [[0.0, 1.0], [1.0, 1.0], [0.0, 0.0], [1.0, 0.0]];
        assert_eq!(apply_zoom(uv, Zoom::NONE), uv);
        assert_eq!(apply_zoom(uv, Zoom::new((0.5, 0.5), 0.0)), uv);

        let zoomed = apply_zoom(uv, Zoom::new((0.25, 0.25), 2.0));
        assert_eq!(zoomed, [[0.0, 1.0], [0.5, 1.0], [0.0, 0.5], [0.5, 0.5]]);
    }

    #[test]
    fn zoom_follows_rotated_coordinates() {
        // Rotated quad: the top-left corner samples the top-right texel.
        let uv = [[1.0, 1.0], [1.0, 0.0], [0.0, 1.0], [0.0, 0.0]];
        let zoomed = apply_zoom(uv, Zoom::new((0.25, 0.25), 2.0));
        assert_eq!(zoomed[0], [1.0, 1.0]);
        assert_eq!(zoomed[3], [0.5, 0.5]);
    }
}
