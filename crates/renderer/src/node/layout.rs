use imagegraph::{OverlayLayer, Size};

use crate::types::{saturating_i32, Rect};

/// Row-major cells of a `columns` x `rows` grid over a target of `size`.
/// Every cell is `size / (columns, rows)`; a remainder stays uncovered.
pub fn grid_cells(size: Size, columns: u32, rows: u32) -> Vec<Rect> {
    if columns == 0 || rows == 0 {
        return Vec::new();
    }
    let width = saturating_i32(size.width / columns);
    let height = saturating_i32(size.height / rows);
    (0..columns * rows)
        .map(|index| {
            let column = saturating_i32(index % columns);
            let row = saturating_i32(index / columns);
            Rect::new(
                column * width,
                row * height,
                column * width + width,
                row * height + height,
            )
        })
        .collect()
}

/// Where an overlay layer of `size` lands in the overlay's target.
pub fn overlay_rect(layer: &OverlayLayer, size: Size) -> Rect {
    Rect::new(
        layer.horizontal_offset,
        layer.vertical_offset,
        layer
            .horizontal_offset
            .saturating_add(saturating_i32(size.width)),
        layer
            .vertical_offset
            .saturating_add(saturating_i32(size.height)),
    )
}

/// 16-bit overlay background to a normalised clear colour.
pub fn background_color(background: [i32; 4]) -> [f32; 4] {
    background.map(|channel| channel.clamp(0, 65535) as f32 / 65535.0)
}

/// Largest rect with the aspect ratio of `content` that fits `display`,
/// centred. Edges are truncated to whole pixels.
pub fn letterbox(content: (f32, f32), display: (u32, u32)) -> Rect {
    let (width, height) = content;
    if width <= 0.0 || height <= 0.0 {
        return Rect::default();
    }
    let display_width = display.0 as f32;
    let display_height = display.1 as f32;
    let scale = (display_width / width).min(display_height / height);
    let scaled_width = width * scale;
    let scaled_height = height * scale;
    let left = (display_width - scaled_width) / 2.0;
    let top = (display_height - scaled_height) / 2.0;
    Rect::new(
        left as i32,
        top as i32,
        (left + scaled_width) as i32,
        (top + scaled_height) as i32,
    )
}
