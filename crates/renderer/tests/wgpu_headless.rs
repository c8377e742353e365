#![cfg(feature = "wgpu")]

mod common;

use std::sync::Arc;

use decoder::DecodedFrame;
use imagegraph::{ContainerModel, ImageId, MemoryContainer, Size};
use renderer::gpu::{GpuBackend, ProgramKind, QuadDraw};
use renderer::transform::{image_quad, Orientation};
use renderer::{Compositor, DisplayRequests, FrameOutcome, Rect, WgpuBackend, Zoom};

use common::{cache, init_logging, jpeg_config, solid_jpeg};

fn pixel(pixels: &[u8], width: u32, x: u32, y: u32) -> [u8; 4] {
    let start = ((y * width + x) * 4) as usize;
    [
        pixels[start],
        pixels[start + 1],
        pixels[start + 2],
        pixels[start + 3],
    ]
}

#[test]
#[ignore = "needs a GPU adapter"]
fn uploaded_frame_lands_right_side_up() {
    init_logging();
    let mut gpu = WgpuBackend::headless(4, 4).unwrap();
    let texture = gpu.create_external_texture().unwrap();
    // Top half red, bottom half blue.
    let mut pixels = Vec::new();
    for row in 0..4 {
        let color = if row < 2 { [255, 0, 0, 255] } else { [0, 0, 255, 255] };
        for _ in 0..4 {
            pixels.extend_from_slice(&color);
        }
    }
    let frame = DecodedFrame {
        width: 4,
        height: 4,
        pixels,
        transform: DecodedFrame::FLIP_Y,
    };
    gpu.upload_frame(texture, &frame).unwrap();
    let program = gpu.create_program(ProgramKind::ColorExternal).unwrap();
    let vertices = gpu.create_vertex_buffer().unwrap();
    let quad = image_quad(Size::new(4, 4), &Orientation::default(), Zoom::NONE);
    gpu.update_vertex_buffer(vertices, &quad).unwrap();

    gpu.begin_frame().unwrap();
    gpu.clear(renderer::gpu::FramebufferId::DEFAULT, [0.0; 4])
        .unwrap();
    gpu.draw_quad(&QuadDraw {
        framebuffer: renderer::gpu::FramebufferId::DEFAULT,
        target_size: (4, 4),
        viewport: Rect::new(0, 0, 4, 4),
        program,
        vertices,
        texture,
        alpha: None,
        texture_matrix: frame.transform,
    })
    .unwrap();
    gpu.end_frame().unwrap();

    let out = gpu.read_display().unwrap();
    assert_eq!(pixel(&out, 4, 1, 0), [255, 0, 0, 255]);
    assert_eq!(pixel(&out, 4, 1, 3), [0, 0, 255, 255]);
}

#[test]
#[ignore = "needs a GPU adapter"]
fn compositor_draws_through_wgpu() {
    init_logging();
    let mut builder = MemoryContainer::builder();
    builder.coded(
        ImageId(1),
        Size::new(16, 16),
        jpeg_config(),
        solid_jpeg(16, 16, [0, 255, 0]),
    );
    let model: Arc<dyn ContainerModel> = Arc::new(builder.build().unwrap());
    let cache = cache();
    cache.reserve_all(Box::new(WgpuBackend::headless(32, 32).unwrap()));
    let mut compositor = Compositor::new(Arc::clone(&cache), model, DisplayRequests::new(), None);

    compositor.requests().set_image(ImageId(1));
    assert_eq!(compositor.draw_frame().unwrap(), FrameOutcome::Drawn);
    compositor.dispose();
    assert!(cache.is_empty(), "{:?}", cache.keys());
}
