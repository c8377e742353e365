#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use decoder::{DecodeError, DecoderFactory, DecoderPool, HardwareDecoder, InputFormat, PtsPolicy};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};
use imagegraph::{DecoderConfig, FourCc, ImageId, Size};
use renderer::{GpuBackend, RecordingBackend, RecordingProbe, ResourceCache};
use tracing_subscriber::EnvFilter;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Stands in for a device without hardware codecs.
pub struct NoHardware;

impl DecoderFactory for NoHardware {
    fn create(&self, format: &InputFormat) -> Result<Box<dyn HardwareDecoder>, DecodeError> {
        Err(DecodeError::Configuration(format.mime.to_string()))
    }
}

pub fn cache() -> Arc<ResourceCache> {
    Arc::new(ResourceCache::new(Arc::new(DecoderPool::new(
        Arc::new(NoHardware),
        PtsPolicy::default(),
    ))))
}

/// Installs a 64x64 recording backend on the calling thread.
pub fn reserve(cache: &ResourceCache) -> RecordingProbe {
    let backend = RecordingBackend::new(64, 64);
    let probe = backend.probe();
    cache.reserve_all(Box::new(backend) as Box<dyn GpuBackend>);
    probe
}

pub fn solid_jpeg(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let pixels: Vec<u8> = rgb
        .iter()
        .copied()
        .cycle()
        .take((width * height * 3) as usize)
        .collect();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 95)
        .write_image(&pixels, width, height, ExtendedColorType::Rgb8)
        .unwrap();
    out
}

pub fn jpeg_config() -> DecoderConfig {
    DecoderConfig::new(FourCc::JPEG, Vec::new())
}

pub fn add_jpeg(builder: &mut imagegraph::ContainerBuilder, id: u32, width: u32, height: u32) {
    builder.coded(
        ImageId(id),
        Size::new(width, height),
        jpeg_config(),
        solid_jpeg(width, height, [200, 40, 40]),
    );
}

pub fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}
