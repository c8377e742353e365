use std::sync::Arc;

use decoder::{DecodeError, DecoderFactory, DecoderPool, HardwareDecoder, InputFormat, PtsPolicy};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};
use imagegraph::{
    ContainerModel, DecoderConfig, FourCc, ImageId, MemoryContainer, SampleEntry, SampleId, Size,
    TrackEntry, TrackId,
};

use crate::gpu::{GpuBackend, RecordingBackend, RecordingProbe};
use crate::resources::ResourceCache;

/// Every hardware request fails; JPEG fixtures go through the software path.
pub(crate) struct NoHardware;

impl DecoderFactory for NoHardware {
    fn create(&self, format: &InputFormat) -> Result<Box<dyn HardwareDecoder>, DecodeError> {
        Err(DecodeError::Configuration(format.mime.to_string()))
    }
}

pub(crate) fn pool() -> Arc<DecoderPool> {
    Arc::new(DecoderPool::new(Arc::new(NoHardware), PtsPolicy::default()))
}

pub(crate) fn cache() -> ResourceCache {
    ResourceCache::new(pool())
}

pub(crate) fn backend() -> (Box<dyn GpuBackend>, RecordingProbe) {
    let backend = RecordingBackend::new(64, 64);
    let probe = backend.probe();
    (Box::new(backend), probe)
}

pub(crate) fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let pixels = vec![128u8; (width * height * 3) as usize];
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 90)
        .write_image(&pixels, width, height, ExtendedColorType::Rgb8)
        .unwrap();
    out
}

pub(crate) fn jpeg_config() -> DecoderConfig {
    DecoderConfig::new(FourCc::JPEG, Vec::new())
}

pub(crate) fn single_jpeg(width: u32, height: u32) -> (Arc<dyn ContainerModel>, ImageId) {
    let image = ImageId(1);
    let mut builder = MemoryContainer::builder();
    builder.coded(image, Size::new(width, height), jpeg_config(), jpeg(width, height));
    (Arc::new(builder.build().unwrap()), image)
}

/// 16x8 JPEG track; samples are `(id, dependencies)`, 100 ms apart.
pub(crate) fn track_container(track: TrackId, samples: &[(u32, &[u32])]) -> Arc<dyn ContainerModel> {
    let samples = samples
        .iter()
        .enumerate()
        .map(|(index, (id, dependencies))| SampleEntry {
            id: SampleId(*id),
            time_ms: index as u64 * 100,
            dependencies: dependencies.iter().copied().map(SampleId).collect(),
            config: None,
            data: jpeg(16, 8),
        })
        .collect();
    let mut builder = MemoryContainer::builder();
    builder.track(TrackEntry {
        id: track,
        width: 16,
        height: 8,
        config: jpeg_config(),
        transforms: Vec::new(),
        duration_ms: None,
        thumbnails: Vec::new(),
        auxiliaries: Vec::new(),
        samples,
    });
    Arc::new(builder.build().unwrap())
}
