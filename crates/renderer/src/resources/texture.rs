use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use decoder::{DecodeClient, DecodeError, DecodedFrame, Decoder, DecoderPool, OutputSurface};
use imagegraph::{ContainerModel, ModelError, SampleId, SampleInfo, Source};

use crate::gpu::{GpuBackend, GpuError, TextureId};

use super::{lock, GpuResource};

/// Called from decoder threads whenever a new frame lands on a texture's
/// surface; typically wakes the render loop.
pub type FrameSignal = Arc<dyn Fn() + Send + Sync>;

/// The decode-facing half of a [`TextureHolder`]. Decoders and the playback
/// thread hold it; it only flips flags and never touches the cache.
pub struct TextureClient {
    model: Arc<dyn ContainerModel>,
    source: Source,
    signal: Option<FrameSignal>,
    surface: Mutex<Option<Arc<OutputSurface>>>,
    decoder: Mutex<Option<Arc<dyn Decoder>>>,
    decoded: AtomicBool,
    available: AtomicBool,
    updated: AtomicBool,
}

impl TextureClient {
    fn new(
        model: Arc<dyn ContainerModel>,
        source: Source,
        signal: Option<FrameSignal>,
    ) -> Arc<Self> {
        Arc::new(Self {
            model,
            source,
            signal,
            surface: Mutex::new(None),
            decoder: Mutex::new(None),
            decoded: AtomicBool::new(false),
            available: AtomicBool::new(false),
            updated: AtomicBool::new(false),
        })
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn is_decoded(&self) -> bool {
        self.decoded.load(Ordering::Acquire)
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn is_updated(&self) -> bool {
        self.updated.load(Ordering::Acquire)
    }

    /// Queues `sample` and every sample it depends on, dependencies first.
    /// Only `sample` itself is presented.
    pub fn decode_frame(self: &Arc<Self>, sample: SampleId) -> Result<(), DecodeError> {
        let decoder = lock(&self.decoder).clone().ok_or(DecodeError::Stopped)?;
        let track = match self.source {
            Source::Image(_) => return decoder.queue_decode(self.clone(), None, true),
            Source::Track(track) => track,
        };
        let samples = self.model.samples(track)?;
        let chain =
            decode_chain(&samples, sample).ok_or(ModelError::UnknownSample { track, sample })?;
        let last = chain.len().saturating_sub(1);
        for (position, id) in chain.into_iter().enumerate() {
            decoder.queue_decode(self.clone(), Some(id), position == last)?;
        }
        Ok(())
    }

    fn frame_available(&self) {
        self.notify_decode_ready();
        self.available.store(true, Ordering::Release);
        if let Some(signal) = &self.signal {
            signal();
        }
    }

    fn latch(&self) -> Option<DecodedFrame> {
        let surface = lock(&self.surface).clone()?;
        surface.latch()
    }

    fn reset(&self) {
        self.decoded.store(false, Ordering::Release);
        self.available.store(false, Ordering::Release);
        self.updated.store(false, Ordering::Release);
    }
}

impl DecodeClient for TextureClient {
    fn output_surface(&self) -> Option<Arc<OutputSurface>> {
        lock(&self.surface).clone()
    }

    fn input_data(&self, sample: Option<SampleId>) -> Result<Vec<u8>, DecodeError> {
        let data = match (self.source, sample) {
            (Source::Image(image), _) => self.model.item_data(image)?,
            (Source::Track(track), Some(sample)) => self.model.sample_data(track, sample)?,
            (Source::Track(track), None) => {
                return Err(ModelError::Invalid(format!("{track} decode without a sample")).into())
            }
        };
        Ok(data)
    }

    fn notify_decode_ready(&self) {
        self.updated.store(false, Ordering::Release);
        self.decoded.store(true, Ordering::Release);
    }

    fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }
}

/// Samples to feed so `target` can be decoded: its dependency closure in
/// dependency-first order, each sample once, `target` last. `None` when
/// `target` is not in `samples`.
pub(crate) fn decode_chain(samples: &[SampleInfo], target: SampleId) -> Option<Vec<SampleId>> {
    let by_id: HashMap<SampleId, &SampleInfo> =
        samples.iter().map(|sample| (sample.id, sample)).collect();
    by_id.get(&target)?;
    let mut visited = HashSet::new();
    let mut chain = Vec::new();
    visit(&by_id, target, &mut visited, &mut chain);
    Some(chain)
}

fn visit(
    by_id: &HashMap<SampleId, &SampleInfo>,
    id: SampleId,
    visited: &mut HashSet<SampleId>,
    chain: &mut Vec<SampleId>,
) {
    if !visited.insert(id) {
        return;
    }
    let Some(sample) = by_id.get(&id) else {
        tracing::warn!(sample = %id, "decode dependency is not in the track");
        return;
    };
    for dependency in &sample.dependencies {
        visit(by_id, *dependency, visited, chain);
    }
    chain.push(id);
}

/// Decoder-backed texture for one coded image or track. Shared between
/// every node showing that source through its cache key.
pub struct TextureHolder {
    texture: Option<TextureId>,
    client: Arc<TextureClient>,
    decoders: Arc<DecoderPool>,
    transform: [f32; 16],
    has_frame: bool,
}

impl TextureHolder {
    pub fn new(
        model: Arc<dyn ContainerModel>,
        source: Source,
        decoders: Arc<DecoderPool>,
        signal: Option<FrameSignal>,
    ) -> Self {
        Self {
            texture: None,
            client: TextureClient::new(model, source, signal),
            decoders,
            transform: DecodedFrame::IDENTITY,
            has_frame: false,
        }
    }

    pub fn client(&self) -> &Arc<TextureClient> {
        &self.client
    }

    pub fn texture(&self) -> Option<TextureId> {
        self.texture
    }

    /// Texture-coordinate transform reported with the latest frame.
    pub fn transform(&self) -> [f32; 16] {
        self.transform
    }

    /// Whether a decoded frame has been copied into the texture since it
    /// was reserved.
    pub fn has_frame(&self) -> bool {
        self.has_frame
    }

    /// Copies a newly decoded frame into the texture, at most once per
    /// decode. Returns whether a frame was uploaded.
    pub fn update_texture(&mut self, gpu: &mut dyn GpuBackend) -> Result<bool, GpuError> {
        let client = &self.client;
        if !client.is_decoded() || !client.is_available() || client.is_updated() {
            return Ok(false);
        }
        let Some(texture) = self.texture else {
            return Ok(false);
        };
        match client.latch() {
            Some(frame) => {
                gpu.upload_frame(texture, &frame)?;
                self.transform = frame.transform;
                self.has_frame = true;
                client.updated.store(true, Ordering::Release);
                Ok(true)
            }
            None if self.has_frame => {
                // Decode finished without a new picture; keep showing the last one.
                client.updated.store(true, Ordering::Release);
                Ok(false)
            }
            None => {
                client.decoded.store(false, Ordering::Release);
                Ok(false)
            }
        }
    }

    fn start_decoding(&self) -> Result<(), DecodeError> {
        let model = &self.client.model;
        let decoder = match self.client.source {
            Source::Image(image) => {
                let config = model.decoder_config(image)?;
                self.decoders
                    .still_decoder(&config, model.image_size(image)?)?
            }
            Source::Track(track) => {
                let samples = model.samples(track)?;
                let first = samples
                    .first()
                    .ok_or_else(|| ModelError::Invalid(format!("{track} has no samples")))?;
                self.decoders
                    .sequence_decoder(&first.config, model.track_size(track)?)?
            }
        };
        *lock(&self.client.decoder) = Some(decoder);

        match self.client.source {
            Source::Image(_) => self.client.decode_frame(SampleId(0)),
            Source::Track(track) => {
                let first = model
                    .samples(track)?
                    .first()
                    .map(|sample| sample.id)
                    .ok_or_else(|| ModelError::Invalid(format!("{track} has no samples")))?;
                self.client.decode_frame(first)
            }
        }
    }
}

impl GpuResource for TextureHolder {
    fn reserve(&mut self, gpu: &mut dyn GpuBackend) -> Result<(), GpuError> {
        if self.texture.is_some() {
            self.release(Some(&mut *gpu));
        }
        self.texture = Some(gpu.create_external_texture()?);
        self.transform = DecodedFrame::IDENTITY;
        self.has_frame = false;
        self.client.reset();

        let surface = OutputSurface::new();
        let client: Weak<TextureClient> = Arc::downgrade(&self.client);
        surface.set_frame_listener(move || {
            if let Some(client) = client.upgrade() {
                client.frame_available();
            }
        });
        *lock(&self.client.surface) = Some(surface);

        if let Err(err) = self.start_decoding() {
            tracing::warn!(source = %self.client.source, error = %err, "failed to start decoding");
        }
        Ok(())
    }

    fn release(&mut self, gpu: Option<&mut dyn GpuBackend>) {
        self.client.reset();
        self.has_frame = false;
        if let Some(surface) = lock(&self.client.surface).take() {
            surface.release();
        }
        let decoder = lock(&self.client.decoder).take();
        if let (Some(decoder), Source::Track(_)) = (decoder, self.client.source) {
            self.decoders.release_sequence(&decoder);
        }
        if let (Some(gpu), Some(texture)) = (gpu, self.texture.take()) {
            gpu.delete_texture(texture);
        }
    }
}
