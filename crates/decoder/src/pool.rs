use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use imagegraph::{DecoderConfig, FourCc, Size};

use crate::hardware::DecoderFactory;
use crate::scheduler::{DecodeMode, DecodeScheduler, PtsPolicy};
use crate::software::SoftwareDecoder;
use crate::{DecodeError, Decoder};

/// Decoders owned by one display session.
///
/// Still-image decoders are shared by every item with identical
/// configuration; each sequence gets its own.
pub struct DecoderPool {
    factory: Arc<dyn DecoderFactory>,
    pts: PtsPolicy,
    still: Mutex<Vec<Pooled>>,
    sequence: Mutex<Vec<Arc<dyn Decoder>>>,
}

impl DecoderPool {
    pub fn new(factory: Arc<dyn DecoderFactory>, pts: PtsPolicy) -> Self {
        Self {
            factory,
            pts,
            still: Mutex::new(Vec::new()),
            sequence: Mutex::new(Vec::new()),
        }
    }

    pub fn still_decoder(
        &self,
        config: &DecoderConfig,
        size: Size,
    ) -> Result<Arc<dyn Decoder>, DecodeError> {
        let mut still = lock(&self.still);
        let software = is_software(config);
        if let Some(existing) = still
            .iter()
            .find(|pooled| pooled.software == software && pooled.decoder.compatible(config))
        {
            return Ok(Arc::clone(&existing.decoder));
        }

        let decoder: Arc<dyn Decoder> = if software {
            Arc::new(SoftwareDecoder::new(config.codec)?)
        } else {
            Arc::new(DecodeScheduler::new(
                self.factory.as_ref(),
                config,
                size,
                DecodeMode::Still,
                self.pts,
            )?)
        };
        still.push(Pooled {
            software,
            decoder: Arc::clone(&decoder),
        });
        tracing::debug!(codec = %config.codec, pooled = still.len(), "added still decoder");
        Ok(decoder)
    }

    pub fn sequence_decoder(
        &self,
        config: &DecoderConfig,
        size: Size,
    ) -> Result<Arc<dyn Decoder>, DecodeError> {
        let decoder: Arc<dyn Decoder> = if is_software(config) {
            Arc::new(SoftwareDecoder::new(config.codec)?)
        } else {
            Arc::new(DecodeScheduler::new(
                self.factory.as_ref(),
                config,
                size,
                DecodeMode::Sequence,
                self.pts,
            )?)
        };
        lock(&self.sequence).push(Arc::clone(&decoder));
        Ok(decoder)
    }

    /// Releases a decoder handed out by [`Self::sequence_decoder`] and forgets
    /// it. Decoders this pool does not track are released all the same.
    pub fn release_sequence(&self, decoder: &Arc<dyn Decoder>) {
        let removed = {
            let mut sequence = lock(&self.sequence);
            let before = sequence.len();
            sequence.retain(|pooled| !Arc::ptr_eq(pooled, decoder));
            before != sequence.len()
        };
        decoder.release();
        tracing::debug!(
            removed,
            remaining = lock(&self.sequence).len(),
            "released sequence decoder"
        );
    }

    /// Releases every decoder and forgets them; later requests create new ones.
    pub fn release_all(&self) {
        let still: Vec<_> = lock(&self.still)
            .drain(..)
            .map(|pooled| pooled.decoder)
            .collect();
        let sequence: Vec<_> = lock(&self.sequence).drain(..).collect();
        let count = still.len() + sequence.len();
        for decoder in still.into_iter().chain(sequence) {
            decoder.release();
        }
        if count > 0 {
            tracing::debug!(count, "released pooled decoders");
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.still).len() + lock(&self.sequence).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Pooled {
    software: bool,
    decoder: Arc<dyn Decoder>,
}

fn is_software(config: &DecoderConfig) -> bool {
    config.codec == FourCc::JPEG
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FakeClient, ScriptedFactory};
    use imagegraph::SampleId;

    fn pool(factory: &ScriptedFactory) -> DecoderPool {
        DecoderPool::new(Arc::new(factory.clone()), PtsPolicy::default())
    }

    #[test]
    fn reuses_still_decoder_with_matching_config() {
        let factory = ScriptedFactory::default();
        let pool = pool(&factory);
        let config = DecoderConfig::new(FourCc::HVC1, vec![1, 2, 3]);

        let first = pool.still_decoder(&config, Size::new(8, 8)).unwrap();
        let second = pool.still_decoder(&config, Size::new(16, 16)).unwrap();
        let other = pool
            .still_decoder(&DecoderConfig::new(FourCc::HVC1, vec![9]), Size::new(8, 8))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(factory.created(), 2);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn sequences_always_get_a_fresh_decoder() {
        let factory = ScriptedFactory::default();
        let pool = pool(&factory);
        let config = DecoderConfig::new(FourCc::AVC1, vec![1]);

        let first = pool.sequence_decoder(&config, Size::new(8, 8)).unwrap();
        let second = pool.sequence_decoder(&config, Size::new(8, 8)).unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(factory.created(), 2);
    }

    #[test]
    fn released_sequence_decoder_leaves_the_pool() {
        let factory = ScriptedFactory::default();
        let pool = pool(&factory);
        let config = DecoderConfig::new(FourCc::AVC1, vec![1]);
        let first = pool.sequence_decoder(&config, Size::new(8, 8)).unwrap();
        let second = pool.sequence_decoder(&config, Size::new(8, 8)).unwrap();
        first
            .queue_decode(FakeClient::with_surface(vec![1]), Some(SampleId(0)), true)
            .unwrap();

        pool.release_sequence(&first);

        assert_eq!(pool.len(), 1);
        assert!(factory.calls().ends_with(&[Call::Stop, Call::Release]));
        assert!(matches!(
            first.queue_decode(FakeClient::with_surface(vec![1]), Some(SampleId(1)), true),
            Err(DecodeError::Stopped)
        ));
        second
            .queue_decode(FakeClient::with_surface(vec![1]), Some(SampleId(0)), true)
            .unwrap();
    }

    #[test]
    fn jpeg_items_use_the_software_decoder() {
        let factory = ScriptedFactory::default();
        let pool = pool(&factory);
        let config = DecoderConfig::new(FourCc::JPEG, Vec::new());

        let first = pool.still_decoder(&config, Size::new(8, 8)).unwrap();
        let second = pool.still_decoder(&config, Size::new(8, 8)).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.created(), 0);
    }

    #[test]
    fn hardware_and_software_decoders_are_not_mixed() {
        let factory = ScriptedFactory::default();
        let pool = pool(&factory);

        let hevc = pool
            .still_decoder(&DecoderConfig::new(FourCc::HVC1, Vec::new()), Size::new(8, 8))
            .unwrap();
        let jpeg = pool
            .still_decoder(&DecoderConfig::new(FourCc::JPEG, Vec::new()), Size::new(8, 8))
            .unwrap();

        assert!(!Arc::ptr_eq(&jpeg, &hevc));
        assert_eq!(factory.created(), 1);
    }

    #[test]
    fn release_all_stops_every_decoder() {
        let factory = ScriptedFactory::default();
        let pool = pool(&factory);
        let decoder = pool
            .still_decoder(&DecoderConfig::new(FourCc::HVC1, vec![1]), Size::new(8, 8))
            .unwrap();
        decoder
            .queue_decode(FakeClient::with_surface(vec![1]), None, true)
            .unwrap();

        pool.release_all();

        assert!(pool.is_empty());
        assert!(factory.calls().ends_with(&[Call::Stop, Call::Release]));
        assert!(decoder
            .queue_decode(FakeClient::with_surface(vec![1]), None, true)
            .is_err());
    }

    #[test]
    fn unsupported_codec_is_reported() {
        let factory = ScriptedFactory::default();
        let pool = pool(&factory);
        let err = pool
            .still_decoder(&DecoderConfig::new(FourCc(*b"av01"), Vec::new()), Size::new(8, 8))
            .err()
            .unwrap();
        assert!(matches!(err, DecodeError::UnsupportedCodec(_)));
    }
}
