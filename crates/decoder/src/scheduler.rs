//! Hardware decode scheduling.
//!
//! Jobs and free input-buffer indices live in two FIFOs behind one lock so a
//! job is only ever dequeued together with a buffer to put it in. `feed` is
//! the single routine that pairs them; it runs from the enqueue path and from
//! the codec's input-available callback.
//!
//! Lock order is `queues` then `codec`; no path takes them the other way.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use imagegraph::{DecoderConfig, SampleId, Size};

use crate::format::InputFormat;
use crate::hardware::{DecoderFactory, HardwareDecoder};
use crate::surface::OutputSurface;
use crate::{DecodeClient, DecodeError, DecodeJob, Decoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Uninitialized,
    Configured,
    Running,
    Stopped,
}

/// Still images allow a single input in flight; sequences pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Still,
    Sequence,
}

/// Presentation timestamps for fed jobs. Zero is reserved for jobs that are
/// decoded but never presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtsPolicy {
    pub initial: u64,
    pub step: u64,
}

impl Default for PtsPolicy {
    fn default() -> Self {
        Self {
            initial: 10,
            step: 10,
        }
    }
}

struct InFlight {
    job: DecodeJob,
    pts: u64,
}

struct Queues {
    state: SchedulerState,
    jobs: VecDeque<DecodeJob>,
    input_buffers: VecDeque<usize>,
    in_flight: VecDeque<InFlight>,
}

struct Codec {
    hardware: Box<dyn HardwareDecoder>,
    surface: Option<Arc<OutputSurface>>,
    next_pts: u64,
}

struct Shared {
    config: DecoderConfig,
    format: InputFormat,
    mode: DecodeMode,
    pts: PtsPolicy,
    queues: Mutex<Queues>,
    codec: Mutex<Codec>,
}

/// Handle the platform decoder uses to report buffer availability.
///
/// Holds a weak reference, so events arriving after the scheduler is dropped
/// are ignored.
#[derive(Clone)]
pub struct CodecEvents {
    shared: Weak<Shared>,
}

impl CodecEvents {
    pub fn input_available(&self, index: usize) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_input_available(index);
        }
    }

    pub fn output_available(&self, index: usize, pts: u64) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_output_available(index, pts);
        }
    }

    pub fn error(&self, message: &str) {
        if let Some(shared) = self.shared.upgrade() {
            tracing::error!(codec = %shared.config.codec, %message, "hardware decoder reported an error");
        }
    }
}

/// Serialises decode jobs onto one hardware decoder instance.
pub struct DecodeScheduler {
    shared: Arc<Shared>,
}

impl DecodeScheduler {
    pub fn new(
        factory: &dyn DecoderFactory,
        config: &DecoderConfig,
        size: Size,
        mode: DecodeMode,
        pts: PtsPolicy,
    ) -> Result<Self, DecodeError> {
        let format = InputFormat::for_config(config, size)?;
        let hardware = factory.create(&format)?;
        tracing::debug!(mime = format.mime, ?mode, "created hardware decoder");
        Ok(Self {
            shared: Arc::new(Shared {
                config: config.clone(),
                format,
                mode,
                pts,
                queues: Mutex::new(Queues {
                    state: SchedulerState::Uninitialized,
                    jobs: VecDeque::new(),
                    input_buffers: VecDeque::new(),
                    in_flight: VecDeque::new(),
                }),
                codec: Mutex::new(Codec {
                    hardware,
                    surface: None,
                    next_pts: pts.initial,
                }),
            }),
        })
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.lock_queues().state
    }

    pub fn mode(&self) -> DecodeMode {
        self.shared.mode
    }

    /// Inputs handed to the hardware whose output has not come back yet.
    pub fn in_flight(&self) -> usize {
        self.shared.lock_queues().in_flight.len()
    }

    pub fn pending(&self) -> usize {
        self.shared.lock_queues().jobs.len()
    }

    /// Events handle for the hardware decoder; also handed over at `start`.
    pub fn events(&self) -> CodecEvents {
        CodecEvents {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl Decoder for DecodeScheduler {
    fn queue_decode(
        &self,
        client: Arc<dyn DecodeClient>,
        sample: Option<SampleId>,
        render: bool,
    ) -> Result<(), DecodeError> {
        let state = {
            let mut queues = self.shared.lock_queues();
            if queues.state == SchedulerState::Stopped {
                tracing::warn!(codec = %self.shared.config.codec, "decode queued on released decoder");
                return Err(DecodeError::Stopped);
            }
            queues.jobs.push_back(DecodeJob {
                client,
                sample,
                render,
            });
            queues.state
        };

        if state == SchedulerState::Running {
            self.shared.feed();
            Ok(())
        } else {
            self.shared.start(self.events())
        }
    }

    fn compatible(&self, config: &DecoderConfig) -> bool {
        self.shared.config.bytes == config.bytes
    }

    fn release(&self) {
        let (jobs, in_flight) = {
            let mut queues = self.shared.lock_queues();
            if queues.state == SchedulerState::Stopped {
                return;
            }
            queues.state = SchedulerState::Stopped;
            queues.input_buffers.clear();
            (
                std::mem::take(&mut queues.jobs),
                std::mem::take(&mut queues.in_flight),
            )
        };
        // The platform may call back while stopping; those callbacks need the
        // queues lock and see the stopped state.
        let mut codec = self.shared.lock_codec();
        codec.hardware.stop();
        codec.hardware.release();
        codec.surface = None;
        drop(codec);
        tracing::debug!(
            codec = %self.shared.config.codec,
            dropped = jobs.len() + in_flight.len(),
            "released hardware decoder"
        );
    }
}

impl Shared {
    fn lock_queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_codec(&self) -> MutexGuard<'_, Codec> {
        self.codec.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configures against the first queued job's surface and starts the
    /// codec. Jobs without a surface ahead of it are failed and skipped.
    fn start(&self, events: CodecEvents) -> Result<(), DecodeError> {
        let mut failed = Vec::new();
        let result = self.start_locked(events, &mut failed);
        for job in failed {
            job.fail();
        }
        if result.is_ok() {
            self.feed();
        }
        result
    }

    fn start_locked(
        &self,
        events: CodecEvents,
        failed: &mut Vec<DecodeJob>,
    ) -> Result<(), DecodeError> {
        let mut queues = self.lock_queues();
        if queues.state != SchedulerState::Uninitialized {
            return match queues.state {
                SchedulerState::Stopped => Err(DecodeError::Stopped),
                _ => Ok(()),
            };
        }

        let surface = loop {
            let Some(front) = queues.jobs.front() else {
                return Ok(());
            };
            match front.client.output_surface() {
                Some(surface) => break surface,
                None => {
                    tracing::warn!(codec = %self.config.codec, "first decode job has no output surface");
                    failed.extend(queues.jobs.pop_front());
                }
            }
        };

        let mut codec = self.lock_codec();
        if let Err(err) = codec.hardware.configure(&self.format, &surface) {
            tracing::error!(mime = self.format.mime, error = %err, "failed to configure decoder");
            failed.extend(queues.jobs.drain(..));
            return Err(DecodeError::Configuration(err.to_string()));
        }
        queues.state = SchedulerState::Configured;
        codec.surface = Some(surface);

        if let Err(err) = codec.hardware.start(events) {
            tracing::error!(mime = self.format.mime, error = %err, "failed to start decoder");
            codec.hardware.stop();
            codec.surface = None;
            queues.state = SchedulerState::Uninitialized;
            failed.extend(queues.jobs.drain(..));
            return Err(DecodeError::Configuration(err.to_string()));
        }
        queues.state = SchedulerState::Running;
        tracing::debug!(mime = self.format.mime, "decoder running");
        Ok(())
    }

    /// Pairs queued jobs with free input buffers until one side runs dry, or,
    /// for still images, until one input is in flight.
    fn feed(&self) {
        let mut failed = Vec::new();
        {
            let mut queues = self.lock_queues();
            loop {
                if queues.state != SchedulerState::Running {
                    break;
                }
                if self.mode == DecodeMode::Still && !queues.in_flight.is_empty() {
                    break;
                }
                if queues.jobs.is_empty() || queues.input_buffers.is_empty() {
                    break;
                }
                let (Some(job), Some(index)) =
                    (queues.jobs.pop_front(), queues.input_buffers.pop_front())
                else {
                    break;
                };

                let mut codec = self.lock_codec();
                match self.submit(&mut codec, &job, index) {
                    Ok(pts) => queues.in_flight.push_back(InFlight { job, pts }),
                    Err(err) => {
                        tracing::warn!(
                            codec = %self.config.codec,
                            sample = ?job.sample,
                            error = %err,
                            "decode job failed; skipping"
                        );
                        queues.input_buffers.push_front(index);
                        failed.push(job);
                    }
                }
            }
        }
        for job in failed {
            job.fail();
        }
    }

    fn submit(&self, codec: &mut Codec, job: &DecodeJob, index: usize) -> Result<u64, DecodeError> {
        let surface = job
            .client
            .output_surface()
            .ok_or(DecodeError::MissingSurface)?;
        let bound = codec.surface.as_ref().map(|current| current.id());
        if bound != Some(surface.id()) {
            codec
                .hardware
                .set_output_surface(&surface)
                .map_err(|err| DecodeError::Configuration(err.to_string()))?;
            tracing::debug!(surface = surface.id(), "retargeted decoder output");
            codec.surface = Some(surface);
        }

        let data = job.client.input_data(job.sample)?;
        codec.hardware.write_input(index, &data)?;

        let pts = if job.render { codec.next_pts } else { 0 };
        codec.hardware.queue_input_buffer(index, data.len(), pts)?;
        codec.next_pts += self.pts.step;
        Ok(pts)
    }

    fn on_input_available(&self, index: usize) {
        {
            let mut queues = self.lock_queues();
            if queues.state == SchedulerState::Stopped {
                return;
            }
            queues.input_buffers.push_back(index);
        }
        self.feed();
    }

    fn on_output_available(&self, index: usize, pts: u64) {
        let finished = {
            let mut queues = self.lock_queues();
            if queues.state == SchedulerState::Stopped {
                return;
            }
            let finished = queues.in_flight.pop_front();
            let render = finished.as_ref().map(|entry| entry.job.render).unwrap_or(false);
            if let Some(entry) = &finished {
                if entry.pts != pts {
                    tracing::debug!(expected = entry.pts, actual = pts, "output arrived out of order");
                }
            }
            let mut codec = self.lock_codec();
            if let Err(err) = codec.hardware.release_output_buffer(index, render) {
                tracing::warn!(index, error = %err, "failed to release output buffer");
            }
            finished
        };

        if let Some(entry) = finished {
            entry.job.client.notify_decode_ready();
        }
        self.feed();
    }
}
