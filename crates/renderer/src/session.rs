//! GPU thread for one display surface.
//!
//! ```text
//!   application ──SessionCommand──▶ render thread ──▶ Compositor::draw_frame
//!        │                               ▲
//!        └─ SequencePlayer ─ShowFrame────┘◀── Render (decoded frame available)
//! ```
//!
//! The render thread owns the backend through the [`ResourceCache`]. It
//! sleeps on the command channel while nothing needs drawing, polls at the
//! configured retry interval while the tree waits for decoded frames, and
//! rebuilds the context after a loss.
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use decoder::{DecoderFactory, DecoderPool, PtsPolicy};
use imagegraph::{ContainerModel, ImageId, SampleId, TrackId};
use viewconfig::{PlaybackConfig, ViewerConfig};

use crate::compositor::{Compositor, DisplayRequests, FrameOutcome};
use crate::gpu::{GpuBackend, GpuError};
use crate::playback::{FrameSchedule, SequencePlayer};
use crate::resources::{lock, ContextRelease, FrameSignal, ResourceCache};
use crate::types::Zoom;

/// Creates a backend on the render thread; called again after a context loss.
pub type BackendFactory = Box<dyn FnMut() -> Result<Box<dyn GpuBackend>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionCommand {
    Render,
    Resize { width: u32, height: u32 },
    Zoom(Zoom),
    ShowFrame(SampleId),
    Finish,
}

pub struct RenderSession {
    commands: Sender<SessionCommand>,
    requests: DisplayRequests,
    cache: Arc<ResourceCache>,
    model: Arc<dyn ContainerModel>,
    playback: PlaybackConfig,
    player: Mutex<Option<SequencePlayer>>,
    join_handle: Option<JoinHandle<Result<()>>>,
}

impl RenderSession {
    /// Spawns the render thread and waits until its first backend exists.
    pub fn spawn(
        config: &ViewerConfig,
        model: Arc<dyn ContainerModel>,
        hardware: Arc<dyn DecoderFactory>,
        backend: BackendFactory,
    ) -> Result<Self> {
        let policy = PtsPolicy {
            initial: config.decoder.initial_pts,
            step: config.decoder.pts_step,
        };
        let cache = Arc::new(ResourceCache::new(Arc::new(DecoderPool::new(
            hardware, policy,
        ))));
        let requests = DisplayRequests::new();
        let (command_tx, command_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);

        let signal_tx = command_tx.clone();
        let signal: FrameSignal = Arc::new(move || {
            let _ = signal_tx.send(SessionCommand::Render);
        });
        let compositor = Compositor::new(
            Arc::clone(&cache),
            Arc::clone(&model),
            requests.clone(),
            Some(signal),
        )
        .with_clear_color(config.display.clear_color);
        let worker = Worker {
            compositor,
            backend,
            commands: command_rx,
            retry_interval: config.display.retry_interval,
        };

        let handle = thread::Builder::new()
            .name("render-session".into())
            .spawn(move || worker.run(ready_tx))
            .map_err(|err| anyhow!("failed to spawn render thread: {err}"))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = handle.join();
                return Err(err);
            }
            Err(err) => {
                let _ = handle.join();
                return Err(anyhow!("render thread exited during start-up: {err}"));
            }
        }
        tracing::debug!("render session started");

        Ok(Self {
            commands: command_tx,
            requests,
            cache,
            model,
            playback: config.playback.clone(),
            player: Mutex::new(None),
            join_handle: Some(handle),
        })
    }

    pub fn requests(&self) -> &DisplayRequests {
        &self.requests
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    /// Asks for `image` to be displayed. `false` while a previous request is
    /// still being drawn.
    pub fn set_image(&self, image: ImageId) -> bool {
        if !self.requests.set_image(image) {
            return false;
        }
        self.stop_player();
        self.request_render();
        true
    }

    /// Asks for `track` to be displayed and prepares a paused player for it.
    pub fn set_track(&self, track: TrackId) -> Result<bool> {
        let schedule = FrameSchedule::for_track(
            self.model.as_ref(),
            track,
            self.playback.fallback_frame_duration,
        )
        .with_context(|| format!("failed to read timing of {track}"))?;
        if !self.requests.set_track(track) {
            return Ok(false);
        }
        self.stop_player();
        let frames = self.commands.clone();
        let player = SequencePlayer::spawn(schedule, &self.playback, move |sample| {
            frames.send(SessionCommand::ShowFrame(sample)).is_ok()
        })?;
        *lock(&self.player) = Some(player);
        self.request_render();
        Ok(true)
    }

    /// Starts or pauses the current track. `None` when no track is shown.
    pub fn toggle_playback(&self) -> Option<bool> {
        lock(&self.player).as_ref().map(SequencePlayer::toggle)
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.player)
            .as_ref()
            .is_some_and(|player| player.is_running() && !player.is_paused())
    }

    pub fn zoom(&self, zoom: Zoom) {
        self.send(SessionCommand::Zoom(zoom));
    }

    pub fn resize(&self, width: u32, height: u32) {
        self.send(SessionCommand::Resize { width, height });
    }

    pub fn request_render(&self) {
        self.send(SessionCommand::Render);
    }

    /// Stops playback, disposes every node, releases the context and joins
    /// the render thread.
    pub fn dispose(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        self.stop_player();
        let Some(handle) = self.join_handle.take() else {
            return Ok(());
        };
        let _ = self.commands.send(SessionCommand::Finish);
        handle
            .join()
            .map_err(|err| anyhow!("render thread panicked: {err:?}"))?
    }

    fn stop_player(&self) {
        let previous = lock(&self.player).take();
        if let Some(mut player) = previous {
            player.stop();
        }
    }

    fn send(&self, command: SessionCommand) {
        if self.commands.send(command).is_err() {
            tracing::warn!(?command, "render thread is gone; command dropped");
        }
    }
}

impl Drop for RenderSession {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            tracing::warn!(error = %err, "render session ended with an error");
        }
    }
}

impl std::fmt::Debug for RenderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderSession")
            .field("requests", &self.requests)
            .field("running", &self.join_handle.is_some())
            .finish()
    }
}

struct Worker {
    compositor: Compositor,
    backend: BackendFactory,
    commands: Receiver<SessionCommand>,
    retry_interval: Duration,
}

impl Worker {
    fn run(mut self, ready: Sender<Result<()>>) -> Result<()> {
        match self.create_backend() {
            Ok(backend) => {
                self.compositor.cache().reserve_all(backend);
                let _ = ready.send(Ok(()));
            }
            Err(err) => {
                let message = format!("{err:#}");
                let _ = ready.send(Err(err));
                return Err(anyhow!(message));
            }
        }

        let mut render_pending = true;
        let mut retrying = false;
        loop {
            let first = if render_pending {
                self.commands.try_recv().ok()
            } else if retrying {
                match self.commands.recv_timeout(self.retry_interval) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => {
                        render_pending = true;
                        None
                    }
                    Err(RecvTimeoutError::Disconnected) => Some(SessionCommand::Finish),
                }
            } else {
                Some(self.commands.recv().unwrap_or(SessionCommand::Finish))
            };

            let mut finished = false;
            let queued: Vec<_> = first.into_iter().chain(self.commands.try_iter()).collect();
            for command in queued {
                match command {
                    SessionCommand::Render => render_pending = true,
                    SessionCommand::Resize { width, height } => {
                        if let Err(err) = self
                            .compositor
                            .cache()
                            .with_gpu(|gpu| gpu.resize_surface(width, height))
                        {
                            tracing::warn!(error = %err, "resize without a backend");
                        }
                        render_pending = true;
                    }
                    SessionCommand::Zoom(zoom) => {
                        self.compositor.zoom(zoom);
                        render_pending = true;
                    }
                    SessionCommand::ShowFrame(sample) => {
                        if let Err(err) = self.compositor.show_frame(sample) {
                            tracing::warn!(sample = %sample, error = %err, "failed to queue frame");
                        }
                    }
                    SessionCommand::Finish => finished = true,
                }
            }
            if finished {
                break;
            }
            if !render_pending {
                continue;
            }

            render_pending = false;
            match self.compositor.draw_frame() {
                Ok(FrameOutcome::NotReady) => retrying = true,
                Ok(_) => retrying = false,
                Err(GpuError::ContextLost) => {
                    self.recover()?;
                    render_pending = true;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "frame failed");
                    retrying = false;
                }
            }
        }

        tracing::debug!("render session finishing");
        self.compositor.dispose();
        drop(self.compositor.cache().release_all(ContextRelease::Orderly));
        Ok(())
    }

    fn recover(&mut self) -> Result<()> {
        tracing::warn!("graphics context lost; recreating");
        drop(self.compositor.cache().release_all(ContextRelease::Lost));
        let backend = self.create_backend()?;
        self.compositor.cache().reserve_all(backend);
        Ok(())
    }

    fn create_backend(&mut self) -> Result<Box<dyn GpuBackend>> {
        (self.backend)().context("failed to create GPU backend")
    }
}
