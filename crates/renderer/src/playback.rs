//! Timed walk over the samples of a track.
//!
//! A [`SequencePlayer`] owns one thread that hands each sample of a
//! [`FrameSchedule`] to a caller-supplied closure and then sleeps for that
//! sample's duration. Players start paused unless configured otherwise.
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use imagegraph::{ContainerModel, ModelError, SampleId, TrackId};
use viewconfig::PlaybackConfig;

use crate::resources::lock;

/// One entry of a [`FrameSchedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    pub sample: SampleId,
    pub duration: Duration,
}

/// Presentation order of a track with the time each sample stays on screen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameSchedule {
    slots: Vec<FrameSlot>,
}

impl FrameSchedule {
    /// Each sample lasts until the next timestamp; the last one lasts until
    /// the end of the track. Zero-length slots get `fallback`.
    pub fn for_track(
        model: &dyn ContainerModel,
        track: TrackId,
        fallback: Duration,
    ) -> Result<Self, ModelError> {
        let stamps = model.timestamps(track)?;
        let end = model.track_duration(track)?;
        let slots = stamps
            .iter()
            .enumerate()
            .map(|(index, stamp)| {
                let until = stamps.get(index + 1).map_or(end, |next| next.time);
                let duration = until.saturating_sub(stamp.time);
                FrameSlot {
                    sample: stamp.sample,
                    duration: if duration.is_zero() { fallback } else { duration },
                }
            })
            .collect();
        Ok(Self { slots })
    }

    pub fn from_slots(slots: Vec<FrameSlot>) -> Self {
        Self { slots }
    }

    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn total(&self) -> Duration {
        self.slots.iter().map(|slot| slot.duration).sum()
    }
}

#[derive(Debug)]
struct GateState {
    running: bool,
    paused: bool,
}

#[derive(Debug)]
struct Gate {
    state: Mutex<GateState>,
    wake: Condvar,
}

impl Gate {
    /// Blocks while paused. Returns `false` once the player has stopped.
    fn pass(&self) -> bool {
        let state = lock(&self.state);
        let state = self
            .wake
            .wait_while(state, |state| state.running && state.paused)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.running
    }

    /// Sleeps for `duration` unless stopped first.
    fn sleep(&self, duration: Duration) -> bool {
        let state = lock(&self.state);
        let (state, _) = self
            .wake
            .wait_timeout_while(state, duration, |state| state.running)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.running
    }

    fn update(&self, f: impl FnOnce(&mut GateState)) {
        f(&mut lock(&self.state));
        self.wake.notify_all();
    }
}

/// Background thread stepping through a [`FrameSchedule`].
#[derive(Debug)]
pub struct SequencePlayer {
    gate: Arc<Gate>,
    handle: Option<JoinHandle<()>>,
}

impl SequencePlayer {
    /// Starts the player thread. `show` receives every sample in turn and
    /// returns `false` when nobody is listening any more, which ends playback.
    pub fn spawn<F>(schedule: FrameSchedule, config: &PlaybackConfig, show: F) -> Result<Self>
    where
        F: FnMut(SampleId) -> bool + Send + 'static,
    {
        let gate = Arc::new(Gate {
            state: Mutex::new(GateState {
                running: true,
                paused: config.start_paused,
            }),
            wake: Condvar::new(),
        });
        let looping = config.looping;
        let thread_gate = Arc::clone(&gate);
        let handle = thread::Builder::new()
            .name("sequence-player".into())
            .spawn(move || play(&thread_gate, &schedule, looping, show))
            .map_err(|err| anyhow!("failed to spawn sequence player: {err}"))?;
        Ok(Self {
            gate,
            handle: Some(handle),
        })
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.gate.state).paused
    }

    /// `false` once stopped or once a non-looping schedule has run out.
    pub fn is_running(&self) -> bool {
        lock(&self.gate.state).running
    }

    pub fn resume(&self) {
        self.gate.update(|state| state.paused = false);
    }

    pub fn pause(&self) {
        self.gate.update(|state| state.paused = true);
    }

    /// Flips between playing and paused; returns whether it is now playing.
    pub fn toggle(&self) -> bool {
        let mut playing = false;
        self.gate.update(|state| {
            state.paused = !state.paused;
            playing = !state.paused;
        });
        playing
    }

    /// Ends playback and waits for the thread.
    pub fn stop(&mut self) {
        self.gate.update(|state| {
            state.running = false;
            state.paused = false;
        });
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("sequence player thread panicked");
            }
        }
    }
}

impl Drop for SequencePlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn play<F>(gate: &Gate, schedule: &FrameSchedule, looping: bool, mut show: F)
where
    F: FnMut(SampleId) -> bool,
{
    let slots = schedule.slots();
    let mut index = 0;
    tracing::debug!(samples = slots.len(), looping, "sequence player started");
    while !slots.is_empty() && gate.pass() {
        let slot = slots[index];
        if !show(slot.sample) {
            tracing::debug!(sample = %slot.sample, "frame receiver gone; stopping playback");
            break;
        }
        index += 1;
        if index == slots.len() {
            if !looping {
                break;
            }
            index = 0;
        }
        if !gate.sleep(slot.duration) {
            break;
        }
    }
    gate.update(|state| state.running = false);
    tracing::debug!("sequence player finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
    use std::time::Instant;

    use crate::testing::track_container;

    fn schedule(samples: &[u32], millis: u64) -> FrameSchedule {
        FrameSchedule::from_slots(
            samples
                .iter()
                .map(|id| FrameSlot {
                    sample: SampleId(*id),
                    duration: Duration::from_millis(millis),
                })
                .collect(),
        )
    }

    fn config(start_paused: bool, looping: bool) -> PlaybackConfig {
        PlaybackConfig {
            start_paused,
            looping,
            ..PlaybackConfig::default()
        }
    }

    fn player(
        schedule: FrameSchedule,
        config: &PlaybackConfig,
    ) -> (SequencePlayer, Receiver<SampleId>) {
        let (tx, rx) = unbounded();
        let player = SequencePlayer::spawn(schedule, config, move |sample| tx.send(sample).is_ok())
            .unwrap();
        (player, rx)
    }

    fn wait_until_stopped(player: &SequencePlayer) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while player.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn schedule_uses_timestamp_gaps_and_track_end() {
        let model = track_container(TrackId(1), &[(0, &[]), (1, &[0]), (2, &[1])]);
        let schedule =
            FrameSchedule::for_track(model.as_ref(), TrackId(1), Duration::from_millis(40))
                .unwrap();
        let durations: Vec<_> = schedule.slots().iter().map(|slot| slot.duration).collect();
        // The fixture has no declared duration, so the track ends at the
        // last timestamp and the final slot falls back.
        assert_eq!(
            durations,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::from_millis(40),
            ]
        );
        assert_eq!(schedule.total(), Duration::from_millis(240));
    }

    #[test]
    fn schedule_for_unknown_track_fails() {
        let model = track_container(TrackId(1), &[(0, &[])]);
        assert!(FrameSchedule::for_track(model.as_ref(), TrackId(9), Duration::ZERO).is_err());
    }

    #[test]
    fn paused_player_shows_nothing_until_resumed() {
        let (player, rx) = player(schedule(&[1, 2], 1), &config(true, false));
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(50)),
            Err(RecvTimeoutError::Timeout)
        );
        assert!(player.is_paused());

        player.resume();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(SampleId(1)));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(SampleId(2)));
        wait_until_stopped(&player);
        assert!(!player.is_running());
    }

    #[test]
    fn looping_player_wraps_to_the_first_sample() {
        let (mut player, rx) = player(schedule(&[7, 8], 1), &config(false, true));
        let shown: Vec<_> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        player.stop();
        assert_eq!(
            shown,
            vec![SampleId(7), SampleId(8), SampleId(7), SampleId(8), SampleId(7)]
        );
    }

    #[test]
    fn toggle_pauses_and_resumes() {
        let (mut player, _rx) = player(schedule(&[1], 1), &config(true, true));
        assert!(player.toggle());
        assert!(!player.is_paused());
        assert!(!player.toggle());
        assert!(player.is_paused());
        player.stop();
        assert!(!player.is_running());
    }

    #[test]
    fn stop_interrupts_a_long_sleep() {
        let (mut player, rx) = player(schedule(&[1, 2], 60_000), &config(false, true));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(SampleId(1)));
        let started = Instant::now();
        player.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn closed_receiver_ends_playback() {
        let (player, rx) = player(schedule(&[1, 2, 3], 1), &config(false, true));
        drop(rx);
        wait_until_stopped(&player);
        assert!(!player.is_running());
    }

    #[test]
    fn empty_schedule_finishes_immediately() {
        let (player, _rx) = player(FrameSchedule::default(), &config(false, true));
        wait_until_stopped(&player);
        assert!(!player.is_running());
    }
}
