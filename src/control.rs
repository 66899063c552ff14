//! User controls for audio playback (start/stop/loop) and source scheduling

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::AtomicF64;

/// Playback lifecycle of a scheduled source node.
///
/// States only ever advance:
/// `Unscheduled → Scheduled → Playing → Finished`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    Unscheduled,
    Scheduled,
    Playing,
    Finished,
}

impl From<u8> for PlaybackState {
    fn from(i: u8) -> Self {
        use PlaybackState::*;

        match i {
            0 => Unscheduled,
            1 => Scheduled,
            2 => Playing,
            3 => Finished,
            _ => unreachable!(),
        }
    }
}

/// The sub-quantum render window of a scheduled source.
///
/// Frames before `offset` and after `offset + count` must be written as
/// silence by the source's renderer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct QuantumWindow {
    /// Index within the quantum where playback begins.
    pub offset: usize,
    /// Number of non-silent frames to render.
    pub count: usize,
    /// The scheduled stop time falls inside this quantum; the renderer
    /// should call [`Scheduler::finish`] after rendering the window.
    pub ends: bool,
}

type OnEnded = Box<dyn FnOnce() + Send + 'static>;

/// Start/stop schedule of one source, shared between its control handle and
/// its renderer.
#[derive(Clone)]
pub struct Scheduler {
    start: Arc<AtomicF64>,
    stop: Arc<AtomicF64>,
    state: Arc<AtomicU8>,
    on_ended: Arc<Mutex<Option<OnEnded>>>,
}

impl Scheduler {
    /// A fresh schedule in the `Unscheduled` state.
    pub fn new() -> Self {
        Self {
            start: Arc::new(AtomicF64::new(f64::MAX)),
            stop: Arc::new(AtomicF64::new(f64::MAX)),
            state: Arc::new(AtomicU8::new(PlaybackState::Unscheduled as u8)),
            on_ended: Arc::new(Mutex::new(None)),
        }
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.state.load(Ordering::SeqCst).into()
    }

    /// Whether `ts` falls inside the scheduled playback interval.
    pub fn is_active(&self, ts: f64) -> bool {
        ts >= self.start.load() && ts < self.stop.load()
    }

    /// Schedule playback start at this timestamp.
    ///
    /// Subsequent calls are ignored, a source can only be started once.
    pub fn start_at(&self, start: f64) {
        let unscheduled = PlaybackState::Unscheduled as u8;
        let scheduled = PlaybackState::Scheduled as u8;

        if self
            .state
            .compare_exchange(unscheduled, scheduled, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.start.store(start.max(0.));
        } else {
            log::warn!("source already started, ignoring start_at");
        }
    }

    /// Stop playback at this timestamp
    pub fn stop_at(&self, stop: f64) {
        if self.playback_state() == PlaybackState::Unscheduled {
            log::warn!("source not started, ignoring stop_at");
            return;
        }
        self.stop.store(stop.max(0.));
    }

    /// Register a callback fired once when playback finishes.
    pub fn set_on_ended<F: FnOnce() + Send + 'static>(&self, callback: F) {
        *self.on_ended.lock().unwrap() = Some(Box::new(callback));
    }

    /// Transition to Finished and fire the `on_ended` callback.
    ///
    /// Called from the render thread; the callback slot is only try-locked
    /// so a contending control thread defers the callback to the next
    /// quantum, never the audio.
    pub(crate) fn finish(&self) {
        let finished = PlaybackState::Finished as u8;
        if self.state.swap(finished, Ordering::SeqCst) == finished {
            return;
        }

        if let Ok(mut slot) = self.on_ended.try_lock() {
            if let Some(callback) = slot.take() {
                callback();
            }
        }
    }

    pub(crate) fn has_finished(&self) -> bool {
        self.playback_state() == PlaybackState::Finished
    }

    /// Compute the frame-accurate render window for the quantum starting at
    /// `ts`. Returns `None` when the source is entirely silent this quantum
    /// (not yet started, or finished).
    ///
    /// Flips Scheduled → Playing when the start time is first reached.
    pub(crate) fn quantum_window(
        &self,
        ts: f64,
        frames: usize,
        sample_rate: crate::SampleRate,
    ) -> Option<QuantumWindow> {
        match self.playback_state() {
            PlaybackState::Unscheduled | PlaybackState::Finished => return None,
            PlaybackState::Scheduled | PlaybackState::Playing => (),
        }

        let rate = sample_rate.0 as f64;
        let quantum_duration = frames as f64 / rate;
        let start = self.start.load();
        let stop = self.stop.load();

        if start >= ts + quantum_duration {
            return None; // starts in a later quantum
        }

        if stop <= ts {
            // stop elapsed before this quantum was reached
            return Some(QuantumWindow {
                offset: 0,
                count: 0,
                ends: true,
            });
        }

        let offset = if start <= ts {
            0
        } else {
            (((start - ts) * rate).round() as usize).min(frames)
        };

        let (end_frame, ends) = if stop < ts + quantum_duration {
            ((((stop - ts) * rate).round() as usize).min(frames), true)
        } else {
            (frames, false)
        };

        self.state
            .store(PlaybackState::Playing as u8, Ordering::SeqCst);

        Some(QuantumWindow {
            offset,
            count: end_frame.saturating_sub(offset),
            ends,
        })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Loop region and seek controls of a sample-playing source, wrapping its
/// [`Scheduler`].
#[derive(Clone)]
pub struct Controller {
    scheduler: Arc<Scheduler>,
    // NaN marks the empty slot: no seek requested
    seek: Arc<AtomicF64>,
    loop_: Arc<AtomicBool>,
    loop_start: Arc<AtomicF64>,
    loop_end: Arc<AtomicF64>,
}

impl Controller {
    /// A fresh controller: not looping, nothing scheduled.
    pub fn new() -> Self {
        Self {
            scheduler: Arc::new(Scheduler::new()),
            seek: Arc::new(AtomicF64::new(f64::NAN)),
            loop_: Arc::new(AtomicBool::new(false)),
            loop_start: Arc::new(AtomicF64::new(0.)),
            loop_end: Arc::new(AtomicF64::new(f64::MAX)),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn loop_(&self) -> bool {
        self.loop_.load(Ordering::SeqCst)
    }

    pub fn set_loop(&self, loop_: bool) {
        self.loop_.store(loop_, Ordering::SeqCst);
    }

    pub fn loop_start(&self) -> f64 {
        self.loop_start.load()
    }

    pub fn set_loop_start(&self, loop_start: f64) {
        self.loop_start.store(loop_start);
    }

    pub fn loop_end(&self) -> f64 {
        self.loop_end.load()
    }

    pub fn set_loop_end(&self, loop_end: f64) {
        self.loop_end.store(loop_end);
    }

    pub fn seek(&self, timestamp: f64) {
        self.seek.store(timestamp);
    }

    pub(crate) fn should_seek(&self) -> Option<f64> {
        let prev = self.seek.swap(f64::NAN);
        if prev.is_nan() {
            None
        } else {
            Some(prev)
        }
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SampleRate;

    #[test]
    fn test_controller() {
        let controller = Controller::new();

        assert!(!controller.loop_());
        assert!(controller.loop_start() == 0.);
        assert!(controller.loop_end() == f64::MAX);
        assert!(controller.should_seek().is_none());

        controller.seek(1.);
        assert_eq!(controller.should_seek(), Some(1.));
        assert!(controller.should_seek().is_none());
    }

    #[test]
    fn test_scheduler_states() {
        let scheduler = Scheduler::new();
        assert_eq!(scheduler.playback_state(), PlaybackState::Unscheduled);

        // stop before start is refused
        scheduler.stop_at(1.);
        assert!(!scheduler.is_active(2.));

        scheduler.start_at(1.);
        assert_eq!(scheduler.playback_state(), PlaybackState::Scheduled);

        // second start is ignored
        scheduler.start_at(5.);
        assert!(scheduler.is_active(1.5));

        scheduler.finish();
        assert_eq!(scheduler.playback_state(), PlaybackState::Finished);
    }

    #[test]
    fn test_quantum_window_frame_accuracy() {
        let scheduler = Scheduler::new();
        let sample_rate = SampleRate(100);

        // start falls at frame 130 = quantum 1, offset 2
        scheduler.start_at(1.30);

        assert_eq!(scheduler.quantum_window(0., 128, sample_rate), None);

        let window = scheduler.quantum_window(1.28, 128, sample_rate).unwrap();
        assert_eq!(window.offset, 2);
        assert_eq!(window.count, 126);
        assert!(!window.ends);
        assert_eq!(scheduler.playback_state(), PlaybackState::Playing);
    }

    #[test]
    fn test_quantum_window_stop() {
        let scheduler = Scheduler::new();
        let sample_rate = SampleRate(100);

        scheduler.start_at(0.);
        scheduler.stop_at(1.);

        let window = scheduler.quantum_window(0., 128, sample_rate).unwrap();
        assert_eq!(window.offset, 0);
        assert_eq!(window.count, 100);
        assert!(window.ends);

        scheduler.finish();
        assert_eq!(scheduler.quantum_window(1.28, 128, sample_rate), None);
    }

    #[test]
    fn test_on_ended_fires_once() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicU32::new(0));

        let fired = count.clone();
        scheduler.set_on_ended(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.start_at(0.);
        scheduler.finish();
        scheduler.finish();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
