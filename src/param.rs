//! AudioParam interface: per-parameter automation timelines and their
//! render-side processors
//!
//! Parameters are full members of the render graph: each `AudioParam` is
//! backed by a processor node whose single output carries the computed
//! per-quantum value buffer, and audio-rate modulators are ordinary edges
//! into that node's input. The owning node reads the buffer through
//! [`crate::process::AudioParamValues`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};

use crate::buffer::{
    ChannelConfig, ChannelConfigOptions, ChannelCountMode, ChannelInterpretation,
};
use crate::bus::AudioBus;
use crate::context::AudioContextRegistration;
use crate::node::AudioNode;
use crate::process::{AudioParamValues, AudioProcessor};
use crate::{AudioGraphError, SampleRate, RENDER_QUANTUM_SIZE};

/// Per-quantum smoothing factor of the de-zippering filter applied to
/// direct value sets.
const SMOOTHING_CONSTANT: f32 = 0.05;
/// Distance below which the de-zippered value snaps to its target.
const SNAP_THRESHOLD: f32 = 1e-3;

/// Options for constructing an [`AudioParam`]
#[derive(Clone, Debug)]
pub struct AudioParamOptions {
    pub min_value: f32,
    pub max_value: f32,
    pub default_value: f32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum EventKind {
    SetValue,
    LinearRampToValue,
    ExponentialRampToValue,
    SetTarget,
    SetValueCurve,
}

/// A single automation event on a parameter timeline.
#[derive(Clone, Debug)]
pub(crate) struct AutomationEvent {
    kind: EventKind,
    value: f32,
    time: f64,
    time_constant: f64,
    duration: f64,
    curve: Option<Arc<Vec<f32>>>,
}

/// Timeline edits shipped over the control message channel.
#[derive(Clone, Debug)]
pub(crate) enum AutomationMessage {
    Insert(AutomationEvent),
    CancelValues { time: f64 },
}

fn is_valid_number(x: f64) -> bool {
    x.is_finite()
}

/// An ordered list of automation events, evaluated per sample.
///
/// Used in two places: the render-side authoritative timeline, and a
/// control-side shadow that validates inserts synchronously so overlap
/// errors surface to the caller while leaving both timelines untouched.
#[derive(Clone, Debug, Default)]
pub(crate) struct AudioParamTimeline {
    events: Vec<AutomationEvent>,
}

impl AudioParamTimeline {
    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn insert(&mut self, event: AutomationEvent) -> Result<(), AudioGraphError> {
        let valid = event.time >= 0.
            && is_valid_number(event.time)
            && is_valid_number(event.value as f64)
            && event.time_constant >= 0.
            && is_valid_number(event.time_constant)
            && event.duration >= 0.
            && is_valid_number(event.duration);
        if !valid {
            return Err(AudioGraphError::InvalidArgument(
                "automation event fields must be finite and non-negative",
            ));
        }

        let insert_time = event.time;
        let mut insert_at = self.events.len();

        for (i, existing) in self.events.iter_mut().enumerate() {
            if event.kind == EventKind::SetValueCurve {
                // a curve must not overlap any other event; starting exactly
                // at the end of another duration is fine
                let end_time = event.time + event.duration;
                if existing.time > event.time && existing.time < end_time {
                    return Err(AudioGraphError::TimelineOverlap);
                }
            } else if existing.kind == EventKind::SetValueCurve {
                let end_time = existing.time + existing.duration;
                if event.time >= existing.time && event.time < end_time {
                    return Err(AudioGraphError::TimelineOverlap);
                }
            }

            // overwrite same event type and time
            if existing.time == insert_time && existing.kind == event.kind {
                *existing = event;
                return Ok(());
            }

            if existing.time > insert_time {
                insert_at = i;
                break;
            }
        }

        self.events.insert(insert_at, event);
        Ok(())
    }

    /// Remove all events starting at or after `start_time`.
    pub fn cancel(&mut self, start_time: f64) {
        self.events.retain(|e| e.time < start_time);
    }

    /// Fill `values` with the timeline's values for the sample frames
    /// covering `[start_time, end_time)`; returns the last computed value.
    ///
    /// Frames before the first event hold `default_value`; frames after the
    /// last event hold its final value. Ramps interpolate toward the *next*
    /// event, target and curve events evaluate from the current one.
    pub fn values_for_time_range(
        &self,
        start_time: f64,
        end_time: f64,
        default_value: f32,
        values: &mut [f32],
        sample_rate: SampleRate,
    ) -> f32 {
        let number_of_values = values.len();

        if self.events.is_empty() || end_time <= self.events[0].time {
            values.iter_mut().for_each(|v| *v = default_value);
            return default_value;
        }

        let rate = sample_rate.0 as f64;
        let mut current_time = start_time;
        let mut write_index = 0;

        // initial part of the buffer up to the first event
        let first_event_time = self.events[0].time;
        if first_event_time > start_time {
            let fill_to_time = end_time.min(first_event_time);
            let fill_to_frame =
                time_to_sample_frame(fill_to_time - start_time, rate).min(number_of_values);
            while write_index < fill_to_frame {
                values[write_index] = default_value;
                write_index += 1;
            }
            current_time = fill_to_time;
        }

        let mut value = default_value;
        let n = self.events.len();

        for i in 0..n {
            if write_index >= number_of_values {
                break;
            }

            let event = &self.events[i];
            let next_event = self.events.get(i + 1);

            // wait until we get a more recent event
            if let Some(next) = next_event {
                if next.time < current_time {
                    continue;
                }
            }

            let value1 = event.value;
            let time1 = event.time;
            let (value2, time2) = match next_event {
                Some(next) => (next.value, next.time),
                None => (value1, end_time + 1.),
            };

            let delta_time = time2 - time1;
            let k = if delta_time > 0. { 1. / delta_time } else { 0. };
            let sample_frame_time_incr = 1. / rate;

            let fill_to_time = end_time.min(time2);
            let fill_to_frame =
                time_to_sample_frame(fill_to_time - start_time, rate).min(number_of_values);

            let next_kind = next_event.map(|e| e.kind);

            // ramps require looking ahead to the next event
            if next_kind == Some(EventKind::LinearRampToValue) {
                while write_index < fill_to_frame {
                    let x = ((current_time - time1) * k) as f32;
                    value = (1. - x) * value1 + x * value2;
                    values[write_index] = value;
                    write_index += 1;
                    current_time += sample_frame_time_incr;
                }
            } else if next_kind == Some(EventKind::ExponentialRampToValue) {
                if value1 <= 0. || value2 <= 0. {
                    // invalid endpoints, propagate previous value
                    while write_index < fill_to_frame {
                        values[write_index] = value;
                        write_index += 1;
                    }
                    current_time = fill_to_time;
                } else {
                    let num_sample_frames = (delta_time * rate) as f32;
                    let ratio = value2 / value1;
                    let multiplier = ratio.powf(1. / num_sample_frames);

                    // starting value of the ramp at the current frame
                    value = value1
                        * ratio.powf(
                            time_to_sample_frame(current_time - time1, rate) as f32
                                / num_sample_frames,
                        );

                    while write_index < fill_to_frame {
                        values[write_index] = value;
                        value *= multiplier;
                        write_index += 1;
                        current_time += sample_frame_time_incr;
                    }
                }
            } else {
                match event.kind {
                    EventKind::SetValue
                    | EventKind::LinearRampToValue
                    | EventKind::ExponentialRampToValue => {
                        // simply stay at a constant value
                        current_time = fill_to_time;
                        value = value1;
                        while write_index < fill_to_frame {
                            values[write_index] = value;
                            write_index += 1;
                        }
                    }

                    EventKind::SetTarget => {
                        // exponential approach to the target with the given
                        // time constant; stepping from `value` continues the
                        // trajectory seamlessly across quantum boundaries
                        // because the caller feeds back the previous final
                        // value as the default
                        let target = value1;
                        let tc = event.time_constant;
                        if tc <= 0. {
                            value = target;
                            while write_index < fill_to_frame {
                                values[write_index] = value;
                                write_index += 1;
                            }
                        } else {
                            let discrete_time_constant =
                                (1. - (-1. / (rate * tc)).exp()) as f32;
                            while write_index < fill_to_frame {
                                values[write_index] = value;
                                value += (target - value) * discrete_time_constant;
                                write_index += 1;
                            }
                        }
                        current_time = fill_to_time;
                    }

                    EventKind::SetValueCurve => {
                        let curve = event.curve.as_ref();
                        let curve_len = curve.map(|c| c.len()).unwrap_or(0);
                        let duration = event.duration;

                        if curve_len == 0 || duration <= 0. || rate <= 0. {
                            // error condition, propagate previous value
                            current_time = fill_to_time;
                            while write_index < fill_to_frame {
                                values[write_index] = value;
                                write_index += 1;
                            }
                            continue;
                        }
                        let curve_data = curve.unwrap();

                        // how much to step the curve index per frame
                        let curve_points_per_frame =
                            (curve_len as f64 - 1.) / duration / rate;

                        // the curve spans its own duration, not the time to
                        // the next event
                        let next_event_fill_to_frame = fill_to_frame;
                        let next_event_fill_to_time = fill_to_time;
                        let curve_fill_to_time = end_time.min(time1 + duration);
                        let curve_fill_to_frame =
                            time_to_sample_frame((curve_fill_to_time - start_time).max(0.), rate)
                                .min(number_of_values);

                        // floating point index into the curve data
                        let mut curve_virtual_index = 0.;
                        if time1 < current_time {
                            let frame_offset = (current_time - time1) * rate;
                            curve_virtual_index = curve_points_per_frame * frame_offset;
                        }

                        // curve already fully elapsed: hold its last point
                        if start_time >= time1 + duration {
                            value = *curve_data.last().unwrap();
                        }

                        // nearest neighbor sampling of the stretched curve
                        while write_index < curve_fill_to_frame {
                            let curve_index = (0.5 + curve_virtual_index) as usize;
                            curve_virtual_index += curve_points_per_frame;

                            if curve_index < curve_len {
                                value = curve_data[curve_index];
                            }
                            values[write_index] = value;
                            write_index += 1;
                        }

                        // time between the end of the curve and the next
                        // event holds the last curve value
                        while write_index < next_event_fill_to_frame {
                            values[write_index] = value;
                            write_index += 1;
                        }

                        current_time = next_event_fill_to_time;
                    }
                }
            }
        }

        // propagate the last value to the end of the buffer
        while write_index < number_of_values {
            values[write_index] = value;
            write_index += 1;
        }

        value
    }
}

fn time_to_sample_frame(time: f64, sample_rate: f64) -> usize {
    (time * sample_rate).round().max(0.) as usize
}

/// A float32 shared between the control and render threads.
#[derive(Debug)]
pub(crate) struct AtomicF32 {
    bits: AtomicU32,
}

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self {
            bits: AtomicU32::new(value.to_bits()),
        }
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::SeqCst))
    }

    pub fn store(&self, value: f32) {
        self.bits.store(value.to_bits(), Ordering::SeqCst)
    }
}

/// Parts of an [`AudioParam`] without its context registration; used to
/// reconstruct handles for context-owned params (the listener).
pub(crate) struct AudioParamRaw {
    value: Arc<AtomicF32>,
    sender: Sender<AutomationMessage>,
    shadow: Arc<Mutex<AudioParamTimeline>>,
    default_value: f32,
    min_value: f32,
    max_value: f32,
    channel_config: ChannelConfig,
}

impl Clone for AudioParamRaw {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            sender: self.sender.clone(),
            shadow: self.shadow.clone(),
            default_value: self.default_value,
            min_value: self.min_value,
            max_value: self.max_value,
            channel_config: self.channel_config.clone(),
        }
    }
}

/// An audio-rate automatable parameter of an [`AudioNode`].
///
/// The current value can be set directly (de-zippered on the render thread),
/// scheduled through the automation methods, or driven by connecting another
/// node's output to this param (it accepts input like any node).
pub struct AudioParam {
    registration: AudioContextRegistration,
    value: Arc<AtomicF32>,
    sender: Sender<AutomationMessage>,
    shadow: Arc<Mutex<AudioParamTimeline>>,
    default_value: f32,
    min_value: f32,
    max_value: f32,
    channel_config: ChannelConfig,
}

impl AudioNode for AudioParam {
    fn registration(&self) -> &AudioContextRegistration {
        &self.registration
    }

    fn channel_config_raw(&self) -> &ChannelConfig {
        &self.channel_config
    }

    fn number_of_inputs(&self) -> u32 {
        1 // audio-rate modulators
    }

    fn number_of_outputs(&self) -> u32 {
        1 // the computed value buffer
    }
}

impl AudioParam {
    pub fn default_value(&self) -> f32 {
        self.default_value
    }

    pub fn min_value(&self) -> f32 {
        self.min_value
    }

    pub fn max_value(&self) -> f32 {
        self.max_value
    }

    /// Current intrinsic value.
    ///
    /// Reflects the most recent direct set, or the latest automation value
    /// computed by the render thread.
    pub fn value(&self) -> f32 {
        self.value.load()
    }

    /// Set the intrinsic value.
    ///
    /// The value is clamped to `[min_value, max_value]` silently. The render
    /// thread smoothly approaches the new value to avoid audible steps.
    pub fn set_value(&self, value: f32) {
        self.value.store(value.clamp(self.min_value, self.max_value));
    }

    /// Schedule a jump to `value` at `time`, holding until the next event.
    pub fn set_value_at_time(&self, value: f32, time: f64) -> Result<(), AudioGraphError> {
        self.schedule(AutomationEvent {
            kind: EventKind::SetValue,
            value,
            time,
            time_constant: 0.,
            duration: 0.,
            curve: None,
        })
    }

    /// Schedule a linear interpolation from the previous event towards
    /// `value`, arriving at `time`.
    pub fn linear_ramp_to_value_at_time(
        &self,
        value: f32,
        time: f64,
    ) -> Result<(), AudioGraphError> {
        self.schedule(AutomationEvent {
            kind: EventKind::LinearRampToValue,
            value,
            time,
            time_constant: 0.,
            duration: 0.,
            curve: None,
        })
    }

    /// Schedule an exponential interpolation from the previous event towards
    /// `value`, arriving at `time`. Non-positive endpoints propagate the
    /// previous value instead.
    pub fn exponential_ramp_to_value_at_time(
        &self,
        value: f32,
        time: f64,
    ) -> Result<(), AudioGraphError> {
        self.schedule(AutomationEvent {
            kind: EventKind::ExponentialRampToValue,
            value,
            time,
            time_constant: 0.,
            duration: 0.,
            curve: None,
        })
    }

    /// Schedule an exponential approach to `value` starting at `time` with
    /// the given time constant, running until the next event.
    pub fn set_target_at_time(
        &self,
        value: f32,
        time: f64,
        time_constant: f64,
    ) -> Result<(), AudioGraphError> {
        self.schedule(AutomationEvent {
            kind: EventKind::SetTarget,
            value,
            time,
            time_constant,
            duration: 0.,
            curve: None,
        })
    }

    /// Schedule `curve` to play over `[time, time + duration)`, resampled to
    /// per-sample values. The curve must not overlap any other event.
    pub fn set_value_curve_at_time(
        &self,
        curve: &[f32],
        time: f64,
        duration: f64,
    ) -> Result<(), AudioGraphError> {
        if curve.len() < 2 {
            return Err(AudioGraphError::InvalidArgument(
                "automation curve must contain at least two values",
            ));
        }
        if curve.iter().any(|v| !v.is_finite()) {
            return Err(AudioGraphError::InvalidArgument(
                "automation curve values must be finite",
            ));
        }
        if duration <= 0. {
            return Err(AudioGraphError::InvalidArgument(
                "automation curve duration must be strictly positive",
            ));
        }

        self.schedule(AutomationEvent {
            kind: EventKind::SetValueCurve,
            value: 0.,
            time,
            time_constant: 0.,
            duration,
            curve: Some(Arc::new(curve.to_vec())),
        })
    }

    /// Remove all scheduled events at or after `start_time`.
    pub fn cancel_scheduled_values(&self, start_time: f64) {
        self.shadow.lock().unwrap().cancel(start_time);
        self.registration.context().pass_audio_param_event(
            &self.sender,
            AutomationMessage::CancelValues { time: start_time },
        );
    }

    /// Validate against the shadow timeline, then ship to the render thread.
    /// Holding the shadow lock across the send keeps event order identical
    /// on both sides.
    fn schedule(&self, event: AutomationEvent) -> Result<(), AudioGraphError> {
        let mut shadow = self.shadow.lock().unwrap();
        shadow.insert(event.clone())?;
        self.registration
            .context()
            .pass_audio_param_event(&self.sender, AutomationMessage::Insert(event));
        Ok(())
    }

    pub(crate) fn into_raw_parts(self) -> AudioParamRaw {
        AudioParamRaw {
            value: self.value,
            sender: self.sender,
            shadow: self.shadow,
            default_value: self.default_value,
            min_value: self.min_value,
            max_value: self.max_value,
            channel_config: self.channel_config,
        }
    }

    pub(crate) fn from_raw_parts(
        registration: AudioContextRegistration,
        parts: AudioParamRaw,
    ) -> Self {
        Self {
            registration,
            value: parts.value,
            sender: parts.sender,
            shadow: parts.shadow,
            default_value: parts.default_value,
            min_value: parts.min_value,
            max_value: parts.max_value,
            channel_config: parts.channel_config,
        }
    }
}

/// Render-side counterpart of an [`AudioParam`].
///
/// Owns the authoritative timeline. Its single output channel carries the
/// computed value for every frame of the quantum: the timeline value when
/// automation is active (a-rate), otherwise the de-zippered intrinsic value
/// broadcast across the quantum (k-rate), plus the sum of any connected
/// modulators.
pub(crate) struct AudioParamProcessor {
    intrinsic: Arc<AtomicF32>,
    smoothed: f32,
    timeline: AudioParamTimeline,
    receiver: Receiver<AutomationMessage>,
}

impl AudioProcessor for AudioParamProcessor {
    fn process(
        &mut self,
        inputs: &[AudioBus],
        outputs: &mut [AudioBus],
        _params: AudioParamValues,
        timestamp: f64,
        sample_rate: SampleRate,
    ) {
        for message in self.receiver.try_iter() {
            match message {
                // already validated by the control-side shadow
                AutomationMessage::Insert(event) => {
                    if let Err(e) = self.timeline.insert(event) {
                        log::warn!("dropping automation event: {}", e);
                    }
                }
                AutomationMessage::CancelValues { time } => self.timeline.cancel(time),
            }
        }

        let output = &mut outputs[0];
        output.force_mono();

        if self.timeline.has_events() {
            let end_time = timestamp + RENDER_QUANTUM_SIZE as f64 / sample_rate.0 as f64;
            let default_value = self.intrinsic.load();

            let channel = output.channel_data_mut(0).as_mut_slice();
            let final_value = self.timeline.values_for_time_range(
                timestamp,
                end_time,
                default_value,
                channel,
                sample_rate,
            );

            // the intrinsic value tracks the automation
            self.intrinsic.store(final_value);
            self.smoothed = final_value;
        } else {
            // de-zipper towards the intrinsic value, one step per quantum
            let target = self.intrinsic.load();
            if (target - self.smoothed).abs() < SNAP_THRESHOLD {
                self.smoothed = target;
            } else {
                self.smoothed += (target - self.smoothed) * SMOOTHING_CONSTANT;
            }
            let smoothed = self.smoothed;
            output
                .channel_data_mut(0)
                .as_mut_slice()
                .iter_mut()
                .for_each(|v| *v = smoothed);
        }

        // audio-rate modulators sum on top of the timeline value
        let input = &inputs[0];
        if !input.is_silent() {
            output
                .channel_data_mut(0)
                .as_mut_slice()
                .iter_mut()
                .zip(input.channel_data(0).as_slice())
                .for_each(|(v, m)| *v += m);
        }
    }

    fn propagates_silence(&self, _now: f64, _last_non_silent: f64) -> bool {
        // params must evaluate their timeline every quantum
        false
    }
}

/// Construct the control/render pair backing one parameter.
pub(crate) fn audio_param_pair(
    opts: AudioParamOptions,
    registration: AudioContextRegistration,
) -> (AudioParam, AudioParamProcessor) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    let intrinsic = Arc::new(AtomicF32::new(opts.default_value));

    // modulators mix down to a single channel before summing
    let channel_config = ChannelConfigOptions {
        count: 1,
        mode: ChannelCountMode::Explicit,
        interpretation: ChannelInterpretation::Speakers,
    }
    .into();

    let param = AudioParam {
        registration,
        value: intrinsic.clone(),
        sender,
        shadow: Arc::new(Mutex::new(AudioParamTimeline::default())),
        default_value: opts.default_value,
        min_value: opts.min_value,
        max_value: opts.max_value,
        channel_config,
    };

    let processor = AudioParamProcessor {
        intrinsic,
        smoothed: opts.default_value,
        timeline: AudioParamTimeline::default(),
        receiver,
    };

    (param, processor)
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use super::*;

    fn set_value(value: f32, time: f64) -> AutomationEvent {
        AutomationEvent {
            kind: EventKind::SetValue,
            value,
            time,
            time_constant: 0.,
            duration: 0.,
            curve: None,
        }
    }

    fn linear_ramp(value: f32, time: f64) -> AutomationEvent {
        AutomationEvent {
            kind: EventKind::LinearRampToValue,
            value,
            time,
            time_constant: 0.,
            duration: 0.,
            curve: None,
        }
    }

    fn exponential_ramp(value: f32, time: f64) -> AutomationEvent {
        AutomationEvent {
            kind: EventKind::ExponentialRampToValue,
            value,
            time,
            time_constant: 0.,
            duration: 0.,
            curve: None,
        }
    }

    fn set_target(value: f32, time: f64, time_constant: f64) -> AutomationEvent {
        AutomationEvent {
            kind: EventKind::SetTarget,
            value,
            time,
            time_constant,
            duration: 0.,
            curve: None,
        }
    }

    fn curve_event(curve: Vec<f32>, time: f64, duration: f64) -> AutomationEvent {
        AutomationEvent {
            kind: EventKind::SetValueCurve,
            value: 0.,
            time,
            time_constant: 0.,
            duration,
            curve: Some(Arc::new(curve)),
        }
    }

    #[test]
    fn test_insert_sorted_and_overwrite() {
        let mut timeline = AudioParamTimeline::default();
        timeline.insert(set_value(2., 2.)).unwrap();
        timeline.insert(set_value(1., 1.)).unwrap();
        timeline.insert(set_value(3., 3.)).unwrap();

        let times: Vec<f64> = timeline.events.iter().map(|e| e.time).collect();
        assert_eq!(times, vec![1., 2., 3.]);

        // same type and time overwrites in place
        timeline.insert(set_value(10., 2.)).unwrap();
        assert_eq!(timeline.events.len(), 3);
        assert_float_eq!(timeline.events[1].value, 10., abs_all <= 0.);

        // same time, different type coexists
        timeline.insert(linear_ramp(5., 2.)).unwrap();
        assert_eq!(timeline.events.len(), 4);
    }

    #[test]
    fn test_curve_overlap_rejected() {
        let mut timeline = AudioParamTimeline::default();
        timeline.insert(curve_event(vec![0., 1.], 1., 1.)).unwrap();

        // non-curve event inside the curve's span
        assert!(matches!(
            timeline.insert(set_value(1., 1.5)),
            Err(AudioGraphError::TimelineOverlap)
        ));

        // curve overlapping an existing event
        timeline.insert(set_value(1., 3.)).unwrap();
        assert!(matches!(
            timeline.insert(curve_event(vec![0., 1.], 2.5, 1.)),
            Err(AudioGraphError::TimelineOverlap)
        ));

        // starting exactly at the end of the curve is allowed
        timeline.insert(set_value(1., 2.)).unwrap();
    }

    #[test]
    fn test_cancel_scheduled_values() {
        let mut timeline = AudioParamTimeline::default();
        timeline.insert(set_value(1., 1.)).unwrap();
        timeline.insert(set_value(2., 2.)).unwrap();
        timeline.insert(set_value(3., 3.)).unwrap();

        timeline.cancel(2.);
        assert_eq!(timeline.events.len(), 1);
        assert_eq!(timeline.events[0].time, 1.);
    }

    #[test]
    fn test_default_before_first_event() {
        let timeline = {
            let mut t = AudioParamTimeline::default();
            t.insert(set_value(5., 1.)).unwrap();
            t
        };

        let mut values = [0.; 10];
        // 10 frames at 10 Hz = [0, 1) seconds, event starts at 1s
        let last = timeline.values_for_time_range(0., 1., 3., &mut values, SampleRate(10));
        assert_float_eq!(values[..], [3.; 10][..], abs_all <= 0.);
        assert_float_eq!(last, 3., abs_all <= 0.);

        // next quantum holds the event value
        let last = timeline.values_for_time_range(1., 2., 3., &mut values, SampleRate(10));
        assert_float_eq!(values[..], [5.; 10][..], abs_all <= 0.);
        assert_float_eq!(last, 5., abs_all <= 0.);
    }

    #[test]
    fn test_linear_ramp_is_exact() {
        let mut timeline = AudioParamTimeline::default();
        timeline.insert(set_value(0., 0.)).unwrap();
        timeline.insert(linear_ramp(1., 1.)).unwrap();

        let mut values = [0.; 10];
        timeline.values_for_time_range(0., 1., 0., &mut values, SampleRate(10));

        for (n, &v) in values.iter().enumerate() {
            assert_float_eq!(v, n as f32 / 10., ulps <= 1);
        }
    }

    #[test]
    fn test_linear_ramp_across_quanta() {
        let mut timeline = AudioParamTimeline::default();
        timeline.insert(set_value(0., 0.)).unwrap();
        timeline.insert(linear_ramp(1., 2.)).unwrap();

        let mut values = [0.; 10];
        timeline.values_for_time_range(1., 2., 0., &mut values, SampleRate(10));

        // second half of the ramp: 0.5 .. 0.95
        for (n, &v) in values.iter().enumerate() {
            assert_float_eq!(v, 0.5 + n as f32 / 20., ulps <= 2);
        }
    }

    #[test]
    fn test_exponential_ramp() {
        let mut timeline = AudioParamTimeline::default();
        timeline.insert(set_value(1., 0.)).unwrap();
        timeline.insert(exponential_ramp(2., 1.)).unwrap();

        let mut values = [0.; 10];
        timeline.values_for_time_range(0., 1., 1., &mut values, SampleRate(10));

        for (n, &v) in values.iter().enumerate() {
            assert_float_eq!(v, 2f32.powf(n as f32 / 10.), rmax <= 1e-5);
        }
    }

    #[test]
    fn test_exponential_ramp_invalid_endpoint_holds() {
        let mut timeline = AudioParamTimeline::default();
        timeline.insert(set_value(0., 0.)).unwrap();
        timeline.insert(exponential_ramp(1., 1.)).unwrap();

        let mut values = [9.; 10];
        timeline.values_for_time_range(0., 1., 0., &mut values, SampleRate(10));

        // endpoint 0 is invalid, previous value propagates
        assert_float_eq!(values[..], [0.; 10][..], abs_all <= 0.);
    }

    #[test]
    fn test_set_target_approach() {
        let mut timeline = AudioParamTimeline::default();
        timeline.insert(set_value(1., 0.)).unwrap();
        timeline.insert(set_target(0., 0., 0.5)).unwrap();

        let mut values = [0.; 10];
        let last = timeline.values_for_time_range(0., 1., 1., &mut values, SampleRate(10));

        // the discrete step makes the geometric sequence land exactly on
        // the analytic curve at sample points
        for (n, &v) in values.iter().enumerate() {
            let expected = (-(n as f64 / 10.) / 0.5).exp() as f32;
            assert_float_eq!(v, expected, rmax <= 1e-5);
        }

        // continuation across the quantum boundary is seamless when the
        // previous final value is fed back as the default
        let mut next = [0.; 10];
        timeline.values_for_time_range(1., 2., last, &mut next, SampleRate(10));
        assert_float_eq!(next[0], last, abs_all <= 0.);
        let expected = (-(1.5f64) / 0.5).exp() as f32;
        assert_float_eq!(next[5], expected, rmax <= 1e-4);
    }

    #[test]
    fn test_set_value_curve() {
        let mut timeline = AudioParamTimeline::default();
        timeline
            .insert(curve_event(vec![0., 1., 0.], 0., 1.))
            .unwrap();

        let mut values = [0.; 10];
        timeline.values_for_time_range(0., 1., 0., &mut values, SampleRate(10));

        // nearest-neighbor over a 3-point triangle stretched to 10 frames
        assert_float_eq!(values[0], 0., abs_all <= 0.);
        assert_float_eq!(values[5], 1., abs_all <= 0.);
        assert!(values[2] == 0. || values[2] == 1.);

        // after the curve's duration the last value holds
        let mut tail = [9.; 10];
        timeline.values_for_time_range(1., 2., 0., &mut tail, SampleRate(10));
        assert_float_eq!(tail[..], [0.; 10][..], abs_all <= 0.);
    }

    #[test]
    fn test_hold_after_last_event() {
        let mut timeline = AudioParamTimeline::default();
        timeline.insert(set_value(0.5, 0.05)).unwrap();

        let mut values = [0.; 10];
        let last = timeline.values_for_time_range(10., 11., 0., &mut values, SampleRate(10));
        assert_float_eq!(values[..], [0.5; 10][..], abs_all <= 0.);
        assert_float_eq!(last, 0.5, abs_all <= 0.);
    }

    #[test]
    fn test_rejects_non_finite_events() {
        let mut timeline = AudioParamTimeline::default();
        assert!(timeline.insert(set_value(f32::NAN, 0.)).is_err());
        assert!(timeline.insert(set_value(1., f64::INFINITY)).is_err());
        assert!(timeline.insert(set_value(1., -1.)).is_err());
        assert!(!timeline.has_events());
    }
}
