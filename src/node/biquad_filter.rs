use std::f32::consts::PI;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::buffer::{ChannelConfig, ChannelConfigOptions};
use crate::bus::AudioBus;
use crate::context::{AsBaseAudioContext, AudioContextRegistration, AudioParamId};
use crate::param::{AudioParam, AudioParamOptions};
use crate::process::{AudioParamValues, AudioProcessor};
use crate::SampleRate;

use super::AudioNode;

/// Approximate ring-out time of a second order section, for silence
/// propagation.
const TAIL_TIME: f64 = 0.2;

/// The shape of the frequency response
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BiquadFilterType {
    Lowpass,
    Highpass,
    Bandpass,
    Lowshelf,
    Highshelf,
    Peaking,
    Notch,
    Allpass,
}

impl From<u32> for BiquadFilterType {
    fn from(i: u32) -> Self {
        use BiquadFilterType::*;

        match i {
            0 => Lowpass,
            1 => Highpass,
            2 => Bandpass,
            3 => Lowshelf,
            4 => Highshelf,
            5 => Peaking,
            6 => Notch,
            7 => Allpass,
            _ => unreachable!(),
        }
    }
}

/// Options for constructing a BiquadFilterNode
pub struct BiquadFilterOptions {
    pub type_: BiquadFilterType,
    pub frequency: f32,
    pub detune: f32,
    pub q: f32,
    pub gain: f32,
    pub channel_config: ChannelConfigOptions,
}

impl Default for BiquadFilterOptions {
    fn default() -> Self {
        Self {
            type_: BiquadFilterType::Lowpass,
            frequency: 350.,
            detune: 0.,
            q: 1.,
            gain: 0.,
            channel_config: ChannelConfigOptions::default(),
        }
    }
}

/// Second order IIR filter with the eight standard response shapes.
///
/// Coefficients are recomputed whenever the type or one of the parameters
/// changes; processing is direct form I per channel.
pub struct BiquadFilterNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
    type_: Arc<AtomicU32>,
    frequency: AudioParam,
    detune: AudioParam,
    q: AudioParam,
    gain: AudioParam,
}

impl AudioNode for BiquadFilterNode {
    fn registration(&self) -> &AudioContextRegistration {
        &self.registration
    }

    fn channel_config_raw(&self) -> &ChannelConfig {
        &self.channel_config
    }

    fn number_of_inputs(&self) -> u32 {
        1
    }
    fn number_of_outputs(&self) -> u32 {
        1
    }
}

impl BiquadFilterNode {
    pub fn new<C: AsBaseAudioContext>(context: &C, options: BiquadFilterOptions) -> Self {
        context.base().register(move |registration| {
            let id = registration.id();

            let (frequency, frequency_proc) = context.base().create_audio_param(
                AudioParamOptions {
                    min_value: 10.,
                    max_value: 22_500.,
                    default_value: 350.,
                },
                id,
            );
            let (detune, detune_proc) = context.base().create_audio_param(
                AudioParamOptions {
                    min_value: -4_800.,
                    max_value: 4_800.,
                    default_value: 0.,
                },
                id,
            );
            let (q, q_proc) = context.base().create_audio_param(
                AudioParamOptions {
                    min_value: 1e-4,
                    max_value: 1_000.,
                    default_value: 1.,
                },
                id,
            );
            let (gain, gain_proc) = context.base().create_audio_param(
                AudioParamOptions {
                    min_value: -40.,
                    max_value: 40.,
                    default_value: 0.,
                },
                id,
            );

            frequency.set_value(options.frequency);
            detune.set_value(options.detune);
            q.set_value(options.q);
            gain.set_value(options.gain);

            let type_ = Arc::new(AtomicU32::new(options.type_ as u32));

            let render = BiquadFilterRenderer {
                type_: type_.clone(),
                frequency: frequency_proc,
                detune: detune_proc,
                q: q_proc,
                gain: gain_proc,
                coefficients: Coefficients::passthrough(),
                last_settings: None,
                state: vec![],
            };

            let node = BiquadFilterNode {
                registration,
                channel_config: options.channel_config.into(),
                type_,
                frequency,
                detune,
                q,
                gain,
            };

            (node, Box::new(render))
        })
    }

    pub fn type_(&self) -> BiquadFilterType {
        self.type_.load(Ordering::SeqCst).into()
    }

    pub fn set_type(&self, type_: BiquadFilterType) {
        self.type_.store(type_ as u32, Ordering::SeqCst);
    }

    pub fn frequency(&self) -> &AudioParam {
        &self.frequency
    }

    pub fn detune(&self) -> &AudioParam {
        &self.detune
    }

    pub fn q(&self) -> &AudioParam {
        &self.q
    }

    pub fn gain(&self) -> &AudioParam {
        &self.gain
    }
}

/// Normalized biquad coefficients (a0 divided out)
#[derive(Copy, Clone, Debug, PartialEq)]
struct Coefficients {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl Coefficients {
    fn passthrough() -> Self {
        Self {
            b0: 1.,
            b1: 0.,
            b2: 0.,
            a1: 0.,
            a2: 0.,
        }
    }

    /// Audio-EQ-cookbook style coefficients.
    fn compute(
        type_: BiquadFilterType,
        frequency: f32,
        q: f32,
        gain_db: f32,
        sample_rate: f32,
    ) -> Self {
        use BiquadFilterType::*;

        let nyquist = sample_rate / 2.;
        let f0 = frequency.clamp(0., nyquist * 0.999);
        let q = q.max(1e-4);

        let w0 = 2. * PI * f0 / sample_rate;
        let (sin_w0, cos_w0) = (w0.sin(), w0.cos());
        let alpha = sin_w0 / (2. * q);
        // amplitude for peaking and shelving responses
        let a = 10f32.powf(gain_db / 40.);

        let (b0, b1, b2, a0, a1, a2) = match type_ {
            Lowpass => {
                let b1 = 1. - cos_w0;
                (b1 / 2., b1, b1 / 2., 1. + alpha, -2. * cos_w0, 1. - alpha)
            }
            Highpass => {
                let b1 = -(1. + cos_w0);
                (-b1 / 2., b1, -b1 / 2., 1. + alpha, -2. * cos_w0, 1. - alpha)
            }
            Bandpass => (alpha, 0., -alpha, 1. + alpha, -2. * cos_w0, 1. - alpha),
            Notch => (1., -2. * cos_w0, 1., 1. + alpha, -2. * cos_w0, 1. - alpha),
            Allpass => (
                1. - alpha,
                -2. * cos_w0,
                1. + alpha,
                1. + alpha,
                -2. * cos_w0,
                1. - alpha,
            ),
            Peaking => (
                1. + alpha * a,
                -2. * cos_w0,
                1. - alpha * a,
                1. + alpha / a,
                -2. * cos_w0,
                1. - alpha / a,
            ),
            Lowshelf => {
                let two_sqrt_a_alpha = 2. * a.sqrt() * alpha;
                (
                    a * ((a + 1.) - (a - 1.) * cos_w0 + two_sqrt_a_alpha),
                    2. * a * ((a - 1.) - (a + 1.) * cos_w0),
                    a * ((a + 1.) - (a - 1.) * cos_w0 - two_sqrt_a_alpha),
                    (a + 1.) + (a - 1.) * cos_w0 + two_sqrt_a_alpha,
                    -2. * ((a - 1.) + (a + 1.) * cos_w0),
                    (a + 1.) + (a - 1.) * cos_w0 - two_sqrt_a_alpha,
                )
            }
            Highshelf => {
                let two_sqrt_a_alpha = 2. * a.sqrt() * alpha;
                (
                    a * ((a + 1.) + (a - 1.) * cos_w0 + two_sqrt_a_alpha),
                    -2. * a * ((a - 1.) + (a + 1.) * cos_w0),
                    a * ((a + 1.) + (a - 1.) * cos_w0 - two_sqrt_a_alpha),
                    (a + 1.) - (a - 1.) * cos_w0 + two_sqrt_a_alpha,
                    2. * ((a - 1.) - (a + 1.) * cos_w0),
                    (a + 1.) - (a - 1.) * cos_w0 - two_sqrt_a_alpha,
                )
            }
        };

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }
}

/// Per-channel direct form I history
#[derive(Copy, Clone, Default)]
struct FilterState {
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

struct BiquadFilterRenderer {
    type_: Arc<AtomicU32>,
    frequency: AudioParamId,
    detune: AudioParamId,
    q: AudioParamId,
    gain: AudioParamId,
    coefficients: Coefficients,
    last_settings: Option<(u32, f32, f32, f32, f32)>,
    state: Vec<FilterState>,
}

impl AudioProcessor for BiquadFilterRenderer {
    fn process(
        &mut self,
        inputs: &[AudioBus],
        outputs: &mut [AudioBus],
        params: AudioParamValues,
        _timestamp: f64,
        sample_rate: SampleRate,
    ) {
        let input = &inputs[0];
        let output = &mut outputs[0];

        // coefficients update at control rate, once per quantum
        let type_ = self.type_.load(Ordering::SeqCst);
        let frequency = params.get(&self.frequency)[0];
        let detune = params.get(&self.detune)[0];
        let q = params.get(&self.q)[0];
        let gain = params.get(&self.gain)[0];

        let settings = (type_, frequency, detune, q, gain);
        if self.last_settings != Some(settings) {
            let computed_frequency = frequency * 2f32.powf(detune / 1_200.);
            self.coefficients = Coefficients::compute(
                type_.into(),
                computed_frequency,
                q,
                gain,
                sample_rate.0 as f32,
            );
            self.last_settings = Some(settings);
        }

        let channels = input.number_of_channels();
        if self.state.len() != channels {
            self.state = vec![FilterState::default(); channels];
        }

        output.set_number_of_channels(channels);

        let Coefficients { b0, b1, b2, a1, a2 } = self.coefficients;

        for (channel, state) in (0..channels).zip(self.state.iter_mut()) {
            let input_data = input.channel_data(channel).as_slice();
            let output_data = output.channel_data_mut(channel).as_mut_slice();

            for (out, &x) in output_data.iter_mut().zip(input_data) {
                let y = b0 * x + b1 * state.x1 + b2 * state.x2 - a1 * state.y1 - a2 * state.y2;

                state.x2 = state.x1;
                state.x1 = x;
                state.y2 = state.y1;
                state.y1 = y;

                *out = y;
            }
        }

        output.update_silence_hint();
    }

    fn reset(&mut self) {
        self.state.iter_mut().for_each(|s| *s = FilterState::default());
    }

    fn tail_time(&self) -> f64 {
        TAIL_TIME
    }
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use super::*;
    use crate::context::{AsBaseAudioContext, OfflineAudioContext};
    use crate::node::{AudioNode, AudioScheduledSourceNode};

    #[test]
    fn test_lowpass_passes_dc() {
        let mut context = OfflineAudioContext::new(1, 44_100, SampleRate(44_100));

        let source = context.create_constant_source();
        let filter = context.create_biquad_filter();
        filter.frequency().set_value(1_000.);

        source.connect(&filter);
        filter.connect(&context.destination());
        source.start();

        let buffer = context.start_rendering();

        // after the transient a lowpass passes DC with unity gain
        let last = buffer.channel_data(0).as_slice()[44_099];
        assert_float_eq!(last, 1., abs <= 1e-3);
    }

    #[test]
    fn test_highpass_blocks_dc() {
        let mut context = OfflineAudioContext::new(1, 44_100, SampleRate(44_100));

        let source = context.create_constant_source();
        let filter = context.create_biquad_filter();
        filter.set_type(BiquadFilterType::Highpass);
        filter.frequency().set_value(1_000.);

        source.connect(&filter);
        filter.connect(&context.destination());
        source.start();

        let buffer = context.start_rendering();

        let last = buffer.channel_data(0).as_slice()[44_099];
        assert_float_eq!(last, 0., abs <= 1e-3);
    }

    #[test]
    fn test_coefficients_stable_shapes() {
        // all types produce finite, normalized coefficients
        for type_ in 0..8u32 {
            let c = Coefficients::compute(type_.into(), 440., 1., 6., 44_100.);
            for v in [c.b0, c.b1, c.b2, c.a1, c.a2].iter() {
                assert!(v.is_finite());
            }
        }
    }
}
