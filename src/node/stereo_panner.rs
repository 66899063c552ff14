use std::f32::consts::FRAC_PI_2;

use crate::buffer::{ChannelConfig, ChannelConfigOptions, ChannelCountMode, ChannelInterpretation};
use crate::bus::AudioBus;
use crate::context::{AsBaseAudioContext, AudioContextRegistration, AudioParamId};
use crate::param::{AudioParam, AudioParamOptions};
use crate::process::{AudioParamValues, AudioProcessor};
use crate::SampleRate;

use super::AudioNode;

/// Options for constructing a StereoPannerNode
pub struct StereoPannerOptions {
    pub pan: f32,
    pub channel_config: ChannelConfigOptions,
}

impl Default for StereoPannerOptions {
    fn default() -> Self {
        Self {
            pan: 0.,
            channel_config: ChannelConfigOptions {
                count: 2,
                mode: ChannelCountMode::ClampedMax,
                interpretation: ChannelInterpretation::Speakers,
            },
        }
    }
}

/// Positions an incoming mono or stereo stream in a stereo image using an
/// equal-power pan law. `pan` runs from -1 (full left) to 1 (full right).
pub struct StereoPannerNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
    pan: AudioParam,
}

impl AudioNode for StereoPannerNode {
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

impl StereoPannerNode {
    pub fn new<C: AsBaseAudioContext>(context: &C, options: StereoPannerOptions) -> Self {
        context.base().register(move |registration| {
            let param_opts = AudioParamOptions {
                min_value: -1.,
                max_value: 1.,
                default_value: 0.,
            };
            let (param, proc) = context
                .base()
                .create_audio_param(param_opts, registration.id());

            param.set_value(options.pan);

            let render = StereoPannerRenderer { pan: proc };

            let node = StereoPannerNode {
                registration,
                channel_config: options.channel_config.into(),
                pan: param,
            };

            (node, Box::new(render))
        })
    }

    pub fn pan(&self) -> &AudioParam {
        &self.pan
    }
}

struct StereoPannerRenderer {
    pan: AudioParamId,
}

impl AudioProcessor for StereoPannerRenderer {
    fn process(
        &mut self,
        inputs: &[AudioBus],
        outputs: &mut [AudioBus],
        params: AudioParamValues,
        _timestamp: f64,
        _sample_rate: SampleRate,
    ) {
        let input = &inputs[0];
        let output = &mut outputs[0];

        if input.is_silent() {
            output.set_number_of_channels(2);
            output.make_silent();
            return;
        }

        let pan_values = params.get(&self.pan);
        let stereo_input = input.number_of_channels() > 1;

        output.set_number_of_channels(2);

        // borrow output channels separately
        let (left_data, right_data) = output.channels_mut().split_at_mut(1);
        let left = left_data[0].as_mut_slice();
        let right = right_data[0].as_mut_slice();

        if stereo_input {
            let in_left = input.channel_data(0).as_slice();
            let in_right = input.channel_data(1).as_slice();

            for i in 0..left.len() {
                let pan = pan_values[i].clamp(-1., 1.);
                let x = if pan <= 0. { pan + 1. } else { pan };
                let gain_left = (x * FRAC_PI_2).cos();
                let gain_right = (x * FRAC_PI_2).sin();

                if pan <= 0. {
                    left[i] = in_left[i] + in_right[i] * gain_left;
                    right[i] = in_right[i] * gain_right;
                } else {
                    left[i] = in_left[i] * gain_left;
                    right[i] = in_right[i] + in_left[i] * gain_right;
                }
            }
        } else {
            let mono = input.channel_data(0).as_slice();

            for i in 0..left.len() {
                let pan = pan_values[i].clamp(-1., 1.);
                let x = (pan + 1.) / 2.;
                left[i] = mono[i] * (x * FRAC_PI_2).cos();
                right[i] = mono[i] * (x * FRAC_PI_2).sin();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use crate::context::{AsBaseAudioContext, OfflineAudioContext};
    use crate::node::{AudioNode, AudioScheduledSourceNode};
    use crate::SampleRate;

    #[test]
    fn test_center_pan_is_equal_power() {
        let mut context = OfflineAudioContext::new(2, 128, SampleRate(44_100));

        let source = context.create_constant_source();
        let panner = context.create_stereo_panner();

        source.connect(&panner);
        panner.connect(&context.destination());
        source.start();

        let buffer = context.start_rendering();

        let expected = std::f32::consts::FRAC_1_SQRT_2;
        assert_float_eq!(
            buffer.channel_data(0).as_slice()[64],
            expected,
            abs <= 1e-6
        );
        assert_float_eq!(
            buffer.channel_data(1).as_slice()[64],
            expected,
            abs <= 1e-6
        );
    }

    #[test]
    fn test_hard_left_pan() {
        let mut context = OfflineAudioContext::new(2, 128, SampleRate(44_100));

        let source = context.create_constant_source();
        let panner = context.create_stereo_panner();
        panner.pan().set_value_at_time(-1., 0.).unwrap();

        source.connect(&panner);
        panner.connect(&context.destination());
        source.start();

        let buffer = context.start_rendering();

        assert_float_eq!(buffer.channel_data(0).as_slice()[64], 1., abs <= 1e-6);
        assert_float_eq!(buffer.channel_data(1).as_slice()[64], 0., abs <= 1e-6);
    }
}
